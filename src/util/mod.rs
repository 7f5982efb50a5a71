//! Small shared utilities

pub mod bounded_wait_group;

pub use bounded_wait_group::{BoundedWaitGroup, WaitGroupGuard};

/// Current unix time in seconds
pub fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}
