//! Kura
//!
//! Tenant-scoped trace block storage. Trace objects are appended to a
//! write-ahead head block, cut into immutable blocks and flushed to object
//! storage together with a sharded bloom filter, a sorted index and a meta
//! file. Lookups check live blocks first, then backend blocks (bloom, index,
//! one ranged data read). A compactor merges small blocks and applies
//! retention.
//!
//! # Example
//!
//! ```no_run
//! use kura::{app::App, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let app = App::build(config).await?;
//!     app.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod backend;
pub mod block;
pub mod compactor;
pub mod config;
pub mod encoding;
pub mod ingester;
pub mod logging;
pub mod metrics;
pub mod querier;
pub mod router;
pub mod search;
pub mod server;
pub mod store;
pub mod util;

// Re-export commonly used types
pub use app::App;
pub use config::Config;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
