//! In-process backend

use super::{BackendError, RawBackend, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Keeps objects in a sorted map keyed by `keypath/name`
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

fn prefix_of(keypath: &[String]) -> String {
    if keypath.is_empty() {
        String::new()
    } else {
        format!("{}/", keypath.join("/"))
    }
}

fn key_of(name: &str, keypath: &[String]) -> String {
    format!("{}{}", prefix_of(keypath), name)
}

#[async_trait]
impl RawBackend for MemoryBackend {
    async fn list(&self, keypath: &[String]) -> Result<Vec<String>> {
        let prefix = prefix_of(keypath);
        let objects = self.objects.read();
        let names: BTreeSet<String> = objects
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().map(str::to_string))
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn read(&self, name: &str, keypath: &[String]) -> Result<Bytes> {
        let key = key_of(name, keypath);
        self.objects
            .read()
            .get(&key)
            .cloned()
            .ok_or(BackendError::NotFound(key))
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        let object = self.read(name, keypath).await?;
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        if end > object.len() {
            return Err(BackendError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "range {}..{} outside object of {} bytes",
                    start,
                    end,
                    object.len()
                ),
            )));
        }
        Ok(object.slice(start..end))
    }

    async fn write(&self, name: &str, keypath: &[String], data: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.objects.write().insert(key_of(name, keypath), data);
        Ok(())
    }

    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()> {
        self.objects.write().remove(&key_of(name, keypath));
        Ok(())
    }
}
