//! Local filesystem backend

use super::{BackendError, RawBackend, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Stores objects as files under a root directory
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, keypath: &[String]) -> PathBuf {
        keypath.iter().fold(self.root.clone(), |p, part| p.join(part))
    }

    fn path(&self, name: &str, keypath: &[String]) -> PathBuf {
        self.dir(keypath).join(name)
    }
}

fn not_found(path: &Path, e: std::io::Error) -> BackendError {
    if e.kind() == ErrorKind::NotFound {
        BackendError::NotFound(path.display().to_string())
    } else {
        BackendError::IoError(e)
    }
}

#[async_trait]
impl RawBackend for LocalBackend {
    async fn list(&self, keypath: &[String]) -> Result<Vec<String>> {
        let dir = self.dir(keypath);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str, keypath: &[String]) -> Result<Bytes> {
        let path = self.path(name, keypath);
        let data = fs::read(&path).await.map_err(|e| not_found(&path, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        let path = self.path(name, keypath);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| not_found(&path, e))?;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, name: &str, keypath: &[String], data: Bytes) -> Result<()> {
        let dir = self.dir(keypath);
        fs::create_dir_all(&dir).await?;

        // rename into place so readers never see a partial object
        let tmp = dir.join(format!(".{}.{}", name, uuid::Uuid::new_v4()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, dir.join(name)).await?;
        Ok(())
    }

    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()> {
        let path = self.path(name, keypath);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // drop the block directory once its last object is gone
        if !keypath.is_empty() {
            let _ = fs::remove_dir(self.dir(keypath)).await;
        }
        Ok(())
    }
}
