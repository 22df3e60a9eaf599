use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::driver::{register_driver, Driver};
use crate::error::StoreError;

pub const KIND: &str = "file";

/// Local-filesystem backend for `file://` destinations. Remote backends
/// (s3, azblob, nfs, cifs, gs) are provided by the embedder and registered
/// against their own schemes.
pub struct VfsDriver {
    dest_url: String,
    root: PathBuf,
}

pub fn register() -> Result<()> {
    register_driver(KIND, new_driver)
}

fn new_driver(dest_url: &str) -> Result<Arc<dyn Driver>> {
    let parsed = Url::parse(dest_url)
        .with_context(|| format!("failed to parse destination URL {dest_url}"))?;
    if parsed.scheme() != KIND {
        bail!(
            "BUG: cannot dispatch {} URL to the {KIND} driver",
            parsed.scheme()
        );
    }
    if let Some(host) = parsed.host_str() {
        if !host.is_empty() {
            bail!("file URL must not carry a host, got {host}");
        }
    }

    let root = PathBuf::from(parsed.path());
    let meta = std::fs::metadata(&root)
        .with_context(|| format!("destination path {} is not accessible", root.display()))?;
    if !meta.is_dir() {
        bail!("destination path {} is not a directory", root.display());
    }

    let driver = VfsDriver {
        dest_url: format!("{KIND}://{}", root.display()),
        root,
    };
    debug!(url = %driver.dest_url, "loaded local filesystem driver");
    Ok(Arc::new(driver))
}

impl VfsDriver {
    fn local(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Driver for VfsDriver {
    fn kind(&self) -> &str {
        KIND
    }

    fn url(&self) -> &str {
        &self.dest_url
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.local(path);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("directory {path}")).into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list directory {}", dir.display()));
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to read directory {}", dir.display()))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn file_exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.local(path)).await.is_ok()
    }

    async fn file_size(&self, path: &str) -> Result<u64> {
        match tokio::fs::metadata(self.local(path)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("object {path}")).into())
            }
            Err(err) => Err(err).with_context(|| format!("failed to stat {path}")),
        }
    }

    async fn file_time(&self, path: &str) -> Result<DateTime<Utc>> {
        let meta = match tokio::fs::metadata(self.local(path)).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("object {path}")).into());
            }
            Err(err) => return Err(err).with_context(|| format!("failed to stat {path}")),
        };
        let modified = meta
            .modified()
            .with_context(|| format!("failed to read modification time of {path}"))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.local(path)).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("object {path}")).into())
            }
            Err(err) => Err(err).with_context(|| format!("failed to read {path}")),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.local(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        // Unique temp name per writer: concurrent uploads of the same
        // content-addressed object must not clobber each other mid-write.
        let suffix = Uuid::new_v4().simple().to_string();
        let tmp = full.with_extension(format!("tmp-{}", &suffix[..8]));
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err)
                .with_context(|| format!("failed to publish {} atomically", full.display()));
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.local(path);
        let meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).with_context(|| format!("failed to stat {path}")),
        };

        let removal = if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        match removal {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {path}")),
        }
    }
}
