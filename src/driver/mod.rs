use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::warn;

use crate::error;

pub mod vfs;

/// The narrow object-store capability the core consumes. Listing is
/// eventually consistent; `write` must be atomic for published artifacts
/// (the final object is either fully visible or absent).
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> &str;
    fn url(&self) -> &str;

    /// Immediate children of `path`, names only.
    async fn list(&self, path: &str) -> Result<Vec<String>>;
    async fn file_exists(&self, path: &str) -> bool;
    async fn file_size(&self, path: &str) -> Result<u64>;
    async fn file_time(&self, path: &str) -> Result<DateTime<Utc>>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    /// Idempotent: removing an absent object succeeds.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Bulk shortcuts; backends with native transfer support override them.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("failed to read local file {}", local.display()))?;
        self.write(remote, &data).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let data = self.read(remote).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        tokio::fs::write(local, data)
            .await
            .with_context(|| format!("failed to write local file {}", local.display()))
    }
}

pub type DriverFactory = fn(&str) -> Result<Arc<dyn Driver>>;

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, DriverFactory>> = RwLock::new(HashMap::new());
}

/// Register a backend for a URL scheme. Registration is idempotent;
/// re-registering a scheme with a different factory is a configuration bug.
pub fn register_driver(kind: &str, factory: DriverFactory) -> Result<()> {
    let mut registry = REGISTRY.write();
    if let Some(existing) = registry.get(kind) {
        if *existing != factory {
            bail!("BUG: driver scheme {kind} is already registered with a different factory");
        }
        return Ok(());
    }
    registry.insert(kind.to_string(), factory);
    Ok(())
}

/// Dispatch a destination URL to its registered driver.
pub fn get_driver(dest_url: &str) -> Result<Arc<dyn Driver>> {
    let Some((scheme, _)) = dest_url.split_once("://") else {
        bail!("invalid destination URL {dest_url}");
    };
    let factory = {
        let registry = REGISTRY.read();
        registry.get(scheme).copied()
    };
    let Some(factory) = factory else {
        bail!("no driver registered for scheme {scheme} ({dest_url})");
    };
    factory(dest_url)
}

/// Run an object-store operation, retrying transient failures on the
/// configured backoff schedule. Typed failures are final and returned as-is.
pub(crate) async fn with_backoff<T, F, Fut>(backoff_secs: &[u64], mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < backoff_secs.len() && error::is_transient(&err) => {
                warn!(
                    error = %err,
                    attempt = attempt + 1,
                    delay_secs = backoff_secs[attempt],
                    "transient store failure, backing off"
                );
                tokio::time::sleep(Duration::from_secs(backoff_secs[attempt])).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_factory(_dest_url: &str) -> Result<Arc<dyn Driver>> {
        bail!("factory for tests only")
    }

    fn other_factory(_dest_url: &str) -> Result<Arc<dyn Driver>> {
        bail!("another factory for tests only")
    }

    #[test]
    fn registration_is_idempotent_for_the_same_factory() {
        register_driver("test-dup", failing_factory).expect("first registration");
        register_driver("test-dup", failing_factory).expect("same factory again");
        assert!(register_driver("test-dup", other_factory).is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(get_driver("bogus://somewhere").is_err());
        assert!(get_driver("not-a-url").is_err());
    }

    #[tokio::test]
    async fn backoff_retries_transient_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_backoff(&[0, 0], || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    bail!("flaky")
                }
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("should recover"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_does_not_retry_typed_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32> = with_backoff(&[0, 0], || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::NotFound("object".to_string()).into()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
