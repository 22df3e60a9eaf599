use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::data::compress::{compress_block, decode_and_verify};
use crate::driver::{with_backoff, Driver};
use crate::types::{block_path, CompressionMethod};

/// Content-addressed block IO for one volume. Blocks live at a path derived
/// from their uncompressed checksum, so concurrent writers of the same
/// block are harmless: last writer wins with byte-identical content.
pub struct BlockStore {
    driver: Arc<dyn Driver>,
    volume_name: String,
    method: CompressionMethod,
    config: StoreConfig,
}

impl BlockStore {
    pub fn new(
        driver: Arc<dyn Driver>,
        volume_name: &str,
        method: CompressionMethod,
        config: StoreConfig,
    ) -> Self {
        Self {
            driver,
            volume_name: volume_name.to_string(),
            method,
            config,
        }
    }

    /// Upload one raw block, skipping the transfer when an object of the
    /// expected encoded size is already present. Returns whether bytes were
    /// actually written.
    ///
    /// The size check matters: a present-but-truncated object (crashed
    /// writer, bit rot) must be replaced, not trusted.
    pub async fn upload_block(&self, checksum: &str, raw: &[u8]) -> Result<bool> {
        let payload = compress_block(self.method, raw)?;
        let path = block_path(&self.volume_name, checksum);

        if self.driver.file_exists(&path).await {
            match self.driver.file_size(&path).await {
                Ok(size) if size == payload.len() as u64 => {
                    debug!(block = checksum, "block already present, skipping upload");
                    return Ok(false);
                }
                Ok(size) => {
                    warn!(
                        block = checksum,
                        found = size,
                        expected = payload.len(),
                        "existing block has unexpected size, re-uploading"
                    );
                }
                Err(err) => {
                    warn!(block = checksum, error = %err, "failed to stat existing block, re-uploading");
                }
            }
        }

        self.driver
            .write(&path, &payload)
            .await
            .with_context(|| format!("failed to upload block {checksum}"))?;
        Ok(true)
    }

    pub async fn block_exists(&self, checksum: &str) -> bool {
        self.driver
            .file_exists(&block_path(&self.volume_name, checksum))
            .await
    }

    /// Fetch, decode and verify one block. Transient read failures are
    /// retried on the configured backoff schedule.
    pub async fn download_block(&self, checksum: &str) -> Result<Vec<u8>> {
        let path = block_path(&self.volume_name, checksum);
        let payload = with_backoff(&self.config.read_retry_backoff_secs, || {
            let driver = Arc::clone(&self.driver);
            let path = path.clone();
            async move { driver.read(&path).await }
        })
        .await
        .with_context(|| format!("failed to read block {checksum}"))?;

        decode_and_verify(self.method, &payload, checksum)
    }
}
