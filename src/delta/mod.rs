use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{Mappings, ProgressState, Snapshot, Volume};

pub mod backup;
pub mod restore;

pub use backup::create_delta_block_backup;
pub use restore::{restore_delta_block_backup, restore_delta_block_backup_incrementally};

pub const PROGRESS_COMPLETE: i32 = 100;

/// Snapshot IO and progress reporting supplied by the caller. The core
/// never reads volumes directly; everything flows through this capability.
/// Implementations are shared across calls and must be safe for concurrent
/// use by pipeline workers.
#[async_trait]
pub trait DeltaOps: Send + Sync {
    async fn has_snapshot(&self, id: &str, volume_id: &str) -> bool;

    /// Regions that differ between `id` and `compare_id`, or every
    /// non-empty region when there is no baseline.
    async fn compare_snapshot(
        &self,
        id: &str,
        compare_id: Option<&str>,
        volume_id: &str,
    ) -> Result<Mappings>;

    async fn open_snapshot(&self, id: &str, volume_id: &str) -> Result<()>;
    async fn read_snapshot(
        &self,
        id: &str,
        volume_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>>;
    async fn close_snapshot(&self, id: &str, volume_id: &str) -> Result<()>;

    async fn open_volume_dev(&self, vol_dev_name: &str) -> Result<std::fs::File>;
    async fn close_volume_dev(&self, vol_dev: std::fs::File) -> Result<()>;

    async fn update_backup_status(
        &self,
        snapshot_id: &str,
        volume_id: &str,
        state: ProgressState,
        progress: i32,
        backup_url: &str,
        error: &str,
    ) -> Result<()>;

    async fn update_restore_status(
        &self,
        vol_dev_name: &str,
        progress: i32,
        error: &str,
    ) -> Result<()>;

    /// Caller-driven stop signal; cancelling aborts the running pipeline
    /// between blocks. Nothing is published for a canceled backup.
    fn stop_token(&self) -> CancellationToken;
}

pub struct DeltaBackupConfig {
    /// Empty means the engine generates one.
    pub backup_name: String,
    pub volume: Volume,
    pub snapshot: Snapshot,
    pub dest_url: String,
    pub delta_ops: Arc<dyn DeltaOps>,
    pub labels: BTreeMap<String, String>,
    pub concurrent_limit: u32,
}

pub struct DeltaRestoreConfig {
    pub backup_url: String,
    pub delta_ops: Arc<dyn DeltaOps>,
    /// Baseline for incremental restore; unused by full restore.
    pub last_backup_name: String,
    pub filename: String,
    pub concurrent_limit: u32,
}
