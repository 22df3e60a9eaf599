//! Incremental, content-addressed, deduplicating block-level backup and
//! restore of volume snapshots against an object store.
//!
//! Snapshots are stored as JSON manifests referencing fixed-size blocks in
//! a shared per-volume pool, addressed by truncated SHA-512 of their raw
//! content. Subsequent backups of the same volume upload only new or
//! changed blocks. Object-store backends plug in through the [`Driver`]
//! capability; snapshot IO and progress reporting come from the caller
//! through [`DeltaOps`].

pub mod blocks;
pub mod config;
pub mod data;
pub mod delta;
pub mod driver;
pub mod error;
pub mod gc;
pub mod list;
pub mod lock;
pub mod manifest;
pub mod types;

pub use config::StoreConfig;
pub use delta::{
    create_delta_block_backup, restore_delta_block_backup,
    restore_delta_block_backup_incrementally, DeltaBackupConfig, DeltaOps, DeltaRestoreConfig,
};
pub use driver::{get_driver, register_driver, Driver, DriverFactory};
pub use error::StoreError;
pub use gc::{delete_backup_volume, delete_delta_block_backup};
pub use list::{inspect_backup, inspect_volume, list, BackupInfo, VolumeInfo};
pub use types::{
    decode_backup_url, encode_backup_url, Backup, BlockMapping, CompressionMethod, Mapping,
    Mappings, ProgressState, Snapshot, Volume, DEFAULT_BLOCK_SIZE,
};
