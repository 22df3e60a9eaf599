use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::driver::get_driver;
use crate::error::{self, StoreError};
use crate::lock::{FileLock, LockKind};
use crate::manifest::ManifestStore;
use crate::types::{
    block_path, blocks_path, decode_backup_url, ensure_valid_name, Backup,
};

/// Delete one backup and garbage-collect the blocks only it referenced.
/// Runs under the exclusive delete lock; the manifest is removed before any
/// block so readers never observe a published backup with missing blocks.
pub async fn delete_delta_block_backup(backup_url: &str) -> Result<()> {
    let (backup_name, volume_name, dest_url) = decode_backup_url(backup_url)?;
    if backup_name.is_empty() {
        bail!("missing backup name in URL {backup_url}");
    }

    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(&dest_url)?;
    let store = ManifestStore::new(Arc::clone(&driver), store_config.clone());

    let mut lock = FileLock::new(
        Arc::clone(&driver),
        &volume_name,
        LockKind::Delete,
        store_config,
    );
    lock.acquire().await?;
    let result = perform_delete(&store, &backup_name, &volume_name).await;
    if let Err(err) = lock.release().await {
        warn!(volume = %volume_name, error = %err, "failed to release delete lock");
    }
    result
}

async fn perform_delete(
    store: &ManifestStore,
    backup_name: &str,
    volume_name: &str,
) -> Result<()> {
    let target = match store.load_backup(backup_name, volume_name).await {
        Ok(backup) => Some(backup),
        Err(err) if error::is_not_found(&err) => {
            warn!(
                volume = %volume_name,
                backup = %backup_name,
                "backup manifest already absent, delete is a no-op"
            );
            None
        }
        Err(err) => return Err(err),
    };
    store.remove_backup(backup_name, volume_name).await?;
    let Some(target) = target else {
        return Ok(());
    };

    let doomed: HashSet<String> = target
        .blocks
        .into_iter()
        .map(|mapping| mapping.block_checksum)
        .collect();
    // the target manifest is gone, so this is the union over survivors
    let live = store.referenced_checksums(volume_name).await?;

    let mut removed = 0_usize;
    let mut failures = Vec::new();
    for checksum in doomed.difference(&live) {
        match store
            .driver()
            .remove(&block_path(volume_name, checksum))
            .await
        {
            Ok(()) => removed += 1,
            Err(err) => failures.push(format!("block {checksum}: {err:#}")),
        }
    }
    info!(
        volume = %volume_name,
        backup = %backup_name,
        removed,
        retained = live.len(),
        "pruned unreferenced blocks"
    );

    let remaining = store.backup_names(volume_name).await?;
    if remaining.is_empty() {
        if let Err(err) = store.driver().remove(&blocks_path(volume_name)).await {
            warn!(volume = %volume_name, error = %err, "failed to remove empty block directory");
        }
        if let Err(err) = store.remove_volume_config(volume_name).await {
            warn!(volume = %volume_name, error = %err, "failed to remove volume config");
        }
    } else if let Err(err) =
        refresh_volume_hints(store, volume_name, &remaining, live.len() as u64).await
    {
        warn!(volume = %volume_name, error = %err, "failed to refresh volume hints after delete");
    }

    if !failures.is_empty() {
        return Err(StoreError::Aggregated { errors: failures }.into());
    }
    Ok(())
}

/// `last_backup_name`/`last_backup_at`/`block_count` are UI hints, so a
/// failure here is logged rather than failing the delete.
async fn refresh_volume_hints(
    store: &ManifestStore,
    volume_name: &str,
    remaining: &[String],
    block_count: u64,
) -> Result<()> {
    let mut volume = store.load_volume(volume_name).await?;

    let mut newest: Option<Backup> = None;
    for name in remaining {
        match store.load_backup(name, volume_name).await {
            Ok(backup) => {
                let is_newer = newest
                    .as_ref()
                    .map(|current| backup.created_time > current.created_time)
                    .unwrap_or(true);
                if is_newer {
                    newest = Some(backup);
                }
            }
            Err(err) if error::is_not_found(&err) => continue,
            Err(err) => return Err(err),
        }
    }

    match newest {
        Some(backup) => {
            volume.last_backup_name = backup.name;
            volume.last_backup_at = backup.created_time;
        }
        None => {
            volume.last_backup_name = String::new();
            volume.last_backup_at = String::new();
        }
    }
    volume.block_count = block_count;
    store.save_volume(&volume).await
}

/// Remove every backup, block, config and lock for a volume.
pub async fn delete_backup_volume(volume_name: &str, dest_url: &str) -> Result<()> {
    ensure_valid_name(volume_name)?;
    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(dest_url)?;
    let store = ManifestStore::new(Arc::clone(&driver), store_config.clone());

    let mut lock = FileLock::new(
        Arc::clone(&driver),
        volume_name,
        LockKind::Delete,
        store_config,
    );
    lock.acquire().await?;
    let result = store.remove_volume_tree(volume_name).await;
    // our own lock file went down with the tree; release stays idempotent
    if let Err(err) = lock.release().await {
        warn!(volume = %volume_name, error = %err, "failed to release delete lock");
    }
    if result.is_ok() {
        info!(volume = %volume_name, "backup volume removed");
    }
    result
}
