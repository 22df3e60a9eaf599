use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocks::BlockStore;
use crate::config::StoreConfig;
use crate::data::hash;
use crate::delta::{DeltaBackupConfig, DeltaOps, PROGRESS_COMPLETE};
use crate::driver::get_driver;
use crate::error::{self, StoreError};
use crate::lock::{FileLock, LockKind};
use crate::manifest::ManifestStore;
use crate::types::{
    encode_backup_url, ensure_valid_name, generate_name, now, Backup, BlockMapping, Mappings,
    ProgressState, Volume, DEFAULT_BLOCK_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockJob {
    offset: u64,
    size: u64,
}

/// Back up one snapshot of a volume as a manifest of content-addressed
/// blocks, transferring only blocks the store does not already hold.
/// Returns the published backup URL; progress and the terminal state are
/// also reported through the `DeltaOps` callbacks.
pub async fn create_delta_block_backup(config: &DeltaBackupConfig) -> Result<String> {
    ensure_valid_name(&config.volume.name)?;
    ensure_valid_name(&config.snapshot.name)?;
    let backup_name = if config.backup_name.is_empty() {
        generate_name("backup")
    } else {
        ensure_valid_name(&config.backup_name)?;
        config.backup_name.clone()
    };

    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(&config.dest_url)?;
    let store = ManifestStore::new(Arc::clone(&driver), store_config.clone());

    let mut lock = FileLock::new(
        Arc::clone(&driver),
        &config.volume.name,
        LockKind::Backup,
        store_config.clone(),
    );
    lock.acquire().await?;
    let result = perform_backup(&store, &store_config, config, &backup_name).await;
    if let Err(err) = lock.release().await {
        warn!(volume = %config.volume.name, error = %err, "failed to release backup lock");
    }

    match result {
        Ok(backup_url) => {
            if let Err(err) = config
                .delta_ops
                .update_backup_status(
                    &config.snapshot.name,
                    &config.volume.name,
                    ProgressState::Complete,
                    PROGRESS_COMPLETE,
                    &backup_url,
                    "",
                )
                .await
            {
                warn!(error = %err, "failed to report backup completion");
            }
            info!(
                volume = %config.volume.name,
                snapshot = %config.snapshot.name,
                backup = %backup_name,
                "backup complete"
            );
            Ok(backup_url)
        }
        Err(err) => {
            let message = format!("{err:#}");
            let _ = config
                .delta_ops
                .update_backup_status(
                    &config.snapshot.name,
                    &config.volume.name,
                    ProgressState::Error,
                    0,
                    "",
                    &message,
                )
                .await;
            Err(err)
        }
    }
}

async fn perform_backup(
    store: &ManifestStore,
    store_config: &StoreConfig,
    config: &DeltaBackupConfig,
    backup_name: &str,
) -> Result<String> {
    let delta_ops = &config.delta_ops;
    let volume_name = config.volume.name.clone();
    let snapshot_name = config.snapshot.name.clone();

    if !delta_ops.has_snapshot(&snapshot_name, &volume_name).await {
        bail!("snapshot {snapshot_name} of volume {volume_name} does not exist");
    }

    let mut volume = reconcile_volume(store, &config.volume).await?;
    let block_size = volume.effective_block_size();

    let last_backup = find_last_backup(store, delta_ops.as_ref(), &volume).await;
    let compare_name = last_backup.as_ref().map(|backup| backup.snapshot_name.clone());

    let mappings = delta_ops
        .compare_snapshot(&snapshot_name, compare_name.as_deref(), &volume_name)
        .await
        .context("failed to compute snapshot delta")?;
    if mappings.block_size != block_size {
        return Err(StoreError::ConfigConflict {
            volume: volume_name.clone(),
            detail: format!(
                "snapshot delta uses block size {}, volume uses {block_size}",
                mappings.block_size
            ),
        }
        .into());
    }

    let jobs = split_mappings(&mappings, block_size, volume.size);
    let changed_offsets: HashSet<u64> = jobs.iter().map(|job| job.offset).collect();

    delta_ops
        .open_snapshot(&snapshot_name, &volume_name)
        .await
        .context("failed to open snapshot")?;
    let outcome = run_block_pipeline(store, store_config, config, &volume, jobs).await;
    if let Err(err) = delta_ops.close_snapshot(&snapshot_name, &volume_name).await {
        warn!(snapshot = %snapshot_name, error = %err, "failed to close snapshot");
    }
    let delta_blocks = outcome?;

    let blocks = merge_block_lists(
        last_backup.as_ref(),
        &changed_offsets,
        delta_blocks,
        volume.size,
    );

    let backup = Backup {
        name: backup_name.to_string(),
        volume_name: volume.name.clone(),
        snapshot_name: snapshot_name.clone(),
        snapshot_created_at: config.snapshot.created_time.clone(),
        created_time: now(),
        size: blocks.len() as u64 * block_size,
        labels: config.labels.clone(),
        is_incremental: last_backup.is_some(),
        compression_method: volume.compression_method,
        blocks,
    };
    // publication happens-after every block upload: the pipeline has
    // already drained successfully by this point
    store.save_backup(&backup).await?;

    volume.last_backup_name = backup.name.clone();
    volume.last_backup_at = backup.created_time.clone();
    volume.block_count = store.referenced_checksums(&volume.name).await?.len() as u64;
    store.save_volume(&volume).await?;

    Ok(encode_backup_url(&backup.name, &volume.name, &config.dest_url))
}

/// Load the volume config, or create it on the first backup. Settings that
/// shape the block pool are immutable once recorded.
async fn reconcile_volume(store: &ManifestStore, requested: &Volume) -> Result<Volume> {
    match store.load_volume(&requested.name).await {
        Ok(existing) => {
            if existing.size != requested.size {
                return Err(StoreError::ConfigConflict {
                    volume: requested.name.clone(),
                    detail: format!(
                        "volume size is {} in the store, caller requested {}",
                        existing.size, requested.size
                    ),
                }
                .into());
            }
            if existing.compression_method != requested.compression_method {
                return Err(StoreError::ConfigConflict {
                    volume: requested.name.clone(),
                    detail: format!(
                        "compression method is {} in the store, caller requested {}",
                        existing.compression_method, requested.compression_method
                    ),
                }
                .into());
            }
            if existing.effective_block_size() != requested.effective_block_size() {
                return Err(StoreError::ConfigConflict {
                    volume: requested.name.clone(),
                    detail: format!(
                        "block size is {} in the store, caller requested {}",
                        existing.effective_block_size(),
                        requested.effective_block_size()
                    ),
                }
                .into());
            }
            Ok(existing)
        }
        Err(err) if error::is_not_found(&err) => {
            let mut fresh = requested.clone();
            if fresh.block_size == 0 {
                fresh.block_size = DEFAULT_BLOCK_SIZE;
            }
            if fresh.created_time.is_empty() {
                fresh.created_time = now();
            }
            store.save_volume(&fresh).await?;
            Ok(fresh)
        }
        Err(err) => Err(err),
    }
}

/// The previous newest backup, if it is still usable as a delta baseline.
async fn find_last_backup(
    store: &ManifestStore,
    delta_ops: &dyn DeltaOps,
    volume: &Volume,
) -> Option<Backup> {
    if volume.last_backup_name.is_empty() {
        return None;
    }
    match store.load_backup(&volume.last_backup_name, &volume.name).await {
        Ok(last) => {
            if delta_ops.has_snapshot(&last.snapshot_name, &volume.name).await {
                Some(last)
            } else {
                info!(
                    volume = %volume.name,
                    backup = %last.name,
                    snapshot = %last.snapshot_name,
                    "baseline snapshot is gone, taking a full backup"
                );
                None
            }
        }
        Err(err) => {
            warn!(
                volume = %volume.name,
                backup = %volume.last_backup_name,
                error = %err,
                "cannot load previous backup, taking a full backup"
            );
            None
        }
    }
}

/// Split delta regions into aligned block-sized jobs, clamped to the
/// volume end so the trailing partial block reads short.
fn split_mappings(mappings: &Mappings, block_size: u64, volume_size: u64) -> Vec<BlockJob> {
    let mut jobs = Vec::new();
    let mut seen = HashSet::new();
    for mapping in &mappings.mappings {
        let mut offset = mapping.offset / block_size * block_size;
        let end = (mapping.offset + mapping.size).min(volume_size);
        while offset < end {
            let size = block_size.min(volume_size - offset);
            if seen.insert(offset) {
                jobs.push(BlockJob { offset, size });
            }
            offset += block_size;
        }
    }
    jobs
}

/// The published block list covers every non-empty block of the snapshot:
/// untouched entries are carried over from the previous backup, changed
/// offsets are replaced by the freshly produced entries (or dropped when
/// the block became empty).
fn merge_block_lists(
    last_backup: Option<&Backup>,
    changed_offsets: &HashSet<u64>,
    delta_blocks: Vec<BlockMapping>,
    volume_size: u64,
) -> Vec<BlockMapping> {
    let mut merged: BTreeMap<u64, BlockMapping> = BTreeMap::new();
    if let Some(last) = last_backup {
        for mapping in &last.blocks {
            if mapping.offset < volume_size && !changed_offsets.contains(&mapping.offset) {
                merged.insert(mapping.offset, mapping.clone());
            }
        }
    }
    for mapping in delta_blocks {
        merged.insert(mapping.offset, mapping);
    }
    merged.into_values().collect()
}

struct BackupPipeline {
    delta_ops: Arc<dyn DeltaOps>,
    block_store: BlockStore,
    volume_name: String,
    snapshot_name: String,
    queue: Mutex<VecDeque<BlockJob>>,
    produced: Mutex<Vec<BlockMapping>>,
    in_flight: Mutex<HashSet<String>>,
    processed: AtomicU64,
    total: u64,
}

impl BackupPipeline {
    async fn run_worker(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Canceled.into());
            }
            let job = { self.queue.lock().pop_front() };
            let Some(job) = job else {
                return Ok(());
            };
            self.process_block(&job).await?;
            self.report_progress().await;
        }
    }

    async fn process_block(&self, job: &BlockJob) -> Result<()> {
        let data = self
            .delta_ops
            .read_snapshot(&self.snapshot_name, &self.volume_name, job.offset, job.size)
            .await
            .with_context(|| format!("failed to read snapshot at offset {}", job.offset))?;
        if data.len() as u64 != job.size {
            bail!(
                "short snapshot read at offset {}: expected {}, got {}",
                job.offset,
                job.size,
                data.len()
            );
        }

        if data.iter().all(|byte| *byte == 0) {
            debug!(offset = job.offset, "skipping empty block");
            return Ok(());
        }

        let checksum = hash::checksum(&data);
        let first_appearance = { self.in_flight.lock().insert(checksum.clone()) };
        if first_appearance {
            self.block_store.upload_block(&checksum, &data).await?;
        }
        self.produced.lock().push(BlockMapping {
            offset: job.offset,
            block_checksum: checksum,
        });
        Ok(())
    }

    async fn report_progress(&self) {
        let done = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let progress = (done * 100 / self.total) as i32;
        if let Err(err) = self
            .delta_ops
            .update_backup_status(
                &self.snapshot_name,
                &self.volume_name,
                ProgressState::InProgress,
                progress,
                "",
                "",
            )
            .await
        {
            warn!(error = %err, "failed to report backup progress");
        }
    }
}

async fn run_block_pipeline(
    store: &ManifestStore,
    store_config: &StoreConfig,
    config: &DeltaBackupConfig,
    volume: &Volume,
    jobs: Vec<BlockJob>,
) -> Result<Vec<BlockMapping>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let total = jobs.len() as u64;
    let worker_count = store_config.clamp_concurrency(config.concurrent_limit).min(jobs.len());
    let cancel = config.delta_ops.stop_token().child_token();

    let pipeline = Arc::new(BackupPipeline {
        delta_ops: Arc::clone(&config.delta_ops),
        block_store: BlockStore::new(
            Arc::clone(store.driver()),
            &volume.name,
            volume.compression_method,
            store_config.clone(),
        ),
        volume_name: volume.name.clone(),
        snapshot_name: config.snapshot.name.clone(),
        queue: Mutex::new(VecDeque::from(jobs)),
        produced: Mutex::new(Vec::new()),
        in_flight: Mutex::new(HashSet::new()),
        processed: AtomicU64::new(0),
        total,
    });

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let pipeline = Arc::clone(&pipeline);
        let worker_cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            let result = pipeline.run_worker(worker_cancel.clone()).await;
            if result.is_err() {
                // first failure drains the remaining workers
                worker_cancel.cancel();
            }
            result
        }));
    }

    let mut first_error: Option<anyhow::Error> = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    debug!(error = %err, "dropping subsequent pipeline error");
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(anyhow!("backup worker panicked: {join_err}"));
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let pipeline =
        Arc::try_unwrap(pipeline).map_err(|_| anyhow!("BUG: backup pipeline still shared"))?;
    Ok(pipeline.produced.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mapping;

    const BS: u64 = DEFAULT_BLOCK_SIZE;

    #[test]
    fn split_aligns_and_clamps_jobs() {
        let mappings = Mappings {
            mappings: vec![
                Mapping { offset: 0, size: 2 * BS },
                Mapping { offset: 5 * BS, size: BS },
            ],
            block_size: BS,
        };
        // volume ends half way through the last mapped block
        let jobs = split_mappings(&mappings, BS, 5 * BS + BS / 2);
        assert_eq!(
            jobs,
            vec![
                BlockJob { offset: 0, size: BS },
                BlockJob { offset: BS, size: BS },
                BlockJob { offset: 5 * BS, size: BS / 2 },
            ]
        );
    }

    #[test]
    fn split_deduplicates_overlapping_regions() {
        let mappings = Mappings {
            mappings: vec![
                Mapping { offset: 0, size: BS },
                Mapping { offset: BS / 2, size: BS },
            ],
            block_size: BS,
        };
        let jobs = split_mappings(&mappings, BS, 4 * BS);
        assert_eq!(
            jobs,
            vec![
                BlockJob { offset: 0, size: BS },
                BlockJob { offset: BS, size: BS },
            ]
        );
    }

    #[test]
    fn merge_carries_unchanged_and_replaces_changed() {
        let previous = Backup {
            blocks: vec![
                BlockMapping { offset: 0, block_checksum: "aa".into() },
                BlockMapping { offset: BS, block_checksum: "bb".into() },
                BlockMapping { offset: 2 * BS, block_checksum: "cc".into() },
            ],
            ..Default::default()
        };
        let changed: HashSet<u64> = [BS, 2 * BS].into_iter().collect();
        // offset BS changed content, offset 2*BS became empty
        let delta = vec![BlockMapping { offset: BS, block_checksum: "b2".into() }];

        let merged = merge_block_lists(Some(&previous), &changed, delta, 4 * BS);
        assert_eq!(
            merged,
            vec![
                BlockMapping { offset: 0, block_checksum: "aa".into() },
                BlockMapping { offset: BS, block_checksum: "b2".into() },
            ]
        );
    }

    #[test]
    fn merge_without_baseline_keeps_delta_sorted() {
        let delta = vec![
            BlockMapping { offset: 2 * BS, block_checksum: "cc".into() },
            BlockMapping { offset: 0, block_checksum: "aa".into() },
        ];
        let merged = merge_block_lists(None, &HashSet::new(), delta, 4 * BS);
        assert_eq!(merged[0].offset, 0);
        assert_eq!(merged[1].offset, 2 * BS);
    }
}
