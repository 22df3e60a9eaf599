use std::collections::{BTreeMap, VecDeque};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocks::BlockStore;
use crate::config::StoreConfig;
use crate::delta::{DeltaOps, DeltaRestoreConfig, PROGRESS_COMPLETE};
use crate::driver::get_driver;
use crate::error::StoreError;
use crate::lock::{FileLock, LockKind};
use crate::manifest::ManifestStore;
use crate::types::{
    decode_backup_url, ensure_valid_name, is_backup_in_progress, Backup, Volume,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockSource {
    /// Fetch the named block from the store.
    Fetch(String),
    /// Clear the region: the block existed in the baseline but not in the
    /// target backup.
    Zero,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RestoreJob {
    offset: u64,
    source: BlockSource,
}

/// Rebuild the full volume image described by `backup_url` into
/// `config.filename`. Blocks absent from the manifest stay sparse holes.
pub async fn restore_delta_block_backup(
    cancel: &CancellationToken,
    config: &DeltaRestoreConfig,
) -> Result<()> {
    let (backup_name, volume_name, dest_url) = decode_backup_url(&config.backup_url)?;
    if backup_name.is_empty() {
        bail!("missing backup name in URL {}", config.backup_url);
    }
    run_restore(cancel, config, &backup_name, &volume_name, &dest_url, false).await
}

/// Rebuild only the regions that changed between `config.last_backup_name`
/// and the target backup. Regions untouched between the two are left as-is
/// in `config.filename`; regions dropped from the target are zeroed.
pub async fn restore_delta_block_backup_incrementally(
    cancel: &CancellationToken,
    config: &DeltaRestoreConfig,
) -> Result<()> {
    if config.last_backup_name.is_empty() {
        bail!("invalid parameter last_backup_name {}", config.last_backup_name);
    }
    ensure_valid_name(&config.last_backup_name)?;

    let (backup_name, volume_name, dest_url) = decode_backup_url(&config.backup_url)?;
    if backup_name.is_empty() {
        bail!("missing backup name in URL {}", config.backup_url);
    }
    run_restore(cancel, config, &backup_name, &volume_name, &dest_url, true).await
}

async fn run_restore(
    cancel: &CancellationToken,
    config: &DeltaRestoreConfig,
    backup_name: &str,
    volume_name: &str,
    dest_url: &str,
    incremental: bool,
) -> Result<()> {
    if config.filename.is_empty() {
        bail!("missing restore target filename");
    }
    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(dest_url)?;
    let store = ManifestStore::new(Arc::clone(&driver), store_config.clone());

    let mut lock = FileLock::new(
        Arc::clone(&driver),
        volume_name,
        LockKind::Restore,
        store_config.clone(),
    );
    lock.acquire().await?;
    let result = perform_restore(
        cancel,
        &store,
        &store_config,
        config,
        backup_name,
        volume_name,
        incremental,
    )
    .await;
    if let Err(err) = lock.release().await {
        warn!(volume = %volume_name, error = %err, "failed to release restore lock");
    }

    match result {
        Ok(()) => {
            if let Err(err) = config
                .delta_ops
                .update_restore_status(&config.filename, PROGRESS_COMPLETE, "")
                .await
            {
                warn!(error = %err, "failed to report restore completion");
            }
            info!(
                volume = %volume_name,
                backup = %backup_name,
                target = %config.filename,
                incremental,
                "restore complete"
            );
            Ok(())
        }
        Err(err) => {
            let message = format!("{err:#}");
            let _ = config
                .delta_ops
                .update_restore_status(&config.filename, 0, &message)
                .await;
            Err(err)
        }
    }
}

async fn perform_restore(
    cancel: &CancellationToken,
    store: &ManifestStore,
    store_config: &StoreConfig,
    config: &DeltaRestoreConfig,
    backup_name: &str,
    volume_name: &str,
    incremental: bool,
) -> Result<()> {
    let volume = store.load_volume(volume_name).await?;
    let backup = load_restorable_backup(store, backup_name, volume_name).await?;
    let block_size = volume.effective_block_size();

    let jobs = if incremental {
        let baseline =
            load_restorable_backup(store, &config.last_backup_name, volume_name).await?;
        diff_restore_jobs(&backup, &baseline)
    } else {
        backup
            .blocks
            .iter()
            .map(|mapping| RestoreJob {
                offset: mapping.offset,
                source: BlockSource::Fetch(mapping.block_checksum.clone()),
            })
            .collect()
    };

    let vol_dev = config
        .delta_ops
        .open_volume_dev(&config.filename)
        .await
        .with_context(|| format!("failed to open restore target {}", config.filename))?;
    vol_dev
        .set_len(volume.size)
        .with_context(|| format!("failed to size restore target {}", config.filename))?;

    let vol_dev = Arc::new(vol_dev);
    let outcome = run_restore_pipeline(
        cancel,
        store,
        store_config,
        config,
        &volume,
        block_size,
        Arc::clone(&vol_dev),
        jobs,
    )
    .await;

    let vol_dev =
        Arc::try_unwrap(vol_dev).map_err(|_| anyhow!("BUG: restore target still shared"))?;
    if let Err(err) = config.delta_ops.close_volume_dev(vol_dev).await {
        warn!(target = %config.filename, error = %err, "failed to close restore target");
    }
    outcome
}

async fn load_restorable_backup(
    store: &ManifestStore,
    backup_name: &str,
    volume_name: &str,
) -> Result<Backup> {
    let backup = store.load_backup(backup_name, volume_name).await?;
    if is_backup_in_progress(&backup) {
        return Err(StoreError::BackupInProgress(backup_name.to_string()).into());
    }
    if backup.volume_name != volume_name {
        bail!(
            "backup {backup_name} belongs to volume {}, not {volume_name}",
            backup.volume_name
        );
    }
    Ok(backup)
}

/// Offsets whose content differs between the baseline and the target:
/// fetch what is new or changed, zero what disappeared.
fn diff_restore_jobs(current: &Backup, baseline: &Backup) -> Vec<RestoreJob> {
    let previous: BTreeMap<u64, &str> = baseline
        .blocks
        .iter()
        .map(|mapping| (mapping.offset, mapping.block_checksum.as_str()))
        .collect();

    let mut jobs = Vec::new();
    for mapping in &current.blocks {
        match previous.get(&mapping.offset) {
            Some(prev) if *prev == mapping.block_checksum => {}
            _ => jobs.push(RestoreJob {
                offset: mapping.offset,
                source: BlockSource::Fetch(mapping.block_checksum.clone()),
            }),
        }
    }

    let current_offsets: BTreeMap<u64, ()> = current
        .blocks
        .iter()
        .map(|mapping| (mapping.offset, ()))
        .collect();
    for offset in previous.keys() {
        if !current_offsets.contains_key(offset) {
            jobs.push(RestoreJob {
                offset: *offset,
                source: BlockSource::Zero,
            });
        }
    }
    jobs
}

struct RestorePipeline {
    delta_ops: Arc<dyn DeltaOps>,
    block_store: BlockStore,
    vol_dev: Arc<std::fs::File>,
    filename: String,
    volume_size: u64,
    block_size: u64,
    queue: Mutex<VecDeque<RestoreJob>>,
    processed: AtomicU64,
    total: u64,
}

impl RestorePipeline {
    async fn run_worker(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Canceled.into());
            }
            let job = { self.queue.lock().pop_front() };
            let Some(job) = job else {
                return Ok(());
            };
            self.process_block(job).await?;
            self.report_progress().await;
        }
    }

    async fn process_block(&self, job: RestoreJob) -> Result<()> {
        let region = self.block_size.min(self.volume_size.saturating_sub(job.offset)) as usize;
        if region == 0 {
            warn!(offset = job.offset, "ignoring block beyond the volume end");
            return Ok(());
        }
        let data = match &job.source {
            BlockSource::Fetch(checksum) => {
                let mut data = self.block_store.download_block(checksum).await?;
                data.truncate(region);
                data
            }
            BlockSource::Zero => {
                debug!(offset = job.offset, "zeroing dropped block");
                vec![0_u8; region]
            }
        };

        let vol_dev = Arc::clone(&self.vol_dev);
        let offset = job.offset;
        tokio::task::spawn_blocking(move || vol_dev.write_all_at(&data, offset))
            .await
            .map_err(|err| anyhow!("restore writer panicked: {err}"))?
            .with_context(|| format!("failed to write restored block at offset {offset}"))
    }

    async fn report_progress(&self) {
        let done = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let progress = (done * 100 / self.total) as i32;
        if let Err(err) = self
            .delta_ops
            .update_restore_status(&self.filename, progress, "")
            .await
        {
            warn!(error = %err, "failed to report restore progress");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_restore_pipeline(
    cancel: &CancellationToken,
    store: &ManifestStore,
    store_config: &StoreConfig,
    config: &DeltaRestoreConfig,
    volume: &Volume,
    block_size: u64,
    vol_dev: Arc<std::fs::File>,
    jobs: Vec<RestoreJob>,
) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    let total = jobs.len() as u64;
    let worker_count = store_config
        .clamp_concurrency(config.concurrent_limit)
        .min(jobs.len());
    let cancel = cancel.child_token();

    let pipeline = Arc::new(RestorePipeline {
        delta_ops: Arc::clone(&config.delta_ops),
        block_store: BlockStore::new(
            Arc::clone(store.driver()),
            &volume.name,
            volume.compression_method,
            store_config.clone(),
        ),
        vol_dev,
        filename: config.filename.clone(),
        volume_size: volume.size,
        block_size,
        queue: Mutex::new(VecDeque::from(jobs)),
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
                    first_error = Some(anyhow!("restore worker panicked: {join_err}"));
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockMapping;

    fn backup_with(blocks: &[(u64, &str)]) -> Backup {
        Backup {
            blocks: blocks
                .iter()
                .map(|(offset, checksum)| BlockMapping {
                    offset: *offset,
                    block_checksum: checksum.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn diff_skips_identical_blocks() {
        let current = backup_with(&[(0, "aa"), (4096, "bb")]);
        let baseline = backup_with(&[(0, "aa"), (4096, "bb")]);
        assert!(diff_restore_jobs(&current, &baseline).is_empty());
    }

    #[test]
    fn diff_fetches_changed_and_new_blocks() {
        let current = backup_with(&[(0, "aa"), (4096, "b2"), (8192, "cc")]);
        let baseline = backup_with(&[(0, "aa"), (4096, "bb")]);
        let jobs = diff_restore_jobs(&current, &baseline);
        assert_eq!(
            jobs,
            vec![
                RestoreJob {
                    offset: 4096,
                    source: BlockSource::Fetch("b2".to_string())
                },
                RestoreJob {
                    offset: 8192,
                    source: BlockSource::Fetch("cc".to_string())
                },
            ]
        );
    }

    #[test]
    fn diff_zeroes_blocks_dropped_from_the_target() {
        let current = backup_with(&[(0, "aa")]);
        let baseline = backup_with(&[(0, "aa"), (4096, "bb")]);
        let jobs = diff_restore_jobs(&current, &baseline);
        assert_eq!(
            jobs,
            vec![RestoreJob {
                offset: 4096,
                source: BlockSource::Zero
            }]
        );
    }
}
