use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;

use crate::config::StoreConfig;
use crate::driver::{get_driver, Driver};
use crate::error::{self, StoreError};
use crate::manifest::ManifestStore;
use crate::types::{
    decode_backup_url, encode_backup_url, ensure_valid_name, is_backup_in_progress, string_number,
    validate_name, Backup, Volume, BACKUPSTORE_BASE, VOLUME_DIRECTORY,
};

pub const MESSAGE_TYPE_ERROR: &str = "error";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    pub name: String,
    #[serde(with = "string_number")]
    pub size: u64,
    pub labels: BTreeMap<String, String>,
    pub created: String,
    pub last_backup_name: String,
    pub last_backup_at: String,
    #[serde(with = "string_number")]
    pub data_stored: u64,
    pub messages: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub backups: BTreeMap<String, BackupInfo>,
    pub backing_image_name: String,
    pub backing_image_checksum: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupInfo {
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub snapshot_name: String,
    pub snapshot_created: String,
    pub created: String,
    #[serde(with = "string_number")]
    pub size: u64,
    pub labels: BTreeMap<String, String>,
    pub is_incremental: bool,
    pub volume_name: String,
    #[serde(with = "string_number")]
    pub volume_size: u64,
    pub volume_created: String,
    pub volume_backing_image_name: String,
    pub messages: BTreeMap<String, String>,
}

fn fill_volume_info(volume: &Volume) -> VolumeInfo {
    VolumeInfo {
        name: volume.name.clone(),
        size: volume.size,
        labels: volume.labels.clone(),
        created: volume.created_time.clone(),
        last_backup_name: volume.last_backup_name.clone(),
        last_backup_at: volume.last_backup_at.clone(),
        data_stored: volume.block_count * volume.effective_block_size(),
        backing_image_name: volume.backing_image_name.clone(),
        backing_image_checksum: volume.backing_image_checksum.clone(),
        ..Default::default()
    }
}

fn fill_backup_info(backup: &Backup, dest_url: &str) -> BackupInfo {
    BackupInfo {
        name: backup.name.clone(),
        url: encode_backup_url(&backup.name, &backup.volume_name, dest_url),
        snapshot_name: backup.snapshot_name.clone(),
        snapshot_created: backup.snapshot_created_at.clone(),
        created: backup.created_time.clone(),
        size: backup.size,
        labels: backup.labels.clone(),
        is_incremental: backup.is_incremental,
        ..Default::default()
    }
}

fn fill_full_backup_info(backup: &Backup, volume: &Volume, dest_url: &str) -> BackupInfo {
    let mut info = fill_backup_info(backup, dest_url);
    info.volume_name = volume.name.clone();
    info.volume_size = volume.size;
    info.volume_created = volume.created_time.clone();
    info.volume_backing_image_name = volume.backing_image_name.clone();
    info
}

fn failed_backup_info(
    backup_name: &str,
    volume_name: &str,
    dest_url: &str,
    err: &anyhow::Error,
) -> BackupInfo {
    let mut info = BackupInfo {
        name: backup_name.to_string(),
        url: encode_backup_url(backup_name, volume_name, dest_url),
        volume_name: volume_name.to_string(),
        ..Default::default()
    };
    info.messages
        .insert(MESSAGE_TYPE_ERROR.to_string(), format!("{err:#}"));
    info
}

/// Discover every volume by walking the two-level hash-prefix tree under
/// `volumes/` with a bounded worker pool. Each listing job carries its own
/// timeout so one wedged prefix cannot stall the whole walk.
async fn discover_volume_names(
    driver: &Arc<dyn Driver>,
    config: &StoreConfig,
) -> Result<Vec<String>> {
    let base = format!("{BACKUPSTORE_BASE}/{VOLUME_DIRECTORY}");
    let lv1 = match driver.list(&base).await {
        Ok(names) => names,
        Err(err) if error::is_not_found(&err) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let pool = Arc::new(Semaphore::new(config.list_pool_size));
    let job_timeout = Duration::from_secs(config.list_job_timeout_secs);

    let mut lv2_tasks = Vec::new();
    for l1 in lv1 {
        let driver = Arc::clone(driver);
        let pool = Arc::clone(&pool);
        let base = base.clone();
        lv2_tasks.push(tokio::spawn(async move {
            let _permit = pool
                .acquire_owned()
                .await
                .context("listing pool closed")?;
            let path = format!("{base}/{l1}");
            let children = list_or_empty(&driver, &path, job_timeout).await?;
            Ok::<_, anyhow::Error>(
                children
                    .into_iter()
                    .map(|l2| format!("{l1}/{l2}"))
                    .collect::<Vec<_>>(),
            )
        }));
    }
    let mut prefixes = Vec::new();
    for task in lv2_tasks {
        prefixes.extend(task.await.context("listing worker panicked")??);
    }

    let mut name_tasks = Vec::new();
    for prefix in prefixes {
        let driver = Arc::clone(driver);
        let pool = Arc::clone(&pool);
        let base = base.clone();
        name_tasks.push(tokio::spawn(async move {
            let _permit = pool
                .acquire_owned()
                .await
                .context("listing pool closed")?;
            let path = format!("{base}/{prefix}");
            list_or_empty(&driver, &path, job_timeout).await
        }));
    }

    let mut names = Vec::new();
    for task in name_tasks {
        for name in task.await.context("listing worker panicked")?? {
            if validate_name(&name) {
                names.push(name);
            } else {
                warn!(name, "skipping invalid volume directory name");
            }
        }
    }
    names.sort_unstable();
    Ok(names)
}

async fn list_or_empty(
    driver: &Arc<dyn Driver>,
    path: &str,
    job_timeout: Duration,
) -> Result<Vec<String>> {
    let listed = timeout(job_timeout, driver.list(path))
        .await
        .map_err(|_| anyhow!("timed out listing {path}"))?;
    match listed {
        Ok(names) => Ok(names),
        Err(err) if error::is_not_found(&err) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

async fn build_volume_info(
    store: &ManifestStore,
    volume_name: &str,
    dest_url: &str,
    volume_only: bool,
) -> VolumeInfo {
    let mut info = VolumeInfo {
        name: volume_name.to_string(),
        ..Default::default()
    };
    if volume_only {
        return info;
    }

    let volume = match store.load_volume(volume_name).await {
        Ok(volume) => volume,
        Err(err) => {
            info.messages
                .insert(MESSAGE_TYPE_ERROR.to_string(), format!("{err:#}"));
            return info;
        }
    };
    info = fill_volume_info(&volume);

    let backup_names = match store.backup_names(volume_name).await {
        Ok(names) => names,
        Err(err) => {
            info.messages
                .insert(MESSAGE_TYPE_ERROR.to_string(), format!("{err:#}"));
            return info;
        }
    };
    for backup_name in backup_names {
        let entry = match store.load_backup(&backup_name, volume_name).await {
            Ok(backup) if is_backup_in_progress(&backup) => failed_backup_info(
                &backup_name,
                volume_name,
                dest_url,
                &anyhow::Error::from(StoreError::BackupInProgress(backup_name.clone())),
            ),
            Ok(backup) => fill_backup_info(&backup, dest_url),
            Err(err) => failed_backup_info(&backup_name, volume_name, dest_url, &err),
        };
        info.backups.insert(backup_name, entry);
    }
    info
}

/// Enumerate volumes and their backups. A volume whose manifest is missing
/// or malformed is annotated in `messages` rather than failing the call.
pub async fn list(
    volume_name: &str,
    dest_url: &str,
    volume_only: bool,
) -> Result<BTreeMap<String, VolumeInfo>> {
    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(dest_url)?;
    let store = Arc::new(ManifestStore::new(Arc::clone(&driver), store_config.clone()));

    let names = if volume_name.is_empty() {
        discover_volume_names(&driver, &store_config).await?
    } else {
        ensure_valid_name(volume_name)?;
        vec![volume_name.to_string()]
    };

    let pool = Arc::new(Semaphore::new(store_config.list_pool_size));
    let mut tasks = Vec::new();
    for name in names {
        let store = Arc::clone(&store);
        let pool = Arc::clone(&pool);
        let dest_url = dest_url.to_string();
        tasks.push(tokio::spawn(async move {
            let _permit = pool
                .acquire_owned()
                .await
                .context("listing pool closed")?;
            let info = build_volume_info(&store, &name, &dest_url, volume_only).await;
            Ok::<_, anyhow::Error>((name, info))
        }));
    }

    let mut response = BTreeMap::new();
    for task in tasks {
        let (name, info) = task.await.context("listing worker panicked")??;
        response.insert(name, info);
    }
    Ok(response)
}

/// Volume-only inspection through the metadata URL form (`?volume=<v>`).
pub async fn inspect_volume(volume_url: &str) -> Result<VolumeInfo> {
    let (_, volume_name, dest_url) = decode_backup_url(volume_url)?;
    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(&dest_url)?;
    let store = ManifestStore::new(driver, store_config);

    let volume = store.load_volume(&volume_name).await?;
    Ok(fill_volume_info(&volume))
}

/// Full backup inspection, joined with its volume's fields.
pub async fn inspect_backup(backup_url: &str) -> Result<BackupInfo> {
    let (backup_name, volume_name, dest_url) = decode_backup_url(backup_url)?;
    if backup_name.is_empty() {
        bail!("missing backup name in URL {backup_url}");
    }
    let store_config = StoreConfig::default();
    store_config.validate()?;
    let driver = get_driver(&dest_url)?;
    let store = ManifestStore::new(driver, store_config);

    let volume = store.load_volume(&volume_name).await?;
    let backup = store.load_backup(&backup_name, &volume_name).await?;
    if is_backup_in_progress(&backup) {
        return Err(StoreError::BackupInProgress(backup_name).into());
    }
    Ok(fill_full_backup_info(&backup, &volume, &dest_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::vfs;
    use crate::error::as_store_error;
    use crate::types::{now, volume_config_path, BlockMapping, DEFAULT_BLOCK_SIZE};

    struct Fixture {
        _dir: tempfile::TempDir,
        dest_url: String,
        store: ManifestStore,
    }

    async fn fixture() -> Fixture {
        vfs::register().expect("register vfs driver");
        let dir = tempfile::tempdir().expect("tempdir");
        let dest_url = format!("file://{}", dir.path().display());
        let driver = crate::driver::get_driver(&dest_url).expect("driver");
        let store = ManifestStore::new(driver, StoreConfig::default());
        Fixture {
            _dir: dir,
            dest_url,
            store,
        }
    }

    async fn seed_volume(fixture: &Fixture, name: &str, backups: usize) {
        let volume = Volume {
            name: name.to_string(),
            size: 4 * DEFAULT_BLOCK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            created_time: now(),
            block_count: backups as u64,
            ..Default::default()
        };
        fixture.store.save_volume(&volume).await.expect("save volume");

        for index in 0..backups {
            let backup = Backup {
                name: format!("backup-{name}-{index}"),
                volume_name: name.to_string(),
                snapshot_name: format!("snap-{index}"),
                created_time: now(),
                size: DEFAULT_BLOCK_SIZE,
                blocks: vec![BlockMapping {
                    offset: 0,
                    block_checksum: crate::data::hash::checksum(name.as_bytes()),
                }],
                ..Default::default()
            };
            fixture.store.save_backup(&backup).await.expect("save backup");
        }
    }

    #[tokio::test]
    async fn list_discovers_volumes_and_backups() {
        let fixture = fixture().await;
        seed_volume(&fixture, "vol-list-a", 2).await;
        seed_volume(&fixture, "vol-list-b", 1).await;

        let all = list("", &fixture.dest_url, false).await.expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all["vol-list-a"].backups.len(), 2);
        assert_eq!(all["vol-list-b"].backups.len(), 1);

        let info = &all["vol-list-a"];
        assert_eq!(info.size, 4 * DEFAULT_BLOCK_SIZE);
        let backup = &info.backups["backup-vol-list-a-0"];
        assert_eq!(backup.snapshot_name, "snap-0");
        assert!(backup.url.contains("backup=backup-vol-list-a-0"));
    }

    #[tokio::test]
    async fn volume_only_listing_returns_skeletons() {
        let fixture = fixture().await;
        seed_volume(&fixture, "vol-skel", 3).await;

        let all = list("vol-skel", &fixture.dest_url, true).await.expect("list");
        assert_eq!(all.len(), 1);
        assert!(all["vol-skel"].backups.is_empty());
    }

    #[tokio::test]
    async fn malformed_volume_is_annotated_not_fatal() {
        let fixture = fixture().await;
        seed_volume(&fixture, "vol-good", 1).await;
        fixture
            .store
            .driver()
            .write(&volume_config_path("vol-broken"), b"{ nope")
            .await
            .expect("write junk");

        let all = list("", &fixture.dest_url, false).await.expect("list");
        assert!(all["vol-good"].messages.is_empty());
        assert!(all["vol-broken"]
            .messages
            .contains_key(MESSAGE_TYPE_ERROR));
    }

    #[tokio::test]
    async fn inspect_volume_reports_data_stored() {
        let fixture = fixture().await;
        seed_volume(&fixture, "vol-inspect", 2).await;

        let url = encode_backup_url("", "vol-inspect", &fixture.dest_url);
        let info = inspect_volume(&url).await.expect("inspect");
        assert_eq!(info.name, "vol-inspect");
        assert_eq!(info.data_stored, 2 * DEFAULT_BLOCK_SIZE);
    }

    #[tokio::test]
    async fn inspect_backup_rejects_in_progress_manifests() {
        let fixture = fixture().await;
        seed_volume(&fixture, "vol-prog", 0).await;

        let half_published = Backup {
            name: "backup-partial".to_string(),
            volume_name: "vol-prog".to_string(),
            ..Default::default()
        };
        fixture
            .store
            .save_backup(&half_published)
            .await
            .expect("save backup");

        let url = encode_backup_url("backup-partial", "vol-prog", &fixture.dest_url);
        let err = inspect_backup(&url).await.expect_err("must fail");
        assert!(matches!(
            as_store_error(&err),
            Some(StoreError::BackupInProgress(_))
        ));
    }

    #[tokio::test]
    async fn inspect_backup_joins_volume_fields() {
        let fixture = fixture().await;
        seed_volume(&fixture, "vol-join", 1).await;

        let url = encode_backup_url("backup-vol-join-0", "vol-join", &fixture.dest_url);
        let info = inspect_backup(&url).await.expect("inspect");
        assert_eq!(info.volume_name, "vol-join");
        assert_eq!(info.volume_size, 4 * DEFAULT_BLOCK_SIZE);
        assert_eq!(info.url, url);
    }
}
