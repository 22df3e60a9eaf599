use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::StoreConfig;
use crate::driver::{with_backoff, Driver};
use crate::error::{self, StoreError};
use crate::types::{
    backup_config_path, backups_path, ensure_valid_name, validate_name, volume_config_path,
    volume_path, Backup, Volume, BACKUP_CONFIG_PREFIX, CFG_SUFFIX,
};

/// JSON manifest access on top of a [`Driver`]. Manifests are serialized in
/// memory and published with a single write; a zero-byte or unparseable
/// object reads back as absent.
pub struct ManifestStore {
    driver: Arc<dyn Driver>,
    config: StoreConfig,
}

impl ManifestStore {
    pub fn new(driver: Arc<dyn Driver>, config: StoreConfig) -> Self {
        Self { driver, config }
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn load_object<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let raw = with_backoff(&self.config.read_retry_backoff_secs, || {
            let driver = Arc::clone(&self.driver);
            let path = path.to_string();
            async move { driver.read(&path).await }
        })
        .await?;

        if raw.is_empty() {
            warn!(path, "treating zero-byte manifest as absent");
            return Err(StoreError::NotFound(what.to_string()).into());
        }
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(path, error = %err, "treating unparseable manifest as absent");
                Err(StoreError::NotFound(what.to_string()).into())
            }
        }
    }

    pub async fn volume_exists(&self, volume_name: &str) -> bool {
        self.driver
            .file_exists(&volume_config_path(volume_name))
            .await
    }

    pub async fn load_volume(&self, volume_name: &str) -> Result<Volume> {
        ensure_valid_name(volume_name)?;
        self.load_object(
            &volume_config_path(volume_name),
            &format!("volume {volume_name}"),
        )
        .await
    }

    pub async fn save_volume(&self, volume: &Volume) -> Result<()> {
        ensure_valid_name(&volume.name)?;
        let data = serde_json::to_vec(volume).context("failed to encode volume config")?;
        self.driver
            .write(&volume_config_path(&volume.name), &data)
            .await
            .with_context(|| format!("failed to write volume config for {}", volume.name))
    }

    pub async fn remove_volume_config(&self, volume_name: &str) -> Result<()> {
        self.driver.remove(&volume_config_path(volume_name)).await
    }

    /// Remove the whole per-volume tree (configs, backups, blocks, locks).
    pub async fn remove_volume_tree(&self, volume_name: &str) -> Result<()> {
        self.driver.remove(&volume_path(volume_name)).await
    }

    pub async fn load_backup(&self, backup_name: &str, volume_name: &str) -> Result<Backup> {
        ensure_valid_name(backup_name)?;
        ensure_valid_name(volume_name)?;
        self.load_object(
            &backup_config_path(backup_name, volume_name),
            &format!("backup {backup_name} of volume {volume_name}"),
        )
        .await
    }

    pub async fn save_backup(&self, backup: &Backup) -> Result<()> {
        ensure_valid_name(&backup.name)?;
        ensure_valid_name(&backup.volume_name)?;
        let data = serde_json::to_vec(backup).context("failed to encode backup config")?;
        self.driver
            .write(&backup_config_path(&backup.name, &backup.volume_name), &data)
            .await
            .with_context(|| format!("failed to write backup config for {}", backup.name))
    }

    pub async fn remove_backup(&self, backup_name: &str, volume_name: &str) -> Result<()> {
        self.driver
            .remove(&backup_config_path(backup_name, volume_name))
            .await
    }

    /// Names of all published backups for a volume, in listing order.
    pub async fn backup_names(&self, volume_name: &str) -> Result<Vec<String>> {
        match self.driver.list(&backups_path(volume_name)).await {
            Ok(names) => Ok(extract_names(&names, BACKUP_CONFIG_PREFIX, CFG_SUFFIX)),
            Err(err) if error::is_not_found(&err) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Union of block checksums referenced by every loadable backup of the
    /// volume. Manifests that vanished between listing and loading are
    /// skipped: listings are eventually consistent.
    pub async fn referenced_checksums(&self, volume_name: &str) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        for name in self.backup_names(volume_name).await? {
            match self.load_backup(&name, volume_name).await {
                Ok(backup) => {
                    referenced.extend(
                        backup
                            .blocks
                            .into_iter()
                            .map(|mapping| mapping.block_checksum),
                    );
                }
                Err(err) if error::is_not_found(&err) => {
                    warn!(volume = %volume_name, backup = %name, "skipping vanished backup manifest");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(referenced)
    }
}

/// Strip `prefix`/`suffix` from listed object names, dropping entries that
/// do not carry both affixes or fail name validation.
pub fn extract_names(names: &[String], prefix: &str, suffix: &str) -> Vec<String> {
    let mut out = Vec::new();
    for name in names {
        let name = name.trim_start_matches('/');
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let Some(core) = rest.strip_suffix(suffix) else {
            continue;
        };
        if !validate_name(core) {
            warn!(name, prefix, suffix, "skipping invalid object name");
            continue;
        }
        out.push(core.to_string());
    }
    out
}
