use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::driver::Driver;
use crate::error::{self, StoreError};
use crate::types::{lock_file_path, locks_path, LOCK_PREFIX, LOCK_SUFFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Backup,
    Restore,
    Delete,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Backup => "backup",
            LockKind::Restore => "restore",
            LockKind::Delete => "delete",
        }
    }

    fn code(self) -> u8 {
        match self {
            LockKind::Backup => 1,
            LockKind::Restore => 2,
            LockKind::Delete => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LockKind::Backup),
            2 => Some(LockKind::Restore),
            3 => Some(LockKind::Delete),
            _ => None,
        }
    }

    /// Backups and restores may share a volume; delete excludes everything,
    /// including other deletes.
    fn conflicts_with(self, other: LockKind) -> bool {
        self == LockKind::Delete || other == LockKind::Delete
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LockRecord {
    name: String,
    #[serde(rename = "Type")]
    kind: u8,
    acquired: bool,
    server_time: i64,
}

/// Precedence among contending lock files: already-acquired locks first,
/// then oldest timestamp, then name as the final tie break. A lock may flip
/// to acquired only when no conflicting record precedes its own.
fn order_key(record: &LockRecord) -> (u8, i64, String) {
    (
        if record.acquired { 0 } else { 1 },
        record.server_time,
        record.name.clone(),
    )
}

/// One lock file under `<volume>/locks/`, coordinating writers that share
/// the backup target. The protocol tolerates stale listings: every holder
/// writes a uniquely named file and expired peers are swept on each pass.
pub struct FileLock {
    driver: Arc<dyn Driver>,
    config: StoreConfig,
    volume_name: String,
    kind: LockKind,
    name: String,
    acquired: bool,
    refresh: Option<(CancellationToken, JoinHandle<()>)>,
}

impl FileLock {
    pub fn new(
        driver: Arc<dyn Driver>,
        volume_name: &str,
        kind: LockKind,
        config: StoreConfig,
    ) -> Self {
        Self {
            driver,
            config,
            volume_name: volume_name.to_string(),
            kind,
            name: Uuid::new_v4().to_string(),
            acquired: false,
            refresh: None,
        }
    }

    fn path(&self) -> String {
        lock_file_path(&self.volume_name, &self.name)
    }

    fn record(&self, acquired: bool) -> LockRecord {
        LockRecord {
            name: self.name.clone(),
            kind: self.kind.code(),
            acquired,
            server_time: Utc::now().timestamp(),
        }
    }

    async fn write_own(&self, acquired: bool) -> Result<()> {
        let data = serde_json::to_vec(&self.record(acquired)).context("failed to encode lock")?;
        self.driver
            .write(&self.path(), &data)
            .await
            .with_context(|| {
                format!(
                    "failed to write {} lock for volume {}",
                    self.kind, self.volume_name
                )
            })
    }

    /// Load live peer lock records, sweeping any whose timestamp fell past
    /// the expiry horizon.
    async fn load_records(&self) -> Result<Vec<LockRecord>> {
        let names = match self.driver.list(&locks_path(&self.volume_name)).await {
            Ok(names) => names,
            Err(err) if error::is_not_found(&err) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let horizon = Utc::now().timestamp() - self.config.lock_duration_secs as i64;
        let mut records = Vec::new();
        for file_name in names {
            let trimmed = file_name.trim_start_matches('/');
            let Some(rest) = trimmed.strip_prefix(LOCK_PREFIX) else {
                continue;
            };
            let Some(lock_name) = rest.strip_suffix(LOCK_SUFFIX) else {
                continue;
            };

            let path = lock_file_path(&self.volume_name, lock_name);
            let raw = match self.driver.read(&path).await {
                Ok(raw) => raw,
                // a peer released or swept it between list and read
                Err(err) if error::is_not_found(&err) => continue,
                Err(err) => return Err(err),
            };
            let mut record: LockRecord = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(err) => {
                    warn!(path, error = %err, "skipping unparseable lock file");
                    continue;
                }
            };

            // prefer the store's own timestamp over the acquirer's clock
            if let Ok(observed) = self.driver.file_time(&path).await {
                record.server_time = observed.timestamp();
            }

            if record.server_time < horizon {
                debug!(lock = %record.name, volume = %self.volume_name, "removing expired lock");
                if let Err(err) = self.driver.remove(&path).await {
                    warn!(path, error = %err, "failed to remove expired lock");
                }
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn try_promote(&self) -> Result<bool> {
        let records = self.load_records().await?;
        let Some(own) = records.iter().find(|record| record.name == self.name) else {
            // our file has not surfaced in the listing yet; rewrite and retry
            self.write_own(false).await?;
            return Ok(false);
        };

        let own_key = order_key(own);
        for record in &records {
            if record.name == self.name {
                continue;
            }
            let Some(kind) = LockKind::from_code(record.kind) else {
                warn!(lock = %record.name, code = record.kind, "ignoring lock with unknown type");
                continue;
            };
            if self.kind.conflicts_with(kind) && order_key(record) < own_key {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn acquire(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.lock_duration_secs);

        self.write_own(false).await?;
        loop {
            match self.try_promote().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    let _ = self.driver.remove(&self.path()).await;
                    return Err(err.context(format!(
                        "failed to negotiate {} lock for volume {}",
                        self.kind, self.volume_name
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = self.driver.remove(&self.path()).await;
                return Err(StoreError::LockTimeout {
                    volume: self.volume_name.clone(),
                    lock_kind: self.kind.as_str(),
                    timeout_secs: self.config.lock_duration_secs,
                }
                .into());
            }
            tokio::time::sleep(Duration::from_millis(self.config.lock_check_interval_ms)).await;
        }

        if let Err(err) = self.write_own(true).await {
            let _ = self.driver.remove(&self.path()).await;
            return Err(err);
        }
        self.acquired = true;
        self.spawn_refresh();
        debug!(volume = %self.volume_name, kind = %self.kind, lock = %self.name, "lock acquired");
        Ok(())
    }

    /// Keep the held lock's timestamp fresh so peers do not sweep it.
    fn spawn_refresh(&mut self) {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let driver = Arc::clone(&self.driver);
        let path = self.path();
        let name = self.name.clone();
        let kind = self.kind;
        let interval = Duration::from_secs(self.config.lock_refresh_interval_secs);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let record = LockRecord {
                            name: name.clone(),
                            kind: kind.code(),
                            acquired: true,
                            server_time: Utc::now().timestamp(),
                        };
                        let encoded = match serde_json::to_vec(&record) {
                            Ok(encoded) => encoded,
                            Err(err) => {
                                warn!(lock = %name, error = %err, "failed to encode lock refresh");
                                continue;
                            }
                        };
                        if let Err(err) = driver.write(&path, &encoded).await {
                            warn!(lock = %name, error = %err, "failed to refresh lock");
                        }
                    }
                }
            }
        });
        self.refresh = Some((token, handle));
    }

    pub async fn release(&mut self) -> Result<()> {
        if let Some((token, handle)) = self.refresh.take() {
            token.cancel();
            let _ = handle.await;
        }
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;
        self.driver.remove(&self.path()).await.with_context(|| {
            format!(
                "failed to release {} lock for volume {}",
                self.kind, self.volume_name
            )
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some((token, _)) = self.refresh.take() {
            token.cancel();
        }
    }
}
