use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use chrono::{SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::hash;
use crate::error::StoreError;

pub const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

pub const BACKUPSTORE_BASE: &str = "backupstore";
pub const VOLUME_DIRECTORY: &str = "volumes";
pub const VOLUME_CONFIG_FILE: &str = "volume.cfg";
pub const BACKUP_DIRECTORY: &str = "backups";
pub const BACKUP_CONFIG_PREFIX: &str = "backup_";
pub const CFG_SUFFIX: &str = ".cfg";
pub const BLOCKS_DIRECTORY: &str = "blocks";
pub const BLK_SUFFIX: &str = ".blk";
pub const LOCKS_DIRECTORY: &str = "locks";
pub const LOCK_PREFIX: &str = "lock-";
pub const LOCK_SUFFIX: &str = ".lck";

lazy_static! {
    static ref NAME_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]+$").expect("static name pattern must compile");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    InProgress,
    Complete,
    Error,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::InProgress => "in_progress",
            ProgressState::Complete => "complete",
            ProgressState::Error => "error",
        }
    }
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionMethod {
    #[default]
    #[serde(rename = "none", alias = "")]
    None,
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "lz4")]
    Lz4,
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMethod::None => f.write_str("none"),
            CompressionMethod::Gzip => f.write_str("gzip"),
            CompressionMethod::Lz4 => f.write_str("lz4"),
        }
    }
}

/// A region of the volume that must be transferred, as reported by the
/// caller's snapshot differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Mappings {
    pub mappings: Vec<Mapping>,
    pub block_size: u64,
}

/// 64-bit sizes are serialized as JSON strings so consumers without native
/// 64-bit integers read them losslessly.
pub mod string_number {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u64>().map_err(serde::de::Error::custom)
    }
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Volume {
    pub name: String,
    #[serde(with = "string_number")]
    pub size: u64,
    pub labels: BTreeMap<String, String>,
    pub created_time: String,
    pub last_backup_name: String,
    pub last_backup_at: String,
    #[serde(with = "string_number")]
    pub block_count: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    pub compression_method: CompressionMethod,
    pub backing_image_name: String,
    pub backing_image_checksum: String,
    pub data_engine: String,
}

impl Volume {
    /// Volumes written before the block size was recorded read back as 0.
    pub fn effective_block_size(&self) -> u64 {
        if self.block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            self.block_size
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub name: String,
    pub created_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockMapping {
    pub offset: u64,
    pub block_checksum: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Backup {
    pub name: String,
    pub volume_name: String,
    pub snapshot_name: String,
    pub snapshot_created_at: String,
    pub created_time: String,
    #[serde(with = "string_number")]
    pub size: u64,
    pub labels: BTreeMap<String, String>,
    pub is_incremental: bool,
    pub compression_method: CompressionMethod,
    pub blocks: Vec<BlockMapping>,
}

/// A manifest that was reserved but never finished publishing. Listers and
/// inspectors must not hand these out as restorable backups.
pub fn is_backup_in_progress(backup: &Backup) -> bool {
    backup.snapshot_name.is_empty() || backup.created_time.is_empty()
}

pub fn validate_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

pub fn ensure_valid_name(name: &str) -> Result<()> {
    if !validate_name(name) {
        return Err(StoreError::InvalidName(name.to_string()).into());
    }
    Ok(())
}

/// `<prefix>-<16 hex chars>` from a fresh uuid.
pub fn generate_name(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..16])
}

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn volume_path(volume_name: &str) -> String {
    let (lv1, lv2) = hash::name_shard_pair(volume_name);
    format!("{BACKUPSTORE_BASE}/{VOLUME_DIRECTORY}/{lv1}/{lv2}/{volume_name}")
}

pub fn volume_config_path(volume_name: &str) -> String {
    format!("{}/{VOLUME_CONFIG_FILE}", volume_path(volume_name))
}

pub fn backups_path(volume_name: &str) -> String {
    format!("{}/{BACKUP_DIRECTORY}", volume_path(volume_name))
}

pub fn backup_config_path(backup_name: &str, volume_name: &str) -> String {
    format!(
        "{}/{BACKUP_CONFIG_PREFIX}{backup_name}{CFG_SUFFIX}",
        backups_path(volume_name)
    )
}

pub fn blocks_path(volume_name: &str) -> String {
    format!("{}/{BLOCKS_DIRECTORY}", volume_path(volume_name))
}

pub fn block_path(volume_name: &str, checksum: &str) -> String {
    let (lv1, lv2) = hash::shard_pair(checksum);
    format!("{}/{lv1}/{lv2}/{checksum}{BLK_SUFFIX}", blocks_path(volume_name))
}

pub fn locks_path(volume_name: &str) -> String {
    format!("{}/{LOCKS_DIRECTORY}", volume_path(volume_name))
}

pub fn lock_file_path(volume_name: &str, lock_name: &str) -> String {
    format!("{}/{LOCK_PREFIX}{lock_name}{LOCK_SUFFIX}", locks_path(volume_name))
}

/// Build `<dest>?backup=<b>&volume=<v>` with query keys in sorted order.
/// Any query parameters already on `dest_url` are driver-only and dropped.
pub fn encode_backup_url(backup_name: &str, volume_name: &str, dest_url: &str) -> String {
    let base = dest_url.split('?').next().unwrap_or(dest_url);
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if !backup_name.is_empty() {
        query.append_pair("backup", backup_name);
    }
    query.append_pair("volume", volume_name);
    format!("{base}?{}", query.finish())
}

/// Split a backup/metadata URL into `(backup_name, volume_name, dest_url)`.
/// `backup_name` is empty for metadata URLs. All query parameters other
/// than `backup` and `volume` are dropped from the returned destination.
pub fn decode_backup_url(backup_url: &str) -> Result<(String, String, String)> {
    let mut parts = backup_url.splitn(2, '?');
    let base = parts.next().unwrap_or_default().to_string();
    let query = parts.next().unwrap_or_default();

    let mut backup_name = String::new();
    let mut volume_name = String::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "backup" => backup_name = value.into_owned(),
            "volume" => volume_name = value.into_owned(),
            _ => {}
        }
    }

    if volume_name.is_empty() {
        bail!("missing volume name in backup URL {backup_url}");
    }
    ensure_valid_name(&volume_name)?;
    if !backup_name.is_empty() {
        ensure_valid_name(&backup_name)?;
    }
    Ok((backup_name, volume_name, base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_matches_pattern() {
        for good in ["vol-1", "pvc-2f9a", "a2", "Backup_01.x"] {
            assert!(validate_name(good), "{good} should be accepted");
        }
        for bad in ["", "a", "-3-vol", "_x1", "vol 1", "vol/1", ".hidden"] {
            assert!(!validate_name(bad), "{bad} should be rejected");
        }
    }

    #[test]
    fn encode_decode_backup_url_roundtrip() {
        let cases = [
            (
                "vol-1",
                "",
                "s3://backupstore@minio/",
                "s3://backupstore@minio/?volume=vol-1",
            ),
            (
                "vol-2",
                "backup-2",
                "s3://backupstore@minio/",
                "s3://backupstore@minio/?backup=backup-2&volume=vol-2",
            ),
            (
                "vol-6",
                "backup-6",
                "nfs://server.local:/opt/backupstore?nfsOptions=soft,timeo=150",
                "nfs://server.local:/opt/backupstore?backup=backup-6&volume=vol-6",
            ),
            (
                "vol-7",
                "backup-7",
                "nfs://server.local:/opt/backupstore?",
                "nfs://server.local:/opt/backupstore?backup=backup-7&volume=vol-7",
            ),
        ];

        for (volume, backup, dest, expected) in cases {
            let encoded = encode_backup_url(backup, volume, dest);
            assert_eq!(encoded, expected);

            let (got_backup, got_volume, got_dest) =
                decode_backup_url(&encoded).expect("decode should succeed");
            assert_eq!(got_backup, backup);
            assert_eq!(got_volume, volume);
            assert_eq!(got_dest, dest.split('?').next().unwrap());
        }
    }

    #[test]
    fn decode_rejects_invalid_names() {
        let url = encode_backup_url("-4-backup", "vol-4", "s3://store/");
        assert!(decode_backup_url(&url).is_err());

        let url = encode_backup_url("backup-3", "-3-vol", "s3://store/");
        assert!(decode_backup_url(&url).is_err());
    }

    #[test]
    fn decode_requires_volume() {
        assert!(decode_backup_url("s3://store/?backup=b-1").is_err());
    }

    #[test]
    fn volume_paths_are_sharded_by_name_checksum() {
        let path = volume_path("test-vol");
        assert!(path.starts_with("backupstore/volumes/"));
        assert!(path.ends_with("/test-vol"));
        let segments: Vec<&str> = path.split('/').collect();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[2].len(), 2);
        assert_eq!(segments[3].len(), 2);
    }

    #[test]
    fn block_paths_are_sharded_by_checksum() {
        let cs = crate::data::hash::checksum(b"block data");
        let path = block_path("test-vol", &cs);
        assert!(path.ends_with(&format!("/{}/{}/{cs}.blk", &cs[0..2], &cs[2..4])));
    }

    #[test]
    fn volume_config_serializes_sizes_as_strings() {
        let volume = Volume {
            name: "vol-1".to_string(),
            size: 18 * 1024 * 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            created_time: now(),
            compression_method: CompressionMethod::Lz4,
            ..Default::default()
        };
        let raw = serde_json::to_value(&volume).expect("serialize should succeed");
        assert_eq!(raw["Size"], serde_json::json!("18874368"));
        assert_eq!(raw["CompressionMethod"], serde_json::json!("lz4"));

        let parsed: Volume = serde_json::from_value(raw).expect("parse should succeed");
        assert_eq!(parsed.size, volume.size);
        assert_eq!(parsed.compression_method, CompressionMethod::Lz4);
    }

    #[test]
    fn legacy_volume_config_defaults() {
        let parsed: Volume =
            serde_json::from_str(r#"{"Name":"vol-legacy","Size":"1048576"}"#)
                .expect("parse should succeed");
        assert_eq!(parsed.effective_block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(parsed.compression_method, CompressionMethod::None);
    }

    #[test]
    fn in_progress_backup_detection() {
        let mut backup = Backup {
            name: "backup-1".to_string(),
            ..Default::default()
        };
        assert!(is_backup_in_progress(&backup));

        backup.snapshot_name = "snap-1".to_string();
        backup.created_time = now();
        assert!(!is_backup_in_progress(&backup));
    }

    #[test]
    fn generated_names_validate() {
        let name = generate_name("backup");
        assert!(name.starts_with("backup-"));
        assert!(validate_name(&name));
        assert_ne!(generate_name("backup"), generate_name("backup"));
    }
}
