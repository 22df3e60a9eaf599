use thiserror::Error;

/// Typed error kinds surfaced by the store. Most call sites wrap these in
/// `anyhow::Error` chains with context; callers that need to branch on a
/// kind recover it with [`as_store_error`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("checksum verification failed for block {checksum}: computed {computed}")]
    ChecksumMismatch { checksum: String, computed: String },

    #[error("cannot decode block {checksum} with method {method} or its alternate")]
    CodecMismatch { checksum: String, method: String },

    #[error("failed to acquire {lock_kind} lock for volume {volume} within {timeout_secs}s")]
    LockTimeout {
        volume: String,
        lock_kind: &'static str,
        timeout_secs: u64,
    },

    #[error("config conflict for volume {volume}: {detail}")]
    ConfigConflict { volume: String, detail: String },

    #[error("backup {0} is still in progress")]
    BackupInProgress(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{} object removals failed: {}", errors.len(), errors.join("; "))]
    Aggregated { errors: Vec<String> },
}

pub fn as_store_error(err: &anyhow::Error) -> Option<&StoreError> {
    err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(as_store_error(err), Some(StoreError::NotFound(_)))
}

pub fn is_canceled(err: &anyhow::Error) -> bool {
    matches!(as_store_error(err), Some(StoreError::Canceled))
}

/// Transient failures are anything without a typed kind attached: network
/// hiccups, 5xx responses, interrupted reads. Typed kinds are final.
pub fn is_transient(err: &anyhow::Error) -> bool {
    as_store_error(err).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_kind_survives_context_wrapping() {
        let err = anyhow::Error::from(StoreError::NotFound("volume v1".to_string()))
            .context("loading volume config");
        assert!(is_not_found(&err));
        assert!(!is_canceled(&err));
        assert!(!is_transient(&err));
    }

    #[test]
    fn plain_errors_count_as_transient() {
        let err = anyhow::anyhow!("connection reset by peer");
        assert!(is_transient(&err));
        assert!(!is_not_found(&err));
    }

    #[test]
    fn aggregated_error_reports_count() {
        let err = StoreError::Aggregated {
            errors: vec!["a".to_string(), "b".to_string()],
        };
        assert!(err.to_string().starts_with("2 object removals failed"));
    }
}
