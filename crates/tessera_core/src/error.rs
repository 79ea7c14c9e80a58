use thiserror::Error;

/// Sharding middleware errors.
///
/// Every operation in the crate returns this type so that callers can match
/// on the failure kind regardless of which backend produced it. Backend
/// driver errors are carried verbatim in the `Backend` variant.
#[derive(Debug, Error)]
pub enum ShardError {
    /// The configuration violates a load-time invariant.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The statement is syntactically valid SQL but not supported by the
    /// router (JOIN, subquery, unknown statement, unsupported SHOW variant).
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    /// A NULL was bound in the sharding-key position.
    #[error("sharding key is null")]
    ShardingKeyNull,

    /// The statement requires a resolved sharding key and none was found.
    #[error("sharding key is missing in query")]
    ShardingKeyMissing,

    /// The statement targets a table absent from the configuration.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A backend driver failed; the driver message is preserved verbatim.
    #[error("backend error: {0}")]
    Backend(String),

    /// A second distinct shard was enlisted while distributed transactions
    /// are disabled in the configuration.
    #[error("distributed transaction is disabled: cannot enlist {0}")]
    CrossShardTxForbidden(String),

    /// Commit failed before any shard committed. The transaction may be
    /// rolled back and retried.
    #[error("commit aborted before any shard committed: {0}")]
    CommitRecoverable(String),

    /// Commit failed after at least one shard committed. The system is now
    /// inconsistent across shards; the failed writes must be replayed.
    #[error("commit failed after {committed} write(s) were committed: {message}")]
    CommitCritical { committed: usize, message: String },

    /// Operation deliberately not implemented (e.g. qualified all-shard
    /// DELETE) or not supported by the backend driver.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Filesystem I/O error (configuration loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShardError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedQuery(msg.into())
    }

    pub fn backend(msg: impl std::fmt::Display) -> Self {
        Self::Backend(msg.to_string())
    }

    /// Whether a failed commit left the shards consistent (rollback + retry
    /// is safe).
    pub fn is_recoverable_commit(&self) -> bool {
        matches!(self, Self::CommitRecoverable(_))
    }
}

/// Collapse broadcast sub-errors into one error, joining messages with `:`.
///
/// Returns `Ok(())` when the list is empty, the error itself when there is
/// exactly one.
pub fn join_errors(errors: Vec<ShardError>) -> Result<(), ShardError> {
    let mut errors = errors;
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(":");
            Err(ShardError::Backend(joined))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_errors_empty_is_ok() {
        assert!(join_errors(Vec::new()).is_ok());
    }

    #[test]
    fn join_errors_single_passes_through() {
        let err = join_errors(vec![ShardError::ShardingKeyMissing]).unwrap_err();
        assert!(matches!(err, ShardError::ShardingKeyMissing));
    }

    #[test]
    fn join_errors_joins_with_colon() {
        let err = join_errors(vec![
            ShardError::Backend("shard1 down".to_string()),
            ShardError::Backend("shard2 down".to_string()),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("shard1 down"));
        assert!(msg.contains("shard2 down"));
        assert!(msg.contains(':'));
    }
}
