use std::path::PathBuf;

use thiserror::Error;

/// Engine-wide error kinds.
///
/// Per-item failures inside pipelines are carried as sentinel variants on the
/// channels and aggregated into the operation result; only the kinds below
/// unwind through `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// Misconfiguration reported verbatim to the operator.
    #[error("{0}")]
    UserInformation(String),

    /// Destination contents disagree with the catalog.
    #[error("remote listing disagrees with the catalog: {0}")]
    RemoteList(String),

    /// A catalog invariant failed; the operation aborts and rolls back.
    #[error("catalog consistency violated: {0}")]
    DatabaseConsistency(String),

    /// Compression or encryption transform failure.
    #[error("codec failure in {algorithm}: {message}")]
    Codec {
        algorithm: &'static str,
        message: String,
    },

    /// The cancellation token tripped.
    #[error("operation cancelled")]
    Cancelled,

    /// The catalog was rebuilt from an incomplete remote listing.
    #[error("catalog was only partially recreated: {0}")]
    PartialRecreate(String),

    /// Network-class failure that exhausted its retry budget.
    #[error("remote operation failed after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Hash mismatch on a block or file.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// Rule violation, e.g. mixing path conventions across operating systems.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Missing or unreadable path with the failing location attached.
    #[error("I/O failure at {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Error::UserInformation(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Error::DatabaseConsistency(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Error::Integrity(message.into())
    }

    pub fn codec(algorithm: &'static str, message: impl ToString) -> Self {
        Error::Codec {
            algorithm,
            message: message.to_string(),
        }
    }

    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Path {
            path: path.into(),
            source,
        }
    }

    /// Process exit code reported for this error kind.
    ///
    /// 0 success, 1 warnings, 2 errors, 3 fatal, 50 user cancel; success and
    /// warnings are decided by the operation result, not an error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Cancelled => 50,
            Error::DatabaseConsistency(_) | Error::PartialRecreate(_) => 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Cancelled.exit_code(), 50);
        assert_eq!(Error::consistency("orphan block").exit_code(), 3);
        assert_eq!(Error::user("bad blocksize").exit_code(), 2);
    }

    #[test]
    fn test_messages_carry_context() {
        let err = Error::codec("zstd", "truncated frame");
        assert!(err.to_string().contains("zstd"));
        assert!(err.to_string().contains("truncated frame"));
    }
}
