//! Error types for jobq.

use thiserror::Error;

use crate::model::JobId;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing store could not serve the request. Callers retry with backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Idempotent setup found the object already in place.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("source record {0} is missing, nothing to requeue")]
    SourceRecordMissing(JobId),

    #[error("no pending entry for job {0}")]
    UnknownPendingEntry(JobId),

    #[error("malformed record: field `{field}`: {reason}")]
    MalformedRecord { field: String, reason: String },

    #[error("requeue of {0} found a half-applied state")]
    PartialRequeueFailure(JobId),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid job id: {0:?}")]
    InvalidJobId(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should terminate a worker process.
    ///
    /// Only connectivity failures and broken invariants are fatal; missing
    /// data and "already done" conditions are handled where they occur.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::InvariantViolation(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_string()),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::StoreUnavailable(format!("migration failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_and_invariant_errors_are_fatal() {
        assert!(Error::StoreUnavailable("down".into()).is_fatal());
        assert!(Error::InvariantViolation("two entries".into()).is_fatal());
        assert!(!Error::UnknownPendingEntry(JobId::new(1, 0)).is_fatal());
        assert!(!Error::SourceRecordMissing(JobId::new(1, 0)).is_fatal());
        assert!(!Error::InvalidJobId("18446744073709551615-0".into()).is_fatal());
        assert!(!Error::InvalidArgument("count".into()).is_fatal());
        assert!(!Error::malformed("payload", "not an object").is_fatal());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
