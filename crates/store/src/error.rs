//! Store error types

use crate::Version;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store rejected the write due to rate limiting. Transient;
    /// callers retry with exponential backoff.
    #[error("write rate limited by the record store")]
    RateLimited,

    /// The store could not be reached. Transient.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// Compare-and-swap failure: the record changed since it was read.
    /// Callers must re-read and re-apply rather than overwrite.
    #[error("version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<Version>,
        found: Option<Version>,
    },

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether a retry of the same operation can be expected to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::RateLimited | StoreError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::RateLimited.is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::VersionConflict {
            key: "account/a".into(),
            expected: Some(1),
            found: Some(2),
        }
        .is_transient());
    }
}
