//! Typed error hierarchy for the orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `StoreError` — persistent store failures
//! - `ActionError` — state-machine action failures, including the structured
//!   merge-conflict and cancellation variants the engine and dispatcher
//!   branch on

use thiserror::Error;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Map a rusqlite constraint failure onto the typed variants, leaving
    /// everything else as a raw sqlite error.
    pub fn from_sqlite(err: rusqlite::Error, what: &str) -> Self {
        use rusqlite::ffi::ErrorCode;
        if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
            if e.code == ErrorCode::ConstraintViolation {
                let detail = msg.clone().unwrap_or_else(|| what.to_string());
                if detail.contains("FOREIGN KEY") {
                    return Self::ForeignKey(format!("{what}: {detail}"));
                }
                return Self::Conflict(format!("{what}: {detail}"));
            }
        }
        Self::Sqlite(err)
    }
}

/// Errors from state-machine actions and dispatched workers.
#[derive(Debug, Error)]
pub enum ActionError {
    /// A rebase hit merge conflicts. Drives the `paused` transition.
    #[error("merge conflicts in {} files", files.len())]
    Conflict { files: Vec<String> },

    /// The surrounding context was cancelled. Never treated as a failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    /// True when this error (or anything in its chain) is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Other(err) => err.chain().any(|c| c.downcast_ref::<Cancelled>().is_some()),
            _ => false,
        }
    }

    pub fn conflict_files(&self) -> Option<&[String]> {
        match self {
            Self::Conflict { files } => Some(files),
            _ => None,
        }
    }
}

/// Marker error for cancellation surfaced through `anyhow` chains.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_error_reports_file_count() {
        let err = ActionError::Conflict {
            files: vec!["a.rs".into(), "b.rs".into()],
        };
        assert_eq!(err.to_string(), "merge conflicts in 2 files");
        assert_eq!(err.conflict_files().unwrap().len(), 2);
    }

    #[test]
    fn cancellation_is_detected_directly() {
        assert!(ActionError::Cancelled.is_cancellation());
        let err = ActionError::Other(anyhow::anyhow!("boom"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn cancellation_is_detected_through_anyhow_chain() {
        let inner = anyhow::Error::new(Cancelled).context("while pushing branch");
        let err = ActionError::Other(inner);
        assert!(err.is_cancellation());
    }

    #[test]
    fn store_not_found_carries_key() {
        let err = StoreError::not_found("issue", 42);
        assert_eq!(err.to_string(), "issue 42 not found");
    }
}
