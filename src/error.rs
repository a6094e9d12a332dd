//! Core error taxonomy (spec §7): validation, not_found, transient_io,
//! overload, protocol. Repository and DLQ each surface their own typed
//! error; ingestion never propagates these past a single record/batch.

use thiserror::Error;

/// Errors surfaced by the [`crate::repository::Repository`] trait.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl RepositoryError {
    pub fn status_category(&self) -> &'static str {
        match self {
            RepositoryError::TransientIo(_) => "transient_io",
            RepositoryError::ConstraintViolation(_) => "constraint_violation",
            RepositoryError::NotFound(_) => "not_found",
            RepositoryError::Serialization(_) => "serialization",
            RepositoryError::Validation(_) => "validation",
        }
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => {
                RepositoryError::NotFound("no matching row".into())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                RepositoryError::ConstraintViolation(e.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                RepositoryError::TransientIo(e.to_string())
            }
            _ => RepositoryError::Serialization(e.to_string()),
        }
    }
}

/// Errors surfaced by the dead-letter queue (spec §4.3).
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("dlq I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced out of a single OTLP export call (spec §4.5).
/// A sub-stage failure here never poisons sibling resource groups; this
/// type only describes what the *final* gRPC response reports.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to persist spans: {0}")]
    SpanWrite(#[source] RepositoryError),
    #[error("failed to persist logs: {0}")]
    LogWrite(#[source] RepositoryError),
}
