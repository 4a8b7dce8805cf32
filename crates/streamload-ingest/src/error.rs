//! Error taxonomy for the ingestion pipeline
//!
//! Only conditions that stop work for a whole source, entity or run are
//! errors. Per-field coercion defects, unresolvable keys and orphaned
//! references travel as data on records and quarantine entries instead.

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The source could not be opened or read at all
    #[error("Source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    /// No usable mapping table exists for the entity type
    #[error("No active field mapping for entity '{entity}': {reason}")]
    MappingFailure { entity: String, reason: String },

    /// A chunk transaction was rolled back
    #[error("Chunk {chunk_index} of '{entity}' failed to commit: {reason}")]
    ChunkCommitFailure {
        entity: String,
        chunk_index: u64,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Target store access outside of a chunk transaction
    #[error("Target store error: {0}")]
    Store(String),

    #[error("Quarantine sink error: {0}")]
    Quarantine(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn source_unavailable(source_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn mapping_failure(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MappingFailure {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn store(err: impl ToString) -> Self {
        Self::Store(err.to_string())
    }

    pub fn quarantine(err: impl ToString) -> Self {
        Self::Quarantine(err.to_string())
    }

    /// Whether this error halts the affected source or entity and stops
    /// scheduling of dependent entity types.
    ///
    /// Chunk failures and quarantine write failures are recoverable: the run
    /// records them and moves on.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::SourceUnavailable { .. }
            | IngestError::MappingFailure { .. }
            | IngestError::Configuration(_)
            | IngestError::Store(_)
            | IngestError::Cancelled => true,
            IngestError::ChunkCommitFailure { .. } | IngestError::Quarantine(_) => false,
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Store(err.to_string())
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Quarantine(err.to_string())
    }
}

impl From<figment::Error> for IngestError {
    fn from(err: figment::Error) -> Self {
        IngestError::Configuration(err.to_string())
    }
}
