//! Error taxonomy shared by ingestion and query paths.
//!
//! Each variant maps to one recovery policy:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | [`TransientService`](LodestoneError::TransientService) | retried with backoff, then fails the batch |
//! | [`PermanentBatch`](LodestoneError::PermanentBatch) | chunk skipped and counted, job continues |
//! | [`SchemaMismatch`](LodestoneError::SchemaMismatch) | record rejected, job continues |
//! | [`ScopeResolution`](LodestoneError::ScopeResolution) | surfaced to the caller |
//! | [`Storage`](LodestoneError::Storage) | surfaced on queries, retried once on ingestion |
//! | [`NoAccessibleData`](LodestoneError::NoAccessibleData) | surfaced on queries |
//! | [`ServiceUnavailable`](LodestoneError::ServiceUnavailable) | surfaced on queries |

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LodestoneError {
    /// A model service call failed or timed out and may succeed on retry.
    #[error("transient {service} error: {message}")]
    TransientService { service: String, message: String },

    /// A model service rejected the input; retrying will not help.
    #[error("permanent {service} error: {message}")]
    PermanentBatch { service: String, message: String },

    /// A source record could not be mapped onto the canonical chunk.
    #[error("schema mismatch in {record_kind} record: {message}")]
    SchemaMismatch {
        record_kind: &'static str,
        message: String,
    },

    /// Unknown project/dataset in strict mode, or a conflicting scope.
    #[error("scope resolution failed: {0}")]
    ScopeResolution(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The query resolved to an empty set of datasets.
    #[error("no accessible data for project '{project}'")]
    NoAccessibleData { project: String },

    /// A service required to answer the query could not be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LodestoneError {
    pub fn transient(service: impl Into<String>, message: impl ToString) -> Self {
        Self::TransientService {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn permanent(service: impl Into<String>, message: impl ToString) -> Self {
        Self::PermanentBatch {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(err: impl ToString) -> Self {
        Self::Storage(err.to_string())
    }

    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientService { .. })
    }
}

pub type Result<T> = std::result::Result<T, LodestoneError>;
