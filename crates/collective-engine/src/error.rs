use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectiveError>;

/// Fatal error surface for the reduction engine (spec §7). These are raised
/// on the submission thread before a job is enqueued, or converted into a
/// non-OK [`crate::types::Status`] delivered through an entry callback once
/// a job has reached the finalizer.
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("Type {kind} is not supported in NCCL mode.")]
    UnsupportedType { kind: String },

    #[error("{op} failed: {provider_error}")]
    CollectiveRuntimeError { op: String, provider_error: String },

    #[error("{op} failed: {provider_error}")]
    TransportError { op: String, provider_error: String },
}

impl CollectiveError {
    pub fn unsupported_type(kind: impl Into<String>) -> Self {
        Self::UnsupportedType { kind: kind.into() }
    }

    pub fn collective_runtime(op: impl Into<String>, provider_error: impl Into<String>) -> Self {
        Self::CollectiveRuntimeError {
            op: op.into(),
            provider_error: provider_error.into(),
        }
    }

    pub fn transport(op: impl Into<String>, provider_error: impl Into<String>) -> Self {
        Self::TransportError {
            op: op.into(),
            provider_error: provider_error.into(),
        }
    }
}
