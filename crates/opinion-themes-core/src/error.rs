//! Error kinds for the clustering pipeline.
//!
//! Three kinds drive the run policy:
//!
//! | Kind | Policy |
//! |------|--------|
//! | [`ConfigurationError`] | fatal, abort before any write |
//! | [`ProviderError`] | retry with backoff, then skip the item (or fall back to a default title) |
//! | [`StoreError`] | fatal to the run, roll back every planned write |
//!
//! [`PipelineError`] wraps all three so `?` works across the stages.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("missing required configuration: {0}")]
    Missing(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("vector dimensionality mismatch: expected {expected}, got {actual} ({context})")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },
}

/// Failure of an embedding or title-generation call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("provider credential not set: {0}")]
    MissingCredential(String),

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("provider call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Rate limits, server errors, timeouts, and transport failures are
    /// transient. Everything else fails the call immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Transport(_) | ProviderError::Timeout { .. } => true,
            ProviderError::Disabled
            | ProviderError::MissingCredential(_)
            | ProviderError::InvalidResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("opinion {opinion_id} is missing or already clustered")]
    Conflict { opinion_id: i64 },

    #[error("cluster {0} does not exist")]
    UnknownCluster(i64),

    #[error("injected write failure: {0}")]
    Injected(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Provider(_) => "provider",
            PipelineError::Store(_) => "store",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Http {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Http {
            status: 401,
            body: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Timeout { secs: 30 }.is_retryable());
        assert!(!ProviderError::Disabled.is_retryable());
    }

    #[test]
    fn test_pipeline_error_kind() {
        let err: PipelineError = StoreError::UnknownCluster(7).into();
        assert_eq!(err.kind(), "store");
        assert_eq!(err.to_string(), "cluster 7 does not exist");
    }
}
