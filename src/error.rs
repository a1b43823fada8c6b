//! Error types for Agentic Assist.

use std::time::Duration;

use crate::pipeline::orchestrator::BatchReport;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// LLM completion errors.
///
/// Every variant is recoverable at message scope: the classifier degrades to
/// `no_action` and the composer discards the draft.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Provider {provider} refused the request: {reason}")]
    Refused { provider: String, reason: String },

    #[error("Response violated the {contract} contract: {reason}")]
    ContractViolation { contract: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Credentials are missing or expired. Batch-fatal; refreshing them is
    /// the caller's job.
    #[error("Authentication failed for mail provider {provider}: {reason}")]
    AuthFailed { provider: String, reason: String },

    #[error("Mail provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Mail provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Mail provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid draft: {0}")]
    InvalidDraft(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Whether this error must abort the rest of the batch.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }
}

/// Raised when a raw payload cannot become a `Message`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("message {provider_id} is not a readable MIME message")]
    Unreadable { provider_id: String },

    #[error("message {provider_id} could not be fetched: {reason}")]
    FetchFailed { provider_id: String, reason: String },

    #[error("message {provider_id} is missing the {header} header")]
    MissingHeader {
        provider_id: String,
        header: &'static str,
    },

    #[error("message {provider_id} has an unparsable {header} header")]
    InvalidHeader {
        provider_id: String,
        header: &'static str,
    },
}

/// Pipeline-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetching unread messages failed: {0}")]
    Fetch(ProviderError),

    /// A batch-fatal provider error stopped the run. The partial report
    /// still lists every draft created before the abort.
    #[error("Batch aborted: {source}")]
    Aborted {
        report: Box<BatchReport>,
        #[source]
        source: ProviderError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_is_batch_fatal() {
        let err = ProviderError::AuthFailed {
            provider: "gmail".into(),
            reason: "token expired".into(),
        };
        assert!(err.is_batch_fatal());

        let err = ProviderError::RateLimited {
            provider: "gmail".into(),
            retry_after: None,
        };
        assert!(!err.is_batch_fatal());
    }

    #[test]
    fn parse_error_message_is_human_readable() {
        let err = ParseError::MissingHeader {
            provider_id: "m-1".into(),
            header: "Message-ID",
        };
        assert_eq!(err.to_string(), "message m-1 is missing the Message-ID header");
    }
}
