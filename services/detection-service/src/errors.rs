//! Error taxonomy for the detection pipeline (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("flow record malformed: {0}")]
    InputMalformed(String),

    #[error("detector {detector} failed: {source}")]
    DetectorFailure {
        detector: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("model client {client} unavailable")]
    ModelUnavailable { client: String },

    #[error("model client {client} failed: {source}")]
    ModelFailure {
        client: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("correlation stage failed: {0}")]
    CorrelationFailure(String),

    #[error("validation stage failed: {0}")]
    ValidationFailure(String),

    #[error("correlation state store unavailable: {0}")]
    StateStoreUnavailable(String),

    #[error("event publisher failed: {0}")]
    PublisherFailure(String),

    #[error("circuit breaker open for {0}")]
    BreakerOpen(String),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
