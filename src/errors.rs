//! Shared error taxonomy.
//!
//! Every module boundary returns one of these typed errors rather than a
//! stringly-typed failure. The HTTP edge (`routes`) is the only place that
//! converts an error into the public JSON envelope.

use thiserror::Error;

/// Failure classification shared by every provider adapter (§7).
///
/// `retryable` and `kind` together drive the router's fallback decision
/// (`router::RETRYABLE_KINDS`) and the circuit breaker's failure count
/// (only a subset of kinds trip the breaker, see `circuit_breaker`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    UsageLimit,
    ServerError,
    ClientError,
    Timeout,
    NetworkError,
    BedrockAuthError,
    BedrockQuotaExceeded,
    BedrockValidation,
    BedrockModelError,
    BedrockUnavailable,
}

impl ErrorKind {
    /// Whether this kind counts toward the per-key circuit breaker window (§4.2).
    pub fn trips_circuit_breaker(self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::NetworkError
                | ErrorKind::BedrockUnavailable
        )
    }

    /// The public `error.type` string returned to clients (§6 table).
    pub fn public_type(self) -> &'static str {
        match self {
            ErrorKind::RateLimit | ErrorKind::UsageLimit | ErrorKind::BedrockQuotaExceeded => {
                "rate_limit_error"
            }
            ErrorKind::ServerError | ErrorKind::NetworkError | ErrorKind::BedrockModelError => {
                "api_error"
            }
            ErrorKind::ClientError | ErrorKind::BedrockValidation => "invalid_request_error",
            ErrorKind::Timeout | ErrorKind::BedrockUnavailable => "overloaded_error",
            ErrorKind::BedrockAuthError => "authentication_error",
        }
    }
}

/// Error returned by `auth::Authenticator::authenticate`.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown or revoked access key")]
    KeyNotFound,
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// Error returned when the circuit breaker rejects a call outright.
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit open for access key {access_key_id}, retry after {retry_after_secs}s")]
    Open {
        access_key_id: uuid::Uuid,
        retry_after_secs: u64,
    },
}

/// Error surfaced by a `ProviderAdapter` call (§4.3).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub http_status: u16,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, http_status: u16, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Timeout
                | ErrorKind::NetworkError
                | ErrorKind::BedrockUnavailable
        );
        Self {
            kind,
            http_status,
            message: message.into(),
            retryable,
        }
    }
}

/// Error returned by the store (`db`).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found")]
    NotFound,
    #[error("unsupported database url scheme")]
    UnsupportedScheme,
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error returned by the key material cache / KMS seam (C9, A4).
#[derive(Debug, Error)]
pub enum KeyMaterialError {
    #[error("no bedrock key configured for this access key")]
    NoKeyConfigured,
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
}

/// Top-level error the router can surface to the HTTP edge.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("service unavailable and no fallback configured")]
    NoFallback,
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Provider(e) => e.kind,
            RouterError::NoFallback => ErrorKind::BedrockUnavailable,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            RouterError::Provider(e) => e.http_status,
            RouterError::NoFallback => 503,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RouterError::Provider(e) => e.message.clone(),
            RouterError::NoFallback => {
                "Service unavailable and no fallback configured".to_string()
            }
        }
    }
}
