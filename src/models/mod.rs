//! Core data model (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-request context produced by the Authenticator (§3, §4.1).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Uuid,
    pub access_key_id: Uuid,
    /// First few characters of the raw key, safe to log.
    pub access_key_prefix: String,
    pub bedrock_region: String,
    pub bedrock_model: String,
    pub has_bedrock_key: bool,
}

/// Status of a persisted `AccessKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKeyStatus {
    Active,
    Revoked,
}

/// Persisted per-tenant access key (§3).
///
/// The raw key is never stored; `key_hash` is a salted fingerprint
/// (`auth::fingerprint`).
#[derive(Debug, Clone)]
pub struct AccessKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub status: AccessKeyStatus,
    pub bedrock_region: String,
    pub bedrock_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted, at most one per `AccessKey`. Plaintext never stored or logged.
#[derive(Debug, Clone)]
pub struct BedrockKey {
    pub access_key_id: Uuid,
    pub ciphertext: Vec<u8>,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which upstream served (or attempted to serve) the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Plan,
    Bedrock,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Plan => "plan",
            Provider::Bedrock => "bedrock",
        }
    }
}

/// Token usage reported by an upstream for a single request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Outcome of routing a single request (§3 ProxyResponse).
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub success: bool,
    pub unary_body: Option<serde_json::Value>,
    pub usage: Option<Usage>,
    pub provider: Provider,
    pub is_fallback: bool,
    pub http_status: u16,
    pub error_kind: Option<crate::errors::ErrorKind>,
    pub error_message: Option<String>,
}

/// Append-only persisted usage record (§3, §4.8).
#[derive(Debug, Clone)]
pub struct UsageRow {
    pub id: Uuid,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Uuid,
    pub access_key_id: Uuid,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub provider: Provider,
    pub is_fallback: bool,
    pub latency_ms: i64,
}

/// The five aggregation granularities maintained per access key (§3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl BucketType {
    pub const ALL: [BucketType; 5] = [
        BucketType::Minute,
        BucketType::Hour,
        BucketType::Day,
        BucketType::Week,
        BucketType::Month,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BucketType::Minute => "minute",
            BucketType::Hour => "hour",
            BucketType::Day => "day",
            BucketType::Week => "week",
            BucketType::Month => "month",
        }
    }
}

/// Upsert target keyed by `(bucket_type, bucket_start, user_id, access_key_id)`.
#[derive(Debug, Clone)]
pub struct UsageAggregateDelta {
    pub bucket_type: BucketType,
    pub bucket_start: DateTime<Utc>,
    pub user_id: Uuid,
    pub access_key_id: Uuid,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub request_count: i64,
}
