//! Provider adapter abstraction (C3, §4.3).
//!
//! Both the Plan adapter and the Bedrock adapter implement this trait; the
//! router is written only against it. Grounded on the teacher's
//! `providers::mod` dispatch pattern, narrowed from the six-odd payload
//! variants OpenAI-compatible providers need down to the single Anthropic
//! request/response shape this proxy relays.

pub mod bedrock;
pub mod plan;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::{
    errors::ProviderError,
    models::{RequestContext, Usage},
};

/// Unary response from an adapter.
pub struct InvokeResponse {
    pub body: Value,
    pub usage: Option<Usage>,
}

/// Client-supplied headers the Plan adapter forwards verbatim (§4.4
/// "preserving the set of pass-through headers"). The Bedrock adapter
/// ignores these — it authenticates with the tenant's own decrypted
/// credential, never the client's.
#[derive(Debug, Clone, Default)]
pub struct PassThroughHeaders {
    pub x_api_key: Option<String>,
    pub authorization: Option<String>,
    pub anthropic_version: Option<String>,
    pub anthropic_beta: Option<String>,
}

/// A stream of already-SSE-framed bytes (`data: {...}\n\n`), ready to relay
/// to the client verbatim.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Debug, Clone, Default)]
pub struct CountTokensResponse {
    pub input_tokens: i64,
}

/// Uniform contract every upstream adapter exposes (§4.3).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn invoke(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<InvokeResponse, ProviderError>;

    async fn stream(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<ByteStream, ProviderError>;

    async fn count_tokens(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<CountTokensResponse, ProviderError>;

    /// Release pooled HTTP resources. A no-op for adapters built on a
    /// process-wide shared `reqwest::Client`.
    async fn close(&self) {}
}
