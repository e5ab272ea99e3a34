//! Plan adapter (C4, §4.4): pass-through HTTP client for the primary upstream.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{ByteStream, CountTokensResponse, InvokeResponse, PassThroughHeaders, ProviderAdapter};
use crate::{
    config::PlanConfig,
    errors::{ErrorKind, ProviderError},
    models::{RequestContext, Usage},
};

pub struct PlanAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PlanAdapter {
    pub fn new(config: &PlanConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(config.read_timeout_secs))
            .build()
            .expect("reqwest client builds with valid timeouts");

        Self {
            client,
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// §4.4: forward the client's pass-through headers, falling back to this
    /// adapter's own configured key/version when the client didn't send one
    /// (mirrors the teacher's provider default-credential fallback).
    fn build_request(
        &self,
        path: &str,
        body: &Value,
        headers: &PassThroughHeaders,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(
                "x-api-key",
                headers.x_api_key.as_deref().unwrap_or(&self.api_key),
            )
            .header(
                "anthropic-version",
                headers.anthropic_version.as_deref().unwrap_or("2023-06-01"),
            )
            .header("content-type", "application/json");

        if let Some(authorization) = &headers.authorization {
            req = req.header("authorization", authorization);
        }
        if let Some(beta) = &headers.anthropic_beta {
            req = req.header("anthropic-beta", beta);
        }

        req.json(body)
    }

    /// §4.4 status classification table.
    fn classify_status(status: StatusCode) -> Option<ErrorKind> {
        if status.is_success() {
            return None;
        }
        Some(match status.as_u16() {
            401 | 403 => ErrorKind::ClientError,
            400 | 422 => ErrorKind::ClientError,
            408 | 429 => ErrorKind::RateLimit,
            s if (500..600).contains(&s) => ErrorKind::ServerError,
            _ => ErrorKind::ClientError,
        })
    }

    fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
        if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::NetworkError
        }
    }
}

#[async_trait]
impl ProviderAdapter for PlanAdapter {
    async fn invoke(
        &self,
        _ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<InvokeResponse, ProviderError> {
        let response = self
            .build_request("/v1/messages", req, headers)
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(Self::classify_transport_error(&e), 503, e.to_string())
            })?;

        let status = response.status();
        if let Some(kind) = Self::classify_status(status) {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "upstream error".to_string());
            return Err(ProviderError::new(kind, status.as_u16(), message));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::new(ErrorKind::ServerError, 502, e.to_string()))?;

        let usage = body.get("usage").map(|u| Usage {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
            output_tokens: u
                .get("output_tokens")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            cache_read_input_tokens: u
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_i64()),
            cache_creation_input_tokens: u
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_i64()),
        });

        Ok(InvokeResponse { body, usage })
    }

    async fn stream(
        &self,
        _ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<ByteStream, ProviderError> {
        let response = self
            .build_request("/v1/messages", req, headers)
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(Self::classify_transport_error(&e), 503, e.to_string())
            })?;

        let status = response.status();
        if let Some(kind) = Self::classify_status(status) {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "upstream error".to_string());
            return Err(ProviderError::new(kind, status.as_u16(), message));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Box::pin(stream))
    }

    async fn count_tokens(
        &self,
        _ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<CountTokensResponse, ProviderError> {
        let response = self
            .build_request("/v1/messages/count_tokens", req, headers)
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(Self::classify_transport_error(&e), 503, e.to_string())
            })?;

        let status = response.status();
        if let Some(kind) = Self::classify_status(status) {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "upstream error".to_string());
            return Err(ProviderError::new(kind, status.as_u16(), message));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::new(ErrorKind::ServerError, 502, e.to_string()))?;

        Ok(CountTokensResponse {
            input_tokens: body.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        })
    }
}
