//! Bedrock adapter (C5, §4.5) — the hard part.
//!
//! Ties together credential load-and-decrypt (C9 + A4), Anthropic<->Converse
//! translation (`convert`), AWS SigV4 signing (`sign`), and binary
//! event-stream decoding (`stream`) behind the same `ProviderAdapter`
//! contract the Plan adapter implements. Structurally this mirrors the
//! teacher's `providers::bedrock::mod` — a thin adapter struct holding a
//! shared `reqwest::Client`, delegating translation and signing to sibling
//! modules rather than inlining them.

mod convert;
mod sign;
mod stream;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{ByteStream, CountTokensResponse, InvokeResponse, PassThroughHeaders, ProviderAdapter};
use crate::{
    config::BedrockConfig,
    errors::{ErrorKind, ProviderError},
    keycache::KeyMaterialCache,
    models::RequestContext,
};

pub struct BedrockAdapter {
    client: reqwest::Client,
    config: BedrockConfig,
    keycache: Arc<KeyMaterialCache>,
}

impl BedrockAdapter {
    pub fn new(config: BedrockConfig, keycache: Arc<KeyMaterialCache>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("reqwest client builds with valid timeouts");
        Self {
            client,
            config,
            keycache,
        }
    }

    fn endpoint(region: &str, model: &str, streaming: bool) -> String {
        let op = if streaming { "converse-stream" } else { "converse" };
        format!("https://bedrock-runtime.{region}.amazonaws.com/model/{model}/{op}")
    }

    /// §4.5 "Signing & endpoint": load the tenant's cached/decrypted
    /// credential and sign a request body against the Converse endpoint.
    async fn signed_request(
        &self,
        ctx: &RequestContext,
        body: &[u8],
        streaming: bool,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let credentials = self.keycache.get(ctx.access_key_id).await.map_err(|e| {
            ProviderError::new(ErrorKind::BedrockAuthError, 401, e.to_string())
        })?;

        let url = Self::endpoint(&ctx.bedrock_region, &ctx.bedrock_model, streaming);
        let content_type = ("content-type", "application/json");
        let headers = [content_type];

        let signed_headers = sign::sign_request(
            &credentials,
            &ctx.bedrock_region,
            "POST",
            &url,
            &headers,
            body,
        )
        .map_err(|e| ProviderError::new(ErrorKind::BedrockAuthError, 500, e.to_string()))?;

        let mut req = self.client.post(&url).header("content-type", "application/json");
        for (name, value) in signed_headers {
            req = req.header(name, value);
        }
        Ok(req.body(body.to_vec()))
    }

    /// §4.5 "Error classification" table.
    fn classify_error(status: StatusCode, body: &str) -> ErrorKind {
        let error_type = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.get("__type")
                    .or_else(|| v.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        if error_type.contains("AccessDeniedException") || error_type.contains("UnauthorizedOperation") {
            return ErrorKind::BedrockAuthError;
        }
        if error_type.contains("ThrottlingException") || error_type.contains("ServiceQuotaExceededException") {
            return ErrorKind::BedrockQuotaExceeded;
        }
        if error_type.contains("ValidationException") {
            return ErrorKind::BedrockValidation;
        }
        if error_type.contains("ModelErrorException") || error_type.contains("ModelStreamErrorException") {
            return ErrorKind::BedrockModelError;
        }
        if error_type.contains("ServiceUnavailableException") || error_type.contains("InternalServerException") {
            return ErrorKind::BedrockUnavailable;
        }

        match status.as_u16() {
            403 => ErrorKind::BedrockAuthError,
            429 => ErrorKind::BedrockQuotaExceeded,
            400 | 422 => ErrorKind::BedrockValidation,
            s if (500..600).contains(&s) => ErrorKind::BedrockUnavailable,
            _ => ErrorKind::BedrockValidation,
        }
    }

    fn error_http_status(kind: ErrorKind) -> u16 {
        match kind {
            ErrorKind::BedrockAuthError => 401,
            ErrorKind::BedrockQuotaExceeded => 429,
            ErrorKind::BedrockValidation => 400,
            ErrorKind::BedrockModelError => 502,
            ErrorKind::BedrockUnavailable => 503,
            _ => 500,
        }
    }
}

#[async_trait]
impl ProviderAdapter for BedrockAdapter {
    async fn invoke(
        &self,
        ctx: &RequestContext,
        req: &Value,
        _headers: &PassThroughHeaders,
    ) -> Result<InvokeResponse, ProviderError> {
        let converse_request = convert::build_converse_request(req);
        let body = serde_json::to_vec(&converse_request)
            .map_err(|e| ProviderError::new(ErrorKind::BedrockValidation, 400, e.to_string()))?;

        let response = self
            .signed_request(ctx, &body, false)
            .await?
            .send()
            .await
            .map_err(|e| ProviderError::new(ErrorKind::NetworkError, 503, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let kind = Self::classify_error(status, &text);
            return Err(ProviderError::new(kind, Self::error_http_status(kind), text));
        }

        let converse_response: types::ConverseResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(ErrorKind::BedrockModelError, 502, e.to_string()))?;

        let (body, usage) = convert::parse_converse_response(&converse_response, &ctx.bedrock_model);
        Ok(InvokeResponse {
            body,
            usage: Some(usage),
        })
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        req: &Value,
        _headers: &PassThroughHeaders,
    ) -> Result<ByteStream, ProviderError> {
        let converse_request = convert::build_converse_request(req);
        let body = serde_json::to_vec(&converse_request)
            .map_err(|e| ProviderError::new(ErrorKind::BedrockValidation, 400, e.to_string()))?;

        let response = self
            .signed_request(ctx, &body, true)
            .await?
            .send()
            .await
            .map_err(|e| ProviderError::new(ErrorKind::NetworkError, 503, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let kind = Self::classify_error(status, &text);
            return Err(ProviderError::new(kind, Self::error_http_status(kind), text));
        }

        let model = ctx.bedrock_model.clone();
        let byte_stream = response.bytes_stream();
        let translated = stream::BedrockToAnthropicStream::new(byte_stream, model, &self.config);

        Ok(Box::pin(translated))
    }

    async fn count_tokens(
        &self,
        _ctx: &RequestContext,
        req: &Value,
        _headers: &PassThroughHeaders,
    ) -> Result<CountTokensResponse, ProviderError> {
        // Bedrock's Converse API has no dedicated token-counting endpoint;
        // approximate from the serialized request the way a rough client-side
        // estimator would (~4 bytes/token), since over- or under-counting by
        // a small margin here only affects a UI hint, not billing.
        let converse_request = convert::build_converse_request(req);
        let serialized = serde_json::to_vec(&converse_request).unwrap_or_default();
        let estimated = (serialized.len() as i64 / 4).max(1);
        Ok(CountTokensResponse {
            input_tokens: estimated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_selects_converse_or_stream_op() {
        assert_eq!(
            BedrockAdapter::endpoint("us-east-1", "claude-3", false),
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/claude-3/converse"
        );
        assert_eq!(
            BedrockAdapter::endpoint("us-east-1", "claude-3", true),
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/claude-3/converse-stream"
        );
    }

    #[test]
    fn classifies_known_exception_types() {
        let body = r#"{"__type":"com.amazon.coral#ThrottlingException"}"#;
        assert_eq!(
            BedrockAdapter::classify_error(StatusCode::TOO_MANY_REQUESTS, body),
            ErrorKind::BedrockQuotaExceeded
        );

        let body = r#"{"__type":"ValidationException","message":"bad input"}"#;
        assert_eq!(
            BedrockAdapter::classify_error(StatusCode::BAD_REQUEST, body),
            ErrorKind::BedrockValidation
        );
    }

    #[test]
    fn falls_back_to_status_code_when_type_unrecognized() {
        assert_eq!(
            BedrockAdapter::classify_error(StatusCode::SERVICE_UNAVAILABLE, "{}"),
            ErrorKind::BedrockUnavailable
        );
    }
}
