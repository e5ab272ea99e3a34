//! Router (C6, §4.6): primary-then-fallback orchestration.
//!
//! Grounded on `providers::fallback`'s `FallbackDecision`/`classify_*`
//! functions for the retry/no-retry split, narrowed to the spec's single
//! two-tier chain (Plan primary, Bedrock fallback) rather than the
//! teacher's N-deep model/provider fallback list.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::{
    circuit_breaker::CircuitBreaker,
    errors::{ErrorKind, ProviderError, RouterError},
    models::{Provider, ProxyResponse, RequestContext},
    providers::{PassThroughHeaders, ProviderAdapter},
};

/// §4.6 `RETRYABLE_KINDS`.
fn is_fallback_eligible(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::RateLimit
            | ErrorKind::ServerError
            | ErrorKind::Timeout
            | ErrorKind::NetworkError
            | ErrorKind::BedrockUnavailable
    )
}

pub struct Router {
    circuit_breaker: Arc<CircuitBreaker>,
    plan: Arc<dyn ProviderAdapter>,
    bedrock: Arc<dyn ProviderAdapter>,
}

impl Router {
    pub fn new(
        circuit_breaker: Arc<CircuitBreaker>,
        plan: Arc<dyn ProviderAdapter>,
        bedrock: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            circuit_breaker,
            plan,
            bedrock,
        }
    }

    /// §4.6 unary routing algorithm.
    pub async fn route(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<ProxyResponse, RouterError> {
        let key = ctx.access_key_id;

        if !self.circuit_breaker.is_open(key) {
            match self.plan.invoke(ctx, req, headers).await {
                Ok(response) => {
                    self.circuit_breaker.record_success(key);
                    return Ok(ProxyResponse {
                        success: true,
                        unary_body: Some(response.body),
                        usage: response.usage,
                        provider: Provider::Plan,
                        is_fallback: false,
                        http_status: 200,
                        error_kind: None,
                        error_message: None,
                    });
                }
                Err(err) => {
                    self.circuit_breaker.record_failure(key, err.kind);
                    if !err.retryable || !is_fallback_eligible(err.kind) {
                        return Ok(plan_failure_response(&err));
                    }
                    return self.fallback_or_fail(ctx, req, headers, true).await;
                }
            }
        }

        info!(
            access_key_id = %key,
            "plan_skipped_circuit_open"
        );
        self.fallback_or_fail(ctx, req, headers, false).await
    }

    async fn fallback_or_fail(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
        primary_was_attempted: bool,
    ) -> Result<ProxyResponse, RouterError> {
        if !ctx.has_bedrock_key {
            return Err(RouterError::NoFallback);
        }

        match self.bedrock.invoke(ctx, req, headers).await {
            Ok(response) => Ok(ProxyResponse {
                success: true,
                unary_body: Some(response.body),
                usage: response.usage,
                provider: Provider::Bedrock,
                is_fallback: primary_was_attempted,
                http_status: 200,
                error_kind: None,
                error_message: None,
            }),
            Err(err) => Ok(ProxyResponse {
                success: false,
                unary_body: None,
                usage: None,
                provider: Provider::Bedrock,
                is_fallback: primary_was_attempted,
                http_status: err.http_status,
                error_kind: Some(err.kind),
                error_message: Some(err.message),
            }),
        }
    }

    /// §4.6 streaming path: once bytes have left an adapter no switching is
    /// permitted, so this only decides *which* adapter to attempt first —
    /// the streaming pipe (C7) owns relaying whatever it returns.
    pub async fn route_stream(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<(Provider, bool, crate::providers::ByteStream), RouterError> {
        let key = ctx.access_key_id;

        if !self.circuit_breaker.is_open(key) {
            match self.plan.stream(ctx, req, headers).await {
                Ok(stream) => {
                    self.circuit_breaker.record_success(key);
                    return Ok((Provider::Plan, false, stream));
                }
                Err(err) => {
                    self.circuit_breaker.record_failure(key, err.kind);
                    if !err.retryable || !is_fallback_eligible(err.kind) {
                        return Err(RouterError::Provider(err));
                    }
                }
            }
        } else {
            info!(access_key_id = %key, "plan_skipped_circuit_open");
        }

        if !ctx.has_bedrock_key {
            return Err(RouterError::NoFallback);
        }
        let stream = self
            .bedrock
            .stream(ctx, req, headers)
            .await
            .map_err(RouterError::Provider)?;
        Ok((Provider::Bedrock, true, stream))
    }

    /// Same primary-then-fallback shape as [`Router::route`], for the
    /// `count_tokens` endpoint (§4.3 "optional, used by the count_tokens
    /// endpoint").
    pub async fn count_tokens(
        &self,
        ctx: &RequestContext,
        req: &Value,
        headers: &PassThroughHeaders,
    ) -> Result<crate::providers::CountTokensResponse, ProviderError> {
        let key = ctx.access_key_id;

        if !self.circuit_breaker.is_open(key) {
            match self.plan.count_tokens(ctx, req, headers).await {
                Ok(response) => {
                    self.circuit_breaker.record_success(key);
                    return Ok(response);
                }
                Err(err) => {
                    self.circuit_breaker.record_failure(key, err.kind);
                    if !err.retryable || !is_fallback_eligible(err.kind) {
                        return Err(err);
                    }
                }
            }
        } else {
            info!(access_key_id = %key, "plan_skipped_circuit_open");
        }

        if !ctx.has_bedrock_key {
            return Err(ProviderError::new(
                ErrorKind::BedrockUnavailable,
                503,
                "Service unavailable and no fallback configured",
            ));
        }
        self.bedrock.count_tokens(ctx, req, headers).await
    }

    /// The adapter that actually owns a given provider's resources, so a
    /// caller relaying a stream (e.g. the HTTP edge's `StreamingPipe`) can
    /// call `close()` on the right one.
    pub fn adapter_for(&self, provider: Provider) -> Arc<dyn ProviderAdapter> {
        match provider {
            Provider::Plan => self.plan.clone(),
            Provider::Bedrock => self.bedrock.clone(),
        }
    }
}

fn plan_failure_response(err: &ProviderError) -> ProxyResponse {
    ProxyResponse {
        success: false,
        unary_body: None,
        usage: None,
        provider: Provider::Plan,
        is_fallback: false,
        http_status: err.http_status,
        error_kind: Some(err.kind),
        error_message: Some(err.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CircuitBreakerConfig,
        providers::{ByteStream, CountTokensResponse, InvokeResponse},
    };
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FailingAdapter {
        kind: ErrorKind,
    }

    #[async_trait]
    impl ProviderAdapter for FailingAdapter {
        async fn invoke(
            &self,
            _ctx: &RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<InvokeResponse, ProviderError> {
            Err(ProviderError::new(self.kind, 503, "boom"))
        }
        async fn stream(
            &self,
            _ctx: &RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<ByteStream, ProviderError> {
            Err(ProviderError::new(self.kind, 503, "boom"))
        }
        async fn count_tokens(
            &self,
            _ctx: &RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<CountTokensResponse, ProviderError> {
            unimplemented!()
        }
    }

    struct SucceedingAdapter;

    #[async_trait]
    impl ProviderAdapter for SucceedingAdapter {
        async fn invoke(
            &self,
            _ctx: &RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<InvokeResponse, ProviderError> {
            Ok(InvokeResponse {
                body: serde_json::json!({"ok": true}),
                usage: None,
            })
        }
        async fn stream(
            &self,
            _ctx: &RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<ByteStream, ProviderError> {
            unimplemented!()
        }
        async fn count_tokens(
            &self,
            _ctx: &RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<CountTokensResponse, ProviderError> {
            unimplemented!()
        }
    }

    fn ctx(has_bedrock_key: bool) -> RequestContext {
        RequestContext {
            request_id: "r1".to_string(),
            user_id: Uuid::new_v4(),
            access_key_id: Uuid::new_v4(),
            access_key_prefix: "ak_live_abc".to_string(),
            bedrock_region: "us-east-1".to_string(),
            bedrock_model: "m".to_string(),
            has_bedrock_key,
        }
    }

    fn cb_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window_secs: 60,
            reset_timeout_secs: 1800,
        }
    }

    #[tokio::test]
    async fn retryable_failure_falls_back_to_bedrock() {
        let router = Router::new(
            Arc::new(CircuitBreaker::new(cb_config())),
            Arc::new(FailingAdapter {
                kind: ErrorKind::ServerError,
            }),
            Arc::new(SucceedingAdapter),
        );
        let response = router
            .route(&ctx(true), &serde_json::json!({}), &PassThroughHeaders::default())
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.provider, Provider::Bedrock);
        assert!(response.is_fallback);
    }

    #[tokio::test]
    async fn non_retryable_failure_does_not_fall_back() {
        let router = Router::new(
            Arc::new(CircuitBreaker::new(cb_config())),
            Arc::new(FailingAdapter {
                kind: ErrorKind::ClientError,
            }),
            Arc::new(SucceedingAdapter),
        );
        let response = router
            .route(&ctx(true), &serde_json::json!({}), &PassThroughHeaders::default())
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.provider, Provider::Plan);
        assert!(!response.is_fallback);
    }

    #[tokio::test]
    async fn no_bedrock_key_means_no_fallback() {
        let router = Router::new(
            Arc::new(CircuitBreaker::new(cb_config())),
            Arc::new(FailingAdapter {
                kind: ErrorKind::ServerError,
            }),
            Arc::new(SucceedingAdapter),
        );
        let result = router
            .route(&ctx(false), &serde_json::json!({}), &PassThroughHeaders::default())
            .await;
        assert!(matches!(result, Err(RouterError::NoFallback)));
    }

    #[tokio::test]
    async fn open_circuit_skips_straight_to_bedrock() {
        let cb = Arc::new(CircuitBreaker::new(cb_config()));
        let key_ctx = ctx(true);
        for _ in 0..3 {
            cb.record_failure(key_ctx.access_key_id, ErrorKind::ServerError);
        }
        assert!(cb.is_open(key_ctx.access_key_id));

        let router = Router::new(
            cb,
            Arc::new(FailingAdapter {
                kind: ErrorKind::ServerError,
            }),
            Arc::new(SucceedingAdapter),
        );
        let response = router
            .route(&key_ctx, &serde_json::json!({}), &PassThroughHeaders::default())
            .await
            .unwrap();
        assert_eq!(response.provider, Provider::Bedrock);
        assert!(!response.is_fallback);
    }
}
