//! HTTP surface (A2, §6).
//!
//! Wires C1 (auth) -> C6 (router) -> C7 (streaming pipe) -> C8 (usage
//! recorder) behind the three public endpoints. Grounded on the teacher's
//! `routes::health`/`routes::api` handler shape (`State<AppState>` extractor,
//! `Json`/`Response` return types) and its `middleware::request_id` module
//! for request correlation, narrowed to this proxy's single request shape.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    auth::Authenticator,
    errors::ErrorKind,
    providers::PassThroughHeaders,
    router::Router as ProxyRouter,
    streaming::StreamingPipe,
    usage::UsageRecorder,
};

pub struct AppState {
    pub authenticator: Arc<Authenticator>,
    pub router: Arc<ProxyRouter>,
    pub usage: Arc<UsageRecorder>,
    pub plan_api_key: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ak/{access_key}/v1/messages", post(messages))
        .route(
            "/ak/{access_key}/v1/messages/count_tokens",
            post(count_tokens),
        )
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
}

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attaches a request id to every response, generating one when the client
/// didn't supply one — mirrors the teacher's `request_id_middleware`.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", request_id = %request_id, method = %req.method(), path = %req.uri().path());
    let _guard = span.enter();

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

fn pass_through_headers(headers: &HeaderMap) -> PassThroughHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    PassThroughHeaders {
        x_api_key: get("x-api-key"),
        authorization: get("authorization"),
        anthropic_version: get("anthropic-version"),
        anthropic_beta: get("anthropic-beta"),
    }
}

/// §7 "Auth failures at the edge return HTTP 404 (not 401) for the ak
/// path — to avoid confirming key presence to attackers."
async fn authenticate_or_404(
    state: &AppState,
    access_key: &str,
) -> Result<crate::models::RequestContext, Response> {
    state.authenticator.authenticate(access_key).await.map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "type": "error",
                "error": {"type": "not_found_error", "message": "not found"},
            })),
        )
            .into_response()
    })
}

fn error_envelope(kind: ErrorKind, http_status: u16, message: &str, request_id: &str) -> Response {
    let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "type": "error",
            "error": {"type": kind.public_type(), "message": message},
            "request_id": request_id,
        })),
    )
        .into_response()
}

/// `POST /ak/{access_key}/v1/messages` (§6).
async fn messages(
    State(state): State<Arc<AppState>>,
    Path(access_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let ctx = match authenticate_or_404(&state, &access_key).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let pass_through = pass_through_headers(&headers);
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or(&ctx.bedrock_model)
        .to_string();
    let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let started = Instant::now();

    if is_streaming {
        return messages_stream(&state, &ctx, &body, &pass_through, &model, started).await;
    }

    match state.router.route(&ctx, &body, &pass_through).await {
        Ok(proxy_response) => {
            let latency_ms = started.elapsed().as_millis() as i64;
            state
                .usage
                .record(&ctx, &proxy_response, latency_ms, &model)
                .await;
            if proxy_response.success {
                Json(proxy_response.unary_body.unwrap_or(json!({}))).into_response()
            } else {
                error_envelope(
                    proxy_response.error_kind.unwrap_or(ErrorKind::ServerError),
                    proxy_response.http_status,
                    proxy_response.error_message.as_deref().unwrap_or("request failed"),
                    &ctx.request_id,
                )
            }
        }
        Err(err) => {
            let latency_ms = started.elapsed().as_millis() as i64;
            let proxy_response = crate::models::ProxyResponse {
                success: false,
                unary_body: None,
                usage: None,
                provider: crate::models::Provider::Plan,
                is_fallback: false,
                http_status: err.http_status(),
                error_kind: Some(err.kind()),
                error_message: Some(err.message()),
            };
            state
                .usage
                .record(&ctx, &proxy_response, latency_ms, &model)
                .await;
            error_envelope(err.kind(), err.http_status(), &err.message(), &ctx.request_id)
        }
    }
}

/// Streaming branch of `messages`: once the router picks an adapter, the
/// response body is handed to the streaming pipe (C7) for relay, and usage
/// is recorded from the pipe's terminal event (§4.7 exactly-once close).
async fn messages_stream(
    state: &Arc<AppState>,
    ctx: &crate::models::RequestContext,
    body: &Value,
    headers: &PassThroughHeaders,
    model: &str,
    started: Instant,
) -> Response {
    match state.router.route_stream(ctx, body, headers).await {
        Ok((provider, is_fallback, byte_stream)) => {
            let adapter = state.router.adapter_for(provider);
            let pipe = StreamingPipe::new(byte_stream, adapter);

            let proxy_response = crate::models::ProxyResponse {
                success: true,
                unary_body: None,
                usage: None,
                provider,
                is_fallback,
                http_status: 200,
                error_kind: None,
                error_message: None,
            };
            let latency_ms = started.elapsed().as_millis() as i64;
            state.usage.record(ctx, &proxy_response, latency_ms, model).await;

            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(pipe))
                .expect("static headers always build a valid response")
        }
        Err(err) => {
            let latency_ms = started.elapsed().as_millis() as i64;
            let proxy_response = crate::models::ProxyResponse {
                success: false,
                unary_body: None,
                usage: None,
                provider: crate::models::Provider::Plan,
                is_fallback: false,
                http_status: err.http_status(),
                error_kind: Some(err.kind()),
                error_message: Some(err.message()),
            };
            state.usage.record(ctx, &proxy_response, latency_ms, model).await;
            error_envelope(err.kind(), err.http_status(), &err.message(), &ctx.request_id)
        }
    }
}

/// §6 `count_tokens` requires *some* credential on the request even though
/// routing itself may still fall back to Bedrock: a process-wide plan key
/// counts, since it stands in for a per-tenant `x-api-key`/`Authorization`.
fn has_count_tokens_credential(pass_through: &PassThroughHeaders, plan_api_key: &str) -> bool {
    pass_through.x_api_key.is_some() || pass_through.authorization.is_some() || !plan_api_key.is_empty()
}

/// `POST /ak/{access_key}/v1/messages/count_tokens` (§6).
async fn count_tokens(
    State(state): State<Arc<AppState>>,
    Path(access_key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let ctx = match authenticate_or_404(&state, &access_key).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let pass_through = pass_through_headers(&headers);
    if !has_count_tokens_credential(&pass_through, &state.plan_api_key) {
        return error_envelope(
            ErrorKind::BedrockAuthError,
            401,
            "Missing API key for count_tokens",
            &ctx.request_id,
        );
    }

    match state.router.count_tokens(&ctx, &body, &pass_through).await {
        Ok(response) => Json(json!({"input_tokens": response.input_tokens})).into_response(),
        Err(err) => error_envelope(err.kind, err.http_status, &err.message, &ctx.request_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        circuit_breaker::CircuitBreaker,
        config::{CircuitBreakerConfig, UsageConfig},
        db::DbResult,
        metrics::ChannelMetricsSink,
        models::{AccessKey, BedrockKey, UsageAggregateDelta, UsageRow},
        providers::{ByteStream, CountTokensResponse, InvokeResponse, PassThroughHeaders, ProviderAdapter},
        router::Router as ProxyRouter,
    };
    use async_trait::async_trait;
    use axum::body::to_bytes;

    #[test]
    fn extracts_known_pass_through_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-live".parse().unwrap());
        headers.insert("x-unrelated", "ignored".parse().unwrap());
        let pass_through = pass_through_headers(&headers);
        assert_eq!(pass_through.x_api_key.as_deref(), Some("sk-live"));
        assert!(pass_through.authorization.is_none());
    }

    struct EmptyStore;

    #[async_trait]
    impl crate::db::Store for EmptyStore {
        async fn find_active_access_key_by_hash(&self, _key_hash: &str) -> DbResult<Option<AccessKey>> {
            Ok(None)
        }
        async fn has_bedrock_key(&self, _access_key_id: Uuid) -> DbResult<bool> {
            Ok(false)
        }
        async fn get_bedrock_key(&self, _access_key_id: Uuid) -> DbResult<Option<BedrockKey>> {
            Ok(None)
        }
        async fn insert_usage_row(&self, _row: &UsageRow) -> DbResult<()> {
            Ok(())
        }
        async fn upsert_usage_aggregate(&self, _delta: &UsageAggregateDelta) -> DbResult<()> {
            Ok(())
        }
    }

    struct UnreachableAdapter;

    #[async_trait]
    impl ProviderAdapter for UnreachableAdapter {
        async fn invoke(
            &self,
            _ctx: &crate::models::RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<InvokeResponse, crate::errors::ProviderError> {
            unreachable!("auth must fail before a provider is ever reached")
        }
        async fn stream(
            &self,
            _ctx: &crate::models::RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<ByteStream, crate::errors::ProviderError> {
            unreachable!("auth must fail before a provider is ever reached")
        }
        async fn count_tokens(
            &self,
            _ctx: &crate::models::RequestContext,
            _req: &Value,
            _headers: &PassThroughHeaders,
        ) -> Result<CountTokensResponse, crate::errors::ProviderError> {
            unreachable!("auth must fail before a provider is ever reached")
        }
    }

    fn test_state(plan_api_key: &str) -> Arc<AppState> {
        let store: Arc<dyn crate::db::Store> = Arc::new(EmptyStore);
        let authenticator = Arc::new(Authenticator::new(store.clone(), "test-secret".to_string(), 60));
        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window_secs: 60,
            reset_timeout_secs: 1800,
        }));
        let router = Arc::new(ProxyRouter::new(
            circuit_breaker,
            Arc::new(UnreachableAdapter),
            Arc::new(UnreachableAdapter),
        ));
        let metrics: Arc<dyn crate::metrics::MetricsSink> = Arc::new(ChannelMetricsSink::spawn(16));
        let usage = Arc::new(UsageRecorder::new(store, metrics, UsageConfig::default()));
        Arc::new(AppState {
            authenticator,
            router,
            usage,
            plan_api_key: plan_api_key.to_string(),
        })
    }

    #[tokio::test]
    async fn unknown_access_key_returns_404_not_401() {
        let state = test_state("");
        let response = authenticate_or_404(&state, "ak_live_unknown").await.unwrap_err();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn count_tokens_without_any_credential_is_rejected() {
        let state = test_state("");
        let headers = HeaderMap::new();
        let response = count_tokens(
            State(state),
            Path("ak_live_unknown".to_string()),
            headers,
            Json(json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn count_tokens_credential_check_accepts_a_process_wide_plan_key() {
        let none = PassThroughHeaders::default();
        assert!(!has_count_tokens_credential(&none, ""));
        assert!(has_count_tokens_credential(&none, "configured-plan-key"));

        let with_api_key = PassThroughHeaders {
            x_api_key: Some("sk-live".to_string()),
            ..Default::default()
        };
        assert!(has_count_tokens_credential(&with_api_key, ""));
    }
}
