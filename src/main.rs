//! Process entry point: load configuration, wire C1-C9 behind the HTTP
//! surface (A2), and serve.
//!
//! Grounded on the teacher's `main::run_server` sequencing (config load ->
//! tracing init -> build state -> bind -> `axum::serve` with graceful
//! shutdown), narrowed to this proxy's single-deployment-mode startup —
//! no CLI subcommand tree, since provisioning/migration tooling is out of
//! scope (§1 Non-goals).

mod auth;
mod circuit_breaker;
mod config;
mod db;
mod errors;
mod keycache;
mod kms;
mod metrics;
mod models;
mod providers;
mod router;
mod routes;
mod streaming;
mod usage;

use std::sync::Arc;

use tower_http::trace::TraceLayer;

use crate::{
    auth::Authenticator,
    circuit_breaker::CircuitBreaker,
    config::{AppConfig, LogFormat},
    keycache::KeyMaterialCache,
    kms::StaticKeyDecryptor,
    metrics::ChannelMetricsSink,
    providers::{bedrock::BedrockAdapter, plan::PlanAdapter},
    router::Router as ProxyRouter,
    routes::AppState,
    usage::UsageRecorder,
};

#[tokio::main]
async fn main() {
    let config_path =
        std::env::var("KEYFORWARD_CONFIG").unwrap_or_else(|_| "keyforward.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        AppConfig::load(&config_path).unwrap_or_else(|e| {
            eprintln!("failed to load config from {config_path}: {e}");
            std::process::exit(1);
        })
    } else {
        AppConfig::from_env()
    };

    init_tracing(&config.observability);
    tracing::info!(config_path = %config_path, "starting keyforward");

    let store = db::connect(&config.database.url)
        .await
        .expect("failed to connect to database");

    let authenticator = Arc::new(Authenticator::new(
        store.clone(),
        config.auth.key_hasher_secret.clone(),
        config.auth.access_key_cache_ttl_secs,
    ));

    let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker));

    let plan: Arc<dyn providers::ProviderAdapter> = Arc::new(PlanAdapter::new(&config.plan));

    // A production deployment supplies a `KeyDecryptor` backed by its own
    // KMS; `StaticKeyDecryptor` is a local-development stand-in (A4).
    let decryptor = Arc::new(StaticKeyDecryptor::new(&config.bedrock.kms_key_id));
    let keycache = Arc::new(KeyMaterialCache::new(
        store.clone(),
        decryptor,
        config.bedrock.key_cache_ttl_secs,
    ));
    let bedrock: Arc<dyn providers::ProviderAdapter> =
        Arc::new(BedrockAdapter::new(config.bedrock.clone(), keycache));

    let router = Arc::new(ProxyRouter::new(circuit_breaker, plan, bedrock));

    let metrics_sink = Arc::new(ChannelMetricsSink::spawn(1024));
    let usage = Arc::new(UsageRecorder::new(store, metrics_sink, config.usage));

    let state = Arc::new(AppState {
        authenticator,
        router,
        usage,
        plan_api_key: config.plan.api_key.clone(),
    });

    let app = routes::build_router(state).layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));
    tracing::info!(address = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

fn init_tracing(config: &config::ObservabilityConfig) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
