//! Lexforge API Gateway
//!
//! The HTTP surface of the answer pipeline.
//! Handles:
//! - Streaming answers over server-sent events
//! - Direct search against the hosted index
//! - Rate limiting
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;

use axum::{
    routing::{get, post},
    Router,
};
use lexforge_common::{
    config::{AppConfig, ObservabilityConfig},
    db::{DbPool, Repository},
    llm::ChatCompletionsClient,
    metrics,
};
use lexforge_context::{ChatPipeline, PipelineSettings};
use lexforge_search::{AzureSearchClient, SearchBackend, SqlReferenceStore};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Repository,
    pub search: Arc<dyn SearchBackend>,
    pub pipeline: Arc<ChatPipeline>,
    pub metrics: Option<PrometheusHandle>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    info!("Starting Lexforge API Gateway v{}", lexforge_common::VERSION);

    config.validate().map_err(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        e
    })?;
    let config = Arc::new(config);

    let metrics_handle = if config.observability.metrics_enabled {
        let handle = install_prometheus()?;
        metrics::register_metrics();
        Some(handle)
    } else {
        None
    };

    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let repo = Repository::new(db);

    let search: Arc<dyn SearchBackend> = Arc::new(AzureSearchClient::from_config(&config.search)?);
    let references = Arc::new(SqlReferenceStore::new(
        repo.clone(),
        lexforge_common::DEFAULT_LANGUAGE,
    ));
    let generator = Arc::new(ChatCompletionsClient::from_config(&config.llm)?);

    let pipeline = Arc::new(ChatPipeline::new(
        search.clone(),
        references,
        generator,
        PipelineSettings::from(&config.pipeline),
    ));

    let state = AppState {
        config: config.clone(),
        repo,
        search,
        pipeline,
        metrics: metrics_handle,
    };

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, app, shutdown_signal(), config.shutdown_timeout()).await?;

    info!("Server shutdown complete");
    Ok(())
}

/// JSON or plain logs; `RUST_LOG` overrides the configured level
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let upstream = ["search_duration_seconds", "reference_expansion_duration_seconds", "answer_stream_duration_seconds"];

    let mut builder = PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full(metrics::metric_name("request_duration_seconds")),
        metrics::LATENCY_BUCKETS,
    )?;
    for suffix in upstream {
        builder = builder.set_buckets_for_metric(
            Matcher::Full(metrics::metric_name(suffix)),
            metrics::UPSTREAM_BUCKETS,
        )?;
    }

    Ok(builder.install_recorder()?)
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let api_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .route("/search", post(handlers::search::search));

    let rate_limit = &state.config.rate_limit;
    let api_routes = if rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(
            rate_limit.requests_per_second,
            rate_limit.burst,
        );
        let limit = rate_limit.requests_per_second;
        api_routes.layer(axum::middleware::from_fn(
            move |request: axum::extract::Request, next: axum::middleware::Next| {
                middleware::rate_limit::rate_limit_middleware(request, next, limiter.clone(), limit)
            },
        ))
    } else {
        api_routes
    };

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/metrics", get(handlers::health::metrics))
        .nest("/api", api_routes)
        .route_layer(axum::middleware::from_fn(middleware::metrics::track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Serve until `signal` resolves, then drain in-flight requests for at most
/// `drain`. Answer streams still open at the deadline are dropped.
async fn serve<F>(
    listener: tokio::net::TcpListener,
    app: Router,
    signal: F,
    drain: Duration,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        signal.await;
        let _ = shutdown_tx.send(true);
    });

    let mut graceful_rx = shutdown_rx.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.wait_for(|stopping| *stopping).await;
        })
        .into_future();

    let mut deadline_rx = shutdown_rx;
    let deadline = async move {
        let _ = deadline_rx.wait_for(|stopping| *stopping).await;
        tokio::time::sleep(drain).await;
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => {
            tracing::warn!(drain_secs = drain.as_secs(), "Shutdown deadline reached, dropping open connections");
        }
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use lexforge_common::llm::MockGenerator;
    use lexforge_search::{MockReferenceStore, MockSearchBackend, PrimaryResult};
    use tower::ServiceExt;

    pub(crate) fn page(nid: i64) -> PrimaryResult {
        PrimaryResult {
            nid,
            chunk_no: 0,
            title: format!("Page {}", nid),
            content: "Copyright infringement may be a criminal offence".to_string(),
            topic: "Intellectual Property".to_string(),
            url: format!("https://clic.org.hk/en/topics/{}", nid),
            score: Some(0.02),
            ..Default::default()
        }
    }

    /// State wired to mock ports and a disconnected database
    pub(crate) fn test_state(config: AppConfig, search: MockSearchBackend) -> AppState {
        let db = DbPool::disconnected();
        let search: Arc<dyn SearchBackend> = Arc::new(search);
        let generator = Arc::new(MockGenerator::new(
            &["copyright infringement penalty", "Copyright Ordinance offences"],
            &["Copyright ", "infringement is an offence."],
        ));
        let pipeline = Arc::new(ChatPipeline::new(
            search.clone(),
            Arc::new(MockReferenceStore::new()),
            generator,
            PipelineSettings::from(&config.pipeline),
        ));

        AppState {
            config: Arc::new(config),
            repo: Repository::new(db),
            search,
            pipeline,
            metrics: None,
        }
    }

    pub(crate) fn test_router(search: MockSearchBackend) -> Router {
        create_router(test_state(AppConfig::default(), search))
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let response = test_router(MockSearchBackend::new())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let mut config = AppConfig::default();
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;
        let app = create_router(test_state(config, MockSearchBackend::new()));

        let request = || {
            Request::post("/api/search")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"query":"copyright"}"#))
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_shutdown_drain_is_bounded() {
        use tokio::io::AsyncWriteExt;

        let app = Router::new().route("/hang", get(|| std::future::pending::<&'static str>()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let signal = async move {
            let _ = stop_rx.await;
        };
        let server = tokio::spawn(serve(listener, app, signal, Duration::from_millis(100)));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /hang HTTP/1.1\r\nhost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), server).await;
        let result = finished.expect("server outlived its drain deadline").unwrap();
        assert!(result.is_ok());
        drop(client);
    }

    #[tokio::test]
    async fn test_metrics_disabled_is_not_found() {
        let response = test_router(MockSearchBackend::new())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
