use crate::config::Config;
use crate::encoder::ResponseEncoder;
use crate::error::Result;
use crate::handlers::{
    get_client_status, health_check, hello, limiter_stats, readiness_check, reset_client,
    AppState, SharedState,
};
use crate::middleware::{logging_middleware, rate_limit_middleware, AdmissionPolicy};
use crate::reaper::Reaper;
use crate::registry::ClientRegistry;
use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the shared state for `config`. Does not start the reaper.
pub fn build_state(config: &Config) -> SharedState {
    Arc::new(AppState {
        registry: Arc::new(ClientRegistry::new(config.limiter())),
        encoder: ResponseEncoder::new(config.encoder()),
        policy: AdmissionPolicy::new(config.skip_paths.0.clone(), config.whitelist.0.clone()),
        cache_ttl: config.cache_ttl(),
        started_at: Instant::now(),
    })
}

/// Router with every route and middleware layer wired to `state`.
pub fn create_app(state: SharedState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/hello", get(hello))
        .route("/api/v1/limiter", get(limiter_stats))
        .route(
            "/rate-limit/:client",
            get(get_client_status).delete(reset_client),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(allowed_origins))
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit_middleware,
                )),
        )
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::IF_NONE_MATCH])
        .expose_headers([header::ETAG, header::RETRY_AFTER]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    reaper: Reaper,
}

impl Server {
    /// Must be called from within a tokio runtime; starts the reaper.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let state = build_state(&config);
        let limiter = config.limiter();
        let reaper = Reaper::start(
            state.registry.clone(),
            limiter.sweep_interval,
            limiter.idle_timeout,
        );
        let app = create_app(state, &config.allowed_origins.0);

        Ok(Self {
            app,
            bind_addr: config.bind_addr,
            reaper,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Server listening on {}", listener.local_addr()?);
        tracing::info!("Health check available at /healthz");
        tracing::info!("Readiness check available at /ready");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        self.reaper.shutdown().await;
        tracing::info!("Server stopped");

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
