use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    axum::{
        Router,
        body::Bytes,
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    courier_ingest::{Envelope, HealthProbe, Inbound, IngestService, probes::HttpProbe},
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tower_http::trace::TraceLayer,
    tracing::{debug, info},
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the router (shared between production startup and tests).
pub fn build_app(state: AppState, webhook_path: &str) -> Router {
    Router::new()
        .route(webhook_path, post(webhook_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn bind(config: &courier_config::ServerConfig) -> anyhow::Result<TcpListener> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "http listener bound");
    Ok(listener)
}

/// Serve until `cancel` fires, then let in-flight requests finish.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("http server shutting down");
        })
        .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn webhook_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let payload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "rejecting malformed webhook body");
            return (StatusCode::BAD_REQUEST, "invalid json").into_response();
        },
    };
    let Some(envelope) = Envelope::from_update(payload) else {
        return (StatusCode::BAD_REQUEST, "missing update_id").into_response();
    };
    match state.ingest.accept_push(envelope).await {
        Inbound::Accepted | Inbound::Duplicate | Inbound::DispatchedInline => {
            StatusCode::OK.into_response()
        },
        Inbound::Rejected => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ingest.health_summary())
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ingest.status())
}

// ── Self probe ───────────────────────────────────────────────────────────────

/// Health probe against our own `/health` route.
pub struct ListenerProbe {
    inner: HttpProbe,
}

impl ListenerProbe {
    pub fn new(addr: SocketAddr, timeout: Duration) -> anyhow::Result<Self> {
        // A wildcard bind address is not connectable; probe loopback instead.
        let host = if addr.ip().is_unspecified() {
            SocketAddr::from(([127, 0, 0, 1], addr.port()))
        } else {
            addr
        };
        Ok(Self {
            inner: HttpProbe::new(format!("http://{host}/health"), timeout)?,
        })
    }
}

#[async_trait]
impl HealthProbe for ListenerProbe {
    async fn check(&self) -> anyhow::Result<bool> {
        self.inner.check().await
    }
}
