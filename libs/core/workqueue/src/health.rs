//! Health endpoints for K8s liveness and readiness checks.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::info;

/// Health status of the worker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub consuming: bool,
    pub session_live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared health state.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

struct HealthStateInner {
    alive: bool,
    consuming: bool,
    session_live: bool,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthStateInner {
                alive: true,
                consuming: false,
                session_live: true,
                last_error: None,
            })),
        }
    }

    /// Dispatch loops are (or are no longer) fetching.
    pub async fn set_consuming(&self, consuming: bool) {
        self.inner.write().await.consuming = consuming;
    }

    /// Heartbeats are (or are not) arriving.
    pub async fn set_session_live(&self, live: bool) {
        let mut inner = self.inner.write().await;
        inner.session_live = live;
        if !live {
            inner.last_error = Some("missing heartbeat".to_string());
        }
    }

    /// A fatal fault; liveness fails from now on.
    pub async fn set_fatal(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.alive = false;
        inner.consuming = false;
        inner.last_error = Some(error.into());
    }

    /// Liveness ignores heartbeat loss: a broker hiccup should not restart
    /// the pod, only a fatal fault should.
    pub async fn is_alive(&self) -> bool {
        self.inner.read().await.alive
    }

    /// Readiness requires an active, heartbeating session.
    pub async fn is_ready(&self) -> bool {
        let inner = self.inner.read().await;
        inner.alive && inner.consuming && inner.session_live
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let status = if !inner.alive {
            "failed"
        } else if inner.consuming && inner.session_live {
            "healthy"
        } else if inner.consuming {
            "degraded"
        } else {
            "idle"
        };
        HealthStatus {
            status: status.to_string(),
            consuming: inner.consuming,
            session_live: inner.session_live,
            last_error: inner.last_error.clone(),
        }
    }

    /// Mirror heartbeat liveness from the pull iterator until it closes.
    pub async fn follow_liveness(self, mut liveness: watch::Receiver<bool>) {
        loop {
            let live = *liveness.borrow_and_update();
            self.set_session_live(live).await;
            if liveness.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server exposing `/healthz`, `/readyz` and `/metrics`.
pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16, state: HealthState) -> Self {
        Self {
            port,
            state,
            metrics_handle: None,
        }
    }

    /// Serve `/metrics` from this Prometheus handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/healthz", get(health_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}
