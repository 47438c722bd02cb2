pub mod health;
pub mod render;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Aggregator;
use crate::attach::AttachmentView;
use crate::catalog::Catalog;

use self::health::HealthMetrics;

/// Serves the pull-based scrape endpoint.
///
/// Each request takes one snapshot of the active-attachment set and one of
/// the aggregator, renders both, and returns; it never waits on an
/// in-flight attach or detach, and scraping never mutates metric state.
pub struct ExpositionServer {
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

struct AppState {
    catalog: Arc<Catalog>,
    aggregator: Arc<Aggregator>,
    attachments: Arc<dyn AttachmentView>,
    health: Arc<HealthMetrics>,
}

impl ExpositionServer {
    pub fn new(
        addr: &str,
        catalog: Arc<Catalog>,
        aggregator: Arc<Aggregator>,
        attachments: Arc<dyn AttachmentView>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            state: Arc::new(AppState {
                catalog,
                aggregator,
                attachments,
                health,
            }),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts the HTTP server serving /metrics, /healthz, and /state.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/state", get(state_handler))
            .with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "exposition server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "exposition server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active = state.attachments.active_attachments();
    state.health.attachments_active.set(active.len() as f64);

    let snapshot = state.aggregator.snapshot();
    let families = render::build_families(&state.catalog, &active, &snapshot);

    match render::encode_text(&families, state.health.registry()) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /state - Debug dump of raw aggregation state.
async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.aggregator.snapshot();
    let active = state.attachments.active_attachments();

    let mut out = String::with_capacity(1024);

    out.push_str("## Active attachments\n\n");
    for a in &active {
        out.push_str(&format!("{} pid={}\n", a.name, a.pid));
    }

    out.push_str("\n## Histograms\n\n");
    for h in &snapshot.histograms {
        let name = state
            .catalog
            .get(h.probe)
            .map(|p| p.name.to_string())
            .unwrap_or_else(|| format!("probe#{}", h.probe));
        out.push_str(&format!(
            "{name} pid={} count={} sum={} buckets={:?}\n",
            h.pid, h.count, h.sum, h.buckets
        ));
    }

    out.push_str("\n## Counters\n\n");
    for c in &snapshot.counters {
        let name = state
            .catalog
            .get(c.probe)
            .map(|p| p.name.to_string())
            .unwrap_or_else(|| format!("probe#{}", c.probe));
        out.push_str(&format!(
            "{name} pid={} labels={:?} value={}\n",
            c.pid, c.labels, c.value
        ));
    }

    (StatusCode::OK, out)
}
