use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where the daemon is in its life: still opening stores and whitelists,
/// answering policy requests, or refusing new connections while in-flight
/// workers finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Stores and whitelists are still being opened.
    Starting,
    /// The listener is up and requests are being answered.
    Serving,
    /// A shutdown signal arrived; no new connections are accepted.
    Draining,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Draining => "draining",
        }
    }
}

/// The daemon's current [`Phase`], published by startup and the signal
/// handler, read by the status probe.
#[derive(Clone)]
pub struct PhaseCell {
    phase: Arc<AtomicU8>,
}

impl PhaseCell {
    /// A new cell in [`Phase::Starting`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(Phase::Starting as u8)),
        }
    }

    /// Publishes a new phase.
    pub fn set(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    /// The phase as last published.
    #[must_use]
    pub fn get(&self) -> Phase {
        match self.phase.load(Ordering::Relaxed) {
            p if p == Phase::Serving as u8 => Phase::Serving,
            p if p == Phase::Draining as u8 => Phase::Draining,
            _ => Phase::Starting,
        }
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the `/status` probe.
#[derive(Serialize)]
struct StatusBody {
    phase: &'static str,
    ready: bool,
}

/// Serves `/metrics` and `/status` on `addr`.
///
/// `/status` answers 200 only while the daemon is serving; a probe during
/// startup or drain gets 503 with the phase named in the body, so an
/// orchestrator stops routing before the listener goes away.
///
/// # Errors
///
/// Returns an error if the recorder or the HTTP listener cannot be set up.
pub async fn serve(addr: SocketAddr, phase: PhaseCell) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/status", get(move || status_handler(phase.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics endpoint listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(phase: PhaseCell) -> (StatusCode, Json<StatusBody>) {
    let phase = phase.get();
    let ready = phase == Phase::Serving;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(StatusBody {
            phase: phase.as_str(),
            ready,
        }),
    )
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("graylag_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("graylag_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record one answered request with its outcome label
    /// (deferred, passed, seen, whitelisted, invalid).
    pub fn requests_total(outcome: &'static str) {
        metrics::counter!("graylag_requests_total", "outcome" => outcome).increment(1);
    }

    /// Record a whitelist hit with the matcher that accepted.
    pub fn whitelist_hits_total(matcher: &'static str) {
        metrics::counter!("graylag_whitelist_hits_total", "matcher" => matcher).increment(1);
    }

    /// Increment the transient store failure counter.
    pub fn store_errors_total() {
        metrics::counter!("graylag_store_errors_total").increment(1);
    }

    /// Increment the malformed-request counter.
    pub fn protocol_errors_total() {
        metrics::counter!("graylag_protocol_errors_total").increment(1);
    }

    /// Record keys expired by one sweep of the named store.
    pub fn swept_total(store: &'static str, removed: usize) {
        metrics::counter!("graylag_swept_total", "store" => store).increment(removed as u64);
    }
}
