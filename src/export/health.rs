use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::capture::pool::PoolStats;

const NAMESPACE: &str = "pmusync";

/// Prometheus metrics for the capture and transport pipeline.
///
/// All metrics use the "pmusync" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Capture ===
    /// Overflows observed by the trigger, including those counted as missed.
    pub overflows: Counter,
    /// Samples dropped for lack of a free buffer, relative to the session baseline.
    pub samples_missed: Gauge,
    /// Buffers currently in the free set.
    pub pool_free_buffers: Gauge,
    /// Buffers currently in the full set.
    pub pool_full_buffers: Gauge,

    // === Sender ===
    /// Buffers drained and encoded.
    pub buffers_drained: Counter,
    /// Samples encoded into packets.
    pub samples_encoded: Counter,
    /// Packets written to the endpoint.
    pub packets_sent: Counter,
    /// Bytes written to the endpoint.
    pub bytes_sent: Counter,
    /// Time to encode and send one buffer.
    pub batch_duration: Histogram,
    /// Process metadata loads.
    pub identity_loads: Counter,
    /// Pids held in the identity cache.
    pub identities_tracked: Gauge,

    // === Reader ===
    /// Packets decoded from a session stream.
    pub packets_received: Counter,
    /// Packets skipped while decoding, by reason.
    pub packets_dropped: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let overflows = Counter::with_opts(
            Opts::new(
                "overflows_total",
                "Total counter overflows observed by the capture trigger.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_missed = Gauge::with_opts(
            Opts::new(
                "samples_missed",
                "Samples dropped for lack of a free buffer since the session baseline.",
            )
            .namespace(NAMESPACE),
        )?;
        let pool_free_buffers = Gauge::with_opts(
            Opts::new("pool_free_buffers", "Buffers currently in the free set.")
                .namespace(NAMESPACE),
        )?;
        let pool_full_buffers = Gauge::with_opts(
            Opts::new("pool_full_buffers", "Buffers waiting to be drained.")
                .namespace(NAMESPACE),
        )?;
        let buffers_drained = Counter::with_opts(
            Opts::new("buffers_drained_total", "Total buffers drained and encoded.")
                .namespace(NAMESPACE),
        )?;
        let samples_encoded = Counter::with_opts(
            Opts::new("samples_encoded_total", "Total samples encoded into packets.")
                .namespace(NAMESPACE),
        )?;
        let packets_sent = Counter::with_opts(
            Opts::new("packets_sent_total", "Total packets written to the endpoint.")
                .namespace(NAMESPACE),
        )?;
        let bytes_sent = Counter::with_opts(
            Opts::new("bytes_sent_total", "Total bytes written to the endpoint.")
                .namespace(NAMESPACE),
        )?;
        let batch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_duration_seconds",
                "Time to encode and send one drained buffer.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.05]),
        )?;
        let identity_loads = Counter::with_opts(
            Opts::new("identity_loads_total", "Total process metadata loads.")
                .namespace(NAMESPACE),
        )?;
        let identities_tracked = Gauge::with_opts(
            Opts::new("identities_tracked", "Pids held in the identity cache.")
                .namespace(NAMESPACE),
        )?;
        let packets_received = Counter::with_opts(
            Opts::new(
                "packets_received_total",
                "Total packets decoded from a session stream.",
            )
            .namespace(NAMESPACE),
        )?;
        let packets_dropped = CounterVec::new(
            Opts::new(
                "packets_dropped_total",
                "Total packets skipped while decoding, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;

        registry.register(Box::new(overflows.clone()))?;
        registry.register(Box::new(samples_missed.clone()))?;
        registry.register(Box::new(pool_free_buffers.clone()))?;
        registry.register(Box::new(pool_full_buffers.clone()))?;
        registry.register(Box::new(buffers_drained.clone()))?;
        registry.register(Box::new(samples_encoded.clone()))?;
        registry.register(Box::new(packets_sent.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;
        registry.register(Box::new(identity_loads.clone()))?;
        registry.register(Box::new(identities_tracked.clone()))?;
        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(packets_dropped.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            overflows,
            samples_missed,
            pool_free_buffers,
            pool_full_buffers,
            buffers_drained,
            samples_encoded,
            packets_sent,
            bytes_sent,
            batch_duration,
            identity_loads,
            identities_tracked,
            packets_received,
            packets_dropped,
        })
    }

    /// Publishes a pool occupancy snapshot.
    pub fn observe_pool(&self, stats: PoolStats) {
        self.pool_free_buffers.set(stats.free as f64);
        self.pool_full_buffers.set(stats.full as f64);
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespace() {
        let metrics = HealthMetrics::new("").unwrap();
        metrics.packets_sent.inc_by(3.0);
        metrics.overflows.inc_by(7.0);
        metrics.packets_dropped.with_label_values(&["empty_packet"]).inc();
        metrics.observe_pool(PoolStats {
            capacity: 8,
            free: 5,
            full: 2,
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("pmusync_packets_sent_total 3"));
        assert!(text.contains("pmusync_packets_dropped_total{reason=\"empty_packet\"} 1"));
        assert!(text.contains("pmusync_pool_free_buffers 5"));
        assert!(text.contains("pmusync_overflows_total 7"));
        assert!(!text.contains("samples_captured"));
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").unwrap();
        metrics.start().await.unwrap();
        metrics.stop().await.unwrap();
    }
}
