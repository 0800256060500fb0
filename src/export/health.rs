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

use crate::http::stats::{bucket_boundaries, RequestStats};
use crate::http::telemetry::Counters;

const NAMESPACE: &str = "httpscope";

/// Prometheus metrics for agent health and pipeline observability.
///
/// All metrics use the "httpscope" namespace. Pipeline counters are fed
/// from the telemetry delta of each stats drain.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Transactions decoded from batch storage.
    pub transactions_decoded: Counter,
    /// Decoded transactions by response status class (1XX..5XX).
    pub transactions_by_class: CounterVec,
    /// Transactions not aggregated, by reason (malformed/rejected/dropped/expired).
    pub transactions_discarded: CounterVec,
    /// Pipeline errors by kind (missed_batch/lost_batch/storage_read/unknown_cpu).
    pub pipeline_errors: CounterVec,
    /// Request latency observations by status class and bucket upper bound.
    pub request_latency_buckets: CounterVec,
    /// Distinct aggregation keys in the most recent drain.
    pub aggregation_keys: Gauge,
    /// Stats drains performed.
    pub stats_drains: Counter,
    /// Time spent in a stats drain, in seconds.
    pub stats_drain_duration: Histogram,
    /// Whether the HTTP monitor loop is running (1=yes, 0=no).
    pub monitor_running: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let transactions_decoded = Counter::with_opts(
            Opts::new(
                "transactions_decoded_total",
                "Transactions decoded from batch storage.",
            )
            .namespace(NAMESPACE),
        )?;
        let transactions_by_class = CounterVec::new(
            Opts::new(
                "transactions_by_status_class_total",
                "Decoded transactions by response status class.",
            )
            .namespace(NAMESPACE),
            &["class"],
        )?;
        let transactions_discarded = CounterVec::new(
            Opts::new(
                "transactions_discarded_total",
                "Transactions not aggregated, by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let pipeline_errors = CounterVec::new(
            Opts::new("pipeline_errors_total", "Pipeline errors by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let request_latency_buckets = CounterVec::new(
            Opts::new(
                "request_latency_buckets_total",
                "Request latencies by status class and bucket upper bound in nanoseconds.",
            )
            .namespace(NAMESPACE),
            &["class", "upper_ns"],
        )?;
        let aggregation_keys = Gauge::with_opts(
            Opts::new(
                "aggregation_keys",
                "Distinct aggregation keys in the most recent drain.",
            )
            .namespace(NAMESPACE),
        )?;
        let stats_drains = Counter::with_opts(
            Opts::new("stats_drains_total", "Stats drains performed.").namespace(NAMESPACE),
        )?;
        let stats_drain_duration = Histogram::with_opts(
            HistogramOpts::new(
                "stats_drain_duration_seconds",
                "Time spent in a stats drain.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let monitor_running = Gauge::with_opts(
            Opts::new(
                "monitor_running",
                "Whether the HTTP monitor loop is running (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(transactions_decoded.clone()))?;
        registry.register(Box::new(transactions_by_class.clone()))?;
        registry.register(Box::new(transactions_discarded.clone()))?;
        registry.register(Box::new(pipeline_errors.clone()))?;
        registry.register(Box::new(request_latency_buckets.clone()))?;
        registry.register(Box::new(aggregation_keys.clone()))?;
        registry.register(Box::new(stats_drains.clone()))?;
        registry.register(Box::new(stats_drain_duration.clone()))?;
        registry.register(Box::new(monitor_running.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            transactions_decoded,
            transactions_by_class,
            transactions_discarded,
            pipeline_errors,
            request_latency_buckets,
            aggregation_keys,
            stats_drains,
            stats_drain_duration,
            monitor_running,
        })
    }

    /// Fold one telemetry delta into the counters.
    pub fn record_telemetry(&self, delta: &Counters) {
        self.transactions_decoded.inc_by(delta.decoded as f64);

        for (class, value) in [
            ("1XX", delta.hits1xx),
            ("2XX", delta.hits2xx),
            ("3XX", delta.hits3xx),
            ("4XX", delta.hits4xx),
            ("5XX", delta.hits5xx),
        ] {
            self.transactions_by_class
                .with_label_values(&[class])
                .inc_by(value as f64);
        }

        for (reason, value) in [
            ("malformed", delta.malformed),
            ("rejected", delta.rejected),
            ("dropped", delta.dropped),
            ("expired", delta.expired),
        ] {
            self.transactions_discarded
                .with_label_values(&[reason])
                .inc_by(value as f64);
        }

        for (kind, value) in [
            ("missed_batch", delta.missed_batch),
            ("lost_batch", delta.lost_batch),
            ("storage_read", delta.storage_read),
            ("unknown_cpu", delta.unknown_cpu),
        ] {
            self.pipeline_errors
                .with_label_values(&[kind])
                .inc_by(value as f64);
        }

        self.aggregation_keys.set(delta.aggregations as f64);
        self.stats_drains.inc();
    }

    /// Fold the latency histograms of one drain, combined across keys.
    pub fn record_requests(&self, totals: &RequestStats) {
        let bounds = bucket_boundaries();
        for (class, stats) in totals.iter() {
            let class = format!("{}XX", class / 100);
            for (bound, count) in bounds.iter().zip(stats.latency.histogram.buckets()) {
                if count == 0 {
                    continue;
                }
                // Last bucket is unbounded.
                let upper = if *bound == 0 {
                    "+Inf".to_string()
                } else {
                    bound.to_string()
                };
                self.request_latency_buckets
                    .with_label_values(&[class.as_str(), upper.as_str()])
                    .inc_by(count as f64);
            }
        }
    }

    /// Current metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr);

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

/// Resolve the ":port" shorthand to an all-interfaces address.
fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
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
    match encode_registry(&state.registry) {
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
