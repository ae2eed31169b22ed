use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Publishes coordinator events through the `metrics` facade.
#[derive(Debug, Clone)]
pub struct Metrics;

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_invocation(&self) {
        counter!("idempotency_invocations_total").increment(1);
    }

    pub fn record_replay(&self) {
        counter!("idempotency_replays_total").increment(1);
    }

    pub fn record_execution(&self, success: bool) {
        counter!("idempotency_executions_total", "success" => success.to_string()).increment(1);
    }

    pub fn record_lock_timeout(&self) {
        counter!("idempotency_lock_timeouts_total").increment(1);
    }

    pub fn record_commit_failure(&self, reason: &str) {
        counter!("idempotency_commit_failures_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn record_acquire_latency(&self, duration_ms: f64, replayed: bool) {
        histogram!("idempotency_acquire_duration_ms", "replayed" => replayed.to_string()).record(duration_ms);
    }

    pub fn record_purged(&self, count: u64) {
        counter!("idempotency_records_purged_total").increment(count);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_invocations_total", Unit::Count, "Total idempotent invocations");
    describe_counter!("idempotency_replays_total", Unit::Count, "Invocations answered from a stored result");
    describe_counter!("idempotency_executions_total", Unit::Count, "Invocations that ran the operation");
    describe_counter!("idempotency_lock_timeouts_total", Unit::Count, "Invocations that gave up waiting on an in-flight holder");
    describe_counter!("idempotency_commit_failures_total", Unit::Count, "Outcomes that could not be persisted");
    describe_histogram!("idempotency_acquire_duration_ms", Unit::Milliseconds, "Time spent acquiring the lock or a cached result");
    describe_counter!("idempotency_records_purged_total", Unit::Count, "Succeeded records removed by retention");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
