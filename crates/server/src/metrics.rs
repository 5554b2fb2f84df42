//! Prometheus metrics for the gleaner server.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping;
//! restrict it to scraper IPs at the infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use gleaner_core::report::GcResult;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static GC_CYCLES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("gleaner_gc_cycles_total", "GC cycles by mode and status"),
        &["mode", "status"],
    )
    .expect("metric creation failed")
});

pub static GC_OBJECTS_SCANNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gleaner_gc_objects_scanned_total",
        "Objects seen in bucket listings across all cycles",
    )
    .expect("metric creation failed")
});

pub static GC_OBJECTS_DELETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gleaner_gc_objects_deleted_total",
        "Objects deleted across all cycles",
    )
    .expect("metric creation failed")
});

pub static GC_OBJECTS_BACKED_UP_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gleaner_gc_objects_backed_up_total",
        "Objects backed up to the vault across all cycles",
    )
    .expect("metric creation failed")
});

pub static GC_OBJECT_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gleaner_gc_object_errors_total",
        "Per-object failures across all cycles",
    )
    .expect("metric creation failed")
});

pub static GC_CYCLE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "gleaner_gc_cycle_duration_seconds",
            "Wall-clock duration of a GC cycle",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
    )
    .expect("metric creation failed")
});

pub static GC_CYCLES_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("gleaner_gc_cycles_active", "GC cycles currently running")
        .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent; subsequent calls are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(GC_CYCLES_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_OBJECTS_SCANNED_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_OBJECTS_DELETED_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_OBJECTS_BACKED_UP_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_OBJECT_ERRORS_TOTAL.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_CYCLE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_CYCLES_ACTIVE.clone()))
            .expect("metric registration failed");
    });
}

/// Fold one finished cycle into the counters.
pub fn record_cycle_result(result: &GcResult) {
    let status = match result.status {
        gleaner_core::report::CycleStatus::Completed => "completed",
        gleaner_core::report::CycleStatus::Cancelled => "cancelled",
    };
    GC_CYCLES_TOTAL
        .with_label_values(&[result.mode.as_str(), status])
        .inc();
    GC_OBJECTS_SCANNED_TOTAL.inc_by(result.total_scanned);
    GC_OBJECTS_DELETED_TOTAL.inc_by(result.deleted_count);
    GC_OBJECTS_BACKED_UP_TOTAL.inc_by(result.backed_up_count);
    GC_OBJECT_ERRORS_TOTAL.inc_by(result.errors.len() as u64 + result.errors_truncated);
    GC_CYCLE_DURATION.observe(result.duration_seconds);
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_core::config::GcMode;

    #[test]
    fn metrics_register_and_record() {
        register_metrics();
        let mut result = GcResult::begin("op".to_string(), GcMode::Execute);
        result.total_scanned = 10;
        result.deleted_count = 2;
        record_cycle_result(&result);
        assert!(GC_OBJECTS_SCANNED_TOTAL.get() >= 10);
    }
}
