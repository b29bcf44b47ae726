//! Prometheus metrics for volume attach/detach
//!
//! Attach and detach are timed and labelled with the error kind on failure,
//! best-effort steps that failed are counted by step, and the health monitor
//! publishes one gauge per WWN. Nothing is exported unless the binary installs
//! the Prometheus exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::types::Advisory;

pub mod names {
    /// Counter: attach/detach runs by operation and outcome (`success` or
    /// the error kind)
    pub const VOLUME_OPERATIONS_TOTAL: &str = "san_mounter_volume_operations_total";
    /// Histogram: wall time of attach/detach, rescans included
    pub const VOLUME_OPERATION_DURATION_SECONDS: &str =
        "san_mounter_volume_operation_duration_seconds";
    /// Counter: best-effort steps that failed without stopping an operation
    pub const ADVISORIES_TOTAL: &str = "san_mounter_advisories_total";
    /// Gauge: 1 while a monitored multipath device has no active path
    pub const DEVICE_FAULTY: &str = "san_mounter_device_faulty";
}

/// Serve `/metrics` on `addr`. Must be called at most once per process.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::VOLUME_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::VOLUME_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Count the advisories an operation finished with.
pub fn record_advisories(operation: &str, advisories: &[Advisory]) {
    for advisory in advisories {
        counter!(names::ADVISORIES_TOTAL, "operation" => operation.to_string(), "step" => advisory.step)
            .increment(1);
    }
}

pub fn set_device_faulty(wwn: &str, faulty: bool) {
    gauge!(names::DEVICE_FAULTY, "wwn" => wwn.to_string()).set(if faulty { 1.0 } else { 0.0 });
}

/// Times one attach or detach; consumed by `success` or `failure`.
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        record_operation(self.operation, "success", self.start.elapsed().as_secs_f64());
    }

    /// `error_kind` is [`crate::MounterError::kind`] of the deepest error.
    pub fn failure(self, error_kind: &str) {
        record_operation(self.operation, error_kind, self.start.elapsed().as_secs_f64());
    }
}
