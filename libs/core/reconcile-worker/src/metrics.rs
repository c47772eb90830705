//! Prometheus metrics for controllers

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call once at startup. Later calls, or a recorder installed by someone
/// else, leave the existing state alone.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format, empty when not initialized.
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Outcome label for `reconcile_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Done,
    Requeue,
    TransientError,
    PermanentError,
}

impl ReconcileResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Done => "done",
            ReconcileResult::Requeue => "requeue",
            ReconcileResult::TransientError => "transient_error",
            ReconcileResult::PermanentError => "permanent_error",
        }
    }
}

/// Metric helpers labelled with the controller name.
#[derive(Clone)]
pub struct ControllerMetrics {
    controller: String,
}

impl ControllerMetrics {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn reconciled(&self, result: ReconcileResult, duration: Duration) {
        counter!(
            "reconcile_total",
            "controller" => self.controller.clone(),
            "result" => result.as_str()
        )
        .increment(1);

        histogram!(
            "reconcile_duration_seconds",
            "controller" => self.controller.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn requeued(&self, reason: &'static str) {
        counter!(
            "reconcile_requeues_total",
            "controller" => self.controller.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn queue_depth(&self, ready: usize, delayed: usize) {
        gauge!(
            "work_queue_depth",
            "controller" => self.controller.clone(),
            "state" => "ready"
        )
        .set(ready as f64);

        gauge!(
            "work_queue_depth",
            "controller" => self.controller.clone(),
            "state" => "delayed"
        )
        .set(delayed as f64);
    }

    pub fn workers_busy(&self, busy: usize) {
        gauge!(
            "reconcile_workers_busy",
            "controller" => self.controller.clone()
        )
        .set(busy as f64);
    }
}
