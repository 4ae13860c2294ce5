use crate::AnalyzerError;
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Metric handles used across the service
///
/// Handles are registered against whatever recorder is installed when
/// [`Metrics::new`] runs; without one they are no-ops.
pub struct Metrics {
    pub analyses_completed: Counter,
    pub analyses_failed: Counter,
    pub analysis_duration: Histogram,
    pub browser_launches: Counter,
    pub browser_launch_failures: Counter,
    pub browser_restarts: Counter,
    pub open_page_sessions: Gauge,
    pub navigation_retries: Counter,
    pub audit_failures: Counter,
    pub audit_timeouts: Counter,
    pub certificate_failures: Counter,
    pub timeout_errors: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            analyses_completed: register_counter!("page_audit_analyses_completed_total"),
            analyses_failed: register_counter!("page_audit_analyses_failed_total"),
            analysis_duration: register_histogram!("page_audit_analysis_duration_seconds"),
            browser_launches: register_counter!("page_audit_browser_launches_total"),
            browser_launch_failures: register_counter!("page_audit_browser_launch_failures_total"),
            browser_restarts: register_counter!("page_audit_browser_restarts_total"),
            open_page_sessions: register_gauge!("page_audit_open_page_sessions"),
            navigation_retries: register_counter!("page_audit_navigation_retries_total"),
            audit_failures: register_counter!("page_audit_lighthouse_failures_total"),
            audit_timeouts: register_counter!("page_audit_lighthouse_timeouts_total"),
            certificate_failures: register_counter!("page_audit_certificate_failures_total"),
            timeout_errors: register_counter!("page_audit_timeout_errors_total"),
        }
    }

    pub fn record_analysis(&self, duration: Duration, success: bool) {
        if success {
            self.analyses_completed.increment(1);
        } else {
            self.analyses_failed.increment(1);
        }

        self.analysis_duration.record(duration.as_secs_f64());
    }

    pub fn record_error(&self, error: &AnalyzerError) {
        if error.is_timeout() {
            self.timeout_errors.increment(1);
        }
    }

    pub fn record_audit_failure(&self, timed_out: bool) {
        if timed_out {
            self.audit_timeouts.increment(1);
        } else {
            self.audit_failures.increment(1);
        }
    }

    pub fn record_certificate_failure(&self) {
        self.certificate_failures.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global Prometheus recorder.
///
/// Must run before any [`Metrics`] is created, otherwise its handles stay
/// detached from the exporter.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, AnalyzerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AnalyzerError::ConfigurationError(format!("metrics recorder: {e}")))?;

    info!("Prometheus metrics recorder installed");
    Ok(handle)
}
