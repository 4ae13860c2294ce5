//! External Lighthouse audit
//!
//! Runs the `lighthouse` CLI as a child process with its own headless Chrome,
//! reads the JSON report it writes into a temporary directory and reduces it
//! to category scores and a handful of lab metrics.

use crate::{AnalyzerError, AuditSettings};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CATEGORIES: &str = "performance,accessibility,best-practices,seo";

const METRIC_AUDITS: [&str; 4] = [
    "first-contentful-paint",
    "largest-contentful-paint",
    "speed-index",
    "cumulative-layout-shift",
];

/// Time the audit process group gets between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Scores (0-100) and lab metrics taken from one Lighthouse report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditScores {
    pub performance: u8,
    pub accessibility: u8,
    pub best_practices: u8,
    pub seo: u8,
    /// Milliseconds
    pub first_contentful_paint: f64,
    /// Milliseconds
    pub largest_contentful_paint: f64,
    /// Milliseconds
    pub speed_index: f64,
    pub cumulative_layout_shift: f64,
    pub render_blocking_resources: usize,
    /// Human readable values as Lighthouse displays them, keyed by audit id
    pub display_values: BTreeMap<String, String>,
}

impl AuditScores {
    /// Extract scores from a Lighthouse JSON report. Missing values count as 0.
    pub fn from_report(report: &Value) -> Self {
        let category = |key: &str| -> u8 {
            report["categories"][key]["score"]
                .as_f64()
                .map(|score| (score * 100.0).round().clamp(0.0, 100.0) as u8)
                .unwrap_or(0)
        };
        let numeric = |id: &str| -> f64 {
            report["audits"][id]["numericValue"]
                .as_f64()
                .unwrap_or(0.0)
        };

        let display_values = METRIC_AUDITS
            .iter()
            .filter_map(|id| {
                report["audits"][*id]["displayValue"]
                    .as_str()
                    .map(|value| (id.to_string(), value.to_string()))
            })
            .collect();

        Self {
            performance: category("performance"),
            accessibility: category("accessibility"),
            best_practices: category("best-practices"),
            seo: category("seo"),
            first_contentful_paint: numeric("first-contentful-paint"),
            largest_contentful_paint: numeric("largest-contentful-paint"),
            speed_index: numeric("speed-index"),
            cumulative_layout_shift: numeric("cumulative-layout-shift"),
            render_blocking_resources: report["audits"]["render-blocking-resources"]["details"]
                ["items"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0),
            display_values,
        }
    }
}

/// Audit section of the report: scores, or why there are none
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AuditBlock {
    Completed(AuditScores),
    Failed {
        error: String,
        #[serde(rename = "timedOut")]
        timed_out: bool,
    },
}

impl AuditBlock {
    pub fn from_result(result: Result<AuditScores, AnalyzerError>) -> Self {
        match result {
            Ok(scores) => AuditBlock::Completed(scores),
            Err(e) => AuditBlock::Failed {
                timed_out: e.is_timeout(),
                error: e.to_string(),
            },
        }
    }

    pub fn disabled() -> Self {
        AuditBlock::Failed {
            error: "disabled".to_string(),
            timed_out: false,
        }
    }

    pub fn scores(&self) -> Option<&AuditScores> {
        match self {
            AuditBlock::Completed(scores) => Some(scores),
            AuditBlock::Failed { .. } => None,
        }
    }
}

/// Process group of one audit child.
///
/// Lighthouse launches its own Chrome, so signalling only the direct child
/// leaves the browser behind. The child is started as a group leader and
/// every signal goes to the whole group. Dropping the guard kills whatever
/// is left of the group.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.leader {
            signal_group(pgid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.leader.take() {
            signal_group(pgid, nix::sys::signal::Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        self.leader.take();
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {:?} to audit process group {}: {}", signal, pgid, e),
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Auditor: Send + Sync {
    async fn run_audit(&self, url: &str) -> Result<AuditScores, AnalyzerError>;
}

pub struct LighthouseAuditor {
    settings: AuditSettings,
}

impl LighthouseAuditor {
    pub fn new(settings: AuditSettings) -> Self {
        Self { settings }
    }

    fn command(&self, url: &str, report_path: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.settings.lighthouse_path);
        cmd.arg(url)
            .arg("--output=json")
            .arg("--output-path")
            .arg(report_path)
            .arg("--quiet")
            .arg("--preset=desktop")
            .arg(format!("--only-categories={CATEGORIES}"));

        if !self.settings.chrome_flags.is_empty() {
            cmd.arg(format!("--chrome-flags={}", self.settings.chrome_flags.join(" ")));
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Auditor for LighthouseAuditor {
    async fn run_audit(&self, url: &str) -> Result<AuditScores, AnalyzerError> {
        let temp_dir = TempDir::new()?;
        let report_path = temp_dir.path().join("lighthouse-report.json");

        debug!("Starting Lighthouse audit for {}", url);
        let mut child = self.command(url, &report_path).spawn().map_err(|e| {
            AnalyzerError::Audit(format!(
                "failed to start '{}': {e}",
                self.settings.lighthouse_path
            ))
        })?;
        let mut group = ProcessGroup::of(&child);

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut output).await;
            }
            output
        });

        let status = match timeout(self.settings.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "Lighthouse audit for {} exceeded {:?}, killing it",
                    url, self.settings.timeout
                );
                group.terminate();
                if timeout(TERM_GRACE, child.wait()).await.is_err() {
                    group.kill();
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill Lighthouse process: {}", e);
                    }
                }
                group.kill();
                stderr_task.abort();
                return Err(AnalyzerError::timeout(
                    "lighthouse audit",
                    self.settings.timeout,
                ));
            }
        };
        // Stray browsers hold the stderr pipe open
        group.kill();

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(AnalyzerError::Audit(format!(
                "lighthouse exited with {status}: {tail}"
            )));
        }

        let raw = tokio::fs::read_to_string(&report_path).await.map_err(|e| {
            AnalyzerError::Audit(format!("lighthouse report unreadable: {e}"))
        })?;
        let report: Value = serde_json::from_str(&raw)?;
        let scores = AuditScores::from_report(&report);

        info!(
            "Lighthouse audit for {}: performance={} seo={}",
            url, scores.performance, scores.seo
        );
        Ok(scores)
    }
}
