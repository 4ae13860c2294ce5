use crate::{BrowserManager, BrowserStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Consecutive launch failures at which the browser counts as critical
const CRITICAL_LAUNCH_FAILURES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Result of one health sweep
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub overall: HealthLevel,
    pub browser: BrowserStatus,
    /// The sweep closed an idle or disconnected browser
    pub released_browser: bool,
    pub checked_at: DateTime<Utc>,
}

/// Grade a manager snapshot. A missing browser is healthy: it is launched
/// lazily on the next request.
pub fn assess(status: &BrowserStatus) -> HealthLevel {
    if status.shutting_down || status.consecutive_failures >= CRITICAL_LAUNCH_FAILURES {
        HealthLevel::Critical
    } else if status.consecutive_failures > 0 || (status.has_browser && !status.connected) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

/// Periodic sweep over the shared browser
///
/// Each tick releases a browser that sat idle past its timeout or lost its
/// connection, then logs the resulting health level.
pub struct HealthMonitor {
    manager: Arc<BrowserManager>,
    interval: Duration,
    last: Mutex<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<BrowserManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            last: Mutex::new(None),
        }
    }

    pub async fn check(&self) -> HealthSnapshot {
        let started = Instant::now();
        let released_browser = self.manager.close_if_idle().await;
        let browser = self.manager.status();
        let overall = assess(&browser);

        match overall {
            HealthLevel::Healthy => debug!("Browser health: OK"),
            HealthLevel::Warning => warn!(
                "Browser health: WARNING - connected={}, consecutive failures={}",
                browser.connected, browser.consecutive_failures
            ),
            HealthLevel::Critical => error!(
                "Browser health: CRITICAL - shutting down={}, consecutive failures={}",
                browser.shutting_down, browser.consecutive_failures
            ),
        }
        debug!("Health check completed in {:?}", started.elapsed());

        let snapshot = HealthSnapshot {
            overall,
            browser,
            released_browser,
            checked_at: Utc::now(),
        };

        if let Ok(mut last) = self.last.lock() {
            *last = Some(snapshot.clone());
        }
        snapshot
    }

    /// Most recent sweep result, if any sweep has run
    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    /// Sweep until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!("Health monitor started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.check().await;
                    if snapshot.released_browser {
                        info!("Health sweep released the shared browser");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> BrowserStatus {
        BrowserStatus {
            has_browser: true,
            connected: true,
            initializing: false,
            shutting_down: false,
            idle_seconds: Some(3),
            uptime_seconds: Some(120),
            launch_count: 1,
            consecutive_failures: 0,
            idle_timeout_seconds: 300,
        }
    }

    #[test]
    fn test_assess_connected_browser_is_healthy() {
        assert_eq!(assess(&status()), HealthLevel::Healthy);
    }

    #[test]
    fn test_assess_missing_browser_is_healthy() {
        let mut s = status();
        s.has_browser = false;
        s.connected = false;
        assert_eq!(assess(&s), HealthLevel::Healthy);
    }

    #[test]
    fn test_assess_degraded_states() {
        let mut disconnected = status();
        disconnected.connected = false;
        assert_eq!(assess(&disconnected), HealthLevel::Warning);

        let mut failing = status();
        failing.consecutive_failures = 1;
        assert_eq!(assess(&failing), HealthLevel::Warning);

        failing.consecutive_failures = CRITICAL_LAUNCH_FAILURES;
        assert_eq!(assess(&failing), HealthLevel::Critical);

        let mut stopping = status();
        stopping.shutting_down = true;
        assert_eq!(assess(&stopping), HealthLevel::Critical);
    }
}
