//! Lifecycle management for the single shared Chrome instance
//!
//! The manager lazily launches one browser, validates it, hands it out to any
//! number of concurrent callers and recycles it when it disconnects or sits
//! idle for too long. Only (re)initialization is serialized: callers that
//! arrive while a launch is in flight wait for it instead of starting their
//! own.
//!
//! The browser itself sits behind the [`BrowserLauncher`], [`BrowserSession`]
//! and [`PageSession`] traits so the Chromium adapter can be swapped for fakes.

use crate::{AnalyzerError, BrowserSettings, Metrics, Viewport};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Load condition a navigation waits for before it is considered done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitCondition {
    /// `DOMContentLoaded` fired
    DomContentLoaded,
    /// The `load` event fired
    Load,
    /// `load` fired and no new requests started for a quiet period
    NetworkIdle,
}

/// What the main document response looked like
#[derive(Debug, Clone, Default)]
pub struct NavigationResponse {
    pub status: Option<u16>,
    /// Response headers with lowercased names
    pub headers: HashMap<String, String>,
    pub final_url: Option<String>,
}

/// One isolated page opened inside the shared browser
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Navigate and wait for `wait`. Must fail with a typed
    /// [`AnalyzerError::Navigation`] or [`AnalyzerError::Timeout`].
    async fn navigate(
        &self,
        url: &str,
        wait: WaitCondition,
        timeout: Duration,
    ) -> Result<NavigationResponse, AnalyzerError>;

    /// Serialized DOM after navigation
    async fn content(&self) -> Result<String, AnalyzerError>;

    /// Uncaught script errors observed so far
    fn script_errors(&self) -> Vec<String>;

    async fn close(&self) -> Result<(), AnalyzerError>;
}

/// A running browser process
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn open_page(&self, viewport: &Viewport) -> Result<Box<dyn PageSession>, AnalyzerError>;

    async fn version(&self) -> Result<String, AnalyzerError>;

    async fn close(&self) -> Result<(), AnalyzerError>;
}

/// Starts browser processes for the manager
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, AnalyzerError>;
}

struct ManagerState {
    browser: Option<Arc<dyn BrowserSession>>,
    last_used: Instant,
    launched_at: Option<Instant>,
}

/// Why the current browser cannot be handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecycleReason {
    Missing,
    Disconnected,
    Idle,
}

/// Holds the init lock and keeps the `initializing` flag raised until dropped.
struct InitGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    flag: &'a AtomicBool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct BrowserManager {
    launcher: Arc<dyn BrowserLauncher>,
    settings: BrowserSettings,
    state: Mutex<ManagerState>,
    init_lock: AsyncMutex<()>,
    initializing: AtomicBool,
    consecutive_failures: AtomicUsize,
    launch_count: AtomicUsize,
    is_shutting_down: AtomicBool,
    metrics: Arc<Metrics>,
}

impl BrowserManager {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        settings: BrowserSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            launcher,
            settings,
            state: Mutex::new(ManagerState {
                browser: None,
                last_used: Instant::now(),
                launched_at: None,
            }),
            init_lock: AsyncMutex::new(()),
            initializing: AtomicBool::new(false),
            consecutive_failures: AtomicUsize::new(0),
            launch_count: AtomicUsize::new(0),
            is_shutting_down: AtomicBool::new(false),
            metrics,
        }
    }

    /// Get the shared browser, launching or recycling it first if needed.
    pub async fn acquire(&self) -> Result<Arc<dyn BrowserSession>, AnalyzerError> {
        self.ensure_running()?;

        if let Ok(browser) = self.checkout() {
            return Ok(browser);
        }

        let _guard = self.enter_initialization().await?;

        // Another caller may have finished a launch while we waited.
        let reason = match self.checkout() {
            Ok(browser) => return Ok(browser),
            Err(reason) => reason,
        };

        self.ensure_running()?;
        info!("Initializing shared browser ({:?})", reason);
        let browser = self.reinitialize().await?;
        self.touch();
        Ok(browser)
    }

    /// Close the current browser and launch a fresh one immediately.
    pub async fn restart(&self) -> Result<(), AnalyzerError> {
        self.ensure_running()?;
        let _guard = self.enter_initialization().await?;

        info!("Restarting shared browser on request");
        self.metrics.browser_restarts.increment(1);
        self.reinitialize().await.map(|_| ())
    }

    /// Close the browser if it sat idle past the timeout or lost its
    /// connection. Skipped while an initialization is running.
    pub async fn close_if_idle(&self) -> bool {
        let Ok(_lock) = self.init_lock.try_lock() else {
            return false;
        };

        let stale = {
            let mut state = self.lock_state();
            let disconnected = state
                .browser
                .as_ref()
                .map(|b| !b.is_connected())
                .unwrap_or(false);
            let idle = state.browser.is_some() && state.last_used.elapsed() > self.settings.idle_timeout;

            if disconnected || idle {
                info!(
                    "Releasing shared browser (disconnected={}, idle={:?})",
                    disconnected,
                    state.last_used.elapsed()
                );
                state.launched_at = None;
                state.browser.take()
            } else {
                None
            }
        };

        match stale {
            Some(browser) => {
                Self::close_quietly(browser).await;
                true
            }
            None => false,
        }
    }

    /// Liveness of the current browser without launching one.
    pub fn is_healthy(&self) -> bool {
        self.lock_state()
            .browser
            .as_ref()
            .map(|b| b.is_connected())
            .unwrap_or(false)
    }

    pub fn status(&self) -> BrowserStatus {
        let state = self.lock_state();
        let connected = state
            .browser
            .as_ref()
            .map(|b| b.is_connected())
            .unwrap_or(false);

        BrowserStatus {
            has_browser: state.browser.is_some(),
            connected,
            initializing: self.initializing.load(Ordering::SeqCst),
            shutting_down: self.is_shutting_down.load(Ordering::SeqCst),
            idle_seconds: state
                .browser
                .as_ref()
                .map(|_| state.last_used.elapsed().as_secs()),
            uptime_seconds: state.launched_at.map(|t| t.elapsed().as_secs()),
            launch_count: self.launch_count.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            idle_timeout_seconds: self.settings.idle_timeout.as_secs(),
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser manager...");
        self.is_shutting_down.store(true, Ordering::SeqCst);

        // Let an in-flight launch finish so its browser is closed too.
        let _lock = self.init_lock.lock().await;
        let browser = {
            let mut state = self.lock_state();
            state.launched_at = None;
            state.browser.take()
        };

        if let Some(browser) = browser {
            Self::close_quietly(browser).await;
        }

        info!("Browser manager shutdown complete");
    }

    fn ensure_running(&self) -> Result<(), AnalyzerError> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            Err(AnalyzerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.lock_state().last_used = Instant::now();
    }

    /// Hand out the current browser if it is usable, recording the use.
    fn checkout(&self) -> Result<Arc<dyn BrowserSession>, RecycleReason> {
        let mut state = self.lock_state();

        let reason = match state.browser.as_ref() {
            None => RecycleReason::Missing,
            Some(browser) if !browser.is_connected() => RecycleReason::Disconnected,
            Some(_) if state.last_used.elapsed() > self.settings.idle_timeout => RecycleReason::Idle,
            Some(browser) => {
                let browser = browser.clone();
                state.last_used = Instant::now();
                return Ok(browser);
            }
        };

        Err(reason)
    }

    /// Wait, in fixed increments, until this caller owns the initialization
    /// section. Gives up after `init_wait`.
    async fn enter_initialization(&self) -> Result<InitGuard<'_>, AnalyzerError> {
        let deadline = Instant::now() + self.settings.init_wait;

        loop {
            if let Ok(lock) = self.init_lock.try_lock() {
                self.initializing.store(true, Ordering::SeqCst);
                return Ok(InitGuard {
                    _lock: lock,
                    flag: &self.initializing,
                });
            }

            if Instant::now() >= deadline {
                warn!(
                    "Gave up waiting {:?} for browser initialization",
                    self.settings.init_wait
                );
                return Err(AnalyzerError::BrowserUnavailable(format!(
                    "browser initialization did not finish within {:?}",
                    self.settings.init_wait
                )));
            }

            debug!("Browser initialization in progress, waiting");
            sleep(self.settings.init_poll_interval).await;
        }
    }

    /// Replace the current browser. Caller must hold the init guard.
    async fn reinitialize(&self) -> Result<Arc<dyn BrowserSession>, AnalyzerError> {
        let old = {
            let mut state = self.lock_state();
            state.launched_at = None;
            state.browser.take()
        };
        if let Some(old) = old {
            Self::close_quietly(old).await;
        }

        let retry = &self.settings.launch_retry;
        let mut last_error = String::from("no launch attempted");

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                let delay = retry.delay_for(attempt - 1);
                debug!(
                    "Retrying browser launch after {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    retry.max_attempts
                );
                sleep(delay).await;
            }

            self.launch_count.fetch_add(1, Ordering::SeqCst);
            self.metrics.browser_launches.increment(1);

            let outcome = match self.launcher.launch().await {
                Ok(browser) => match self.validate(&browser).await {
                    Ok(()) => Ok(browser),
                    Err(e) => {
                        Self::close_quietly(browser).await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(browser) => {
                    {
                        let mut state = self.lock_state();
                        state.browser = Some(browser.clone());
                        state.last_used = Instant::now();
                        state.launched_at = Some(Instant::now());
                    }
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    match browser.version().await {
                        Ok(version) => info!("Shared browser ready: {} (attempt {})", version, attempt + 1),
                        Err(e) => info!("Shared browser ready (attempt {}), version unknown: {}", attempt + 1, e),
                    }
                    return Ok(browser);
                }
                Err(e) => {
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                    self.metrics.browser_launch_failures.increment(1);
                    warn!(
                        "Browser launch attempt {}/{} failed: {}",
                        attempt + 1,
                        retry.max_attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        error!(
            "Browser launch failed after {} attempts: {}",
            retry.max_attempts, last_error
        );
        Err(AnalyzerError::BrowserLaunchFailed {
            attempts: retry.max_attempts,
            last_error,
        })
    }

    /// A freshly launched browser must be able to open and close a page.
    async fn validate(&self, browser: &Arc<dyn BrowserSession>) -> Result<(), AnalyzerError> {
        if !browser.is_connected() {
            return Err(AnalyzerError::BrowserUnavailable(
                "browser disconnected right after launch".to_string(),
            ));
        }

        let page = browser.open_page(&self.settings.viewport).await?;
        page.close().await
    }

    async fn close_quietly(browser: Arc<dyn BrowserSession>) {
        if let Err(e) = browser.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
    }
}

/// Snapshot of the manager for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserStatus {
    pub has_browser: bool,
    pub connected: bool,
    pub initializing: bool,
    pub shutting_down: bool,
    pub idle_seconds: Option<u64>,
    pub uptime_seconds: Option<u64>,
    pub launch_count: usize,
    pub consecutive_failures: usize,
    pub idle_timeout_seconds: u64,
}
