//! Page fetching on top of the shared browser
//!
//! Every attempt borrows one page session, navigates with a wait condition
//! picked from a fallback ladder and captures the rendered HTML, the main
//! document's status and headers, and uncaught script errors.

use crate::{
    AnalyzerError, BrowserManager, FetchSettings, Metrics, PageSession, Viewport, WaitCondition,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Wait conditions per attempt: strict first, then the most permissive,
/// then full load.
const WAIT_LADDER: [WaitCondition; 3] = [
    WaitCondition::NetworkIdle,
    WaitCondition::DomContentLoaded,
    WaitCondition::Load,
];

pub fn wait_condition_for(attempt: usize) -> WaitCondition {
    WAIT_LADDER
        .get(attempt)
        .copied()
        .unwrap_or(WaitCondition::Load)
}

/// Everything captured from one successful page load
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    /// Main document response headers, names lowercased
    pub headers: HashMap<String, String>,
    pub console_errors: Vec<String>,
    pub status: Option<u16>,
    pub final_url: String,
}

/// Owns a page session for the duration of one fetch attempt
///
/// `close()` is the normal path. If the lease is dropped without it, for
/// example because the surrounding future was cancelled, the close is
/// spawned on the runtime the lease was created on.
pub struct PageLease {
    page: Option<Box<dyn PageSession>>,
    url: String,
    metrics: Arc<Metrics>,
    runtime_handle: tokio::runtime::Handle,
}

impl PageLease {
    pub fn new(page: Box<dyn PageSession>, url: &str, metrics: Arc<Metrics>) -> Self {
        metrics.open_page_sessions.increment(1.0);
        Self {
            page: Some(page),
            url: url.to_string(),
            metrics,
            runtime_handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn page(&self) -> Result<&dyn PageSession, AnalyzerError> {
        self.page
            .as_deref()
            .ok_or_else(|| AnalyzerError::PageError("page session already released".to_string()))
    }

    pub async fn close(mut self) {
        if let Some(page) = self.page.take() {
            self.metrics.open_page_sessions.decrement(1.0);
            match page.close().await {
                Ok(()) => debug!("Page session closed for {}", self.url),
                Err(e) => warn!("Failed to close page session for {}: {}", self.url, e),
            }
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.metrics.open_page_sessions.decrement(1.0);
            let url = std::mem::take(&mut self.url);
            debug!("Page lease dropped without close, cleaning up {}", url);
            self.runtime_handle.spawn(async move {
                if let Err(e) = page.close().await {
                    warn!("Background page close failed for {}: {}", url, e);
                }
            });
        }
    }
}

pub struct PageFetcher {
    manager: Arc<BrowserManager>,
    settings: FetchSettings,
    viewport: Viewport,
    metrics: Arc<Metrics>,
}

impl PageFetcher {
    pub fn new(
        manager: Arc<BrowserManager>,
        settings: FetchSettings,
        viewport: Viewport,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            manager,
            settings,
            viewport,
            metrics,
        }
    }

    /// Load `url` in the shared browser, retrying retryable failures.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, AnalyzerError> {
        let max_attempts = self.settings.max_attempts;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.metrics.navigation_retries.increment(1);
                sleep(self.settings.retry_delay).await;
            }

            let wait = wait_condition_for(attempt);
            debug!(
                "Fetching {} (attempt {}/{}, waiting for {:?})",
                url,
                attempt + 1,
                max_attempts,
                wait
            );

            match self.fetch_once(url, wait).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    if let AnalyzerError::Navigation { kind, .. } = &e {
                        warn!("Attempt {} for {} failed ({}): {}", attempt + 1, url, kind.explanation(), e);
                    } else {
                        warn!("Attempt {} for {} failed: {}", attempt + 1, url, e);
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| AnalyzerError::PageError("no fetch attempts configured".to_string())))
    }

    async fn fetch_once(&self, url: &str, wait: WaitCondition) -> Result<FetchedPage, AnalyzerError> {
        let browser = self.manager.acquire().await?;
        let page = browser.open_page(&self.viewport).await?;
        let lease = PageLease::new(page, url, self.metrics.clone());

        let result = self.capture(&lease, url, wait).await;
        lease.close().await;
        result
    }

    async fn capture(
        &self,
        lease: &PageLease,
        url: &str,
        wait: WaitCondition,
    ) -> Result<FetchedPage, AnalyzerError> {
        let page = lease.page()?;
        let response = page
            .navigate(url, wait, self.settings.navigation_timeout)
            .await?;

        if let Some(status) = response.status.filter(|s| *s >= 400) {
            warn!("{} answered with HTTP {}, analyzing the returned page anyway", url, status);
        }

        // Late script errors need a moment to surface
        sleep(self.settings.settle_delay).await;

        let html = page.content().await?;
        let console_errors = page.script_errors();
        let final_url = response.final_url.unwrap_or_else(|| url.to_string());

        info!(
            "Fetched {} ({} bytes, status {:?}, {} script errors)",
            final_url,
            html.len(),
            response.status,
            console_errors.len()
        );

        Ok(FetchedPage {
            html,
            headers: response.headers,
            console_errors,
            status: response.status,
            final_url,
        })
    }
}
