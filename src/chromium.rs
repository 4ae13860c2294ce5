//! chromiumoxide implementation of the browser traits
//!
//! Launches headless Chrome, drives the DevTools handler in a background
//! task and maps CDP failures onto typed navigation errors where they occur.

use crate::{
    create_browser_config, AnalyzerError, BrowserLauncher, BrowserSession, BrowserSettings,
    FetchSettings, NavigationErrorKind, NavigationResponse, PageSession, Viewport, WaitCondition,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventRequestWillBeSent, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventDomContentEventFired, EventLoadEventFired, NavigateParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EventExceptionThrown;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub struct ChromiumLauncher {
    settings: BrowserSettings,
    navigation_timeout: Duration,
    network_idle_quiet: Duration,
}

impl ChromiumLauncher {
    pub fn new(settings: BrowserSettings, fetch: &FetchSettings) -> Self {
        Self {
            settings,
            navigation_timeout: fetch.navigation_timeout,
            network_idle_quiet: fetch.network_idle_quiet,
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, AnalyzerError> {
        let profile_id = uuid::Uuid::new_v4().simple().to_string();
        let browser_config =
            create_browser_config(&self.settings, &profile_id, self.navigation_timeout)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AnalyzerError::BrowserUnavailable(format!("failed to launch Chrome: {e}")))?;

        // The handler is a Stream that must be polled for any CDP traffic to flow
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("Handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        tracing::info!("Handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        info!("Launched Chrome (profile {})", profile_id);

        Ok(Arc::new(ChromiumSession {
            browser: Mutex::new(browser),
            handler: handler_task,
            profile_id,
            network_idle_quiet: self.network_idle_quiet,
        }))
    }
}

pub struct ChromiumSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<Result<(), CdpError>>,
    profile_id: String,
    network_idle_quiet: Duration,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    fn is_connected(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn open_page(&self, viewport: &Viewport) -> Result<Box<dyn PageSession>, AnalyzerError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| AnalyzerError::BrowserUnavailable(format!("failed to open page: {e}")))?;

        let emulation_params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(AnalyzerError::PageError)?;

        if let Err(e) = page.execute(emulation_params).await {
            let _ = page.close().await;
            return Err(AnalyzerError::PageError(e.to_string()));
        }

        let script_errors = Arc::new(StdMutex::new(Vec::new()));
        let exceptions = match page.event_listener::<EventExceptionThrown>().await {
            Ok(events) => events,
            Err(e) => {
                let _ = page.close().await;
                return Err(AnalyzerError::PageError(e.to_string()));
            }
        };

        let sink = script_errors.clone();
        let collector = tokio::spawn(async move {
            let mut exceptions = exceptions;
            while let Some(event) = exceptions.next().await {
                let details = &event.exception_details;
                let message = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone());
                if let Ok(mut errors) = sink.lock() {
                    errors.push(message);
                }
            }
        });

        Ok(Box::new(ChromiumPage {
            page,
            script_errors,
            collector,
            network_idle_quiet: self.network_idle_quiet,
        }))
    }

    async fn version(&self) -> Result<String, AnalyzerError> {
        let version = self
            .browser
            .lock()
            .await
            .version()
            .await
            .map_err(|e| AnalyzerError::BrowserUnavailable(e.to_string()))?;
        Ok(version.product)
    }

    async fn close(&self) -> Result<(), AnalyzerError> {
        let result = {
            let mut browser = self.browser.lock().await;
            let closed = browser.close().await.map(|_| ());
            let _ = browser.wait().await;
            closed
        };
        self.handler.abort();

        for dir in [
            format!("/tmp/page-audit-chromium-{}", self.profile_id),
            format!("/tmp/page-audit-chromium-temp-{}", self.profile_id),
        ] {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }

        result.map_err(|e| AnalyzerError::BrowserUnavailable(format!("failed to close Chrome: {e}")))
    }
}

pub struct ChromiumPage {
    page: Page,
    script_errors: Arc<StdMutex<Vec<String>>>,
    collector: JoinHandle<()>,
    network_idle_quiet: Duration,
}

fn classify_cdp_error(err: &CdpError) -> NavigationErrorKind {
    match err {
        CdpError::Timeout => NavigationErrorKind::Timeout,
        CdpError::NoResponse | CdpError::Ws(_) | CdpError::ChannelSendError(_) => {
            NavigationErrorKind::TargetClosed
        }
        _ => NavigationErrorKind::Other,
    }
}

/// Wait until a navigation reaches `wait` or fails.
///
/// chromiumoxide answers the navigate command only after the page fired
/// `load`, so the command is raced against the lifecycle events instead of
/// awaited first. `failures` carries the net error text of failed main
/// document requests.
async fn await_navigation<N, D, L, F>(
    url: &str,
    wait: WaitCondition,
    navigation: N,
    mut dom_ready: D,
    mut loaded: L,
    mut failures: F,
) -> Result<(), AnalyzerError>
where
    N: Future<Output = Result<Option<String>, CdpError>>,
    D: Stream + Unpin,
    L: Stream + Unpin,
    F: Stream<Item = String> + Unpin,
{
    let failed = |error_text: &str| {
        ChromiumPage::navigation_error(url, NavigationErrorKind::from_net_error(error_text), error_text)
    };
    tokio::pin!(navigation);

    tokio::select! {
        biased;
        navigated = &mut navigation => match navigated {
            Ok(Some(error_text)) => Err(failed(&error_text)),
            Ok(None) => Ok(()),
            Err(e) => Err(ChromiumPage::navigation_error(url, classify_cdp_error(&e), e.to_string())),
        },
        Some(error_text) = failures.next() => Err(failed(&error_text)),
        Some(_) = dom_ready.next(), if wait == WaitCondition::DomContentLoaded => Ok(()),
        Some(_) = loaded.next(), if wait != WaitCondition::DomContentLoaded => Ok(()),
    }
}

impl ChromiumPage {
    fn navigation_error(url: &str, kind: NavigationErrorKind, detail: impl Into<String>) -> AnalyzerError {
        AnalyzerError::Navigation {
            kind,
            url: url.to_string(),
            detail: detail.into(),
        }
    }

    /// Net error text of every failed, uncancelled document request in the
    /// main frame. Subframe documents failing do not fail the navigation.
    async fn main_document_failures(&self) -> Result<impl Stream<Item = String> + Unpin, CdpError> {
        let main_frame = self.page.mainframe().await?;
        let mut documents = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let failed = self.page.event_listener::<EventLoadingFailed>().await?;
        let mut main_requests = HashSet::new();

        Ok(failed.filter_map(move |event| {
            // A request is announced before it can fail
            while let Some(Some(request)) = documents.next().now_or_never() {
                let in_main_frame = match (&main_frame, &request.frame_id) {
                    (Some(main), Some(frame)) => main == frame,
                    _ => true,
                };
                if in_main_frame && request.r#type == Some(ResourceType::Document) {
                    let id: &str = request.request_id.as_ref();
                    main_requests.insert(id.to_string());
                }
            }

            let id: &str = event.request_id.as_ref();
            let failed = event.r#type == ResourceType::Document
                && event.canceled != Some(true)
                && main_requests.contains(id);
            futures::future::ready(failed.then(|| event.error_text.clone()))
        }))
    }

    async fn navigate_inner(
        &self,
        url: &str,
        wait: WaitCondition,
    ) -> Result<NavigationResponse, AnalyzerError> {
        let cdp_err = |e: CdpError| Self::navigation_error(url, classify_cdp_error(&e), e.to_string());

        // Subscribe before navigating so no event is missed
        let mut responses = self.page.event_listener::<EventResponseReceived>().await.map_err(cdp_err)?;
        let mut dom_ready = self.page.event_listener::<EventDomContentEventFired>().await.map_err(cdp_err)?;
        let mut loaded = self.page.event_listener::<EventLoadEventFired>().await.map_err(cdp_err)?;
        let mut requests = self.page.event_listener::<EventRequestWillBeSent>().await.map_err(cdp_err)?;
        let failures = self.main_document_failures().await.map_err(cdp_err)?;

        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(AnalyzerError::PageError)?;
        let navigation = async {
            let navigated = self.page.execute(params).await?;
            Ok::<_, CdpError>(navigated.result.error_text.clone())
        };

        await_navigation(url, wait, navigation, &mut dom_ready, &mut loaded, failures).await?;

        let closed = || Self::navigation_error(url, NavigationErrorKind::TargetClosed, "page closed while loading");
        if wait == WaitCondition::NetworkIdle {
            while let Some(Some(_)) = requests.next().now_or_never() {}
            loop {
                tokio::select! {
                    next = requests.next() => {
                        if next.is_none() {
                            return Err(closed());
                        }
                    }
                    _ = sleep(self.network_idle_quiet) => break,
                }
            }
        }

        let mut response = NavigationResponse {
            final_url: self.page.url().await.ok().flatten(),
            ..Default::default()
        };

        let mut documents = Vec::new();
        while let Some(Some(event)) = responses.next().now_or_never() {
            if event.r#type == ResourceType::Document {
                documents.push(event);
            }
        }

        let main_document = documents
            .iter()
            .find(|e| Some(&e.response.url) == response.final_url.as_ref())
            .or_else(|| documents.first());

        if let Some(event) = main_document {
            response.status = u16::try_from(event.response.status).ok();
            if let Some(headers) = event.response.headers.inner().as_object() {
                response.headers = headers
                    .iter()
                    .map(|(k, v)| {
                        let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        (k.to_lowercase(), value)
                    })
                    .collect::<HashMap<_, _>>();
            }
        } else {
            debug!("No document response captured for {}", url);
        }

        Ok(response)
    }
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn navigate(
        &self,
        url: &str,
        wait: WaitCondition,
        limit: Duration,
    ) -> Result<NavigationResponse, AnalyzerError> {
        match timeout(limit, self.navigate_inner(url, wait)).await {
            Ok(result) => result,
            Err(_) => Err(Self::navigation_error(
                url,
                NavigationErrorKind::Timeout,
                format!("no {:?} within {:?}", wait, limit),
            )),
        }
    }

    async fn content(&self) -> Result<String, AnalyzerError> {
        self.page
            .content()
            .await
            .map_err(|e| AnalyzerError::PageError(format!("failed to read page content: {e}")))
    }

    fn script_errors(&self) -> Vec<String> {
        self.script_errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<(), AnalyzerError> {
        self.collector.abort();
        self.page.clone().close().await.map_err(|e| {
            warn!("Failed to close page: {}", e);
            AnalyzerError::PageError(e.to_string())
        })
    }
}
