#[cfg(test)]
mod integration_tests {
    use crate::{
        create_router, AnalysisReport, Analyzer, AnalyzerError, AppState, AuditBlock, AuditScores,
        Auditor, BrowserLauncher, BrowserManager, BrowserSession, CertificateBlock,
        CertificateInfo, CertificateProbe, Config, HealthLevel, HealthMonitor, Metrics,
        MockAuditor, MockCertificateProbe, NavigationErrorKind, NavigationResponse, PageFetcher,
        PageSession, Viewport, WaitCondition,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;

    const SHORT_TITLE_PAGE: &str =
        "<html><head><title>Hello</title></head><body><h1>Hi</h1></body></html>";

    #[derive(Default)]
    struct Counters {
        launches: AtomicUsize,
        browsers_closed: AtomicUsize,
        pages_opened: AtomicUsize,
        pages_closed: AtomicUsize,
        double_closes: AtomicUsize,
        navigations: AtomicUsize,
        waits: Mutex<Vec<WaitCondition>>,
    }

    #[derive(Clone)]
    struct FakeBehavior {
        html: String,
        status: u16,
        headers: HashMap<String, String>,
        navigation_error: Option<NavigationErrorKind>,
        navigation_delay: Duration,
        launch_delay: Duration,
    }

    impl Default for FakeBehavior {
        fn default() -> Self {
            Self {
                html: SHORT_TITLE_PAGE.to_string(),
                status: 200,
                headers: HashMap::new(),
                navigation_error: None,
                navigation_delay: Duration::ZERO,
                launch_delay: Duration::ZERO,
            }
        }
    }

    struct FakeLauncher {
        counters: Arc<Counters>,
        behavior: FakeBehavior,
        failures_left: AtomicUsize,
        page_open_failures: Arc<AtomicUsize>,
        connected: Arc<AtomicBool>,
    }

    impl FakeLauncher {
        fn new(behavior: FakeBehavior) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                behavior,
                failures_left: AtomicUsize::new(0),
                page_open_failures: Arc::new(AtomicUsize::new(0)),
                connected: Arc::new(AtomicBool::new(true)),
            }
        }

        fn failing_first(self, launches: usize) -> Self {
            self.failures_left.store(launches, Ordering::SeqCst);
            self
        }

        /// Launches succeed but the first `opens` pages fail to open
        fn failing_page_opens(self, opens: usize) -> Self {
            self.page_open_failures.store(opens, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Arc<dyn BrowserSession>, AnalyzerError> {
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.behavior.launch_delay).await;

            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AnalyzerError::BrowserUnavailable(
                    "chrome exited during startup".to_string(),
                ));
            }

            self.connected.store(true, Ordering::SeqCst);
            Ok(Arc::new(FakeBrowser {
                counters: self.counters.clone(),
                behavior: self.behavior.clone(),
                page_open_failures: self.page_open_failures.clone(),
                connected: self.connected.clone(),
            }))
        }
    }

    struct FakeBrowser {
        counters: Arc<Counters>,
        behavior: FakeBehavior,
        page_open_failures: Arc<AtomicUsize>,
        connected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BrowserSession for FakeBrowser {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn open_page(&self, _viewport: &Viewport) -> Result<Box<dyn PageSession>, AnalyzerError> {
            let failing = self
                .page_open_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AnalyzerError::PageError("target crashed".to_string()));
            }

            self.counters.pages_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage {
                counters: self.counters.clone(),
                behavior: self.behavior.clone(),
                closed: AtomicBool::new(false),
            }))
        }

        async fn version(&self) -> Result<String, AnalyzerError> {
            Ok("HeadlessChrome/120.0".to_string())
        }

        async fn close(&self) -> Result<(), AnalyzerError> {
            self.counters.browsers_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakePage {
        counters: Arc<Counters>,
        behavior: FakeBehavior,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PageSession for FakePage {
        async fn navigate(
            &self,
            url: &str,
            wait: WaitCondition,
            _timeout: Duration,
        ) -> Result<NavigationResponse, AnalyzerError> {
            self.counters.navigations.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut waits) = self.counters.waits.lock() {
                waits.push(wait);
            }
            tokio::time::sleep(self.behavior.navigation_delay).await;

            if let Some(kind) = self.behavior.navigation_error {
                return Err(AnalyzerError::Navigation {
                    kind,
                    url: url.to_string(),
                    detail: format!("{kind:?}"),
                });
            }

            Ok(NavigationResponse {
                status: Some(self.behavior.status),
                headers: self.behavior.headers.clone(),
                final_url: Some(url.to_string()),
            })
        }

        async fn content(&self) -> Result<String, AnalyzerError> {
            Ok(self.behavior.html.clone())
        }

        fn script_errors(&self) -> Vec<String> {
            Vec::new()
        }

        async fn close(&self) -> Result<(), AnalyzerError> {
            if self.closed.swap(true, Ordering::SeqCst) {
                self.counters.double_closes.fetch_add(1, Ordering::SeqCst);
            }
            self.counters.pages_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowProber(Duration);

    #[async_trait]
    impl CertificateProbe for SlowProber {
        async fn probe(&self, _hostname: &str) -> Result<CertificateInfo, AnalyzerError> {
            tokio::time::sleep(self.0).await;
            Err(AnalyzerError::Certificate("unreachable".to_string()))
        }
    }

    struct SlowAuditor(Duration);

    #[async_trait]
    impl Auditor for SlowAuditor {
        async fn run_audit(&self, _url: &str) -> Result<AuditScores, AnalyzerError> {
            tokio::time::sleep(self.0).await;
            Ok(AuditScores::default())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.browser.init_wait = Duration::from_secs(5);
        config.browser.init_poll_interval = Duration::from_millis(10);
        config.browser.launch_retry.max_attempts = 2;
        config.browser.launch_retry.initial_delay = Duration::from_millis(5);
        config.browser.launch_retry.max_delay = Duration::from_millis(20);
        config.fetch.navigation_timeout = Duration::from_secs(2);
        config.fetch.retry_delay = Duration::from_millis(5);
        config.fetch.settle_delay = Duration::ZERO;
        config.audit.enabled = false;
        config.audit.timeout = Duration::from_millis(100);
        config.certificate.timeout = Duration::from_millis(100);
        config
    }

    fn valid_certificate() -> CertificateInfo {
        CertificateInfo {
            subject: BTreeMap::from([("CN".to_string(), "example.com".to_string())]),
            issuer: BTreeMap::from([("O".to_string(), "Test CA".to_string())]),
            valid_from: "Jan  1 00:00:00 2024 GMT".to_string(),
            valid_to: "Jan  1 00:00:00 2099 GMT".to_string(),
            is_expired: false,
            days_remaining: 26000,
            serial_number: "01".to_string(),
            authorized: true,
            authorization_error: None,
        }
    }

    fn trusting_prober() -> Arc<dyn CertificateProbe> {
        let mut prober = MockCertificateProbe::new();
        prober
            .expect_probe()
            .returning(|_| Ok(valid_certificate()));
        Arc::new(prober)
    }

    fn unused_auditor() -> Arc<dyn Auditor> {
        let mut auditor = MockAuditor::new();
        auditor.expect_run_audit().times(0);
        Arc::new(auditor)
    }

    struct Harness {
        counters: Arc<Counters>,
        connected: Arc<AtomicBool>,
        manager: Arc<BrowserManager>,
        analyzer: Arc<Analyzer>,
    }

    fn harness_with(
        launcher: FakeLauncher,
        config: &Config,
        prober: Arc<dyn CertificateProbe>,
        auditor: Arc<dyn Auditor>,
    ) -> Harness {
        let counters = launcher.counters.clone();
        let connected = launcher.connected.clone();
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(BrowserManager::new(
            Arc::new(launcher),
            config.browser.clone(),
            metrics.clone(),
        ));
        let analyzer = Arc::new(Analyzer::new(
            manager.clone(),
            prober,
            auditor,
            config,
            metrics,
        ));

        Harness {
            counters,
            connected,
            manager,
            analyzer,
        }
    }

    fn harness(behavior: FakeBehavior) -> Harness {
        harness_with(
            FakeLauncher::new(behavior),
            &test_config(),
            trusting_prober(),
            unused_auditor(),
        )
    }

    fn state(h: &Harness, request_deadline: Option<Duration>) -> AppState {
        AppState {
            analyzer: h.analyzer.clone(),
            manager: h.manager.clone(),
            health: None,
            metrics_handle: None,
            request_deadline,
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn launches(h: &Harness) -> usize {
        h.counters.launches.load(Ordering::SeqCst)
    }

    // Browser manager

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_launches_once() {
        let h = harness(FakeBehavior {
            launch_delay: Duration::from_millis(150),
            ..Default::default()
        });

        let acquisitions = (0..10).map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.acquire().await })
        });
        let results = futures::future::join_all(acquisitions).await;

        for result in results {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(launches(&h), 1);
        assert!(h.manager.is_healthy());
    }

    #[tokio::test]
    async fn test_waiter_gives_up_after_init_wait() {
        let mut config = test_config();
        config.browser.init_wait = Duration::from_millis(50);
        let h = harness_with(
            FakeLauncher::new(FakeBehavior {
                launch_delay: Duration::from_millis(500),
                ..Default::default()
            }),
            &config,
            trusting_prober(),
            unused_auditor(),
        );

        let manager = h.manager.clone();
        let first = tokio::spawn(async move { manager.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.manager.status().initializing);

        match h.manager.acquire().await {
            Err(AnalyzerError::BrowserUnavailable(reason)) => {
                assert!(reason.contains("did not finish"), "{reason}")
            }
            other => panic!("expected BrowserUnavailable, got {:?}", other.map(|_| ())),
        }

        // The launch in progress is unaffected by the waiter giving up
        assert!(first.await.unwrap().is_ok());
        assert_eq!(launches(&h), 1);
    }

    #[tokio::test]
    async fn test_failed_validation_closes_browser_and_counts_attempt() {
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()).failing_page_opens(1),
            &test_config(),
            trusting_prober(),
            unused_auditor(),
        );

        assert!(h.manager.acquire().await.is_ok());

        // First browser failed validation and was closed; the second passed
        assert_eq!(launches(&h), 2);
        assert_eq!(h.counters.browsers_closed.load(Ordering::SeqCst), 1);
        let status = h.manager.status();
        assert_eq!(status.launch_count, 2);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.has_browser);
    }

    #[tokio::test]
    async fn test_validation_failures_exhaust_launch_attempts() {
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()).failing_page_opens(2),
            &test_config(),
            trusting_prober(),
            unused_auditor(),
        );

        match h.manager.acquire().await {
            Err(AnalyzerError::BrowserLaunchFailed { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("target crashed"), "{last_error}");
            }
            other => panic!("expected BrowserLaunchFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(h.counters.browsers_closed.load(Ordering::SeqCst), 2);
        assert_eq!(h.manager.status().consecutive_failures, 2);
        assert!(!h.manager.status().has_browser);
    }

    #[tokio::test]
    async fn test_launch_failure_exhausts_retries_without_poisoning() {
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()).failing_first(2),
            &test_config(),
            trusting_prober(),
            unused_auditor(),
        );

        match h.manager.acquire().await {
            Err(AnalyzerError::BrowserLaunchFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected BrowserLaunchFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(h.manager.status().consecutive_failures, 2);
        assert!(!h.manager.status().initializing);

        // The next caller gets a fresh launch
        assert!(h.manager.acquire().await.is_ok());
        assert_eq!(launches(&h), 3);
        assert_eq!(h.manager.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_disconnected_browser_is_replaced() {
        let h = harness(FakeBehavior::default());

        h.manager.acquire().await.unwrap();
        h.connected.store(false, Ordering::SeqCst);
        assert!(!h.manager.is_healthy());

        h.manager.acquire().await.unwrap();
        assert_eq!(launches(&h), 2);
        assert_eq!(h.counters.browsers_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_sweep_releases_idle_browser() {
        let mut config = test_config();
        config.browser.idle_timeout = Duration::from_millis(20);
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &config,
            trusting_prober(),
            unused_auditor(),
        );
        let monitor = HealthMonitor::new(h.manager.clone(), Duration::from_secs(60));

        h.manager.acquire().await.unwrap();
        let fresh = monitor.check().await;
        assert!(!fresh.released_browser);
        assert_eq!(fresh.overall, HealthLevel::Healthy);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let idle = monitor.check().await;
        assert!(idle.released_browser);
        assert!(!idle.browser.has_browser);
        assert_eq!(h.counters.browsers_closed.load(Ordering::SeqCst), 1);
        assert!(monitor.last_snapshot().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let h = harness(FakeBehavior::default());
        h.manager.acquire().await.unwrap();

        h.manager.shutdown().await;
        assert_eq!(h.counters.browsers_closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.manager.acquire().await,
            Err(AnalyzerError::ShuttingDown)
        ));
    }

    // Page fetcher

    fn fetcher(h: &Harness, config: &Config) -> PageFetcher {
        PageFetcher::new(
            h.manager.clone(),
            config.fetch.clone(),
            config.browser.viewport.clone(),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_page_closed_once_per_failed_navigation() {
        let config = test_config();
        let h = harness(FakeBehavior {
            navigation_error: Some(NavigationErrorKind::ConnectionRefused),
            ..Default::default()
        });

        let err = fetcher(&h, &config)
            .fetch("https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AnalyzerError::Navigation {
                kind: NavigationErrorKind::ConnectionRefused,
                ..
            }
        ));

        assert_eq!(h.counters.navigations.load(Ordering::SeqCst), 3);
        assert_eq!(
            h.counters.pages_opened.load(Ordering::SeqCst),
            h.counters.pages_closed.load(Ordering::SeqCst)
        );
        assert_eq!(h.counters.double_closes.load(Ordering::SeqCst), 0);

        let waits = h.counters.waits.lock().unwrap().clone();
        assert_eq!(
            waits,
            vec![
                WaitCondition::NetworkIdle,
                WaitCondition::DomContentLoaded,
                WaitCondition::Load
            ]
        );
    }

    #[tokio::test]
    async fn test_dns_failure_is_not_retried() {
        let config = test_config();
        let h = harness(FakeBehavior {
            navigation_error: Some(NavigationErrorKind::DnsResolution),
            ..Default::default()
        });

        assert!(fetcher(&h, &config)
            .fetch("https://does-not-exist.invalid")
            .await
            .is_err());
        assert_eq!(h.counters.navigations.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.counters.pages_opened.load(Ordering::SeqCst),
            h.counters.pages_closed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_cancelled_fetch_still_closes_page() {
        let config = test_config();
        let h = harness(FakeBehavior {
            navigation_delay: Duration::from_millis(500),
            ..Default::default()
        });
        let fetcher = fetcher(&h, &config);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), fetcher.fetch("https://example.com"))
                .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.counters.pages_opened.load(Ordering::SeqCst),
            h.counters.pages_closed.load(Ordering::SeqCst)
        );
    }

    // Analyzer

    #[tokio::test]
    async fn test_short_title_without_description() {
        let h = harness(FakeBehavior::default());
        let report = h.analyzer.analyze("https://example.com").await.unwrap();

        let seo = &report.categories.common_seo;
        assert!(seo.failed.iter().any(|f| f == "Missing meta description"));
        assert!(seo.warnings.iter().any(|w| w.starts_with("Title too short")));
        assert_eq!(report.metadata.title.as_deref(), Some("Hello"));
        assert!(matches!(report.certificate, Some(CertificateBlock::Info(_))));
        assert_eq!(report.lighthouse, AuditBlock::disabled());
        assert_eq!(report.status, Some(200));
        assert!(report.overall_score <= 100);
    }

    #[tokio::test]
    async fn test_analysis_is_deterministic() {
        let h = harness(FakeBehavior::default());

        let first = h.analyzer.analyze("https://example.com").await.unwrap();
        let second = h.analyzer.analyze("https://example.com").await.unwrap();

        assert_eq!(first.categories, second.categories);
        assert_eq!(first.overall_score, second.overall_score);
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(launches(&h), 1);
    }

    #[tokio::test]
    async fn test_missing_url_never_touches_browser() {
        let h = harness(FakeBehavior::default());

        assert!(matches!(
            h.analyzer.analyze("  ").await,
            Err(AnalyzerError::MissingUrl)
        ));
        assert!(matches!(
            h.analyzer.analyze("not a url").await,
            Err(AnalyzerError::InvalidUrl { .. })
        ));
        assert_eq!(launches(&h), 0);
    }

    #[tokio::test]
    async fn test_auditor_keeps_time_to_stop_its_processes() {
        // The auditor overruns its limit while it signals its process group;
        // the pipeline must not cut that short.
        let mut config = test_config();
        config.audit.enabled = true;
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &config,
            trusting_prober(),
            Arc::new(SlowAuditor(config.audit.timeout + Duration::from_millis(300))),
        );

        let report = h.analyzer.analyze("https://example.com").await.unwrap();

        assert!(matches!(report.lighthouse, AuditBlock::Completed(_)));
    }

    #[tokio::test]
    async fn test_audit_timeout_still_produces_report() {
        let mut config = test_config();
        config.audit.enabled = true;
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &config,
            trusting_prober(),
            Arc::new(SlowAuditor(Duration::from_secs(60))),
        );

        let report = h.analyzer.analyze("https://example.com").await.unwrap();

        assert!(matches!(
            report.lighthouse,
            AuditBlock::Failed { timed_out: true, .. }
        ));
        assert!(report
            .categories
            .speed
            .warnings
            .iter()
            .any(|w| w.contains("timed out")));
    }

    #[tokio::test]
    async fn test_audit_scores_raise_speed() {
        let mut config = test_config();
        config.audit.enabled = true;
        let mut auditor = MockAuditor::new();
        auditor.expect_run_audit().times(1).returning(|_| {
            Ok(AuditScores {
                performance: 97,
                seo: 100,
                ..Default::default()
            })
        });
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &config,
            trusting_prober(),
            Arc::new(auditor),
        );

        let report = h.analyzer.analyze("https://example.com").await.unwrap();

        assert_eq!(report.categories.speed.score, 97);
        assert_eq!(report.categories.common_seo.score, 100);
        assert!(report.lighthouse.scores().is_some());
    }

    #[tokio::test]
    async fn test_certificate_timeout_becomes_security_warning() {
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &test_config(),
            Arc::new(SlowProber(Duration::from_secs(5))),
            unused_auditor(),
        );

        let report = h.analyzer.analyze("https://example.com").await.unwrap();

        assert!(matches!(
            report.certificate,
            Some(CertificateBlock::Failed { timed_out: true, .. })
        ));
        assert!(report
            .categories
            .security
            .warnings
            .iter()
            .any(|w| w == "SSL certificate check timed out"));
    }

    #[tokio::test]
    async fn test_plain_http_skips_certificate_probe() {
        let mut prober = MockCertificateProbe::new();
        prober.expect_probe().times(0);
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &test_config(),
            Arc::new(prober),
            unused_auditor(),
        );

        let report = h.analyzer.analyze("http://example.com").await.unwrap();

        assert!(report.certificate.is_none());
        assert!(report
            .categories
            .security
            .failed
            .iter()
            .any(|f| f == "Site does not use HTTPS"));
    }

    #[tokio::test]
    async fn test_ipv6_literal_reaches_tls_without_brackets() {
        let mut prober = MockCertificateProbe::new();
        prober
            .expect_probe()
            .withf(|host| host == "::1")
            .times(2)
            .returning(|_| Ok(valid_certificate()));
        let h = harness_with(
            FakeLauncher::new(FakeBehavior::default()),
            &test_config(),
            Arc::new(prober),
            unused_auditor(),
        );

        let report = h.analyzer.analyze("https://[::1]:8443/").await.unwrap();
        assert!(matches!(report.certificate, Some(CertificateBlock::Info(_))));

        let check = h.analyzer.check_url("https://[::1]:8443/").await.unwrap();
        assert_eq!(check.host, "::1");
        assert!(check.resolved);
        assert_eq!(check.addresses, vec!["::1".to_string()]);
    }

    #[tokio::test]
    async fn test_report_json_shape() {
        let h = harness(FakeBehavior::default());
        let report: AnalysisReport = h.analyzer.analyze("https://example.com").await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        for key in [
            "commonSeo",
            "speed",
            "security",
            "mobile",
            "advancedSeo",
            "metadata",
            "technicalInfo",
            "lighthouse",
            "certificate",
            "overallScore",
            "analysisTimeMs",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["lighthouse"]["error"], "disabled");
    }

    // HTTP API

    #[tokio::test]
    async fn test_analyze_route_missing_url() {
        let h = harness(FakeBehavior::default());
        let app = create_router(state(&h, None));

        let response = app.oneshot(post_json("/api/analyze", "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].is_string());
        assert!(body["details"].is_string());
        assert_eq!(launches(&h), 0);
    }

    #[tokio::test]
    async fn test_analyze_route_rejects_bad_input() {
        let h = harness(FakeBehavior::default());

        let invalid = create_router(state(&h, None))
            .oneshot(post_json("/api/analyze", r#"{"url": "not a url"}"#))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let garbage = create_router(state(&h, None))
            .oneshot(post_json("/api/analyze", "{not json"))
            .await
            .unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

        assert_eq!(launches(&h), 0);
    }

    #[tokio::test]
    async fn test_analyze_route_success() {
        let h = harness(FakeBehavior::default());
        let response = create_router(state(&h, None))
            .oneshot(post_json("/api/analyze", r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["url"], "https://example.com/");
        assert!(body["overallScore"].is_u64());
    }

    #[tokio::test]
    async fn test_analyze_route_navigation_failure_is_500() {
        let h = harness(FakeBehavior {
            navigation_error: Some(NavigationErrorKind::DnsResolution),
            ..Default::default()
        });
        let response = create_router(state(&h, None))
            .oneshot(post_json("/api/analyze", r#"{"url": "https://nope.invalid"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Domain not found");
        assert!(body["suggestions"].as_array().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn test_request_deadline_returns_504() {
        let h = harness(FakeBehavior {
            navigation_delay: Duration::from_millis(500),
            ..Default::default()
        });
        let response = create_router(state(&h, Some(Duration::from_millis(100))))
            .oneshot(post_json("/api/analyze", r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.counters.pages_opened.load(Ordering::SeqCst),
            h.counters.pages_closed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_health_and_status_routes() {
        let h = harness(FakeBehavior::default());

        let health = create_router(state(&h, None))
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        let body = json_body(health).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["browserHealthy"], false);
        assert!(body["timestamp"].is_string());

        let restart = create_router(state(&h, None))
            .oneshot(post_json("/api/restart-browser", ""))
            .await
            .unwrap();
        assert_eq!(restart.status(), StatusCode::OK);
        assert_eq!(launches(&h), 1);

        let status = create_router(state(&h, None))
            .oneshot(
                Request::builder()
                    .uri("/api/browser-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(status).await;
        assert_eq!(body["hasBrowser"], true);
        assert_eq!(body["launchCount"], 1);
        assert!(body["lastHealthCheck"].is_null());
    }

    #[tokio::test]
    async fn test_browser_status_route_reports_last_health_sweep() {
        let h = harness(FakeBehavior::default());
        let monitor = Arc::new(HealthMonitor::new(h.manager.clone(), Duration::from_secs(60)));
        h.manager.acquire().await.unwrap();
        monitor.check().await;

        let mut app_state = state(&h, None);
        app_state.health = Some(monitor);
        let response = create_router(app_state)
            .oneshot(
                Request::builder()
                    .uri("/api/browser-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["hasBrowser"], true);
        assert_eq!(body["lastHealthCheck"]["overall"], "healthy");
        assert_eq!(body["lastHealthCheck"]["releasedBrowser"], false);
        assert!(body["lastHealthCheck"]["checkedAt"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_route_without_recorder() {
        let h = harness(FakeBehavior::default());
        let response = create_router(state(&h, None))
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_test_url_route_checks_without_browser() {
        let h = harness(FakeBehavior::default());
        let response = create_router(state(&h, None))
            .oneshot(post_json("/api/test-url", r#"{"url": "https://localhost"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["host"], "localhost");
        assert_eq!(launches(&h), 0);
    }
}
