//! Per-request analysis pipeline
//!
//! ```text
//! validate URL -> fetch page -+-> certificate probe (task, HTTPS only) -+
//!                             +-> Lighthouse audit  (task)             -+-> merge -> score
//!                             +-> rule evaluation   (inline)           -+
//! ```
//!
//! The two background branches have their own timeouts and turn every
//! failure into data on the report. They are held by [`AbortOnDrop`] so
//! dropping the pipeline future tears them down.

use crate::{
    add_audit_findings, add_certificate_findings, connect_host, evaluate, score_report, validate_url,
    AbortOnDrop, AnalyzerError, AuditBlock, AuditSettings, Auditor, BrowserManager, Categories,
    CertificateBlock, CertificateProbe, CertificateSettings, Config, Metadata, Metrics,
    PageFetcher, RuleInput, ScoringSettings, TechnicalInfo,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Extra time the audit task gets after its own timeout to stop the process group
const AUDIT_BACKSTOP_SLACK: Duration = Duration::from_secs(3);

/// Everything the service knows about one analyzed page
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub request_id: String,
    pub url: String,
    pub final_url: String,
    pub status: Option<u16>,
    #[serde(flatten)]
    pub categories: Categories,
    pub metadata: Metadata,
    pub technical_info: TechnicalInfo,
    pub lighthouse: AuditBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateBlock>,
    pub overall_score: u8,
    pub analysis_time_ms: u64,
    pub analyzed_at: DateTime<Utc>,
}

/// Result of the lightweight reachability check
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCheck {
    pub url: String,
    pub host: String,
    pub resolved: bool,
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateBlock>,
}

pub struct Analyzer {
    fetcher: PageFetcher,
    prober: Arc<dyn CertificateProbe>,
    auditor: Arc<dyn Auditor>,
    audit_settings: AuditSettings,
    certificate_settings: CertificateSettings,
    scoring: ScoringSettings,
    metrics: Arc<Metrics>,
}

impl Analyzer {
    pub fn new(
        manager: Arc<BrowserManager>,
        prober: Arc<dyn CertificateProbe>,
        auditor: Arc<dyn Auditor>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let fetcher = PageFetcher::new(
            manager,
            config.fetch.clone(),
            config.browser.viewport.clone(),
            metrics.clone(),
        );

        Self {
            fetcher,
            prober,
            auditor,
            audit_settings: config.audit.clone(),
            certificate_settings: config.certificate.clone(),
            scoring: config.scoring.clone(),
            metrics,
        }
    }

    /// Analyze one URL. Input errors are returned before the browser is touched.
    pub async fn analyze(&self, url: &str) -> Result<AnalysisReport, AnalyzerError> {
        let parsed = validate_url(url)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        info!(request_id = %request_id, url = %parsed, "Starting analysis");
        let result = self.run(&parsed, request_id.clone(), started).await;

        self.metrics.record_analysis(started.elapsed(), result.is_ok());
        match &result {
            Ok(report) => info!(
                request_id = %request_id,
                score = report.overall_score,
                "Analysis finished in {}",
                crate::format_duration(started.elapsed())
            ),
            Err(e) => {
                self.metrics.record_error(e);
                warn!(request_id = %request_id, "Analysis of {} failed: {}", parsed, e);
            }
        }

        result
    }

    async fn run(
        &self,
        url: &Url,
        request_id: String,
        started: Instant,
    ) -> Result<AnalysisReport, AnalyzerError> {
        let page = self.fetcher.fetch(url.as_str()).await?;

        let certificate_task = self.spawn_certificate_probe(url);
        let audit_task = self.spawn_audit(url);

        let outcome = evaluate(
            &RuleInput {
                html: &page.html,
                headers: &page.headers,
                console_errors: &page.console_errors,
                url,
                status: page.status,
            },
            self.scoring.rule_profile,
        );
        debug!(request_id = %request_id, "Rule evaluation complete");

        let certificate = match certificate_task {
            Some(task) => {
                let block = CertificateBlock::from_result(task.join().await.and_then(|r| r));
                if let CertificateBlock::Failed { error, .. } = &block {
                    self.metrics.record_certificate_failure();
                    warn!(request_id = %request_id, "Certificate probe failed: {}", error);
                }
                Some(block)
            }
            None => None,
        };

        let lighthouse = match audit_task {
            Some(task) => {
                let block = AuditBlock::from_result(task.join().await.and_then(|r| r));
                if let AuditBlock::Failed { error, timed_out } = &block {
                    self.metrics.record_audit_failure(*timed_out);
                    warn!(request_id = %request_id, "Lighthouse audit failed: {}", error);
                }
                block
            }
            None => AuditBlock::disabled(),
        };

        let mut categories = outcome.categories;
        add_audit_findings(&mut categories, &lighthouse);
        if let Some(certificate) = &certificate {
            add_certificate_findings(&mut categories, certificate);
        }
        let overall_score = score_report(&mut categories, lighthouse.scores(), &self.scoring);

        Ok(AnalysisReport {
            request_id,
            url: url.to_string(),
            final_url: page.final_url,
            status: page.status,
            categories,
            metadata: outcome.metadata,
            technical_info: outcome.technical_info,
            lighthouse,
            certificate,
            overall_score,
            analysis_time_ms: started.elapsed().as_millis() as u64,
            analyzed_at: Utc::now(),
        })
    }

    fn spawn_certificate_probe(
        &self,
        url: &Url,
    ) -> Option<AbortOnDrop<Result<crate::CertificateInfo, AnalyzerError>>> {
        if url.scheme() != "https" {
            return None;
        }
        let host = connect_host(url)?;
        let prober = self.prober.clone();
        let limit = self.certificate_settings.timeout;

        Some(AbortOnDrop::spawn(async move {
            match timeout(limit, prober.probe(&host)).await {
                Ok(result) => result,
                Err(_) => Err(AnalyzerError::timeout("certificate probe", limit)),
            }
        }))
    }

    fn spawn_audit(
        &self,
        url: &Url,
    ) -> Option<AbortOnDrop<Result<crate::AuditScores, AnalyzerError>>> {
        if !self.audit_settings.enabled {
            return None;
        }
        let auditor = self.auditor.clone();
        let target = url.to_string();
        let limit = self.audit_settings.timeout;
        // The auditor enforces `limit` itself and then stops its process
        // group; the outer bound only catches an auditor that never returns.
        let backstop = limit + AUDIT_BACKSTOP_SLACK;

        Some(AbortOnDrop::spawn(async move {
            match timeout(backstop, auditor.run_audit(&target)).await {
                Ok(result) => result,
                Err(_) => Err(AnalyzerError::timeout("lighthouse audit", limit)),
            }
        }))
    }

    /// Resolve the host and, for HTTPS, probe its certificate. Never loads
    /// the page.
    pub async fn check_url(&self, url: &str) -> Result<UrlCheck, AnalyzerError> {
        let parsed = validate_url(url)?;
        let host = connect_host(&parsed).unwrap_or_default();
        let port = parsed.port_or_known_default().unwrap_or(443);

        let (addresses, dns_error) = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => (addrs.map(|a| a.ip().to_string()).collect::<Vec<_>>(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let certificate = if parsed.scheme() == "https" && dns_error.is_none() {
            let limit = self.certificate_settings.timeout;
            let result = timeout(limit, self.prober.probe(&host))
                .await
                .map_err(|_| AnalyzerError::timeout("certificate probe", limit))
                .and_then(|r| r);
            Some(CertificateBlock::from_result(result))
        } else {
            None
        };

        Ok(UrlCheck {
            url: parsed.to_string(),
            host,
            resolved: !addresses.is_empty(),
            addresses,
            dns_error,
            certificate,
        })
    }
}
