//! # Page Audit
//!
//! An HTTP service that analyzes a single web page for SEO, speed, security
//! and mobile readiness. Every request loads the page in one shared headless
//! Chrome instance, runs a TLS certificate probe and a Lighthouse audit in
//! parallel with the HTML rule checks, and merges everything into a scored
//! report.
//!
//! ## Pipeline
//!
//! ```text
//! POST /api/analyze
//!   -> validate URL
//!   -> BrowserManager::acquire  (lazy launch, idle recycling, launch retries)
//!   -> PageFetcher::fetch       (page lease, wait-condition ladder, retries)
//!   -> spawn certificate probe  (HTTPS only, own timeout)
//!   -> spawn Lighthouse audit   (own Chrome, own timeout, child killed on expiry)
//!   -> rule evaluation          (scraper, synchronous)
//!   -> merge, score             (weighted 30/30/15/15/10)
//! ```
//!
//! Certificate and audit failures never fail the request; they become data
//! on the report and warnings in the security and speed categories.
//!
//! ## Scoring
//!
//! | Category | Weight |
//! |----------|--------|
//! | Common SEO | 30 |
//! | Speed | 30 |
//! | Security | 15 |
//! | Mobile | 15 |
//! | Advanced SEO | 10 |
//!
//! A category scores `(passed + 0.5 * warnings) / total * 100`. When Lighthouse
//! succeeded, its performance score can only raise the speed category and its
//! SEO score can only raise common SEO.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_audit::{
//!     Analyzer, BrowserManager, ChromiumLauncher, Config, LighthouseAuditor, Metrics,
//!     TlsCertificateProber,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let metrics = Arc::new(Metrics::new());
//!     let launcher = Arc::new(ChromiumLauncher::new(config.browser.clone(), &config.fetch));
//!     let manager = Arc::new(BrowserManager::new(launcher, config.browser.clone(), metrics.clone()));
//!     let analyzer = Analyzer::new(
//!         manager.clone(),
//!         Arc::new(TlsCertificateProber::new(config.certificate.clone())),
//!         Arc::new(LighthouseAuditor::new(config.audit.clone())),
//!         &config,
//!         metrics,
//!     );
//!
//!     let report = analyzer.analyze("https://example.com").await?;
//!     println!("Overall score: {}", report.overall_score);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-audit --port 3000 --rule-profile relaxed --request-deadline 120
//! curl -X POST localhost:3000/api/analyze -H 'content-type: application/json' \
//!      -d '{"url": "https://example.com"}'
//! ```

/// Configuration and settings for the service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Lifecycle of the single shared browser
pub mod browser_manager;

/// chromiumoxide implementation of the browser traits
pub mod chromium;

/// Page loading with retries and session cleanup
pub mod page_fetcher;

/// TLS certificate inspection
pub mod cert_probe;

/// External Lighthouse audit
pub mod audit;

/// HTML rule checks
pub mod rules;

/// Category and overall scores
pub mod scoring;

/// Per-request fan-out/fan-in pipeline
pub mod analyzer;

/// HTTP API
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Periodic health sweep over the shared browser
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use analyzer::*;
pub use audit::*;
pub use browser_manager::*;
pub use cert_probe::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use metrics::*;
pub use page_fetcher::*;
pub use rules::*;
pub use scoring::*;
pub use server::*;
pub use utils::*;
