//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the page audit
//! service: the shared browser, page fetching, the external audit, the
//! certificate probe, scoring policy and the HTTP server.

use crate::AnalyzerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CDP_REQUEST_SLACK: Duration = Duration::from_secs(5);

/// Main configuration structure for the page audit service
///
/// # Examples
///
/// ```rust
/// use page_audit::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Tighten the external audit timeout
/// let mut config = Config::default();
/// config.audit.timeout = std::time::Duration::from_secs(45);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerSettings,

    /// Shared browser lifecycle settings
    pub browser: BrowserSettings,

    /// Page navigation and capture settings
    pub fetch: FetchSettings,

    /// External Lighthouse audit settings
    pub audit: AuditSettings,

    /// TLS certificate probe settings
    pub certificate: CertificateSettings,

    /// Rule thresholds and score policy
    pub scoring: ScoringSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the API binds to (default: 0.0.0.0)
    pub bind: String,

    /// Port the API listens on (default: 3000)
    pub port: u16,

    /// Optional upper bound for a whole analysis request
    ///
    /// When it elapses the in-flight pipeline is dropped, which aborts the
    /// certificate probe and audit tasks and closes the page session.
    pub request_deadline: Option<Duration>,

    /// Install the Prometheus recorder and serve `/metrics` (default: true)
    pub metrics_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            request_deadline: None,
            metrics_enabled: true,
        }
    }
}

/// Settings for the single shared Chrome instance
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Recycle the browser when it has not been used for this long (default: 5 minutes)
    pub idle_timeout: Duration,

    /// How long a caller waits for another caller's launch to finish (default: 15 seconds)
    pub init_wait: Duration,

    /// Poll increment while waiting on another caller's launch (default: 500ms)
    pub init_poll_interval: Duration,

    /// Launch retry policy (default: 3 attempts, 1s doubling backoff)
    pub launch_retry: RetryConfig,

    /// Interval of the background idle/disconnect sweep (default: 60 seconds)
    pub health_check_interval: Duration,

    /// Custom User-Agent string for page loads
    pub user_agent: Option<String>,

    /// Viewport used for every page session
    pub viewport: Viewport,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_path: None,
            idle_timeout: Duration::from_secs(300),
            init_wait: Duration::from_secs(15),
            init_poll_interval: Duration::from_millis(500),
            launch_retry: RetryConfig::default(),
            health_check_interval: Duration::from_secs(60),
            user_agent: None,
            viewport: Viewport::default(),
        }
    }
}

/// Browser viewport configuration for page sessions
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Per-attempt navigation timeout (default: 45 seconds)
    pub navigation_timeout: Duration,

    /// Navigation attempts before giving up (default: 3)
    pub max_attempts: usize,

    /// Pause between navigation attempts (default: 2 seconds)
    pub retry_delay: Duration,

    /// Extra wait after load so late script errors are captured (default: 1 second)
    pub settle_delay: Duration,

    /// Quiet period with no new requests that counts as "network idle" (default: 500ms)
    pub network_idle_quiet: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(45),
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            settle_delay: Duration::from_secs(1),
            network_idle_quiet: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Run the Lighthouse audit at all (default: true)
    pub enabled: bool,

    /// Lighthouse executable (default: `lighthouse` on PATH)
    pub lighthouse_path: String,

    /// Hard wall-clock limit for one audit (default: 60 seconds)
    pub timeout: Duration,

    /// Flags handed to the Chrome instance Lighthouse launches for itself
    pub chrome_flags: Vec<String>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lighthouse_path: "lighthouse".to_string(),
            timeout: Duration::from_secs(60),
            chrome_flags: vec![
                "--headless".to_string(),
                "--no-sandbox".to_string(),
                "--disable-gpu".to_string(),
                "--disable-dev-shm-usage".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CertificateSettings {
    /// Handshake timeout (default: 10 seconds)
    pub timeout: Duration,

    /// Port to probe (default: 443)
    pub port: u16,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            port: 443,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Score for a category that ended up with no checks (default: 100)
    pub empty_category_score: u8,

    /// Which set of length bands and severities the rule checks use
    pub rule_profile: RuleProfile,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            empty_category_score: 100,
            rule_profile: RuleProfile::Strict,
        }
    }
}

/// Threshold profiles for the rule checks
///
/// - Strict: title 30-60, description 120-160, over-long text and script
///   errors fail
/// - Relaxed: title 10-70, description 70-160, over-long text and script
///   errors only warn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProfile {
    #[default]
    Strict,
    Relaxed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Check a configuration before the service starts.
pub fn validate_config(config: &Config) -> Result<(), AnalyzerError> {
    let invalid = |msg: &str| Err(AnalyzerError::ConfigurationError(msg.to_string()));

    if config.browser.launch_retry.max_attempts == 0 {
        return invalid("Browser launch attempts must be greater than 0");
    }
    if config.browser.init_poll_interval.is_zero() {
        return invalid("Browser init poll interval must be greater than 0");
    }
    if config.browser.viewport.width == 0 || config.browser.viewport.height == 0 {
        return invalid("Viewport dimensions must be greater than 0");
    }
    if config.fetch.max_attempts == 0 {
        return invalid("Navigation attempts must be greater than 0");
    }
    if config.fetch.navigation_timeout.is_zero() {
        return invalid("Navigation timeout must be greater than 0");
    }
    if config.audit.timeout.is_zero() || config.certificate.timeout.is_zero() {
        return invalid("Audit and certificate timeouts must be greater than 0");
    }
    if config.scoring.empty_category_score > 100 {
        return invalid("Empty category score must be between 0 and 100");
    }

    Ok(())
}

/// Generate Chrome command-line arguments for the shared browser
///
/// `profile_id` keeps user-data and temp directories unique per launch so a
/// relaunch never collides with a previous instance that is still exiting.
pub fn get_chrome_args(settings: &BrowserSettings, profile_id: &str) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-process-singleton-dialog".to_string(),
        format!(
            "--window-size={},{}",
            settings.viewport.width, settings.viewport.height
        ),
        format!("--user-data-dir=/tmp/page-audit-chromium-{}", profile_id),
        format!("--temp-dir=/tmp/page-audit-chromium-temp-{}", profile_id),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

/// Upper bound chromiumoxide puts on a single CDP command, navigation
/// included. It sits above the navigation timeout so the page's own
/// deadline is what a slow load runs into.
pub fn cdp_request_timeout(navigation_timeout: Duration) -> Duration {
    navigation_timeout + CDP_REQUEST_SLACK
}

pub fn create_browser_config(
    settings: &BrowserSettings,
    profile_id: &str,
    navigation_timeout: Duration,
) -> Result<chromiumoxide::browser::BrowserConfig, AnalyzerError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(settings.viewport.width, settings.viewport.height)
        .request_timeout(cdp_request_timeout(navigation_timeout))
        .args(get_chrome_args(settings, profile_id));

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(AnalyzerError::ConfigurationError)
}
