use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Why a navigation failed, classified where the failure is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NavigationErrorKind {
    DnsResolution,
    ConnectionRefused,
    Certificate,
    ConnectionClosed,
    TargetClosed,
    Timeout,
    Other,
}

impl NavigationErrorKind {
    /// Map a Chromium network error code (`net::ERR_*`) to a kind.
    pub fn from_net_error(code: &str) -> Self {
        let code = code.trim().trim_start_matches("net::");
        match code {
            "ERR_NAME_NOT_RESOLVED" | "ERR_NAME_RESOLUTION_FAILED" | "ERR_ADDRESS_UNREACHABLE" => {
                Self::DnsResolution
            }
            "ERR_CONNECTION_REFUSED" => Self::ConnectionRefused,
            "ERR_CONNECTION_CLOSED" | "ERR_CONNECTION_RESET" | "ERR_EMPTY_RESPONSE"
            | "ERR_CONNECTION_ABORTED" => Self::ConnectionClosed,
            "ERR_TIMED_OUT" | "ERR_CONNECTION_TIMED_OUT" => Self::Timeout,
            c if c.starts_with("ERR_CERT_") || c.starts_with("ERR_SSL_") => Self::Certificate,
            _ => Self::Other,
        }
    }

    pub fn explanation(&self) -> &'static str {
        match self {
            Self::DnsResolution => "The domain name could not be resolved. Check the URL for typos or whether the site exists.",
            Self::ConnectionRefused => "The server refused the connection. The site may be down or blocking automated access.",
            Self::Certificate => "The site's SSL/TLS certificate could not be validated.",
            Self::ConnectionClosed => "The server closed the connection unexpectedly.",
            Self::TargetClosed => "The browser page closed unexpectedly while loading the site.",
            Self::Timeout => "The page took too long to load.",
            Self::Other => "The page could not be loaded.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::DnsResolution | Self::Certificate)
    }
}

#[derive(Debug, Clone, Error)]
pub enum AnalyzerError {
    #[error("URL is required")]
    MissingUrl,

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Browser unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("Browser launch failed after {attempts} attempt(s): {last_error}")]
    BrowserLaunchFailed { attempts: usize, last_error: String },

    #[error("Navigation to {url} failed: {detail}")]
    Navigation {
        kind: NavigationErrorKind,
        url: String,
        detail: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("Certificate probe failed: {0}")]
    Certificate(String),

    #[error("Audit failed: {0}")]
    Audit(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AnalyzerError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        AnalyzerError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AnalyzerError::Navigation { kind, .. } => kind.is_retryable(),
            AnalyzerError::BrowserUnavailable(_)
            | AnalyzerError::Timeout { .. }
            | AnalyzerError::PageError(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AnalyzerError::Timeout { .. }
                | AnalyzerError::Navigation {
                    kind: NavigationErrorKind::Timeout,
                    ..
                }
        )
    }

    /// Input problems the caller can fix without the service doing any work.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            AnalyzerError::MissingUrl | AnalyzerError::InvalidUrl { .. }
        )
    }

    /// HTTP status the API answers with for this error.
    pub fn status_code(&self) -> u16 {
        if self.is_input_error() {
            return 400;
        }
        match self {
            AnalyzerError::ShuttingDown => 503,
            _ => 500,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AnalyzerError::MissingUrl | AnalyzerError::InvalidUrl { .. } => ErrorSeverity::Low,
            AnalyzerError::Navigation { .. } | AnalyzerError::Timeout { .. } => {
                ErrorSeverity::Medium
            }
            AnalyzerError::BrowserLaunchFailed { .. } | AnalyzerError::ConfigurationError(_) => {
                ErrorSeverity::High
            }
            _ => ErrorSeverity::Medium,
        }
    }

    /// Actionable hints shown to API users alongside the error.
    pub fn suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            AnalyzerError::MissingUrl => &["Send a JSON body like {\"url\": \"https://example.com\"}"],
            AnalyzerError::InvalidUrl { .. } => &[
                "Include the scheme, e.g. https://example.com",
                "Only http and https URLs can be analyzed",
            ],
            AnalyzerError::Navigation { kind, .. } => match kind {
                NavigationErrorKind::DnsResolution => &[
                    "Check the domain for typos",
                    "Verify the domain is registered and has DNS records",
                ],
                NavigationErrorKind::ConnectionRefused => &[
                    "Check that the web server is running",
                    "Try again later; the site may be rate limiting",
                ],
                NavigationErrorKind::Certificate => &[
                    "Check the site's certificate chain and expiry",
                    "Try the http:// version of the URL to analyze content",
                ],
                NavigationErrorKind::Timeout => &[
                    "The site may be slow or overloaded; try again later",
                ],
                NavigationErrorKind::ConnectionClosed | NavigationErrorKind::TargetClosed => &[
                    "Try again; the failure may be transient",
                ],
                NavigationErrorKind::Other => &["Verify the URL opens in a regular browser"],
            },
            AnalyzerError::BrowserUnavailable(_) | AnalyzerError::BrowserLaunchFailed { .. } => &[
                "Try again in a few seconds",
                "Check that Chrome/Chromium is installed on the server",
            ],
            AnalyzerError::Timeout { .. } => &["Try again later; the site may be slow"],
            _ => &[],
        };
        hints.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for AnalyzerError {
    fn from(err: std::io::Error) -> Self {
        AnalyzerError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AnalyzerError {
    fn from(err: serde_json::Error) -> Self {
        AnalyzerError::SerializationError(err.to_string())
    }
}
