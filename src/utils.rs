use crate::AnalyzerError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::{Host, Url};

/// Parse a user supplied URL. Only absolute http(s) URLs with a host pass.
pub fn validate_url(url: &str) -> Result<Url, AnalyzerError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(AnalyzerError::MissingUrl);
    }

    let invalid = |reason: String| AnalyzerError::InvalidUrl {
        url: trimmed.to_string(),
        reason,
    };

    let parsed = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }

    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(parsed)
}

/// Host name or address of `url` as a resolver or TLS server name expects
/// it. IPv6 literals come back without their URL brackets.
pub fn connect_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

/// Spawned task that is aborted when the handle goes out of scope
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T: Send + 'static> AbortOnDrop<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    /// Wait for the task. A panicked or aborted task is reported as an error.
    pub async fn join(mut self) -> Result<T, AnalyzerError> {
        (&mut self.0)
            .await
            .map_err(|e| AnalyzerError::PageError(format!("background task failed: {e}")))
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
