use crate::{validate_config, AnalyzerError, Config, RuleProfile};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "page-audit")]
#[command(about = "SEO, performance, security and mobile analysis for web pages")]
#[command(version)]
pub struct Cli {
    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Server port")]
    pub port: Option<u16>,

    #[arg(long, help = "Bind address")]
    pub bind: Option<String>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Lighthouse executable path")]
    pub lighthouse_path: Option<String>,

    #[arg(long, help = "Skip the Lighthouse audit")]
    pub no_audit: bool,

    #[arg(long, help = "Lighthouse audit timeout in seconds")]
    pub audit_timeout: Option<u64>,

    #[arg(long, help = "Page navigation timeout in seconds")]
    pub navigation_timeout: Option<u64>,

    #[arg(long, help = "Upper bound for a whole analysis request in seconds")]
    pub request_deadline: Option<u64>,

    #[arg(long, value_parser = parse_rule_profile, help = "Rule thresholds (strict, relaxed)")]
    pub rule_profile: Option<RuleProfile>,

    #[arg(long, help = "Disable the /metrics endpoint")]
    pub no_metrics: bool,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

fn parse_rule_profile(value: &str) -> Result<RuleProfile, String> {
    match value.to_ascii_lowercase().as_str() {
        "strict" => Ok(RuleProfile::Strict),
        "relaxed" => Ok(RuleProfile::Relaxed),
        other => Err(format!("unknown rule profile '{other}' (expected strict or relaxed)")),
    }
}

impl Cli {
    /// Apply command line flags on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.browser.chrome_path = Some(chrome_path.clone());
        }
        if let Some(lighthouse_path) = &self.lighthouse_path {
            config.audit.lighthouse_path = lighthouse_path.clone();
        }
        if self.no_audit {
            config.audit.enabled = false;
        }
        if let Some(secs) = self.audit_timeout {
            config.audit.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.navigation_timeout {
            config.fetch.navigation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.request_deadline {
            config.server.request_deadline = Some(Duration::from_secs(secs));
        }
        if let Some(profile) = self.rule_profile {
            config.scoring.rule_profile = profile;
        }
        if self.no_metrics {
            config.server.metrics_enabled = false;
        }
    }
}

/// Load the configuration file (if any), apply CLI overrides and validate.
pub async fn load_config(args: &Cli) -> Result<Config, AnalyzerError> {
    let mut config = match &args.config {
        Some(path) => {
            let content = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&content)?
        }
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    validate_config(&config)?;

    info!("Configuration loaded successfully");
    info!("Listening address: {}:{}", config.server.bind, config.server.port);
    info!("Navigation timeout: {:?}", config.fetch.navigation_timeout);
    info!(
        "Lighthouse audit: {} (timeout {:?})",
        if config.audit.enabled { "enabled" } else { "disabled" },
        config.audit.timeout
    );
    info!("Rule profile: {:?}", config.scoring.rule_profile);

    Ok(config)
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}
