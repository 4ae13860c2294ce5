use anyhow::Context;
use clap::Parser;
use page_audit::{
    install_prometheus_recorder, load_config, serve, setup_logging, Analyzer, AppState,
    BrowserManager, ChromiumLauncher, Cli, HealthMonitor, LighthouseAuditor, Metrics,
    TlsCertificateProber,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting page-audit v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args)
        .await
        .context("failed to load configuration")?;

    // The recorder has to exist before any metric handle is registered
    let metrics_handle = if config.server.metrics_enabled {
        Some(install_prometheus_recorder()?)
    } else {
        None
    };
    let metrics = Arc::new(Metrics::new());

    let launcher = Arc::new(ChromiumLauncher::new(config.browser.clone(), &config.fetch));
    let manager = Arc::new(BrowserManager::new(
        launcher,
        config.browser.clone(),
        metrics.clone(),
    ));
    let prober = Arc::new(TlsCertificateProber::new(config.certificate.clone()));
    let auditor = Arc::new(LighthouseAuditor::new(config.audit.clone()));
    let analyzer = Arc::new(Analyzer::new(
        manager.clone(),
        prober,
        auditor,
        &config,
        metrics.clone(),
    ));

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_handler = setup_shutdown_handler(shutdown_tx.clone())?;

    // Setup health monitoring
    let monitor = Arc::new(HealthMonitor::new(
        manager.clone(),
        config.browser.health_check_interval,
    ));
    let monitor_task = monitor.clone().spawn(shutdown_rx.clone());

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let state = AppState {
        analyzer,
        manager: manager.clone(),
        health: Some(monitor),
        metrics_handle,
        request_deadline: config.server.request_deadline,
    };

    let mut server_shutdown = shutdown_rx.clone();
    let result = serve(listener, state, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
        info!("Received shutdown signal");
    })
    .await;

    // Graceful shutdown, also taken when the server failed
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    signal_handler.abort();
    let _ = monitor_task.await;
    manager.shutdown().await;

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("page-audit stopped");
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to create SIGINT handler")?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to create SIGTERM handler")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(true);
    }))
}
