use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_relay::{
    config::Config,
    extraction::{BrowserAutomation, WebDriverBrowser},
    services::StreamService,
    utils::http_client::{HttpFetcher, ReqwestFetcher},
    web::WebServer,
};

#[derive(Parser)]
#[command(name = "stream-relay")]
#[command(version)]
#[command(about = "Resolves live channels to HLS streams and relays playlists, segments and keys")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Log output format (text or json)
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

fn init_tracing(cli: &Cli) {
    let log_filter = if cli.log_level == "trace" {
        format!("stream_relay={},tower_http=trace", cli.log_level)
    } else {
        format!("stream_relay={}", cli.log_level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_filter.into());

    if cli.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                }
            }
            _ => {
                warn!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("Starting stream-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new(
        &config.proxy.user_agent,
        config.proxy.connect_timeout,
    )?);
    let browser: Option<Arc<dyn BrowserAutomation>> = match WebDriverBrowser::from_config(&config.browser)? {
        Some(browser) => {
            info!("Browser automation enabled via WebDriver");
            Some(Arc::new(browser))
        }
        None => {
            info!("No WebDriver endpoint configured, browser extraction stage disabled");
            None
        }
    };

    let stream_service = Arc::new(StreamService::from_config(&config, fetcher, browser)?);
    let governor = stream_service.governor().clone();
    let reaper = governor.spawn_reaper();

    let server = WebServer::new(&config, stream_service)?;
    let cancellation = CancellationToken::new();
    let server_token = cancellation.clone();
    let server_task = tokio::spawn(async move { server.serve_with_cancellation(server_token).await });

    shutdown_signal().await;
    cancellation.cancel();

    // Live relays hold connections open, so cancel sessions before waiting on the server
    governor.shutdown(config.governor.drain_timeout).await;
    let _ = reaper.await;

    match server_task.await {
        Ok(Ok(())) => info!("Web server stopped"),
        Ok(Err(e)) => error!("Web server error: {}", e),
        Err(e) => error!("Web server task failed: {}", e),
    }
    Ok(())
}
