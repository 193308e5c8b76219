use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use beacon_mock::MockConfig;
use beacon_server::{AppContext, CliOverrides, Settings};
use beacon_telemetry::{init_telemetry, parse_level, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "beacon", version, about = "Control-protocol server with resilient upstream aggregation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control-protocol server.
    Serve {
        /// JSON settings file merged over the defaults.
        #[arg(long, short)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Base URL of the upstream data service.
        #[arg(long)]
        upstream_url: Option<String>,
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Run the mock upstream data service.
    MockUpstream {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Report every service as running.
        #[arg(long, default_value_t = false)]
        healthy_only: bool,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve {
            config,
            host,
            port,
            upstream_url,
            log_level,
        } => {
            let mut settings = Settings::load(config.as_deref()).context("failed to load settings")?;
            settings.apply_cli(CliOverrides {
                host,
                port,
                upstream_url,
                log_level,
            });
            init_telemetry(&settings.telemetry_config());
            run_server(settings).await
        }
        Command::MockUpstream {
            host,
            port,
            healthy_only,
            log_level,
        } => {
            let mut telemetry = TelemetryConfig::default();
            if let Some(level) = parse_level(&log_level) {
                telemetry.log_level = level;
            }
            init_telemetry(&telemetry);
            run_mock(&format!("{host}:{port}"), MockConfig { healthy_only }).await
        }
    }
}

async fn run_server(settings: Settings) -> anyhow::Result<()> {
    tracing::info!(config = %settings.summary(), "starting beacon server");
    let ctx = AppContext::new(settings).context("failed to build application context")?;
    let shutdown = ctx.shutdown.clone();
    let handle = beacon_server::start(ctx).await.context("failed to bind server")?;
    tracing::info!(port = handle.port(), "beacon server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    shutdown.cancel();
    handle.shutdown().await.context("server stopped with an error")?;
    Ok(())
}

async fn run_mock(addr: &str, config: MockConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    beacon_mock::serve(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down mock upstream");
    })
    .await
    .context("mock upstream stopped with an error")
}
