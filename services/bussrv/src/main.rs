//! Shared-bus device service entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bussrv::config::AppConfig;
use bussrv::runtime::Runtime;
use bussrv::shutdown::wait_for_shutdown;

#[derive(Parser, Debug)]
#[command(name = "bussrv", about = "RS-485 shared-bus device service", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "bussrv.yaml", env = "BUSSRV_CONFIG")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Log filter when RUST_LOG is unset, e.g. "bussrv=debug,buslink=trace"
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        "configuration loaded: {} device(s) behind {}:{}",
        config.devices.len(),
        config.gateway.host,
        config.gateway.port
    );

    if args.validate {
        info!("configuration valid");
        return Ok(());
    }

    let (runtime, mut events) = Runtime::build(&config).await?;

    // Forward state changes to the log; an embedding host would consume the
    // stream instead
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!("state: {}", json),
                Err(e) => info!("state: {:?} (encode failed: {})", event, e),
            }
        }
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    runtime.shutdown().await;
    event_task.abort();
    Ok(())
}
