// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use awcp_config::AwcpConfig;
use awcp_delegator::{build_router, DelegatorEngine};
use awcp_transport::InlineTransport;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "awcp-delegator", version, about = "AWCP delegator control plane")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8381")]
    bind: String,

    /// Base directory for records, exports, and staged snapshots.
    #[arg(long, default_value = ".awcp")]
    base_dir: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("awcp=debug")
    } else {
        EnvFilter::new("awcp=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AwcpConfig::load_or_default(args.config.as_deref())?;
    for warning in config.validate() {
        warn!(target: "awcp.delegator", %warning, "configuration warning");
    }

    let engine =
        DelegatorEngine::new(config, &args.base_dir, Arc::new(InlineTransport::new())).await?;

    let app = build_router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        target: "awcp.delegator",
        bind = %args.bind,
        base_dir = %args.base_dir.display(),
        "awcp-delegator listening"
    );

    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "awcp.delegator", "shutting down");
            shutdown_engine.shutdown().await;
        })
        .await
        .context("serve")
}
