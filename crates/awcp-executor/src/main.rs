// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use awcp_config::AwcpConfig;
use awcp_executor::{build_router, EchoTaskExecutor, ExecutorEngine};
use awcp_transport::InlineTransport;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "awcp-executor", version, about = "AWCP executor daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8380")]
    bind: String,

    /// Root directory for per-delegation work paths.
    #[arg(long, default_value = ".awcp/work")]
    work_root: PathBuf,

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
        warn!(target: "awcp.executor", %warning, "configuration warning");
    }

    // The echo runner stands in until a real task runner is wired in; it
    // reports the task description and leaves the workspace untouched.
    let engine = ExecutorEngine::new(
        config,
        &args.work_root,
        Arc::new(InlineTransport::new()),
        Arc::new(EchoTaskExecutor),
    )
    .await?;

    let app = build_router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        target: "awcp.executor",
        bind = %args.bind,
        work_root = %args.work_root.display(),
        "awcp-executor listening"
    );

    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "awcp.executor", "shutting down");
            shutdown_engine.shutdown().await;
        })
        .await
        .context("serve")
}
