//! Arsenal tool-execution daemon.
//!
//! Loads tool descriptors from TOML, assembles the execution core, and
//! serves the invocation API over HTTP.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use arsenal_common::{CoreConfig, InvokeError};
use arsenal_core::Core;
use arsenald::http;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: u8 = 64;
const EXIT_SOFTWARE: u8 = 70;
const EXIT_INTERRUPTED: u8 = 130;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "arsenald", version, about = "Tool-execution fabric daemon")]
struct Args {
    /// Path to the arsenal configuration (TOML with [tools.*] tables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP listener on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, default_value_t = 8710)]
    port: u16,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the workspace root from the config file
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::from(EXIT_USAGE);
        }
    };
    if let Some(workspace) = args.workspace.clone() {
        config.workspace_root = Some(workspace);
    }

    let core = match Core::with_process_runner(config) {
        Ok(core) => Arc::new(core),
        Err(err) => {
            error!("cannot assemble core: {}", err);
            let code = match err {
                InvokeError::BadRequest(_) => EXIT_USAGE,
                _ => EXIT_SOFTWARE,
            };
            return ExitCode::from(code);
        }
    };
    info!(tools = core.tool_names().len(), "core assembled");

    let addr = SocketAddr::new(args.host, args.port);
    if let Err(err) = serve(core, addr).await {
        error!("{:#}", err);
        return ExitCode::from(EXIT_SOFTWARE);
    }

    if INTERRUPTED.load(Ordering::SeqCst) {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    }
}

fn load_config(args: &Args) -> anyhow::Result<CoreConfig> {
    match &args.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(CoreConfig::default()),
    }
}

async fn serve(core: Arc<Core>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = http::router(core);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        INTERRUPTED.store(true, Ordering::SeqCst);
        info!("shutdown requested, draining connections");
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
