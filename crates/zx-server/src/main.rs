//! zxserve: serve local directories as zx trees.
//!
//! ```bash
//! # Serve ~/zx as tree "main" without client authentication
//! zxserve --noauth main=~/zx
//!
//! # Everything from $XDG_CONFIG_HOME/zx/server.toml, cached
//! zxserve --cache
//! ```

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use zx_server::constants::DEFAULT_LOG;
use zx_server::{Args, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("zxserve: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let settings = Settings::load(args)?;
    let running = zx_server::start(&settings).await?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            tracing::info!("interrupted");
        }
        _ = running.server.wait() => {}
    }
    running.shutdown().await
}
