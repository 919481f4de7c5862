//! CCW server binary: stdio JSON-RPC over a per-user storage directory.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use ccw_server::{run_stdio, Server};

#[derive(Parser, Debug)]
#[command(name = "ccw-mcp", version, about = "Counterfactual execution service")]
struct Cli {
    /// Run in stdio mode (the default and only transport).
    #[arg(long, default_value_t = true)]
    stdio: bool,

    /// Storage directory for capsules and witnesses.
    #[arg(long)]
    storage: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the wire.
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = match cli.storage {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not determine home directory")?
            .join(".ccw-mcp"),
    };

    let mut server = Server::new(&storage).context("server initialization failed")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }

    info!(storage = %storage.display(), stdio = cli.stdio, "serving on stdio");
    run_stdio(&mut server, &shutdown)?;
    Ok(())
}
