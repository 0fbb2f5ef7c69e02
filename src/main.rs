use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crated::core::engine::Engine;
use crated::daemon::Daemon;
use crated::Config;

/// The crated container runtime daemon.
#[derive(Parser, Debug)]
#[command(name = "crated", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/crated.conf")]
    config: PathBuf,

    /// Override the RPC socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(socket) = args.socket {
        config.daemon.socket_path = socket;
    }

    env_logger::Builder::new()
        .parse_filters(&config.daemon.log_level)
        .init();

    let engine = Engine::new(config).context("failed to initialize the engine")?;
    Daemon::new(engine).run().context("daemon failed")?;
    Ok(())
}
