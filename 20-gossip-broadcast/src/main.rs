use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::warn;

use gossip_broadcast::{cli::Cli, runtime};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // stdout carries the protocol, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let reader = BufReader::new(tokio::io::stdin());
    if let Err(err) = runtime::run(reader, tokio::io::stdout(), cli.gossip_config()).await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
