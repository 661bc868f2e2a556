use std::time::Duration;

use clap::Parser;

use crate::gossip::{DEFAULT_RETRY_INTERVAL, GossipConfig};

/// A gossip broadcast node speaking JSON lines on stdin and stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Milliseconds to wait between gossip rounds.
    #[arg(long, default_value_t = DEFAULT_RETRY_INTERVAL.as_millis() as u64)]
    pub retry_interval_ms: u64,

    /// Give up on a broadcast after this many rounds. Retries forever when unset.
    #[arg(long)]
    pub max_rounds: Option<u32>,
}

impl Cli {
    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            max_rounds: self.max_rounds,
        }
    }
}
