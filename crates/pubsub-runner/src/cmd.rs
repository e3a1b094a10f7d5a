mod start;

use std::path::PathBuf;

use clap::Args;
use redis_pubsub_input::DecoderRegistry;

use crate::config::{self, Overrides, RunnerConfig};
use crate::error::RunnerResult;

pub use start::run_start;

/// Config file plus per-field overrides, shared by `run` and `config`.
#[derive(Args)]
pub struct InputArgs {
    /// Path to a YAML config file (defaults are used when omitted)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Broker address as host:port, or :port for the local host (overrides config)
    #[arg(long, env = "PUBSUB_ADDRESS")]
    address: Option<String>,
    /// Channel pattern to subscribe to (overrides config)
    #[arg(long, env = "PUBSUB_CHANNEL")]
    channel: Option<String>,
    /// Registered decoder name, empty for raw payloads (overrides config)
    #[arg(long, env = "PUBSUB_DECODER")]
    decoder: Option<String>,
    /// Number of pooled work buffers (overrides config)
    #[arg(long, env = "PUBSUB_POOL_SIZE")]
    pool_size: Option<usize>,
}

impl InputArgs {
    async fn resolve(self) -> RunnerResult<RunnerConfig> {
        let overrides = Overrides {
            address: self.address,
            channel: self.channel,
            decoder: self.decoder,
            pool_size: self.pool_size,
        };
        config::resolve(self.config.as_deref(), overrides).await
    }
}

/// Print the effective configuration as YAML.
pub async fn run_config(args: InputArgs) -> RunnerResult<()> {
    let config = args.resolve().await?;
    print!("{}", config.render()?);
    Ok(())
}

/// Print the names of the decoders a config may refer to.
pub fn run_decoders() {
    for name in DecoderRegistry::with_builtins().names() {
        println!("{name}");
    }
}
