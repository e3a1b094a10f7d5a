use std::path::Path;

use redis_pubsub_input::InputConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

pub(crate) const DEFAULT_POOL_SIZE: usize = 100;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub input: InputConfig,
    /// Number of reusable work buffers shared between input and pipeline.
    pub pool_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Command-line / environment values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub address: Option<String>,
    pub channel: Option<String>,
    pub decoder: Option<String>,
    pub pool_size: Option<usize>,
}

/// Load a runner config from a YAML file. Missing fields take their defaults.
pub async fn load(path: &Path) -> RunnerResult<RunnerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    parse(&content).map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))
}

fn parse(content: &str) -> Result<RunnerConfig, serde_yaml_ng::Error> {
    // An empty document deserializes as null, not as an empty mapping.
    if content.trim().is_empty() {
        return Ok(RunnerConfig::default());
    }
    serde_yaml_ng::from_str(content)
}

/// Load `path` if given (defaults otherwise), apply overrides, and validate.
pub async fn resolve(path: Option<&Path>, overrides: Overrides) -> RunnerResult<RunnerConfig> {
    let mut config = match path {
        Some(path) => load(path).await?,
        None => RunnerConfig::default(),
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}

impl RunnerConfig {
    pub fn apply(&mut self, overrides: Overrides) {
        let Overrides {
            address,
            channel,
            decoder,
            pool_size,
        } = overrides;
        if let Some(address) = address {
            self.input.address = address;
        }
        if let Some(channel) = channel {
            self.input.channel = channel;
        }
        if let Some(decoder) = decoder {
            self.input.decoder = decoder;
        }
        if let Some(pool_size) = pool_size {
            self.pool_size = pool_size;
        }
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.input.address.is_empty() {
            return Err(RunnerError::Config(
                "input.address is required (set in config or via --address / PUBSUB_ADDRESS)"
                    .into(),
            ));
        }
        if self.input.channel.is_empty() {
            return Err(RunnerError::Config(
                "input.channel is required (set in config or via --channel / PUBSUB_CHANNEL)"
                    .into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(RunnerError::Config("pool_size must be at least 1".into()));
        }
        Ok(())
    }

    /// The effective configuration as YAML.
    pub fn render(&self) -> RunnerResult<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| RunnerError::Config(format!("serialize config: {e}")))
    }
}
