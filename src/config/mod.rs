//! Configuration for the consensus core and its operation pipeline.
//!
//! Hierarchical loading with defaults as the base layer, an optional file
//! from `CONFIG_PATH`, and environment overrides on top.

mod consensus;

pub use consensus::*;

#[cfg(test)]
mod config_test;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Top-level configuration container.
///
/// Sources are merged in order (later overrides earlier):
/// 1. Type defaults
/// 2. Configuration file named by `CONFIG_PATH`
/// 3. Environment variables with the `RAFTLET__` prefix
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TabletConfig {
    /// Core Raft parameters: heartbeats, elections, leases, RPC deadlines.
    pub consensus: ConsensusOptions,

    /// Prepare/apply pipeline parameters.
    pub pipeline: PipelineOptions,
}

impl TabletConfig {
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path));
        }

        builder = builder.add_source(
            Environment::with_prefix("RAFTLET")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies a file of overrides on top of the current values, then
    /// re-applies the environment.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("RAFTLET")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.consensus.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }
}
