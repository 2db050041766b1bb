//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod config;
pub mod failures;
pub mod jobs;
pub mod run;
pub mod schedule;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use billsync_core::{Database, SyncConfig};

use crate::output::OutputFormat;

/// Shared context for all commands
pub struct Context {
    pub format: OutputFormat,
    pub quiet: bool,
    pub config_path: Option<PathBuf>,
}

impl Context {
    /// Load the configuration file plus env overrides
    pub fn load_config(&self) -> Result<SyncConfig> {
        SyncConfig::load(self.config_path.as_deref()).context("failed to load configuration")
    }

    /// Load the configuration and open both databases
    pub async fn connect(&self) -> Result<(SyncConfig, Database)> {
        let config = self.load_config()?;
        let db = Database::connect(&config)
            .await
            .context("failed to connect to the databases")?;
        Ok((config, db))
    }
}
