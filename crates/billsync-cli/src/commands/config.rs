//! Config commands
//!
//! Inspect the effective configuration.

use std::path::PathBuf;

use anyhow::Result;
use billsync_core::{get_config_path, SyncConfig};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{format_timestamp, or_dash, print_info, print_json, print_output, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration, credentials masked
    Show,

    /// Print the configuration file path
    Path,
}

/// Config row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct ConfigRow {
    #[tabled(rename = "Key")]
    pub key: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl ConfigRow {
    fn new(key: &str, value: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

pub async fn execute(ctx: &Context, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => show_config(ctx),
        ConfigAction::Path => {
            println!("{}", config_path(ctx)?.display());
            Ok(())
        }
    }
}

fn config_path(ctx: &Context) -> Result<PathBuf> {
    match &ctx.config_path {
        Some(path) => Ok(path.clone()),
        None => Ok(get_config_path()?),
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    let path = config_path(ctx)?;
    if !path.exists() {
        print_info(
            &format!("No configuration file at {}, showing defaults", path.display()),
            ctx.quiet,
        );
    }

    let config = ctx.load_config()?.masked();
    match ctx.format {
        OutputFormat::Json => print_json(&config),
        OutputFormat::Table => print_output(&config_rows(&config), ctx.format, ""),
    }
}

fn config_rows(config: &SyncConfig) -> Vec<ConfigRow> {
    let mut rows = vec![
        ConfigRow::new("source_url", or_dash(config.source_url.as_deref())),
        ConfigRow::new("destination_url", or_dash(config.destination_url.as_deref())),
        ConfigRow::new("source_max_connections", config.source_max_connections),
        ConfigRow::new("destination_max_connections", config.destination_max_connections),
        ConfigRow::new("company_id", config.company_id),
        ConfigRow::new(
            "line_item_transfer",
            serde_json::to_value(config.line_item_transfer)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        ),
        ConfigRow::new("backfill_start", or_dash(config.backfill_start.map(format_timestamp))),
        ConfigRow::new("schedule_utc_offset_hours", config.schedule_utc_offset_hours),
    ];

    let mut overridden: Vec<&String> = config.jobs.keys().collect();
    overridden.sort();
    for name in overridden {
        if let Ok(value) = serde_json::to_string(&config.jobs[name]) {
            rows.push(ConfigRow::new(&format!("jobs.{}", name), value));
        }
    }

    for entry in &config.schedule {
        let state = if entry.enabled { "" } else { " (disabled)" };
        rows.push(ConfigRow::new(
            "schedule",
            format!("{} {}{}", entry.schedule, entry.task, state),
        ));
    }
    rows
}
