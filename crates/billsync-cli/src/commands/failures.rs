//! Failures command
//!
//! Lists records that failed and have not been migrated since.

use anyhow::{anyhow, Result};
use billsync_core::{get_job_by_name, DestinationStore, FailedRecord};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{format_timestamp, print_output};

#[derive(Args)]
pub struct FailuresArgs {
    /// Only failures of this job
    #[arg(short, long)]
    pub job: Option<String>,

    /// Maximum rows to show
    #[arg(short, long, default_value = "50")]
    pub limit: u32,
}

/// Failed record row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct FailureRow {
    #[tabled(rename = "Job")]
    pub job: String,
    #[tabled(rename = "Legacy Key")]
    pub legacy_key: String,
    #[tabled(rename = "Record Time")]
    pub record_at: String,
    #[tabled(rename = "Attempts")]
    pub attempts: i32,
    #[tabled(rename = "Last Failed")]
    pub last_failed_at: String,
    #[tabled(rename = "Error")]
    pub error: String,
}

impl From<FailedRecord> for FailureRow {
    fn from(f: FailedRecord) -> Self {
        Self {
            job: f.job,
            legacy_key: f.legacy_key,
            record_at: format_timestamp(f.record_at),
            attempts: f.attempts,
            last_failed_at: f.last_failed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            error: f.error,
        }
    }
}

pub async fn execute(ctx: &Context, args: FailuresArgs) -> Result<()> {
    let job = match &args.job {
        Some(name) => Some(get_job_by_name(name).ok_or_else(|| anyhow!("unknown job: {}", name))?),
        None => None,
    };

    let (config, db) = ctx.connect().await?;
    let engine = db.engine(config);
    let records = engine.destination().list_failures(job, args.limit).await;
    db.close().await;

    let rows: Vec<FailureRow> = records?.into_iter().map(FailureRow::from).collect();
    print_output(&rows, ctx.format, "No failed records.")
}
