//! Run command
//!
//! Runs one job on demand against the configured databases.

use anyhow::{anyhow, Result};
use billsync_core::{get_job_by_name, get_job_names, Caller, RecordFailure, RunSummary};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;
use tokio::sync::watch;

use super::Context;
use crate::output::{
    format_timestamp, or_dash, print_info, print_json, print_output, print_single, print_success,
    print_warning, OutputFormat,
};

#[derive(Args)]
pub struct RunArgs {
    /// Job name, e.g. sinc_factura_fiscal (see `billsync jobs`)
    pub job: String,
}

/// Run summary row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct SummaryRow {
    #[tabled(rename = "Job")]
    pub job: String,
    #[tabled(rename = "Window")]
    pub window: String,
    #[tabled(rename = "Extracted")]
    pub extracted: usize,
    #[tabled(rename = "Inserted")]
    pub inserted: usize,
    #[tabled(rename = "Migrated")]
    pub already_migrated: usize,
    #[tabled(rename = "No Parent")]
    pub parent_missing: usize,
    #[tabled(rename = "Failed")]
    pub failed: usize,
    #[tabled(rename = "Cancelled")]
    pub cancelled: usize,
    #[tabled(rename = "Skipped")]
    pub skipped: usize,
    #[tabled(rename = "Duration")]
    pub duration: String,
}

impl From<&RunSummary> for SummaryRow {
    fn from(s: &RunSummary) -> Self {
        Self {
            job: s.job.to_string(),
            window: format!(
                "{} .. {}",
                format_timestamp(s.window.start),
                or_dash(s.window.end.map(format_timestamp))
            ),
            extracted: s.extracted,
            inserted: s.inserted,
            already_migrated: s.already_migrated,
            parent_missing: s.parent_missing,
            failed: s.failed,
            cancelled: s.cancelled,
            skipped: s.skipped,
            duration: format!("{} ms", s.duration_ms),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct FailureRow {
    #[tabled(rename = "Legacy Key")]
    legacy_key: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&RecordFailure> for FailureRow {
    fn from(f: &RecordFailure) -> Self {
        Self {
            legacy_key: f.legacy_key.clone(),
            error: f.error.clone(),
        }
    }
}

pub async fn execute(ctx: &Context, args: RunArgs) -> Result<()> {
    let kind = get_job_by_name(&args.job).ok_or_else(|| {
        anyhow!(
            "unknown job: {} (available: {})",
            args.job,
            get_job_names().join(", ")
        )
    })?;

    let (config, db) = ctx.connect().await?;
    let engine = db.engine(config);

    // Ctrl-C stops dispatching; records already in flight still finish
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let quiet = ctx.quiet;
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            print_warning("Interrupted, waiting for in-flight records...", quiet);
            let _ = cancel_tx.send(true);
        }
    });

    print_info(&format!("Running {} ({})...", kind, kind.description()), ctx.quiet);
    let result = engine
        .run_with_cancel(kind, Caller::OnDemand, Some(cancel_rx))
        .await;
    interrupt.abort();
    db.close().await;

    let summary = result?;
    render(ctx, &summary)?;

    if summary.failed > 0 {
        print_warning(
            &format!("{} record(s) failed, see `billsync failures --job {}`", summary.failed, kind),
            ctx.quiet,
        );
    } else {
        print_success(&format!("{} finished", kind), ctx.quiet);
    }
    Ok(())
}

fn render(ctx: &Context, summary: &RunSummary) -> Result<()> {
    match ctx.format {
        OutputFormat::Json => print_json(summary),
        OutputFormat::Table => {
            print_single(&SummaryRow::from(summary), ctx.format)?;
            if !summary.failures.is_empty() {
                let rows: Vec<FailureRow> = summary.failures.iter().map(FailureRow::from).collect();
                print_output(&rows, ctx.format, "")?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billsync_core::{JobKind, SyncWindow};
    use chrono::{NaiveDate, Utc};

    fn summary(end: Option<chrono::NaiveDateTime>) -> RunSummary {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        RunSummary {
            job: JobKind::Withholding,
            caller: Caller::OnDemand,
            window: SyncWindow {
                job: JobKind::Withholding,
                start,
                end,
                from_watermark: false,
            },
            extracted: 4,
            inserted: 2,
            already_migrated: 1,
            parent_missing: 1,
            failed: 0,
            cancelled: 0,
            skipped: 0,
            started_at: Utc::now(),
            duration_ms: 125,
            failures: vec![],
        }
    }

    #[test]
    fn test_summary_row_with_window_end() {
        let end = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0);
        let row = SummaryRow::from(&summary(end));
        assert_eq!(row.job, "sinc_retenciones");
        assert_eq!(row.window, "2024-01-01 00:00:00 .. 2024-06-01 00:00:00");
        assert_eq!(row.duration, "125 ms");
    }

    #[test]
    fn test_summary_row_open_window() {
        let row = SummaryRow::from(&summary(None));
        assert!(row.window.ends_with(".. -"));
    }
}
