//! Jobs command
//!
//! Lists every job with the settings a run would use. Needs no database.

use anyhow::Result;
use billsync_core::{JobKind, JobSettings, SyncConfig};
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{format_timestamp, or_dash, print_output};

/// Job row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct JobRow {
    #[tabled(rename = "Job")]
    pub name: String,
    #[tabled(rename = "Description")]
    pub description: String,
    #[tabled(rename = "Window (months)")]
    pub window_months: String,
    #[tabled(rename = "Row Cap")]
    pub row_cap: u32,
    #[tabled(rename = "Workers")]
    pub workers: usize,
    #[tabled(rename = "Write Timeout")]
    pub write_timeout: String,
    #[tabled(rename = "Run Timeout")]
    pub run_timeout: String,
    #[tabled(rename = "Backfill Start")]
    pub backfill_start: String,
    #[tabled(rename = "Scheduled")]
    pub schedule: String,
}

fn job_row(config: &SyncConfig, kind: JobKind) -> JobRow {
    let settings: JobSettings = config.settings_for(kind);
    let schedule: Vec<&str> = config
        .schedule
        .iter()
        .filter(|e| e.enabled && e.task == kind.name())
        .map(|e| e.schedule.as_str())
        .collect();

    JobRow {
        name: kind.name().to_string(),
        description: kind.description().to_string(),
        window_months: or_dash(settings.window_months),
        row_cap: settings.row_cap,
        workers: settings.workers,
        write_timeout: format!("{} ms", settings.write_timeout.as_millis()),
        run_timeout: format!("{} s", settings.run_timeout.as_secs()),
        backfill_start: or_dash(settings.backfill_start.map(format_timestamp)),
        schedule: if schedule.is_empty() {
            "-".to_string()
        } else {
            schedule.join(", ")
        },
    }
}

pub async fn execute(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let rows: Vec<JobRow> = JobKind::ALL.iter().map(|k| job_row(&config, *k)).collect();
    print_output(&rows, ctx.format, "No jobs registered.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use billsync_core::{JobOverrides, ScheduledTask};
    use std::collections::HashMap;

    #[test]
    fn test_job_row_defaults() {
        let row = job_row(&SyncConfig::default(), JobKind::ExchangeRate);
        assert_eq!(row.name, "sinc_tasa_cambio");
        assert_eq!(row.window_months, "-");
        assert_eq!(row.workers, 1);
        assert_eq!(row.backfill_start, "-");
        assert_eq!(row.schedule, "-");
    }

    #[test]
    fn test_job_row_applies_overrides_and_schedule() {
        let mut jobs = HashMap::new();
        jobs.insert(
            "sinc_retenciones".to_string(),
            JobOverrides {
                workers: Some(2),
                window_months: Some(3),
                ..Default::default()
            },
        );
        let config = SyncConfig {
            jobs,
            schedule: vec![
                ScheduledTask {
                    schedule: "*/10 * * * *".to_string(),
                    task: "sinc_retenciones".to_string(),
                    enabled: true,
                },
                ScheduledTask {
                    schedule: "0 * * * *".to_string(),
                    task: "sinc_retenciones".to_string(),
                    enabled: false,
                },
            ],
            ..Default::default()
        };

        let row = job_row(&config, JobKind::Withholding);
        assert_eq!(row.workers, 2);
        assert_eq!(row.window_months, "3");
        assert_eq!(row.schedule, "*/10 * * * *");
    }
}
