//! Job Registry
//!
//! Built-in per-job settings, name lookup, and the [`SyncEngine`] entry point
//! that runs one job under its run timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::watch;

use super::jobs::{
    ExchangeRateJob, FiscalInvoiceJob, JobContext, PreInvoiceJob, ReceiptJob, WithholdingJob,
};
use super::orchestrator::run_job;
use crate::config::{LineItemTransfer, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{Caller, JobKind, RunSummary};
use crate::store::{DestinationStore, LegacyStore, PreInvoiceFilter, ReceiptFilter};

/// Effective settings of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSettings {
    /// Window length; `None` extracts everything after the watermark
    pub window_months: Option<u32>,
    pub row_cap: u32,
    pub workers: usize,
    /// Insert in extraction order and stop at the first failed record
    pub ordered: bool,
    /// Timeout of every destination call made for a single record
    pub write_timeout: Duration,
    /// Timeout of the whole run
    pub run_timeout: Duration,
    pub backfill_start: Option<NaiveDateTime>,
    pub line_item_transfer: LineItemTransfer,
    pub company_id: i32,
}

impl JobSettings {
    /// Built-in defaults for `kind`
    pub fn defaults(kind: JobKind) -> Self {
        let (window_months, row_cap, workers, write_ms, run_secs) = match kind {
            JobKind::ExchangeRate => (None, 1000, 1, 2000, 30),
            JobKind::FiscalInvoice | JobKind::VoidedPreInvoice | JobKind::PaidPreInvoice => {
                (Some(5), 4000, 10, 1000, 55)
            }
            JobKind::Withholding => (Some(5), 1500, 10, 1000, 55),
            JobKind::VoidedReceipt | JobKind::ProcessedReceipt => (Some(8), 3500, 13, 2000, 55),
        };

        Self {
            window_months,
            row_cap,
            workers,
            ordered: kind == JobKind::ExchangeRate,
            write_timeout: Duration::from_millis(write_ms),
            run_timeout: Duration::from_secs(run_secs),
            backfill_start: None,
            line_item_transfer: LineItemTransfer::default(),
            company_id: 1,
        }
    }
}

/// Get job by its task name
pub fn get_job_by_name(name: &str) -> Option<JobKind> {
    name.parse().ok()
}

/// Get all registered job names
pub fn get_job_names() -> Vec<&'static str> {
    JobKind::ALL.iter().map(|k| k.name()).collect()
}

/// Runs jobs against a pair of stores
#[derive(Clone)]
pub struct SyncEngine {
    legacy: Arc<dyn LegacyStore>,
    destination: Arc<dyn DestinationStore>,
    config: Arc<SyncConfig>,
}

impl SyncEngine {
    pub fn new(
        legacy: Arc<dyn LegacyStore>,
        destination: Arc<dyn DestinationStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            legacy,
            destination,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn destination(&self) -> &Arc<dyn DestinationStore> {
        &self.destination
    }

    /// Run `kind` once
    pub async fn run(&self, kind: JobKind, caller: Caller) -> Result<RunSummary> {
        self.run_with_cancel(kind, caller, None).await
    }

    /// Run `kind` once; dispatch stops when `cancel` turns true
    pub async fn run_with_cancel(
        &self,
        kind: JobKind,
        caller: Caller,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<RunSummary> {
        let ctx = JobContext {
            legacy: self.legacy.clone(),
            destination: self.destination.clone(),
            settings: self.config.settings_for(kind),
        };
        let run_timeout = ctx.settings.run_timeout;

        let run = async {
            match kind {
                JobKind::ExchangeRate => {
                    run_job(Arc::new(ExchangeRateJob::new(ctx.clone())), &ctx, caller, cancel).await
                }
                JobKind::FiscalInvoice => {
                    run_job(Arc::new(FiscalInvoiceJob::new(ctx.clone())), &ctx, caller, cancel)
                        .await
                }
                JobKind::VoidedPreInvoice => {
                    let job = PreInvoiceJob::new(ctx.clone(), PreInvoiceFilter::Voided);
                    run_job(Arc::new(job), &ctx, caller, cancel).await
                }
                JobKind::PaidPreInvoice => {
                    let job = PreInvoiceJob::new(ctx.clone(), PreInvoiceFilter::Paid);
                    run_job(Arc::new(job), &ctx, caller, cancel).await
                }
                JobKind::Withholding => {
                    run_job(Arc::new(WithholdingJob::new(ctx.clone())), &ctx, caller, cancel).await
                }
                JobKind::VoidedReceipt => {
                    let job = ReceiptJob::new(ctx.clone(), ReceiptFilter::Voided);
                    run_job(Arc::new(job), &ctx, caller, cancel).await
                }
                JobKind::ProcessedReceipt => {
                    let job = ReceiptJob::new(ctx.clone(), ReceiptFilter::Processed);
                    run_job(Arc::new(job), &ctx, caller, cancel).await
                }
            }
        };

        match tokio::time::timeout(run_timeout, run).await {
            Ok(result) => {
                if let Err(e) = &result {
                    log::error!("[{}] {}/failed: {}", kind, caller, e);
                }
                result
            }
            Err(_) => {
                log::error!("[{}] {}/timeout after {:?}", kind, caller, run_timeout);
                Err(Error::Timeout(run_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_job() {
        let rates = JobSettings::defaults(JobKind::ExchangeRate);
        assert_eq!(rates.window_months, None);
        assert_eq!(rates.row_cap, 1000);
        assert_eq!(rates.workers, 1);
        assert!(rates.ordered);
        assert_eq!(rates.run_timeout, Duration::from_secs(30));

        let receipts = JobSettings::defaults(JobKind::ProcessedReceipt);
        assert_eq!(receipts.window_months, Some(8));
        assert_eq!(receipts.workers, 13);
        assert!(!receipts.ordered);
        assert_eq!(receipts.write_timeout, Duration::from_secs(2));

        let withholdings = JobSettings::defaults(JobKind::Withholding);
        assert_eq!(withholdings.row_cap, 1500);
        assert_eq!(withholdings.write_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_get_job_by_name() {
        assert_eq!(get_job_by_name("sinc_retenciones"), Some(JobKind::Withholding));
        assert!(get_job_by_name("unknown").is_none());
    }

    #[test]
    fn test_get_job_names() {
        let names = get_job_names();
        assert_eq!(names.len(), 7);
        assert!(names.contains(&"sinc_tasa_cambio"));
        assert!(names.contains(&"sinc_recibopago_procesados"));
    }
}
