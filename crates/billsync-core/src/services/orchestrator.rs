//! Sync orchestrator
//!
//! One run of one job: resolve window, extract, push every record through the
//! bounded inserter, persist failure tracking, then log and return the
//! [`RunSummary`].
//!
//! Records that failed in an earlier run stay tracked until they go through.
//! Windowed jobs re-extract the span of their tracked failures on every run,
//! since the watermark may already have passed them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use tokio::sync::watch;

use super::inserter::{BoundedInserter, InsertReport, RecordOutcome};
use super::jobs::JobContext;
use super::watermark;
use crate::error::{RecordError, Result};
use crate::models::{Caller, JobKind, PoolStatus, RunSummary, SyncWindow};

/// One entity type's extraction and per-record pipeline
#[async_trait]
pub trait SyncJob: Send + Sync + 'static {
    type Record: Send + 'static;

    fn kind(&self) -> JobKind;

    /// Pull the window's records from the legacy store. Errors are fatal.
    async fn extract(&self, window: &SyncWindow) -> Result<Vec<Self::Record>>;

    /// Legacy key used for reporting and failure tracking
    fn record_key(&self, record: &Self::Record) -> String;

    /// Legacy timestamp the extraction window filters on
    fn record_timestamp(&self, record: &Self::Record) -> NaiveDateTime;

    /// Decode, resolve, reconcile and insert one record
    async fn process(&self, record: Self::Record) -> std::result::Result<RecordOutcome, RecordError>;
}

fn pools(ctx: &JobContext) -> String {
    let show = |status: Option<PoolStatus>| {
        status.map_or_else(|| "n/a".to_string(), |s| s.to_string())
    };
    format!(
        "source[{}] destination[{}]",
        show(ctx.legacy.pool_status()),
        show(ctx.destination.pool_status())
    )
}

fn window_label(window: &SyncWindow) -> String {
    match window.end {
        Some(end) => format!("[{} .. {}]", window.start, end),
        None => format!("({} ..)", window.start),
    }
}

/// Execute one run of `job`
pub async fn run_job<J: SyncJob>(
    job: Arc<J>,
    ctx: &JobContext,
    caller: Caller,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<RunSummary> {
    let kind = job.kind();
    let started_at = Utc::now();
    let timer = Instant::now();
    log::info!("[{}] {}/begin {}", kind, caller, pools(ctx));

    let window = watermark::resolve_window(ctx.destination.as_ref(), kind, &ctx.settings).await?;
    log::info!(
        "[{}] window {}{}",
        kind,
        window_label(&window),
        if window.from_watermark {
            ""
        } else {
            " (backfill)"
        }
    );

    let mut records = job.extract(&window).await?;
    log::debug!("[{}] extracted {} records", kind, records.len());
    if kind.is_windowed() {
        records = with_tracked_failures(job.as_ref(), ctx, records).await?;
    }
    let extracted = records.len();

    let stamps: HashMap<String, NaiveDateTime> = records
        .iter()
        .map(|r| (job.record_key(r), job.record_timestamp(r)))
        .collect();

    let mut inserter = BoundedInserter::new(ctx.settings.workers);
    if ctx.settings.ordered {
        inserter = inserter.ordered();
    }
    let report = inserter
        .run(
            records,
            |record| job.record_key(record),
            |record| {
                let job = job.clone();
                async move { job.process(record).await }
            },
            cancel,
        )
        .await;

    track_failures(kind, ctx, &report, &stamps).await;

    let summary = RunSummary {
        job: kind,
        caller,
        window,
        extracted,
        inserted: report.inserted,
        already_migrated: report.already_migrated,
        parent_missing: report.parent_missing,
        failed: report.failed(),
        cancelled: report.cancelled,
        skipped: report.skipped,
        started_at,
        duration_ms: timer.elapsed().as_millis() as u64,
        failures: report.failures,
    };

    log::info!(
        "[{}] {}/ending extracted={} inserted={} already_migrated={} parent_missing={} failed={} cancelled={} skipped={} in {}ms {}",
        kind,
        caller,
        summary.extracted,
        summary.inserted,
        summary.already_migrated,
        summary.parent_missing,
        summary.failed,
        summary.cancelled,
        summary.skipped,
        summary.duration_ms,
        pools(ctx)
    );

    Ok(summary)
}

/// Add the records inside the span of tracked failures to `records`.
/// Records already in the batch are not repeated.
async fn with_tracked_failures<J: SyncJob>(
    job: &J,
    ctx: &JobContext,
    records: Vec<J::Record>,
) -> Result<Vec<J::Record>> {
    let kind = job.kind();
    let (first, last) = match ctx.destination.failure_span(kind).await {
        Ok(Some(span)) => span,
        Ok(None) => return Ok(records),
        Err(e) => {
            log::warn!("[{}] could not read tracked failures: {}", kind, e);
            return Ok(records);
        }
    };

    let retry_window = SyncWindow {
        job: kind,
        start: first,
        end: Some(last),
        from_watermark: true,
    };
    let retried = job.extract(&retry_window).await?;

    let seen: HashSet<String> = records.iter().map(|r| job.record_key(r)).collect();
    let mut merged: Vec<J::Record> = retried
        .into_iter()
        .filter(|r| !seen.contains(&job.record_key(r)))
        .collect();
    log::info!(
        "[{}] retrying {} records from {}",
        kind,
        merged.len(),
        window_label(&retry_window)
    );
    merged.extend(records);
    Ok(merged)
}

/// Persist this batch's failures and forget the ones that now went through.
/// Tracking is best effort; it never fails the run.
async fn track_failures(
    kind: JobKind,
    ctx: &JobContext,
    report: &InsertReport,
    stamps: &HashMap<String, NaiveDateTime>,
) {
    if !report.failures.is_empty() {
        log::warn!("[{}] {} records failed", kind, report.failed());
    }

    for failure in &report.failures {
        log::debug!("[{}] {}: {}", kind, failure.legacy_key, failure.error);
        let Some(record_at) = stamps.get(&failure.legacy_key) else {
            continue;
        };
        if let Err(e) = ctx
            .destination
            .record_failure(kind, &failure.legacy_key, *record_at, &failure.error)
            .await
        {
            log::warn!(
                "[{}] could not record failure of {}: {}",
                kind,
                failure.legacy_key,
                e
            );
        }
    }

    if !report.settled_keys.is_empty() {
        if let Err(e) = ctx
            .destination
            .clear_failures(kind, &report.settled_keys)
            .await
        {
            log::warn!("[{}] could not clear tracked failures: {}", kind, e);
        }
    }
}
