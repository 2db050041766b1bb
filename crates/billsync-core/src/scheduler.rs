//! Cron Scheduler
//!
//! Runs the configured schedule entries against a [`SyncEngine`]. Entries
//! use the classic five-field crontab syntax and fire in the configured UTC
//! offset.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SyncScheduler                                │
//! │   JobScheduler (tokio-cron-scheduler)        │
//! │     ├─ "*/5 * * * *"  sinc_tasa_cambio       │
//! │     ├─ "*/10 * * * *" sinc_factura_fiscal    │
//! │     └─ ...                                   │
//! │   running: HashSet<JobKind>                  │
//! └──────────────────────────────────────────────┘
//!                      │ tick
//!                      ▼
//!          SyncEngine::run(kind, cronJob)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::FixedOffset;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::error::{Error, Result};
use crate::models::{Caller, JobKind};
use crate::services::{get_job_by_name, SyncEngine};

// =============================================================================
// Cron expressions
// =============================================================================

/// Prepend a seconds field to five-field crontab expressions
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

fn utc_offset(hours: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(hours * 3600)
        .ok_or_else(|| Error::config(format!("invalid UTC offset: {} hours", hours)))
}

// =============================================================================
// Overlap guard
// =============================================================================

type RunningJobs = Arc<Mutex<HashSet<JobKind>>>;

fn lock(running: &RunningJobs) -> MutexGuard<'_, HashSet<JobKind>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a job as running until dropped
struct RunGuard {
    running: RunningJobs,
    kind: JobKind,
}

impl RunGuard {
    /// `None` when `kind` is already running
    fn acquire(running: &RunningJobs, kind: JobKind) -> Option<Self> {
        if !lock(running).insert(kind) {
            return None;
        }
        Some(Self {
            running: running.clone(),
            kind,
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.kind);
    }
}

/// One scheduled tick: skip when the previous run is still active, contain
/// panics to this tick
async fn tick(engine: SyncEngine, running: RunningJobs, kind: JobKind) {
    let Some(_guard) = RunGuard::acquire(&running, kind) else {
        log::warn!("[{}] previous run still active, skipping tick", kind);
        return;
    };

    let handle = tokio::spawn(async move { engine.run(kind, Caller::Scheduler).await });
    match handle.await {
        Ok(Ok(summary)) => log::debug!(
            "[{}] tick done: {} inserted, {} failed",
            kind,
            summary.inserted,
            summary.failed
        ),
        // The engine already logged the failure
        Ok(Err(_)) => {}
        Err(e) if e.is_panic() => log::error!("[{}] run panicked", kind),
        Err(e) => log::error!("[{}] run aborted: {}", kind, e),
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Cron scheduler over the configured schedule entries
pub struct SyncScheduler {
    engine: SyncEngine,
    running: RunningJobs,
    scheduler: tokio::sync::Mutex<Option<JobScheduler>>,
}

impl SyncScheduler {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            running: Arc::new(Mutex::new(HashSet::new())),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    /// Register every enabled entry and start ticking. Returns the number of
    /// scheduled jobs.
    pub async fn start(&self) -> Result<usize> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            log::info!("Scheduler is already running");
            return Ok(0);
        }

        let config = self.engine.config();
        let offset = utc_offset(config.schedule_utc_offset_hours)?;
        let sched = JobScheduler::new().await?;
        let mut scheduled = 0;

        for entry in config.schedule.iter().filter(|e| e.enabled) {
            let Some(kind) = get_job_by_name(&entry.task) else {
                log::warn!("Unknown task in schedule, skipping: {}", entry.task);
                continue;
            };

            let cron = normalize_cron(&entry.schedule);
            let engine = self.engine.clone();
            let running = self.running.clone();
            let job = Job::new_async_tz(cron.as_str(), offset, move |_uuid, _lock| {
                let engine = engine.clone();
                let running = running.clone();
                Box::pin(async move { tick(engine, running, kind).await })
            })
            .map_err(|e| Error::config(format!("invalid schedule {:?}: {:?}", entry.schedule, e)))?;

            sched.add(job).await?;
            log::info!("Scheduled {} at \"{}\"", kind, entry.schedule);
            scheduled += 1;
        }

        sched.start().await?;
        log::info!(
            "Scheduler started with {} job(s), UTC offset {}",
            scheduled,
            offset
        );
        *slot = Some(sched);
        Ok(scheduled)
    }

    /// Stop ticking; runs already in progress finish on their own
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(mut sched) = self.scheduler.lock().await.take() {
            sched.shutdown().await?;
            log::info!("Scheduler stopped");
        }
        Ok(())
    }

    /// Jobs with a run in progress
    pub fn running(&self) -> Vec<JobKind> {
        lock(&self.running).iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScheduledTask, SyncConfig};
    use crate::store::{MemoryDestinationStore, MemoryLegacyStore};

    fn engine(schedule: Vec<ScheduledTask>) -> SyncEngine {
        let config = SyncConfig {
            schedule,
            ..Default::default()
        };
        SyncEngine::new(
            Arc::new(MemoryLegacyStore::new()),
            Arc::new(MemoryDestinationStore::new()),
            config,
        )
    }

    fn task(schedule: &str, name: &str, enabled: bool) -> ScheduledTask {
        ScheduledTask {
            schedule: schedule.to_string(),
            task: name.to_string(),
            enabled,
        }
    }

    // ========================================================================
    // Cron expressions
    // ========================================================================

    #[test]
    fn test_normalize_five_field_cron() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  0 3 * * 1 "), "0 0 3 * * 1");
    }

    #[test]
    fn test_normalize_keeps_six_field_cron() {
        assert_eq!(normalize_cron("30 */5 * * * *"), "30 */5 * * * *");
    }

    #[test]
    fn test_utc_offset_bounds() {
        assert_eq!(utc_offset(-4).unwrap().local_minus_utc(), -4 * 3600);
        assert!(utc_offset(30).is_err());
    }

    // ========================================================================
    // Overlap guard
    // ========================================================================

    #[test]
    fn test_guard_blocks_same_job_only() {
        let running: RunningJobs = Arc::new(Mutex::new(HashSet::new()));
        let first = RunGuard::acquire(&running, JobKind::Withholding);
        assert!(first.is_some());
        assert!(RunGuard::acquire(&running, JobKind::Withholding).is_none());
        assert!(RunGuard::acquire(&running, JobKind::ExchangeRate).is_some());

        drop(first);
        assert!(RunGuard::acquire(&running, JobKind::Withholding).is_some());
    }

    #[tokio::test]
    async fn test_tick_skipped_while_running() {
        let engine = engine(vec![]);
        let running: RunningJobs = Arc::new(Mutex::new(HashSet::new()));
        let _held = RunGuard::acquire(&running, JobKind::ExchangeRate).unwrap();

        tick(engine, running.clone(), JobKind::ExchangeRate).await;
        // Still held by the outer guard, not released by the skipped tick
        assert!(lock(&running).contains(&JobKind::ExchangeRate));
    }

    #[tokio::test]
    async fn test_tick_releases_guard() {
        let engine = engine(vec![]);
        let running: RunningJobs = Arc::new(Mutex::new(HashSet::new()));

        tick(engine, running.clone(), JobKind::ExchangeRate).await;
        assert!(lock(&running).is_empty());
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    #[tokio::test]
    async fn test_start_skips_unknown_and_disabled() {
        let scheduler = SyncScheduler::new(engine(vec![
            task("*/5 * * * *", "sinc_tasa_cambio", true),
            task("*/5 * * * *", "clean_sessions", true),
            task("*/5 * * * *", "sinc_retenciones", false),
        ]));

        assert_eq!(scheduler.start().await.unwrap(), 1);
        assert_eq!(scheduler.start().await.unwrap(), 0);
        scheduler.shutdown().await.unwrap();
        assert!(scheduler.running().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cron_is_config_error() {
        let scheduler = SyncScheduler::new(engine(vec![task(
            "not a cron",
            "sinc_tasa_cambio",
            true,
        )]));
        assert!(matches!(scheduler.start().await, Err(Error::Config(_))));
    }
}
