//! Bounded concurrent inserter
//!
//! Runs the per-record pipeline for a batch inside a [`JoinSet`], at most
//! `workers` records at a time. A permit is taken before each task is
//! spawned. Per-record errors are collected; they never stop siblings unless
//! the inserter runs in ordered mode. Dropping the returned future aborts
//! every task still in flight.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::error::{RecordError, Result};
use crate::models::RecordFailure;

/// Terminal state of a record that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Inserted,
    AlreadyMigrated,
    ParentMissing,
}

/// Outcome counts for one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertReport {
    pub inserted: usize,
    pub already_migrated: usize,
    pub parent_missing: usize,
    /// Records never dispatched because the run was cancelled
    pub cancelled: usize,
    /// Records never dispatched because an earlier one failed in ordered mode
    pub skipped: usize,
    pub failures: Vec<RecordFailure>,
    /// Keys of records inserted, or found already migrated, in this batch
    pub settled_keys: Vec<String>,
}

impl InsertReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, key: String, result: std::result::Result<RecordOutcome, RecordError>) {
        match result {
            Ok(RecordOutcome::Inserted) => {
                self.inserted += 1;
                self.settled_keys.push(key);
            }
            Ok(RecordOutcome::AlreadyMigrated) => {
                self.already_migrated += 1;
                self.settled_keys.push(key);
            }
            Ok(RecordOutcome::ParentMissing) => self.parent_missing += 1,
            Err(error) => self.failures.push(RecordFailure {
                legacy_key: key,
                error: error.to_string(),
            }),
        }
    }
}

/// Await a destination call with the job's short timeout
pub async fn timed<T, F>(limit: Duration, call: F) -> std::result::Result<T, RecordError>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(RecordError::from),
        Err(_) => Err(RecordError::Timeout(limit)),
    }
}

/// Semaphore-gated task group
#[derive(Debug, Clone)]
pub struct BoundedInserter {
    workers: usize,
    ordered: bool,
}

impl BoundedInserter {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ordered: false,
        }
    }

    /// One record at a time in batch order; the first failure stops dispatch
    pub fn ordered(mut self) -> Self {
        self.workers = 1;
        self.ordered = true;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process `records` with `op`, keyed by `key` for reporting.
    ///
    /// Once `cancel` turns true no further records are dispatched; records
    /// already running finish normally.
    pub async fn run<R, K, F, Fut>(
        &self,
        records: Vec<R>,
        key: K,
        op: F,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> InsertReport
    where
        R: Send + 'static,
        K: Fn(&R) -> String,
        F: Fn(R) -> Fut,
        Fut: Future<Output = std::result::Result<RecordOutcome, RecordError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut report = InsertReport::default();
        let total = records.len();

        for (dispatched, record) in records.into_iter().enumerate() {
            if self.ordered {
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((k, result)) => report.record(k, result),
                        Err(e) => log::error!("insert task aborted: {}", e),
                    }
                }
                if report.failed() > 0 {
                    report.skipped = total - dispatched;
                    break;
                }
            }

            let permit = match cancel.as_mut() {
                Some(rx) => {
                    if *rx.borrow() {
                        report.cancelled = total - dispatched;
                        break;
                    }
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => permit,
                        // A dropped sender never cancels
                        Ok(_) = rx.wait_for(|stop| *stop) => {
                            report.cancelled = total - dispatched;
                            break;
                        }
                    }
                }
                None => semaphore.clone().acquire_owned().await,
            };
            // The semaphore is never closed
            let Ok(permit) = permit else {
                report.cancelled = total - dispatched;
                break;
            };

            let record_key = key(&record);
            let work = op(record);
            tasks.spawn(async move {
                let _permit = permit;
                let result = AssertUnwindSafe(work).catch_unwind().await.unwrap_or_else(|_| {
                    Err(RecordError::Store("record pipeline panicked".to_string()))
                });
                (record_key, result)
            });

            // Reap finished tasks so the set does not grow with the batch
            while let Some(joined) = tasks.try_join_next() {
                if let Ok((k, result)) = joined {
                    report.record(k, result);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((k, result)) => report.record(k, result),
                Err(e) => log::error!("insert task aborted: {}", e),
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_counts_outcomes() {
        let inserter = BoundedInserter::new(3);
        let report = inserter
            .run(
                vec![1, 2, 3, 4],
                |n| n.to_string(),
                |n| async move {
                    match n {
                        1 => Ok(RecordOutcome::Inserted),
                        2 => Ok(RecordOutcome::AlreadyMigrated),
                        3 => Ok(RecordOutcome::ParentMissing),
                        _ => Err(RecordError::unresolved("client", "x")),
                    }
                },
                None,
            )
            .await;

        assert_eq!(report.inserted, 1);
        let mut settled = report.settled_keys.clone();
        settled.sort();
        assert_eq!(settled, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(report.already_migrated, 1);
        assert_eq!(report.parent_missing, 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].legacy_key, "4");
    }

    #[tokio::test]
    async fn test_never_exceeds_worker_count() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let inserter = BoundedInserter::new(4);

        let report = inserter
            .run(
                (0..40).collect::<Vec<u32>>(),
                |n| n.to_string(),
                |_| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(RecordOutcome::Inserted)
                    }
                },
                None,
            )
            .await;

        assert_eq!(report.inserted, 40);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_panic_is_a_record_failure() {
        let inserter = BoundedInserter::new(2);
        let report = inserter
            .run(
                vec![1, 2],
                |n| n.to_string(),
                |n| async move {
                    if n == 2 {
                        panic!("boom");
                    }
                    Ok(RecordOutcome::Inserted)
                },
                None,
            )
            .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.failures[0].legacy_key, "2");
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let (tx, rx) = watch::channel(true);
        let inserter = BoundedInserter::new(2);
        let report = inserter
            .run(
                vec![1, 2, 3],
                |n| n.to_string(),
                |_| async { Ok(RecordOutcome::Inserted) },
                Some(rx),
            )
            .await;
        drop(tx);

        assert_eq!(report.inserted, 0);
        assert_eq!(report.cancelled, 3);
    }

    #[tokio::test]
    async fn test_closed_cancel_channel_never_cancels() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let inserter = BoundedInserter::new(1);
        let report = inserter
            .run(
                (0..20).collect::<Vec<u32>>(),
                |n| n.to_string(),
                |_| async {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok(RecordOutcome::Inserted)
                },
                Some(rx),
            )
            .await;

        assert_eq!(report.inserted, 20);
        assert_eq!(report.cancelled, 0);
    }

    #[tokio::test]
    async fn test_ordered_stops_at_first_failure() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let inserter = BoundedInserter::new(4).ordered();
        assert_eq!(inserter.workers(), 1);

        let report = inserter
            .run(
                vec![1, 2, 3, 4],
                |n| n.to_string(),
                |n| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(n);
                        if n == 2 {
                            Err(RecordError::Store("down".to_string()))
                        } else {
                            Ok(RecordOutcome::Inserted)
                        }
                    }
                },
                None,
            )
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failures[0].legacy_key, "2");
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_timed_maps_timeout() {
        let result: std::result::Result<(), RecordError> =
            timed(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(RecordError::Timeout(Duration::from_millis(10))));
    }
}
