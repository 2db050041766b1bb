//! Watermark resolver
//!
//! The window of a run is derived every time from the latest timestamp already
//! migrated for the job's scope. Nothing is persisted.

use chrono::{Months, NaiveDateTime};

use super::registry::JobSettings;
use crate::error::{Error, Result};
use crate::models::{JobKind, SyncWindow};
use crate::store::DestinationStore;

/// Window for the next run of `kind`
pub async fn resolve_window(
    destination: &dyn DestinationStore,
    kind: JobKind,
    settings: &JobSettings,
) -> Result<SyncWindow> {
    let latest = destination.latest_timestamp(kind).await?;
    let from_watermark = latest.is_some();

    let start = match (latest, settings.backfill_start) {
        (Some(ts), _) => ts,
        (None, Some(backfill)) => backfill,
        (None, None) if !kind.is_windowed() => epoch(),
        (None, None) => {
            return Err(Error::config(format!(
                "{}: destination scope is empty and no backfill_start is configured",
                kind
            )))
        }
    };

    let end = match settings.window_months {
        Some(months) => Some(start.checked_add_months(Months::new(months)).ok_or_else(|| {
            Error::config(format!("{}: window end overflows from {}", kind, start))
        })?),
        None => None,
    };

    Ok(SyncWindow {
        job: kind,
        start,
        end,
        from_watermark,
    })
}

/// 1970-01-01 00:00:00
fn epoch() -> NaiveDateTime {
    NaiveDateTime::default()
}
