//! Cross-reference resolver
//!
//! Wraps the single combined destination lookup and classifies its result.
//! Precedence: already migrated, then parent missing, then whatever required
//! mapping the job asks for through [`Refs`].

use std::time::Duration;

use super::inserter::timed;
use crate::error::RecordError;
use crate::models::MigratedRef;
use crate::store::{DestinationStore, RefRequest, ResolvedRefs};

/// What to do with a record after its references were looked up
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Proceed(Refs),
    AlreadyMigrated(MigratedRef),
    ParentMissing,
}

/// Resolved keys with accessors that turn a missing required mapping into a
/// per-record error naming the legacy key
#[derive(Debug, Clone, PartialEq)]
pub struct Refs {
    resolved: ResolvedRefs,
    request: RefRequest,
}

fn required<T: Copy>(
    value: Option<T>,
    what: &'static str,
    key: Option<&str>,
) -> Result<T, RecordError> {
    value.ok_or_else(|| RecordError::unresolved(what, key.unwrap_or_default()))
}

impl Refs {
    pub fn creator(&self) -> Result<i64, RecordError> {
        required(
            self.resolved.created_by,
            "created_by",
            self.request.created_by.as_deref(),
        )
    }

    pub fn updater(&self) -> Result<i64, RecordError> {
        required(
            self.resolved.updated_by,
            "updated_by",
            self.request.updated_by.as_deref(),
        )
    }

    /// Creator when known; exchange rates accept an unknown creator
    pub fn optional_creator(&self) -> Option<i64> {
        self.resolved.created_by
    }

    pub fn client(&self) -> Result<i64, RecordError> {
        required(self.resolved.client_id, "client", self.request.client.as_deref())
    }

    pub fn rate(&self) -> Result<f64, RecordError> {
        let at = self.request.rate_at.map(|at| at.to_string());
        required(self.resolved.exchange_rate, "exchange rate", at.as_deref())
    }

    pub fn payment_account(&self) -> Result<i64, RecordError> {
        let key = self
            .request
            .payment_account
            .as_ref()
            .map(|k| format!("{}/{}/{}/{}", k.bank, k.currency, k.method, k.web_name));
        required(
            self.resolved.payment_account_id,
            "payment account",
            key.as_deref(),
        )
    }

    /// The parent; present whenever the request named one
    pub fn parent(&self) -> Result<&MigratedRef, RecordError> {
        self.resolved.parent.as_ref().ok_or_else(|| {
            RecordError::unresolved(
                "parent",
                self.request
                    .parent
                    .as_ref()
                    .map(|p| p.legacy_key().to_string())
                    .unwrap_or_default(),
            )
        })
    }
}

/// Classify a lookup result
pub fn classify(request: &RefRequest, resolved: ResolvedRefs) -> Resolution {
    if let Some(existing) = resolved.existing {
        return Resolution::AlreadyMigrated(existing);
    }
    if request.parent.is_some() && resolved.parent.is_none() {
        return Resolution::ParentMissing;
    }
    Resolution::Proceed(Refs {
        resolved,
        request: request.clone(),
    })
}

/// Run the combined lookup under the job's write timeout
pub async fn resolve(
    destination: &dyn DestinationStore,
    request: &RefRequest,
    timeout: Duration,
) -> Result<Resolution, RecordError> {
    let resolved = timed(timeout, destination.resolve_refs(request)).await?;
    Ok(classify(request, resolved))
}
