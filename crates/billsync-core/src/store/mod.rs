//! Store Abstraction
//!
//! The engine talks to both databases only through these two traits, so the
//! pools can be swapped for the in-memory fakes in `memory`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐     ┌───────────────────────────┐
//! │ trait LegacyStore    │     │ trait DestinationStore    │
//! │   (read-only)        │     │   watermarks, lookups,    │
//! │                      │     │   inserts, failure log    │
//! └──────────────────────┘     └───────────────────────────┘
//!     │            │                │               │
//!     ▼            ▼                ▼               ▼
//! ┌────────┐  ┌────────┐      ┌──────────┐    ┌────────┐
//! │ MySQL  │  │ memory │      │ Postgres │    │ memory │
//! └────────┘  └────────┘      └──────────┘    └────────┘
//! ```

pub mod memory;
pub mod mysql;
pub mod postgres;

pub use memory::{MemoryDestinationStore, MemoryLegacyStore};
pub use mysql::MySqlLegacyStore;
pub use postgres::PgDestinationStore;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::config::LineItemTransfer;
use crate::error::Result;
use crate::models::{
    FailedRecord, JobKind, LegacyExchangeRate, LegacyInvoice, LegacyPreInvoice, LegacyReceipt,
    LegacyRef, LegacyWithholding, MigratedRef, NewExchangeRate, NewInvoice, NewReceipt,
    NewWithholding, PaymentAccountKey, PoolStatus, SubscriptionSummary, SyncWindow,
};

/// Which pre-invoices a run extracts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreInvoiceFilter {
    Voided,
    Paid,
}

/// Which receipts a run extracts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptFilter {
    Voided,
    Processed,
}

/// Extraction bounds shared by every windowed query
#[derive(Debug, Clone, Copy)]
pub struct Extract<'a> {
    pub window: &'a SyncWindow,
    pub row_cap: u32,
    pub transfer: LineItemTransfer,
}

/// Read-only access to the legacy MySQL schema
#[async_trait]
pub trait LegacyStore: Send + Sync {
    /// Rates created strictly after `after`, oldest first
    async fn exchange_rates(
        &self,
        after: NaiveDateTime,
        row_cap: u32,
    ) -> Result<Vec<LegacyExchangeRate>>;

    /// Fiscal invoices updated inside the window, with their line items
    async fn fiscal_invoices(&self, extract: Extract<'_>) -> Result<Vec<LegacyInvoice>>;

    /// Pre-invoices with no fiscal invoice issued, updated inside the window
    async fn pre_invoices(
        &self,
        filter: PreInvoiceFilter,
        extract: Extract<'_>,
    ) -> Result<Vec<LegacyPreInvoice>>;

    /// Withholding vouchers updated inside the window
    async fn withholdings(&self, extract: Extract<'_>) -> Result<Vec<LegacyWithholding>>;

    /// Payment receipts created inside the window
    async fn receipts(
        &self,
        filter: ReceiptFilter,
        extract: Extract<'_>,
    ) -> Result<Vec<LegacyReceipt>>;

    /// Pool snapshot for run logging
    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }
}

/// Everything one cross-reference lookup should translate.
///
/// `None` fields are not looked up and come back as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefRequest {
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub client: Option<String>,
    /// Exchange rate in force at this instant
    pub rate_at: Option<NaiveDateTime>,
    pub payment_account: Option<PaymentAccountKey>,
    /// Idempotency check: the record itself
    pub existing: Option<LegacyRef>,
    /// Parent the record hangs from
    pub parent: Option<LegacyRef>,
}

/// Destination keys found for a [`RefRequest`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRefs {
    pub created_by: Option<i64>,
    pub updated_by: Option<i64>,
    pub client_id: Option<i64>,
    pub exchange_rate: Option<f64>,
    pub payment_account_id: Option<i64>,
    pub existing: Option<MigratedRef>,
    pub parent: Option<MigratedRef>,
}

/// Access to the normalized PostgreSQL schema
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Latest migrated timestamp in the job's scope, `None` when empty
    async fn latest_timestamp(&self, job: JobKind) -> Result<Option<NaiveDateTime>>;

    /// One combined lookup for users, client, rate, account and alternate keys
    async fn resolve_refs(&self, request: &RefRequest) -> Result<ResolvedRefs>;

    /// Find a migrated record by its legacy alternate key
    async fn find_migrated(&self, legacy: &LegacyRef) -> Result<Option<MigratedRef>>;

    async fn subscription(&self, legacy_key: &str) -> Result<Option<SubscriptionSummary>>;

    async fn insert_exchange_rate(&self, rate: &NewExchangeRate) -> Result<()>;

    /// Insert an invoice with its lines; returns the destination id
    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<MigratedRef>;

    async fn insert_withholding(&self, withholding: &NewWithholding) -> Result<MigratedRef>;

    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<MigratedRef>;

    /// Record (or bump) a per-record failure
    async fn record_failure(
        &self,
        job: JobKind,
        legacy_key: &str,
        record_at: NaiveDateTime,
        error: &str,
    ) -> Result<()>;

    /// Earliest and latest `record_at` of the job's tracked failures
    async fn failure_span(&self, job: JobKind) -> Result<Option<(NaiveDateTime, NaiveDateTime)>>;

    /// Forget failures of records that have since been migrated
    async fn clear_failures(&self, job: JobKind, legacy_keys: &[String]) -> Result<()>;

    async fn list_failures(&self, job: Option<JobKind>, limit: u32) -> Result<Vec<FailedRecord>>;

    /// Pool snapshot for run logging
    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }
}
