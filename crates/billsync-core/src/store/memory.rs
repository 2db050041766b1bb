//! In-memory stores
//!
//! Fakes of both databases used by the engine tests.
//! Filtering mirrors the SQL implementations; legacy receipts carry no
//! pending amount, so every non-voided receipt counts as settled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};

use super::{
    DestinationStore, Extract, LegacyStore, PreInvoiceFilter, ReceiptFilter, RefRequest,
    ResolvedRefs,
};
use crate::config::LineItemTransfer;
use crate::error::{Error, Result};
use crate::models::{
    FailedRecord, InvoiceKind, JobKind, LegacyExchangeRate, LegacyInvoice, LegacyPreInvoice,
    LegacyReceipt, LegacyRef, LegacyWithholding, MigratedRef, NewExchangeRate, NewInvoice,
    NewReceipt, NewWithholding, PaymentAccountKey, RawLineItem, Status, SubscriptionSummary,
    SyncWindow,
};
use crate::services::decoder;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn in_window(ts: NaiveDateTime, window: &SyncWindow) -> bool {
    ts >= window.start && window.end.map_or(true, |end| ts <= end)
}

// =============================================================================
// Legacy store
// =============================================================================

#[derive(Default)]
struct LegacyState {
    exchange_rates: Vec<LegacyExchangeRate>,
    invoices: Vec<LegacyInvoice>,
    pre_invoices: Vec<LegacyPreInvoice>,
    withholdings: Vec<LegacyWithholding>,
    receipts: Vec<LegacyReceipt>,
    /// Concatenated line-item blobs by parent id
    blobs: HashMap<String, String>,
}

/// In-memory legacy store
#[derive(Default)]
pub struct MemoryLegacyStore {
    state: Mutex<LegacyState>,
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exchange_rate(&self, rate: LegacyExchangeRate) {
        lock(&self.state).exchange_rates.push(rate);
    }

    pub fn add_invoice(&self, invoice: LegacyInvoice) {
        lock(&self.state).invoices.push(invoice);
    }

    pub fn add_pre_invoice(&self, pre_invoice: LegacyPreInvoice) {
        lock(&self.state).pre_invoices.push(pre_invoice);
    }

    pub fn add_withholding(&self, withholding: LegacyWithholding) {
        lock(&self.state).withholdings.push(withholding);
    }

    pub fn add_receipt(&self, receipt: LegacyReceipt) {
        lock(&self.state).receipts.push(receipt);
    }

    /// Blob returned for `parent_id` when extracting in concatenated mode
    pub fn set_line_item_blob(&self, parent_id: &str, blob: &str) {
        lock(&self.state)
            .blobs
            .insert(parent_id.to_string(), blob.to_string());
    }

    fn line_items_for(
        state: &LegacyState,
        parent_id: &str,
        transfer: LineItemTransfer,
        structured: &[RawLineItem],
    ) -> Result<Vec<RawLineItem>> {
        match (transfer, state.blobs.get(parent_id)) {
            (LineItemTransfer::Concatenated, Some(blob)) => {
                decoder::parse_parent_blob(parent_id, Some(blob))
            }
            _ => Ok(structured.to_vec()),
        }
    }
}

#[async_trait]
impl LegacyStore for MemoryLegacyStore {
    async fn exchange_rates(
        &self,
        after: NaiveDateTime,
        row_cap: u32,
    ) -> Result<Vec<LegacyExchangeRate>> {
        let state = lock(&self.state);
        let mut rates: Vec<_> = state
            .exchange_rates
            .iter()
            .filter(|r| r.created_at > after)
            .cloned()
            .collect();
        rates.sort_by_key(|r| r.created_at);
        rates.truncate(row_cap as usize);
        Ok(rates)
    }

    async fn fiscal_invoices(&self, extract: Extract<'_>) -> Result<Vec<LegacyInvoice>> {
        let state = lock(&self.state);
        let mut invoices: Vec<_> = state
            .invoices
            .iter()
            .filter(|i| in_window(i.updated_at, extract.window))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.updated_at);
        invoices.truncate(extract.row_cap as usize);

        for invoice in &mut invoices {
            let key = invoice.pre_invoice_id.clone().unwrap_or_default();
            invoice.line_items =
                Self::line_items_for(&state, &key, extract.transfer, &invoice.line_items)?;
        }
        Ok(invoices)
    }

    async fn pre_invoices(
        &self,
        filter: PreInvoiceFilter,
        extract: Extract<'_>,
    ) -> Result<Vec<LegacyPreInvoice>> {
        let state = lock(&self.state);
        let invoiced: HashSet<&str> = state
            .invoices
            .iter()
            .filter_map(|i| i.pre_invoice_id.as_deref())
            .collect();

        let mut pre_invoices: Vec<_> = state
            .pre_invoices
            .iter()
            .filter(|p| in_window(p.updated_at, extract.window))
            .filter(|p| !invoiced.contains(p.id.to_string().as_str()))
            .filter(|p| p.paid_flag == "0" || p.paid_flag == "1")
            .filter(|p| match filter {
                PreInvoiceFilter::Voided => p.voided,
                PreInvoiceFilter::Paid => !p.voided && p.amount_paid > 0.0,
            })
            .cloned()
            .collect();
        pre_invoices.sort_by_key(|p| p.updated_at);
        pre_invoices.truncate(extract.row_cap as usize);

        for pre_invoice in &mut pre_invoices {
            let key = pre_invoice.id.to_string();
            pre_invoice.line_items =
                Self::line_items_for(&state, &key, extract.transfer, &pre_invoice.line_items)?;
        }
        Ok(pre_invoices)
    }

    async fn withholdings(&self, extract: Extract<'_>) -> Result<Vec<LegacyWithholding>> {
        let state = lock(&self.state);
        let mut rows: Vec<_> = state
            .withholdings
            .iter()
            .filter(|w| in_window(w.updated_at, extract.window))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.updated_at);
        rows.truncate(extract.row_cap as usize);
        Ok(rows)
    }

    async fn receipts(
        &self,
        filter: ReceiptFilter,
        extract: Extract<'_>,
    ) -> Result<Vec<LegacyReceipt>> {
        let state = lock(&self.state);
        let mut rows: Vec<_> = state
            .receipts
            .iter()
            .filter(|r| in_window(r.created_at, extract.window))
            .filter(|r| match filter {
                ReceiptFilter::Voided => r.voided,
                ReceiptFilter::Processed => !r.voided,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(extract.row_cap as usize);
        Ok(rows)
    }
}

// =============================================================================
// Destination store
// =============================================================================

#[derive(Default)]
struct DestinationState {
    users: HashMap<String, i64>,
    clients: HashMap<String, i64>,
    accounts: HashMap<PaymentAccountKey, i64>,
    subscriptions: HashMap<String, SubscriptionSummary>,
    exchange_rates: Vec<NewExchangeRate>,
    invoices: Vec<(MigratedRef, NewInvoice)>,
    withholdings: Vec<(MigratedRef, NewWithholding)>,
    receipts: Vec<(MigratedRef, NewReceipt)>,
    mapping: HashMap<(&'static str, String), MigratedRef>,
    failures: BTreeMap<(String, String), FailedRecord>,
}

/// In-memory destination store.
///
/// Inserts are instrumented: the maximum number of concurrent insert calls is
/// tracked, and an artificial delay or injected failures can be configured.
#[derive(Default)]
pub struct MemoryDestinationStore {
    state: Mutex<DestinationState>,
    fail_keys: Mutex<HashSet<String>>,
    insert_delay: Option<Duration>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when an insert call ends
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every insert call
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    pub fn add_user(&self, legacy_id: &str, id: i64) {
        lock(&self.state).users.insert(legacy_id.to_string(), id);
    }

    pub fn add_client(&self, legacy_id: &str, id: i64) {
        lock(&self.state).clients.insert(legacy_id.to_string(), id);
    }

    pub fn add_payment_account(&self, key: PaymentAccountKey, id: i64) {
        lock(&self.state).accounts.insert(key, id);
    }

    pub fn add_subscription(&self, summary: SubscriptionSummary) {
        lock(&self.state)
            .subscriptions
            .insert(summary.legacy_key.clone(), summary);
    }

    /// Seed a bolivar exchange rate already present in the destination
    pub fn add_exchange_rate(&self, created_at: NaiveDateTime, amount: f64) {
        lock(&self.state).exchange_rates.push(NewExchangeRate {
            company_id: 1,
            currency: "bolivar".to_string(),
            amount,
            created_at,
            created_by: None,
        });
    }

    /// Make every insert carrying `legacy_key` fail
    pub fn fail_on(&self, legacy_key: &str) {
        lock(&self.fail_keys).insert(legacy_key.to_string());
    }

    pub fn clear_fail_on(&self, legacy_key: &str) {
        lock(&self.fail_keys).remove(legacy_key);
    }

    pub fn exchange_rates(&self) -> Vec<NewExchangeRate> {
        lock(&self.state).exchange_rates.clone()
    }

    pub fn invoices(&self) -> Vec<NewInvoice> {
        lock(&self.state)
            .invoices
            .iter()
            .map(|(_, i)| i.clone())
            .collect()
    }

    pub fn withholdings(&self) -> Vec<NewWithholding> {
        lock(&self.state)
            .withholdings
            .iter()
            .map(|(_, w)| w.clone())
            .collect()
    }

    pub fn receipts(&self) -> Vec<NewReceipt> {
        lock(&self.state)
            .receipts
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Highest number of insert calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn begin_insert(&self, legacy_keys: &[&str]) -> Result<InFlight<'_>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }

        let fail_keys = lock(&self.fail_keys);
        if let Some(key) = legacy_keys.iter().find(|k| fail_keys.contains(**k)) {
            return Err(Error::internal(format!("injected failure for {}", key)));
        }
        Ok(guard)
    }

    fn next_ref(&self, created_at: NaiveDateTime) -> MigratedRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        MigratedRef {
            id: id.to_string(),
            created_at,
        }
    }

    fn write_mapping(
        state: &mut DestinationState,
        refs: &[&LegacyRef],
        migrated: &MigratedRef,
    ) -> Result<()> {
        for r in refs {
            let key = (r.mapping_entity(), r.legacy_key().to_string());
            if r.mapping_entity() != "factura_prefactura" && state.mapping.contains_key(&key) {
                return Err(Error::validation(format!(
                    "duplicate {} {}",
                    r.mapping_entity(),
                    r.legacy_key()
                )));
            }
        }
        for r in refs {
            state
                .mapping
                .entry((r.mapping_entity(), r.legacy_key().to_string()))
                .or_insert_with(|| migrated.clone());
        }
        Ok(())
    }

    fn lookup(state: &DestinationState, legacy: &LegacyRef) -> Option<MigratedRef> {
        state
            .mapping
            .get(&(legacy.mapping_entity(), legacy.legacy_key().to_string()))
            .cloned()
    }
}

#[async_trait]
impl DestinationStore for MemoryDestinationStore {
    async fn latest_timestamp(&self, job: JobKind) -> Result<Option<NaiveDateTime>> {
        let state = lock(&self.state);
        let invoice_max = |pred: &dyn Fn(&NewInvoice) -> bool| {
            state
                .invoices
                .iter()
                .filter(|(_, i)| pred(i))
                .map(|(_, i)| i.updated_at)
                .max()
        };
        let receipt_max = |status: Status| {
            state
                .receipts
                .iter()
                .filter(|(_, r)| r.final_status() == status)
                .map(|(_, r)| r.created_at)
                .max()
        };

        let latest = match job {
            JobKind::ExchangeRate => state
                .exchange_rates
                .iter()
                .filter(|r| r.currency == "bolivar")
                .map(|r| r.created_at)
                .max(),
            JobKind::FiscalInvoice => invoice_max(&|i: &NewInvoice| {
                matches!(i.kind, InvoiceKind::FiscalMaquina | InvoiceKind::FiscalTalonario)
            }),
            JobKind::VoidedPreInvoice => {
                invoice_max(&|i: &NewInvoice| {
                    i.kind == InvoiceKind::Nota && i.status == Status::Anulado
                })
            }
            JobKind::PaidPreInvoice => invoice_max(&|i: &NewInvoice| {
                i.kind == InvoiceKind::Nota
                    && matches!(i.status, Status::Pagado | Status::Abonado)
            }),
            JobKind::Withholding => state.withholdings.iter().map(|(_, w)| w.updated_at).max(),
            JobKind::VoidedReceipt => receipt_max(Status::Anulado),
            JobKind::ProcessedReceipt => receipt_max(Status::Procesado),
        };
        Ok(latest)
    }

    async fn resolve_refs(&self, request: &RefRequest) -> Result<ResolvedRefs> {
        let state = lock(&self.state);
        let user = |key: &Option<String>| key.as_ref().and_then(|k| state.users.get(k).copied());

        let exchange_rate = request.rate_at.and_then(|at| {
            state
                .exchange_rates
                .iter()
                .filter(|r| r.currency == "bolivar" && r.created_at <= at)
                .max_by_key(|r| r.created_at)
                .map(|r| r.amount)
        });

        Ok(ResolvedRefs {
            created_by: user(&request.created_by),
            updated_by: user(&request.updated_by),
            client_id: request
                .client
                .as_ref()
                .and_then(|k| state.clients.get(k).copied()),
            exchange_rate,
            payment_account_id: request
                .payment_account
                .as_ref()
                .and_then(|k| state.accounts.get(k).copied()),
            existing: request
                .existing
                .as_ref()
                .and_then(|r| Self::lookup(&state, r)),
            parent: request.parent.as_ref().and_then(|r| Self::lookup(&state, r)),
        })
    }

    async fn find_migrated(&self, legacy: &LegacyRef) -> Result<Option<MigratedRef>> {
        Ok(Self::lookup(&lock(&self.state), legacy))
    }

    async fn subscription(&self, legacy_key: &str) -> Result<Option<SubscriptionSummary>> {
        Ok(lock(&self.state).subscriptions.get(legacy_key).cloned())
    }

    async fn insert_exchange_rate(&self, rate: &NewExchangeRate) -> Result<()> {
        let key = rate.created_at.to_string();
        let _guard = self.begin_insert(&[&key]).await?;
        lock(&self.state).exchange_rates.push(rate.clone());
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<MigratedRef> {
        let keys: Vec<&str> = invoice.legacy_refs.iter().map(|r| r.legacy_key()).collect();
        let _guard = self.begin_insert(&keys).await?;

        let migrated = self.next_ref(invoice.created_at);
        let mut state = lock(&self.state);
        let refs: Vec<&LegacyRef> = invoice.legacy_refs.iter().collect();
        Self::write_mapping(&mut state, &refs, &migrated)?;
        state.invoices.push((migrated.clone(), invoice.clone()));
        Ok(migrated)
    }

    async fn insert_withholding(&self, withholding: &NewWithholding) -> Result<MigratedRef> {
        let _guard = self
            .begin_insert(&[withholding.legacy_ref.legacy_key()])
            .await?;

        let migrated = self.next_ref(withholding.created_at);
        let mut state = lock(&self.state);
        Self::write_mapping(&mut state, &[&withholding.legacy_ref], &migrated)?;
        state.withholdings.push((migrated.clone(), withholding.clone()));
        Ok(migrated)
    }

    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<MigratedRef> {
        let _guard = self.begin_insert(&[receipt.legacy_ref.legacy_key()]).await?;

        let migrated = self.next_ref(receipt.created_at);
        let mut state = lock(&self.state);
        Self::write_mapping(&mut state, &[&receipt.legacy_ref], &migrated)?;
        state.receipts.push((migrated.clone(), receipt.clone()));
        Ok(migrated)
    }

    async fn record_failure(
        &self,
        job: JobKind,
        legacy_key: &str,
        record_at: NaiveDateTime,
        error: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        state
            .failures
            .entry((job.name().to_string(), legacy_key.to_string()))
            .and_modify(|f| {
                f.attempts += 1;
                f.record_at = record_at;
                f.error = error.to_string();
                f.last_failed_at = now;
            })
            .or_insert_with(|| FailedRecord {
                job: job.name().to_string(),
                legacy_key: legacy_key.to_string(),
                record_at,
                error: error.to_string(),
                attempts: 1,
                first_failed_at: now,
                last_failed_at: now,
            });
        Ok(())
    }

    async fn clear_failures(&self, job: JobKind, legacy_keys: &[String]) -> Result<()> {
        let mut state = lock(&self.state);
        for key in legacy_keys {
            state
                .failures
                .remove(&(job.name().to_string(), key.clone()));
        }
        Ok(())
    }

    async fn failure_span(&self, job: JobKind) -> Result<Option<(NaiveDateTime, NaiveDateTime)>> {
        let state = lock(&self.state);
        let stamps = state
            .failures
            .values()
            .filter(|f| f.job == job.name())
            .map(|f| f.record_at);
        let first = stamps.clone().min();
        Ok(first.zip(stamps.max()))
    }

    async fn list_failures(&self, job: Option<JobKind>, limit: u32) -> Result<Vec<FailedRecord>> {
        let state = lock(&self.state);
        let mut rows: Vec<_> = state
            .failures
            .values()
            .filter(|f| job.map_or(true, |j| f.job == j.name()))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
