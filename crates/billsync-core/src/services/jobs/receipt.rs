//! `sinc_recibopago_anulados` / `sinc_recibopago_procesados`: payment receipts
//!
//! Processed receipts are written as `pendiente` together with the invoices
//! they pay, then promoted to `procesado` in the same transaction when at
//! least one allocation was found.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{json, Value};

use super::JobContext;
use crate::error::{RecordError, Result};
use crate::models::{
    AllocatedInvoice, Allocation, JobKind, LegacyReceipt, LegacyRef, Money, NewReceipt,
    PaymentAccountKey, Status, SyncWindow,
};
use crate::services::inserter::RecordOutcome;
use crate::services::orchestrator::SyncJob;
use crate::services::reconcile;
use crate::services::resolver::Resolution;
use crate::store::{ReceiptFilter, RefRequest};
use crate::utils::round_to_8;

pub const DETAIL_SEPARATOR: char = ';';
pub const PAIR_SEPARATOR: char = '|';

pub struct ReceiptJob {
    ctx: JobContext,
    filter: ReceiptFilter,
}

/// `prefact|dollar` pairs of a payment detail; malformed and non-positive
/// pairs are dropped
pub fn allocation_pairs(detail: &str) -> Vec<(String, f64)> {
    detail
        .split(DETAIL_SEPARATOR)
        .filter_map(|item| {
            let (pre_invoice, dollar) = item.split_once(PAIR_SEPARATOR)?;
            if dollar.contains(PAIR_SEPARATOR) {
                return None;
            }
            let dollar = dollar.trim().parse::<f64>().ok()?;
            (dollar.is_finite() && dollar > 0.0).then(|| (pre_invoice.trim().to_string(), dollar))
        })
        .collect()
}

impl ReceiptJob {
    pub fn new(ctx: JobContext, filter: ReceiptFilter) -> Self {
        Self { ctx, filter }
    }

    /// Whole-amount payment of the receipt's own pre-invoice
    fn pays_linked_pre_invoice(&self, receipt: &LegacyReceipt) -> Option<String> {
        if self.filter != ReceiptFilter::Processed {
            return None;
        }
        let detail = receipt.payment_detail.as_deref().unwrap_or_default();
        receipt
            .pre_invoice_id
            .clone()
            .filter(|_| detail.split(DETAIL_SEPARATOR).count() <= 2)
    }

    async fn split_allocations(
        &self,
        receipt: &LegacyReceipt,
    ) -> std::result::Result<Vec<Allocation>, RecordError> {
        let detail = receipt.payment_detail.as_deref().unwrap_or_default();
        let mut allocations = Vec::new();

        for (pre_invoice, dollar) in allocation_pairs(detail) {
            let lookup = LegacyRef::InvoiceForPreInvoice {
                id: pre_invoice.clone(),
            };
            match self
                .ctx
                .write(self.ctx.destination.find_migrated(&lookup))
                .await?
            {
                Some(invoice) => allocations.push(Allocation {
                    amount: reconcile::allocation(dollar, receipt.exchange_rate),
                    invoice: AllocatedInvoice::from(&invoice),
                }),
                None => log::debug!(
                    "[{}] {}: no migrated invoice for pre-invoice {}",
                    self.kind(),
                    receipt.id,
                    pre_invoice
                ),
            }
        }
        Ok(allocations)
    }
}

#[async_trait]
impl SyncJob for ReceiptJob {
    type Record = LegacyReceipt;

    fn kind(&self) -> JobKind {
        match self.filter {
            ReceiptFilter::Voided => JobKind::VoidedReceipt,
            ReceiptFilter::Processed => JobKind::ProcessedReceipt,
        }
    }

    async fn extract(&self, window: &SyncWindow) -> Result<Vec<LegacyReceipt>> {
        self.ctx
            .legacy
            .receipts(self.filter, self.ctx.extract(window))
            .await
    }

    fn record_key(&self, receipt: &LegacyReceipt) -> String {
        receipt.id.clone()
    }

    fn record_timestamp(&self, receipt: &LegacyReceipt) -> NaiveDateTime {
        receipt.created_at
    }

    async fn process(&self, receipt: LegacyReceipt) -> std::result::Result<RecordOutcome, RecordError> {
        let legacy_ref = LegacyRef::Receipt {
            id: receipt.id.clone(),
            created_at: Some(receipt.created_at),
        };
        let account_key = PaymentAccountKey::from_legacy_code(receipt.payment_method_code);
        let linked = self.pays_linked_pre_invoice(&receipt);

        let request = RefRequest {
            created_by: Some(receipt.created_by.clone()),
            updated_by: Some(receipt.updated_by.clone()),
            client: Some(receipt.client_id.clone()),
            payment_account: account_key.clone(),
            existing: Some(legacy_ref.clone()),
            parent: linked
                .clone()
                .map(|id| LegacyRef::InvoiceForPreInvoice { id }),
            ..Default::default()
        };

        let resolved = match self.ctx.resolve(&request).await? {
            Resolution::Proceed(resolved) => resolved,
            Resolution::AlreadyMigrated(_) => return Ok(RecordOutcome::AlreadyMigrated),
            Resolution::ParentMissing => return Ok(RecordOutcome::ParentMissing),
        };
        let created_by = resolved.creator()?;
        let updated_by = resolved.updater()?;
        let client_id = resolved.client()?;
        if account_key.is_none() {
            return Err(RecordError::unresolved(
                "payment method",
                receipt.payment_method_code.to_string(),
            ));
        }
        let payment_account_id = resolved.payment_account()?;
        let amount = reconcile::finite("monto", receipt.amount)?;

        let (status, allocations) = match self.filter {
            ReceiptFilter::Voided => (Status::Anulado, None),
            ReceiptFilter::Processed if linked.is_some() => {
                let allocation = Allocation {
                    amount: Money::new(round_to_8(amount.dollar), round_to_8(amount.bolivar)),
                    invoice: AllocatedInvoice::from(resolved.parent()?),
                };
                (Status::Pendiente, Some(vec![allocation]))
            }
            ReceiptFilter::Processed => {
                (Status::Pendiente, Some(self.split_allocations(&receipt).await?))
            }
        };

        let promote = allocations.as_ref().is_some_and(|a| !a.is_empty());
        let payment_detail = match &allocations {
            Some(a) => serde_json::to_value(a).map_err(|e| RecordError::Reconcile(e.to_string()))?,
            None => Value::String(String::new()),
        };

        let new_receipt = NewReceipt {
            company_id: self.ctx.settings.company_id,
            client_id,
            status,
            promote,
            date: receipt.date,
            reference: receipt.reference.clone(),
            payment_account_id,
            amount,
            exchange_rate: receipt.exchange_rate,
            created_at: receipt.created_at,
            updated_at: receipt.updated_at,
            created_by,
            updated_by,
            info: json!({
                "url_file": receipt.url_file.clone().unwrap_or_default(),
                "recibo_pago_id": receipt.id,
                "recibo_pago_user_id": receipt.user_receipt_id.clone().unwrap_or_default(),
                "payment_detail": payment_detail,
            }),
            legacy_ref,
        };

        // Another run may have written it while allocations were looked up
        if self
            .ctx
            .write(self.ctx.destination.find_migrated(&new_receipt.legacy_ref))
            .await?
            .is_some()
        {
            return Ok(RecordOutcome::AlreadyMigrated);
        }

        self.ctx
            .write(self.ctx.destination.insert_receipt(&new_receipt))
            .await?;
        Ok(RecordOutcome::Inserted)
    }
}
