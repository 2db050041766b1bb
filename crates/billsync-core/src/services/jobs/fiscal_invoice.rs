//! `sinc_factura_fiscal`: fiscal invoices with their line items

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::json;

use super::{customer_info, JobContext, ORIGIN};
use crate::error::{RecordError, Result};
use crate::models::{JobKind, LegacyInvoice, LegacyRef, NewInvoice, SyncWindow};
use crate::services::decoder::{self, Pricing};
use crate::services::inserter::RecordOutcome;
use crate::services::orchestrator::SyncJob;
use crate::services::reconcile;
use crate::services::resolver::Resolution;
use crate::store::RefRequest;

pub struct FiscalInvoiceJob {
    ctx: JobContext,
}

impl FiscalInvoiceJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

fn legacy_refs(invoice: &LegacyInvoice) -> Vec<LegacyRef> {
    let mut refs = vec![LegacyRef::FiscalInvoice {
        id: invoice.id.clone(),
        created_at: Some(invoice.created_at),
    }];
    if let Some(pre_invoice_id) = &invoice.pre_invoice_id {
        refs.push(LegacyRef::InvoiceForPreInvoice {
            id: pre_invoice_id.clone(),
        });
    }
    refs
}

#[async_trait]
impl SyncJob for FiscalInvoiceJob {
    type Record = LegacyInvoice;

    fn kind(&self) -> JobKind {
        JobKind::FiscalInvoice
    }

    async fn extract(&self, window: &SyncWindow) -> Result<Vec<LegacyInvoice>> {
        self.ctx
            .legacy
            .fiscal_invoices(self.ctx.extract(window))
            .await
    }

    fn record_key(&self, invoice: &LegacyInvoice) -> String {
        invoice.id.clone()
    }

    fn record_timestamp(&self, invoice: &LegacyInvoice) -> NaiveDateTime {
        invoice.updated_at
    }

    async fn process(&self, invoice: LegacyInvoice) -> std::result::Result<RecordOutcome, RecordError> {
        let refs = legacy_refs(&invoice);
        let request = RefRequest {
            created_by: Some(invoice.created_by.clone()),
            updated_by: Some(invoice.updated_by.clone()),
            client: Some(invoice.client_id.clone()),
            existing: refs.first().cloned(),
            ..Default::default()
        };

        let resolved = match self.ctx.resolve(&request).await? {
            Resolution::Proceed(resolved) => resolved,
            Resolution::AlreadyMigrated(existing) => {
                log::debug!("[{}] {} already migrated as {}", self.kind(), invoice.id, existing.id);
                return Ok(RecordOutcome::AlreadyMigrated);
            }
            Resolution::ParentMissing => return Ok(RecordOutcome::ParentMissing),
        };
        let created_by = resolved.creator()?;
        let updated_by = resolved.updater()?;
        let client_id = resolved.client()?;

        let amounts = reconcile::dual_leg(&invoice.amounts)?;
        let line_items = decoder::decode(
            &invoice.line_items,
            Pricing::DualLeg,
            self.ctx.destination.as_ref(),
            self.ctx.settings.write_timeout,
        )
        .await?;

        let info = json!({
            "origen": ORIGIN,
            "cliente_info": customer_info(&invoice.customer),
            "fact_oldid": invoice.id,
            "prefact_oldid": invoice.pre_invoice_id,
            "json_maq_fiscal": invoice.fiscal_printer_json.clone().unwrap_or_default(),
            "concepto": invoice.concept.clone().unwrap_or_default(),
        });

        let new_invoice = NewInvoice {
            company_id: self.ctx.settings.company_id,
            client_id,
            control_number: invoice.control_number.clone(),
            number: invoice.number(),
            date: invoice.date,
            kind: invoice.kind(),
            status: invoice.status(),
            credit_days: invoice.credit_days,
            amounts,
            exchange_rate: invoice.exchange_rate,
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
            created_by,
            updated_by,
            info,
            line_items,
            legacy_refs: refs,
        };

        self.ctx
            .write(self.ctx.destination.insert_invoice(&new_invoice))
            .await?;
        Ok(RecordOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceKind, Money, Status};
    use crate::services::jobs::fixtures::{context, invoice, seeded_destination};
    use crate::store::MemoryLegacyStore;
    use std::sync::Arc;

    fn job(dest: Arc<crate::store::MemoryDestinationStore>) -> FiscalInvoiceJob {
        FiscalInvoiceJob::new(context(
            JobKind::FiscalInvoice,
            Arc::new(MemoryLegacyStore::new()),
            dest,
        ))
    }

    #[tokio::test]
    async fn test_inserts_with_dual_leg_lines() {
        let dest = seeded_destination();
        let outcome = job(dest.clone()).process(invoice("7", "70", 5)).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Inserted);

        let written = dest.invoices().pop().unwrap();
        assert_eq!(written.kind, InvoiceKind::FiscalMaquina);
        assert_eq!(written.number, "Z7");
        assert_eq!(written.status, Status::Pagado);
        assert_eq!(written.client_id, 501);
        assert_eq!(written.created_by, 101);
        assert_eq!(written.updated_by, 102);
        assert_eq!(written.line_items[0].unit_price, Money::new(116.0, 4640.0));
        assert_eq!(written.line_items[0].description, "plan 20 megas");
        assert_eq!(written.info["fact_oldid"], "7");
        assert_eq!(written.info["prefact_oldid"], "70");
        assert_eq!(written.info["origen"], "from_scratch");
        assert_eq!(written.info["cliente_info"]["razon_social"], "acme");
        assert_eq!(written.info["json_maq_fiscal"], "{\"z\":1}");
    }

    #[tokio::test]
    async fn test_second_pass_is_already_migrated() {
        let dest = seeded_destination();
        let job = job(dest.clone());
        job.process(invoice("7", "70", 5)).await.unwrap();

        let again = job.process(invoice("7", "70", 5)).await.unwrap();
        assert_eq!(again, RecordOutcome::AlreadyMigrated);
        assert_eq!(dest.invoices().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_client_fails_record() {
        let dest = seeded_destination();
        let mut record = invoice("8", "80", 5);
        record.client_id = "C-404".to_string();

        let result = job(dest.clone()).process(record).await;
        assert_eq!(result, Err(RecordError::unresolved("client", "C-404")));
        assert!(dest.invoices().is_empty());
    }

    #[tokio::test]
    async fn test_bad_line_fails_whole_invoice() {
        let dest = seeded_destination();
        let mut record = invoice("9", "90", 5);
        record.line_items[0].unit_leg2 = "n/a".to_string();

        let result = job(dest.clone()).process(record).await;
        assert!(matches!(result, Err(RecordError::Parse { .. })));
        assert!(dest.invoices().is_empty());
    }
}
