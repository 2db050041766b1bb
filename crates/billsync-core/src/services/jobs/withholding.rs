//! `sinc_retenciones`: withholding tax vouchers, attached to their migrated
//! fiscal invoice

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::json;

use super::JobContext;
use crate::error::{RecordError, Result};
use crate::models::{JobKind, LegacyRef, LegacyWithholding, NewWithholding, SyncWindow};
use crate::services::inserter::RecordOutcome;
use crate::services::orchestrator::SyncJob;
use crate::services::reconcile;
use crate::services::resolver::Resolution;
use crate::store::RefRequest;

pub struct WithholdingJob {
    ctx: JobContext,
}

impl WithholdingJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SyncJob for WithholdingJob {
    type Record = LegacyWithholding;

    fn kind(&self) -> JobKind {
        JobKind::Withholding
    }

    async fn extract(&self, window: &SyncWindow) -> Result<Vec<LegacyWithholding>> {
        self.ctx.legacy.withholdings(self.ctx.extract(window)).await
    }

    fn record_key(&self, withholding: &LegacyWithholding) -> String {
        withholding.id.clone()
    }

    fn record_timestamp(&self, withholding: &LegacyWithholding) -> NaiveDateTime {
        withholding.updated_at
    }

    async fn process(
        &self,
        withholding: LegacyWithholding,
    ) -> std::result::Result<RecordOutcome, RecordError> {
        let legacy_ref = LegacyRef::Withholding {
            id: withholding.id.clone(),
            created_at: Some(withholding.created_at),
        };
        let request = RefRequest {
            created_by: Some(withholding.created_by.clone()),
            updated_by: Some(withholding.updated_by.clone()),
            existing: Some(legacy_ref.clone()),
            parent: Some(LegacyRef::FiscalInvoice {
                id: withholding.invoice_id.clone(),
                created_at: withholding.invoice_created_at,
            }),
            ..Default::default()
        };

        let resolved = match self.ctx.resolve(&request).await? {
            Resolution::Proceed(resolved) => resolved,
            Resolution::AlreadyMigrated(_) => return Ok(RecordOutcome::AlreadyMigrated),
            Resolution::ParentMissing => {
                log::debug!(
                    "[{}] {} waits for invoice {}",
                    self.kind(),
                    withholding.id,
                    withholding.invoice_id
                );
                return Ok(RecordOutcome::ParentMissing);
            }
        };
        let created_by = resolved.creator()?;
        let updated_by = resolved.updater()?;
        let invoice = resolved.parent()?.clone();

        let amounts = reconcile::withholding(
            withholding.kind(),
            withholding.amount_bolivar,
            withholding.base_bolivar,
            withholding.vat_bolivar,
            withholding.invoice_rate,
        )?;

        let new_withholding = NewWithholding {
            company_id: self.ctx.settings.company_id,
            invoice,
            kind: withholding.kind(),
            withheld: amounts.withheld,
            base: amounts.base,
            pct: amounts.pct,
            date: withholding.date,
            voucher: withholding.voucher.clone(),
            status: withholding.status(),
            created_at: withholding.created_at,
            updated_at: withholding.updated_at,
            created_by,
            updated_by,
            info: json!({
                "oldid": withholding.id,
                "descripcion": withholding.description.clone().unwrap_or_default(),
                "url_file": withholding.url_file.clone().unwrap_or_default(),
            }),
            legacy_ref,
        };

        self.ctx
            .write(self.ctx.destination.insert_withholding(&new_withholding))
            .await?;
        Ok(RecordOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Status, WithholdingKind};
    use crate::services::jobs::fiscal_invoice::FiscalInvoiceJob;
    use crate::services::jobs::fixtures::{at, context, invoice, seeded_destination};
    use crate::store::{MemoryDestinationStore, MemoryLegacyStore};
    use std::sync::Arc;

    fn voucher(id: &str, invoice_id: &str) -> LegacyWithholding {
        LegacyWithholding {
            id: id.to_string(),
            invoice_id: invoice_id.to_string(),
            invoice_created_at: Some(at(5, 9)),
            invoice_rate: 40.0,
            date: at(6, 0).date(),
            voucher: "2024030001".to_string(),
            url_file: None,
            description: Some("retencion iva".to_string()),
            kind_code: 3,
            voided: false,
            amount_bolivar: 480.0,
            base_bolivar: 4000.0,
            vat_bolivar: 640.0,
            created_at: at(6, 8),
            updated_at: at(6, 8),
            created_by: "1".to_string(),
            updated_by: "1".to_string(),
        }
    }

    fn job(dest: Arc<MemoryDestinationStore>) -> WithholdingJob {
        WithholdingJob::new(context(
            JobKind::Withholding,
            Arc::new(MemoryLegacyStore::new()),
            dest,
        ))
    }

    #[tokio::test]
    async fn test_parent_missing_then_eligible() {
        let dest = seeded_destination();
        let withholdings = job(dest.clone());

        let first = withholdings.process(voucher("3", "7")).await.unwrap();
        assert_eq!(first, RecordOutcome::ParentMissing);
        assert!(dest.withholdings().is_empty());

        let invoices = FiscalInvoiceJob::new(context(
            JobKind::FiscalInvoice,
            Arc::new(MemoryLegacyStore::new()),
            dest.clone(),
        ));
        invoices.process(invoice("7", "70", 5)).await.unwrap();

        let second = withholdings.process(voucher("3", "7")).await.unwrap();
        assert_eq!(second, RecordOutcome::Inserted);

        let written = dest.withholdings().pop().unwrap();
        assert_eq!(written.kind, WithholdingKind::Iva);
        assert_eq!(written.status, Status::Procesado);
        assert_eq!(written.pct, 75.0);
        assert!((written.base.bolivar - 640.0).abs() < 1e-9);
        assert!((written.withheld.dollar - 12.0).abs() < 1e-9);
        assert_eq!(written.info["oldid"], "3");
        assert_eq!(written.info["url_file"], "");
    }

    #[tokio::test]
    async fn test_zero_base_fails_record() {
        let dest = seeded_destination();
        FiscalInvoiceJob::new(context(
            JobKind::FiscalInvoice,
            Arc::new(MemoryLegacyStore::new()),
            dest.clone(),
        ))
        .process(invoice("7", "70", 5))
        .await
        .unwrap();

        let mut record = voucher("4", "7");
        record.vat_bolivar = 0.0;
        let result = job(dest).process(record).await;
        assert!(matches!(result, Err(RecordError::Reconcile(_))));
    }
}
