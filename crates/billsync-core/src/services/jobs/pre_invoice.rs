//! `sinc_prefactura_anuladas` / `sinc_prefactura_pagadas`: pre-invoices with
//! no fiscal invoice, migrated as `nota` invoices.
//!
//! The legacy row only carries a VAT-inclusive dollar total; the bolivar legs
//! come from the destination rate in force at the pre-invoice's creation.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::json;

use super::{customer_info, JobContext, ORIGIN};
use crate::error::{RecordError, Result};
use crate::models::{InvoiceKind, JobKind, LegacyPreInvoice, LegacyRef, NewInvoice, SyncWindow};
use crate::services::decoder::{self, Pricing};
use crate::services::inserter::RecordOutcome;
use crate::services::orchestrator::SyncJob;
use crate::services::reconcile;
use crate::services::resolver::Resolution;
use crate::store::{PreInvoiceFilter, RefRequest};
use crate::utils::pre_invoice_number;

pub struct PreInvoiceJob {
    ctx: JobContext,
    filter: PreInvoiceFilter,
}

impl PreInvoiceJob {
    pub fn new(ctx: JobContext, filter: PreInvoiceFilter) -> Self {
        Self { ctx, filter }
    }
}

#[async_trait]
impl SyncJob for PreInvoiceJob {
    type Record = LegacyPreInvoice;

    fn kind(&self) -> JobKind {
        match self.filter {
            PreInvoiceFilter::Voided => JobKind::VoidedPreInvoice,
            PreInvoiceFilter::Paid => JobKind::PaidPreInvoice,
        }
    }

    async fn extract(&self, window: &SyncWindow) -> Result<Vec<LegacyPreInvoice>> {
        self.ctx
            .legacy
            .pre_invoices(self.filter, self.ctx.extract(window))
            .await
    }

    fn record_key(&self, pre_invoice: &LegacyPreInvoice) -> String {
        pre_invoice.id.to_string()
    }

    fn record_timestamp(&self, pre_invoice: &LegacyPreInvoice) -> NaiveDateTime {
        pre_invoice.updated_at
    }

    async fn process(
        &self,
        pre_invoice: LegacyPreInvoice,
    ) -> std::result::Result<RecordOutcome, RecordError> {
        let key = pre_invoice.id.to_string();
        let existing = LegacyRef::PreInvoice {
            id: key.clone(),
            created_at: Some(pre_invoice.created_at),
        };
        let request = RefRequest {
            created_by: Some(pre_invoice.created_by.clone()),
            updated_by: Some(pre_invoice.updated_by.clone()),
            client: Some(pre_invoice.client_id.clone()),
            rate_at: Some(pre_invoice.created_at),
            existing: Some(existing.clone()),
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
        let rate = resolved.rate()?;

        let amounts = reconcile::pre_invoice(pre_invoice.total_dollar, rate)?;
        let line_items = decoder::decode(
            &pre_invoice.line_items,
            Pricing::SingleLeg { rate },
            self.ctx.destination.as_ref(),
            self.ctx.settings.write_timeout,
        )
        .await?;

        let info = json!({
            "origen": ORIGIN,
            "cliente_info": customer_info(&pre_invoice.customer),
            "prefact_oldid": pre_invoice.id,
            "concepto": pre_invoice.concept,
        });

        let new_invoice = NewInvoice {
            company_id: self.ctx.settings.company_id,
            client_id,
            control_number: String::new(),
            number: pre_invoice_number(pre_invoice.created_at, &pre_invoice.client_id, pre_invoice.id),
            date: pre_invoice.date,
            kind: InvoiceKind::Nota,
            status: pre_invoice.status(),
            credit_days: 0,
            amounts,
            exchange_rate: rate,
            created_at: pre_invoice.created_at,
            updated_at: pre_invoice.updated_at,
            created_by,
            updated_by,
            info,
            line_items,
            legacy_refs: vec![existing, LegacyRef::InvoiceForPreInvoice { id: key }],
        };

        self.ctx
            .write(self.ctx.destination.insert_invoice(&new_invoice))
            .await?;
        Ok(RecordOutcome::Inserted)
    }
}
