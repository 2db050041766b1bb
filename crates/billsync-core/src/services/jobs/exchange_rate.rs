//! `sinc_tasa_cambio`: bolivar exchange rates

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::JobContext;
use crate::error::{RecordError, Result};
use crate::models::{JobKind, LegacyExchangeRate, NewExchangeRate, SyncWindow};
use crate::services::inserter::RecordOutcome;
use crate::services::orchestrator::SyncJob;
use crate::services::resolver::Resolution;
use crate::store::RefRequest;

pub const CURRENCY: &str = "bolivar";

pub struct ExchangeRateJob {
    ctx: JobContext,
}

impl ExchangeRateJob {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SyncJob for ExchangeRateJob {
    type Record = LegacyExchangeRate;

    fn kind(&self) -> JobKind {
        JobKind::ExchangeRate
    }

    async fn extract(&self, window: &SyncWindow) -> Result<Vec<LegacyExchangeRate>> {
        self.ctx
            .legacy
            .exchange_rates(window.start, self.ctx.settings.row_cap)
            .await
    }

    fn record_key(&self, rate: &LegacyExchangeRate) -> String {
        rate.created_at.to_string()
    }

    fn record_timestamp(&self, rate: &LegacyExchangeRate) -> NaiveDateTime {
        rate.created_at
    }

    async fn process(&self, rate: LegacyExchangeRate) -> std::result::Result<RecordOutcome, RecordError> {
        let amount = rate.normalized_value();
        if !amount.is_finite() || amount <= 0.0 {
            return Err(RecordError::Reconcile(format!(
                "exchange rate must be positive, got {}",
                rate.value
            )));
        }

        let request = RefRequest {
            created_by: rate.created_by.clone(),
            ..Default::default()
        };
        let created_by = match self.ctx.resolve(&request).await? {
            Resolution::Proceed(refs) => refs.optional_creator(),
            Resolution::AlreadyMigrated(_) => return Ok(RecordOutcome::AlreadyMigrated),
            Resolution::ParentMissing => return Ok(RecordOutcome::ParentMissing),
        };

        let new_rate = NewExchangeRate {
            company_id: self.ctx.settings.company_id,
            currency: CURRENCY.to_string(),
            amount,
            created_at: rate.created_at,
            created_by,
        };
        self.ctx
            .write(self.ctx.destination.insert_exchange_rate(&new_rate))
            .await?;
        Ok(RecordOutcome::Inserted)
    }
}
