//! Data models for the billsync engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

// =============================================================================
// Jobs
// =============================================================================

/// One sync job: an entity type plus its variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExchangeRate,
    FiscalInvoice,
    VoidedPreInvoice,
    PaidPreInvoice,
    Withholding,
    VoidedReceipt,
    ProcessedReceipt,
}

impl JobKind {
    /// Every job, in scheduling order
    pub const ALL: [JobKind; 7] = [
        JobKind::ExchangeRate,
        JobKind::FiscalInvoice,
        JobKind::VoidedPreInvoice,
        JobKind::PaidPreInvoice,
        JobKind::Withholding,
        JobKind::VoidedReceipt,
        JobKind::ProcessedReceipt,
    ];

    /// Task name used by the schedule file and the CLI
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::ExchangeRate => "sinc_tasa_cambio",
            JobKind::FiscalInvoice => "sinc_factura_fiscal",
            JobKind::VoidedPreInvoice => "sinc_prefactura_anuladas",
            JobKind::PaidPreInvoice => "sinc_prefactura_pagadas",
            JobKind::Withholding => "sinc_retenciones",
            JobKind::VoidedReceipt => "sinc_recibopago_anulados",
            JobKind::ProcessedReceipt => "sinc_recibopago_procesados",
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            JobKind::ExchangeRate => "exchange rates",
            JobKind::FiscalInvoice => "fiscal invoices",
            JobKind::VoidedPreInvoice => "voided pre-invoices",
            JobKind::PaidPreInvoice => "paid and partially paid pre-invoices",
            JobKind::Withholding => "withholding tax vouchers",
            JobKind::VoidedReceipt => "voided payment receipts",
            JobKind::ProcessedReceipt => "processed payment receipts",
        }
    }

    /// Whether extraction is bounded by a window end
    pub fn is_windowed(&self) -> bool {
        !matches!(self, JobKind::ExchangeRate)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| Error::not_found(format!("unknown job: {}", s)))
    }
}

/// Who triggered a run. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Caller {
    #[serde(rename = "cronJob")]
    Scheduler,
    #[serde(rename = "restApi")]
    OnDemand,
}

impl Caller {
    pub fn as_str(&self) -> &'static str {
        match self {
            Caller::Scheduler => "cronJob",
            Caller::OnDemand => "restApi",
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Money and statuses
// =============================================================================

/// A dual-currency amount
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Money {
    #[serde(rename = "dolar")]
    pub dollar: f64,
    pub bolivar: f64,
}

impl Money {
    pub const ZERO: Money = Money {
        dollar: 0.0,
        bolivar: 0.0,
    };

    pub fn new(dollar: f64, bolivar: f64) -> Self {
        Self { dollar, bolivar }
    }

    /// `[dollar, bolivar]`, the array shape the destination procedures take
    pub fn to_array(&self) -> Vec<f64> {
        vec![self.dollar, self.bolivar]
    }

    pub fn is_finite(&self) -> bool {
        self.dollar.is_finite() && self.bolivar.is_finite()
    }
}

/// Destination record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pendiente,
    Abonado,
    Pagado,
    Anulado,
    Procesado,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pendiente => "pendiente",
            Status::Abonado => "abonado",
            Status::Pagado => "pagado",
            Status::Anulado => "anulado",
            Status::Procesado => "procesado",
        }
    }

    /// Map legacy invoice flags. `paid_flag` is the legacy `'0'`/`'1'` column.
    pub fn from_invoice_flags(voided: bool, paid_flag: &str, amount_paid: f64) -> Self {
        if voided {
            Status::Anulado
        } else if paid_flag == "1" {
            Status::Pagado
        } else if paid_flag == "0" && amount_paid == 0.0 {
            Status::Pendiente
        } else {
            Status::Abonado
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination invoice type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    FiscalMaquina,
    FiscalTalonario,
    Nota,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::FiscalMaquina => "fiscal_maquina",
            InvoiceKind::FiscalTalonario => "fiscal_talonario",
            InvoiceKind::Nota => "nota",
        }
    }
}

/// Withholding tax type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithholdingKind {
    Islr,
    Im,
    Iva,
}

impl WithholdingKind {
    pub fn from_legacy(code: i32) -> Self {
        match code {
            1 => WithholdingKind::Islr,
            2 => WithholdingKind::Im,
            _ => WithholdingKind::Iva,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithholdingKind::Islr => "islr",
            WithholdingKind::Im => "im",
            WithholdingKind::Iva => "iva",
        }
    }
}

// =============================================================================
// Shared snapshots
// =============================================================================

/// Denormalized customer data kept in invoice metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub razon_social: Option<String>,
    pub docid: Option<String>,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
}

/// Short subscription info embedded in line items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub id: i64,
    /// Legacy subscription key
    #[serde(rename = "ncontrol")]
    pub legacy_key: String,
    pub zona: String,
    pub tipo_conexion: String,
    pub tipo_servicio: String,
    pub speed_value: f64,
    pub speed_unit: String,
}

// =============================================================================
// Line items
// =============================================================================

/// A line item as transferred from the legacy store, numeric legs unparsed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawLineItem {
    pub child_id: String,
    pub parent_id: String,
    pub subscription_key: Option<String>,
    pub quantity: String,
    pub unit_leg1: String,
    pub total_leg1: String,
    pub unit_leg2: String,
    pub total_leg2: String,
    pub description: String,
}

/// A decoded line item
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub child_id: String,
    pub parent_id: String,
    pub quantity: f64,
    pub unit_price: Money,
    pub total_price: Money,
    pub description: String,
    pub subscription: Option<SubscriptionSummary>,
}

impl LineItem {
    pub const TAX_STATUS: &'static str = "gravable";

    /// Payload shape accepted by `venta.insert_factura`
    pub fn to_payload(&self) -> Value {
        json!({
            "tax_status": Self::TAX_STATUS,
            "qty": self.quantity,
            "price_unit": format!("{:.8},{:.8}", self.unit_price.dollar, self.unit_price.bolivar),
            "price_tot": format!("{:.8},{:.8}", self.total_price.dollar, self.total_price.bolivar),
            "info": {
                "oldid": self.child_id,
                "prefact_oldid": self.parent_id,
                "concepto": self.description,
                "suscripcion": self.subscription,
            },
        })
    }
}

// =============================================================================
// Legacy records
// =============================================================================

/// Monetary fields of an invoice
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InvoiceAmounts {
    pub subtotal: Money,
    pub discount_pct: f64,
    pub discount: Money,
    pub base: Money,
    pub vat_pct: f64,
    pub vat: Money,
    pub igtf_pct: f64,
    pub igtf_base: Money,
    pub igtf: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyExchangeRate {
    /// Raw legacy value, possibly stored scaled by 1 000 000
    pub value: f64,
    pub created_at: NaiveDateTime,
    pub created_by: Option<String>,
}

impl LegacyExchangeRate {
    /// Legacy rows above 1000 were stored multiplied by 1 000 000
    pub fn normalized_value(&self) -> f64 {
        if self.value > 1000.0 {
            self.value / 1_000_000.0
        } else {
            self.value
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyInvoice {
    pub id: String,
    pub pre_invoice_id: Option<String>,
    pub client_id: String,
    pub control_number: String,
    pub date: NaiveDate,
    pub credit_days: i32,
    pub amounts: InvoiceAmounts,
    pub exchange_rate: f64,
    pub fiscal_number: Option<String>,
    pub booklet_number: String,
    pub voided: bool,
    pub paid_flag: String,
    pub amount_paid: f64,
    pub fiscal_printer_json: Option<String>,
    pub concept: Option<String>,
    pub customer: CustomerSnapshot,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: String,
    pub updated_by: String,
    pub line_items: Vec<RawLineItem>,
}

impl LegacyInvoice {
    fn printer_number(&self) -> Option<&str> {
        self.fiscal_number
            .as_deref()
            .filter(|n| n.chars().count() > 1)
    }

    pub fn kind(&self) -> InvoiceKind {
        if self.printer_number().is_some() {
            InvoiceKind::FiscalMaquina
        } else {
            InvoiceKind::FiscalTalonario
        }
    }

    /// Fiscal printer number when present, booklet number otherwise
    pub fn number(&self) -> String {
        self.printer_number()
            .unwrap_or(&self.booklet_number)
            .to_string()
    }

    pub fn status(&self) -> Status {
        Status::from_invoice_flags(self.voided, &self.paid_flag, self.amount_paid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyPreInvoice {
    pub id: i64,
    pub client_id: String,
    pub date: NaiveDate,
    /// VAT-inclusive dollar total, the only currency the legacy row carries
    pub total_dollar: f64,
    pub concept: String,
    pub voided: bool,
    pub paid_flag: String,
    pub amount_paid: f64,
    pub customer: CustomerSnapshot,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: String,
    pub updated_by: String,
    pub line_items: Vec<RawLineItem>,
}

impl LegacyPreInvoice {
    pub fn status(&self) -> Status {
        Status::from_invoice_flags(self.voided, &self.paid_flag, self.amount_paid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyWithholding {
    pub id: String,
    pub invoice_id: String,
    /// `None` when the legacy invoice row is gone
    pub invoice_created_at: Option<NaiveDateTime>,
    pub invoice_rate: f64,
    pub date: NaiveDate,
    pub voucher: String,
    pub url_file: Option<String>,
    pub description: Option<String>,
    pub kind_code: i32,
    pub voided: bool,
    pub amount_bolivar: f64,
    pub base_bolivar: f64,
    pub vat_bolivar: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: String,
    pub updated_by: String,
}

impl LegacyWithholding {
    pub fn kind(&self) -> WithholdingKind {
        WithholdingKind::from_legacy(self.kind_code)
    }

    pub fn status(&self) -> Status {
        if self.voided {
            Status::Anulado
        } else {
            Status::Procesado
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyReceipt {
    pub id: String,
    pub user_receipt_id: Option<String>,
    pub client_id: String,
    pub voided: bool,
    pub date: NaiveDate,
    pub reference: Option<String>,
    pub payment_method_code: i32,
    pub amount: Money,
    pub exchange_rate: f64,
    /// Either `;`-separated `prefact|dollar` pairs or a bare pre-invoice id
    pub payment_detail: Option<String>,
    pub url_file: Option<String>,
    pub pre_invoice_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: String,
    pub updated_by: String,
}

// =============================================================================
// Payment accounts
// =============================================================================

/// Legacy payment-method codes, as `bank_currency_method_webname`
const PAYMENT_METHODS: [&str; 23] = [
    "besser_bolivar_efectivo_efectivo",
    "besser_dolar_efectivo_efectivo",
    "banesco_bolivar_transferencia_banesco",
    "bank of america_dolar_divisa_transferencia bofa",
    "bnc inter_dolar_divisa_transferencia bnc inter",
    "bank of america_dolar_divisa_zelle",
    "airtm_dolar_divisa_airtm",
    "bod_bolivar_transferencia_bod",
    "banesco_bolivar_pago.movil_banesco",
    "mercantil_bolivar_punto.venta_mercantil",
    "mercantil_bolivar_transferencia_mercantil",
    "mercantil_bolivar_pago.movil_mercantil",
    "venezuela_bolivar_biopago_biopago",
    "banesco_bolivar_punto.venta_banesco",
    "exterior_bolivar_transferencia_exterior",
    "exterior_bolivar_pago.movil_exterior",
    "exterior_bolivar_punto.venta_exterior",
    "banplus_bolivar_transferencia_banplus",
    "banplus_bolivar_pago.movil_banplus",
    "banplus_bolivar_punto.venta_banplus",
    "bancaribe_bolivar_transferencia_bancaribe",
    "bancaribe_bolivar_pago.movil_bancaribe",
    "venezuela_bolivar_transferencia_venezuela",
];

/// Natural key of a destination bank account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentAccountKey {
    pub bank: String,
    pub currency: String,
    pub method: String,
    pub web_name: String,
}

impl PaymentAccountKey {
    pub fn new(bank: &str, currency: &str, method: &str, web_name: &str) -> Self {
        Self {
            bank: bank.to_string(),
            currency: currency.to_string(),
            method: method.to_string(),
            web_name: web_name.to_string(),
        }
    }

    /// Translate a legacy `forma_pago` code
    pub fn from_legacy_code(code: i32) -> Option<Self> {
        let entry = PAYMENT_METHODS.get(usize::try_from(code).ok()?)?;
        let parts: Vec<&str> = entry.split('_').collect();
        match parts.as_slice() {
            [bank, currency, method, web_name] => Some(Self::new(
                bank,
                currency,
                &method.replace('.', "_"),
                web_name,
            )),
            _ => None,
        }
    }
}

// =============================================================================
// Destination references
// =============================================================================

/// A legacy alternate key pointing at a destination record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyRef {
    FiscalInvoice {
        id: String,
        created_at: Option<NaiveDateTime>,
    },
    PreInvoice {
        id: String,
        created_at: Option<NaiveDateTime>,
    },
    /// Any migrated invoice (fiscal or note) carrying this pre-invoice id
    InvoiceForPreInvoice { id: String },
    Withholding {
        id: String,
        created_at: Option<NaiveDateTime>,
    },
    Receipt {
        id: String,
        created_at: Option<NaiveDateTime>,
    },
}

impl LegacyRef {
    /// `entity` column value in `sync.legacy_mapping`
    pub fn mapping_entity(&self) -> &'static str {
        match self {
            LegacyRef::FiscalInvoice { .. } => "factura_fiscal",
            LegacyRef::PreInvoice { .. } => "prefactura",
            LegacyRef::InvoiceForPreInvoice { .. } => "factura_prefactura",
            LegacyRef::Withholding { .. } => "retencion",
            LegacyRef::Receipt { .. } => "recibo_pago",
        }
    }

    pub fn legacy_key(&self) -> &str {
        match self {
            LegacyRef::FiscalInvoice { id, .. }
            | LegacyRef::PreInvoice { id, .. }
            | LegacyRef::InvoiceForPreInvoice { id }
            | LegacyRef::Withholding { id, .. }
            | LegacyRef::Receipt { id, .. } => id,
        }
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        match self {
            LegacyRef::FiscalInvoice { created_at, .. }
            | LegacyRef::PreInvoice { created_at, .. }
            | LegacyRef::Withholding { created_at, .. }
            | LegacyRef::Receipt { created_at, .. } => *created_at,
            LegacyRef::InvoiceForPreInvoice { .. } => None,
        }
    }
}

/// Primary key of a migrated destination record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedRef {
    pub id: String,
    pub created_at: NaiveDateTime,
}

// =============================================================================
// Reconciled records
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NewExchangeRate {
    pub company_id: i32,
    pub currency: String,
    pub amount: f64,
    pub created_at: NaiveDateTime,
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice {
    pub company_id: i32,
    pub client_id: i64,
    pub control_number: String,
    pub number: String,
    pub date: NaiveDate,
    pub kind: InvoiceKind,
    pub status: Status,
    pub credit_days: i32,
    pub amounts: InvoiceAmounts,
    pub exchange_rate: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: i64,
    pub updated_by: i64,
    pub info: Value,
    pub line_items: Vec<LineItem>,
    /// Mapping rows written with the insert
    pub legacy_refs: Vec<LegacyRef>,
}

impl NewInvoice {
    pub fn line_items_payload(&self) -> Value {
        Value::Array(self.line_items.iter().map(LineItem::to_payload).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWithholding {
    pub company_id: i32,
    pub invoice: MigratedRef,
    pub kind: WithholdingKind,
    pub withheld: Money,
    pub base: Money,
    pub pct: f64,
    pub date: NaiveDate,
    pub voucher: String,
    pub status: Status,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: i64,
    pub updated_by: i64,
    pub info: Value,
    pub legacy_ref: LegacyRef,
}

/// Part of a receipt applied to one invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    #[serde(rename = "monto")]
    pub amount: Money,
    #[serde(rename = "factura")]
    pub invoice: AllocatedInvoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedInvoice {
    pub id: String,
    pub created_at: String,
}

impl From<&MigratedRef> for AllocatedInvoice {
    fn from(r: &MigratedRef) -> Self {
        Self {
            id: r.id.clone(),
            created_at: r.created_at.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReceipt {
    pub company_id: i32,
    pub client_id: i64,
    /// Status written by the insert
    pub status: Status,
    /// Promote to `procesado` inside the same transaction
    pub promote: bool,
    pub date: NaiveDate,
    pub reference: Option<String>,
    pub payment_account_id: i64,
    pub amount: Money,
    pub exchange_rate: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub created_by: i64,
    pub updated_by: i64,
    pub info: Value,
    pub legacy_ref: LegacyRef,
}

impl NewReceipt {
    /// Status the row ends up with after the insert transaction
    pub fn final_status(&self) -> Status {
        if self.promote {
            Status::Procesado
        } else {
            self.status
        }
    }
}

// =============================================================================
// Runs
// =============================================================================

/// Extraction window for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub job: JobKind,
    pub start: NaiveDateTime,
    /// `None` means strictly-after-start extraction with no upper bound
    pub end: Option<NaiveDateTime>,
    /// Whether `start` came from migrated data rather than a backfill start
    pub from_watermark: bool,
}

/// One record that failed during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub legacy_key: String,
    pub error: String,
}

/// Summary of one job run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub job: JobKind,
    pub caller: Caller,
    pub window: SyncWindow,
    pub extracted: usize,
    pub inserted: usize,
    pub already_migrated: usize,
    pub parent_missing: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Not attempted because an earlier record of the ordered batch failed
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub failures: Vec<RecordFailure>,
}

/// Row of `sync.failed_record`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedRecord {
    pub job: String,
    pub legacy_key: String,
    /// Legacy timestamp the job's window filters on
    pub record_at: NaiveDateTime,
    pub error: String,
    pub attempts: i32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// Connection pool snapshot for begin/end logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size={} idle={}", self.size, self.idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Jobs
    // ========================================================================

    #[test]
    fn test_job_names_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.name().parse::<JobKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_job_name() {
        assert!("clean_old_sessions".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_only_exchange_rate_is_unbounded() {
        assert!(!JobKind::ExchangeRate.is_windowed());
        assert!(JobKind::ALL[1..].iter().all(|k| k.is_windowed()));
    }

    #[test]
    fn test_caller_tags() {
        assert_eq!(Caller::Scheduler.as_str(), "cronJob");
        assert_eq!(Caller::OnDemand.to_string(), "restApi");
    }

    // ========================================================================
    // Statuses and kinds
    // ========================================================================

    #[test]
    fn test_invoice_status_mapping() {
        assert_eq!(Status::from_invoice_flags(true, "1", 10.0), Status::Anulado);
        assert_eq!(Status::from_invoice_flags(false, "1", 10.0), Status::Pagado);
        assert_eq!(Status::from_invoice_flags(false, "0", 0.0), Status::Pendiente);
        assert_eq!(Status::from_invoice_flags(false, "0", 5.0), Status::Abonado);
    }

    #[test]
    fn test_withholding_kind_mapping() {
        assert_eq!(WithholdingKind::from_legacy(1), WithholdingKind::Islr);
        assert_eq!(WithholdingKind::from_legacy(2), WithholdingKind::Im);
        assert_eq!(WithholdingKind::from_legacy(3), WithholdingKind::Iva);
        assert_eq!(WithholdingKind::from_legacy(0), WithholdingKind::Iva);
    }

    #[test]
    fn test_exchange_rate_normalization() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let scaled = LegacyExchangeRate {
            value: 4_000_000.0,
            created_at: at,
            created_by: None,
        };
        assert_eq!(scaled.normalized_value(), 4.0);

        let plain = LegacyExchangeRate { value: 36.5, ..scaled };
        assert_eq!(plain.normalized_value(), 36.5);
    }

    #[test]
    fn test_money_serializes_with_legacy_names() {
        let value = serde_json::to_value(Money::new(1.5, 60.0)).unwrap();
        assert_eq!(value, json!({"dolar": 1.5, "bolivar": 60.0}));
        assert_eq!(Money::new(1.5, 60.0).to_array(), vec![1.5, 60.0]);
    }

    // ========================================================================
    // Payment accounts
    // ========================================================================

    #[test]
    fn test_payment_method_codes() {
        let cash = PaymentAccountKey::from_legacy_code(0).unwrap();
        assert_eq!(
            cash,
            PaymentAccountKey::new("besser", "bolivar", "efectivo", "efectivo")
        );

        let mobile = PaymentAccountKey::from_legacy_code(8).unwrap();
        assert_eq!(mobile.method, "pago_movil");
        assert_eq!(mobile.web_name, "banesco");

        let zelle = PaymentAccountKey::from_legacy_code(5).unwrap();
        assert_eq!(zelle.bank, "bank of america");
        assert_eq!(zelle.currency, "dolar");
    }

    #[test]
    fn test_unknown_payment_method_codes() {
        assert!(PaymentAccountKey::from_legacy_code(23).is_none());
        assert!(PaymentAccountKey::from_legacy_code(-1).is_none());
    }

    // ========================================================================
    // Line items
    // ========================================================================

    #[test]
    fn test_line_item_payload_shape() {
        let item = LineItem {
            child_id: "10".to_string(),
            parent_id: "7".to_string(),
            quantity: 2.0,
            unit_price: Money::new(50.0, 2000.0),
            total_price: Money::new(100.0, 4000.0),
            description: "plan 20mbps".to_string(),
            subscription: None,
        };
        let payload = item.to_payload();
        assert_eq!(payload["tax_status"], "gravable");
        assert_eq!(payload["price_unit"], "50.00000000,2000.00000000");
        assert_eq!(payload["price_tot"], "100.00000000,4000.00000000");
        assert_eq!(payload["info"]["oldid"], "10");
        assert_eq!(payload["info"]["prefact_oldid"], "7");
        assert!(payload["info"]["suscripcion"].is_null());
    }

    #[test]
    fn test_fiscal_invoice_kind_and_number() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let mut invoice = LegacyInvoice {
            id: "1".to_string(),
            pre_invoice_id: None,
            client_id: "5".to_string(),
            control_number: "00-1".to_string(),
            date: at.date(),
            credit_days: 0,
            amounts: InvoiceAmounts::default(),
            exchange_rate: 36.0,
            fiscal_number: Some("Z1234".to_string()),
            booklet_number: "B-9".to_string(),
            voided: false,
            paid_flag: "1".to_string(),
            amount_paid: 0.0,
            fiscal_printer_json: None,
            concept: None,
            customer: CustomerSnapshot::default(),
            created_at: at,
            updated_at: at,
            created_by: "1".to_string(),
            updated_by: "1".to_string(),
            line_items: vec![],
        };
        assert_eq!(invoice.kind(), InvoiceKind::FiscalMaquina);
        assert_eq!(invoice.number(), "Z1234");

        invoice.fiscal_number = Some("0".to_string());
        assert_eq!(invoice.kind(), InvoiceKind::FiscalTalonario);
        assert_eq!(invoice.number(), "B-9");
    }
}
