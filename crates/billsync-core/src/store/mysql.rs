//! Legacy store over the MySQL billing schema
//!
//! Every value is cast to a column type sqlx decodes without extra features
//! (`DOUBLE`, `CHAR`, `SIGNED`, `DATE`, `DATETIME`). Flags come back raw and
//! are mapped by the models. `CAST(.. AS DOUBLE)` needs MySQL 8.0.17+.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{MySql, MySqlPool, QueryBuilder};

use super::{Extract, LegacyStore, PreInvoiceFilter, ReceiptFilter};
use crate::config::LineItemTransfer;
use crate::error::Result;
use crate::models::{
    CustomerSnapshot, InvoiceAmounts, LegacyExchangeRate, LegacyInvoice, LegacyPreInvoice,
    LegacyReceipt, LegacyWithholding, Money, PoolStatus, RawLineItem, SyncWindow,
};
use crate::services::decoder::{self, ENTRY_SEPARATOR, FIELD_SEPARATOR};

/// `CAST(COALESCE(expr, 0) AS DOUBLE)`
fn dbl(expr: &str) -> String {
    format!("CAST(COALESCE({}, 0) AS DOUBLE)", expr)
}

/// Correlated `GROUP_CONCAT` of the line items of `parent`
fn line_item_blob(parent: &str, bolivar_default: &str) -> String {
    let fields = [
        "pfd.id".to_string(),
        "pfd.pre_factura_id".to_string(),
        "COALESCE(pfd.contrato_det_id, '')".to_string(),
        "COALESCE(pfd.qty, '')".to_string(),
        "COALESCE(CAST(pfd.price_unit AS DECIMAL(20,8)), '')".to_string(),
        "COALESCE(CAST(pfd.price_tot AS DECIMAL(20,8)), '')".to_string(),
        format!(
            "COALESCE(CAST(pfd.price_unit_bs AS DECIMAL(20,8)), {})",
            bolivar_default
        ),
        format!(
            "COALESCE(CAST(pfd.price_tot_bs AS DECIMAL(20,8)), {})",
            bolivar_default
        ),
        "LOWER(COALESCE(pfd.descripcion, ''))".to_string(),
    ];
    format!(
        "(SELECT GROUP_CONCAT(CONCAT({}) ORDER BY pfd.id ASC SEPARATOR '{}') \
         FROM pre_factura_det AS pfd WHERE pfd.pre_factura_id = {})",
        fields.join(&format!(", '{}', ", FIELD_SEPARATOR)),
        ENTRY_SEPARATOR,
        parent
    )
}

/// Line-item column of a parent query for the configured transfer
fn line_items_column(transfer: LineItemTransfer, parent: &str, bolivar_default: &str) -> String {
    match transfer {
        LineItemTransfer::Concatenated => {
            format!("{} AS line_items", line_item_blob(parent, bolivar_default))
        }
        LineItemTransfer::Structured => "CAST(NULL AS CHAR) AS line_items".to_string(),
    }
}

fn push_window(qb: &mut QueryBuilder<'_, MySql>, column: &str, window: &SyncWindow) {
    qb.push(format!(" {} >= ", column));
    qb.push_bind(window.start);
    if let Some(end) = window.end {
        qb.push(format!(" AND {} <= ", column));
        qb.push_bind(end);
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ExchangeRateRow {
    value: f64,
    created_at: NaiveDateTime,
    created_by: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct LineItemRow {
    child_id: String,
    parent_id: String,
    subscription_key: Option<String>,
    quantity: String,
    unit_leg1: String,
    total_leg1: String,
    unit_leg2: String,
    total_leg2: String,
    description: String,
}

impl From<LineItemRow> for RawLineItem {
    fn from(row: LineItemRow) -> Self {
        RawLineItem {
            child_id: row.child_id,
            parent_id: row.parent_id,
            subscription_key: row.subscription_key.filter(|k| !k.is_empty()),
            quantity: row.quantity,
            unit_leg1: row.unit_leg1,
            total_leg1: row.total_leg1,
            unit_leg2: row.unit_leg2,
            total_leg2: row.total_leg2,
            description: row.description,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: String,
    pre_invoice_id: Option<String>,
    client_id: Option<String>,
    control_number: Option<String>,
    date: NaiveDate,
    subtotal: f64,
    subtotal_bs: f64,
    base: f64,
    base_bs: f64,
    vat_pct: f64,
    vat: f64,
    vat_bs: f64,
    igtf_pct: f64,
    igtf_base: f64,
    igtf_base_bs: f64,
    igtf: f64,
    igtf_bs: f64,
    total: f64,
    total_bs: f64,
    exchange_rate: f64,
    fiscal_number: Option<String>,
    booklet_number: Option<String>,
    voided: i64,
    paid_flag: Option<String>,
    amount_paid: f64,
    fiscal_printer_json: Option<String>,
    concept: Option<String>,
    razon_social: Option<String>,
    docid: Option<String>,
    telefono: Option<String>,
    direccion: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    created_by: Option<String>,
    updated_by: Option<String>,
    line_items: Option<String>,
}

impl InvoiceRow {
    fn into_invoice(self, transfer: LineItemTransfer) -> Result<LegacyInvoice> {
        let line_items = match transfer {
            LineItemTransfer::Concatenated => {
                decoder::parse_parent_blob(&self.id, self.line_items.as_deref())?
            }
            LineItemTransfer::Structured => Vec::new(),
        };

        Ok(LegacyInvoice {
            id: self.id,
            pre_invoice_id: self.pre_invoice_id,
            client_id: self.client_id.unwrap_or_default(),
            control_number: self.control_number.unwrap_or_default(),
            date: self.date,
            credit_days: 0,
            amounts: InvoiceAmounts {
                subtotal: Money::new(self.subtotal, self.subtotal_bs),
                discount_pct: 0.0,
                discount: Money::ZERO,
                base: Money::new(self.base, self.base_bs),
                vat_pct: self.vat_pct,
                vat: Money::new(self.vat, self.vat_bs),
                igtf_pct: self.igtf_pct,
                igtf_base: Money::new(self.igtf_base, self.igtf_base_bs),
                igtf: Money::new(self.igtf, self.igtf_bs),
                total: Money::new(self.total, self.total_bs),
            },
            exchange_rate: self.exchange_rate,
            fiscal_number: self.fiscal_number,
            booklet_number: self.booklet_number.unwrap_or_default(),
            voided: self.voided == 1,
            paid_flag: self.paid_flag.unwrap_or_default(),
            amount_paid: self.amount_paid,
            fiscal_printer_json: self.fiscal_printer_json,
            concept: self.concept,
            customer: CustomerSnapshot {
                razon_social: self.razon_social,
                docid: self.docid,
                telefono: self.telefono,
                direccion: self.direccion,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
            created_by: self.created_by.unwrap_or_default(),
            updated_by: self.updated_by.unwrap_or_default(),
            line_items,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PreInvoiceRow {
    id: i64,
    client_id: Option<String>,
    date: NaiveDate,
    total_dollar: f64,
    concept: String,
    voided: i64,
    paid_flag: Option<String>,
    amount_paid: f64,
    razon_social: Option<String>,
    docid: Option<String>,
    telefono: Option<String>,
    direccion: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    created_by: Option<String>,
    updated_by: Option<String>,
    line_items: Option<String>,
}

impl PreInvoiceRow {
    fn into_pre_invoice(self, transfer: LineItemTransfer) -> Result<LegacyPreInvoice> {
        let line_items = match transfer {
            LineItemTransfer::Concatenated => {
                decoder::parse_parent_blob(&self.id.to_string(), self.line_items.as_deref())?
            }
            LineItemTransfer::Structured => Vec::new(),
        };

        Ok(LegacyPreInvoice {
            id: self.id,
            client_id: self.client_id.unwrap_or_default(),
            date: self.date,
            total_dollar: self.total_dollar,
            concept: self.concept,
            voided: self.voided == 1,
            paid_flag: self.paid_flag.unwrap_or_default(),
            amount_paid: self.amount_paid,
            customer: CustomerSnapshot {
                razon_social: self.razon_social,
                docid: self.docid,
                telefono: self.telefono,
                direccion: self.direccion,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
            created_by: self.created_by.unwrap_or_default(),
            updated_by: self.updated_by.unwrap_or_default(),
            line_items,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WithholdingRow {
    id: String,
    invoice_id: Option<String>,
    invoice_created_at: Option<NaiveDateTime>,
    invoice_rate: f64,
    date: NaiveDate,
    voucher: Option<String>,
    url_file: Option<String>,
    description: Option<String>,
    kind_code: i64,
    voided: i64,
    amount_bolivar: f64,
    base_bolivar: f64,
    vat_bolivar: f64,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    created_by: Option<String>,
    updated_by: Option<String>,
}

impl From<WithholdingRow> for LegacyWithholding {
    fn from(row: WithholdingRow) -> Self {
        LegacyWithholding {
            id: row.id,
            invoice_id: row.invoice_id.unwrap_or_default(),
            invoice_created_at: row.invoice_created_at,
            invoice_rate: row.invoice_rate,
            date: row.date,
            voucher: row.voucher.unwrap_or_default(),
            url_file: row.url_file,
            description: row.description,
            kind_code: i32::try_from(row.kind_code).unwrap_or_default(),
            voided: row.voided == 1,
            amount_bolivar: row.amount_bolivar,
            base_bolivar: row.base_bolivar,
            vat_bolivar: row.vat_bolivar,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by.unwrap_or_default(),
            updated_by: row.updated_by.unwrap_or_default(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    id: String,
    user_receipt_id: Option<String>,
    client_id: Option<String>,
    voided: i64,
    date: NaiveDate,
    reference: Option<String>,
    payment_method_code: i64,
    amount_bs: f64,
    amount_usd: f64,
    exchange_rate: f64,
    payment_detail: Option<String>,
    url_file: Option<String>,
    pre_invoice_id: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    created_by: Option<String>,
    updated_by: Option<String>,
}

impl From<ReceiptRow> for LegacyReceipt {
    fn from(row: ReceiptRow) -> Self {
        LegacyReceipt {
            id: row.id,
            user_receipt_id: row.user_receipt_id,
            client_id: row.client_id.unwrap_or_default(),
            voided: row.voided == 1,
            date: row.date,
            reference: row.reference,
            payment_method_code: i32::try_from(row.payment_method_code).unwrap_or(-1),
            amount: Money::new(row.amount_usd, row.amount_bs),
            exchange_rate: row.exchange_rate,
            payment_detail: row.payment_detail,
            url_file: row.url_file,
            pre_invoice_id: row.pre_invoice_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            created_by: row.created_by.unwrap_or_default(),
            updated_by: row.updated_by.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Read-only legacy store backed by a MySQL pool
#[derive(Clone)]
pub struct MySqlLegacyStore {
    pool: MySqlPool,
}

impl MySqlLegacyStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Child rows of `parents`, grouped by parent id in child id order
    async fn line_items(&self, parents: &[String]) -> Result<HashMap<String, Vec<RawLineItem>>> {
        let mut grouped: HashMap<String, Vec<RawLineItem>> = HashMap::new();
        if parents.is_empty() {
            return Ok(grouped);
        }

        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT CAST(pfd.id AS CHAR) AS child_id, \
             CAST(pfd.pre_factura_id AS CHAR) AS parent_id, \
             CAST(pfd.contrato_det_id AS CHAR) AS subscription_key, \
             CAST(COALESCE(pfd.qty, '') AS CHAR) AS quantity, \
             CAST(COALESCE(CAST(pfd.price_unit AS DECIMAL(20,8)), '') AS CHAR) AS unit_leg1, \
             CAST(COALESCE(CAST(pfd.price_tot AS DECIMAL(20,8)), '') AS CHAR) AS total_leg1, \
             CAST(COALESCE(CAST(pfd.price_unit_bs AS DECIMAL(20,8)), 0) AS CHAR) AS unit_leg2, \
             CAST(COALESCE(CAST(pfd.price_tot_bs AS DECIMAL(20,8)), 0) AS CHAR) AS total_leg2, \
             LOWER(COALESCE(pfd.descripcion, '')) AS description \
             FROM pre_factura_det AS pfd WHERE pfd.pre_factura_id IN (",
        );
        let mut ids = qb.separated(", ");
        for parent in parents {
            ids.push_bind(parent.as_str());
        }
        ids.push_unseparated(") ORDER BY pfd.pre_factura_id ASC, pfd.id ASC");

        let rows: Vec<LineItemRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        for row in rows {
            grouped
                .entry(row.parent_id.clone())
                .or_default()
                .push(RawLineItem::from(row));
        }
        Ok(grouped)
    }
}

#[async_trait]
impl LegacyStore for MySqlLegacyStore {
    async fn exchange_rates(
        &self,
        after: NaiveDateTime,
        row_cap: u32,
    ) -> Result<Vec<LegacyExchangeRate>> {
        let rows: Vec<ExchangeRateRow> = sqlx::query_as(
            r#"
            SELECT CAST(valor AS DOUBLE) AS value,
                CAST(created_at AS DATETIME) AS created_at,
                CAST(created_by AS CHAR) AS created_by
            FROM tasa_cambio
            WHERE created_at > ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(i64::from(row_cap))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LegacyExchangeRate {
                value: row.value,
                created_at: row.created_at,
                created_by: row.created_by,
            })
            .collect())
    }

    async fn fiscal_invoices(&self, extract: Extract<'_>) -> Result<Vec<LegacyInvoice>> {
        let select = format!(
            "SELECT CAST(f.id AS CHAR) AS id, \
             CAST(pf.id AS CHAR) AS pre_invoice_id, \
             CAST(pf.client_id AS CHAR) AS client_id, \
             CAST(f.ncontrol AS CHAR) AS control_number, \
             CAST(f.fecha AS DATE) AS date, \
             {subtotal} AS subtotal, {subtotal2} AS subtotal_bs, \
             {base} AS base, {base2} AS base_bs, \
             {iva} AS vat_pct, {iva_monto} AS vat, {iva_monto2} AS vat_bs, \
             {igtf} AS igtf_pct, {igtf_base} AS igtf_base, {igtf_base2} AS igtf_base_bs, \
             {igtf_monto} AS igtf, {igtf_monto2} AS igtf_bs, \
             {total} AS total, {total2} AS total_bs, \
             {tasa} AS exchange_rate, \
             CAST(f.num_fact_fiscal AS CHAR) AS fiscal_number, \
             CAST(f.num_factura AS CHAR) AS booklet_number, \
             CAST(COALESCE(f.anulado, 0) AS SIGNED) AS voided, \
             CAST(f.pagado AS CHAR) AS paid_flag, \
             {monto_pagado} AS amount_paid, \
             CAST(f.body_json AS CHAR) AS fiscal_printer_json, \
             CAST(pf.concepto AS CHAR) AS concept, \
             LOWER(pf.razon_social) AS razon_social, LOWER(pf.doc_id) AS docid, \
             CAST(pf.telf AS CHAR) AS telefono, LOWER(pf.direccion) AS direccion, \
             CAST(f.created_at AS DATETIME) AS created_at, \
             CAST(f.updated_at AS DATETIME) AS updated_at, \
             CAST(f.created_by AS CHAR) AS created_by, \
             CAST(f.updated_by AS CHAR) AS updated_by, \
             {line_items} \
             FROM factura AS f \
             LEFT JOIN pre_factura AS pf ON pf.id = f.pre_factura_id \
             WHERE",
            subtotal = dbl("f.subtotal"),
            subtotal2 = dbl("f.subtotal2"),
            base = dbl("f.base_imponible"),
            base2 = dbl("f.base_imponible2"),
            iva = dbl("f.iva"),
            iva_monto = dbl("f.iva_monto"),
            iva_monto2 = dbl("f.iva_monto2"),
            igtf = dbl("f.igtf"),
            igtf_base = dbl("f.igtf_base"),
            igtf_base2 = dbl("f.igtf_base2"),
            igtf_monto = dbl("f.igtf_monto"),
            igtf_monto2 = dbl("f.igtf_monto2"),
            total = dbl("f.total"),
            total2 = dbl("f.total2"),
            tasa = dbl("f.tasa_cambio"),
            monto_pagado = dbl("f.monto_pagado + 0"),
            line_items = line_items_column(extract.transfer, "f.pre_factura_id", "''"),
        );

        let mut qb = QueryBuilder::<MySql>::new(select);
        push_window(&mut qb, "f.updated_at", extract.window);
        qb.push(" ORDER BY f.updated_at ASC LIMIT ");
        qb.push_bind(i64::from(extract.row_cap));

        let rows: Vec<InvoiceRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut invoices = rows
            .into_iter()
            .map(|row| row.into_invoice(extract.transfer))
            .collect::<Result<Vec<_>>>()?;

        if extract.transfer == LineItemTransfer::Structured {
            let parents: Vec<String> = invoices
                .iter()
                .filter_map(|i| i.pre_invoice_id.clone())
                .collect();
            let mut items = self.line_items(&parents).await?;
            for invoice in &mut invoices {
                if let Some(parent) = &invoice.pre_invoice_id {
                    invoice.line_items = items.remove(parent).unwrap_or_default();
                }
            }
        }

        Ok(invoices)
    }

    async fn pre_invoices(
        &self,
        filter: PreInvoiceFilter,
        extract: Extract<'_>,
    ) -> Result<Vec<LegacyPreInvoice>> {
        let select = format!(
            "SELECT CAST(pf.id AS SIGNED) AS id, \
             CAST(pf.client_id AS CHAR) AS client_id, \
             CAST(pf.fecha AS DATE) AS date, \
             {subtotal} AS total_dollar, \
             CAST(COALESCE(pf.concepto, '') AS CHAR) AS concept, \
             CAST(COALESCE(pf.anulado, 0) AS SIGNED) AS voided, \
             CAST(pf.pagado AS CHAR) AS paid_flag, \
             {monto_pagado} AS amount_paid, \
             LOWER(pf.razon_social) AS razon_social, LOWER(pf.doc_id) AS docid, \
             CAST(pf.telf AS CHAR) AS telefono, LOWER(pf.direccion) AS direccion, \
             CAST(pf.created_at AS DATETIME) AS created_at, \
             CAST(pf.updated_at AS DATETIME) AS updated_at, \
             CAST(pf.created_by AS CHAR) AS created_by, \
             CAST(pf.updated_by AS CHAR) AS updated_by, \
             {line_items} \
             FROM pre_factura AS pf \
             LEFT JOIN factura AS f ON f.pre_factura_id = pf.id \
             WHERE",
            subtotal = dbl("pf.subtotal"),
            monto_pagado = dbl("pf.monto_pagado + 0"),
            line_items = line_items_column(extract.transfer, "pf.id", "0"),
        );

        let mut qb = QueryBuilder::<MySql>::new(select);
        push_window(&mut qb, "pf.updated_at", extract.window);
        qb.push(" AND f.id IS NULL AND pf.pagado IN ('0', '1')");
        match filter {
            PreInvoiceFilter::Voided => qb.push(" AND pf.anulado = 1"),
            PreInvoiceFilter::Paid => qb.push(" AND pf.anulado = 0 AND (pf.monto_pagado + 0) > 0"),
        };
        qb.push(" ORDER BY pf.updated_at ASC LIMIT ");
        qb.push_bind(i64::from(extract.row_cap));

        let rows: Vec<PreInvoiceRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut pre_invoices = rows
            .into_iter()
            .map(|row| row.into_pre_invoice(extract.transfer))
            .collect::<Result<Vec<_>>>()?;

        if extract.transfer == LineItemTransfer::Structured {
            let parents: Vec<String> = pre_invoices.iter().map(|p| p.id.to_string()).collect();
            let mut items = self.line_items(&parents).await?;
            for pre_invoice in &mut pre_invoices {
                pre_invoice.line_items = items
                    .remove(&pre_invoice.id.to_string())
                    .unwrap_or_default();
            }
        }

        Ok(pre_invoices)
    }

    async fn withholdings(&self, extract: Extract<'_>) -> Result<Vec<LegacyWithholding>> {
        let select = format!(
            "SELECT CAST(r.id AS CHAR) AS id, \
             CAST(r.factura_id AS CHAR) AS invoice_id, \
             CAST(f.created_at AS DATETIME) AS invoice_created_at, \
             {tasa} AS invoice_rate, \
             CAST(r.fecha AS DATE) AS date, \
             CAST(r.comprobante AS CHAR) AS voucher, \
             CAST(r.url_imagen AS CHAR) AS url_file, \
             LOWER(r.descripcion) AS description, \
             CAST(COALESCE(r.tipo, 0) AS SIGNED) AS kind_code, \
             CAST(COALESCE(r.anulado, 0) AS SIGNED) AS voided, \
             {monto} AS amount_bolivar, {base} AS base_bolivar, {iva} AS vat_bolivar, \
             CAST(r.created_at AS DATETIME) AS created_at, \
             CAST(r.updated_at AS DATETIME) AS updated_at, \
             CAST(r.created_by AS CHAR) AS created_by, \
             CAST(r.updated_by AS CHAR) AS updated_by \
             FROM retenciones AS r \
             LEFT JOIN factura AS f ON f.id = r.factura_id \
             WHERE",
            tasa = dbl("f.tasa_cambio"),
            monto = dbl("r.monto"),
            base = dbl("r.base_imponible"),
            iva = dbl("r.iva_impuesto"),
        );

        let mut qb = QueryBuilder::<MySql>::new(select);
        push_window(&mut qb, "r.updated_at", extract.window);
        qb.push(" ORDER BY r.updated_at ASC LIMIT ");
        qb.push_bind(i64::from(extract.row_cap));

        let rows: Vec<WithholdingRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LegacyWithholding::from).collect())
    }

    async fn receipts(
        &self,
        filter: ReceiptFilter,
        extract: Extract<'_>,
    ) -> Result<Vec<LegacyReceipt>> {
        // A receipt entered by the client through the portal carries its own
        // amounts, dates and file in recibo_pago_user
        let select = format!(
            "SELECT CAST(rp.id AS CHAR) AS id, \
             CAST(rpu.id AS CHAR) AS user_receipt_id, \
             CAST(rp.client_id AS CHAR) AS client_id, \
             CAST(COALESCE(rp.anulado, 0) AS SIGNED) AS voided, \
             CAST(IF(rpu.id IS NOT NULL, rpu.fecha, rp.fecha) AS DATE) AS date, \
             CAST(IF(rpu.id IS NOT NULL, rpu.num_recibo, rp.num_recibo) AS CHAR) AS reference, \
             CAST(COALESCE(rp.forma_pago, -1) AS SIGNED) AS payment_method_code, \
             {monto_bs} AS amount_bs, {monto_usd} AS amount_usd, {tasa} AS exchange_rate, \
             CAST(IF(rp.procesado = '' OR rp.procesado IS NULL, rp.pre_factura_id, rp.procesado) AS CHAR) AS payment_detail, \
             CAST(IF(rpu.id IS NOT NULL, rpu.url_imagen, rp.url_imagen) AS CHAR) AS url_file, \
             CAST(rp.pre_factura_id AS CHAR) AS pre_invoice_id, \
             CAST(IF(rpu.id IS NOT NULL, rpu.created_at, rp.created_at) AS DATETIME) AS created_at, \
             CAST(IF(rpu.id IS NOT NULL, rpu.updated_at, rp.updated_at) AS DATETIME) AS updated_at, \
             IF(cby.client_id IS NOT NULL, '1', CAST(rp.created_by AS CHAR)) AS created_by, \
             IF(uby.client_id IS NOT NULL, '1', CAST(rp.updated_by AS CHAR)) AS updated_by \
             FROM recibo_pago AS rp \
             LEFT JOIN recibo_pago_user AS rpu ON rpu.id = rp.recibo_pago_user_id \
             LEFT JOIN sf_guard_user AS cby ON cby.id = rp.created_by \
             LEFT JOIN sf_guard_user AS uby ON uby.id = rp.updated_by \
             WHERE",
            monto_bs = dbl("IF(rpu.id IS NOT NULL, rpu.monto_bs, rp.monto)"),
            monto_usd = dbl("IF(rpu.id IS NOT NULL, rpu.monto, rp.monto2)"),
            tasa = dbl("IF(rpu.id IS NOT NULL, rpu.tasa_cambio, rp.tasa_cambio)"),
        );

        let mut qb = QueryBuilder::<MySql>::new(select);
        push_window(&mut qb, "rp.created_at", extract.window);
        match filter {
            ReceiptFilter::Voided => qb.push(" AND rp.anulado = 1"),
            ReceiptFilter::Processed => {
                qb.push(" AND COALESCE(rp.anulado, 0) <> 1 AND (rp.pendiente_monto2 + 0) <= 0")
            }
        };
        qb.push(" ORDER BY rp.created_at ASC LIMIT ");
        qb.push_bind(i64::from(extract.row_cap));

        let rows: Vec<ReceiptRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LegacyReceipt::from).collect())
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        })
    }
}
