//! Destination store over the normalized PostgreSQL schema
//!
//! Invoices and withholdings go through the `venta` stored procedures;
//! receipts and exchange rates are plain inserts. Every insert writes its
//! `sync.legacy_mapping` rows in the same transaction, and lookups consult
//! the mapping table before scanning the JSON metadata of rows migrated
//! before it existed.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

use super::{DestinationStore, RefRequest, ResolvedRefs};
use crate::error::{Error, Result};
use crate::models::{
    FailedRecord, JobKind, LegacyRef, MigratedRef, NewExchangeRate, NewInvoice, NewReceipt,
    NewWithholding, PoolStatus, Status, SubscriptionSummary,
};

// =============================================================================
// Lookups
// =============================================================================

/// Table and JSON key a legacy reference was stored under before the
/// mapping table existed
fn metadata_lookup(legacy: &LegacyRef) -> (&'static str, &'static str) {
    match legacy {
        LegacyRef::FiscalInvoice { .. } => ("venta.facturav", "fact_oldid"),
        LegacyRef::PreInvoice { .. } | LegacyRef::InvoiceForPreInvoice { .. } => {
            ("venta.facturav", "prefact_oldid")
        }
        LegacyRef::Withholding { .. } => ("venta.facturav_retencion", "oldid"),
        LegacyRef::Receipt { .. } => ("venta.recibo_pagov", "recibo_pago_id"),
    }
}

/// `SELECT id, created_at` of the row carrying `legacy` in its metadata
fn push_metadata_lookup(qb: &mut QueryBuilder<'_, Postgres>, legacy: &LegacyRef) {
    let (table, key) = metadata_lookup(legacy);
    qb.push(format!(
        "SELECT id::text AS id, created_at::timestamp AS created_at FROM {} WHERE info->>'{}' = ",
        table, key
    ));
    qb.push_bind(legacy.legacy_key().to_string());
    if let LegacyRef::PreInvoice { .. } = legacy {
        qb.push(" AND tipo = 'nota'");
    }
    if let Some(created_at) = legacy.created_at() {
        qb.push(" AND created_at = ");
        qb.push_bind(created_at);
    }
}

/// Mapping table first, metadata scan second
fn push_migrated_lookup(qb: &mut QueryBuilder<'_, Postgres>, legacy: &LegacyRef) {
    qb.push(
        "(SELECT internal_id AS id, internal_created_at AS created_at \
         FROM sync.legacy_mapping WHERE entity = ",
    );
    qb.push_bind(legacy.mapping_entity());
    qb.push(" AND legacy_key = ");
    qb.push_bind(legacy.legacy_key().to_string());
    qb.push(") UNION ALL (");
    push_metadata_lookup(qb, legacy);
    qb.push(" LIMIT 1) LIMIT 1");
}

fn push_lateral(qb: &mut QueryBuilder<'_, Postgres>, alias: &str, legacy: Option<&LegacyRef>) {
    qb.push(" LEFT JOIN LATERAL (");
    match legacy {
        Some(legacy) => push_migrated_lookup(qb, legacy),
        None => {
            qb.push("SELECT NULL::text AS id, NULL::timestamp AS created_at WHERE FALSE");
        }
    }
    qb.push(format!(") AS {} ON TRUE", alias));
}

fn push_user(qb: &mut QueryBuilder<'_, Postgres>, legacy_id: Option<&String>, alias: &str) {
    match legacy_id {
        Some(id) => {
            qb.push("(SELECT id::bigint FROM publico.guard_user WHERE info->>'oldid' = ");
            qb.push_bind(id.clone());
            qb.push(format!(" LIMIT 1) AS {}", alias));
        }
        None => {
            qb.push(format!("NULL::bigint AS {}", alias));
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct RefsRow {
    created_by: Option<i64>,
    updated_by: Option<i64>,
    client_id: Option<i64>,
    exchange_rate: Option<f64>,
    payment_account_id: Option<i64>,
    existing_id: Option<String>,
    existing_created_at: Option<NaiveDateTime>,
    parent_id: Option<String>,
    parent_created_at: Option<NaiveDateTime>,
}

fn migrated(id: Option<String>, created_at: Option<NaiveDateTime>) -> Option<MigratedRef> {
    Some(MigratedRef {
        id: id?,
        created_at: created_at?,
    })
}

impl From<RefsRow> for ResolvedRefs {
    fn from(row: RefsRow) -> Self {
        ResolvedRefs {
            created_by: row.created_by,
            updated_by: row.updated_by,
            client_id: row.client_id,
            exchange_rate: row.exchange_rate,
            payment_account_id: row.payment_account_id,
            existing: migrated(row.existing_id, row.existing_created_at),
            parent: migrated(row.parent_id, row.parent_created_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MigratedRow {
    id: String,
    created_at: NaiveDateTime,
}

impl From<MigratedRow> for MigratedRef {
    fn from(row: MigratedRow) -> Self {
        MigratedRef {
            id: row.id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    legacy_key: String,
    zona: String,
    tipo_conexion: String,
    tipo_servicio: String,
    speed_value: f64,
    speed_unit: String,
}

impl From<SubscriptionRow> for SubscriptionSummary {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionSummary {
            id: row.id,
            legacy_key: row.legacy_key,
            zona: row.zona,
            tipo_conexion: row.tipo_conexion,
            tipo_servicio: row.tipo_servicio,
            speed_value: row.speed_value,
            speed_unit: row.speed_unit,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Destination store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgDestinationStore {
    pool: PgPool,
}

impl PgDestinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Re-read the id a stored procedure assigned to `legacy`
    async fn migrated_after_insert(
        conn: &mut PgConnection,
        legacy: &LegacyRef,
    ) -> Result<MigratedRef> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_metadata_lookup(&mut qb, legacy);
        qb.push(" LIMIT 1");

        let row: Option<MigratedRow> = qb.build_query_as().fetch_optional(&mut *conn).await?;
        row.map(MigratedRef::from).ok_or_else(|| {
            Error::internal(format!(
                "inserted {} {} but cannot read it back",
                legacy.mapping_entity(),
                legacy.legacy_key()
            ))
        })
    }

    async fn write_mapping(
        conn: &mut PgConnection,
        refs: &[&LegacyRef],
        migrated: &MigratedRef,
    ) -> Result<()> {
        for legacy in refs {
            sqlx::query(mapping_insert_sql(legacy))
                .bind(legacy.mapping_entity())
                .bind(legacy.legacy_key())
                .bind(&migrated.id)
                .bind(migrated.created_at)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

/// Mapping insert for one alternate key.
///
/// A key already mapped aborts the surrounding transaction, so a record that
/// two runs both raced past the idempotency check is written once. Several
/// invoices may share one pre-invoice, so that key keeps its first mapping.
fn mapping_insert_sql(legacy: &LegacyRef) -> &'static str {
    match legacy {
        LegacyRef::InvoiceForPreInvoice { .. } => {
            r#"
            INSERT INTO sync.legacy_mapping (entity, legacy_key, internal_id, internal_created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity, legacy_key) DO NOTHING
            "#
        }
        _ => {
            r#"
            INSERT INTO sync.legacy_mapping (entity, legacy_key, internal_id, internal_created_at)
            VALUES ($1, $2, $3, $4)
            "#
        }
    }
}

#[async_trait]
impl DestinationStore for PgDestinationStore {
    async fn latest_timestamp(&self, job: JobKind) -> Result<Option<NaiveDateTime>> {
        let query = match job {
            JobKind::ExchangeRate => {
                "SELECT MAX(created_at)::timestamp FROM publico.tasa_cambio WHERE moneda = 'bolivar'"
            }
            JobKind::FiscalInvoice => {
                "SELECT MAX(updated_at)::timestamp FROM venta.facturav \
                 WHERE tipo IN ('fiscal_maquina', 'fiscal_talonario')"
            }
            JobKind::VoidedPreInvoice => {
                "SELECT MAX(updated_at)::timestamp FROM venta.facturav \
                 WHERE tipo = 'nota' AND estatus = 'anulado'"
            }
            JobKind::PaidPreInvoice => {
                "SELECT MAX(updated_at)::timestamp FROM venta.facturav \
                 WHERE tipo = 'nota' AND estatus IN ('pagado', 'abonado')"
            }
            JobKind::Withholding => {
                "SELECT MAX(updated_at)::timestamp FROM venta.facturav_retencion"
            }
            JobKind::VoidedReceipt => {
                "SELECT MAX(created_at)::timestamp FROM venta.recibo_pagov WHERE estatus = 'anulado'"
            }
            JobKind::ProcessedReceipt => {
                "SELECT MAX(created_at)::timestamp FROM venta.recibo_pagov WHERE estatus = 'procesado'"
            }
        };

        let latest: Option<NaiveDateTime> = sqlx::query_scalar(query)
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn resolve_refs(&self, request: &RefRequest) -> Result<ResolvedRefs> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        push_user(&mut qb, request.created_by.as_ref(), "created_by");
        qb.push(", ");
        push_user(&mut qb, request.updated_by.as_ref(), "updated_by");

        match &request.client {
            Some(client) => {
                qb.push(", (SELECT id::bigint FROM publico.cliente WHERE info->>'oldid' = ");
                qb.push_bind(client.clone());
                qb.push(" LIMIT 1) AS client_id");
            }
            None => {
                qb.push(", NULL::bigint AS client_id");
            }
        }

        match request.rate_at {
            Some(at) => {
                qb.push(
                    ", (SELECT monto::float8 FROM publico.tasa_cambio \
                     WHERE moneda = 'bolivar' AND created_at <= ",
                );
                qb.push_bind(at);
                qb.push(" ORDER BY created_at DESC LIMIT 1) AS exchange_rate");
            }
            None => {
                qb.push(", NULL::float8 AS exchange_rate");
            }
        }

        match &request.payment_account {
            Some(account) => {
                qb.push(", (SELECT id::bigint FROM publico.cuenta_banco WHERE banco = ");
                qb.push_bind(account.bank.clone());
                qb.push(" AND moneda = ");
                qb.push_bind(account.currency.clone());
                qb.push(" AND metodo_pago = ");
                qb.push_bind(account.method.clone());
                qb.push(" AND info->>'web_nombre' = ");
                qb.push_bind(account.web_name.clone());
                qb.push(" LIMIT 1) AS payment_account_id");
            }
            None => {
                qb.push(", NULL::bigint AS payment_account_id");
            }
        }

        qb.push(
            ", existing.id AS existing_id, existing.created_at AS existing_created_at, \
             parent.id AS parent_id, parent.created_at AS parent_created_at \
             FROM (SELECT 1) AS one",
        );
        push_lateral(&mut qb, "existing", request.existing.as_ref());
        push_lateral(&mut qb, "parent", request.parent.as_ref());

        let row: RefsRow = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(ResolvedRefs::from(row))
    }

    async fn find_migrated(&self, legacy: &LegacyRef) -> Result<Option<MigratedRef>> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_migrated_lookup(&mut qb, legacy);

        let row: Option<MigratedRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(MigratedRef::from))
    }

    async fn subscription(&self, legacy_key: &str) -> Result<Option<SubscriptionSummary>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT s.id::bigint AS id,
                s.info->>'oldid' AS legacy_key,
                COALESCE(SPLIT_PART(st.nombre, '/', 1), '') AS zona,
                COALESCE(SPLIT_PART(st.nombre, '/', 2), '') AS tipo_conexion,
                COALESCE(SPLIT_PART(st.nombre, '/', 3), '') AS tipo_servicio,
                COALESCE(NULLIF(regexp_replace(sv.nombre, '[^0-9]', '', 'g'), ''), '0')::float8 AS speed_value,
                'Mbps' AS speed_unit
            FROM administracion.suscripcion AS s
            LEFT JOIN administracion.servicio AS sv ON sv.id = s.servicio_id
            LEFT JOIN administracion.servicio_tipo AS st ON st.id = sv.servicio_tipo_id
            WHERE s.info->>'oldid' = $1
            LIMIT 1
            "#,
        )
        .bind(legacy_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubscriptionSummary::from))
    }

    async fn insert_exchange_rate(&self, rate: &NewExchangeRate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publico.tasa_cambio (empresa_id, moneda, monto, created_at, created_by)
            VALUES ($1, $2, $3::numeric, $4, $5)
            "#,
        )
        .bind(rate.company_id)
        .bind(&rate.currency)
        .bind(rate.amount)
        .bind(rate.created_at)
        .bind(rate.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<MigratedRef> {
        let primary = invoice
            .legacy_refs
            .first()
            .ok_or_else(|| Error::validation("invoice without a legacy reference"))?;
        let a = &invoice.amounts;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            SELECT venta.insert_factura(
                $1::integer, $2::integer, $3::text, $4::text, $5, $6::text, $7::text, $8::integer,
                $9::numeric[], $10::numeric, $11::numeric[], $12::numeric[], $13::numeric,
                $14::numeric[], $15::numeric, $16::numeric[], $17::numeric[], $18::numeric[],
                $19::numeric, $20, $21, $22::integer, $23::integer, $24::jsonb, $25::jsonb
            )
            "#,
        )
        .bind(invoice.company_id)
        .bind(invoice.client_id)
        .bind(&invoice.control_number)
        .bind(&invoice.number)
        .bind(invoice.date)
        .bind(invoice.kind.as_str())
        .bind(invoice.status.as_str())
        .bind(invoice.credit_days)
        .bind(a.subtotal.to_array())
        .bind(a.discount_pct)
        .bind(a.discount.to_array())
        .bind(a.base.to_array())
        .bind(a.vat_pct)
        .bind(a.vat.to_array())
        .bind(a.igtf_pct)
        .bind(a.igtf_base.to_array())
        .bind(a.igtf.to_array())
        .bind(a.total.to_array())
        .bind(invoice.exchange_rate)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .bind(invoice.created_by)
        .bind(invoice.updated_by)
        .bind(&invoice.info)
        .bind(invoice.line_items_payload())
        .execute(&mut *tx)
        .await?;

        let migrated = Self::migrated_after_insert(&mut tx, primary).await?;
        let refs: Vec<&LegacyRef> = invoice.legacy_refs.iter().collect();
        Self::write_mapping(&mut tx, &refs, &migrated).await?;
        tx.commit().await?;

        Ok(migrated)
    }

    async fn insert_withholding(&self, withholding: &NewWithholding) -> Result<MigratedRef> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            SELECT venta.insert_facturav_retencion(
                $1::integer, $2, $3, $4::text, $5::numeric[], $6::numeric[], $7::numeric,
                $8, $9::text, $10::text, $11, $12, $13::integer, $14::integer, $15::jsonb
            )
            "#,
        )
        .bind(withholding.company_id)
        .bind(&withholding.invoice.id)
        .bind(withholding.invoice.created_at)
        .bind(withholding.kind.as_str())
        .bind(withholding.withheld.to_array())
        .bind(withholding.base.to_array())
        .bind(withholding.pct)
        .bind(withholding.date)
        .bind(&withholding.voucher)
        .bind(withholding.status.as_str())
        .bind(withholding.created_at)
        .bind(withholding.updated_at)
        .bind(withholding.created_by)
        .bind(withholding.updated_by)
        .bind(&withholding.info)
        .execute(&mut *tx)
        .await?;

        let migrated = Self::migrated_after_insert(&mut tx, &withholding.legacy_ref).await?;
        Self::write_mapping(&mut tx, &[&withholding.legacy_ref], &migrated).await?;
        tx.commit().await?;

        Ok(migrated)
    }

    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<MigratedRef> {
        let mut tx = self.pool.begin().await?;
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO venta.recibo_pagov (empresa_id, cliente_id, estatus, fecha, referencia,
                metodo_pago_id, monto, tasa_cambio, created_at, updated_at, created_by, updated_by, info)
            VALUES ($1, $2, $3, $4, $5, $6, $7::numeric[], $8::numeric, $9, $10, $11, $12, $13)
            RETURNING id::text
            "#,
        )
        .bind(receipt.company_id)
        .bind(receipt.client_id)
        .bind(receipt.status.as_str())
        .bind(receipt.date)
        .bind(&receipt.reference)
        .bind(receipt.payment_account_id)
        .bind(receipt.amount.to_array())
        .bind(receipt.exchange_rate)
        .bind(receipt.created_at)
        .bind(receipt.updated_at)
        .bind(receipt.created_by)
        .bind(receipt.updated_by)
        .bind(&receipt.info)
        .fetch_one(&mut *tx)
        .await?;

        if receipt.promote {
            sqlx::query(
                "UPDATE venta.recibo_pagov SET estatus = $1 WHERE id::text = $2 AND created_at = $3",
            )
            .bind(Status::Procesado.as_str())
            .bind(&id)
            .bind(receipt.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let migrated = MigratedRef {
            id,
            created_at: receipt.created_at,
        };
        Self::write_mapping(&mut tx, &[&receipt.legacy_ref], &migrated).await?;
        tx.commit().await?;

        Ok(migrated)
    }

    async fn record_failure(
        &self,
        job: JobKind,
        legacy_key: &str,
        record_at: NaiveDateTime,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync.failed_record (job, legacy_key, record_at, error, attempts, first_failed_at, last_failed_at)
            VALUES ($1, $2, $3, $4, 1, NOW(), NOW())
            ON CONFLICT (job, legacy_key) DO UPDATE SET
                record_at = EXCLUDED.record_at,
                error = EXCLUDED.error,
                attempts = sync.failed_record.attempts + 1,
                last_failed_at = NOW()
            "#,
        )
        .bind(job.name())
        .bind(legacy_key)
        .bind(record_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failure_span(&self, job: JobKind) -> Result<Option<(NaiveDateTime, NaiveDateTime)>> {
        let (first, last): (Option<NaiveDateTime>, Option<NaiveDateTime>) = sqlx::query_as(
            "SELECT MIN(record_at), MAX(record_at) FROM sync.failed_record WHERE job = $1",
        )
        .bind(job.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(first.zip(last))
    }

    async fn clear_failures(&self, job: JobKind, legacy_keys: &[String]) -> Result<()> {
        if legacy_keys.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM sync.failed_record WHERE job = $1 AND legacy_key = ANY($2)")
            .bind(job.name())
            .bind(legacy_keys)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_failures(&self, job: Option<JobKind>, limit: u32) -> Result<Vec<FailedRecord>> {
        let rows: Vec<FailedRecord> = sqlx::query_as(
            r#"
            SELECT job, legacy_key, record_at, error, attempts, first_failed_at, last_failed_at
            FROM sync.failed_record
            WHERE ($1::text IS NULL OR job = $1)
            ORDER BY last_failed_at DESC
            LIMIT $2
            "#,
        )
        .bind(job.map(|j| j.name()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_lookup_prefers_mapping_table() {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_migrated_lookup(
            &mut qb,
            &LegacyRef::FiscalInvoice {
                id: "7".to_string(),
                created_at: Some(at()),
            },
        );
        let sql = qb.sql();
        let mapping = sql.find("sync.legacy_mapping").unwrap();
        let metadata = sql.find("info->>'fact_oldid'").unwrap();
        assert!(mapping < metadata);
        assert!(sql.contains("AND created_at = $4"));
    }

    #[test]
    fn test_pre_invoice_lookup_is_scoped_to_notes() {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_metadata_lookup(
            &mut qb,
            &LegacyRef::PreInvoice {
                id: "70".to_string(),
                created_at: None,
            },
        );
        let sql = qb.sql();
        assert!(sql.contains("info->>'prefact_oldid' = $1"));
        assert!(sql.contains("tipo = 'nota'"));
        assert!(!sql.contains("created_at ="));
    }

    #[test]
    fn test_any_invoice_for_pre_invoice_ignores_kind() {
        let mut qb = QueryBuilder::<Postgres>::new("");
        push_metadata_lookup(
            &mut qb,
            &LegacyRef::InvoiceForPreInvoice {
                id: "70".to_string(),
            },
        );
        assert!(!qb.sql().contains("tipo"));
    }

    #[test]
    fn test_duplicate_mapping_aborts_write() {
        let invoice = LegacyRef::FiscalInvoice {
            id: "7".to_string(),
            created_at: Some(at()),
        };
        assert!(!mapping_insert_sql(&invoice).contains("ON CONFLICT"));

        let receipt = LegacyRef::Receipt {
            id: "9".to_string(),
            created_at: Some(at()),
        };
        assert!(!mapping_insert_sql(&receipt).contains("ON CONFLICT"));

        let shared = LegacyRef::InvoiceForPreInvoice {
            id: "70".to_string(),
        };
        assert!(mapping_insert_sql(&shared).contains("DO NOTHING"));
    }

    #[test]
    fn test_partial_migrated_ref_is_none() {
        assert!(migrated(Some("1".to_string()), None).is_none());
        assert_eq!(
            migrated(Some("1".to_string()), Some(at())),
            Some(MigratedRef {
                id: "1".to_string(),
                created_at: at()
            })
        );
    }
}
