//! Integration tests for full sync runs over the in-memory stores

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use billsync_core::models::{
    CustomerSnapshot, InvoiceAmounts, LegacyExchangeRate, LegacyInvoice, LegacyPreInvoice,
    LegacyReceipt, LegacyWithholding, Money, PaymentAccountKey, RawLineItem,
};
use billsync_core::services::resolve_window;
use billsync_core::store::{DestinationStore, MemoryDestinationStore, MemoryLegacyStore};
use billsync_core::{
    Caller, Error, JobKind, JobOverrides, LineItemTransfer, Status, SyncConfig, SyncEngine,
};

// ============================================================================
// Fixtures
// ============================================================================

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn backfill() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        backfill_start: Some(backfill()),
        ..Default::default()
    }
}

fn seeded(dest: MemoryDestinationStore) -> Arc<MemoryDestinationStore> {
    dest.add_user("1", 101);
    dest.add_user("2", 102);
    dest.add_client("C-1", 501);
    dest.add_exchange_rate(at(1, 0), 40.0);
    dest.add_payment_account(
        PaymentAccountKey::new("banesco", "bolivar", "pago_movil", "banesco"),
        9,
    );
    Arc::new(dest)
}

fn engine(
    legacy: &Arc<MemoryLegacyStore>,
    dest: &Arc<MemoryDestinationStore>,
    config: SyncConfig,
) -> SyncEngine {
    SyncEngine::new(legacy.clone(), dest.clone(), config)
}

fn line(child: &str, parent: &str) -> RawLineItem {
    RawLineItem {
        child_id: child.to_string(),
        parent_id: parent.to_string(),
        subscription_key: None,
        quantity: "1".to_string(),
        unit_leg1: "116".to_string(),
        total_leg1: "116".to_string(),
        unit_leg2: "4640".to_string(),
        total_leg2: "4640".to_string(),
        description: "plan 20 megas".to_string(),
    }
}

fn invoice(id: &str, pre_invoice_id: &str, day: u32) -> LegacyInvoice {
    LegacyInvoice {
        id: id.to_string(),
        pre_invoice_id: Some(pre_invoice_id.to_string()),
        client_id: "C-1".to_string(),
        control_number: format!("00-{}", id),
        date: at(day, 9).date(),
        credit_days: 0,
        amounts: InvoiceAmounts {
            subtotal: Money::new(100.0, 4000.0),
            base: Money::new(100.0, 4000.0),
            vat_pct: 16.0,
            vat: Money::new(16.0, 640.0),
            total: Money::new(116.0, 4640.0),
            ..Default::default()
        },
        exchange_rate: 40.0,
        fiscal_number: Some(format!("Z{}", id)),
        booklet_number: String::new(),
        voided: false,
        paid_flag: "1".to_string(),
        amount_paid: 116.0,
        fiscal_printer_json: None,
        concept: None,
        customer: CustomerSnapshot::default(),
        created_at: at(day, 9),
        updated_at: at(day, 10),
        created_by: "1".to_string(),
        updated_by: "2".to_string(),
        line_items: vec![line(&format!("{}0", id), pre_invoice_id)],
    }
}

fn pre_invoice(id: i64, day: u32) -> LegacyPreInvoice {
    LegacyPreInvoice {
        id,
        client_id: "C-1".to_string(),
        date: at(day, 9).date(),
        total_dollar: 116.0,
        concept: "mensualidad".to_string(),
        voided: false,
        paid_flag: "0".to_string(),
        amount_paid: 50.0,
        customer: CustomerSnapshot::default(),
        created_at: at(day, 9),
        updated_at: at(day, 10),
        created_by: "1".to_string(),
        updated_by: "1".to_string(),
        line_items: vec![line("700", &id.to_string())],
    }
}

fn withholding(id: &str, invoice_id: &str, invoice_day: u32) -> LegacyWithholding {
    LegacyWithholding {
        id: id.to_string(),
        invoice_id: invoice_id.to_string(),
        invoice_created_at: Some(at(invoice_day, 9)),
        invoice_rate: 40.0,
        date: at(12, 0).date(),
        voucher: "2024030001".to_string(),
        url_file: None,
        description: None,
        kind_code: 3,
        voided: false,
        amount_bolivar: 480.0,
        base_bolivar: 4000.0,
        vat_bolivar: 640.0,
        created_at: at(12, 8),
        updated_at: at(12, 8),
        created_by: "1".to_string(),
        updated_by: "1".to_string(),
    }
}

fn receipt(id: &str, pre_invoice_id: &str) -> LegacyReceipt {
    LegacyReceipt {
        id: id.to_string(),
        user_receipt_id: None,
        client_id: "C-1".to_string(),
        voided: false,
        date: at(15, 0).date(),
        reference: Some("REF-1".to_string()),
        payment_method_code: 8,
        amount: Money::new(50.0, 2000.0),
        exchange_rate: 40.0,
        payment_detail: Some(pre_invoice_id.to_string()),
        url_file: None,
        pre_invoice_id: Some(pre_invoice_id.to_string()),
        created_at: at(15, 11),
        updated_at: at(15, 11),
        created_by: "1".to_string(),
        updated_by: "1".to_string(),
    }
}

// ============================================================================
// Exchange rates
// ============================================================================

#[tokio::test]
async fn test_exchange_rate_end_to_end() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_exchange_rate(LegacyExchangeRate {
        value: 4_000_000.0,
        created_at: at(2, 8),
        created_by: Some("1".to_string()),
    });
    legacy.add_exchange_rate(LegacyExchangeRate {
        value: 36.5,
        created_at: at(3, 8),
        created_by: Some("unknown".to_string()),
    });
    let dest = Arc::new(MemoryDestinationStore::new());
    dest.add_user("1", 101);
    let engine = engine(&legacy, &dest, config());

    let first = engine.run(JobKind::ExchangeRate, Caller::Scheduler).await.unwrap();
    assert_eq!(first.extracted, 2);
    assert_eq!(first.inserted, 2);

    let rates = dest.exchange_rates();
    assert_eq!(rates[0].amount, 4.0);
    assert_eq!(rates[0].created_by, Some(101));
    assert_eq!(rates[1].amount, 36.5);
    assert_eq!(rates[1].created_by, None);

    let second = engine.run(JobKind::ExchangeRate, Caller::OnDemand).await.unwrap();
    assert_eq!(second.extracted, 0);
    assert_eq!(second.inserted, 0);
    assert_eq!(dest.exchange_rates().len(), 2);
}

// ============================================================================
// Idempotency and at-most-once
// ============================================================================

#[tokio::test]
async fn test_rerun_inserts_nothing_new() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    for (id, day) in [("1", 3), ("2", 4), ("3", 5)] {
        legacy.add_invoice(invoice(id, &format!("{}0", id), day));
    }
    let dest = seeded(MemoryDestinationStore::new());
    let engine = engine(&legacy, &dest, config());

    let first = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(first.inserted, 3);
    assert_eq!(first.failed, 0);

    // The watermark record sits on the inclusive window start and is re-read
    let second = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.already_migrated, second.extracted);
    assert_eq!(dest.invoices().len(), 3);
}

#[tokio::test]
async fn test_concurrent_runs_insert_at_most_once() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    for (id, day) in [("1", 3), ("2", 4), ("3", 5), ("4", 6)] {
        legacy.add_invoice(invoice(id, &format!("{}0", id), day));
    }
    let dest = seeded(MemoryDestinationStore::new().with_insert_delay(Duration::from_millis(5)));
    let engine = engine(&legacy, &dest, config());

    let (a, b) = tokio::join!(
        engine.run(JobKind::FiscalInvoice, Caller::Scheduler),
        engine.run(JobKind::FiscalInvoice, Caller::OnDemand),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.inserted + b.inserted, 4);
    let mut numbers: Vec<String> = dest.invoices().into_iter().map(|i| i.number).collect();
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 4);
    assert_eq!(dest.invoices().len(), 4);
}

// ============================================================================
// Windows
// ============================================================================

#[tokio::test]
async fn test_window_start_never_moves_backwards() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_invoice(invoice("1", "10", 3));
    let dest = seeded(MemoryDestinationStore::new());
    let config = config();
    let settings = config.settings_for(JobKind::FiscalInvoice);
    let engine = engine(&legacy, &dest, config);

    let before = resolve_window(dest.as_ref(), JobKind::FiscalInvoice, &settings)
        .await
        .unwrap();
    assert_eq!(before.start, backfill());
    assert!(!before.from_watermark);

    let first = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(first.window, before);

    let after_first = resolve_window(dest.as_ref(), JobKind::FiscalInvoice, &settings)
        .await
        .unwrap();
    assert_eq!(after_first.start, at(3, 10));
    assert!(after_first.from_watermark);

    legacy.add_invoice(invoice("2", "20", 9));
    engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();

    let after_second = resolve_window(dest.as_ref(), JobKind::FiscalInvoice, &settings)
        .await
        .unwrap();
    assert!(after_second.start >= after_first.start);
    assert_eq!(after_second.start, at(9, 10));
    assert_eq!(
        after_second.end,
        NaiveDate::from_ymd_opt(2024, 8, 9).and_then(|d| d.and_hms_opt(10, 0, 0))
    );
}

#[tokio::test]
async fn test_missing_backfill_is_config_error() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    let dest = seeded(MemoryDestinationStore::new());
    let engine = engine(&legacy, &dest, SyncConfig::default());

    let result = engine.run(JobKind::Withholding, Caller::Scheduler).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_per_job_backfill_overrides_global() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_invoice(invoice("1", "10", 3));
    let dest = seeded(MemoryDestinationStore::new());

    let mut jobs = HashMap::new();
    jobs.insert(
        "sinc_factura_fiscal".to_string(),
        JobOverrides {
            backfill_start: Some(at(4, 0)),
            ..Default::default()
        },
    );
    let engine = engine(&legacy, &dest, SyncConfig { jobs, ..config() });

    let summary = engine.run(JobKind::FiscalInvoice, Caller::OnDemand).await.unwrap();
    assert_eq!(summary.window.start, at(4, 0));
    assert_eq!(summary.extracted, 0);
}

// ============================================================================
// Dependencies between jobs
// ============================================================================

#[tokio::test]
async fn test_withholding_waits_for_its_invoice() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_withholding(withholding("5", "7", 5));
    let dest = seeded(MemoryDestinationStore::new());
    let engine = engine(&legacy, &dest, config());

    let skipped = engine.run(JobKind::Withholding, Caller::Scheduler).await.unwrap();
    assert_eq!(skipped.parent_missing, 1);
    assert_eq!(skipped.failed, 0);
    assert!(dest.withholdings().is_empty());

    legacy.add_invoice(invoice("7", "70", 5));
    engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();

    let eligible = engine.run(JobKind::Withholding, Caller::Scheduler).await.unwrap();
    assert_eq!(eligible.inserted, 1);
    assert_eq!(dest.withholdings()[0].status, Status::Procesado);
}

#[tokio::test]
async fn test_receipt_pays_migrated_pre_invoice() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_pre_invoice(pre_invoice(70, 5));
    legacy.add_receipt(receipt("900", "70"));
    let dest = seeded(MemoryDestinationStore::new());
    let engine = engine(&legacy, &dest, config());

    let early = engine.run(JobKind::ProcessedReceipt, Caller::Scheduler).await.unwrap();
    assert_eq!(early.parent_missing, 1);

    let notes = engine.run(JobKind::PaidPreInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(notes.inserted, 1);
    let note = dest.invoices().pop().unwrap();
    assert!((note.amounts.subtotal.dollar - 100.0).abs() < 1e-9);
    assert!((note.amounts.vat.bolivar - 640.0).abs() < 1e-6);

    let paid = engine.run(JobKind::ProcessedReceipt, Caller::Scheduler).await.unwrap();
    assert_eq!(paid.inserted, 1);
    let written = dest.receipts().pop().unwrap();
    assert_eq!(written.final_status(), Status::Procesado);
    assert_eq!(written.payment_account_id, 9);
    assert_eq!(written.info["payment_detail"][0]["monto"]["dolar"], 50.0);
}

// ============================================================================
// Concurrency and failures
// ============================================================================

#[tokio::test]
async fn test_inserts_respect_worker_limit() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    for day in 2..26 {
        let id = day.to_string();
        legacy.add_invoice(invoice(&id, &format!("{}0", id), day));
    }
    let dest = seeded(MemoryDestinationStore::new().with_insert_delay(Duration::from_millis(20)));

    let mut jobs = HashMap::new();
    jobs.insert(
        "sinc_factura_fiscal".to_string(),
        JobOverrides {
            workers: Some(3),
            ..Default::default()
        },
    );
    let engine = engine(&legacy, &dest, SyncConfig { jobs, ..config() });

    let summary = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(summary.inserted, 24);
    assert!(dest.max_in_flight() <= 3, "max in flight {}", dest.max_in_flight());
    assert!(dest.max_in_flight() > 1);
}

#[tokio::test]
async fn test_exchange_rates_insert_in_order_and_stop_at_failure() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    for (value, day) in [(36.0, 2), (36.5, 3), (37.0, 4)] {
        legacy.add_exchange_rate(LegacyExchangeRate {
            value,
            created_at: at(day, 8),
            created_by: None,
        });
    }
    let dest = Arc::new(MemoryDestinationStore::new().with_insert_delay(Duration::from_millis(2)));
    dest.fail_on(&at(2, 8).to_string());
    let engine = engine(&legacy, &dest, config());

    let first = engine.run(JobKind::ExchangeRate, Caller::Scheduler).await.unwrap();
    assert_eq!(first.inserted, 0);
    assert_eq!(first.failed, 1);
    assert_eq!(first.skipped, 2);
    assert!(dest.exchange_rates().is_empty());
    assert_eq!(dest.max_in_flight(), 1);

    dest.clear_fail_on(&at(2, 8).to_string());
    let second = engine.run(JobKind::ExchangeRate, Caller::Scheduler).await.unwrap();
    assert_eq!(second.inserted, 3);
    let migrated: Vec<NaiveDateTime> =
        dest.exchange_rates().into_iter().map(|r| r.created_at).collect();
    assert_eq!(migrated, vec![at(2, 8), at(3, 8), at(4, 8)]);
    assert!(dest.list_failures(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concatenated_blob_with_missing_field_is_fatal() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_invoice(invoice("1", "10", 3));
    legacy.set_line_item_blob("10", "100üü10üüüü1üü116üü116üü4640üü4640");
    let dest = seeded(MemoryDestinationStore::new());
    let config = SyncConfig {
        line_item_transfer: LineItemTransfer::Concatenated,
        ..config()
    };
    let engine = engine(&legacy, &dest, config);

    let result = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await;
    assert!(matches!(result, Err(Error::Decode(_))));
    assert!(dest.invoices().is_empty());
}

#[tokio::test]
async fn test_concatenated_blob_is_decoded() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_invoice(invoice("1", "10", 3));
    legacy.set_line_item_blob(
        "10",
        "100üü10üüüü1üü58üü58üü2320üü2320üüplan a||101üü10üüüü1üü58üü58üü2320üü2320üüplan b",
    );
    let dest = seeded(MemoryDestinationStore::new());
    let config = SyncConfig {
        line_item_transfer: LineItemTransfer::Concatenated,
        ..config()
    };
    let engine = engine(&legacy, &dest, config);

    let summary = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(summary.inserted, 1);
    let written = dest.invoices().pop().unwrap();
    assert_eq!(written.line_items.len(), 2);
    assert_eq!(written.line_items[1].description, "plan b");
}

#[tokio::test]
async fn test_failed_records_are_tracked_then_cleared() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_invoice(invoice("1", "10", 3));
    legacy.add_invoice(invoice("2", "20", 9));
    let dest = seeded(MemoryDestinationStore::new());
    dest.fail_on("2");
    let engine = engine(&legacy, &dest, config());

    let first = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(first.inserted, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.failures[0].legacy_key, "2");

    let tracked = dest
        .list_failures(Some(JobKind::FiscalInvoice), 10)
        .await
        .unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].attempts, 1);

    dest.clear_fail_on("2");
    let second = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(second.inserted, 1);
    assert!(dest.list_failures(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_earlier_failed_record_is_retried_after_watermark_passes_it() {
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.add_invoice(invoice("1", "10", 3));
    legacy.add_invoice(invoice("2", "20", 9));
    let dest = seeded(MemoryDestinationStore::new());
    dest.fail_on("1");
    let engine = engine(&legacy, &dest, config());

    let first = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(first.inserted, 1);
    assert_eq!(first.failed, 1);
    let tracked = dest
        .list_failures(Some(JobKind::FiscalInvoice), 10)
        .await
        .unwrap();
    assert_eq!(tracked[0].legacy_key, "1");
    assert_eq!(tracked[0].record_at, at(3, 10));

    dest.clear_fail_on("1");
    let second = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(second.window.start, at(9, 10));
    assert_eq!(second.extracted, 2);
    assert_eq!(second.inserted, 1);
    assert_eq!(second.already_migrated, 1);
    assert_eq!(dest.invoices().len(), 2);
    assert!(dest.list_failures(None, 10).await.unwrap().is_empty());

    let third = engine.run(JobKind::FiscalInvoice, Caller::Scheduler).await.unwrap();
    assert_eq!(third.extracted, 1);
    assert_eq!(third.inserted, 0);
}
