//! Utility functions for billsync-core

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

/// Round `value` to `decimals` places, half away from zero
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Round to the 8 decimals the destination stores for amounts
pub fn round_to_8(value: f64) -> f64 {
    round_to(value, 8)
}

/// Synthetic invoice number for a pre-invoice.
///
/// First 10 characters of the URL-safe base64 SHA-256 of
/// `"{created_at_unix_nanos}-{client}-{pre_invoice_id}"`, with `created_at`
/// read as UTC.
pub fn pre_invoice_number(created_at: NaiveDateTime, client_id: &str, pre_invoice_id: i64) -> String {
    let nanos = created_at
        .and_utc()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| created_at.and_utc().timestamp().saturating_mul(1_000_000_000));
    let data = format!("{}-{}-{}", nanos, client_id, pre_invoice_id);
    let hash = Sha256::digest(data.as_bytes());
    let encoded = URL_SAFE.encode(hash);
    encoded.chars().take(10).collect()
}
