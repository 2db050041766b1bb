//! Line-item decoder
//!
//! Turns raw legacy line items into priced [`LineItem`]s. Raw items come
//! either as typed child rows or, in concatenated transfer mode, from a
//! `GROUP_CONCAT` blob: entries joined by `||`, nine fields per entry joined
//! by `üü`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::inserter::timed;
use super::reconcile::VAT_DIVISOR;
use crate::error::{DecodeError, Error, RecordError};
use crate::models::{LineItem, Money, RawLineItem};
use crate::store::DestinationStore;

pub const ENTRY_SEPARATOR: &str = "||";
pub const FIELD_SEPARATOR: &str = "üü";
pub const FIELD_COUNT: usize = 9;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("html tag regex is valid"));

/// How the numeric legs of a raw item become dual-currency prices
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pricing {
    /// Legs 1 and 2 already hold dollar and bolivar amounts
    DualLeg,
    /// Leg 1 is a VAT-inclusive dollar amount; bolivar comes from `rate`
    SingleLeg { rate: f64 },
}

/// Split a concatenated blob into raw items.
///
/// An empty blob is a parent without lines. Any entry without exactly nine
/// fields fails the whole blob.
pub fn parse_concatenated(blob: &str) -> Result<Vec<RawLineItem>, DecodeError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }

    blob.split(ENTRY_SEPARATOR)
        .enumerate()
        .map(|(index, entry)| {
            let fields: Vec<&str> = entry.split(FIELD_SEPARATOR).collect();
            match fields.as_slice() {
                [child, parent, subscription, qty, unit1, total1, unit2, total2, description] => {
                    Ok(RawLineItem {
                        child_id: child.to_string(),
                        parent_id: parent.to_string(),
                        subscription_key: Some(subscription.to_string())
                            .filter(|s| !s.is_empty()),
                        quantity: qty.to_string(),
                        unit_leg1: unit1.to_string(),
                        total_leg1: total1.to_string(),
                        unit_leg2: unit2.to_string(),
                        total_leg2: total2.to_string(),
                        description: description.to_string(),
                    })
                }
                _ => Err(DecodeError::FieldCount {
                    index,
                    found: fields.len(),
                    expected: FIELD_COUNT,
                    entry: entry.to_string(),
                }),
            }
        })
        .collect()
}

/// Parse the blob of one extracted parent row; malformed blobs are fatal
pub fn parse_parent_blob(parent: &str, blob: Option<&str>) -> crate::Result<Vec<RawLineItem>> {
    parse_concatenated(blob.unwrap_or_default()).map_err(|e| {
        log::error!("malformed line item blob for parent {}: {}", parent, e);
        Error::Decode(DecodeError::Parent {
            parent: parent.to_string(),
            source: Box::new(e),
        })
    })
}

/// Strip HTML tags, unescape entities and replace double quotes with spaces
pub fn sanitize_description(raw: &str) -> String {
    let stripped = HTML_TAG.replace_all(raw, "");
    html_escape::decode_html_entities(&stripped).replace('"', " ")
}

fn parse_leg(field: &'static str, value: &str) -> Result<f64, RecordError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RecordError::parse(field, value))
}

/// Quantity, unit price and total price of one raw item
pub fn price_item(raw: &RawLineItem, pricing: Pricing) -> Result<(f64, Money, Money), RecordError> {
    let quantity = parse_leg("qty", &raw.quantity)?;
    let unit = parse_leg("price_unit", &raw.unit_leg1)?;
    let total = parse_leg("price_tot", &raw.total_leg1)?;

    match pricing {
        Pricing::DualLeg => {
            let unit_bs = parse_leg("price_unit_bs", &raw.unit_leg2)?;
            let total_bs = parse_leg("price_tot_bs", &raw.total_leg2)?;
            Ok((quantity, Money::new(unit, unit_bs), Money::new(total, total_bs)))
        }
        Pricing::SingleLeg { rate } => {
            let unit = unit / VAT_DIVISOR;
            let total = total / VAT_DIVISOR;
            Ok((
                quantity,
                Money::new(unit, unit * rate),
                Money::new(total, total * rate),
            ))
        }
    }
}

/// Decode every raw item of one record. The first failure fails the record.
pub async fn decode(
    raw: &[RawLineItem],
    pricing: Pricing,
    destination: &dyn DestinationStore,
    write_timeout: Duration,
) -> Result<Vec<LineItem>, RecordError> {
    let mut items = Vec::with_capacity(raw.len());

    for item in raw {
        let subscription = match item.subscription_key.as_deref() {
            Some(key) if !key.is_empty() => {
                timed(write_timeout, destination.subscription(key)).await?
            }
            _ => None,
        };

        let (quantity, unit_price, total_price) = price_item(item, pricing)?;

        items.push(LineItem {
            child_id: item.child_id.clone(),
            parent_id: item.parent_id.clone(),
            quantity,
            unit_price,
            total_price,
            description: sanitize_description(&item.description),
            subscription,
        });
    }

    Ok(items)
}
