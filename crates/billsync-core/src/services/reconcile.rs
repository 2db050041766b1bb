//! Currency reconciler
//!
//! Every monetary field written to the destination is a dollar/bolivar pair.
//! Entities stored in a single currency get the other leg derived here.

use crate::error::RecordError;
use crate::models::{InvoiceAmounts, Money, WithholdingKind};
use crate::utils::{round_to, round_to_8};

/// Legacy single-currency totals include 16% VAT
pub const VAT_DIVISOR: f64 = 1.16;
pub const VAT_RATE: f64 = 0.16;
pub const VAT_PCT: f64 = 16.0;

fn check(field: &str, money: Money) -> Result<(), RecordError> {
    if money.is_finite() {
        Ok(())
    } else {
        Err(RecordError::Reconcile(format!(
            "{} is not a finite amount: {:?}",
            field, money
        )))
    }
}

fn check_rate(rate: f64) -> Result<(), RecordError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(RecordError::Reconcile(format!(
            "exchange rate must be positive, got {}",
            rate
        )))
    }
}

/// Passthrough for entities that already carry both legs
pub fn dual_leg(amounts: &InvoiceAmounts) -> Result<InvoiceAmounts, RecordError> {
    check("subtotal", amounts.subtotal)?;
    check("discount", amounts.discount)?;
    check("base", amounts.base)?;
    check("vat", amounts.vat)?;
    check("igtf_base", amounts.igtf_base)?;
    check("igtf", amounts.igtf)?;
    check("total", amounts.total)?;
    Ok(*amounts)
}

/// Derive a pre-invoice's amounts from its VAT-inclusive dollar total and the
/// rate in force when it was created.
pub fn pre_invoice(total_dollar: f64, rate: f64) -> Result<InvoiceAmounts, RecordError> {
    check_rate(rate)?;
    let total = Money::new(total_dollar, total_dollar * rate);
    check("total", total)?;

    let subtotal = Money::new(total.dollar / VAT_DIVISOR, total.bolivar / VAT_DIVISOR);
    let base = subtotal;
    let vat = Money::new(base.dollar * VAT_RATE, base.bolivar * VAT_RATE);

    Ok(InvoiceAmounts {
        subtotal,
        discount_pct: 0.0,
        discount: Money::ZERO,
        base,
        vat_pct: VAT_PCT,
        vat,
        igtf_pct: 0.0,
        igtf_base: Money::ZERO,
        igtf: Money::ZERO,
        total,
    })
}

/// Withheld amount, taxable base and percentage of a withholding voucher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WithholdingAmounts {
    pub withheld: Money,
    pub base: Money,
    pub pct: f64,
}

/// Withholdings are stored in bolivars; dollar legs use the invoice's rate.
/// ISLR and municipal vouchers withhold over the taxable base, VAT vouchers
/// over the VAT amount.
pub fn withholding(
    kind: WithholdingKind,
    withheld_bolivar: f64,
    base_bolivar: f64,
    vat_bolivar: f64,
    invoice_rate: f64,
) -> Result<WithholdingAmounts, RecordError> {
    check_rate(invoice_rate)?;

    let base_bolivar = match kind {
        WithholdingKind::Islr | WithholdingKind::Im => base_bolivar,
        WithholdingKind::Iva => vat_bolivar,
    };
    if base_bolivar == 0.0 {
        return Err(RecordError::Reconcile("taxable base is zero".to_string()));
    }

    let withheld = Money::new(withheld_bolivar / invoice_rate, withheld_bolivar);
    let base = Money::new(base_bolivar / invoice_rate, base_bolivar);
    check("withheld", withheld)?;
    check("base", base)?;

    Ok(WithholdingAmounts {
        withheld,
        base,
        pct: round_to(withheld_bolivar * 100.0 / base_bolivar, 2),
    })
}

/// Validate a single dual-currency amount
pub fn finite(field: &str, money: Money) -> Result<Money, RecordError> {
    check(field, money)?;
    Ok(money)
}

/// Receipt allocation amounts, rounded to 8 decimals
pub fn allocation(dollar: f64, rate: f64) -> Money {
    Money::new(round_to_8(dollar), round_to_8(dollar * rate))
}
