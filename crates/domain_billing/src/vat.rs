//! Invoice arithmetic
//!
//! Pure functions over integer minor units. No state, no I/O.

use serde::{Deserialize, Serialize};

use core_kernel::{Money, Percentage};

use crate::error::{BillingError, BillingResult};

/// Flat VAT settings for an organisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatConfig {
    pub enabled: bool,
    pub rate: Percentage,
}

impl VatConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            rate: Percentage::ZERO,
        }
    }

    pub fn enabled(rate: Percentage) -> Self {
        Self { enabled: true, rate }
    }
}

/// One priced line: `quantity` units at `rate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeLine {
    pub rate: Money,
    pub quantity: u32,
}

impl ChargeLine {
    pub fn new(rate: Money, quantity: u32) -> Self {
        Self { rate, quantity }
    }

    pub fn amount(&self) -> BillingResult<Money> {
        Ok(self.rate.checked_mul(i64::from(self.quantity))?)
    }
}

/// Computed invoice figures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal: Money,
    pub tax: Money,
    pub credit_offset: Money,
    pub total: Money,
}

impl InvoiceTotals {
    /// Subtotal plus tax, before any credit
    pub fn gross(&self) -> BillingResult<Money> {
        Ok(self.subtotal.checked_add(self.tax)?)
    }
}

/// Computes subtotal, tax and total for a set of lines.
///
/// `total = max(0, subtotal + tax - credit_offset)`. Credit beyond the gross
/// amount is dropped, never carried forward.
///
/// # Errors
///
/// Negative rates or a negative credit offset are rejected, as is overflow.
pub fn compute_invoice(
    lines: &[ChargeLine],
    vat: &VatConfig,
    credit_offset: Money,
) -> BillingResult<InvoiceTotals> {
    if credit_offset.is_negative() {
        return Err(BillingError::validation(format!(
            "Credit offset {} is negative",
            credit_offset
        )));
    }
    if let Some(line) = lines.iter().find(|l| l.rate.is_negative()) {
        return Err(BillingError::validation(format!("Line rate {} is negative", line.rate)));
    }

    let subtotal = Money::sum(
        lines
            .iter()
            .map(ChargeLine::amount)
            .collect::<BillingResult<Vec<_>>>()?,
    )?;

    let tax = if vat.enabled {
        vat.rate.apply_half_up(subtotal)?
    } else {
        Money::ZERO
    };

    let total = subtotal.checked_add(tax)?.checked_sub(credit_offset)?.floor_zero();

    Ok(InvoiceTotals {
        subtotal,
        tax,
        credit_offset,
        total,
    })
}
