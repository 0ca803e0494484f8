//! Per-organisation billing configuration

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use core_kernel::{Percentage, Timezone};

use crate::error::{BillingError, BillingResult};
use crate::lesson::LessonStatus;
use crate::rates::RateCard;
use crate::vat::VatConfig;

/// Which lessons a billing run picks up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Bill lessons after they happen
    Delivered,
    /// Bill booked lessons in advance
    Upfront,
}

impl BillingMode {
    /// Returns true if a lesson in this status is billable under the mode.
    /// Cancelled lessons never are.
    pub fn bills(&self, status: LessonStatus) -> bool {
        match (self, status) {
            (_, LessonStatus::Cancelled) => false,
            (BillingMode::Delivered, LessonStatus::Completed) => true,
            (BillingMode::Delivered, LessonStatus::Scheduled) => false,
            (BillingMode::Upfront, _) => true,
        }
    }
}

/// What to do with a payer whose invoice total comes out at zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroValueInvoicePolicy {
    /// Keep the invoice for the audit trail
    #[default]
    Create,
    /// Skip the payer entirely for this run
    Suppress,
}

fn default_payment_terms_days() -> u32 {
    14
}

fn default_credit_expiry_days() -> Option<u32> {
    Some(90)
}

fn default_true() -> bool {
    true
}

/// Billing settings owned by the organisation configuration store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgBillingConfig {
    pub vat_enabled: bool,
    /// VAT rate in percent (20 for 20%)
    pub vat_rate_percent: Decimal,
    /// Minimum notice for a cancellation to earn a make-up credit
    pub cancellation_notice_hours: u32,
    pub billing_mode: BillingMode,
    #[serde(default = "default_payment_terms_days")]
    pub payment_terms_days: u32,
    /// `None` means credits never expire
    #[serde(default = "default_credit_expiry_days")]
    pub credit_expiry_days: Option<u32>,
    #[serde(default = "default_true")]
    pub apply_make_up_credits: bool,
    #[serde(default)]
    pub zero_value_invoices: ZeroValueInvoicePolicy,
    #[serde(default)]
    pub timezone: Timezone,
    #[serde(default)]
    pub rate_card: RateCard,
}

impl Default for OrgBillingConfig {
    fn default() -> Self {
        Self {
            vat_enabled: false,
            vat_rate_percent: Decimal::ZERO,
            cancellation_notice_hours: 24,
            billing_mode: BillingMode::Delivered,
            payment_terms_days: default_payment_terms_days(),
            credit_expiry_days: default_credit_expiry_days(),
            apply_make_up_credits: true,
            zero_value_invoices: ZeroValueInvoicePolicy::default(),
            timezone: Timezone::default(),
            rate_card: RateCard::default(),
        }
    }
}

impl OrgBillingConfig {
    pub fn with_vat(mut self, rate_percent: Decimal) -> Self {
        self.vat_enabled = true;
        self.vat_rate_percent = rate_percent;
        self
    }

    pub fn with_billing_mode(mut self, mode: BillingMode) -> Self {
        self.billing_mode = mode;
        self
    }

    pub fn with_rate_card(mut self, rate_card: RateCard) -> Self {
        self.rate_card = rate_card;
        self
    }

    pub fn with_notice_hours(mut self, hours: u32) -> Self {
        self.cancellation_notice_hours = hours;
        self
    }

    pub fn with_credit_expiry_days(mut self, days: Option<u32>) -> Self {
        self.credit_expiry_days = days;
        self
    }

    pub fn with_zero_value_invoices(mut self, policy: ZeroValueInvoicePolicy) -> Self {
        self.zero_value_invoices = policy;
        self
    }

    pub fn with_timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn without_make_up_credits(mut self) -> Self {
        self.apply_make_up_credits = false;
        self
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns a validation error for a VAT rate outside 0-100 or a
    /// negative rate on the rate card
    pub fn validate(&self) -> BillingResult<()> {
        self.vat_config()?;
        self.rate_card.validate()
    }

    /// VAT settings in calculator form
    pub fn vat_config(&self) -> BillingResult<VatConfig> {
        let rate = Percentage::new(self.vat_rate_percent).map_err(|e| {
            BillingError::validation(format!("vat_rate_percent: {}", e))
        })?;
        Ok(VatConfig {
            enabled: self.vat_enabled,
            rate,
        })
    }
}
