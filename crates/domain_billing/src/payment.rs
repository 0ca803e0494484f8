//! Payments and refunds
//!
//! Payments are immutable once recorded. Refunds hang off a payment and go
//! `Pending → Succeeded | Failed`; only the payment gateway decides which.
//!
//! The refund ceiling (pending plus succeeded refunds never exceed the
//! payment) is checked and reserved under the payment's entry lock, so
//! concurrent partial refunds of one payment cannot jointly overshoot it.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use core_kernel::{InstallmentId, InvoiceId, Money, OrgId, PaymentId, RefundId};

use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceStore};

/// A recorded payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub org_id: OrgId,
    pub invoice_id: InvoiceId,
    /// Installment the payment was made against, if any
    pub installment_id: Option<InstallmentId>,
    pub amount: Money,
    /// Payment channel, e.g. "card" or "bank_transfer"
    pub provider: String,
    /// Reference assigned by the gateway
    pub gateway_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Refund status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
}

impl RefundStatus {
    /// Whether the refund counts against the payment's ceiling
    pub fn holds_ceiling(&self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Succeeded)
    }
}

/// A refund against a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub org_id: OrgId,
    pub payment_id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Money,
    pub status: RefundStatus,
    pub reason: Option<String>,
    pub gateway_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Request to record a payment
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub org_id: OrgId,
    pub invoice_id: InvoiceId,
    pub installment_id: Option<InstallmentId>,
    pub amount: Money,
    pub provider: String,
    pub gateway_reference: Option<String>,
}

#[derive(Debug)]
struct PaymentAccount {
    payment: Payment,
    refunds: Vec<Refund>,
}

impl PaymentAccount {
    fn refundable(&self) -> BillingResult<Money> {
        let committed = Money::sum(
            self.refunds
                .iter()
                .filter(|r| r.status.holds_ceiling())
                .map(|r| r.amount),
        )?;
        Ok(self.payment.amount.checked_sub(committed)?)
    }
}

/// Records payments and enforces refund ceilings
#[derive(Debug, Default)]
pub struct PaymentRecorder {
    accounts: DashMap<PaymentId, PaymentAccount>,
    refund_index: DashMap<RefundId, PaymentId>,
}

impl PaymentRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payment and applies it to the invoice's running total
    ///
    /// # Errors
    ///
    /// Fails without recording anything if the invoice rejects the payment
    /// (unknown, void, already paid, or overpaid)
    pub fn record_payment(
        &self,
        invoices: &InvoiceStore,
        request: NewPayment,
        now: DateTime<Utc>,
    ) -> BillingResult<(Payment, Invoice)> {
        let (payment, invoice, ()) = self.record_payment_with(invoices, request, now, || Ok(()))?;
        Ok((payment, invoice))
    }

    /// Like [`record_payment`](Self::record_payment), but runs `alongside`
    /// while the invoice is locked. If `alongside` fails the invoice is left
    /// unchanged and no payment is recorded.
    pub fn record_payment_with<T, F>(
        &self,
        invoices: &InvoiceStore,
        request: NewPayment,
        now: DateTime<Utc>,
        alongside: F,
    ) -> BillingResult<(Payment, Invoice, T)>
    where
        F: FnOnce() -> BillingResult<T>,
    {
        if request.provider.trim().is_empty() {
            return Err(BillingError::validation("provider must not be empty"));
        }

        let (invoice, extra) = invoices.update(request.org_id, request.invoice_id, |invoice| {
            invoice.apply_payment(request.amount, now)?;
            alongside()
        })?;

        let payment = Payment {
            id: PaymentId::new_v7(),
            org_id: request.org_id,
            invoice_id: request.invoice_id,
            installment_id: request.installment_id,
            amount: request.amount,
            provider: request.provider,
            gateway_reference: request.gateway_reference,
            created_at: now,
        };
        self.accounts.insert(
            payment.id,
            PaymentAccount {
                payment: payment.clone(),
                refunds: Vec::new(),
            },
        );

        info!(
            org_id = %payment.org_id,
            invoice_id = %payment.invoice_id,
            payment_id = %payment.id,
            amount = payment.amount.minor(),
            provider = %payment.provider,
            invoice_status = ?invoice.status,
            "Payment recorded"
        );
        Ok((payment, invoice, extra))
    }

    /// Reserves a pending refund against a payment.
    ///
    /// Without an amount the whole remaining refundable amount is refunded.
    ///
    /// # Errors
    ///
    /// - `PaymentNotFound` if the payment is unknown in the organisation
    /// - Validation for a non-positive explicit amount
    /// - `ExceedsRefundable` if the amount is more than what remains
    pub fn issue_refund(
        &self,
        org_id: OrgId,
        payment_id: PaymentId,
        amount: Option<Money>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> BillingResult<Refund> {
        if let Some(requested) = amount {
            if !requested.is_positive() {
                return Err(BillingError::validation(format!(
                    "Refund amount must be positive, got {}",
                    requested
                )));
            }
        }

        let mut account = self
            .accounts
            .get_mut(&payment_id)
            .filter(|account| account.payment.org_id == org_id)
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        let refundable = account.refundable()?;
        let requested = amount.unwrap_or(refundable);
        if requested.is_zero() || requested > refundable {
            warn!(
                %org_id,
                %payment_id,
                requested = requested.minor(),
                refundable = refundable.minor(),
                "Refund exceeds refundable amount"
            );
            return Err(BillingError::ExceedsRefundable {
                payment_id,
                requested,
                refundable,
            });
        }

        let refund = Refund {
            id: RefundId::new_v7(),
            org_id,
            payment_id,
            invoice_id: account.payment.invoice_id,
            amount: requested,
            status: RefundStatus::Pending,
            reason,
            gateway_reference: None,
            created_at: now,
            settled_at: None,
        };
        account.refunds.push(refund.clone());
        self.refund_index.insert(refund.id, payment_id);

        info!(
            %org_id,
            %payment_id,
            refund_id = %refund.id,
            amount = refund.amount.minor(),
            "Refund pending"
        );
        Ok(refund)
    }

    /// Stores the gateway's reference for a submitted refund
    pub fn mark_submitted(
        &self,
        org_id: OrgId,
        refund_id: RefundId,
        gateway_reference: String,
    ) -> BillingResult<Refund> {
        self.with_refund(org_id, refund_id, |refund| {
            refund.gateway_reference = Some(gateway_reference);
            Ok(refund.clone())
        })
    }

    /// Records the gateway's verdict on a pending refund. A succeeded refund
    /// comes off the invoice's paid total; a failed one releases its share of
    /// the ceiling.
    ///
    /// # Errors
    ///
    /// - Validation if `outcome` is `Pending`
    /// - `RefundNotFound` if the refund is unknown in the organisation
    /// - `RefundAlreadySettled` if the refund is no longer pending
    pub fn settle_refund(
        &self,
        invoices: &InvoiceStore,
        org_id: OrgId,
        refund_id: RefundId,
        outcome: RefundStatus,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Refund> {
        if outcome == RefundStatus::Pending {
            return Err(BillingError::validation("Refund outcome must be succeeded or failed"));
        }

        let refund = self.with_refund(org_id, refund_id, |refund| {
            if refund.status != RefundStatus::Pending {
                return Err(BillingError::RefundAlreadySettled {
                    refund_id,
                    status: format!("{:?}", refund.status),
                });
            }
            if outcome == RefundStatus::Succeeded {
                let amount = refund.amount;
                invoices.update(org_id, refund.invoice_id, |invoice| {
                    invoice.apply_refund(amount, today, now)
                })?;
            }
            refund.status = outcome;
            refund.settled_at = Some(now);
            Ok(refund.clone())
        })?;

        info!(
            %org_id,
            %refund_id,
            payment_id = %refund.payment_id,
            amount = refund.amount.minor(),
            status = ?refund.status,
            "Refund settled"
        );
        Ok(refund)
    }

    /// Amount still refundable on a payment
    pub fn refundable_amount(&self, org_id: OrgId, payment_id: PaymentId) -> BillingResult<Money> {
        self.accounts
            .get(&payment_id)
            .filter(|account| account.payment.org_id == org_id)
            .ok_or(BillingError::PaymentNotFound(payment_id))?
            .refundable()
    }

    pub fn get_payment(&self, org_id: OrgId, payment_id: PaymentId) -> BillingResult<Payment> {
        self.accounts
            .get(&payment_id)
            .filter(|account| account.payment.org_id == org_id)
            .map(|account| account.payment.clone())
            .ok_or(BillingError::PaymentNotFound(payment_id))
    }

    pub fn get_refund(&self, org_id: OrgId, refund_id: RefundId) -> BillingResult<Refund> {
        self.with_refund(org_id, refund_id, |refund| Ok(refund.clone()))
    }

    pub fn refunds_for_payment(&self, org_id: OrgId, payment_id: PaymentId) -> BillingResult<Vec<Refund>> {
        self.accounts
            .get(&payment_id)
            .filter(|account| account.payment.org_id == org_id)
            .map(|account| account.refunds.clone())
            .ok_or(BillingError::PaymentNotFound(payment_id))
    }

    /// Payments on an invoice, oldest first
    pub fn payments_for_invoice(&self, org_id: OrgId, invoice_id: InvoiceId) -> Vec<Payment> {
        let mut payments: Vec<Payment> = self
            .accounts
            .iter()
            .filter(|account| account.payment.org_id == org_id && account.payment.invoice_id == invoice_id)
            .map(|account| account.payment.clone())
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        payments
    }

    // Runs `change` on a refund under its payment's entry lock.
    fn with_refund<T, F>(&self, org_id: OrgId, refund_id: RefundId, change: F) -> BillingResult<T>
    where
        F: FnOnce(&mut Refund) -> BillingResult<T>,
    {
        let payment_id = self
            .refund_index
            .get(&refund_id)
            .map(|entry| *entry.value())
            .ok_or(BillingError::RefundNotFound(refund_id))?;

        let mut account = self
            .accounts
            .get_mut(&payment_id)
            .filter(|account| account.payment.org_id == org_id)
            .ok_or(BillingError::RefundNotFound(refund_id))?;

        let refund = account
            .refunds
            .iter_mut()
            .find(|r| r.id == refund_id)
            .ok_or(BillingError::RefundNotFound(refund_id))?;

        change(refund)
    }
}
