//! Invoices
//!
//! Invoice status machine:
//!
//! ```text
//!   Draft ──send──▶ Sent ──past due──▶ Overdue
//!     │              │                   │
//!     └──────────────┴──── paid in full ─┴──▶ Paid ──refund──▶ Sent/Overdue
//!     │              │                   │
//!     └──────────────┴──── void (unpaid) ┴──▶ Void
//! ```
//!
//! `Overdue` is a cached reading of [`is_past_due`]; `refresh_overdue` is the
//! only place it is written.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use core_kernel::{
    BillingRunId, CreditId, InvoiceId, InvoiceLineId, LessonId, Money, OrgId, StudentId,
};

use crate::error::{BillingError, BillingResult};
use crate::payer::PayerKey;
use crate::vat::{ChargeLine, InvoiceTotals};

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Produced by a billing run, not yet sent
    Draft,
    /// Sent to the payer
    Sent,
    /// Sent and past its due date
    Overdue,
    /// Paid in full
    Paid,
    /// Cancelled before any payment
    Void,
}

/// Returns true once `today` is after the due date
pub fn is_past_due(due_date: NaiveDate, today: NaiveDate) -> bool {
    today > due_date
}

/// One lesson billed to one payer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: InvoiceLineId,
    pub lesson_id: LessonId,
    /// Student whose attendance the line bills
    pub student_id: StudentId,
    pub description: String,
    /// Rate snapshotted when the line was created
    pub rate: Money,
    pub quantity: u32,
}

impl InvoiceLine {
    pub fn new(lesson_id: LessonId, student_id: StudentId, description: impl Into<String>, rate: Money) -> Self {
        Self {
            id: InvoiceLineId::new_v7(),
            lesson_id,
            student_id,
            description: description.into(),
            rate,
            quantity: 1,
        }
    }

    pub fn charge(&self) -> ChargeLine {
        ChargeLine::new(self.rate, self.quantity)
    }
}

/// An invoice addressed to one payer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub org_id: OrgId,
    /// Human-readable per-organisation number
    pub invoice_number: String,
    pub payer: PayerKey,
    pub billing_run_id: Option<BillingRunId>,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub line_items: Vec<InvoiceLine>,
    pub subtotal: Money,
    pub tax: Money,
    pub credit_offset: Money,
    pub total: Money,
    /// Running total of payments less succeeded refunds
    pub paid: Money,
    /// Credits redeemed to produce `credit_offset`
    pub applied_credit_ids: Vec<CreditId>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Creates a draft invoice from computed totals
    #[allow(clippy::too_many_arguments)]
    pub fn draft(
        org_id: OrgId,
        invoice_number: String,
        payer: PayerKey,
        billing_run_id: Option<BillingRunId>,
        issue_date: NaiveDate,
        due_date: NaiveDate,
        line_items: Vec<InvoiceLine>,
        totals: InvoiceTotals,
        applied_credit_ids: Vec<CreditId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InvoiceId::new_v7(),
            org_id,
            invoice_number,
            payer,
            billing_run_id,
            issue_date,
            due_date,
            line_items,
            subtotal: totals.subtotal,
            tax: totals.tax,
            credit_offset: totals.credit_offset,
            total: totals.total,
            paid: Money::ZERO,
            applied_credit_ids,
            status: InvoiceStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn lesson_ids(&self) -> Vec<LessonId> {
        let mut ids: Vec<LessonId> = Vec::with_capacity(self.line_items.len());
        for line in &self.line_items {
            if !ids.contains(&line.lesson_id) {
                ids.push(line.lesson_id);
            }
        }
        ids
    }

    pub fn balance_due(&self) -> Money {
        self.total.checked_sub(self.paid).unwrap_or(Money::ZERO).floor_zero()
    }

    /// Overdue as of `today`, independent of the cached status
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        matches!(self.status, InvoiceStatus::Sent | InvoiceStatus::Overdue)
            && is_past_due(self.due_date, today)
    }

    /// Marks the invoice as sent
    pub fn send(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(BillingError::invalid_transition("invoice", self.status, InvoiceStatus::Sent));
        }
        self.status = InvoiceStatus::Sent;
        self.updated_at = now;
        Ok(())
    }

    /// Adds a payment to the running total, settling the invoice once the
    /// total is covered
    ///
    /// # Errors
    ///
    /// - Validation for a non-positive amount
    /// - `InvalidStatusTransition` on paid or void invoices
    /// - `Overpayment` if the amount exceeds the balance due
    pub fn apply_payment(&mut self, amount: Money, now: DateTime<Utc>) -> BillingResult<()> {
        if !amount.is_positive() {
            return Err(BillingError::validation(format!(
                "Payment amount must be positive, got {}",
                amount
            )));
        }
        if matches!(self.status, InvoiceStatus::Paid | InvoiceStatus::Void) {
            return Err(BillingError::invalid_transition("invoice", self.status, InvoiceStatus::Paid));
        }
        let balance = self.balance_due();
        if amount > balance {
            return Err(BillingError::Overpayment {
                invoice_id: self.id,
                requested: amount,
                balance,
            });
        }

        self.paid = self.paid.checked_add(amount)?;
        if self.paid >= self.total {
            self.status = InvoiceStatus::Paid;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Takes a succeeded refund off the running total. A paid invoice
    /// reopens as sent, or overdue if past due.
    pub fn apply_refund(&mut self, amount: Money, today: NaiveDate, now: DateTime<Utc>) -> BillingResult<()> {
        if amount > self.paid {
            return Err(BillingError::invariant(format!(
                "Refund {} exceeds paid {} on invoice {}",
                amount, self.paid, self.id
            )));
        }
        self.paid = self.paid.checked_sub(amount)?;
        if self.status == InvoiceStatus::Paid && self.paid < self.total {
            self.status = if is_past_due(self.due_date, today) {
                InvoiceStatus::Overdue
            } else {
                InvoiceStatus::Sent
            };
        }
        self.updated_at = now;
        Ok(())
    }

    /// Voids an unpaid invoice
    pub fn void(&mut self, now: DateTime<Utc>) -> BillingResult<()> {
        if matches!(self.status, InvoiceStatus::Paid | InvoiceStatus::Void) || self.paid.is_positive() {
            return Err(BillingError::invalid_transition("invoice", self.status, InvoiceStatus::Void));
        }
        self.status = InvoiceStatus::Void;
        self.updated_at = now;
        Ok(())
    }

    /// Refreshes the cached overdue status. Returns true if it changed.
    pub fn refresh_overdue(&mut self, today: NaiveDate, now: DateTime<Utc>) -> bool {
        if self.status == InvoiceStatus::Sent && is_past_due(self.due_date, today) {
            self.status = InvoiceStatus::Overdue;
            self.updated_at = now;
            return true;
        }
        false
    }

    /// Verifies the stored figures against the lines
    pub fn check_totals(&self) -> BillingResult<()> {
        let lines = self
            .line_items
            .iter()
            .map(|line| line.charge().amount())
            .collect::<BillingResult<Vec<_>>>()?;
        let subtotal = Money::sum(lines)?;
        let expected_total = self
            .subtotal
            .checked_add(self.tax)?
            .checked_sub(self.credit_offset)?
            .floor_zero();

        if subtotal != self.subtotal || expected_total != self.total {
            return Err(BillingError::invariant(format!(
                "Invoice {} totals inconsistent: lines {} subtotal {} tax {} offset {} total {}",
                self.id, subtotal, self.subtotal, self.tax, self.credit_offset, self.total
            )));
        }
        Ok(())
    }
}

/// Invoice storage with per-organisation numbering
#[derive(Debug, Default)]
pub struct InvoiceStore {
    invoices: DashMap<InvoiceId, Invoice>,
    sequences: DashMap<OrgId, u64>,
}

impl InvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next invoice number for an organisation
    pub fn next_number(&self, org_id: OrgId) -> String {
        let mut sequence = self.sequences.entry(org_id).or_insert(0);
        *sequence += 1;
        format!("INV-{:06}", *sequence)
    }

    pub fn insert(&self, invoice: Invoice) {
        self.invoices.insert(invoice.id, invoice);
    }

    pub fn get(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        self.invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.org_id == org_id)
            .map(|invoice| invoice.value().clone())
            .ok_or(BillingError::InvoiceNotFound(invoice_id))
    }

    /// Applies a change under the invoice's entry lock. The change runs on a
    /// copy and is only stored if it succeeds.
    pub fn update<T, F>(&self, org_id: OrgId, invoice_id: InvoiceId, change: F) -> BillingResult<(Invoice, T)>
    where
        F: FnOnce(&mut Invoice) -> BillingResult<T>,
    {
        let mut entry = self
            .invoices
            .get_mut(&invoice_id)
            .filter(|invoice| invoice.org_id == org_id)
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        let mut updated = entry.value().clone();
        let result = change(&mut updated)?;
        *entry.value_mut() = updated.clone();
        Ok((updated, result))
    }

    /// Invoices of an organisation ordered by number, optionally by status
    pub fn list_for_org(&self, org_id: OrgId, status: Option<InvoiceStatus>) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .iter()
            .filter(|invoice| invoice.org_id == org_id)
            .filter(|invoice| status.map_or(true, |s| invoice.status == s))
            .map(|invoice| invoice.value().clone())
            .collect();
        invoices.sort_by(|a, b| a.invoice_number.cmp(&b.invoice_number));
        invoices
    }

    pub fn ids_for_org(&self, org_id: OrgId) -> Vec<InvoiceId> {
        self.invoices
            .iter()
            .filter(|invoice| invoice.org_id == org_id)
            .map(|invoice| *invoice.key())
            .collect()
    }
}
