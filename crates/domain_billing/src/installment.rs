//! Installment plans
//!
//! A plan splits one invoice's total into a dated schedule. The amounts come
//! from `Money::split`, which puts the integer-division remainder on the last
//! installment, so the schedule always sums to the invoice total.

use chrono::{DateTime, Months, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use core_kernel::{temporal, InstallmentId, InstallmentPlanId, InvoiceId, Money, OrgId};

use crate::error::{BillingError, BillingResult};
use crate::invoice::{is_past_due, Invoice, InvoiceStatus};

/// Installment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    Pending,
    Paid,
    Overdue,
}

/// Spacing between due dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentFrequency {
    Weekly,
    Fortnightly,
    #[default]
    Monthly,
}

impl InstallmentFrequency {
    /// Due date of the installment at zero-based `index`
    pub fn due_date(&self, first: NaiveDate, index: u32) -> BillingResult<NaiveDate> {
        let due = match self {
            InstallmentFrequency::Weekly => temporal::add_days(first, index.saturating_mul(7))?,
            InstallmentFrequency::Fortnightly => temporal::add_days(first, index.saturating_mul(14))?,
            InstallmentFrequency::Monthly => first.checked_add_months(Months::new(index)).ok_or_else(|| {
                BillingError::validation(format!("{} + {} months is out of range", first, index))
            })?,
        };
        Ok(due)
    }
}

/// One scheduled payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub id: InstallmentId,
    /// 1-based position in the plan
    pub sequence_number: u32,
    pub amount: Money,
    pub due_date: NaiveDate,
    /// Cumulative amount recorded against this installment
    pub paid: Money,
    pub status: InstallmentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Pure overdue check
pub fn is_installment_overdue(installment: &Installment, today: NaiveDate) -> bool {
    installment.status != InstallmentStatus::Paid && is_past_due(installment.due_date, today)
}

/// A payment schedule for one invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallmentPlan {
    pub id: InstallmentPlanId,
    pub org_id: OrgId,
    pub invoice_id: InvoiceId,
    pub frequency: InstallmentFrequency,
    pub installments: Vec<Installment>,
    pub created_at: DateTime<Utc>,
}

impl InstallmentPlan {
    pub fn total(&self) -> BillingResult<Money> {
        Ok(Money::sum(self.installments.iter().map(|i| i.amount))?)
    }

    pub fn has_payments(&self) -> bool {
        self.installments.iter().any(|i| i.paid.is_positive())
    }

    pub fn installment(&self, installment_id: InstallmentId) -> Option<&Installment> {
        self.installments.iter().find(|i| i.id == installment_id)
    }
}

/// Parameters for a new plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub installment_count: u32,
    pub first_due_date: NaiveDate,
    #[serde(default)]
    pub frequency: InstallmentFrequency,
}

/// Keeps at most one plan per invoice
#[derive(Debug, Default)]
pub struct InstallmentPlanManager {
    plans: DashMap<InvoiceId, InstallmentPlan>,
    installment_index: DashMap<InstallmentId, InvoiceId>,
}

impl InstallmentPlanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits the invoice total into `installment_count` installments
    ///
    /// # Errors
    ///
    /// - Validation for a zero count or a paid/void invoice
    /// - `PlanAlreadyExists` if the invoice already carries a plan
    pub fn create_plan(
        &self,
        invoice: &Invoice,
        request: PlanRequest,
        now: DateTime<Utc>,
    ) -> BillingResult<InstallmentPlan> {
        if request.installment_count == 0 {
            return Err(BillingError::validation("installment_count must be at least 1"));
        }
        if matches!(invoice.status, InvoiceStatus::Paid | InvoiceStatus::Void) {
            return Err(BillingError::validation(format!(
                "Cannot attach a plan to a {:?} invoice",
                invoice.status
            )));
        }

        let amounts = invoice.total.split(request.installment_count)?;
        let installments = amounts
            .into_iter()
            .zip(0u32..)
            .map(|(amount, index)| {
                Ok(Installment {
                    id: InstallmentId::new_v7(),
                    sequence_number: index + 1,
                    amount,
                    due_date: request.frequency.due_date(request.first_due_date, index)?,
                    paid: Money::ZERO,
                    status: InstallmentStatus::Pending,
                    paid_at: None,
                })
            })
            .collect::<BillingResult<Vec<_>>>()?;

        let plan = InstallmentPlan {
            id: InstallmentPlanId::new_v7(),
            org_id: invoice.org_id,
            invoice_id: invoice.id,
            frequency: request.frequency,
            installments,
            created_at: now,
        };

        if plan.total()? != invoice.total {
            return Err(BillingError::invariant(format!(
                "Installments of plan {} sum to {} but invoice {} totals {}",
                plan.id,
                plan.total()?,
                invoice.id,
                invoice.total
            )));
        }

        match self.plans.entry(invoice.id) {
            Entry::Occupied(_) => {
                return Err(BillingError::PlanAlreadyExists {
                    invoice_id: invoice.id,
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(plan.clone());
            }
        }
        for installment in &plan.installments {
            self.installment_index.insert(installment.id, invoice.id);
        }

        info!(
            org_id = %plan.org_id,
            invoice_id = %plan.invoice_id,
            plan_id = %plan.id,
            installments = plan.installments.len(),
            "Installment plan created"
        );
        Ok(plan)
    }

    /// Records money against an installment. It becomes paid once the
    /// cumulative amount reaches its amount; partial payments leave it open.
    pub fn record_payment(
        &self,
        org_id: OrgId,
        installment_id: InstallmentId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> BillingResult<Installment> {
        if !amount.is_positive() {
            return Err(BillingError::validation(format!(
                "Installment payment must be positive, got {}",
                amount
            )));
        }

        let invoice_id = self.invoice_for_installment(org_id, installment_id)?;
        let mut plan = self
            .plans
            .get_mut(&invoice_id)
            .filter(|plan| plan.org_id == org_id)
            .ok_or(BillingError::InstallmentNotFound(installment_id))?;

        let installment = plan
            .installments
            .iter_mut()
            .find(|i| i.id == installment_id)
            .ok_or(BillingError::InstallmentNotFound(installment_id))?;

        if installment.status == InstallmentStatus::Paid {
            return Err(BillingError::InstallmentAlreadyPaid(installment_id));
        }

        installment.paid = installment.paid.checked_add(amount)?;
        if installment.paid >= installment.amount {
            installment.status = InstallmentStatus::Paid;
            installment.paid_at = Some(now);
        }

        debug!(
            %org_id,
            %installment_id,
            paid = installment.paid.minor(),
            status = ?installment.status,
            "Installment payment applied"
        );
        Ok(installment.clone())
    }

    /// Checks that an installment can take a payment, without changing it
    pub fn ensure_payable(&self, org_id: OrgId, installment_id: InstallmentId) -> BillingResult<InvoiceId> {
        let invoice_id = self.invoice_for_installment(org_id, installment_id)?;
        let plan = self.plan_for(org_id, invoice_id)?;
        match plan.installment(installment_id) {
            None => Err(BillingError::InstallmentNotFound(installment_id)),
            Some(i) if i.status == InstallmentStatus::Paid => {
                Err(BillingError::InstallmentAlreadyPaid(installment_id))
            }
            Some(_) => Ok(invoice_id),
        }
    }

    /// Moves pending installments past their due date to overdue. Idempotent.
    pub fn mark_overdue(&self, org_id: OrgId, today: NaiveDate) -> Vec<(InvoiceId, Installment)> {
        let mut changed = Vec::new();
        for mut plan in self.plans.iter_mut() {
            if plan.org_id != org_id {
                continue;
            }
            let invoice_id = plan.invoice_id;
            for installment in plan.installments.iter_mut() {
                if installment.status == InstallmentStatus::Pending
                    && is_installment_overdue(installment, today)
                {
                    installment.status = InstallmentStatus::Overdue;
                    changed.push((invoice_id, installment.clone()));
                }
            }
        }
        changed
    }

    /// Marks every open installment of the invoice's plan paid in full. Used
    /// once the invoice itself is settled. Returns the installments changed.
    pub fn close_plan(&self, org_id: OrgId, invoice_id: InvoiceId, now: DateTime<Utc>) -> Vec<Installment> {
        let Some(mut plan) = self.plans.get_mut(&invoice_id).filter(|plan| plan.org_id == org_id) else {
            return Vec::new();
        };

        let mut closed = Vec::new();
        for installment in plan.installments.iter_mut() {
            if installment.status != InstallmentStatus::Paid {
                installment.paid = installment.amount;
                installment.status = InstallmentStatus::Paid;
                installment.paid_at = Some(now);
                closed.push(installment.clone());
            }
        }
        closed
    }

    /// Removes a plan that has not received any payment
    ///
    /// # Errors
    ///
    /// - `PlanNotFound` if the invoice has no plan
    /// - `PlanHasPayments` if any installment has money recorded against it;
    ///   the plan is left untouched
    pub fn remove_plan(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<InstallmentPlan> {
        let removed = self
            .plans
            .remove_if(&invoice_id, |_, plan| plan.org_id == org_id && !plan.has_payments());

        let Some((_, plan)) = removed else {
            return match self.plans.get(&invoice_id) {
                Some(plan) if plan.org_id == org_id => Err(BillingError::PlanHasPayments { invoice_id }),
                _ => Err(BillingError::PlanNotFound(invoice_id)),
            };
        };

        for installment in &plan.installments {
            self.installment_index.remove(&installment.id);
        }
        info!(%org_id, %invoice_id, plan_id = %plan.id, "Installment plan removed");
        Ok(plan)
    }

    pub fn plan_for(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<InstallmentPlan> {
        self.plans
            .get(&invoice_id)
            .filter(|plan| plan.org_id == org_id)
            .map(|plan| plan.value().clone())
            .ok_or(BillingError::PlanNotFound(invoice_id))
    }

    pub fn invoice_for_installment(
        &self,
        org_id: OrgId,
        installment_id: InstallmentId,
    ) -> BillingResult<InvoiceId> {
        let invoice_id = self
            .installment_index
            .get(&installment_id)
            .map(|entry| *entry.value())
            .ok_or(BillingError::InstallmentNotFound(installment_id))?;

        match self.plans.get(&invoice_id) {
            Some(plan) if plan.org_id == org_id => Ok(invoice_id),
            _ => Err(BillingError::InstallmentNotFound(installment_id)),
        }
    }
}
