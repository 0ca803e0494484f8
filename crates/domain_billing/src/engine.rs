//! Billing engine
//!
//! The entry point for every billing operation. It owns the ledgers and
//! stores, reaches collaborators through ports, and records notifications in
//! the outbox only after the change they describe has been stored.
//!
//! # Billing run
//!
//! ```text
//!  lessons_in_range ─▶ dedupe by id ─▶ mode filter ─▶ filter_unbilled
//!        ─▶ claim ─▶ group unbilled payers ─▶ price (credits, VAT) ─▶ per payer:
//!             redeem credits ─▶ store invoice ─▶ attach lessons ─▶ outbox
//!             (zero total under Suppress: waive lessons, no invoice)
//!        ─▶ release claims
//! ```
//!
//! A lesson claimed by a concurrent run is skipped and reported as
//! contested. Retrying a run skips every lesson a previous run billed to
//! all of its payers.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use core_kernel::{
    temporal, BillingRunId, Clock, CreditId, DateRange, InstallmentId, InvoiceId, LessonId, Money,
    OrgId, PaymentId, PortError, RefundId, StudentId, SystemClock,
};

use crate::builder::{select_billable, DraftInvoice, InvoiceBuilder};
use crate::config::{BillingMode, OrgBillingConfig, ZeroValueInvoicePolicy};
use crate::credit::{check_eligibility, CreditLedger, MakeUpCredit, NewCredit};
use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::installment::{Installment, InstallmentPlan, InstallmentPlanManager, PlanRequest};
use crate::invoice::{Invoice, InvoiceStatus, InvoiceStore};
use crate::lesson::Lesson;
use crate::ledger::BillingLedger;
use crate::outbox::{BillingEvent, DispatchReport, Outbox};
use crate::payer::{payers_for_lesson, PayerKey};
use crate::payment::{NewPayment, Payment, PaymentRecorder, Refund, RefundStatus};
use crate::ports::{ChargeRequest, LessonSource, Notifier, OrgConfigSource, PaymentGateway, RefundRequest};
use crate::vat::{compute_invoice, VatConfig};

/// Summary of one billing run
#[derive(Debug, Clone, Serialize)]
pub struct BillingRunReport {
    pub run_id: BillingRunId,
    pub org_id: OrgId,
    pub mode: BillingMode,
    pub range: DateRange,
    /// Invoices committed by this run
    pub invoices: Vec<Invoice>,
    /// Lessons skipped because an earlier run invoiced them
    pub already_billed: Vec<LessonId>,
    /// Lessons skipped because a concurrent run holds them
    pub contested: Vec<LessonId>,
    /// Lessons the mode does not bill
    pub not_billable: Vec<LessonId>,
    /// Payers skipped under the zero-value suppression policy
    pub suppressed_payers: Vec<PayerKey>,
}

/// Result of processing a cancellation
#[derive(Debug, Clone, Serialize)]
pub struct CancellationCredits {
    pub eligible: bool,
    pub issued: Vec<MakeUpCredit>,
    /// Students who already held a credit for this lesson
    pub already_issued: Vec<StudentId>,
}

/// A payment and its effect
#[derive(Debug, Clone, Serialize)]
pub struct RecordedPayment {
    pub payment: Payment,
    pub invoice: Invoice,
    pub installment: Option<Installment>,
}

/// What an overdue refresh changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct OverdueRefresh {
    pub invoices: Vec<Invoice>,
    pub installments: Vec<Installment>,
}

/// The lesson billing and credit-ledger engine
pub struct BillingEngine {
    lessons: Arc<dyn LessonSource>,
    configs: Arc<dyn OrgConfigSource>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    ledger: BillingLedger,
    credits: CreditLedger,
    invoices: InvoiceStore,
    plans: InstallmentPlanManager,
    payments: PaymentRecorder,
    outbox: Outbox,
}

impl BillingEngine {
    pub fn new(
        lessons: Arc<dyn LessonSource>,
        configs: Arc<dyn OrgConfigSource>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            lessons,
            configs,
            gateway,
            notifier,
            clock: Arc::new(SystemClock),
            ledger: BillingLedger::new(),
            credits: CreditLedger::new(),
            invoices: InvoiceStore::new(),
            plans: InstallmentPlanManager::new(),
            payments: PaymentRecorder::new(),
            outbox: Outbox::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &BillingLedger {
        &self.ledger
    }

    pub fn credit_ledger(&self) -> &CreditLedger {
        &self.credits
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Loads and validates an organisation's billing configuration
    pub async fn config(&self, org_id: OrgId) -> BillingResult<OrgBillingConfig> {
        let config = self.configs.billing_config(org_id).await.map_err(|e| match e {
            PortError::NotFound { .. } => BillingError::UnknownOrganisation(org_id),
            other => BillingError::Dependency(other),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn today(&self, config: &OrgBillingConfig) -> NaiveDate {
        config.timezone.local_date(self.now())
    }

    // ------------------------------------------------------------------
    // Billing runs
    // ------------------------------------------------------------------

    /// Bills every unbilled lesson in `range`. `mode` defaults to the
    /// organisation's configured mode.
    ///
    /// # Errors
    ///
    /// Validation and dependency failures before the claim step leave no
    /// trace. Once lessons are claimed, each payer's invoice commits as a
    /// unit and unused claims are always released.
    #[instrument(skip(self))]
    pub async fn run_billing(
        &self,
        org_id: OrgId,
        range: DateRange,
        mode: Option<BillingMode>,
    ) -> BillingResult<BillingRunReport> {
        let config = self.config(org_id).await?;
        let vat = config.vat_config()?;
        let mode = mode.unwrap_or(config.billing_mode);
        let run_id = BillingRunId::new_v7();
        let now = self.now();
        let today = self.today(&config);

        info!(%run_id, ?mode, start = %range.start, end = %range.end, "Billing run started");

        let mut seen: HashSet<LessonId> = HashSet::new();
        let mut duplicates = 0usize;
        let lessons: Vec<Lesson> = self
            .lessons
            .lessons_in_range(org_id, &range, &config.timezone)
            .await?
            .into_iter()
            .filter(|lesson| lesson.org_id == org_id)
            .filter(|lesson| {
                let first = seen.insert(lesson.id);
                if !first {
                    duplicates += 1;
                }
                first
            })
            .collect();
        if duplicates > 0 {
            warn!(%run_id, duplicates, "Lesson source returned duplicate lessons");
        }

        let (billable, not_billable) = select_billable(&lessons, mode);
        let unbilled: HashSet<LessonId> = self.ledger.filter_unbilled(org_id, &billable).into_iter().collect();
        let pending: Vec<LessonId> = billable
            .iter()
            .map(|l| l.id)
            .filter(|id| unbilled.contains(id))
            .collect();
        let mut already_billed: Vec<LessonId> = billable
            .iter()
            .map(|l| l.id)
            .filter(|id| !unbilled.contains(id))
            .collect();

        let claim = self.ledger.claim(org_id, run_id, &pending);
        if !claim.contested.is_empty() {
            warn!(%run_id, contested = claim.contested.len(), "Lessons held by a concurrent run were skipped");
        }

        let claimed_set: HashSet<LessonId> = claim.claimed.iter().copied().collect();
        let claimed: Vec<Lesson> = billable
            .into_iter()
            .filter(|l| claimed_set.contains(&l.id))
            .collect();
        let billed_payers = self.ledger.billed_payers(org_id, &claim.claimed);
        already_billed.extend(claimed.iter().filter_map(|lesson| {
            payers_for_lesson(lesson)
                .iter()
                .all(|share| billed_payers.contains(&(lesson.id, share.payer)))
                .then_some(lesson.id)
        }));

        let committed = self.commit_run(org_id, run_id, &config, &vat, &claimed, &billed_payers, today, now);
        let released = self.ledger.release_claims(org_id, run_id, &claim.claimed);
        let (invoices, suppressed_payers) = committed?;

        info!(
            %run_id,
            invoices = invoices.len(),
            already_billed = already_billed.len(),
            contested = claim.contested.len(),
            not_billable = not_billable.len(),
            suppressed = suppressed_payers.len(),
            released,
            "Billing run finished"
        );

        Ok(BillingRunReport {
            run_id,
            org_id,
            mode,
            range,
            invoices,
            already_billed,
            contested: claim.contested,
            not_billable,
            suppressed_payers,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_run(
        &self,
        org_id: OrgId,
        run_id: BillingRunId,
        config: &OrgBillingConfig,
        vat: &VatConfig,
        claimed: &[Lesson],
        billed_payers: &HashSet<(LessonId, PayerKey)>,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<(Vec<Invoice>, Vec<PayerKey>)> {
        let drafts = InvoiceBuilder::new(&self.ledger, &self.credits)
            .draft_unbilled(org_id, claimed, billed_payers, config, now)?;

        let mut invoices = Vec::new();
        let mut suppressed = Vec::new();
        for draft in drafts {
            match self.commit_draft(org_id, run_id, config, vat, draft, today, now)? {
                Committed::Invoice(invoice) => invoices.push(invoice),
                Committed::Suppressed(payer) => suppressed.push(payer),
            }
        }
        Ok((invoices, suppressed))
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_draft(
        &self,
        org_id: OrgId,
        run_id: BillingRunId,
        config: &OrgBillingConfig,
        vat: &VatConfig,
        draft: DraftInvoice,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> BillingResult<Committed> {
        let DraftInvoice {
            bucket,
            mut totals,
            credits,
        } = draft;
        let due_date = temporal::add_days(today, config.payment_terms_days)?;

        let mut applied: Vec<CreditId> = Vec::with_capacity(credits.len());
        let mut applied_value = Money::ZERO;
        for credit in &credits {
            let Some(&target) = bucket.covered.get(&credit.student_id) else {
                continue;
            };
            match self.credits.redeem_credit(org_id, credit.id, target, now) {
                Ok(redeemed) => {
                    applied.push(redeemed.id);
                    applied_value = applied_value.checked_add(redeemed.credit_value)?;
                }
                Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {
                    warn!(%run_id, credit_id = %credit.id, error = %e, "Credit dropped from invoice");
                }
                Err(e) => return Err(e),
            }
        }
        if applied_value != totals.credit_offset {
            totals = compute_invoice(&bucket.charges(), vat, applied_value)?;
        }

        if totals.total.is_zero() && config.zero_value_invoices == ZeroValueInvoicePolicy::Suppress {
            for line in &bucket.lines {
                self.ledger.waive(org_id, run_id, line.lesson_id, bucket.payer)?;
            }
            info!(
                %run_id,
                payer = %bucket.payer,
                lessons = bucket.lines.len(),
                credits = applied.len(),
                "Zero-value invoice suppressed"
            );
            return Ok(Committed::Suppressed(bucket.payer));
        }

        let invoice = Invoice::draft(
            org_id,
            self.invoices.next_number(org_id),
            bucket.payer,
            Some(run_id),
            today,
            due_date,
            bucket.lines,
            totals,
            applied,
            now,
        );
        invoice.check_totals()?;

        self.invoices.insert(invoice.clone());
        for lesson_id in invoice.lesson_ids() {
            self.ledger.attach(org_id, run_id, lesson_id, invoice.payer, invoice.id)?;
        }

        self.outbox.record(
            org_id,
            BillingEvent::InvoiceCreated {
                invoice_id: invoice.id,
                invoice_number: invoice.invoice_number.clone(),
                payer: invoice.payer,
                total: invoice.total,
            },
            now,
        );
        info!(
            %org_id,
            %run_id,
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            payer = %invoice.payer,
            lines = invoice.line_items.len(),
            subtotal = invoice.subtotal.minor(),
            tax = invoice.tax.minor(),
            credit_offset = invoice.credit_offset.minor(),
            total = invoice.total.minor(),
            "Invoice created"
        );
        Ok(Committed::Invoice(invoice))
    }

    // ------------------------------------------------------------------
    // Invoices
    // ------------------------------------------------------------------

    pub fn get_invoice(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        self.invoices.get(org_id, invoice_id)
    }

    pub fn list_invoices(&self, org_id: OrgId, status: Option<InvoiceStatus>) -> Vec<Invoice> {
        self.invoices.list_for_org(org_id, status)
    }

    pub fn send_invoice(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let now = self.now();
        let (invoice, ()) = self.invoices.update(org_id, invoice_id, |invoice| invoice.send(now))?;
        info!(%org_id, %invoice_id, "Invoice sent");
        Ok(invoice)
    }

    /// Voids an unpaid invoice and frees its lessons for billing again. An
    /// unpaid installment plan goes with it. Redeemed credits stay redeemed.
    pub fn void_invoice(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<Invoice> {
        let now = self.now();
        let (invoice, ()) = self.invoices.update(org_id, invoice_id, |invoice| invoice.void(now))?;

        for lesson_id in invoice.lesson_ids() {
            self.ledger.detach(org_id, lesson_id, invoice.id);
        }
        match self.plans.remove_plan(org_id, invoice_id) {
            Ok(_) | Err(BillingError::PlanNotFound(_)) => {}
            Err(e) => warn!(%org_id, %invoice_id, error = %e, "Installment plan kept on void invoice"),
        }

        info!(%org_id, %invoice_id, lessons = invoice.line_items.len(), "Invoice voided");
        Ok(invoice)
    }

    /// Refreshes the cached overdue status of invoices and installments
    pub async fn refresh_overdue(&self, org_id: OrgId) -> BillingResult<OverdueRefresh> {
        let config = self.config(org_id).await?;
        let today = self.today(&config);
        let now = self.now();
        let mut refresh = OverdueRefresh::default();

        for invoice_id in self.invoices.ids_for_org(org_id) {
            let (invoice, changed) = self
                .invoices
                .update(org_id, invoice_id, |invoice| Ok(invoice.refresh_overdue(today, now)))?;
            if changed {
                self.outbox.record(
                    org_id,
                    BillingEvent::InvoiceOverdue {
                        invoice_id,
                        invoice_number: invoice.invoice_number.clone(),
                        payer: invoice.payer,
                        balance_due: invoice.balance_due(),
                        due_date: invoice.due_date,
                    },
                    now,
                );
                refresh.invoices.push(invoice);
            }
        }

        for (invoice_id, installment) in self.plans.mark_overdue(org_id, today) {
            self.outbox.record(
                org_id,
                BillingEvent::InstallmentOverdue {
                    invoice_id,
                    installment_id: installment.id,
                    sequence_number: installment.sequence_number,
                    amount: installment.amount,
                    due_date: installment.due_date,
                },
                now,
            );
            refresh.installments.push(installment);
        }

        info!(
            %org_id,
            %today,
            invoices = refresh.invoices.len(),
            installments = refresh.installments.len(),
            "Overdue statuses refreshed"
        );
        Ok(refresh)
    }

    // ------------------------------------------------------------------
    // Make-up credits
    // ------------------------------------------------------------------

    /// Issues a credit directly. `expires_at: None` means it never expires.
    pub async fn issue_credit(
        &self,
        org_id: OrgId,
        student_id: StudentId,
        issued_for_lesson_id: Option<LessonId>,
        value: Money,
        expires_at: Option<DateTime<Utc>>,
    ) -> BillingResult<MakeUpCredit> {
        self.config(org_id).await?;
        let now = self.now();
        let credit = self.credits.issue_credit(
            NewCredit {
                org_id,
                student_id,
                issued_for_lesson_id,
                value,
                expires_at,
            },
            now,
        )?;
        self.record_credit_issued(&credit, now);
        Ok(credit)
    }

    /// Issues one credit per participant if the cancellation gave enough
    /// notice. `value` defaults to each student's rate.
    ///
    /// Students already credited for the lesson are reported, not failed,
    /// unless nobody new was credited.
    pub async fn issue_credit_for_cancellation(
        &self,
        org_id: OrgId,
        lesson: &Lesson,
        cancelled_at: DateTime<Utc>,
        value: Option<Money>,
    ) -> BillingResult<CancellationCredits> {
        if lesson.org_id != org_id {
            return Err(BillingError::validation(format!(
                "Lesson {} does not belong to organisation {}",
                lesson.id, org_id
            )));
        }
        let config = self.config(org_id).await?;

        let eligible = check_eligibility(lesson.start_at, cancelled_at, config.cancellation_notice_hours);
        let mut outcome = CancellationCredits {
            eligible,
            issued: Vec::new(),
            already_issued: Vec::new(),
        };
        if !eligible {
            info!(%org_id, lesson_id = %lesson.id, notice_hours = config.cancellation_notice_hours, "Cancellation not eligible for credit");
            return Ok(outcome);
        }

        let now = self.now();
        let expires_at = config
            .credit_expiry_days
            .map(|days| now + Duration::days(i64::from(days)));

        for participant in &lesson.participants {
            let request = NewCredit {
                org_id,
                student_id: participant.student_id,
                issued_for_lesson_id: Some(lesson.id),
                value: value.unwrap_or_else(|| config.rate_card.rate_for(participant.student_id)),
                expires_at,
            };
            match self.credits.issue_credit(request, now) {
                Ok(credit) => {
                    self.record_credit_issued(&credit, now);
                    outcome.issued.push(credit);
                }
                Err(BillingError::CreditAlreadyIssued { student_id, .. }) => {
                    outcome.already_issued.push(student_id);
                }
                Err(e) => return Err(e),
            }
        }

        if outcome.issued.is_empty() {
            if let Some(&student_id) = outcome.already_issued.first() {
                return Err(BillingError::CreditAlreadyIssued {
                    student_id,
                    lesson_id: lesson.id,
                });
            }
        }
        Ok(outcome)
    }

    fn record_credit_issued(&self, credit: &MakeUpCredit, now: DateTime<Utc>) {
        self.outbox.record(
            credit.org_id,
            BillingEvent::CreditIssued {
                credit_id: credit.id,
                student_id: credit.student_id,
                value: credit.credit_value,
                expires_at: credit.expires_at,
            },
            now,
        );
    }

    pub fn redeem_credit(
        &self,
        org_id: OrgId,
        credit_id: CreditId,
        target_lesson_id: LessonId,
    ) -> BillingResult<MakeUpCredit> {
        self.credits.redeem_credit(org_id, credit_id, target_lesson_id, self.now())
    }

    pub fn available_credits(&self, org_id: OrgId, student_id: StudentId) -> Vec<MakeUpCredit> {
        self.credits.available_credits(org_id, student_id, self.now())
    }

    pub fn total_available_credit(&self, org_id: OrgId, student_id: StudentId) -> BillingResult<Money> {
        self.credits.total_available_value(org_id, student_id, self.now())
    }

    // ------------------------------------------------------------------
    // Installment plans
    // ------------------------------------------------------------------

    pub fn create_installment_plan(
        &self,
        org_id: OrgId,
        invoice_id: InvoiceId,
        request: PlanRequest,
    ) -> BillingResult<InstallmentPlan> {
        let invoice = self.invoices.get(org_id, invoice_id)?;
        self.plans.create_plan(&invoice, request, self.now())
    }

    pub fn installment_plan(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<InstallmentPlan> {
        self.plans.plan_for(org_id, invoice_id)
    }

    pub fn remove_installment_plan(&self, org_id: OrgId, invoice_id: InvoiceId) -> BillingResult<InstallmentPlan> {
        self.plans.remove_plan(org_id, invoice_id)
    }

    // ------------------------------------------------------------------
    // Payments and refunds
    // ------------------------------------------------------------------

    /// Records a payment made outside the gateway (cash, bank transfer)
    pub fn record_payment(
        &self,
        org_id: OrgId,
        invoice_id: InvoiceId,
        amount: Money,
        provider: impl Into<String>,
    ) -> BillingResult<RecordedPayment> {
        let now = self.now();
        let (payment, invoice) = self.payments.record_payment(
            &self.invoices,
            NewPayment {
                org_id,
                invoice_id,
                installment_id: None,
                amount,
                provider: provider.into(),
                gateway_reference: None,
            },
            now,
        )?;
        self.close_plan_if_paid(&invoice, now);
        Ok(RecordedPayment {
            payment,
            invoice,
            installment: None,
        })
    }

    /// Records a payment against an installment and its invoice
    pub fn record_installment_payment(
        &self,
        org_id: OrgId,
        installment_id: InstallmentId,
        amount: Money,
        provider: impl Into<String>,
    ) -> BillingResult<RecordedPayment> {
        let invoice_id = self.plans.ensure_payable(org_id, installment_id)?;
        let now = self.now();

        let (payment, invoice, installment) = self.payments.record_payment_with(
            &self.invoices,
            NewPayment {
                org_id,
                invoice_id,
                installment_id: Some(installment_id),
                amount,
                provider: provider.into(),
                gateway_reference: None,
            },
            now,
            || self.plans.record_payment(org_id, installment_id, amount, now),
        )?;
        self.close_plan_if_paid(&invoice, now);
        Ok(RecordedPayment {
            payment,
            invoice,
            installment: Some(installment),
        })
    }

    /// Charges the payer through the gateway and records the payment on
    /// success. `amount` defaults to the balance due.
    ///
    /// # Errors
    ///
    /// A gateway failure is returned as a dependency error and nothing is
    /// recorded.
    #[instrument(skip(self))]
    pub async fn charge_invoice(
        &self,
        org_id: OrgId,
        invoice_id: InvoiceId,
        amount: Option<Money>,
    ) -> BillingResult<RecordedPayment> {
        let invoice = self.invoices.get(org_id, invoice_id)?;
        if matches!(invoice.status, InvoiceStatus::Paid | InvoiceStatus::Void) {
            return Err(BillingError::invalid_transition("invoice", invoice.status, InvoiceStatus::Paid));
        }
        let amount = amount.unwrap_or_else(|| invoice.balance_due());
        if !amount.is_positive() {
            return Err(BillingError::validation(format!("Charge amount must be positive, got {}", amount)));
        }
        if amount > invoice.balance_due() {
            return Err(BillingError::Overpayment {
                invoice_id,
                requested: amount,
                balance: invoice.balance_due(),
            });
        }

        let receipt = self
            .gateway
            .charge(&ChargeRequest {
                org_id,
                invoice_id,
                installment_id: None,
                payer: invoice.payer,
                amount,
            })
            .await
            .map_err(|e| {
                warn!(error = %e, amount = amount.minor(), "Gateway charge failed");
                BillingError::Dependency(e)
            })?;

        let now = self.now();
        let recorded = self.payments.record_payment(
            &self.invoices,
            NewPayment {
                org_id,
                invoice_id,
                installment_id: None,
                amount,
                provider: receipt.provider,
                gateway_reference: Some(receipt.gateway_reference.clone()),
            },
            now,
        );

        match recorded {
            Ok((payment, invoice)) => {
                self.close_plan_if_paid(&invoice, now);
                Ok(RecordedPayment {
                    payment,
                    invoice,
                    installment: None,
                })
            }
            Err(e) => {
                error!(
                    gateway_reference = %receipt.gateway_reference,
                    error = %e,
                    "Charge captured but payment could not be recorded"
                );
                Err(e)
            }
        }
    }

    fn close_plan_if_paid(&self, invoice: &Invoice, now: DateTime<Utc>) {
        if invoice.status != InvoiceStatus::Paid {
            return;
        }
        let closed = self.plans.close_plan(invoice.org_id, invoice.id, now);
        if !closed.is_empty() {
            info!(
                org_id = %invoice.org_id,
                invoice_id = %invoice.id,
                installments = closed.len(),
                "Open installments closed on paid invoice"
            );
        }
    }

    /// Reserves a refund against the payment and submits it to the gateway.
    /// If submission fails the refund is marked failed, which releases its
    /// share of the ceiling.
    #[instrument(skip(self, reason))]
    pub async fn issue_refund(
        &self,
        org_id: OrgId,
        payment_id: PaymentId,
        amount: Option<Money>,
        reason: Option<String>,
    ) -> BillingResult<Refund> {
        let config = self.config(org_id).await?;
        let today = self.today(&config);
        let now = self.now();
        let refund = self.payments.issue_refund(org_id, payment_id, amount, reason, now)?;
        let payment = self.payments.get_payment(org_id, payment_id)?;

        let submitted = self
            .gateway
            .submit_refund(&RefundRequest {
                org_id,
                refund_id: refund.id,
                payment_id,
                payment_reference: payment.gateway_reference,
                amount: refund.amount,
            })
            .await;

        match submitted {
            Ok(ack) => self.payments.mark_submitted(org_id, refund.id, ack.gateway_reference),
            Err(e) => {
                warn!(refund_id = %refund.id, error = %e, "Refund submission failed");
                self.payments
                    .settle_refund(&self.invoices, org_id, refund.id, RefundStatus::Failed, today, now)?;
                Err(BillingError::Dependency(e))
            }
        }
    }

    /// Applies the gateway's verdict on a pending refund
    pub async fn settle_refund(
        &self,
        org_id: OrgId,
        refund_id: RefundId,
        outcome: RefundStatus,
    ) -> BillingResult<Refund> {
        let config = self.config(org_id).await?;
        let today = self.today(&config);
        self.payments
            .settle_refund(&self.invoices, org_id, refund_id, outcome, today, self.now())
    }

    pub fn get_payment(&self, org_id: OrgId, payment_id: PaymentId) -> BillingResult<Payment> {
        self.payments.get_payment(org_id, payment_id)
    }

    pub fn get_refund(&self, org_id: OrgId, refund_id: RefundId) -> BillingResult<Refund> {
        self.payments.get_refund(org_id, refund_id)
    }

    pub fn payments_for_invoice(&self, org_id: OrgId, invoice_id: InvoiceId) -> Vec<Payment> {
        self.payments.payments_for_invoice(org_id, invoice_id)
    }

    pub fn refundable_amount(&self, org_id: OrgId, payment_id: PaymentId) -> BillingResult<Money> {
        self.payments.refundable_amount(org_id, payment_id)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Delivers queued notifications. Never touches billing state.
    pub async fn dispatch_notifications(&self, max_attempts: u32) -> DispatchReport {
        self.outbox.dispatch(self.notifier.as_ref(), max_attempts).await
    }
}

enum Committed {
    Invoice(Invoice),
    Suppressed(PayerKey),
}
