//! Integration tests for domain_billing

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

use core_kernel::{
    BillingRunId, DateRange, DomainPort, FixedClock, GuardianId, InvoiceId, LessonId, Money, OrgId, PortError,
    StudentId, Timezone,
};

use domain_billing::adapters::{
    InMemoryLessonSource, InMemoryOrgConfigSource, InMemoryPaymentGateway, RecordingNotifier,
};
use domain_billing::{
    BillingEngine, BillingError, BillingEvent, BillingMode, ErrorKind, InstallmentStatus, Invoice,
    InvoiceStatus, Lesson, LessonSource, LessonStatus, OrgBillingConfig, Participant, PayerKey, PlanRequest,
    RateCard, RefundStatus, ZeroValueInvoicePolicy,
};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    engine: Arc<BillingEngine>,
    lessons: Arc<InMemoryLessonSource>,
    configs: Arc<InMemoryOrgConfigSource>,
    gateway: Arc<InMemoryPaymentGateway>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<FixedClock>,
    org: OrgId,
}

fn run_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap()
}

fn september() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2024, 9, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 9, 30).unwrap(),
    )
    .unwrap()
}

fn lesson_start(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, day, 16, 0, 0).unwrap()
}

fn standard_config() -> OrgBillingConfig {
    OrgBillingConfig::default()
        .with_vat(dec!(20))
        .with_rate_card(RateCard::new(Money::from_minor(3000)))
}

impl Harness {
    fn new(config: OrgBillingConfig) -> Self {
        let lessons = Arc::new(InMemoryLessonSource::new());
        let configs = Arc::new(InMemoryOrgConfigSource::new());
        let gateway = Arc::new(InMemoryPaymentGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(FixedClock::new(run_date()));
        let org = OrgId::new();
        configs.put(org, config);

        let engine = BillingEngine::new(lessons.clone(), configs.clone(), gateway.clone(), notifier.clone())
            .with_clock(clock.clone());

        Self {
            engine: Arc::new(engine),
            lessons,
            configs,
            gateway,
            notifier,
            clock,
            org,
        }
    }

    fn lesson(&self, day: u32, status: LessonStatus, participants: Vec<Participant>) -> Lesson {
        let start = lesson_start(day);
        let mut lesson = Lesson::new(self.org, start, start + Duration::minutes(45)).with_status(status);
        lesson.participants = participants;
        self.lessons.upsert(lesson.clone());
        lesson
    }

    fn completed(&self, day: u32, participant: Participant) -> Lesson {
        self.lesson(day, LessonStatus::Completed, vec![participant])
    }

    async fn run(&self) -> domain_billing::BillingRunReport {
        self.engine.run_billing(self.org, september(), None).await.unwrap()
    }

    async fn single_invoice(&self) -> Invoice {
        let report = self.run().await;
        assert_eq!(report.invoices.len(), 1);
        report.invoices.into_iter().next().unwrap()
    }
}

// ============================================================================
// Billing run tests
// ============================================================================

mod billing_run_tests {
    use super::*;

    #[tokio::test]
    async fn test_ten_lessons_for_one_guardian() {
        let h = Harness::new(standard_config());
        let guardian = GuardianId::new();
        let student = StudentId::new();
        for day in 2..12 {
            h.completed(day, Participant::with_paying_guardian(student, guardian));
        }

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.payer, PayerKey::Guardian(guardian));
        assert_eq!(invoice.line_items.len(), 10);
        assert_eq!(invoice.subtotal, Money::from_minor(30000));
        assert_eq!(invoice.tax, Money::from_minor(6000));
        assert_eq!(invoice.total, Money::from_minor(36000));
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.invoice_number, "INV-000001");
        assert_eq!(invoice.issue_date, NaiveDate::from_ymd_opt(2024, 10, 1).unwrap());
        assert_eq!(invoice.due_date, NaiveDate::from_ymd_opt(2024, 10, 15).unwrap());

        let paid = h
            .engine
            .record_payment(h.org, invoice.id, Money::from_minor(36000), "bank_transfer")
            .unwrap();
        assert_eq!(paid.invoice.status, InvoiceStatus::Paid);
        assert_eq!(paid.invoice.balance_due(), Money::ZERO);
    }

    #[tokio::test]
    async fn test_rerun_bills_nothing_twice() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        for day in 2..5 {
            h.completed(day, Participant::student(student));
        }

        let first = h.run().await;
        assert_eq!(first.invoices.len(), 1);

        let second = h.run().await;
        assert!(second.invoices.is_empty());
        assert_eq!(second.already_billed.len(), 3);
        assert_eq!(h.engine.list_invoices(h.org, None).len(), 1);
    }

    #[tokio::test]
    async fn test_lessons_added_later_are_billed_separately() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        h.completed(2, Participant::student(student));
        h.run().await;

        h.completed(9, Participant::student(student));
        let report = h.run().await;
        assert_eq!(report.invoices.len(), 1);
        assert_eq!(report.invoices[0].line_items.len(), 1);
        assert_eq!(report.invoices[0].invoice_number, "INV-000002");
    }

    #[tokio::test]
    async fn test_delivered_mode_skips_scheduled_and_cancelled() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let delivered = h.completed(2, Participant::student(student));
        let scheduled = h.lesson(3, LessonStatus::Scheduled, vec![Participant::student(student)]);
        let cancelled = h.lesson(4, LessonStatus::Cancelled, vec![Participant::student(student)]);

        let report = h.run().await;
        assert_eq!(report.invoices[0].lesson_ids(), vec![delivered.id]);
        assert!(report.not_billable.contains(&scheduled.id));
        assert!(report.not_billable.contains(&cancelled.id));
    }

    #[tokio::test]
    async fn test_upfront_override_bills_scheduled_lessons() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let scheduled = h.lesson(20, LessonStatus::Scheduled, vec![Participant::student(student)]);
        let cancelled = h.lesson(21, LessonStatus::Cancelled, vec![Participant::student(student)]);

        let report = h
            .engine
            .run_billing(h.org, september(), Some(BillingMode::Upfront))
            .await
            .unwrap();
        assert_eq!(report.mode, BillingMode::Upfront);
        assert_eq!(report.invoices[0].lesson_ids(), vec![scheduled.id]);
        assert_eq!(report.not_billable, vec![cancelled.id]);
    }

    #[tokio::test]
    async fn test_siblings_share_one_guardian_invoice() {
        let h = Harness::new(standard_config());
        let guardian = GuardianId::new();
        h.completed(2, Participant::with_paying_guardian(StudentId::new(), guardian));
        h.completed(3, Participant::with_paying_guardian(StudentId::new(), guardian));

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.payer, PayerKey::Guardian(guardian));
        assert_eq!(invoice.line_items.len(), 2);
    }

    #[tokio::test]
    async fn test_group_lesson_billed_to_each_family() {
        let h = Harness::new(standard_config());
        let (first, second) = (GuardianId::new(), GuardianId::new());
        let lesson = h.lesson(
            5,
            LessonStatus::Completed,
            vec![
                Participant::with_paying_guardian(StudentId::new(), first),
                Participant::with_paying_guardian(StudentId::new(), second),
            ],
        );

        let report = h.run().await;
        assert_eq!(report.invoices.len(), 2);
        let payers: HashSet<PayerKey> = report.invoices.iter().map(|i| i.payer).collect();
        assert!(payers.contains(&PayerKey::Guardian(first)));
        assert!(payers.contains(&PayerKey::Guardian(second)));
        assert_eq!(h.engine.ledger().invoices_for(h.org, lesson.id).len(), 2);
    }

    #[tokio::test]
    async fn test_student_without_paying_guardian_is_billed_directly() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let participant = Participant {
            student_id: student,
            guardian_id: Some(GuardianId::new()),
            is_primary_payer: false,
        };
        h.completed(2, participant);

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.payer, PayerKey::Student(student));
    }

    #[tokio::test]
    async fn test_range_follows_org_timezone() {
        let h = Harness::new(standard_config().with_timezone(Timezone::new(chrono_tz::Europe::London)));
        let student = StudentId::new();
        // 23:30 UTC on 30 September is already 1 October in London
        let late = Utc.with_ymd_and_hms(2024, 9, 30, 23, 30, 0).unwrap();
        h.lessons.upsert(
            Lesson::new(h.org, late, late + Duration::minutes(30))
                .with_status(LessonStatus::Completed)
                .with_participant(Participant::student(student)),
        );

        let report = h.run().await;
        assert!(report.invoices.is_empty());
    }

    #[tokio::test]
    async fn test_empty_range_produces_no_invoices() {
        let h = Harness::new(standard_config());
        let report = h.run().await;
        assert!(report.invoices.is_empty());
        assert!(h.engine.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_org_is_rejected() {
        let h = Harness::new(standard_config());
        let result = h.engine.run_billing(OrgId::new(), september(), None).await;
        assert!(matches!(result, Err(BillingError::UnknownOrganisation(_))));
    }

    #[tokio::test]
    async fn test_invalid_vat_config_is_rejected() {
        let h = Harness::new(standard_config());
        h.configs.put(h.org, standard_config().with_vat(dec!(120)));
        let err = h.engine.run_billing(h.org, september(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_scheduling_outage_leaves_no_trace() {
        let h = Harness::new(standard_config());
        let lesson = h.completed(2, Participant::student(StudentId::new()));
        h.lessons.set_unavailable(true);

        let err = h.engine.run_billing(h.org, september(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert!(err.is_retryable());
        assert!(h.engine.ledger().slot(h.org, lesson.id).is_none());

        h.lessons.set_unavailable(false);
        assert_eq!(h.run().await.invoices.len(), 1);
    }

    #[tokio::test]
    async fn test_voided_invoice_frees_its_lessons() {
        let h = Harness::new(standard_config());
        let lesson = h.completed(2, Participant::student(StudentId::new()));
        let invoice = h.single_invoice().await;

        let voided = h.engine.void_invoice(h.org, invoice.id).unwrap();
        assert_eq!(voided.status, InvoiceStatus::Void);
        assert!(!h.engine.ledger().is_billed(h.org, lesson.id));

        let rebilled = h.single_invoice().await;
        assert_eq!(rebilled.lesson_ids(), vec![lesson.id]);
        assert_ne!(rebilled.id, invoice.id);
    }

    /// Returns every lesson twice, like a source that retried a page
    struct RepeatingLessonSource {
        lessons: Vec<Lesson>,
    }

    impl DomainPort for RepeatingLessonSource {}

    #[async_trait]
    impl LessonSource for RepeatingLessonSource {
        async fn lessons_in_range(
            &self,
            _org_id: OrgId,
            _range: &DateRange,
            _timezone: &Timezone,
        ) -> Result<Vec<Lesson>, PortError> {
            Ok(self.lessons.iter().chain(self.lessons.iter()).cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_duplicate_lesson_records_bill_once() {
        let org = OrgId::new();
        let start = lesson_start(3);
        let lesson = Lesson::new(org, start, start + Duration::minutes(45))
            .with_status(LessonStatus::Completed)
            .with_participant(Participant::student(StudentId::new()));
        let configs = Arc::new(InMemoryOrgConfigSource::new());
        configs.put(org, OrgBillingConfig::default().with_rate_card(RateCard::new(Money::from_minor(3000))));
        let engine = BillingEngine::new(
            Arc::new(RepeatingLessonSource {
                lessons: vec![lesson.clone()],
            }),
            configs,
            Arc::new(InMemoryPaymentGateway::new()),
            Arc::new(RecordingNotifier::new()),
        )
        .with_clock(Arc::new(FixedClock::new(run_date())));

        let report = engine.run_billing(org, september(), None).await.unwrap();
        assert_eq!(report.invoices.len(), 1);
        assert_eq!(report.invoices[0].line_items.len(), 1);
        assert_eq!(report.invoices[0].subtotal, Money::from_minor(3000));
        assert_eq!(report.invoices[0].lesson_ids(), vec![lesson.id]);
    }

    #[tokio::test]
    async fn test_group_lesson_payer_left_unbilled_is_picked_up_later() {
        let h = Harness::new(standard_config());
        let (student, guardian) = (StudentId::new(), GuardianId::new());
        let lesson = h.lesson(
            5,
            LessonStatus::Completed,
            vec![
                Participant::student(student),
                Participant::with_paying_guardian(StudentId::new(), guardian),
            ],
        );

        // An earlier run billed the student and stopped before the guardian
        let earlier = BillingRunId::new();
        let ledger = h.engine.ledger();
        ledger.claim(h.org, earlier, &[lesson.id]);
        ledger
            .attach(h.org, earlier, lesson.id, PayerKey::Student(student), InvoiceId::new())
            .unwrap();
        ledger.release_claims(h.org, earlier, &[lesson.id]);

        let report = h.run().await;
        assert_eq!(report.invoices.len(), 1);
        assert_eq!(report.invoices[0].payer, PayerKey::Guardian(guardian));
        assert_eq!(report.invoices[0].lesson_ids(), vec![lesson.id]);

        let rerun = h.run().await;
        assert!(rerun.invoices.is_empty());
        assert_eq!(rerun.already_billed, vec![lesson.id]);
    }

    #[tokio::test]
    async fn test_voiding_one_family_rebills_only_that_family() {
        let h = Harness::new(standard_config());
        let (first, second) = (GuardianId::new(), GuardianId::new());
        let lesson = h.lesson(
            5,
            LessonStatus::Completed,
            vec![
                Participant::with_paying_guardian(StudentId::new(), first),
                Participant::with_paying_guardian(StudentId::new(), second),
            ],
        );
        let report = h.run().await;
        let voided = report
            .invoices
            .iter()
            .find(|i| i.payer == PayerKey::Guardian(first))
            .unwrap();
        h.engine.void_invoice(h.org, voided.id).unwrap();

        let rebilled = h.single_invoice().await;
        assert_eq!(rebilled.payer, PayerKey::Guardian(first));
        assert_eq!(rebilled.lesson_ids(), vec![lesson.id]);
        assert_eq!(h.engine.ledger().invoices_for(h.org, lesson.id).len(), 2);
    }

    #[tokio::test]
    async fn test_invoice_created_event_recorded() {
        let h = Harness::new(standard_config());
        h.completed(2, Participant::student(StudentId::new()));
        let invoice = h.single_invoice().await;

        let pending = h.engine.outbox().pending();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            &pending[0].event,
            BillingEvent::InvoiceCreated { invoice_id, total, .. }
                if *invoice_id == invoice.id && *total == Money::from_minor(3600)
        ));
    }
}

// ============================================================================
// Make-up credit tests
// ============================================================================

mod credit_tests {
    use super::*;

    #[tokio::test]
    async fn test_timely_cancellation_earns_credit() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let lesson = h.lesson(10, LessonStatus::Cancelled, vec![Participant::student(student)]);

        let outcome = h
            .engine
            .issue_credit_for_cancellation(h.org, &lesson, lesson.start_at - Duration::hours(48), None)
            .await
            .unwrap();

        assert!(outcome.eligible);
        assert_eq!(outcome.issued.len(), 1);
        let credit = &outcome.issued[0];
        assert_eq!(credit.credit_value, Money::from_minor(3000));
        assert_eq!(credit.issued_for_lesson_id, Some(lesson.id));
        assert_eq!(credit.expires_at, Some(run_date() + Duration::days(90)));
        assert_eq!(h.engine.available_credits(h.org, student).len(), 1);
        assert!(matches!(
            h.engine.outbox().pending()[0].event,
            BillingEvent::CreditIssued { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_cancellation_earns_nothing() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let lesson = h.lesson(10, LessonStatus::Cancelled, vec![Participant::student(student)]);

        let outcome = h
            .engine
            .issue_credit_for_cancellation(h.org, &lesson, lesson.start_at - Duration::hours(2), None)
            .await
            .unwrap();

        assert!(!outcome.eligible);
        assert!(outcome.issued.is_empty());
        assert!(h.engine.available_credits(h.org, student).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_credited_once() {
        let h = Harness::new(standard_config());
        let lesson = h.lesson(10, LessonStatus::Cancelled, vec![Participant::student(StudentId::new())]);
        let cancelled_at = lesson.start_at - Duration::days(3);

        h.engine
            .issue_credit_for_cancellation(h.org, &lesson, cancelled_at, None)
            .await
            .unwrap();
        let again = h
            .engine
            .issue_credit_for_cancellation(h.org, &lesson, cancelled_at, None)
            .await;
        assert!(matches!(again, Err(BillingError::CreditAlreadyIssued { .. })));
    }

    #[tokio::test]
    async fn test_credit_offsets_next_invoice() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let credit = h
            .engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), None)
            .await
            .unwrap();
        h.completed(12, Participant::student(student));

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.subtotal, Money::from_minor(3000));
        assert_eq!(invoice.tax, Money::from_minor(600));
        assert_eq!(invoice.credit_offset, Money::from_minor(3000));
        assert_eq!(invoice.total, Money::from_minor(600));
        assert_eq!(invoice.applied_credit_ids, vec![credit.id]);
        assert!(h.engine.available_credits(h.org, student).is_empty());
    }

    #[tokio::test]
    async fn test_expired_credit_is_not_applied() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        h.engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), Some(run_date() + Duration::days(1)))
            .await
            .unwrap();
        h.clock.advance(Duration::days(2));
        h.completed(12, Participant::student(student));

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.credit_offset, Money::ZERO);
        assert!(invoice.applied_credit_ids.is_empty());
    }

    #[tokio::test]
    async fn test_credits_disabled_by_config() {
        let h = Harness::new(standard_config().without_make_up_credits());
        let student = StudentId::new();
        h.engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), None)
            .await
            .unwrap();
        h.completed(12, Participant::student(student));

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.credit_offset, Money::ZERO);
        assert_eq!(h.engine.available_credits(h.org, student).len(), 1);
    }

    #[tokio::test]
    async fn test_fully_credited_invoice_is_kept_by_default() {
        let h = Harness::new(OrgBillingConfig::default().with_rate_card(RateCard::new(Money::from_minor(3000))));
        let student = StudentId::new();
        h.engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), None)
            .await
            .unwrap();
        h.completed(12, Participant::student(student));

        let invoice = h.single_invoice().await;
        assert_eq!(invoice.total, Money::ZERO);
        assert_eq!(invoice.applied_credit_ids.len(), 1);
    }

    fn suppressing_config() -> OrgBillingConfig {
        OrgBillingConfig::default()
            .with_rate_card(RateCard::new(Money::from_minor(3000)))
            .with_zero_value_invoices(ZeroValueInvoicePolicy::Suppress)
    }

    #[tokio::test]
    async fn test_fully_credited_invoice_suppressed_by_policy() {
        let h = Harness::new(suppressing_config());
        let student = StudentId::new();
        let credit = h
            .engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), None)
            .await
            .unwrap();
        let lesson = h.completed(12, Participant::student(student));

        let report = h.run().await;
        assert!(report.invoices.is_empty());
        assert_eq!(report.suppressed_payers, vec![PayerKey::Student(student)]);
        assert!(h.engine.list_invoices(h.org, None).is_empty());

        // The credit is spent and the lesson counts as billed
        assert!(h.engine.ledger().is_billed(h.org, lesson.id));
        assert!(h.engine.ledger().invoices_for(h.org, lesson.id).is_empty());
        assert!(h.engine.available_credits(h.org, student).is_empty());
        let redeemed = h.engine.credit_ledger().get(h.org, credit.id).unwrap();
        assert_eq!(redeemed.redeemed_lesson_id, Some(lesson.id));

        let rerun = h.run().await;
        assert!(rerun.suppressed_payers.is_empty());
        assert_eq!(rerun.already_billed, vec![lesson.id]);
    }

    #[tokio::test]
    async fn test_suppressed_credit_does_not_offset_next_month() {
        let h = Harness::new(suppressing_config());
        let student = StudentId::new();
        h.engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), None)
            .await
            .unwrap();
        h.completed(12, Participant::student(student));
        let october_lesson = Utc.with_ymd_and_hms(2024, 10, 10, 16, 0, 0).unwrap();
        h.lessons.upsert(
            Lesson::new(h.org, october_lesson, october_lesson + Duration::minutes(45))
                .with_status(LessonStatus::Completed)
                .with_participant(Participant::student(student)),
        );

        let september_run = h.run().await;
        assert_eq!(september_run.suppressed_payers.len(), 1);

        let october = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 10, 31).unwrap(),
        )
        .unwrap();
        let october_run = h.engine.run_billing(h.org, october, None).await.unwrap();
        assert!(october_run.suppressed_payers.is_empty());
        assert_eq!(october_run.invoices.len(), 1);
        assert_eq!(october_run.invoices[0].credit_offset, Money::ZERO);
        assert_eq!(october_run.invoices[0].total, Money::from_minor(3000));
    }

    #[tokio::test]
    async fn test_manual_redemption_removes_credit_from_billing() {
        let h = Harness::new(standard_config());
        let student = StudentId::new();
        let credit = h
            .engine
            .issue_credit(h.org, student, None, Money::from_minor(3000), None)
            .await
            .unwrap();

        h.engine.redeem_credit(h.org, credit.id, LessonId::new()).unwrap();
        assert!(matches!(
            h.engine.redeem_credit(h.org, credit.id, LessonId::new()),
            Err(BillingError::CreditAlreadyRedeemed { .. })
        ));

        h.completed(12, Participant::student(student));
        let invoice = h.single_invoice().await;
        assert_eq!(invoice.credit_offset, Money::ZERO);
    }
}

// ============================================================================
// Installment tests
// ============================================================================

mod installment_tests {
    use super::*;

    async fn invoice_of_ten_lessons(h: &Harness) -> Invoice {
        let student = StudentId::new();
        for day in 2..12 {
            h.completed(day, Participant::student(student));
        }
        h.single_invoice().await
    }

    fn monthly(count: u32) -> PlanRequest {
        PlanRequest {
            installment_count: count,
            first_due_date: NaiveDate::from_ymd_opt(2024, 10, 15).unwrap(),
            frequency: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_paying_every_installment_settles_invoice() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        let plan = h.engine.create_installment_plan(h.org, invoice.id, monthly(3)).unwrap();
        assert_eq!(plan.total().unwrap(), invoice.total);

        let mut last = None;
        for installment in &plan.installments {
            let recorded = h
                .engine
                .record_installment_payment(h.org, installment.id, installment.amount, "card")
                .unwrap();
            assert_eq!(recorded.installment.as_ref().unwrap().status, InstallmentStatus::Paid);
            assert_eq!(recorded.payment.installment_id, Some(installment.id));
            last = Some(recorded.invoice);
        }

        assert_eq!(last.unwrap().status, InvoiceStatus::Paid);
        let plan = h.engine.installment_plan(h.org, invoice.id).unwrap();
        assert!(plan.installments.iter().all(|i| i.status == InstallmentStatus::Paid));
    }

    #[tokio::test]
    async fn test_paid_installment_rejects_further_payment() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        let plan = h.engine.create_installment_plan(h.org, invoice.id, monthly(2)).unwrap();
        let first = &plan.installments[0];

        h.engine
            .record_installment_payment(h.org, first.id, first.amount, "card")
            .unwrap();
        let again = h.engine.record_installment_payment(h.org, first.id, Money::from_minor(1), "card");
        assert!(matches!(again, Err(BillingError::InstallmentAlreadyPaid(_))));
        assert_eq!(h.engine.get_invoice(h.org, invoice.id).unwrap().paid, first.amount);
    }

    #[tokio::test]
    async fn test_rejected_invoice_payment_leaves_installment_open() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        let plan = h.engine.create_installment_plan(h.org, invoice.id, monthly(2)).unwrap();
        h.engine.record_payment(h.org, invoice.id, Money::from_minor(30000), "cash").unwrap();

        let first = &plan.installments[0];
        let result = h.engine.record_installment_payment(h.org, first.id, first.amount, "card");
        assert!(matches!(result, Err(BillingError::Overpayment { .. })));

        let plan = h.engine.installment_plan(h.org, invoice.id).unwrap();
        assert_eq!(plan.installments[0].paid, Money::ZERO);
        assert_eq!(plan.installments[0].status, InstallmentStatus::Pending);
    }

    #[tokio::test]
    async fn test_plan_with_payments_cannot_be_removed() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        let plan = h.engine.create_installment_plan(h.org, invoice.id, monthly(3)).unwrap();
        h.engine
            .record_installment_payment(h.org, plan.installments[0].id, Money::from_minor(100), "card")
            .unwrap();

        let removed = h.engine.remove_installment_plan(h.org, invoice.id);
        assert!(matches!(removed, Err(BillingError::PlanHasPayments { .. })));
        assert!(h.engine.installment_plan(h.org, invoice.id).is_ok());
    }

    #[tokio::test]
    async fn test_unpaid_plan_can_be_replaced() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        h.engine.create_installment_plan(h.org, invoice.id, monthly(3)).unwrap();
        assert!(matches!(
            h.engine.create_installment_plan(h.org, invoice.id, monthly(2)),
            Err(BillingError::PlanAlreadyExists { .. })
        ));

        h.engine.remove_installment_plan(h.org, invoice.id).unwrap();
        let plan = h.engine.create_installment_plan(h.org, invoice.id, monthly(2)).unwrap();
        assert_eq!(plan.installments.len(), 2);
    }

    #[tokio::test]
    async fn test_overdue_refresh_flags_invoice_and_installment() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        h.engine.send_invoice(h.org, invoice.id).unwrap();
        h.engine.create_installment_plan(h.org, invoice.id, monthly(3)).unwrap();
        h.engine.outbox().dispatch(h.notifier.as_ref(), 3).await;

        // Due 15 October; the 15th itself is not yet overdue
        h.clock.set(Utc.with_ymd_and_hms(2024, 10, 15, 12, 0, 0).unwrap());
        let refresh = h.engine.refresh_overdue(h.org).await.unwrap();
        assert!(refresh.invoices.is_empty());
        assert!(refresh.installments.is_empty());

        h.clock.set(Utc.with_ymd_and_hms(2024, 10, 16, 12, 0, 0).unwrap());
        let refresh = h.engine.refresh_overdue(h.org).await.unwrap();
        assert_eq!(refresh.invoices.len(), 1);
        assert_eq!(refresh.invoices[0].status, InvoiceStatus::Overdue);
        assert_eq!(refresh.installments.len(), 1);
        assert_eq!(refresh.installments[0].sequence_number, 1);

        let events: Vec<&'static str> = h.engine.outbox().pending().iter().map(|e| e.event.name()).collect();
        assert_eq!(events, vec!["invoice_overdue", "installment_overdue"]);

        let again = h.engine.refresh_overdue(h.org).await.unwrap();
        assert!(again.invoices.is_empty());
        assert!(again.installments.is_empty());
    }

    #[tokio::test]
    async fn test_paying_invoice_outright_closes_its_plan() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        h.engine.send_invoice(h.org, invoice.id).unwrap();
        h.engine.create_installment_plan(h.org, invoice.id, monthly(3)).unwrap();

        let paid = h
            .engine
            .record_payment(h.org, invoice.id, invoice.total, "bank_transfer")
            .unwrap();
        assert_eq!(paid.invoice.status, InvoiceStatus::Paid);
        let plan = h.engine.installment_plan(h.org, invoice.id).unwrap();
        assert!(plan.installments.iter().all(|i| i.status == InstallmentStatus::Paid));

        h.clock.set(Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap());
        let refresh = h.engine.refresh_overdue(h.org).await.unwrap();
        assert!(refresh.invoices.is_empty());
        assert!(refresh.installments.is_empty());
        assert!(h
            .engine
            .outbox()
            .pending()
            .iter()
            .all(|e| e.event.name() != "installment_overdue"));
    }

    #[tokio::test]
    async fn test_void_invoice_drops_unpaid_plan() {
        let h = Harness::new(standard_config());
        let invoice = invoice_of_ten_lessons(&h).await;
        h.engine.create_installment_plan(h.org, invoice.id, monthly(3)).unwrap();

        h.engine.void_invoice(h.org, invoice.id).unwrap();
        assert!(matches!(
            h.engine.installment_plan(h.org, invoice.id),
            Err(BillingError::PlanNotFound(_))
        ));
    }
}

// ============================================================================
// Payment and refund tests
// ============================================================================

mod payment_tests {
    use super::*;

    async fn billed(h: &Harness) -> Invoice {
        for day in 2..12 {
            h.completed(day, Participant::student(StudentId::new()));
        }
        // Ten separate students, ten invoices of 3600 each
        let report = h.run().await;
        report.invoices.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_charge_through_gateway() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;

        let recorded = h.engine.charge_invoice(h.org, invoice.id, None).await.unwrap();
        assert_eq!(recorded.invoice.status, InvoiceStatus::Paid);
        assert_eq!(recorded.payment.amount, Money::from_minor(3600));
        assert_eq!(recorded.payment.provider, "card");
        assert!(recorded.payment.gateway_reference.as_deref().unwrap().starts_with("ch_"));
        assert_eq!(h.gateway.charges().len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_outage_changes_nothing() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        h.gateway.set_unavailable(true);

        let err = h.engine.charge_invoice(h.org, invoice.id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert!(err.is_retryable());

        let unchanged = h.engine.get_invoice(h.org, invoice.id).unwrap();
        assert_eq!(unchanged.paid, Money::ZERO);
        assert_eq!(unchanged.status, InvoiceStatus::Draft);
        assert!(h.engine.payments_for_invoice(h.org, invoice.id).is_empty());
    }

    #[tokio::test]
    async fn test_overcharge_rejected_before_gateway() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;

        let result = h
            .engine
            .charge_invoice(h.org, invoice.id, Some(Money::from_minor(5000)))
            .await;
        assert!(matches!(result, Err(BillingError::Overpayment { .. })));
        assert!(h.gateway.charges().is_empty());
    }

    #[tokio::test]
    async fn test_partial_refund_reopens_invoice() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        let paid = h.engine.charge_invoice(h.org, invoice.id, None).await.unwrap();

        let refund = h
            .engine
            .issue_refund(h.org, paid.payment.id, Some(Money::from_minor(1000)), Some("missed lesson".into()))
            .await
            .unwrap();
        assert_eq!(refund.status, RefundStatus::Pending);
        assert!(refund.gateway_reference.as_deref().unwrap().starts_with("re_"));
        assert_eq!(
            h.engine.refundable_amount(h.org, paid.payment.id).unwrap(),
            Money::from_minor(2600)
        );

        let settled = h
            .engine
            .settle_refund(h.org, refund.id, RefundStatus::Succeeded)
            .await
            .unwrap();
        assert_eq!(settled.status, RefundStatus::Succeeded);

        let reopened = h.engine.get_invoice(h.org, invoice.id).unwrap();
        assert_eq!(reopened.paid, Money::from_minor(2600));
        assert_eq!(reopened.status, InvoiceStatus::Sent);
    }

    #[tokio::test]
    async fn test_refund_over_ceiling_rejected() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        let paid = h.engine.charge_invoice(h.org, invoice.id, None).await.unwrap();

        h.engine
            .issue_refund(h.org, paid.payment.id, Some(Money::from_minor(3000)), None)
            .await
            .unwrap();
        let result = h
            .engine
            .issue_refund(h.org, paid.payment.id, Some(Money::from_minor(1000)), None)
            .await;
        assert!(matches!(
            result,
            Err(BillingError::ExceedsRefundable { refundable, .. }) if refundable == Money::from_minor(600)
        ));
    }

    #[tokio::test]
    async fn test_refund_submission_failure_releases_ceiling() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        let paid = h.engine.charge_invoice(h.org, invoice.id, None).await.unwrap();
        h.gateway.set_unavailable(true);

        let err = h.engine.issue_refund(h.org, paid.payment.id, None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dependency);
        assert_eq!(
            h.engine.refundable_amount(h.org, paid.payment.id).unwrap(),
            Money::from_minor(3600)
        );
        assert_eq!(h.engine.get_invoice(h.org, invoice.id).unwrap().status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn test_refund_refused_before_gateway_without_valid_settings() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        let paid = h.engine.charge_invoice(h.org, invoice.id, None).await.unwrap();
        h.configs.put(h.org, standard_config().with_vat(dec!(120)));

        let err = h.engine.issue_refund(h.org, paid.payment.id, None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(h.gateway.refunds().is_empty());
        assert_eq!(
            h.engine.refundable_amount(h.org, paid.payment.id).unwrap(),
            Money::from_minor(3600)
        );
    }

    #[tokio::test]
    async fn test_payment_on_void_invoice_rejected() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        h.engine.void_invoice(h.org, invoice.id).unwrap();

        let result = h.engine.record_payment(h.org, invoice.id, Money::from_minor(100), "cash");
        assert!(matches!(result, Err(BillingError::InvalidStatusTransition { .. })));
    }

    #[tokio::test]
    async fn test_paid_invoice_cannot_be_voided() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        h.engine.record_payment(h.org, invoice.id, Money::from_minor(100), "cash").unwrap();

        assert!(matches!(
            h.engine.void_invoice(h.org, invoice.id),
            Err(BillingError::InvalidStatusTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_other_org_cannot_see_invoice() {
        let h = Harness::new(standard_config());
        let invoice = billed(&h).await;
        assert!(matches!(
            h.engine.get_invoice(OrgId::new(), invoice.id),
            Err(BillingError::InvoiceNotFound(_))
        ));
        assert!(matches!(
            h.engine.get_invoice(h.org, InvoiceId::new()),
            Err(BillingError::InvoiceNotFound(_))
        ));
    }
}

// ============================================================================
// Notification tests
// ============================================================================

mod notification_tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_notifier_never_blocks_billing() {
        let h = Harness::new(standard_config());
        h.notifier.set_failing(true);
        h.completed(2, Participant::student(StudentId::new()));

        let invoice = h.single_invoice().await;
        let report = h.engine.dispatch_notifications(3).await;
        assert_eq!(report.requeued, 1);
        assert!(h.engine.get_invoice(h.org, invoice.id).is_ok());

        h.notifier.set_failing(false);
        let report = h.engine.dispatch_notifications(3).await;
        assert_eq!(report.delivered, 1);
        assert!(h.engine.outbox().is_empty());
        assert_eq!(h.notifier.delivered().len(), 1);
    }
}

// ============================================================================
// Concurrency tests
// ============================================================================

mod concurrency_tests {
    use super::*;
    use domain_billing::invoice::InvoiceStore;
    use domain_billing::{CreditLedger, InvoiceLine, InvoiceTotals, NewCredit, NewPayment, PaymentRecorder};
    use std::sync::Barrier;
    use std::thread;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_bill_each_lesson_once() {
        let h = Harness::new(standard_config());
        let students: Vec<StudentId> = (0..4).map(|_| StudentId::new()).collect();
        let mut expected = HashSet::new();
        for day in 1..=20 {
            let student = students[(day as usize) % students.len()];
            expected.insert(h.completed(day, Participant::student(student)).id);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = h.engine.clone();
            let org = h.org;
            handles.push(tokio::spawn(async move {
                engine.run_billing(org, september(), None).await
            }));
        }

        let mut billed = Vec::new();
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            for invoice in report.invoices {
                billed.extend(invoice.lesson_ids());
            }
        }

        assert_eq!(billed.len(), expected.len());
        let unique: HashSet<LessonId> = billed.into_iter().collect();
        assert_eq!(unique, expected);
        assert!(expected.iter().all(|id| h.engine.ledger().is_billed(h.org, *id)));
    }

    #[test]
    fn test_concurrent_redemption_has_one_winner() {
        let ledger = Arc::new(CreditLedger::new());
        let org = OrgId::new();
        let now = run_date();
        let credit = ledger
            .issue_credit(
                NewCredit {
                    org_id: org,
                    student_id: StudentId::new(),
                    issued_for_lesson_id: None,
                    value: Money::from_minor(3000),
                    expires_at: None,
                },
                now,
            )
            .unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ledger.redeem_credit(org, credit.id, LessonId::new(), now)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, BillingError::CreditAlreadyRedeemed { .. })));
    }

    #[test]
    fn test_concurrent_refunds_respect_ceiling() {
        let store = Arc::new(InvoiceStore::new());
        let recorder = Arc::new(PaymentRecorder::new());
        let now = run_date();
        let today = now.date_naive();
        let student = StudentId::new();
        let amount = Money::from_minor(10000);

        let invoice = Invoice::draft(
            OrgId::new(),
            store.next_number(OrgId::new()),
            PayerKey::Student(student),
            None,
            today,
            today,
            vec![InvoiceLine::new(LessonId::new(), student, "Piano", amount)],
            InvoiceTotals {
                subtotal: amount,
                tax: Money::ZERO,
                credit_offset: Money::ZERO,
                total: amount,
            },
            Vec::new(),
            now,
        );
        let (org, invoice_id) = (invoice.org_id, invoice.id);
        store.insert(invoice);

        let (payment, _) = recorder
            .record_payment(
                &store,
                NewPayment {
                    org_id: org,
                    invoice_id,
                    installment_id: None,
                    amount,
                    provider: "card".to_string(),
                    gateway_reference: None,
                },
                now,
            )
            .unwrap();

        let barrier = Arc::new(Barrier::new(10));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let recorder = recorder.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    recorder.issue_refund(org, payment.id, Some(Money::from_minor(3000)), None, now)
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(accepted, 3);
        assert_eq!(recorder.refundable_amount(org, payment.id).unwrap(), Money::from_minor(1000));
    }
}
