//! Test Data Builders
//!
//! Provides builder patterns for constructing test data with sensible defaults.
//! These builders allow tests to specify only the relevant fields while using
//! defaults for everything else.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use core_kernel::{GuardianId, LessonId, Money, OrgId, StudentId, Timezone};
use domain_billing::{
    BillingMode, Lesson, LessonStatus, OrgBillingConfig, Participant, RateCard,
    ZeroValueInvoicePolicy,
};

use crate::fixtures::{IdFixtures, MoneyFixtures, TemporalFixtures};

/// Builder for constructing test lessons
pub struct TestLessonBuilder {
    id: LessonId,
    org_id: OrgId,
    status: LessonStatus,
    start_at: DateTime<Utc>,
    duration: Duration,
    participants: Vec<Participant>,
}

impl Default for TestLessonBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLessonBuilder {
    /// Creates a completed 45-minute lesson on 2 September 2024 with no participants
    pub fn new() -> Self {
        Self {
            id: LessonId::new_v7(),
            org_id: IdFixtures::org_id(),
            status: LessonStatus::Completed,
            start_at: TemporalFixtures::september_lesson(2),
            duration: Duration::minutes(45),
            participants: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: LessonId) -> Self {
        self.id = id;
        self
    }

    pub fn with_org(mut self, org_id: OrgId) -> Self {
        self.org_id = org_id;
        self
    }

    pub fn with_status(mut self, status: LessonStatus) -> Self {
        self.status = status;
        self
    }

    pub fn scheduled(self) -> Self {
        self.with_status(LessonStatus::Scheduled)
    }

    pub fn cancelled(self) -> Self {
        self.with_status(LessonStatus::Cancelled)
    }

    pub fn starting_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = start_at;
        self
    }

    /// Moves the lesson to 16:00 UTC on the given September day
    pub fn on_september_day(self, day: u32) -> Self {
        self.starting_at(TemporalFixtures::september_lesson(day))
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Adds a student who pays for themselves
    pub fn with_student(mut self, student_id: StudentId) -> Self {
        self.participants.push(Participant::student(student_id));
        self
    }

    /// Adds a student whose guardian pays
    pub fn with_guarded_student(mut self, student_id: StudentId, guardian_id: GuardianId) -> Self {
        self.participants
            .push(Participant::with_paying_guardian(student_id, guardian_id));
        self
    }

    /// Adds a student linked to a guardian who is not the payer
    pub fn with_non_paying_guardian(mut self, student_id: StudentId, guardian_id: GuardianId) -> Self {
        self.participants.push(Participant {
            student_id,
            guardian_id: Some(guardian_id),
            is_primary_payer: false,
        });
        self
    }

    /// Builds the lesson
    pub fn build(self) -> Lesson {
        Lesson {
            id: self.id,
            org_id: self.org_id,
            status: self.status,
            start_at: self.start_at,
            end_at: self.start_at + self.duration,
            participants: self.participants,
        }
    }

    /// Builds `count` copies on consecutive September days starting at the 2nd,
    /// each with a fresh id
    pub fn build_series(self, count: u32) -> Vec<Lesson> {
        (0..count)
            .map(|offset| {
                let start_at = TemporalFixtures::september_lesson(2 + offset % 28);
                Lesson {
                    id: LessonId::new_v7(),
                    org_id: self.org_id,
                    status: self.status,
                    start_at,
                    end_at: start_at + self.duration,
                    participants: self.participants.clone(),
                }
            })
            .collect()
    }
}

/// Builder for organisation billing settings
pub struct TestConfigBuilder {
    config: OrgBillingConfig,
    rate_card: RateCard,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// Starts from the defaults with the standard 30.00 lesson rate and no VAT
    pub fn new() -> Self {
        Self {
            config: OrgBillingConfig::default(),
            rate_card: RateCard::new(MoneyFixtures::lesson_rate()),
        }
    }

    pub fn with_vat(mut self, rate_percent: Decimal) -> Self {
        self.config = self.config.with_vat(rate_percent);
        self
    }

    pub fn with_default_rate(mut self, rate: Money) -> Self {
        self.rate_card.default_rate = rate;
        self
    }

    pub fn with_student_rate(mut self, student_id: StudentId, rate: Money) -> Self {
        self.rate_card = self.rate_card.with_student_rate(student_id, rate);
        self
    }

    pub fn upfront(mut self) -> Self {
        self.config = self.config.with_billing_mode(BillingMode::Upfront);
        self
    }

    pub fn with_payment_terms(mut self, days: u32) -> Self {
        self.config.payment_terms_days = days;
        self
    }

    pub fn with_notice_hours(mut self, hours: u32) -> Self {
        self.config = self.config.with_notice_hours(hours);
        self
    }

    pub fn with_credit_expiry_days(mut self, days: Option<u32>) -> Self {
        self.config = self.config.with_credit_expiry_days(days);
        self
    }

    pub fn without_make_up_credits(mut self) -> Self {
        self.config = self.config.without_make_up_credits();
        self
    }

    pub fn suppress_zero_value_invoices(mut self) -> Self {
        self.config = self
            .config
            .with_zero_value_invoices(ZeroValueInvoicePolicy::Suppress);
        self
    }

    pub fn with_timezone(mut self, timezone: Timezone) -> Self {
        self.config = self.config.with_timezone(timezone);
        self
    }

    pub fn build(self) -> OrgBillingConfig {
        self.config.with_rate_card(self.rate_card)
    }
}
