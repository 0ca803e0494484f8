//! Test fixtures for common domain entities
//!
//! Provides pre-built, valid test data that can be used across tests.
//! All fixtures are deterministic and suitable for reproducible testing.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

use core_kernel::{DateRange, GuardianId, LessonId, Money, OrgId, StudentId, Timezone};
use domain_billing::{BillingMode, OrgBillingConfig, RateCard};

/// Fixture for money test data
pub struct MoneyFixtures;

impl MoneyFixtures {
    /// Standard lesson rate (30.00)
    pub fn lesson_rate() -> Money {
        Money::from_minor(3000)
    }

    /// Discounted sibling rate (25.00)
    pub fn discounted_rate() -> Money {
        Money::from_minor(2500)
    }

    /// A typical make-up credit worth one lesson
    pub fn one_lesson_credit() -> Money {
        Self::lesson_rate()
    }

    /// Ten standard lessons before tax
    pub fn ten_lessons() -> Money {
        Money::from_minor(30000)
    }

    pub fn zero() -> Money {
        Money::ZERO
    }
}

/// Fixture for temporal test data
pub struct TemporalFixtures;

impl TemporalFixtures {
    /// Instant billing runs execute at: 2024-10-01 09:00 UTC
    pub fn run_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap()
    }

    /// Issue date for invoices created at [`Self::run_instant`]
    pub fn issue_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()
    }

    /// Due date under the default 14-day payment terms
    pub fn due_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 15).unwrap()
    }

    /// First day past [`Self::due_date`]
    pub fn day_after_due() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 16, 9, 0, 0).unwrap()
    }

    /// Billing range covering September 2024
    pub fn september() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 9, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 9, 30).unwrap(),
        )
        .unwrap()
    }

    /// Billing range covering October 2024
    pub fn october() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 10, 31).unwrap(),
        )
        .unwrap()
    }

    /// 16:00 UTC on the given day of September 2024
    pub fn september_lesson(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, 16, 0, 0).unwrap()
    }

    /// 23:30 UTC on 30 September 2024, which is already 1 October in London
    pub fn london_month_boundary() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 30, 23, 30, 0).unwrap()
    }

    pub fn london() -> Timezone {
        Timezone::new(chrono_tz::Europe::London)
    }
}

/// Fixture for identifier test data
pub struct IdFixtures;

impl IdFixtures {
    /// Creates a deterministic organisation ID for testing
    pub fn org_id() -> OrgId {
        OrgId::from_uuid(Uuid::parse_str("6f1c2a40-3b7e-4d55-9a01-000000000001").unwrap())
    }

    /// A second organisation, for isolation tests
    pub fn other_org_id() -> OrgId {
        OrgId::from_uuid(Uuid::parse_str("6f1c2a40-3b7e-4d55-9a01-000000000002").unwrap())
    }

    pub fn student_id() -> StudentId {
        StudentId::from_uuid(Uuid::parse_str("6f1c2a40-3b7e-4d55-9a01-000000000101").unwrap())
    }

    pub fn sibling_id() -> StudentId {
        StudentId::from_uuid(Uuid::parse_str("6f1c2a40-3b7e-4d55-9a01-000000000102").unwrap())
    }

    pub fn guardian_id() -> GuardianId {
        GuardianId::from_uuid(Uuid::parse_str("6f1c2a40-3b7e-4d55-9a01-000000000201").unwrap())
    }

    pub fn lesson_id() -> LessonId {
        LessonId::from_uuid(Uuid::parse_str("6f1c2a40-3b7e-4d55-9a01-000000000301").unwrap())
    }
}

/// Fixture for organisation billing settings
pub struct ConfigFixtures;

impl ConfigFixtures {
    /// Standard UK VAT rate
    pub fn vat_rate() -> Decimal {
        dec!(20)
    }

    /// VAT-registered organisation billing delivered lessons at 30.00
    pub fn standard() -> OrgBillingConfig {
        OrgBillingConfig::default()
            .with_vat(Self::vat_rate())
            .with_rate_card(RateCard::new(MoneyFixtures::lesson_rate()))
    }

    /// Organisation below the VAT threshold
    pub fn vat_free() -> OrgBillingConfig {
        OrgBillingConfig::default().with_rate_card(RateCard::new(MoneyFixtures::lesson_rate()))
    }

    /// Standard settings, billing booked lessons in advance
    pub fn upfront() -> OrgBillingConfig {
        Self::standard().with_billing_mode(BillingMode::Upfront)
    }

    /// Standard settings with local dates taken in Europe/London
    pub fn london() -> OrgBillingConfig {
        Self::standard().with_timezone(TemporalFixtures::london())
    }
}

/// Fixture for HTTP request bodies
pub struct JsonFixtures;

impl JsonFixtures {
    /// Body for `PUT /config` matching [`ConfigFixtures::standard`]
    pub fn standard_config() -> Value {
        json!({
            "vat_enabled": true,
            "vat_rate_percent": "20",
            "cancellation_notice_hours": 24,
            "billing_mode": "delivered",
            "default_rate_minor": MoneyFixtures::lesson_rate().minor(),
        })
    }

    /// A completed 45-minute lesson for one self-paying student
    pub fn completed_lesson(student_id: StudentId, start_at: DateTime<Utc>) -> Value {
        json!({
            "status": "completed",
            "start_at": start_at,
            "end_at": start_at + chrono::Duration::minutes(45),
            "participants": [{ "student_id": student_id }],
        })
    }

    /// A lesson paid for by the student's guardian
    pub fn guardian_lesson(
        student_id: StudentId,
        guardian_id: GuardianId,
        start_at: DateTime<Utc>,
    ) -> Value {
        json!({
            "status": "completed",
            "start_at": start_at,
            "end_at": start_at + chrono::Duration::minutes(45),
            "participants": [{
                "student_id": student_id,
                "guardian_id": guardian_id,
                "is_primary_payer": true,
            }],
        })
    }

    /// Body for `POST /billing-runs` over a date range
    pub fn billing_run(range: &DateRange) -> Value {
        json!({
            "start_date": range.start,
            "end_date": range.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_config_is_valid() {
        assert!(ConfigFixtures::standard().validate().is_ok());
        assert!(ConfigFixtures::vat_free().validate().is_ok());
    }

    #[test]
    fn test_due_date_follows_default_terms() {
        let terms = i64::from(ConfigFixtures::standard().payment_terms_days);
        assert_eq!(
            TemporalFixtures::issue_date() + chrono::Duration::days(terms),
            TemporalFixtures::due_date()
        );
    }

    #[test]
    fn test_london_boundary_falls_in_october() {
        let local = TemporalFixtures::london().local_date(TemporalFixtures::london_month_boundary());
        assert!(TemporalFixtures::october().contains(local));
        assert!(!TemporalFixtures::september().contains(local));
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(IdFixtures::org_id(), IdFixtures::other_org_id());
        assert_ne!(IdFixtures::student_id(), IdFixtures::sibling_id());
    }
}
