//! Property-based test data generators
//!
//! Provides proptest strategies for generating random but valid
//! billing data for property-based testing.

use proptest::prelude::*;
use rust_decimal::Decimal;

use core_kernel::{Money, Percentage, StudentId};
use domain_billing::{ChargeLine, InstallmentFrequency, Lesson, LessonStatus, RateCard, VatConfig};

use crate::builders::TestLessonBuilder;

/// Strategy for non-negative amounts up to `max_minor`
pub fn money_strategy(max_minor: i64) -> impl Strategy<Value = Money> {
    (0..=max_minor).prop_map(Money::from_minor)
}

/// Strategy for strictly positive amounts up to `max_minor`
pub fn positive_money_strategy(max_minor: i64) -> impl Strategy<Value = Money> {
    (1..=max_minor).prop_map(Money::from_minor)
}

/// Strategy for plausible per-lesson rates (0.00 to 200.00)
pub fn lesson_rate_strategy() -> impl Strategy<Value = Money> {
    money_strategy(20_000)
}

/// Strategy for VAT percentages in [0, 100] with two decimal places
pub fn vat_percent_strategy() -> impl Strategy<Value = Decimal> {
    (0u32..=10_000).prop_map(|hundredths| Decimal::new(i64::from(hundredths), 2))
}

/// Strategy for VAT settings, enabled or not
pub fn vat_config_strategy() -> impl Strategy<Value = VatConfig> {
    prop_oneof![
        Just(VatConfig::disabled()),
        vat_percent_strategy().prop_map(|p| VatConfig::enabled(Percentage::new(p).unwrap())),
    ]
}

/// Strategy for invoice charge lines
pub fn charge_lines_strategy(max_lines: usize) -> impl Strategy<Value = Vec<ChargeLine>> {
    prop::collection::vec(
        (lesson_rate_strategy(), 1u32..=4).prop_map(|(rate, quantity)| ChargeLine::new(rate, quantity)),
        0..=max_lines,
    )
}

pub fn installment_count_strategy() -> impl Strategy<Value = u32> {
    1u32..=24
}

pub fn frequency_strategy() -> impl Strategy<Value = InstallmentFrequency> {
    prop_oneof![
        Just(InstallmentFrequency::Weekly),
        Just(InstallmentFrequency::Fortnightly),
        Just(InstallmentFrequency::Monthly),
    ]
}

pub fn lesson_status_strategy() -> impl Strategy<Value = LessonStatus> {
    prop_oneof![
        Just(LessonStatus::Scheduled),
        Just(LessonStatus::Completed),
        Just(LessonStatus::Cancelled),
    ]
}

/// Strategy for a rate card over the given students, each with an optional override
pub fn rate_card_strategy(students: Vec<StudentId>) -> impl Strategy<Value = RateCard> {
    let count = students.len();
    (
        lesson_rate_strategy(),
        prop::collection::vec(prop::option::of(lesson_rate_strategy()), count),
    )
        .prop_map(move |(default_rate, overrides)| {
            students
                .iter()
                .zip(overrides)
                .filter_map(|(student, rate)| rate.map(|r| (*student, r)))
                .fold(RateCard::new(default_rate), |card, (student, rate)| {
                    card.with_student_rate(student, rate)
                })
        })
}

/// Strategy for September lessons attended by one student, with random status
pub fn lessons_for_student_strategy(student_id: StudentId, max: usize) -> impl Strategy<Value = Vec<Lesson>> {
    prop::collection::vec((lesson_status_strategy(), 1u32..=30), 0..=max).prop_map(move |specs| {
        specs
            .into_iter()
            .map(|(status, day)| {
                TestLessonBuilder::new()
                    .with_status(status)
                    .on_september_day(day)
                    .with_student(student_id)
                    .build()
            })
            .collect()
    })
}
