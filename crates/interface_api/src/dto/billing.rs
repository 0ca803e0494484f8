//! Configuration, lesson ingestion and billing run DTOs

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::{Validate, ValidationError};

use core_kernel::{GuardianId, LessonId, OrgId, StudentId, Timezone};
use domain_billing::{
    BillingMode, Lesson, LessonStatus, OrgBillingConfig, Participant, RateCard, ZeroValueInvoicePolicy,
};

use super::{invalid, money};

#[derive(Debug, Deserialize, Validate)]
pub struct StudentRateRequest {
    pub student_id: StudentId,
    #[validate(range(min = 0))]
    pub rate_minor: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateConfigRequest {
    #[serde(default)]
    pub vat_enabled: bool,
    #[serde(default)]
    pub vat_rate_percent: Decimal,
    #[validate(range(max = 8760))]
    pub cancellation_notice_hours: u32,
    pub billing_mode: BillingMode,
    #[validate(range(max = 365))]
    pub payment_terms_days: Option<u32>,
    #[validate(range(min = 1, max = 3650))]
    pub credit_expiry_days: Option<u32>,
    /// Credits never expire when true; overrides `credit_expiry_days`
    #[serde(default)]
    pub credits_never_expire: bool,
    pub apply_make_up_credits: Option<bool>,
    pub zero_value_invoices: Option<ZeroValueInvoicePolicy>,
    pub timezone: Option<Timezone>,
    #[validate(range(min = 0))]
    pub default_rate_minor: i64,
    #[serde(default)]
    #[validate(nested)]
    pub student_rates: Vec<StudentRateRequest>,
}

impl From<UpdateConfigRequest> for OrgBillingConfig {
    fn from(request: UpdateConfigRequest) -> Self {
        let defaults = OrgBillingConfig::default();
        let student_rates: HashMap<StudentId, _> = request
            .student_rates
            .iter()
            .map(|r| (r.student_id, money(r.rate_minor)))
            .collect();

        OrgBillingConfig {
            vat_enabled: request.vat_enabled,
            vat_rate_percent: request.vat_rate_percent,
            cancellation_notice_hours: request.cancellation_notice_hours,
            billing_mode: request.billing_mode,
            payment_terms_days: request.payment_terms_days.unwrap_or(defaults.payment_terms_days),
            credit_expiry_days: if request.credits_never_expire {
                None
            } else {
                request.credit_expiry_days.or(defaults.credit_expiry_days)
            },
            apply_make_up_credits: request.apply_make_up_credits.unwrap_or(defaults.apply_make_up_credits),
            zero_value_invoices: request.zero_value_invoices.unwrap_or(defaults.zero_value_invoices),
            timezone: request.timezone.unwrap_or(defaults.timezone),
            rate_card: RateCard {
                default_rate: money(request.default_rate_minor),
                student_rates,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ParticipantRequest {
    pub student_id: StudentId,
    pub guardian_id: Option<GuardianId>,
    #[serde(default)]
    pub is_primary_payer: bool,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_lesson_times"))]
pub struct LessonRequest {
    /// Scheduling-system id; a new one is assigned when absent
    pub id: Option<LessonId>,
    pub status: LessonStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[validate(length(min = 1, message = "A lesson needs at least one participant"), nested)]
    pub participants: Vec<ParticipantRequest>,
}

fn validate_lesson_times(lesson: &LessonRequest) -> Result<(), ValidationError> {
    if lesson.end_at <= lesson.start_at {
        return Err(invalid("lesson_times", "end_at must be after start_at"));
    }
    Ok(())
}

impl LessonRequest {
    pub fn into_lesson(self, org_id: OrgId) -> Lesson {
        Lesson {
            id: self.id.unwrap_or_else(LessonId::new_v7),
            org_id,
            status: self.status,
            start_at: self.start_at,
            end_at: self.end_at,
            participants: self
                .participants
                .into_iter()
                .map(|p| Participant {
                    student_id: p.student_id,
                    guardian_id: p.guardian_id,
                    is_primary_payer: p.is_primary_payer,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertLessonsRequest {
    #[validate(length(min = 1, max = 1000), nested)]
    pub lessons: Vec<LessonRequest>,
}

#[derive(Debug, Serialize)]
pub struct UpsertLessonsResponse {
    pub lesson_ids: Vec<LessonId>,
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_run_range"))]
pub struct BillingRunRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Overrides the organisation's billing mode for this run
    pub mode: Option<BillingMode>,
}

fn validate_run_range(request: &BillingRunRequest) -> Result<(), ValidationError> {
    if request.start_date > request.end_date {
        return Err(invalid("date_range", "start_date must not be after end_date"));
    }
    Ok(())
}
