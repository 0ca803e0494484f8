//! Make-up credit DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use core_kernel::{LessonId, Money, StudentId};
use domain_billing::MakeUpCredit;

#[derive(Debug, Deserialize, Validate)]
pub struct IssueCreditRequest {
    pub student_id: StudentId,
    /// Cancelled lesson the credit compensates for, if any
    pub lesson_id: Option<LessonId>,
    #[validate(range(min = 1))]
    pub value_minor: i64,
    /// Never expires when absent
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CancellationCreditRequest {
    pub lesson_id: LessonId,
    pub cancelled_at: DateTime<Utc>,
    /// Defaults to each student's rate
    #[validate(range(min = 1))]
    pub value_minor: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RedeemCreditRequest {
    pub lesson_id: LessonId,
}

#[derive(Debug, Serialize)]
pub struct StudentCreditsResponse {
    pub student_id: StudentId,
    pub total_available: Money,
    pub credits: Vec<MakeUpCredit>,
}
