//! Invoice DTOs

use chrono::NaiveDate;
use serde::Deserialize;
use validator::Validate;

use domain_billing::{InstallmentFrequency, InvoiceStatus, PlanRequest};

#[derive(Debug, Deserialize)]
pub struct InvoiceQuery {
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    #[validate(range(min = 1))]
    pub amount_minor: i64,
    #[validate(length(min = 1, max = 64))]
    pub provider: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ChargeInvoiceRequest {
    /// Defaults to the balance due
    #[validate(range(min = 1))]
    pub amount_minor: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(range(min = 1, max = 60))]
    pub installment_count: u32,
    pub first_due_date: NaiveDate,
    #[serde(default)]
    pub frequency: InstallmentFrequency,
}

impl From<CreatePlanRequest> for PlanRequest {
    fn from(request: CreatePlanRequest) -> Self {
        PlanRequest {
            installment_count: request.installment_count,
            first_due_date: request.first_due_date,
            frequency: request.frequency,
        }
    }
}
