//! Payment and refund DTOs

use serde::Deserialize;
use validator::Validate;

use domain_billing::RefundStatus;

#[derive(Debug, Deserialize, Validate)]
pub struct InstallmentPaymentRequest {
    #[validate(range(min = 1))]
    pub amount_minor: i64,
    #[validate(length(min = 1, max = 64))]
    pub provider: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct IssueRefundRequest {
    /// Defaults to everything still refundable
    #[validate(range(min = 1))]
    pub amount_minor: Option<i64>,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SettleRefundRequest {
    pub outcome: RefundStatus,
}
