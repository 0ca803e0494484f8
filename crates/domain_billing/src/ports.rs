//! Ports for the collaborators the engine does not own
//!
//! The scheduling system, the organisation configuration store, the payment
//! gateway and the notifier are reached only through these traits. Adapters
//! return `PortError`, which the engine surfaces as a dependency failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use core_kernel::{
    DateRange, DomainPort, InstallmentId, InvoiceId, Money, OrgId, PaymentId, PortError, RefundId,
    Timezone,
};

use crate::config::OrgBillingConfig;
use crate::lesson::Lesson;
use crate::outbox::OutboxEntry;
use crate::payer::PayerKey;

/// Read-only access to lesson records
#[async_trait]
pub trait LessonSource: DomainPort {
    /// Lessons of the organisation whose start falls on a date inside
    /// `range`, evaluated in `timezone`
    async fn lessons_in_range(
        &self,
        org_id: OrgId,
        range: &DateRange,
        timezone: &Timezone,
    ) -> Result<Vec<Lesson>, PortError>;
}

/// Per-organisation billing settings
#[async_trait]
pub trait OrgConfigSource: DomainPort {
    /// Returns `PortError::NotFound` for an unknown organisation
    async fn billing_config(&self, org_id: OrgId) -> Result<OrgBillingConfig, PortError>;
}

/// A charge to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub org_id: OrgId,
    pub invoice_id: InvoiceId,
    pub installment_id: Option<InstallmentId>,
    pub payer: PayerKey,
    pub amount: Money,
}

/// Confirmation of a successful charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub gateway_reference: String,
    /// Payment channel the gateway used, e.g. "card"
    pub provider: String,
}

/// A refund to submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub org_id: OrgId,
    pub refund_id: RefundId,
    pub payment_id: PaymentId,
    /// Gateway reference of the original payment, if it went through the gateway
    pub payment_reference: Option<String>,
    pub amount: Money,
}

/// The gateway accepted a refund for processing. The outcome arrives later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundAck {
    pub gateway_reference: String,
}

/// Executes charges and refunds
#[async_trait]
pub trait PaymentGateway: DomainPort {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, PortError>;

    async fn submit_refund(&self, request: &RefundRequest) -> Result<RefundAck, PortError>;
}

/// Delivers billing events downstream (email, SMS)
#[async_trait]
pub trait Notifier: DomainPort {
    async fn notify(&self, entry: &OutboxEntry) -> Result<(), PortError>;
}
