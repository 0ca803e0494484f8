//! Billing domain errors

use chrono::{DateTime, Utc};
use thiserror::Error;

use core_kernel::{
    CreditId, InstallmentId, InvoiceId, LessonId, Money, MoneyError, OrgId, PaymentId, PortError,
    RefundId, StudentId, TemporalError,
};

/// Broad classification of a [`BillingError`]
///
/// Callers branch on the kind rather than on individual variants: a retrying
/// billing run treats `Conflict` on a lesson as already done, an API maps
/// `Dependency` to 503, and `Invariant` means a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any state mutation
    Validation,
    /// The referenced entity does not exist in this organisation
    NotFound,
    /// A concurrency or state-machine invariant would be violated
    Conflict,
    /// A collaborator (gateway, config store, scheduling system) failed
    Dependency,
    /// An internal invariant was broken; indicates a bug
    Invariant,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Invariant => "invariant",
        }
    }
}

/// Errors that can occur in the billing domain
#[derive(Debug, Error)]
pub enum BillingError {
    /// Input failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Organisation has no billing configuration
    #[error("Unknown organisation: {0}")]
    UnknownOrganisation(OrgId),

    /// Invoice not found
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    /// Installment plan not found for invoice
    #[error("No installment plan for invoice: {0}")]
    PlanNotFound(InvoiceId),

    /// Installment not found
    #[error("Installment not found: {0}")]
    InstallmentNotFound(InstallmentId),

    /// Payment not found
    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// Refund not found
    #[error("Refund not found: {0}")]
    RefundNotFound(RefundId),

    /// Make-up credit not found
    #[error("Credit not found: {0}")]
    CreditNotFound(CreditId),

    /// Credit was redeemed before
    #[error("Credit {credit_id} has already been redeemed")]
    CreditAlreadyRedeemed {
        credit_id: CreditId,
        redeemed_lesson_id: Option<LessonId>,
    },

    /// Credit passed its expiry
    #[error("Credit {credit_id} expired at {expired_at}")]
    CreditExpired {
        credit_id: CreditId,
        expired_at: DateTime<Utc>,
    },

    /// A credit already exists for this cancellation
    #[error("Student {student_id} already holds a credit for lesson {lesson_id}")]
    CreditAlreadyIssued {
        student_id: StudentId,
        lesson_id: LessonId,
    },

    /// Refund would exceed what remains refundable on the payment
    #[error("Refund of {requested} exceeds refundable amount {refundable} on payment {payment_id}")]
    ExceedsRefundable {
        payment_id: PaymentId,
        requested: Money,
        refundable: Money,
    },

    /// Refund has already reached a terminal status
    #[error("Refund {refund_id} already settled as {status}")]
    RefundAlreadySettled {
        refund_id: RefundId,
        status: String,
    },

    /// Installment plan cannot be removed once a payment landed
    #[error("Installment plan for invoice {invoice_id} has payments and cannot be removed")]
    PlanHasPayments { invoice_id: InvoiceId },

    /// Invoice already carries an installment plan
    #[error("Invoice {invoice_id} already has an installment plan")]
    PlanAlreadyExists { invoice_id: InvoiceId },

    /// Installment is already settled
    #[error("Installment {0} is already paid")]
    InstallmentAlreadyPaid(InstallmentId),

    /// Payment larger than the outstanding balance
    #[error("Payment of {requested} exceeds balance due {balance} on invoice {invoice_id}")]
    Overpayment {
        invoice_id: InvoiceId,
        requested: Money,
        balance: Money,
    },

    /// Invalid state transition attempted
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidStatusTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Money arithmetic failed
    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    /// Date arithmetic or range failed
    #[error("Temporal error: {0}")]
    Temporal(#[from] TemporalError),

    /// A collaborator failed
    #[error("Dependency failure: {0}")]
    Dependency(#[from] PortError),

    /// An internal invariant does not hold
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    /// Reports a broken invariant. Panics in debug builds so tests and CI
    /// fail loudly; release builds log and refuse the operation.
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "Billing invariant violated");
        if cfg!(debug_assertions) {
            panic!("billing invariant violated: {}", message);
        }
        BillingError::InvariantViolation(message)
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        BillingError::InvalidStatusTransition {
            entity,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    /// Returns the error's kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Validation(_)
            | BillingError::UnknownOrganisation(_)
            | BillingError::Money(_)
            | BillingError::Temporal(_) => ErrorKind::Validation,

            BillingError::InvoiceNotFound(_)
            | BillingError::PlanNotFound(_)
            | BillingError::InstallmentNotFound(_)
            | BillingError::PaymentNotFound(_)
            | BillingError::RefundNotFound(_)
            | BillingError::CreditNotFound(_) => ErrorKind::NotFound,

            BillingError::CreditAlreadyRedeemed { .. }
            | BillingError::CreditExpired { .. }
            | BillingError::CreditAlreadyIssued { .. }
            | BillingError::ExceedsRefundable { .. }
            | BillingError::RefundAlreadySettled { .. }
            | BillingError::PlanHasPayments { .. }
            | BillingError::PlanAlreadyExists { .. }
            | BillingError::InstallmentAlreadyPaid(_)
            | BillingError::Overpayment { .. }
            | BillingError::InvalidStatusTransition { .. } => ErrorKind::Conflict,

            BillingError::Dependency(_) => ErrorKind::Dependency,

            BillingError::InvariantViolation(_) => ErrorKind::Invariant,
        }
    }

    /// Stable machine-readable code for the variant
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation_failed",
            BillingError::UnknownOrganisation(_) => "unknown_organisation",
            BillingError::InvoiceNotFound(_) => "invoice_not_found",
            BillingError::PlanNotFound(_) => "plan_not_found",
            BillingError::InstallmentNotFound(_) => "installment_not_found",
            BillingError::PaymentNotFound(_) => "payment_not_found",
            BillingError::RefundNotFound(_) => "refund_not_found",
            BillingError::CreditNotFound(_) => "credit_not_found",
            BillingError::CreditAlreadyRedeemed { .. } => "credit_already_redeemed",
            BillingError::CreditExpired { .. } => "credit_expired",
            BillingError::CreditAlreadyIssued { .. } => "credit_already_issued",
            BillingError::ExceedsRefundable { .. } => "exceeds_refundable",
            BillingError::RefundAlreadySettled { .. } => "refund_already_settled",
            BillingError::PlanHasPayments { .. } => "plan_has_payments",
            BillingError::PlanAlreadyExists { .. } => "plan_already_exists",
            BillingError::InstallmentAlreadyPaid(_) => "installment_already_paid",
            BillingError::Overpayment { .. } => "overpayment",
            BillingError::InvalidStatusTransition { .. } => "invalid_status_transition",
            BillingError::Money(_) => "invalid_amount",
            BillingError::Temporal(_) => "invalid_date",
            BillingError::Dependency(_) => "dependency_failure",
            BillingError::InvariantViolation(_) => "invariant_violation",
        }
    }

    /// Returns true if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Dependency(e) if e.is_transient())
    }
}

/// Result alias for billing operations
pub type BillingResult<T> = Result<T, BillingError>;
