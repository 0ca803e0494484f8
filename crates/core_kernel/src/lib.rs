//! Core Kernel - Foundational types for the lesson billing engine
//!
//! This crate provides the building blocks shared by the billing domain and
//! its API surface:
//! - Money as integer minor units, plus exact percentage arithmetic
//! - Strongly-typed identifiers
//! - Temporal helpers (org-local dates, clocks)
//! - Port error types for external collaborators

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod money;
pub mod temporal;
pub mod identifiers;
pub mod ports;

pub use money::{Money, MoneyError, Percentage};
pub use temporal::{Clock, DateRange, FixedClock, SystemClock, TemporalError, Timezone};
pub use identifiers::{
    BillingRunId, CreditId, EventId, GuardianId, InstallmentId, InstallmentPlanId, InvoiceId,
    InvoiceLineId, LessonId, OrgId, PaymentId, RefundId, StudentId,
};
pub use ports::{DomainPort, PortError};
