//! Billing Domain - Lesson billing and make-up credit ledger
//!
//! This crate turns scheduled and delivered lessons into invoices for the
//! people who pay for them, and keeps the money flowing through those
//! invoices consistent.
//!
//! # Components
//!
//! - **Money/VAT**: integer minor-unit totals with half-up VAT rounding
//! - **Payer resolution**: a paying guardian, or the student themselves
//! - **Billing ledger**: each lesson is invoiced at most once per payer
//! - **Make-up credits**: issued on timely cancellation, redeemed once
//! - **Invoice builder**: groups lessons per payer and prices them
//! - **Installment plans**: splits an invoice into scheduled parts
//! - **Payments and refunds**: refunds never exceed what was paid
//! - **Billing engine**: orchestrates runs and owns the stores
//!
//! # Example
//!
//! ```rust,ignore
//! use domain_billing::BillingEngine;
//!
//! let engine = BillingEngine::new(lessons, configs, gateway, notifier);
//! let report = engine.run_billing(org_id, range, None).await?;
//!
//! for invoice in &report.invoices {
//!     println!("{} {} {}", invoice.invoice_number, invoice.payer, invoice.total);
//! }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adapters;
pub mod builder;
pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod installment;
pub mod invoice;
pub mod ledger;
pub mod lesson;
pub mod outbox;
pub mod payer;
pub mod payment;
pub mod ports;
pub mod rates;
pub mod vat;

pub use builder::{BuildOutcome, DraftInvoice, InvoiceBuilder, PayerBucket};
pub use config::{BillingMode, OrgBillingConfig, ZeroValueInvoicePolicy};
pub use credit::{check_eligibility, select_credits, CreditLedger, CreditState, MakeUpCredit, NewCredit};
pub use engine::{BillingEngine, BillingRunReport, CancellationCredits, OverdueRefresh, RecordedPayment};
pub use error::{BillingError, BillingResult, ErrorKind};
pub use installment::{
    Installment, InstallmentFrequency, InstallmentPlan, InstallmentPlanManager, InstallmentStatus,
    PlanRequest,
};
pub use invoice::{is_past_due, Invoice, InvoiceLine, InvoiceStatus, InvoiceStore};
pub use ledger::{BillingLedger, ClaimOutcome, LedgerSlot, LessonBill};
pub use lesson::{Lesson, LessonStatus, Participant};
pub use outbox::{BillingEvent, DispatchReport, Outbox, OutboxEntry};
pub use payer::{payers_for_lesson, resolve_payer, LessonPayer, PayerKey, PayerType};
pub use payment::{NewPayment, Payment, PaymentRecorder, Refund, RefundStatus};
pub use ports::{
    ChargeReceipt, ChargeRequest, LessonSource, Notifier, OrgConfigSource, PaymentGateway, RefundAck,
    RefundRequest,
};
pub use rates::RateCard;
pub use vat::{compute_invoice, ChargeLine, InvoiceTotals, VatConfig};
