//! Notification outbox
//!
//! Billing state changes commit first and then record an event here.
//! Delivery happens later in `dispatch`, so a failing notifier can delay a
//! notification but never undo or block the change that caused it.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

use core_kernel::{CreditId, EventId, InstallmentId, InvoiceId, Money, OrgId, StudentId};

use crate::payer::PayerKey;
use crate::ports::Notifier;

/// Something downstream may want to tell a payer about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    InvoiceCreated {
        invoice_id: InvoiceId,
        invoice_number: String,
        payer: PayerKey,
        total: Money,
    },
    InvoiceOverdue {
        invoice_id: InvoiceId,
        invoice_number: String,
        payer: PayerKey,
        balance_due: Money,
        due_date: NaiveDate,
    },
    InstallmentOverdue {
        invoice_id: InvoiceId,
        installment_id: InstallmentId,
        sequence_number: u32,
        amount: Money,
        due_date: NaiveDate,
    },
    CreditIssued {
        credit_id: CreditId,
        student_id: StudentId,
        value: Money,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl BillingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::InvoiceCreated { .. } => "invoice_created",
            BillingEvent::InvoiceOverdue { .. } => "invoice_overdue",
            BillingEvent::InstallmentOverdue { .. } => "installment_overdue",
            BillingEvent::CreditIssued { .. } => "credit_issued",
        }
    }
}

/// A queued event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: EventId,
    pub org_id: OrgId,
    pub event: BillingEvent,
    pub recorded_at: DateTime<Utc>,
    /// Delivery attempts made so far
    pub attempts: u32,
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// In-process event queue
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<OutboxEntry>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, org_id: OrgId, event: BillingEvent, now: DateTime<Utc>) -> EventId {
        let entry = OutboxEntry {
            id: EventId::new_v7(),
            org_id,
            event,
            recorded_at: now,
            attempts: 0,
        };
        let id = entry.id;
        debug!(%org_id, event_id = %id, event = entry.event.name(), "Event recorded");
        self.queue.lock().push_back(entry);
        id
    }

    pub fn pending(&self) -> Vec<OutboxEntry> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Delivers queued events. Failed deliveries go back to the front of the
    /// queue until an entry has been tried `max_attempts` times, after which
    /// it is dropped and logged.
    pub async fn dispatch(&self, notifier: &dyn Notifier, max_attempts: u32) -> DispatchReport {
        let max_attempts = max_attempts.max(1);
        let batch: Vec<OutboxEntry> = self.queue.lock().drain(..).collect();

        let mut report = DispatchReport::default();
        let mut retry = Vec::new();

        for mut entry in batch {
            entry.attempts += 1;
            match notifier.notify(&entry).await {
                Ok(()) => report.delivered += 1,
                Err(e) if entry.attempts >= max_attempts => {
                    error!(
                        org_id = %entry.org_id,
                        event_id = %entry.id,
                        event = entry.event.name(),
                        attempts = entry.attempts,
                        error = %e,
                        "Dropping notification after final attempt"
                    );
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!(
                        org_id = %entry.org_id,
                        event_id = %entry.id,
                        event = entry.event.name(),
                        attempts = entry.attempts,
                        error = %e,
                        "Notification failed, will retry"
                    );
                    report.requeued += 1;
                    retry.push(entry);
                }
            }
        }

        if !retry.is_empty() {
            let mut queue = self.queue.lock();
            for entry in retry.into_iter().rev() {
                queue.push_front(entry);
            }
        }

        report
    }
}
