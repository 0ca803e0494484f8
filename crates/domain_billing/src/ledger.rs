//! Billing ledger
//!
//! The authority on which lessons have been billed, and to whom. Each lesson
//! has at most one slot per organisation holding one bill per payer:
//!
//! ```text
//!   (absent) ──claim──▶ Claimed { run, bills } ──release──▶ Billed { bills }
//!       ▲                     ▲   │ attach / waive                │
//!       │                     └───┼───────── claim ───────────────┘
//!       └──── release (no bills) ─┘◀──── detach (last bill) ───────┘
//! ```
//!
//! `claim` is the atomic check-and-register point. It takes the per-lesson
//! entry lock, so two runs racing for the same lesson see exactly one winner;
//! the loser excludes the lesson without treating it as an error. A group
//! lesson whose payers were only partly billed can be claimed again, and the
//! run then bills only the payers still missing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use core_kernel::{BillingRunId, InvoiceId, LessonId, OrgId};

use crate::error::{BillingError, BillingResult};
use crate::lesson::Lesson;
use crate::payer::{payers_for_lesson, PayerKey};

/// One payer's bill for a lesson
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LessonBill {
    pub payer: PayerKey,
    pub run_id: BillingRunId,
    /// `None` when the bill came to zero and its invoice was suppressed
    pub invoice_id: Option<InvoiceId>,
}

/// State of one lesson in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LedgerSlot {
    /// Reserved by a billing run that has not finished yet
    Claimed {
        run_id: BillingRunId,
        bills: Vec<LessonBill>,
    },
    /// Billed to one or more payers and not held by any run
    Billed { bills: Vec<LessonBill> },
}

impl LedgerSlot {
    pub fn bills(&self) -> &[LessonBill] {
        match self {
            LedgerSlot::Claimed { bills, .. } | LedgerSlot::Billed { bills } => bills,
        }
    }

    fn bills_mut(&mut self) -> &mut Vec<LessonBill> {
        match self {
            LedgerSlot::Claimed { bills, .. } | LedgerSlot::Billed { bills } => bills,
        }
    }

    fn is_billed_to(&self, payer: PayerKey) -> bool {
        self.bills().iter().any(|bill| bill.payer == payer)
    }
}

/// Result of claiming a batch of lessons for a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Lessons now reserved for the run
    pub claimed: Vec<LessonId>,
    /// Lessons reserved by a concurrent run
    pub contested: Vec<LessonId>,
}

/// Lesson-keyed index of billed lessons
#[derive(Debug, Default)]
pub struct BillingLedger {
    entries: DashMap<(OrgId, LessonId), LedgerSlot>,
}

impl BillingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidates that still owe a bill to at least one of their
    /// payers, preserving order.
    ///
    /// Lessons claimed by an in-flight run are still returned; `claim` decides
    /// who gets them.
    pub fn filter_unbilled(&self, org_id: OrgId, candidates: &[Lesson]) -> Vec<LessonId> {
        candidates
            .iter()
            .filter(|lesson| match self.entries.get(&(org_id, lesson.id)).as_deref() {
                None | Some(LedgerSlot::Claimed { .. }) => true,
                Some(slot) => payers_for_lesson(lesson)
                    .iter()
                    .any(|share| !slot.is_billed_to(share.payer)),
            })
            .map(|lesson| lesson.id)
            .collect()
    }

    /// Reserves lessons for a run, one entry lock at a time. Bills already on
    /// a lesson stay with it.
    ///
    /// Re-claiming a lesson the same run already holds is a no-op success.
    pub fn claim(&self, org_id: OrgId, run_id: BillingRunId, lessons: &[LessonId]) -> ClaimOutcome {
        let mut outcome = ClaimOutcome::default();

        for &lesson_id in lessons {
            match self.entries.entry((org_id, lesson_id)) {
                Entry::Vacant(vacant) => {
                    vacant.insert(LedgerSlot::Claimed {
                        run_id,
                        bills: Vec::new(),
                    });
                    outcome.claimed.push(lesson_id);
                }
                Entry::Occupied(mut occupied) => match occupied.get_mut() {
                    LedgerSlot::Claimed { run_id: holder, .. } if *holder == run_id => {
                        outcome.claimed.push(lesson_id);
                    }
                    LedgerSlot::Claimed { run_id: holder, .. } => {
                        debug!(%org_id, %lesson_id, %holder, "Lesson claimed by another run");
                        outcome.contested.push(lesson_id);
                    }
                    slot @ LedgerSlot::Billed { .. } => {
                        let bills = std::mem::take(slot.bills_mut());
                        *slot = LedgerSlot::Claimed { run_id, bills };
                        outcome.claimed.push(lesson_id);
                    }
                },
            }
        }

        outcome
    }

    /// Payers already billed for each of the given lessons
    pub fn billed_payers(&self, org_id: OrgId, lessons: &[LessonId]) -> HashSet<(LessonId, PayerKey)> {
        lessons
            .iter()
            .filter_map(|lesson_id| {
                self.entries
                    .get(&(org_id, *lesson_id))
                    .map(|slot| slot.bills().iter().map(|bill| (*lesson_id, bill.payer)).collect::<Vec<_>>())
            })
            .flatten()
            .collect()
    }

    /// Bills a claimed lesson to a payer on an invoice
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the run does not hold the lesson or
    /// the payer was already billed for it
    pub fn attach(
        &self,
        org_id: OrgId,
        run_id: BillingRunId,
        lesson_id: LessonId,
        payer: PayerKey,
        invoice_id: InvoiceId,
    ) -> BillingResult<()> {
        self.record_bill(org_id, lesson_id, LessonBill {
            payer,
            run_id,
            invoice_id: Some(invoice_id),
        })
    }

    /// Bills a claimed lesson to a payer whose zero-value invoice was
    /// suppressed. The lesson counts as billed to that payer.
    ///
    /// # Errors
    ///
    /// Same as [`BillingLedger::attach`]
    pub fn waive(
        &self,
        org_id: OrgId,
        run_id: BillingRunId,
        lesson_id: LessonId,
        payer: PayerKey,
    ) -> BillingResult<()> {
        self.record_bill(org_id, lesson_id, LessonBill {
            payer,
            run_id,
            invoice_id: None,
        })
    }

    fn record_bill(&self, org_id: OrgId, lesson_id: LessonId, bill: LessonBill) -> BillingResult<()> {
        let mut slot = self.entries.get_mut(&(org_id, lesson_id)).ok_or_else(|| {
            BillingError::invariant(format!("Lesson {} billed without a claim", lesson_id))
        })?;

        match slot.value_mut() {
            LedgerSlot::Claimed { run_id: holder, bills } if *holder == bill.run_id => {
                if bills.iter().any(|b| b.payer == bill.payer) {
                    return Err(BillingError::invariant(format!(
                        "Lesson {} already billed to {}",
                        lesson_id, bill.payer
                    )));
                }
                bills.push(bill);
                Ok(())
            }
            other => Err(BillingError::invariant(format!(
                "Run {} billed lesson {} held as {:?}",
                bill.run_id, lesson_id, other
            ))),
        }
    }

    /// Ends the run's hold on its lessons. Lessons with bills stay billed;
    /// the rest are dropped. Returns how many were dropped.
    pub fn release_claims(&self, org_id: OrgId, run_id: BillingRunId, lessons: &[LessonId]) -> usize {
        let mut dropped = 0;
        for lesson_id in lessons {
            let key = (org_id, *lesson_id);
            if let Some(mut slot) = self.entries.get_mut(&key) {
                if let LedgerSlot::Claimed { run_id: holder, bills } = slot.value_mut() {
                    if *holder == run_id && !bills.is_empty() {
                        let bills = std::mem::take(bills);
                        *slot.value_mut() = LedgerSlot::Billed { bills };
                    }
                }
            }
            let removed = self.entries.remove_if(&key, |_, slot| {
                matches!(slot, LedgerSlot::Claimed { run_id: holder, bills } if *holder == run_id && bills.is_empty())
            });
            if removed.is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Removes a voided invoice's bill from a lesson. The payer can be billed
    /// for the lesson again, and the lesson is forgotten once no bill is left.
    pub fn detach(&self, org_id: OrgId, lesson_id: LessonId, invoice_id: InvoiceId) {
        let key = (org_id, lesson_id);
        if let Some(mut slot) = self.entries.get_mut(&key) {
            slot.bills_mut().retain(|bill| bill.invoice_id != Some(invoice_id));
        }
        self.entries.remove_if(&key, |_, slot| {
            matches!(slot, LedgerSlot::Billed { bills } if bills.is_empty())
        });
    }

    /// Invoices a lesson is attached to
    pub fn invoices_for(&self, org_id: OrgId, lesson_id: LessonId) -> Vec<InvoiceId> {
        self.entries
            .get(&(org_id, lesson_id))
            .map(|slot| slot.bills().iter().filter_map(|bill| bill.invoice_id).collect())
            .unwrap_or_default()
    }

    /// Whether any payer has been billed for the lesson
    pub fn is_billed(&self, org_id: OrgId, lesson_id: LessonId) -> bool {
        self.entries
            .get(&(org_id, lesson_id))
            .is_some_and(|slot| !slot.bills().is_empty())
    }

    pub fn slot(&self, org_id: OrgId, lesson_id: LessonId) -> Option<LedgerSlot> {
        self.entries.get(&(org_id, lesson_id)).map(|slot| slot.clone())
    }
}
