//! Invoice builder
//!
//! Turns billable lessons into one draft per payer. Drafts are priced but
//! not numbered or stored; the billing run commits them.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

use core_kernel::{LessonId, Money, OrgId, StudentId, Timezone};

use crate::config::{BillingMode, OrgBillingConfig};
use crate::credit::{select_credits, CreditLedger, MakeUpCredit};
use crate::error::BillingResult;
use crate::invoice::InvoiceLine;
use crate::lesson::Lesson;
use crate::ledger::BillingLedger;
use crate::payer::{payers_for_lesson, PayerKey};
use crate::vat::{compute_invoice, ChargeLine, InvoiceTotals, VatConfig};

/// Lessons owed by one payer in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayerBucket {
    pub payer: PayerKey,
    /// One line per lesson
    pub lines: Vec<InvoiceLine>,
    /// First lesson in the bucket for each covered student; credits of that
    /// student are redeemed against it
    pub covered: BTreeMap<StudentId, LessonId>,
}

impl PayerBucket {
    fn new(payer: PayerKey) -> Self {
        Self {
            payer,
            lines: Vec::new(),
            covered: BTreeMap::new(),
        }
    }

    pub fn charges(&self) -> Vec<ChargeLine> {
        self.lines.iter().map(InvoiceLine::charge).collect()
    }
}

/// A priced, unsaved invoice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftInvoice {
    pub bucket: PayerBucket,
    pub totals: InvoiceTotals,
    /// Credits chosen to produce `totals.credit_offset`
    pub credits: Vec<MakeUpCredit>,
}

/// Result of building drafts for a set of candidate lessons
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    pub drafts: Vec<DraftInvoice>,
    pub not_billable: Vec<LessonId>,
    pub already_billed: Vec<LessonId>,
}

/// Splits lessons into those the mode bills and the ids of the rest
pub fn select_billable(lessons: &[Lesson], mode: BillingMode) -> (Vec<Lesson>, Vec<LessonId>) {
    let mut billable = Vec::new();
    let mut skipped = Vec::new();
    for lesson in lessons {
        if mode.bills(lesson.status) && !lesson.participants.is_empty() {
            billable.push(lesson.clone());
        } else {
            skipped.push(lesson.id);
        }
    }
    (billable, skipped)
}

/// Groups lessons into payer buckets. A payer gets one line per lesson no
/// matter how many of its students attended; the line is priced at the
/// first such student's rate.
pub fn group_by_payer(lessons: &[Lesson], config: &OrgBillingConfig) -> BTreeMap<PayerKey, PayerBucket> {
    group_unbilled(lessons, &HashSet::new(), config)
}

/// Like [`group_by_payer`], leaving out the `(lesson, payer)` pairs in
/// `billed`
pub fn group_unbilled(
    lessons: &[Lesson],
    billed: &HashSet<(LessonId, PayerKey)>,
    config: &OrgBillingConfig,
) -> BTreeMap<PayerKey, PayerBucket> {
    let mut buckets: BTreeMap<PayerKey, PayerBucket> = BTreeMap::new();

    for lesson in lessons {
        for share in payers_for_lesson(lesson) {
            if billed.contains(&(lesson.id, share.payer)) {
                continue;
            }
            let Some(&student_id) = share.students.first() else {
                continue;
            };
            let bucket = buckets
                .entry(share.payer)
                .or_insert_with(|| PayerBucket::new(share.payer));

            bucket.lines.push(InvoiceLine::new(
                lesson.id,
                student_id,
                describe(lesson, &config.timezone),
                config.rate_card.rate_for(student_id),
            ));
            for student in share.students {
                bucket.covered.entry(student).or_insert(lesson.id);
            }
        }
    }

    buckets
}

fn describe(lesson: &Lesson, timezone: &Timezone) -> String {
    let local = lesson.start_at.with_timezone(&timezone.0);
    format!("Lesson on {}", local.format("%Y-%m-%d %H:%M"))
}

/// Builds drafts from already-claimed lessons
pub struct InvoiceBuilder<'a> {
    ledger: &'a BillingLedger,
    credits: &'a CreditLedger,
}

impl<'a> InvoiceBuilder<'a> {
    pub fn new(ledger: &'a BillingLedger, credits: &'a CreditLedger) -> Self {
        Self { ledger, credits }
    }

    /// Filters candidates by mode and ledger, groups them by payer and
    /// prices each bucket. Nothing is stored.
    pub fn build_invoices(
        &self,
        org_id: OrgId,
        candidates: &[Lesson],
        config: &OrgBillingConfig,
        now: DateTime<Utc>,
    ) -> BillingResult<BuildOutcome> {
        let (billable, not_billable) = select_billable(candidates, config.billing_mode);

        let unbilled: HashSet<LessonId> = self.ledger.filter_unbilled(org_id, &billable).into_iter().collect();
        let (fresh, billed): (Vec<Lesson>, Vec<Lesson>) =
            billable.into_iter().partition(|l| unbilled.contains(&l.id));
        let fresh_ids: Vec<LessonId> = fresh.iter().map(|l| l.id).collect();
        let billed_payers = self.ledger.billed_payers(org_id, &fresh_ids);

        Ok(BuildOutcome {
            drafts: self.draft_unbilled(org_id, &fresh, &billed_payers, config, now)?,
            not_billable,
            already_billed: billed.into_iter().map(|l| l.id).collect(),
        })
    }

    /// Groups and prices lessons the caller has already filtered
    pub fn draft_for_lessons(
        &self,
        org_id: OrgId,
        lessons: &[Lesson],
        config: &OrgBillingConfig,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<DraftInvoice>> {
        self.draft_unbilled(org_id, lessons, &HashSet::new(), config, now)
    }

    /// Groups and prices lessons, skipping payers in `billed` already
    /// charged for a lesson
    pub fn draft_unbilled(
        &self,
        org_id: OrgId,
        lessons: &[Lesson],
        billed: &HashSet<(LessonId, PayerKey)>,
        config: &OrgBillingConfig,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<DraftInvoice>> {
        let vat = config.vat_config()?;
        group_unbilled(lessons, billed, config)
            .into_values()
            .map(|bucket| {
                let available: Vec<MakeUpCredit> = if config.apply_make_up_credits {
                    bucket
                        .covered
                        .keys()
                        .flat_map(|student| self.credits.available_credits(org_id, *student, now))
                        .collect()
                } else {
                    Vec::new()
                };
                price_bucket(bucket, &vat, &available)
            })
            .collect()
    }
}

/// Prices a bucket, offsetting it with as few of `available` as cover the
/// gross amount
pub fn price_bucket(
    bucket: PayerBucket,
    vat: &VatConfig,
    available: &[MakeUpCredit],
) -> BillingResult<DraftInvoice> {
    let charges = bucket.charges();
    let gross = compute_invoice(&charges, vat, Money::ZERO)?.gross()?;

    let credits = select_credits(available, gross);
    let offset = Money::sum(credits.iter().map(|c| c.credit_value))?;
    let totals = compute_invoice(&charges, vat, offset)?;

    Ok(DraftInvoice {
        bucket,
        totals,
        credits,
    })
}
