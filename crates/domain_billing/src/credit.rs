//! Make-up credit ledger
//!
//! A credit is issued when a cancellation gives enough notice and can be
//! redeemed once against a later lesson. Expiry is never stored: a credit is
//! expired whenever `now > expires_at`.
//!
//! Redemption is a compare-and-set on the credit's own map entry. The shard
//! lock held by `get_mut` covers the check and the write, so concurrent
//! redeemers of one credit serialize and exactly one wins, while redemptions
//! of different credits proceed independently.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use core_kernel::{CreditId, LessonId, Money, OrgId, StudentId};

use crate::error::{BillingError, BillingResult};

/// Derived lifecycle state of a credit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditState {
    Issued,
    Redeemed,
    Expired,
}

/// A make-up credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeUpCredit {
    pub id: CreditId,
    pub org_id: OrgId,
    pub student_id: StudentId,
    /// Cancelled lesson the credit compensates, if any
    pub issued_for_lesson_id: Option<LessonId>,
    pub credit_value: Money,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub redeemed_lesson_id: Option<LessonId>,
}

impl MakeUpCredit {
    /// Redeemed wins over expired; a redeemed credit stays redeemed forever
    pub fn state(&self, now: DateTime<Utc>) -> CreditState {
        if self.redeemed_at.is_some() {
            CreditState::Redeemed
        } else if self.expires_at.is_some_and(|expiry| now > expiry) {
            CreditState::Expired
        } else {
            CreditState::Issued
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == CreditState::Issued
    }
}

/// Request to issue a credit
#[derive(Debug, Clone)]
pub struct NewCredit {
    pub org_id: OrgId,
    pub student_id: StudentId,
    pub issued_for_lesson_id: Option<LessonId>,
    pub value: Money,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Whether a cancellation earns a make-up credit.
///
/// Eligible iff the cancellation happened strictly before the lesson started
/// and at least `notice_hours` ahead of it.
pub fn check_eligibility(
    lesson_start_at: DateTime<Utc>,
    cancelled_at: DateTime<Utc>,
    notice_hours: u32,
) -> bool {
    if cancelled_at >= lesson_start_at {
        return false;
    }
    lesson_start_at - cancelled_at >= Duration::hours(i64::from(notice_hours))
}

/// Picks credits to offset `needed`, soonest-expiring first, stopping once
/// the chosen value covers it. Credits are indivisible.
pub fn select_credits(available: &[MakeUpCredit], needed: Money) -> Vec<MakeUpCredit> {
    let mut ordered: Vec<&MakeUpCredit> = available.iter().collect();
    ordered.sort_by_key(|c| expiry_order(c));

    let mut chosen = Vec::new();
    let mut covered = Money::ZERO;
    for credit in ordered {
        if covered >= needed {
            break;
        }
        covered = covered.checked_add(credit.credit_value).unwrap_or(Money::from_minor(i64::MAX));
        chosen.push(credit.clone());
    }
    chosen
}

// Never-expiring credits sort last.
fn expiry_order(credit: &MakeUpCredit) -> (bool, Option<DateTime<Utc>>, DateTime<Utc>) {
    (credit.expires_at.is_none(), credit.expires_at, credit.issued_at)
}

/// Store of make-up credits
#[derive(Debug, Default)]
pub struct CreditLedger {
    credits: DashMap<CreditId, MakeUpCredit>,
    /// One credit per student per cancelled lesson
    by_cancellation: DashMap<(OrgId, StudentId, LessonId), CreditId>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a credit in the `Issued` state
    ///
    /// # Errors
    ///
    /// - Validation if the value is not positive or the expiry is not after `now`
    /// - `CreditAlreadyIssued` if the student already holds a credit for the
    ///   same cancelled lesson
    pub fn issue_credit(&self, request: NewCredit, now: DateTime<Utc>) -> BillingResult<MakeUpCredit> {
        if !request.value.is_positive() {
            return Err(BillingError::validation(format!(
                "Credit value must be positive, got {}",
                request.value
            )));
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(BillingError::validation(format!(
                    "Credit expiry {} is not after issue time {}",
                    expires_at, now
                )));
            }
        }

        let credit = MakeUpCredit {
            id: CreditId::new_v7(),
            org_id: request.org_id,
            student_id: request.student_id,
            issued_for_lesson_id: request.issued_for_lesson_id,
            credit_value: request.value,
            issued_at: now,
            expires_at: request.expires_at,
            redeemed_at: None,
            redeemed_lesson_id: None,
        };

        if let Some(lesson_id) = request.issued_for_lesson_id {
            match self
                .by_cancellation
                .entry((request.org_id, request.student_id, lesson_id))
            {
                Entry::Occupied(_) => {
                    return Err(BillingError::CreditAlreadyIssued {
                        student_id: request.student_id,
                        lesson_id,
                    })
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(credit.id);
                }
            }
        }

        self.credits.insert(credit.id, credit.clone());

        info!(
            org_id = %credit.org_id,
            credit_id = %credit.id,
            student_id = %credit.student_id,
            value = credit.credit_value.minor(),
            "Make-up credit issued"
        );
        Ok(credit)
    }

    /// Redeems a credit against a lesson, atomically.
    ///
    /// # Errors
    ///
    /// - `CreditNotFound` if no such credit exists in the organisation
    /// - `CreditAlreadyRedeemed` if it was redeemed before
    /// - `CreditExpired` if `now` is past its expiry
    pub fn redeem_credit(
        &self,
        org_id: OrgId,
        credit_id: CreditId,
        target_lesson_id: LessonId,
        now: DateTime<Utc>,
    ) -> BillingResult<MakeUpCredit> {
        let mut credit = self
            .credits
            .get_mut(&credit_id)
            .filter(|c| c.org_id == org_id)
            .ok_or(BillingError::CreditNotFound(credit_id))?;

        match credit.state(now) {
            CreditState::Redeemed => {
                warn!(%org_id, %credit_id, "Credit already redeemed");
                return Err(BillingError::CreditAlreadyRedeemed {
                    credit_id,
                    redeemed_lesson_id: credit.redeemed_lesson_id,
                });
            }
            CreditState::Expired => {
                return Err(BillingError::CreditExpired {
                    credit_id,
                    expired_at: credit.expires_at.unwrap_or(now),
                });
            }
            CreditState::Issued => {}
        }

        credit.redeemed_at = Some(now);
        credit.redeemed_lesson_id = Some(target_lesson_id);

        info!(
            %org_id,
            %credit_id,
            lesson_id = %target_lesson_id,
            value = credit.credit_value.minor(),
            "Make-up credit redeemed"
        );
        Ok(credit.value().clone())
    }

    /// Unredeemed, unexpired credits for a student, soonest-expiring first
    pub fn available_credits(
        &self,
        org_id: OrgId,
        student_id: StudentId,
        now: DateTime<Utc>,
    ) -> Vec<MakeUpCredit> {
        let mut credits: Vec<MakeUpCredit> = self
            .credits
            .iter()
            .filter(|c| c.org_id == org_id && c.student_id == student_id && c.is_available(now))
            .map(|c| c.value().clone())
            .collect();
        credits.sort_by_key(expiry_order);
        credits
    }

    /// Sum of available credit value for a student
    pub fn total_available_value(
        &self,
        org_id: OrgId,
        student_id: StudentId,
        now: DateTime<Utc>,
    ) -> BillingResult<Money> {
        let values = self
            .available_credits(org_id, student_id, now)
            .into_iter()
            .map(|c| c.credit_value);
        Ok(Money::sum(values)?)
    }

    pub fn get(&self, org_id: OrgId, credit_id: CreditId) -> Option<MakeUpCredit> {
        self.credits
            .get(&credit_id)
            .filter(|c| c.org_id == org_id)
            .map(|c| c.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap()
    }

    fn request(org_id: OrgId, student_id: StudentId, value: i64) -> NewCredit {
        NewCredit {
            org_id,
            student_id,
            issued_for_lesson_id: None,
            value: Money::from_minor(value),
            expires_at: None,
        }
    }

    #[test]
    fn test_eligibility_boundaries() {
        let start = at(18);
        assert!(check_eligibility(start, at(18) - Duration::hours(24), 24));
        assert!(!check_eligibility(start, at(18) - Duration::hours(23), 24));
        assert!(!check_eligibility(start, start, 0));
        assert!(!check_eligibility(start, at(19), 0));
        assert!(check_eligibility(start, at(17), 0));
    }

    #[test]
    fn test_redeem_once() {
        let ledger = CreditLedger::new();
        let org = OrgId::new();
        let credit = ledger.issue_credit(request(org, StudentId::new(), 3000), at(9)).unwrap();
        let lesson = LessonId::new();

        let redeemed = ledger.redeem_credit(org, credit.id, lesson, at(10)).unwrap();
        assert_eq!(redeemed.redeemed_lesson_id, Some(lesson));
        assert_eq!(redeemed.state(at(10)), CreditState::Redeemed);

        let again = ledger.redeem_credit(org, credit.id, LessonId::new(), at(11));
        assert!(matches!(
            again,
            Err(BillingError::CreditAlreadyRedeemed { redeemed_lesson_id: Some(l), .. }) if l == lesson
        ));
    }

    #[test]
    fn test_expired_credit_cannot_be_redeemed() {
        let ledger = CreditLedger::new();
        let org = OrgId::new();
        let mut req = request(org, StudentId::new(), 3000);
        req.expires_at = Some(at(12));
        let credit = ledger.issue_credit(req, at(9)).unwrap();

        // Still valid at the exact expiry instant
        assert!(credit.is_available(at(12)));

        let result = ledger.redeem_credit(org, credit.id, LessonId::new(), at(13));
        assert!(matches!(result, Err(BillingError::CreditExpired { .. })));
        assert!(ledger.get(org, credit.id).unwrap().redeemed_at.is_none());
    }

    #[test]
    fn test_other_org_sees_not_found() {
        let ledger = CreditLedger::new();
        let credit = ledger
            .issue_credit(request(OrgId::new(), StudentId::new(), 3000), at(9))
            .unwrap();
        let result = ledger.redeem_credit(OrgId::new(), credit.id, LessonId::new(), at(10));
        assert!(matches!(result, Err(BillingError::CreditNotFound(_))));
    }

    #[test]
    fn test_duplicate_cancellation_credit_rejected() {
        let ledger = CreditLedger::new();
        let org = OrgId::new();
        let student = StudentId::new();
        let lesson = LessonId::new();
        let mut req = request(org, student, 3000);
        req.issued_for_lesson_id = Some(lesson);

        ledger.issue_credit(req.clone(), at(9)).unwrap();
        assert!(matches!(
            ledger.issue_credit(req, at(9)),
            Err(BillingError::CreditAlreadyIssued { .. })
        ));
    }

    #[test]
    fn test_non_positive_value_rejected() {
        let ledger = CreditLedger::new();
        let result = ledger.issue_credit(request(OrgId::new(), StudentId::new(), 0), at(9));
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[test]
    fn test_available_credits_and_total() {
        let ledger = CreditLedger::new();
        let org = OrgId::new();
        let student = StudentId::new();

        let mut late = request(org, student, 1000);
        late.expires_at = Some(at(20));
        let mut soon = request(org, student, 2000);
        soon.expires_at = Some(at(11));
        let late = ledger.issue_credit(late, at(9)).unwrap();
        let soon = ledger.issue_credit(soon, at(9)).unwrap();
        let forever = ledger.issue_credit(request(org, student, 500), at(9)).unwrap();
        let spent = ledger.issue_credit(request(org, student, 700), at(9)).unwrap();
        ledger.redeem_credit(org, spent.id, LessonId::new(), at(9)).unwrap();

        let ids: Vec<CreditId> = ledger
            .available_credits(org, student, at(10))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![soon.id, late.id, forever.id]);
        assert_eq!(
            ledger.total_available_value(org, student, at(10)).unwrap(),
            Money::from_minor(3500)
        );
        // After the 11:00 expiry only 1500 remains
        assert_eq!(
            ledger.total_available_value(org, student, at(12)).unwrap(),
            Money::from_minor(1500)
        );
    }

    #[test]
    fn test_select_credits_stops_when_covered() {
        let org = OrgId::new();
        let student = StudentId::new();
        let make = |value: i64, expiry: Option<u32>| MakeUpCredit {
            id: CreditId::new(),
            org_id: org,
            student_id: student,
            issued_for_lesson_id: None,
            credit_value: Money::from_minor(value),
            issued_at: at(1),
            expires_at: expiry.map(at),
            redeemed_at: None,
            redeemed_lesson_id: None,
        };
        let credits = vec![make(3000, None), make(1000, Some(5)), make(2500, Some(3))];

        let chosen = select_credits(&credits, Money::from_minor(3000));
        let values: Vec<i64> = chosen.iter().map(|c| c.credit_value.minor()).collect();
        assert_eq!(values, vec![2500, 1000]);

        assert!(select_credits(&credits, Money::ZERO).is_empty());
    }
}
