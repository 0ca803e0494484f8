//! Lesson pricing
//!
//! Lessons carry no price of their own. The organisation's rate card gives
//! the per-lesson rate for each student, and invoice lines snapshot it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use core_kernel::{Money, StudentId};

use crate::error::{BillingError, BillingResult};

/// Per-lesson rates for an organisation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateCard {
    /// Rate used for students without an override
    pub default_rate: Money,
    /// Per-student overrides
    #[serde(default)]
    pub student_rates: HashMap<StudentId, Money>,
}

impl RateCard {
    pub fn new(default_rate: Money) -> Self {
        Self {
            default_rate,
            student_rates: HashMap::new(),
        }
    }

    pub fn with_student_rate(mut self, student_id: StudentId, rate: Money) -> Self {
        self.student_rates.insert(student_id, rate);
        self
    }

    /// Rate charged for one lesson attended by the student
    pub fn rate_for(&self, student_id: StudentId) -> Money {
        self.student_rates
            .get(&student_id)
            .copied()
            .unwrap_or(self.default_rate)
    }

    /// Rejects negative rates
    pub fn validate(&self) -> BillingResult<()> {
        if self.default_rate.is_negative() {
            return Err(BillingError::validation(format!(
                "Default rate {} is negative",
                self.default_rate
            )));
        }
        if let Some((student_id, rate)) = self.student_rates.iter().find(|(_, r)| r.is_negative()) {
            return Err(BillingError::validation(format!(
                "Rate {} for student {} is negative",
                rate, student_id
            )));
        }
        Ok(())
    }
}
