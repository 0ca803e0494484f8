//! Lesson records as supplied by the scheduling system
//!
//! Billing reads lessons and never modifies them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{GuardianId, LessonId, OrgId, StudentId};

/// Lesson status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    /// Booked, not yet delivered
    Scheduled,
    /// Delivered
    Completed,
    /// Called off; never billable
    Cancelled,
}

/// A student attending a lesson
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Attending student
    pub student_id: StudentId,
    /// Guardian linked to the student, if any
    pub guardian_id: Option<GuardianId>,
    /// Whether the guardian pays for this student
    pub is_primary_payer: bool,
}

impl Participant {
    /// A student who pays for themselves
    pub fn student(student_id: StudentId) -> Self {
        Self {
            student_id,
            guardian_id: None,
            is_primary_payer: false,
        }
    }

    /// A student whose guardian pays
    pub fn with_paying_guardian(student_id: StudentId, guardian_id: GuardianId) -> Self {
        Self {
            student_id,
            guardian_id: Some(guardian_id),
            is_primary_payer: true,
        }
    }
}

/// A lesson
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub org_id: OrgId,
    pub status: LessonStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

impl Lesson {
    /// Creates a scheduled lesson with no participants
    pub fn new(org_id: OrgId, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        Self {
            id: LessonId::new_v7(),
            org_id,
            status: LessonStatus::Scheduled,
            start_at,
            end_at,
            participants: Vec::new(),
        }
    }

    /// Sets the status
    pub fn with_status(mut self, status: LessonStatus) -> Self {
        self.status = status;
        self
    }

    /// Adds a participant
    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants.push(participant);
        self
    }

    /// Returns true if the student attends this lesson
    pub fn has_student(&self, student_id: StudentId) -> bool {
        self.participants.iter().any(|p| p.student_id == student_id)
    }
}
