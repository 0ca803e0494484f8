//! Payer resolution
//!
//! Maps each lesson participant to the party financially responsible for it:
//! the guardian when one is linked and flagged as primary payer, otherwise the
//! student. A group lesson can therefore resolve to several payers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use core_kernel::{GuardianId, StudentId};

use crate::lesson::{Lesson, Participant};

/// Kind of payer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayerType {
    Guardian,
    Student,
}

/// Identity of a payer
///
/// Guardian and student IDs live in different variants, so equal UUIDs of
/// different kinds never collide as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "payer_type", content = "payer_id", rename_all = "snake_case")]
pub enum PayerKey {
    Guardian(GuardianId),
    Student(StudentId),
}

impl PayerKey {
    pub fn payer_type(&self) -> PayerType {
        match self {
            PayerKey::Guardian(_) => PayerType::Guardian,
            PayerKey::Student(_) => PayerType::Student,
        }
    }

    pub fn payer_id(&self) -> Uuid {
        match self {
            PayerKey::Guardian(id) => *id.as_uuid(),
            PayerKey::Student(id) => *id.as_uuid(),
        }
    }
}

impl fmt::Display for PayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayerKey::Guardian(id) => write!(f, "{}", id),
            PayerKey::Student(id) => write!(f, "{}", id),
        }
    }
}

/// Resolves the payer for one participant
pub fn resolve_payer(participant: &Participant) -> PayerKey {
    match participant.guardian_id {
        Some(guardian_id) if participant.is_primary_payer => PayerKey::Guardian(guardian_id),
        _ => PayerKey::Student(participant.student_id),
    }
}

/// A payer's share of one lesson
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonPayer {
    pub payer: PayerKey,
    /// Students of this lesson covered by the payer, in participant order
    pub students: Vec<StudentId>,
}

/// Resolves every participant of a lesson, collapsing participants that
/// share a payer so each payer appears once per lesson
pub fn payers_for_lesson(lesson: &Lesson) -> Vec<LessonPayer> {
    let mut payers: Vec<LessonPayer> = Vec::new();

    for participant in &lesson.participants {
        let payer = resolve_payer(participant);
        match payers.iter_mut().find(|p| p.payer == payer) {
            Some(existing) => {
                if !existing.students.contains(&participant.student_id) {
                    existing.students.push(participant.student_id);
                }
            }
            None => payers.push(LessonPayer {
                payer,
                students: vec![participant.student_id],
            }),
        }
    }

    payers
}
