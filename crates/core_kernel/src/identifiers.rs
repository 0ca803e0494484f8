//! Strongly-typed identifiers for domain entities
//!
//! Newtype wrappers around UUIDs keep a guardian ID from ever being passed
//! where a student ID is expected, even though both are plain UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates a new time-ordered identifier (v7)
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            /// Creates from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Returns the identifier prefix for display
            pub fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                // Strip prefix if present
                let uuid_str = s.strip_prefix(concat!($prefix, "-")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

// Organisation partition key
define_id!(OrgId, "ORG");

// Scheduling identifiers (owned by the scheduling system, consumed read-only)
define_id!(LessonId, "LSN");
define_id!(StudentId, "STU");
define_id!(GuardianId, "GRD");

// Invoicing identifiers
define_id!(BillingRunId, "RUN");
define_id!(InvoiceId, "INV");
define_id!(InvoiceLineId, "INVL");
define_id!(InstallmentPlanId, "IPL");
define_id!(InstallmentId, "INST");

// Money movement identifiers
define_id!(PaymentId, "PAY");
define_id!(RefundId, "RFD");

// Make-up credit identifiers
define_id!(CreditId, "CRD");

// Outbox identifiers
define_id!(EventId, "EVT");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lesson_id_display() {
        let id = LessonId::new();
        let display = id.to_string();
        assert!(display.starts_with("LSN-"));
    }

    #[test]
    fn test_id_parsing() {
        let original = CreditId::new();
        let parsed: CreditId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_uuid_conversion() {
        let uuid = Uuid::new_v4();
        let guardian_id = GuardianId::from(uuid);
        let back: Uuid = guardian_id.into();
        assert_eq!(uuid, back);
    }
}
