//! Test Utilities Crate
//!
//! Provides shared test infrastructure, fixtures, and helpers for the
//! lesson billing test suite.
//!
//! # Modules
//!
//! - `fixtures`: Pre-built test data for common entities
//! - `builders`: Builder patterns for lessons and organisation settings
//! - `assertions`: Custom assertion helpers for invoices, plans and money
//! - `generators`: Property-based test data generators

#![allow(clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;
pub mod builders;
pub mod assertions;
pub mod generators;

pub use fixtures::*;
pub use builders::*;
pub use assertions::*;
pub use generators::*;
