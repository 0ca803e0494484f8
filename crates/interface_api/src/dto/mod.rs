//! Request and response bodies

pub mod billing;
pub mod credits;
pub mod invoices;
pub mod payments;

use core_kernel::Money;
use validator::ValidationError;

pub(crate) fn money(minor: i64) -> Money {
    Money::from_minor(minor)
}

pub(crate) fn optional_money(minor: Option<i64>) -> Option<Money> {
    minor.map(Money::from_minor)
}

pub(crate) fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(message.into());
    error
}
