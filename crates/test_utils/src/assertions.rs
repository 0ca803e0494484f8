//! Custom assertion helpers for domain types
//!
//! Provides domain-specific assertions that give better error messages
//! than standard assertions when tests fail.

use std::collections::HashSet;
use std::fmt::Debug;

use core_kernel::{LessonId, Money};
use domain_billing::{
    BillingError, ErrorKind, InstallmentPlan, InstallmentStatus, Invoice, InvoiceStatus, PayerKey,
};

/// Asserts that a Money value equals an amount in minor units
pub fn assert_money_eq(actual: Money, expected_minor: i64) {
    assert_eq!(
        actual.minor(),
        expected_minor,
        "Expected {} minor units, got {}",
        expected_minor,
        actual
    );
}

/// Asserts that money values sum to a total
///
/// # Panics
///
/// Panics if the sum doesn't equal the total
pub fn assert_money_sum_equals(parts: &[Money], total: Money) {
    let sum = Money::sum(parts.iter().copied()).expect("Overflow in sum");
    assert_eq!(
        sum, total,
        "Sum of parts ({}) doesn't equal total ({})",
        sum, total
    );
}

/// Asserts an invoice's stored figures agree with its lines and that
/// `total = max(0, subtotal + tax - credit_offset)`
pub fn assert_invoice_consistent(invoice: &Invoice) {
    if let Err(e) = invoice.check_totals() {
        panic!("Invoice {} is inconsistent: {}", invoice.invoice_number, e);
    }
    assert!(
        !invoice.total.is_negative(),
        "Invoice {} has negative total {}",
        invoice.invoice_number,
        invoice.total
    );
    assert!(
        invoice.paid <= invoice.total,
        "Invoice {} is overpaid: paid {} of {}",
        invoice.invoice_number,
        invoice.paid,
        invoice.total
    );
}

/// Asserts the invoice has the expected subtotal, tax and total in minor units
pub fn assert_invoice_totals(invoice: &Invoice, subtotal: i64, tax: i64, total: i64) {
    assert_invoice_consistent(invoice);
    assert_eq!(
        (invoice.subtotal.minor(), invoice.tax.minor(), invoice.total.minor()),
        (subtotal, tax, total),
        "Invoice {} totals (subtotal, tax, total)",
        invoice.invoice_number
    );
}

pub fn assert_invoice_status(invoice: &Invoice, expected: InvoiceStatus) {
    assert_eq!(
        invoice.status, expected,
        "Invoice {} status",
        invoice.invoice_number
    );
}

/// Asserts the installments of a plan sum to its invoice's total, are
/// numbered from 1 and fall due in order
pub fn assert_plan_matches_invoice(plan: &InstallmentPlan, invoice: &Invoice) {
    assert_eq!(plan.invoice_id, invoice.id, "Plan belongs to another invoice");
    let amounts: Vec<Money> = plan.installments.iter().map(|i| i.amount).collect();
    assert_money_sum_equals(&amounts, invoice.total);

    for (index, installment) in plan.installments.iter().enumerate() {
        assert_eq!(
            installment.sequence_number as usize,
            index + 1,
            "Installments out of sequence"
        );
    }
    assert!(
        plan.installments.windows(2).all(|w| w[0].due_date <= w[1].due_date),
        "Installment due dates are not ascending"
    );
}

/// Asserts every installment in the plan has the given status
pub fn assert_all_installments(plan: &InstallmentPlan, expected: InstallmentStatus) {
    for installment in &plan.installments {
        assert_eq!(
            installment.status, expected,
            "Installment {} status",
            installment.sequence_number
        );
    }
}

/// Asserts no lesson is billed to the same payer on more than one
/// non-void invoice
pub fn assert_lessons_billed_once(invoices: &[Invoice]) {
    let mut seen: HashSet<(LessonId, PayerKey)> = HashSet::new();
    for invoice in invoices.iter().filter(|i| i.status != InvoiceStatus::Void) {
        for lesson_id in invoice.lesson_ids() {
            assert!(
                seen.insert((lesson_id, invoice.payer)),
                "Lesson {} billed twice to {:?} (second time on {})",
                lesson_id,
                invoice.payer,
                invoice.invoice_number
            );
        }
    }
}

/// Asserts a result failed with an error of the given kind
pub fn assert_error_kind<T: Debug>(result: Result<T, BillingError>, expected: ErrorKind) -> BillingError {
    match result {
        Ok(value) => panic!("Expected {:?} error, got Ok({:?})", expected, value),
        Err(e) => {
            assert_eq!(e.kind(), expected, "Unexpected error kind for: {}", e);
            e
        }
    }
}
