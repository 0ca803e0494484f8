//! Invoice handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use core_kernel::{InvoiceId, OrgId};
use domain_billing::{InstallmentPlan, Invoice, RecordedPayment};

use crate::dto::invoices::*;
use crate::dto::{money, optional_money};
use crate::extract::ValidatedJson;
use crate::{error::ApiError, AppState};

/// Lists invoices, optionally filtered by status
pub async fn list_invoices(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
    Query(query): Query<InvoiceQuery>,
) -> Json<Vec<Invoice>> {
    Json(state.engine.list_invoices(org_id, query.status))
}

/// Gets an invoice by ID
pub async fn get_invoice(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.get_invoice(org_id, invoice_id)?))
}

/// Marks a draft invoice as sent
pub async fn send_invoice(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.send_invoice(org_id, invoice_id)?))
}

/// Voids an unpaid invoice
pub async fn void_invoice(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
) -> Result<Json<Invoice>, ApiError> {
    Ok(Json(state.engine.void_invoice(org_id, invoice_id)?))
}

/// Records a payment received outside the gateway
pub async fn record_payment(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
    ValidatedJson(request): ValidatedJson<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<RecordedPayment>), ApiError> {
    let recorded = state
        .engine
        .record_payment(org_id, invoice_id, money(request.amount_minor), request.provider)?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

/// Charges the payer through the payment gateway
pub async fn charge_invoice(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
    ValidatedJson(request): ValidatedJson<ChargeInvoiceRequest>,
) -> Result<(StatusCode, Json<RecordedPayment>), ApiError> {
    let recorded = state
        .engine
        .charge_invoice(org_id, invoice_id, optional_money(request.amount_minor))
        .await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

/// Splits an invoice into installments
pub async fn create_plan(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
    ValidatedJson(request): ValidatedJson<CreatePlanRequest>,
) -> Result<(StatusCode, Json<InstallmentPlan>), ApiError> {
    let plan = state
        .engine
        .create_installment_plan(org_id, invoice_id, request.into())?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// Gets an invoice's installment plan
pub async fn get_plan(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
) -> Result<Json<InstallmentPlan>, ApiError> {
    Ok(Json(state.engine.installment_plan(org_id, invoice_id)?))
}

/// Removes an installment plan that has no payments
pub async fn remove_plan(
    State(state): State<AppState>,
    Path((org_id, invoice_id)): Path<(OrgId, InvoiceId)>,
) -> Result<StatusCode, ApiError> {
    state.engine.remove_installment_plan(org_id, invoice_id)?;
    Ok(StatusCode::NO_CONTENT)
}
