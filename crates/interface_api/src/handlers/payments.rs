//! Installment payment and refund handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use core_kernel::{InstallmentId, OrgId, PaymentId, RefundId};
use domain_billing::{RecordedPayment, Refund};

use crate::dto::payments::*;
use crate::dto::{money, optional_money};
use crate::extract::ValidatedJson;
use crate::{error::ApiError, AppState};

/// Records a payment against one installment
pub async fn pay_installment(
    State(state): State<AppState>,
    Path((org_id, installment_id)): Path<(OrgId, InstallmentId)>,
    ValidatedJson(request): ValidatedJson<InstallmentPaymentRequest>,
) -> Result<(StatusCode, Json<RecordedPayment>), ApiError> {
    let recorded = state.engine.record_installment_payment(
        org_id,
        installment_id,
        money(request.amount_minor),
        request.provider,
    )?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

/// Issues a refund against a payment
pub async fn issue_refund(
    State(state): State<AppState>,
    Path((org_id, payment_id)): Path<(OrgId, PaymentId)>,
    ValidatedJson(request): ValidatedJson<IssueRefundRequest>,
) -> Result<(StatusCode, Json<Refund>), ApiError> {
    let refund = state
        .engine
        .issue_refund(org_id, payment_id, optional_money(request.amount_minor), request.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

/// Gateway callback settling a pending refund
pub async fn settle_refund(
    State(state): State<AppState>,
    Path((org_id, refund_id)): Path<(OrgId, RefundId)>,
    ValidatedJson(request): ValidatedJson<SettleRefundRequest>,
) -> Result<Json<Refund>, ApiError> {
    Ok(Json(state.engine.settle_refund(org_id, refund_id, request.outcome).await?))
}
