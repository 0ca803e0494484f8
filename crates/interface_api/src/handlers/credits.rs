//! Make-up credit handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use core_kernel::{CreditId, OrgId, StudentId};
use domain_billing::{CancellationCredits, MakeUpCredit};

use crate::dto::credits::*;
use crate::dto::{money, optional_money};
use crate::extract::ValidatedJson;
use crate::{error::ApiError, AppState};

/// Issues a credit directly
pub async fn issue_credit(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
    ValidatedJson(request): ValidatedJson<IssueCreditRequest>,
) -> Result<(StatusCode, Json<MakeUpCredit>), ApiError> {
    let credit = state
        .engine
        .issue_credit(
            org_id,
            request.student_id,
            request.lesson_id,
            money(request.value_minor),
            request.expires_at,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(credit)))
}

/// Issues credits for a cancelled lesson if enough notice was given
pub async fn credit_cancellation(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
    ValidatedJson(request): ValidatedJson<CancellationCreditRequest>,
) -> Result<Json<CancellationCredits>, ApiError> {
    let lesson = state
        .lessons
        .get(request.lesson_id)
        .filter(|lesson| lesson.org_id == org_id)
        .ok_or_else(|| ApiError::NotFound(format!("Lesson {} not found", request.lesson_id)))?;

    let outcome = state
        .engine
        .issue_credit_for_cancellation(org_id, &lesson, request.cancelled_at, optional_money(request.value_minor))
        .await?;
    Ok(Json(outcome))
}

/// Redeems a credit against a lesson
pub async fn redeem_credit(
    State(state): State<AppState>,
    Path((org_id, credit_id)): Path<(OrgId, CreditId)>,
    ValidatedJson(request): ValidatedJson<RedeemCreditRequest>,
) -> Result<Json<MakeUpCredit>, ApiError> {
    Ok(Json(state.engine.redeem_credit(org_id, credit_id, request.lesson_id)?))
}

/// Lists a student's unexpired, unredeemed credits, soonest expiry first
pub async fn student_credits(
    State(state): State<AppState>,
    Path((org_id, student_id)): Path<(OrgId, StudentId)>,
) -> Result<Json<StudentCreditsResponse>, ApiError> {
    Ok(Json(StudentCreditsResponse {
        student_id,
        total_available: state.engine.total_available_credit(org_id, student_id)?,
        credits: state.engine.available_credits(org_id, student_id),
    }))
}
