//! Configuration, lesson ingestion, billing run and overdue handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use core_kernel::{DateRange, OrgId};
use domain_billing::{BillingError, BillingRunReport, OrgBillingConfig, OverdueRefresh};

use crate::dto::billing::*;
use crate::extract::ValidatedJson;
use crate::{error::ApiError, AppState};

/// Replaces an organisation's billing configuration
pub async fn put_config(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
    ValidatedJson(request): ValidatedJson<UpdateConfigRequest>,
) -> Result<Json<OrgBillingConfig>, ApiError> {
    let config = OrgBillingConfig::from(request);
    config.validate()?;
    state.configs.put(org_id, config.clone());
    info!(%org_id, mode = ?config.billing_mode, vat_enabled = config.vat_enabled, "Billing configuration updated");
    Ok(Json(config))
}

/// Inserts or replaces lessons fed from the scheduling system
pub async fn upsert_lessons(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
    ValidatedJson(request): ValidatedJson<UpsertLessonsRequest>,
) -> Result<(StatusCode, Json<UpsertLessonsResponse>), ApiError> {
    let mut lesson_ids = Vec::with_capacity(request.lessons.len());
    for lesson in request.lessons {
        let lesson = lesson.into_lesson(org_id);
        if let Some(existing) = state.lessons.get(lesson.id) {
            if existing.org_id != org_id {
                return Err(ApiError::NotFound(format!("Lesson {} not found", lesson.id)));
            }
        }
        lesson_ids.push(lesson.id);
        state.lessons.upsert(lesson);
    }
    Ok((StatusCode::CREATED, Json(UpsertLessonsResponse { lesson_ids })))
}

/// Runs billing for a date range
pub async fn run_billing(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
    ValidatedJson(request): ValidatedJson<BillingRunRequest>,
) -> Result<(StatusCode, Json<BillingRunReport>), ApiError> {
    let range = DateRange::new(request.start_date, request.end_date).map_err(BillingError::from)?;
    let report = state.engine.run_billing(org_id, range, request.mode).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// Refreshes cached overdue statuses
pub async fn refresh_overdue(
    State(state): State<AppState>,
    Path(org_id): Path<OrgId>,
) -> Result<Json<OverdueRefresh>, ApiError> {
    Ok(Json(state.engine.refresh_overdue(org_id).await?))
}
