use axum::{
    extract::{Path, State},
    response::Json,
};
use uuid::Uuid;

use crate::{
    auth::AdminUser,
    services::{reconciliation::ApplyOutcome, sweep::SweepReport},
    ApiResponse, ApiResult, AppState,
};

#[utoipa::path(
    post,
    path = "/api/v1/admin/webhook-events/{id}/replay",
    summary = "Replay a stored payment event",
    params(("id" = Uuid, Path, description = "Webhook event id")),
    responses(
        (status = 200, description = "Replay result", body = ApiResponse<ApplyOutcome>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Event not found", body = crate::errors::ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn replay_webhook_event(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<ApplyOutcome> {
    let outcome = state.payments.replay_event(id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/reconciliation/sweep",
    summary = "Run the reconciliation sweep now",
    responses(
        (status = 200, description = "Sweep report", body = ApiResponse<SweepReport>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
    ),
    tag = "admin"
)]
pub async fn run_sweep(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<SweepReport> {
    let report = state.sweep.run_once().await?;
    Ok(Json(ApiResponse::success(report)))
}
