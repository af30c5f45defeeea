//! Plan catalog routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use seatline_billing::{NewPlan, PlanPatch};
use seatline_shared::{Capability, Plan};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Active plans, open to anyone
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.catalog.list_active().await?))
}

pub async fn create_plan(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    auth_user.require(Capability::ManagePlans)?;
    let plan = state.billing.catalog.create(req).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn update_plan(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(plan_id): Path<Uuid>,
    Json(req): Json<PlanPatch>,
) -> ApiResult<Json<Plan>> {
    auth_user.require(Capability::ManagePlans)?;
    Ok(Json(state.billing.catalog.update(plan_id, req).await?))
}

/// Plans are retired rather than deleted so orders keep their reference
pub async fn deactivate_plan(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<Plan>> {
    auth_user.require(Capability::ManagePlans)?;
    Ok(Json(state.billing.catalog.deactivate(plan_id).await?))
}
