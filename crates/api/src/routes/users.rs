//! Member management

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use seatline_billing::NewMember;
use seatline_shared::{Capability, User};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::{hash_password, validate_password_strength, AuthUser},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

pub async fn list_users(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<Vec<User>>> {
    auth_user.require(Capability::ViewMembers)?;
    Ok(Json(state.billing.seats.list_users(auth_user.org_id).await?))
}

/// Add a member, taking one seat
pub async fn add_user(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<AddUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    auth_user.require(Capability::ManageMembers)?;
    validate_password_strength(&req.password)?;
    let password_hash = hash_password(&req.password)?;

    let user = state
        .billing
        .seats
        .add_user(
            auth_user.org_id,
            NewMember {
                name: req.name,
                email: req.email,
                password_hash,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn set_user_active(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SetActiveRequest>,
) -> ApiResult<Json<User>> {
    auth_user.require(Capability::ManageMembers)?;
    let user = state
        .billing
        .seats
        .set_user_active(auth_user.org_id, user_id, req.is_active)
        .await?;
    Ok(Json(user))
}

pub async fn remove_user(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<User>> {
    auth_user.require(Capability::ManageMembers)?;
    let user = state
        .billing
        .seats
        .remove_user(auth_user.org_id, user_id)
        .await?;
    Ok(Json(user))
}
