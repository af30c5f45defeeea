//! Registration, login and the signed-in identity

use axum::{extract::State, http::StatusCode, Json};
use seatline_billing::{NewMember, RegisterOrganization};
use seatline_shared::{BillingAddress, Organization, User};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::{hash_password, validate_password_strength, verify_password, AuthError, AuthUser},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub organization_name: String,
    pub billing_email: String,
    #[serde(default)]
    pub billing_address: BillingAddress,
    pub admin_name: String,
    pub admin_email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub token_type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<Organization>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub organization: Organization,
}

/// Create an organization together with its admin and sign the admin in
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    validate_password_strength(&req.password)?;
    let password_hash = hash_password(&req.password)?;

    let (organization, admin) = state
        .billing
        .organizations
        .register(RegisterOrganization {
            name: req.organization_name,
            billing_email: req.billing_email,
            billing_address: req.billing_address,
            admin: NewMember {
                name: req.admin_name,
                email: req.admin_email,
                password_hash,
            },
        })
        .await?;

    let (access_token, expires_at) = state.jwt_manager.generate_access_token(&admin)?;
    tracing::info!(org_id = %organization.id, user_id = %admin.id, "Organization registered");

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            access_token,
            token_type: "Bearer",
            expires_at,
            user: admin,
            organization: Some(organization),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let user = state
        .billing
        .seats
        .find_user_by_email(&req.email)
        .await?
        .filter(|u| !u.is_removed())
        .ok_or(AuthError::InvalidCredentials)?;

    if !verify_password(&req.password, &user.password_hash) {
        tracing::info!(user_id = %user.id, "Login failed: wrong password");
        return Err(AuthError::InvalidCredentials.into());
    }
    if !user.is_active {
        tracing::info!(user_id = %user.id, "Login refused: inactive user");
        return Err(AuthError::AccountInactive.into());
    }

    let (access_token, expires_at) = state.jwt_manager.generate_access_token(&user)?;
    tracing::info!(user_id = %user.id, org_id = %user.org_id, "User logged in");

    Ok(Json(AuthResponse {
        access_token,
        token_type: "Bearer",
        expires_at,
        user,
        organization: None,
    }))
}

/// The signed-in user and their organization. Open to every role.
pub async fn me(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<MeResponse>> {
    let user = state.billing.seats.get_user(auth_user.user_id).await?;
    let organization = state.billing.organizations.get(auth_user.org_id).await?;
    Ok(Json(MeResponse { user, organization }))
}
