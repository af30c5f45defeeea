//! Organization profile and order history

use axum::{extract::State, Json};
use seatline_billing::OrganizationPatch;
use seatline_shared::{Capability, Order, Organization};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// The caller's own organization
pub async fn get_organization(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<Organization>> {
    auth_user.require(Capability::ViewOrganization)?;
    Ok(Json(state.billing.organizations.get(auth_user.org_id).await?))
}

pub async fn update_organization(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(patch): Json<OrganizationPatch>,
) -> ApiResult<Json<Organization>> {
    auth_user.require(Capability::UpdateOrganization)?;
    let org = state
        .billing
        .organizations
        .update_profile(auth_user.org_id, patch)
        .await?;
    Ok(Json(org))
}

/// Billing attempts for the caller's organization, newest first
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<Vec<Order>>> {
    auth_user.require(Capability::ViewOrders)?;
    Ok(Json(state.billing.orders.list_for_org(auth_user.org_id).await?))
}

/// Every organization on the platform
pub async fn list_all_organizations(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<Vec<Organization>>> {
    auth_user.require(Capability::ViewAllOrganizations)?;
    Ok(Json(state.billing.organizations.list().await?))
}
