//! Subscription routes and processor webhook ingestion

use axum::{extract::State, http::HeaderMap, Json};
use seatline_billing::{ProcessorSubscription, ReconcileOutcome, SubscribeResult};
use seatline_shared::{Capability, Organization};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct SetupIntentResponse {
    pub client_secret: String,
}

pub async fn subscribe(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeResult>> {
    auth_user.require(Capability::ManageBilling)?;
    let result = state
        .billing
        .subscriptions
        .subscribe(auth_user.org_id, req.plan_id, req.quantity)
        .await?;
    Ok(Json(result))
}

pub async fn cancel(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<Organization>> {
    auth_user.require(Capability::ManageBilling)?;
    Ok(Json(state.billing.subscriptions.cancel(auth_user.org_id).await?))
}

pub async fn update_quantity(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<UpdateQuantityRequest>,
) -> ApiResult<Json<ProcessorSubscription>> {
    auth_user.require(Capability::ManageBilling)?;
    let subscription = state
        .billing
        .subscriptions
        .change_seat_quantity(auth_user.org_id, req.quantity)
        .await?;
    Ok(Json(subscription))
}

pub async fn setup_intent(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<SetupIntentResponse>> {
    auth_user.require(Capability::ManageBilling)?;
    let client_secret = state
        .billing
        .subscriptions
        .create_setup_intent(auth_user.org_id)
        .await?;
    Ok(Json(SetupIntentResponse { client_secret }))
}

/// Processor webhook endpoint.
///
/// Verified events are acknowledged with 200 whatever the reconciliation outcome,
/// so the processor stops redelivering them. Only a failure to record the event
/// returns 500, asking for redelivery.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<ReconcileOutcome>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Webhook rejected");
        e
    })?;

    let outcome = state.billing.webhooks.handle_event(event).await?;
    Ok(Json(outcome))
}
