//! HTTP routes

pub mod auth;
pub mod billing;
pub mod organizations;
pub mod plans;
pub mod users;

#[cfg(test)]
mod route_tests;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the application router. Authentication is enforced per handler by the
/// `AuthUser` extractor.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Auth
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        // Plans
        .route(
            "/api/plans",
            get(plans::list_plans).post(plans::create_plan),
        )
        .route(
            "/api/plans/{id}",
            put(plans::update_plan).delete(plans::deactivate_plan),
        )
        // Organizations
        .route(
            "/api/organizations",
            get(organizations::get_organization).put(organizations::update_organization),
        )
        .route("/api/organizations/orders", get(organizations::list_orders))
        .route(
            "/api/organizations/all",
            get(organizations::list_all_organizations),
        )
        // Users
        .route("/api/users", get(users::list_users).post(users::add_user))
        .route(
            "/api/users/{id}",
            put(users::set_user_active).delete(users::remove_user),
        )
        // Billing
        .route("/api/billing/subscribe", post(billing::subscribe))
        .route("/api/billing/cancel", post(billing::cancel))
        .route("/api/billing/update-quantity", post(billing::update_quantity))
        .route("/api/billing/setup-intent", post(billing::setup_intent))
        .route("/api/billing/webhook", post(billing::webhook))
        .with_state(state)
}
