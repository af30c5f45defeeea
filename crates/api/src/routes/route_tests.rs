//! Router tests against the in-memory store and the scripted processor

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use seatline_billing::testing::{
    invoice_event, seed_plan, signature_header, FakeProcessor, InvoiceEvent,
};
use seatline_billing::{BillingConfig, BillingService, BillingStore, InMemoryStore};
use seatline_shared::{Plan, PlanTier, User, UserRole};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::{config::Config, state::AppState};

const WEBHOOK_SECRET: &str = "whsec_route_tests";
const PASSWORD: &str = "correct horse battery";

struct Harness {
    app: Router,
    state: AppState,
    store: Arc<InMemoryStore>,
    processor: Arc<FakeProcessor>,
    basic: Plan,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let basic = seed_plan(store.as_ref(), PlanTier::Basic, 999, 1, 3).await;
    let processor = Arc::new(FakeProcessor::new());
    let billing = BillingService::new(
        store.clone(),
        processor.clone(),
        BillingConfig::default(),
        WEBHOOK_SECRET,
    );
    let config = Config {
        database_url: String::new(),
        bind_address: "127.0.0.1:0".to_string(),
        jwt_secret: "route-tests-jwt-secret-key-0123456789".to_string(),
        jwt_expiry_hours: 1,
        allowed_origins: vec![],
    };
    let state = AppState::new(config, billing);

    Harness {
        app: create_router(state.clone()),
        state,
        store,
        processor,
        basic,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn post_webhook(app: &Router, payload: &str, signature: Option<String>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/billing/webhook");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(payload.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// Register Acme and return the admin's token and the registration body
async fn register(h: &Harness) -> (String, Value) {
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "organization_name": "Acme",
            "billing_email": "billing@acme.test",
            "admin_name": "Asha",
            "admin_email": "asha@acme.test",
            "password": PASSWORD,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    (body["access_token"].as_str().unwrap().to_string(), body)
}

async fn login(h: &Harness, email: &str) -> (StatusCode, Value) {
    send(
        &h.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": email, "password": PASSWORD })),
    )
    .await
}

/// Add a member through the API, log them in and return (user id, token)
async fn add_member(h: &Harness, admin_token: &str, email: &str) -> (String, String) {
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/users",
        Some(admin_token),
        Some(json!({ "name": "Member", "email": email, "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let user_id = body["id"].as_str().unwrap().to_string();

    let (status, body) = login(h, email).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    (user_id, body["access_token"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn test_register_login_and_view_organization() {
    let h = harness().await;
    let (_, registration) = register(&h).await;
    assert_eq!(registration["organization"]["status"], "trialing");
    assert!(registration["user"].get("password_hash").is_none());

    let (status, body) = login(&h, "ASHA@acme.test").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let token = body["access_token"].as_str().unwrap();

    let (status, org) = send(&h.app, "GET", "/api/organizations", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(org["name"], "Acme");
    assert_eq!(org["active_seat_count"], 0);
    assert_eq!(org["plan_id"], h.basic.id.to_string());
}

#[tokio::test]
async fn test_me_returns_user_and_organization() {
    let h = harness().await;
    let (admin, _) = register(&h).await;

    let (status, body) = send(&h.app, "GET", "/api/auth/me", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["user"]["email"], "asha@acme.test");
    assert_eq!(body["user"]["role"], "admin");
    assert!(body["user"].get("password_hash").is_none());
    assert_eq!(body["organization"]["name"], "Acme");
    assert_eq!(body["organization"]["status"], "trialing");

    // Plain members may see themselves too
    let (_, member) = add_member(&h, &admin, "ravi@acme.test").await;
    let (status, body) = send(&h.app, "GET", "/api/auth/me", Some(&member), None).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["user"]["email"], "ravi@acme.test");
    assert_eq!(body["organization"]["name"], "Acme");

    let (status, _) = send(&h.app, "GET", "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bad_credentials_are_unauthorized() {
    let h = harness().await;
    register(&h).await;

    let (status, body) = send(
        &h.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "asha@acme.test", "password": "wrong password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);

    let (status, _) = login(&h, "nobody@acme.test").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let h = harness().await;

    let (status, _) = send(&h.app, "GET", "/api/users", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&h.app, "GET", "/api/users", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, plans) = send(&h.app, "GET", "/api/plans", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plans.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_member_without_capabilities_is_forbidden() {
    let h = harness().await;
    let (admin, _) = register(&h).await;
    let (_, member) = add_member(&h, &admin, "ravi@acme.test").await;

    for (method, uri) in [
        ("GET", "/api/organizations"),
        ("GET", "/api/users"),
        ("POST", "/api/billing/cancel"),
        ("POST", "/api/billing/setup-intent"),
    ] {
        let (status, _) = send(&h.app, method, uri, Some(&member), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", method, uri);
    }
    assert!(h.processor.calls().iter().all(|c| *c == "create_customer"));
}

#[tokio::test]
async fn test_deactivated_member_is_refused() {
    let h = harness().await;
    let (admin, _) = register(&h).await;
    let (member_id, member) = add_member(&h, &admin, "ravi@acme.test").await;

    let (status, body) = send(
        &h.app,
        "PUT",
        &format!("/api/users/{}", member_id),
        Some(&admin),
        Some(json!({ "is_active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_active"], false);

    // Existing token stops working and a fresh login is refused
    let (status, body) = send(&h.app, "GET", "/api/organizations/orders", Some(&member), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Account is inactive");
    let (status, _) = login(&h, "ravi@acme.test").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, org) = send(&h.app, "GET", "/api/organizations", Some(&admin), None).await;
    assert_eq!(org["active_seat_count"], 0);
}

#[tokio::test]
async fn test_seat_limit_maps_to_conflict() {
    let h = harness().await;
    let (admin, _) = register(&h).await;

    for i in 0..3 {
        add_member(&h, &admin, &format!("member{}@acme.test", i)).await;
    }
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/users",
        Some(&admin),
        Some(json!({ "name": "Late", "email": "late@acme.test", "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);

    let (_, org) = send(&h.app, "GET", "/api/organizations", Some(&admin), None).await;
    assert_eq!(org["active_seat_count"], 3);
    let (_, users) = send(&h.app, "GET", "/api/users", Some(&admin), None).await;
    assert_eq!(users.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_plan_management_requires_super_admin() {
    let h = harness().await;
    let (admin, registration) = register(&h).await;
    let new_plan = json!({
        "name": "Standard",
        "price": 4999,
        "min_users": 1,
        "max_users": 10,
        "processor_product_ref": "prod_standard",
        "processor_price_ref": "price_standard",
    });

    let (status, _) = send(&h.app, "POST", "/api/plans", Some(&admin), Some(new_plan.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let org_id: Uuid = registration["organization"]["id"].as_str().unwrap().parse().unwrap();
    let operator = User {
        id: Uuid::new_v4(),
        org_id,
        name: "Operator".into(),
        email: "ops@seatline.test".into(),
        password_hash: String::new(),
        role: UserRole::SuperAdmin,
        is_active: true,
        seat_exempt: true,
        removed_at: None,
        created_at: OffsetDateTime::now_utc(),
    };
    h.store.insert_user(&operator).await.unwrap();
    let (operator_token, _) = h.state.jwt_manager.generate_access_token(&operator).unwrap();

    let (status, plan) = send(&h.app, "POST", "/api/plans", Some(&operator_token), Some(new_plan)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", plan);
    let plan_uri = format!("/api/plans/{}", plan["id"].as_str().unwrap());

    let (status, plan) = send(
        &h.app,
        "PUT",
        &plan_uri,
        Some(&operator_token),
        Some(json!({ "description": "For growing teams" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["description"], "For growing teams");

    let (_, plans) = send(&h.app, "GET", "/api/plans", None, None).await;
    assert_eq!(plans.as_array().unwrap().len(), 2);

    let (status, plan) = send(&h.app, "DELETE", &plan_uri, Some(&operator_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["is_active"], false);
    let (_, plans) = send(&h.app, "GET", "/api/plans", None, None).await;
    assert_eq!(plans.as_array().unwrap().len(), 1);

    let (status, all) = send(&h.app, "GET", "/api/organizations/all", Some(&operator_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 1);
    let (status, _) = send(&h.app, "GET", "/api/organizations/all", Some(&admin), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_subscribe_then_payment_webhook_activates() {
    let h = harness().await;
    let (admin, _) = register(&h).await;

    let (status, body) = send(
        &h.app,
        "POST",
        "/api/billing/subscribe",
        Some(&admin),
        Some(json!({ "plan_id": h.basic.id, "quantity": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["subscription_ref"], "sub_1");
    assert_eq!(body["order"]["amount"], 1998);
    assert_eq!(body["order"]["status"], "pending");

    let created = OffsetDateTime::now_utc().unix_timestamp();
    let payload = invoice_event(InvoiceEvent {
        event_id: "evt_route_1",
        event_type: "invoice.paid",
        created,
        subscription_ref: "sub_1",
        payment_intent_ref: Some("pi_1"),
        invoice_ref: "in_1",
        amount: 1998,
        quantity: 2,
        period: (created, created + 365 * 86_400),
        billing_reason: "subscription_create",
    });

    let (status, outcome) =
        post_webhook(&h.app, &payload, Some(signature_header(WEBHOOK_SECRET, &payload))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "applied", "{}", outcome);

    let (_, org) = send(&h.app, "GET", "/api/organizations", Some(&admin), None).await;
    assert_eq!(org["status"], "active");
    let (_, orders) = send(&h.app, "GET", "/api/organizations/orders", Some(&admin), None).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);
    assert_eq!(orders[0]["status"], "completed");

    // Redelivery is acknowledged without another state change
    let (status, outcome) =
        post_webhook(&h.app, &payload, Some(signature_header(WEBHOOK_SECRET, &payload))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "duplicate");

    let (status, body) = send(
        &h.app,
        "POST",
        "/api/billing/update-quantity",
        Some(&admin),
        Some(json!({ "quantity": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["quantity"], 3);

    let (status, org) = send(&h.app, "POST", "/api/billing/cancel", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(org["status"], "canceled");
}

#[tokio::test]
async fn test_webhook_signature_is_required() {
    let h = harness().await;
    let created = OffsetDateTime::now_utc().unix_timestamp();
    let payload = invoice_event(InvoiceEvent {
        event_id: "evt_forged",
        event_type: "invoice.paid",
        created,
        subscription_ref: "sub_1",
        payment_intent_ref: Some("pi_1"),
        invoice_ref: "in_1",
        amount: 999,
        quantity: 1,
        period: (created, created + 365 * 86_400),
        billing_reason: "subscription_create",
    });

    let (status, _) = post_webhook(&h.app, &payload, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let forged = format!("t={},v1={}", created, "00".repeat(32));
    let (status, body) = post_webhook(&h.app, &payload, Some(forged)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid webhook signature");

    let (status, _) = post_webhook(
        &h.app,
        &payload,
        Some(signature_header("whsec_someone_else", &payload)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_billing_errors_map_to_status_codes() {
    let h = harness().await;
    let (admin, _) = register(&h).await;

    let (status, _) = send(
        &h.app,
        "POST",
        "/api/billing/subscribe",
        Some(&admin),
        Some(json!({ "plan_id": h.basic.id, "quantity": 9 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &h.app,
        "POST",
        "/api/billing/subscribe",
        Some(&admin),
        Some(json!({ "plan_id": Uuid::new_v4(), "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&h.app, "POST", "/api/billing/cancel", Some(&admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "No active subscription");

    let (status, _) = send(
        &h.app,
        "DELETE",
        &format!("/api/users/{}", Uuid::new_v4()),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Only create_customer reached the processor
    assert_eq!(h.processor.calls(), vec!["create_customer"]);
}
