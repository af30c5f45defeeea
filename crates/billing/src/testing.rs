//! Test doubles for crates that drive the billing core
//!
//! Available to this crate's tests and, with the `test-support` feature, to other crates.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use seatline_shared::{Plan, PlanTier, BILLING_CYCLE_YEARLY};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ProcessorError;
use crate::processor::{PaymentProcessor, ProcessorSubscription};
use crate::store::BillingStore;

/// Insert an active plan named after `tier` with processor refs derived from the tier.
///
/// Panics if the store rejects the plan.
#[allow(clippy::expect_used)]
pub async fn seed_plan(
    store: &dyn BillingStore,
    tier: PlanTier,
    price: i64,
    min_users: i32,
    max_users: i32,
) -> Plan {
    let now = OffsetDateTime::now_utc();
    let slug = tier.as_str().to_lowercase();
    let plan = Plan {
        id: Uuid::new_v4(),
        name: tier,
        description: None,
        price,
        currency: "inr".to_string(),
        billing_cycle: BILLING_CYCLE_YEARLY.to_string(),
        min_users,
        max_users,
        features: Vec::new(),
        trial_days: 0,
        processor_product_ref: format!("prod_{}", slug),
        processor_price_ref: format!("price_{}", slug),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    store.insert_plan(&plan).await.expect("seed plan");
    plan
}

/// Fields of a processor invoice event
pub struct InvoiceEvent<'a> {
    pub event_id: &'a str,
    /// `invoice.paid` or `invoice.payment_failed`
    pub event_type: &'a str,
    pub created: i64,
    pub subscription_ref: &'a str,
    pub payment_intent_ref: Option<&'a str>,
    pub invoice_ref: &'a str,
    pub amount: i64,
    pub quantity: i32,
    pub period: (i64, i64),
    pub billing_reason: &'a str,
}

/// JSON body of an invoice event as the processor delivers it
pub fn invoice_event(e: InvoiceEvent<'_>) -> String {
    serde_json::json!({
        "id": e.event_id,
        "object": "event",
        "type": e.event_type,
        "created": e.created,
        "data": { "object": {
            "id": e.invoice_ref,
            "object": "invoice",
            "subscription": e.subscription_ref,
            "payment_intent": e.payment_intent_ref,
            "amount_paid": if e.event_type == "invoice.paid" { e.amount } else { 0 },
            "amount_due": e.amount,
            "billing_reason": e.billing_reason,
            "lines": { "data": [{
                "quantity": e.quantity,
                "period": { "start": e.period.0, "end": e.period.1 }
            }]}
        }}
    })
    .to_string()
}

pub fn subscription_deleted_event(event_id: &str, created: i64, subscription_ref: &str) -> String {
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": "customer.subscription.deleted",
        "created": created,
        "data": { "object": { "id": subscription_ref, "object": "subscription", "status": "canceled" } }
    })
    .to_string()
}

pub fn charge_refunded_event(
    event_id: &str,
    created: i64,
    payment_intent_ref: &str,
    full: bool,
) -> String {
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": "charge.refunded",
        "created": created,
        "data": { "object": {
            "id": format!("ch_{}", event_id),
            "object": "charge",
            "payment_intent": payment_intent_ref,
            "amount_refunded": 100,
            "refunded": full
        }}
    })
    .to_string()
}

/// A `t=..,v1=..` header signing `payload` at the current time
#[allow(clippy::expect_used)]
pub fn signature_header(secret: &str, payload: &str) -> String {
    let t = OffsetDateTime::now_utc().unix_timestamp();
    let signature = crate::webhooks::compute_signature(secret, t, payload).expect("sign payload");
    format!("t={},v1={}", t, signature)
}

struct FakeState {
    counters: HashMap<&'static str, u64>,
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, VecDeque<ProcessorError>>,
    subscription_status: String,
    period: Option<(OffsetDateTime, OffsetDateTime)>,
    delay: Option<Duration>,
    canceled: Vec<String>,
}

/// Scripted in-memory [`PaymentProcessor`].
///
/// References are numbered per operation: the first customer is `cus_1`, the first
/// subscription is `sub_1` with payment intent `pi_1` and invoice `in_1`.
pub struct FakeProcessor {
    state: Mutex<FakeState>,
}

impl Default for FakeProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                counters: HashMap::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                subscription_status: "incomplete".to_string(),
                period: None,
                delay: None,
                canceled: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next call to `operation` fail with `error`
    pub fn fail_next(&self, operation: &'static str, error: ProcessorError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Status reported for newly created subscriptions (default `incomplete`)
    pub fn set_subscription_status(&self, status: &str) {
        self.state().subscription_status = status.to_string();
    }

    /// Billing period reported for subscriptions (default: now + one year)
    pub fn set_period(&self, start: OffsetDateTime, end: OffsetDateTime) {
        self.state().period = Some((start, end));
    }

    /// Delay every call, to widen race windows in concurrency tests
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == operation).count()
    }

    /// Subscriptions successfully canceled, in call order
    pub fn canceled(&self) -> Vec<String> {
        self.state().canceled.clone()
    }

    /// Record the call and return its sequence number, or the scripted failure
    async fn enter(&self, operation: &'static str) -> Result<u64, ProcessorError> {
        let (n, delay) = {
            let mut state = self.state();
            state.calls.push(operation);
            if let Some(err) = state
                .failures
                .get_mut(operation)
                .and_then(|queue| queue.pop_front())
            {
                return Err(err);
            }
            let n = {
                let counter = state.counters.entry(operation).or_insert(0);
                *counter += 1;
                *counter
            };
            (n, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(n)
    }

    fn subscription(&self, n: u64, subscription_ref: String, quantity: i32) -> ProcessorSubscription {
        let state = self.state();
        let (start, end) = state.period.unwrap_or_else(|| {
            let now = OffsetDateTime::now_utc();
            (now, now + time::Duration::days(365))
        });
        ProcessorSubscription {
            subscription_ref,
            status: state.subscription_status.clone(),
            quantity,
            current_period_start: start,
            current_period_end: end,
            invoice_ref: Some(format!("in_{}", n)),
            payment_intent_ref: Some(format!("pi_{}", n)),
            confirmation_handle: Some(format!("pi_{}_secret", n)),
        }
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_customer(&self, _email: &str, _name: &str) -> Result<String, ProcessorError> {
        let n = self.enter("create_customer").await?;
        Ok(format!("cus_{}", n))
    }

    async fn create_subscription(
        &self,
        _customer_ref: &str,
        _price_ref: &str,
        quantity: i32,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let n = self.enter("create_subscription").await?;
        Ok(self.subscription(n, format!("sub_{}", n), quantity))
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> Result<(), ProcessorError> {
        self.enter("cancel_subscription").await?;
        self.state().canceled.push(subscription_ref.to_string());
        Ok(())
    }

    async fn update_subscription_quantity(
        &self,
        subscription_ref: &str,
        quantity: i32,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let n = self.enter("update_subscription_quantity").await?;
        let mut sub = self.subscription(n, subscription_ref.to_string(), quantity);
        sub.status = "active".to_string();
        sub.invoice_ref = None;
        sub.payment_intent_ref = None;
        sub.confirmation_handle = None;
        Ok(sub)
    }

    async fn create_setup_intent(&self, _customer_ref: &str) -> Result<String, ProcessorError> {
        let n = self.enter("create_setup_intent").await?;
        Ok(format!("seti_{}_secret", n))
    }
}
