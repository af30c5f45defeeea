//! Processor webhook handling
//!
//! Verifies signed deliveries, claims each processor event id exactly once and
//! reconciles the event against local orders and organizations.
//!
//! Events can arrive before the local write they refer to (a "payment succeeded"
//! racing the subscribe call that records the order). Such events are parked
//! under the reference they carry and replayed once the write lands. Events whose
//! write never lands are dropped after a configurable number of days and recorded
//! as failed, so a later redelivery of the same event is processed afresh.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use seatline_shared::{Order, OrderStatus, Organization, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::locks::OrgLocks;
use crate::orders::{OrderLedger, RenewalInvoice};
use crate::organizations::OrganizationLedger;
use crate::store::{BillingStore, EventClaim, EventProcessingResult};

type HmacSha256 = Hmac<Sha256>;

/// Invoice billing reason for a recurring period charge
const BILLING_REASON_CYCLE: &str = "subscription_cycle";

const DEFAULT_PARKED_TTL_DAYS: i64 = 7;

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`, as carried in the `v1` signature field
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".into()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a `t=<unix>,v1=<hex>[,v1=<hex>...]` signature header against `payload`.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let age = (now.unix_timestamp() - timestamp).abs();
    if age > tolerance_secs {
        tracing::warn!(timestamp, age, tolerance_secs, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(secret, timestamp, payload)?;
    let matched = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
    if !matched {
        tracing::warn!(timestamp, "Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Event types the reconciler acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionDeleted,
    ChargeRefunded,
    Unknown(String),
}

impl WebhookEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "invoice.paid" | "invoice.payment_succeeded" => Self::PaymentSucceeded,
            "invoice.payment_failed" => Self::PaymentFailed,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "charge.refunded" => Self::ChargeRefunded,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// The references and amounts the reconciler needs from an event object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub payment_intent_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub invoice_ref: Option<String>,
    pub amount: Option<i64>,
    pub quantity: Option<i32>,
    #[serde(with = "time::serde::timestamp::option", default)]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::timestamp::option", default)]
    pub period_end: Option<OffsetDateTime>,
    pub billing_reason: Option<String>,
    /// Charge events: the whole amount was refunded
    #[serde(default)]
    pub fully_refunded: bool,
}

impl EventPayload {
    fn is_renewal(&self) -> bool {
        self.billing_reason.as_deref() == Some(BILLING_REASON_CYCLE)
    }

    /// Reference an early event is parked under
    fn lookup_ref(&self) -> Option<&str> {
        self.subscription_ref
            .as_deref()
            .or(self.payment_intent_ref.as_deref())
            .or(self.invoice_ref.as_deref())
    }
}

/// A verified processor event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    /// Processor-side creation time; orders state changes independent of arrival
    #[serde(with = "time::serde::timestamp")]
    pub created: OffsetDateTime,
    pub payload: EventPayload,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: Value,
}

/// Id of an expandable field: either the bare id string or an expanded object
fn reference(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<OffsetDateTime> {
    value
        .as_i64()
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
}

fn invoice_payload(invoice: &Value) -> EventPayload {
    let line = &invoice["lines"]["data"][0];
    EventPayload {
        payment_intent_ref: reference(&invoice["payment_intent"]),
        subscription_ref: reference(&invoice["subscription"]),
        invoice_ref: reference(&invoice["id"]),
        amount: invoice["amount_paid"]
            .as_i64()
            .filter(|amount| *amount > 0)
            .or_else(|| invoice["amount_due"].as_i64()),
        quantity: line["quantity"].as_i64().and_then(|q| i32::try_from(q).ok()),
        period_start: timestamp(&line["period"]["start"]),
        period_end: timestamp(&line["period"]["end"]),
        billing_reason: invoice["billing_reason"].as_str().map(str::to_string),
        fully_refunded: false,
    }
}

impl WebhookEvent {
    pub fn kind(&self) -> WebhookEventKind {
        WebhookEventKind::from_type(&self.event_type)
    }

    /// Parse the processor's JSON event envelope
    pub fn parse(raw: &str) -> BillingResult<Self> {
        let event: RawEvent = serde_json::from_str(raw).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayload(e.to_string())
        })?;
        let created = OffsetDateTime::from_unix_timestamp(event.created)
            .map_err(|e| BillingError::WebhookPayload(format!("Invalid event timestamp: {}", e)))?;

        let object = &event.data.object;
        let payload = match WebhookEventKind::from_type(&event.event_type) {
            WebhookEventKind::PaymentSucceeded | WebhookEventKind::PaymentFailed => {
                invoice_payload(object)
            }
            WebhookEventKind::SubscriptionDeleted => EventPayload {
                subscription_ref: reference(&object["id"]),
                ..Default::default()
            },
            WebhookEventKind::ChargeRefunded => EventPayload {
                payment_intent_ref: reference(&object["payment_intent"]),
                invoice_ref: reference(&object["invoice"]),
                amount: object["amount_refunded"].as_i64(),
                fully_refunded: object["refunded"].as_bool().unwrap_or(false),
                ..Default::default()
            },
            WebhookEventKind::Unknown(_) => EventPayload::default(),
        };

        Ok(Self {
            id: event.id,
            event_type: event.event_type,
            created,
            payload,
        })
    }
}

/// What reconciling one event did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        org_id: Option<Uuid>,
        order_id: Option<Uuid>,
    },
    Ignored {
        reason: String,
    },
    /// Waiting for the local write the event refers to
    Parked {
        lookup_ref: String,
    },
    /// Already claimed by an earlier delivery
    Duplicate,
    Failed {
        error: String,
    },
}

impl ReconcileOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }

    fn processing_result(&self) -> (EventProcessingResult, Option<String>) {
        match self {
            Self::Applied { .. } | Self::Ignored { .. } | Self::Duplicate => {
                (EventProcessingResult::Processed, None)
            }
            Self::Parked { .. } => (EventProcessingResult::Parked, None),
            Self::Failed { error } => (EventProcessingResult::Failed, Some(error.clone())),
        }
    }
}

enum Step {
    Done(ReconcileOutcome),
    Defer(String),
}

/// Applies processor events to the order and organization ledgers
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
    ledger: OrganizationLedger,
    orders: OrderLedger,
    locks: Arc<OrgLocks>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        ledger: OrganizationLedger,
        orders: OrderLedger,
        locks: Arc<OrgLocks>,
    ) -> Self {
        Self {
            store,
            ledger,
            orders,
            locks,
        }
    }

    /// Apply a claimed event and record how it ended
    pub async fn settle(&self, event: &WebhookEvent) -> ReconcileOutcome {
        match self.apply(event).await {
            Ok(Step::Done(outcome)) => {
                self.finish(event, &outcome).await;
                outcome
            }
            Ok(Step::Defer(lookup_ref)) => self.park(event, lookup_ref).await,
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook reconciliation failed"
                );
                let outcome = ReconcileOutcome::Failed {
                    error: e.to_string(),
                };
                self.finish(event, &outcome).await;
                outcome
            }
        }
    }

    /// Apply every event parked under `lookup_ref`, oldest first
    pub async fn replay(&self, lookup_ref: &str) -> Vec<(String, ReconcileOutcome)> {
        let parked = match self.store.take_parked_events(lookup_ref).await {
            Ok(parked) => parked,
            Err(e) => {
                tracing::error!(lookup_ref = %lookup_ref, error = %e, "Failed to load parked events");
                return Vec::new();
            }
        };

        let mut replayed = Vec::with_capacity(parked.len());
        for entry in parked {
            let event: WebhookEvent = match serde_json::from_str(&entry.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(event_id = %entry.event_id, error = %e, "Corrupt parked event");
                    let outcome = ReconcileOutcome::Failed {
                        error: format!("Corrupt parked event: {}", e),
                    };
                    self.finish_id(&entry.event_id, &outcome).await;
                    replayed.push((entry.event_id, outcome));
                    continue;
                }
            };

            let outcome = match self.apply(&event).await {
                Ok(Step::Done(outcome)) => outcome,
                Ok(Step::Defer(key)) => match self.store.park_event(&key, &event.id, &entry.payload).await {
                    Ok(()) => ReconcileOutcome::Parked { lookup_ref: key },
                    Err(e) => ReconcileOutcome::Failed {
                        error: e.to_string(),
                    },
                },
                Err(e) => ReconcileOutcome::Failed {
                    error: e.to_string(),
                },
            };
            tracing::info!(event_id = %event.id, lookup_ref = %lookup_ref, outcome = ?outcome, "Replayed parked event");
            self.finish(&event, &outcome).await;
            replayed.push((event.id, outcome));
        }
        replayed
    }

    /// Drop events parked before `parked_before` and record them as failed.
    /// Returns the dropped event ids.
    pub async fn expire_parked(&self, parked_before: OffsetDateTime) -> BillingResult<Vec<String>> {
        let expired = self.store.purge_parked_events(parked_before).await?;
        let outcome = ReconcileOutcome::Failed {
            error: "Parked event expired before the record it refers to appeared".into(),
        };
        for event_id in &expired {
            tracing::warn!(event_id = %event_id, "Dropped parked webhook event");
            self.finish_id(event_id, &outcome).await;
        }
        Ok(expired)
    }

    async fn park(&self, event: &WebhookEvent, lookup_ref: String) -> ReconcileOutcome {
        let parked = ReconcileOutcome::Parked {
            lookup_ref: lookup_ref.clone(),
        };
        // Recorded before the event becomes visible to replayers, which overwrite it
        self.finish(event, &parked).await;

        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => return self.fail(event, e.to_string()).await,
        };
        if let Err(e) = self.store.park_event(&lookup_ref, &event.id, &payload).await {
            return self.fail(event, e.to_string()).await;
        }
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            lookup_ref = %lookup_ref,
            "Parked webhook event until its order exists"
        );

        // The write may have landed between the lookup and the park
        match self.locate(&event.payload).await {
            Ok((None, None)) => parked,
            Ok(_) => self
                .replay(&lookup_ref)
                .await
                .into_iter()
                .find(|(id, _)| *id == event.id)
                .map(|(_, outcome)| outcome)
                .unwrap_or(parked),
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Re-check after parking failed");
                parked
            }
        }
    }

    async fn fail(&self, event: &WebhookEvent, error: String) -> ReconcileOutcome {
        tracing::error!(event_id = %event.id, error = %error, "Failed to park webhook event");
        let outcome = ReconcileOutcome::Failed { error };
        self.finish(event, &outcome).await;
        outcome
    }

    async fn finish(&self, event: &WebhookEvent, outcome: &ReconcileOutcome) {
        self.finish_id(&event.id, outcome).await;
    }

    async fn finish_id(&self, event_id: &str, outcome: &ReconcileOutcome) {
        let (result, error) = outcome.processing_result();
        if let Err(e) = self.store.finish_event(event_id, result, error).await {
            tracing::error!(
                event_id = %event_id,
                result = result.as_str(),
                error = %e,
                "Failed to record webhook processing result"
            );
        }
    }

    async fn apply(&self, event: &WebhookEvent) -> BillingResult<Step> {
        match event.kind() {
            WebhookEventKind::PaymentSucceeded => {
                self.apply_payment(event, OrderStatus::Completed).await
            }
            WebhookEventKind::PaymentFailed => self.apply_payment(event, OrderStatus::Failed).await,
            WebhookEventKind::SubscriptionDeleted => self.apply_subscription_deleted(event).await,
            WebhookEventKind::ChargeRefunded => self.apply_refund(event).await,
            WebhookEventKind::Unknown(event_type) => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Received unhandled processor event type"
                );
                Ok(Step::Done(ReconcileOutcome::ignored("unhandled event type")))
            }
        }
    }

    /// The local order and organization an event refers to, if they exist yet
    async fn locate(
        &self,
        payload: &EventPayload,
    ) -> BillingResult<(Option<Order>, Option<Organization>)> {
        let mut order = None;
        if let Some(payment_ref) = payload.payment_intent_ref.as_deref() {
            order = self.orders.find_by_payment_ref(payment_ref).await?;
        }
        if order.is_none() {
            if let Some(invoice_ref) = payload.invoice_ref.as_deref() {
                order = self.orders.find_by_invoice_ref(invoice_ref).await?;
            }
        }
        let org = match payload.subscription_ref.as_deref() {
            Some(subscription_ref) => {
                self.store
                    .find_organization_by_subscription(subscription_ref)
                    .await?
            }
            None => None,
        };
        Ok((order, org))
    }

    async fn apply_payment(&self, event: &WebhookEvent, status: OrderStatus) -> BillingResult<Step> {
        let payload = &event.payload;
        let (order, org) = self.locate(payload).await?;

        let org_id = match (&order, &org) {
            (Some(order), _) => order.org_id,
            (None, Some(org)) => org.id,
            (None, None) => {
                let lookup_ref = payload.lookup_ref().ok_or_else(|| {
                    BillingError::WebhookPayload("Payment event carries no reference".into())
                })?;
                return Ok(Step::Defer(lookup_ref.to_string()));
            }
        };

        let _guard = self.locks.acquire(org_id).await;

        let order_id = match order {
            Some(order) => {
                self.orders.apply_status(order.id, status, event.created).await?;
                Some(order.id)
            }
            None if payload.is_renewal() => {
                Some(self.record_renewal(org_id, event, status).await?.id)
            }
            None => {
                tracing::info!(
                    event_id = %event.id,
                    org_id = %org_id,
                    billing_reason = ?payload.billing_reason,
                    "No local order for invoice"
                );
                None
            }
        };

        if status == OrderStatus::Completed {
            if let Some(subscription_ref) = payload.subscription_ref.as_deref() {
                self.activate(org_id, subscription_ref, event.created).await?;
            }
        }

        Ok(Step::Done(ReconcileOutcome::Applied {
            org_id: Some(org_id),
            order_id,
        }))
    }

    async fn record_renewal(
        &self,
        org_id: Uuid,
        event: &WebhookEvent,
        status: OrderStatus,
    ) -> BillingResult<Order> {
        let payload = &event.payload;
        let missing = |field: &str| {
            BillingError::WebhookPayload(format!("Renewal invoice without {}", field))
        };
        let invoice = RenewalInvoice {
            subscription_ref: payload
                .subscription_ref
                .clone()
                .ok_or_else(|| missing("subscription"))?,
            invoice_ref: payload.invoice_ref.clone().ok_or_else(|| missing("invoice id"))?,
            payment_intent_ref: payload.payment_intent_ref.clone(),
            amount: payload.amount.ok_or_else(|| missing("amount"))?,
            quantity: payload.quantity.unwrap_or(1),
            period_start: payload.period_start.ok_or_else(|| missing("period"))?,
            period_end: payload.period_end.ok_or_else(|| missing("period"))?,
        };
        let (_, plan) = self.ledger.get_with_plan(org_id).await?;
        self.orders
            .record_renewal(org_id, &plan, &invoice, status, event.created)
            .await
    }

    /// Mark the organization active if `subscription_ref` is still its subscription
    async fn activate(
        &self,
        org_id: Uuid,
        subscription_ref: &str,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let org = self.ledger.get(org_id).await?;
        if org.subscription_ref.as_deref() != Some(subscription_ref) {
            tracing::info!(
                org_id = %org_id,
                subscription_ref = %subscription_ref,
                "Payment for a superseded subscription"
            );
            return Ok(());
        }
        if org.status.is_terminal() {
            // Only a new subscription brings a terminated organization back
            tracing::warn!(
                org_id = %org_id,
                status = %org.status,
                "Payment received for terminated subscription"
            );
            return Ok(());
        }
        self.ledger
            .set_status(org_id, SubscriptionStatus::Active, Some(at))
            .await?;
        Ok(())
    }

    async fn apply_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<Step> {
        let subscription_ref = event.payload.subscription_ref.as_deref().ok_or_else(|| {
            BillingError::WebhookPayload("Subscription event without subscription id".into())
        })?;
        let Some(org) = self
            .store
            .find_organization_by_subscription(subscription_ref)
            .await?
        else {
            return Ok(Step::Done(ReconcileOutcome::ignored("unknown subscription")));
        };

        let _guard = self.locks.acquire(org.id).await;
        let org = self.ledger.get(org.id).await?;
        if org.subscription_ref.as_deref() != Some(subscription_ref) {
            return Ok(Step::Done(ReconcileOutcome::ignored("superseded subscription")));
        }
        if org.status == SubscriptionStatus::Expired {
            return Ok(Step::Done(ReconcileOutcome::ignored("subscription already expired")));
        }

        self.ledger
            .set_status(org.id, SubscriptionStatus::Canceled, Some(event.created))
            .await?;
        Ok(Step::Done(ReconcileOutcome::Applied {
            org_id: Some(org.id),
            order_id: None,
        }))
    }

    async fn apply_refund(&self, event: &WebhookEvent) -> BillingResult<Step> {
        if !event.payload.fully_refunded {
            return Ok(Step::Done(ReconcileOutcome::ignored("partial refund")));
        }
        let (Some(order), _) = self.locate(&event.payload).await? else {
            return Ok(Step::Done(ReconcileOutcome::ignored("refund for unknown order")));
        };

        let _guard = self.locks.acquire(order.org_id).await;
        self.orders
            .apply_status(order.id, OrderStatus::Refunded, event.created)
            .await?;
        Ok(Step::Done(ReconcileOutcome::Applied {
            org_id: Some(order.org_id),
            order_id: Some(order.id),
        }))
    }
}

/// Webhook handler for processor events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    reconciler: Reconciler,
    webhook_secret: String,
    tolerance_secs: i64,
    parked_ttl: Duration,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        reconciler: Reconciler,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            store,
            reconciler,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
            parked_ttl: Duration::days(DEFAULT_PARKED_TTL_DAYS),
        }
    }

    pub fn with_parked_ttl_days(mut self, days: i64) -> Self {
        self.parked_ttl = Duration::days(days);
        self
    }

    /// Drop events that have been parked longer than the configured TTL
    pub async fn expire_parked(&self, now: OffsetDateTime) -> BillingResult<Vec<String>> {
        self.reconciler.expire_parked(now - self.parked_ttl).await
    }

    /// Verify the signature header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.tolerance_secs,
            OffsetDateTime::now_utc(),
        )?;
        let event = WebhookEvent::parse(payload)?;
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Webhook verified");
        Ok(event)
    }

    /// Claim the event id and reconcile it.
    ///
    /// Errors only when the claim itself could not be recorded; reconciliation
    /// failures are reported in the outcome.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<ReconcileOutcome> {
        match self
            .store
            .claim_event(&event.id, &event.event_type, event.created)
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::Duplicate(previous) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    previous = previous.as_str(),
                    "Duplicate webhook event"
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
        }

        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Processing webhook event");
        let outcome = self.reconciler.settle(&event).await;
        tracing::info!(event_id = %event.id, outcome = ?outcome, "Webhook event reconciled");
        Ok(outcome)
    }
}
