//! Persistence boundary for the billing core
//!
//! Every method is a single-record atomic operation. Organizations are never written
//! wholesale: seat counts move only through [`BillingStore::adjust_seat_count`], profile
//! fields through [`BillingStore::update_organization_profile`], and the subscription
//! fields through [`BillingStore::swap_subscription_state`], a compare-and-swap that
//! holds across processes sharing one database.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use seatline_shared::{Order, Organization, Plan, PlanTier, SubscriptionStatus, User};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::organizations::OrganizationPatch;

/// Outcome of a conditional seat count change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatAdjustment {
    /// The change was applied; carries the new count
    Applied(i32),
    /// The change would push the count above the ceiling; nothing was written
    WouldExceed { current: i32 },
    /// The change would push the count below zero; nothing was written
    WouldGoNegative { current: i32 },
}

/// Result of trying to claim a processor event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// First delivery, or a redelivery of an event whose earlier processing failed
    Claimed,
    /// Already processed, parked, or being processed right now
    Duplicate(EventProcessingResult),
}

/// Bookkeeping state of a processor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventProcessingResult {
    Processing,
    Processed,
    Parked,
    Failed,
}

impl EventProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Parked => "parked",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EventProcessingResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "parked" => Ok(Self::Parked),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown event processing result: {}", s)),
        }
    }
}

/// An event set aside until the record it refers to exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedEvent {
    pub event_id: String,
    /// Serialized event
    pub payload: String,
}

/// The subscription half of an organization record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub plan_id: Uuid,
    pub subscription_ref: Option<String>,
    pub status: SubscriptionStatus,
    pub status_changed_at: Option<OffsetDateTime>,
}

impl From<&Organization> for SubscriptionState {
    fn from(org: &Organization) -> Self {
        Self {
            plan_id: org.plan_id,
            subscription_ref: org.subscription_ref.clone(),
            status: org.status,
            status_changed_at: org.status_changed_at,
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Plans
    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;
    async fn update_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>>;
    async fn find_active_plan(&self, tier: PlanTier) -> BillingResult<Option<Plan>>;

    // Organizations
    async fn insert_organization(&self, org: &Organization) -> BillingResult<()>;
    async fn get_organization(&self, id: Uuid) -> BillingResult<Option<Organization>>;
    async fn find_organization_by_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organization>>;
    async fn list_organizations(&self) -> BillingResult<Vec<Organization>>;
    /// Only used to undo a registration whose admin could not be stored
    async fn delete_organization(&self, id: Uuid) -> BillingResult<()>;
    /// Write the fields present in `patch`; everything else is left as stored
    async fn update_organization_profile(
        &self,
        org_id: Uuid,
        patch: &OrganizationPatch,
    ) -> BillingResult<Organization>;
    /// Replace the subscription fields with `next` if they still equal `expected`.
    /// Returns `None`, writing nothing, when another writer got there first.
    async fn swap_subscription_state(
        &self,
        org_id: Uuid,
        expected: &SubscriptionState,
        next: &SubscriptionState,
    ) -> BillingResult<Option<Organization>>;
    /// Add `delta` to the seat count if the result stays within `0..=ceiling`
    async fn adjust_seat_count(
        &self,
        org_id: Uuid,
        delta: i32,
        ceiling: i32,
    ) -> BillingResult<SeatAdjustment>;

    // Users
    async fn insert_user(&self, user: &User) -> BillingResult<()>;
    async fn get_user(&self, id: Uuid) -> BillingResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>>;
    async fn list_users(&self, org_id: Uuid) -> BillingResult<Vec<User>>;
    async fn update_user(&self, user: &User) -> BillingResult<()>;

    // Orders
    async fn insert_order(&self, order: &Order) -> BillingResult<()>;
    async fn get_order(&self, id: Uuid) -> BillingResult<Option<Order>>;
    async fn find_order_by_payment_ref(&self, payment_ref: &str) -> BillingResult<Option<Order>>;
    async fn find_order_by_invoice_ref(&self, invoice_ref: &str) -> BillingResult<Option<Order>>;
    /// Newest first
    async fn list_orders(&self, org_id: Uuid) -> BillingResult<Vec<Order>>;
    async fn update_order(&self, order: &Order) -> BillingResult<()>;

    // Processor events
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        created_at: time::OffsetDateTime,
    ) -> BillingResult<EventClaim>;
    async fn finish_event(
        &self,
        event_id: &str,
        result: EventProcessingResult,
        error: Option<String>,
    ) -> BillingResult<()>;
    async fn park_event(
        &self,
        lookup_ref: &str,
        event_id: &str,
        payload: &str,
    ) -> BillingResult<()>;
    /// Remove and return every event parked under `lookup_ref`, oldest first
    async fn take_parked_events(&self, lookup_ref: &str) -> BillingResult<Vec<ParkedEvent>>;
    /// Remove every event parked before `parked_before`, returning their ids
    async fn purge_parked_events(&self, parked_before: OffsetDateTime) -> BillingResult<Vec<String>>;
}
