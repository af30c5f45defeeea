//! In-process store used by tests and local runs

use std::collections::HashMap;

use async_trait::async_trait;
use seatline_shared::{Order, Organization, Plan, PlanTier, User};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    BillingStore, EventClaim, EventProcessingResult, ParkedEvent, SeatAdjustment,
    SubscriptionState,
};
use crate::error::{BillingError, BillingResult};
use crate::organizations::OrganizationPatch;

#[derive(Default)]
struct Inner {
    plans: HashMap<Uuid, Plan>,
    organizations: HashMap<Uuid, Organization>,
    users: HashMap<Uuid, User>,
    /// Insertion order is kept so equal timestamps still list deterministically
    orders: Vec<Order>,
    events: HashMap<String, EventProcessingResult>,
    parked: Vec<Parked>,
}

struct Parked {
    lookup_ref: String,
    parked_at: OffsetDateTime,
    event: ParkedEvent,
}

/// [`BillingStore`] over plain maps behind one lock
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events currently parked, across all references
    pub async fn parked_count(&self) -> usize {
        self.inner.read().await.parked.len()
    }
}

fn missing(kind: &str, id: impl std::fmt::Display) -> BillingError {
    BillingError::NotFound(format!("{} {} not found", kind, id))
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if inner.plans.contains_key(&plan.id) {
            return Err(BillingError::Database(format!("duplicate plan id {}", plan.id)));
        }
        inner.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.inner.read().await.plans.get(&id).cloned())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .plans
            .get_mut(&plan.id)
            .ok_or_else(|| missing("Plan", plan.id))?;
        *slot = plan.clone();
        Ok(())
    }

    async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>> {
        let inner = self.inner.read().await;
        let mut plans: Vec<Plan> = inner
            .plans
            .values()
            .filter(|p| !active_only || p.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price).then(a.created_at.cmp(&b.created_at)));
        Ok(plans)
    }

    async fn find_active_plan(&self, tier: PlanTier) -> BillingResult<Option<Plan>> {
        let inner = self.inner.read().await;
        Ok(inner
            .plans
            .values()
            .filter(|p| p.is_active && p.name == tier)
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn insert_organization(&self, org: &Organization) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if inner.organizations.contains_key(&org.id) {
            return Err(BillingError::Database(format!(
                "duplicate organization id {}",
                org.id
            )));
        }
        inner.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> BillingResult<Option<Organization>> {
        Ok(self.inner.read().await.organizations.get(&id).cloned())
    }

    async fn find_organization_by_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organization>> {
        let inner = self.inner.read().await;
        Ok(inner
            .organizations
            .values()
            .find(|o| o.subscription_ref.as_deref() == Some(subscription_ref))
            .cloned())
    }

    async fn list_organizations(&self) -> BillingResult<Vec<Organization>> {
        let inner = self.inner.read().await;
        let mut orgs: Vec<Organization> = inner.organizations.values().cloned().collect();
        orgs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orgs)
    }

    async fn delete_organization(&self, id: Uuid) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .organizations
            .remove(&id)
            .ok_or_else(|| missing("Organization", id))?;
        Ok(())
    }

    async fn update_organization_profile(
        &self,
        org_id: Uuid,
        patch: &OrganizationPatch,
    ) -> BillingResult<Organization> {
        let mut inner = self.inner.write().await;
        let org = inner
            .organizations
            .get_mut(&org_id)
            .ok_or_else(|| missing("Organization", org_id))?;
        if let Some(name) = &patch.name {
            org.name = name.clone();
        }
        if let Some(email) = &patch.billing_email {
            org.billing_email = email.clone();
        }
        if let Some(address) = &patch.billing_address {
            org.billing_address = address.clone();
        }
        org.updated_at = OffsetDateTime::now_utc();
        Ok(org.clone())
    }

    async fn swap_subscription_state(
        &self,
        org_id: Uuid,
        expected: &SubscriptionState,
        next: &SubscriptionState,
    ) -> BillingResult<Option<Organization>> {
        let mut inner = self.inner.write().await;
        if let Some(subscription_ref) = next.subscription_ref.as_deref() {
            let taken = inner.organizations.values().any(|o| {
                o.id != org_id && o.subscription_ref.as_deref() == Some(subscription_ref)
            });
            if taken {
                return Err(BillingError::Validation(
                    "Subscription reference already exists".into(),
                ));
            }
        }
        let org = inner
            .organizations
            .get_mut(&org_id)
            .ok_or_else(|| missing("Organization", org_id))?;
        if SubscriptionState::from(&*org) != *expected {
            return Ok(None);
        }
        org.plan_id = next.plan_id;
        org.subscription_ref = next.subscription_ref.clone();
        org.status = next.status;
        org.status_changed_at = next.status_changed_at;
        org.updated_at = OffsetDateTime::now_utc();
        Ok(Some(org.clone()))
    }

    async fn adjust_seat_count(
        &self,
        org_id: Uuid,
        delta: i32,
        ceiling: i32,
    ) -> BillingResult<SeatAdjustment> {
        let mut inner = self.inner.write().await;
        let org = inner
            .organizations
            .get_mut(&org_id)
            .ok_or_else(|| missing("Organization", org_id))?;

        let current = org.active_seat_count;
        let next = current.saturating_add(delta);
        if next < 0 {
            return Ok(SeatAdjustment::WouldGoNegative { current });
        }
        if delta > 0 && next > ceiling {
            return Ok(SeatAdjustment::WouldExceed { current });
        }
        org.active_seat_count = next;
        org.updated_at = OffsetDateTime::now_utc();
        Ok(SeatAdjustment::Applied(next))
    }

    async fn insert_user(&self, user: &User) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let email = user.email.to_lowercase();
        if inner.users.values().any(|u| u.email.to_lowercase() == email) {
            return Err(BillingError::Validation(format!(
                "A user with email {} already exists",
                user.email
            )));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let email = email.to_lowercase();
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email)
            .cloned())
    }

    async fn list_users(&self, org_id: Uuid) -> BillingResult<Vec<User>> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| u.org_id == org_id)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(users)
    }

    async fn update_user(&self, user: &User) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .users
            .get_mut(&user.id)
            .ok_or_else(|| missing("User", user.id))?;
        *slot = user.clone();
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let clash = inner.orders.iter().any(|o| {
            o.id == order.id
                || (order.payment_intent_ref.is_some()
                    && o.payment_intent_ref == order.payment_intent_ref)
                || (order.invoice_ref.is_some() && o.invoice_ref == order.invoice_ref)
        });
        if clash {
            return Err(BillingError::Database(format!(
                "duplicate order {}",
                order.id
            )));
        }
        inner.orders.push(order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> BillingResult<Option<Order>> {
        let inner = self.inner.read().await;
        Ok(inner.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn find_order_by_payment_ref(&self, payment_ref: &str) -> BillingResult<Option<Order>> {
        let inner = self.inner.read().await;
        Ok(inner
            .orders
            .iter()
            .find(|o| o.payment_intent_ref.as_deref() == Some(payment_ref))
            .cloned())
    }

    async fn find_order_by_invoice_ref(&self, invoice_ref: &str) -> BillingResult<Option<Order>> {
        let inner = self.inner.read().await;
        Ok(inner
            .orders
            .iter()
            .find(|o| o.invoice_ref.as_deref() == Some(invoice_ref))
            .cloned())
    }

    async fn list_orders(&self, org_id: Uuid) -> BillingResult<Vec<Order>> {
        let inner = self.inner.read().await;
        let mut orders: Vec<Order> = inner
            .orders
            .iter()
            .rev()
            .filter(|o| o.org_id == org_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_order(&self, order: &Order) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .orders
            .iter_mut()
            .find(|o| o.id == order.id)
            .ok_or_else(|| missing("Order", order.id))?;
        *slot = order.clone();
        Ok(())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _created_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut inner = self.inner.write().await;
        match inner.events.get(event_id).copied() {
            None | Some(EventProcessingResult::Failed) => {
                inner
                    .events
                    .insert(event_id.to_string(), EventProcessingResult::Processing);
                Ok(EventClaim::Claimed)
            }
            Some(existing) => Ok(EventClaim::Duplicate(existing)),
        }
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventProcessingResult,
        _error: Option<String>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner.events.insert(event_id.to_string(), result);
        Ok(())
    }

    async fn park_event(
        &self,
        lookup_ref: &str,
        event_id: &str,
        payload: &str,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if inner.parked.iter().any(|p| p.event.event_id == event_id) {
            return Ok(());
        }
        inner.parked.push(Parked {
            lookup_ref: lookup_ref.to_string(),
            parked_at: OffsetDateTime::now_utc(),
            event: ParkedEvent {
                event_id: event_id.to_string(),
                payload: payload.to_string(),
            },
        });
        Ok(())
    }

    async fn take_parked_events(&self, lookup_ref: &str) -> BillingResult<Vec<ParkedEvent>> {
        let mut inner = self.inner.write().await;
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.parked)
            .into_iter()
            .partition(|p| p.lookup_ref == lookup_ref);
        inner.parked = kept;
        Ok(taken.into_iter().map(|p| p.event).collect())
    }

    async fn purge_parked_events(&self, parked_before: OffsetDateTime) -> BillingResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        let (purged, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.parked)
            .into_iter()
            .partition(|p| p.parked_at < parked_before);
        inner.parked = kept;
        Ok(purged.into_iter().map(|p| p.event.event_id).collect())
    }
}
