//! Subscription management
//!
//! Drives plan purchases, seat-quantity amendments and cancellations against the
//! payment processor. Local writes happen only after the processor call they
//! depend on has succeeded, so a failed call can simply be retried.
//!
//! An organization holds at most one live processor subscription. Subscribing while
//! an earlier, still unpaid subscription is attached replaces it: the new one is
//! created, the old one canceled at the processor, and only then is the local record
//! switched over. If the old one cannot be canceled the new one is withdrawn again.

use std::sync::Arc;

use seatline_shared::{Order, OrderStatus, Organization, Plan, SubscriptionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::BillingConfig;
use crate::error::{BillingError, BillingResult, ProcessorError};
use crate::locks::OrgLocks;
use crate::orders::OrderLedger;
use crate::organizations::OrganizationLedger;
use crate::processor::{PaymentProcessor, ProcessorSubscription};
use crate::webhooks::Reconciler;

/// Result of a successful subscribe call
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResult {
    pub subscription_ref: String,
    /// Client secret the caller confirms the first payment with
    pub confirmation_handle: Option<String>,
    /// Organization status right after the subscription was attached
    pub status: SubscriptionStatus,
    /// The pending order recorded for this purchase
    pub order: Order,
}

fn check_quantity(plan: &Plan, quantity: i32) -> BillingResult<()> {
    if quantity < plan.min_users || quantity > plan.max_users {
        return Err(BillingError::InvalidQuantity {
            quantity,
            min: plan.min_users,
            max: plan.max_users,
        });
    }
    Ok(())
}

/// The organization's subscription reference, if it has one that is still live
fn live_subscription(org: &Organization) -> BillingResult<&str> {
    match org.subscription_ref.as_deref() {
        Some(subscription_ref) if !org.status.is_terminal() => Ok(subscription_ref),
        _ => Err(BillingError::NoActiveSubscription),
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    processor: Arc<dyn PaymentProcessor>,
    catalog: PlanCatalog,
    ledger: OrganizationLedger,
    orders: OrderLedger,
    reconciler: Reconciler,
    locks: Arc<OrgLocks>,
    config: BillingConfig,
}

impl SubscriptionService {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        catalog: PlanCatalog,
        ledger: OrganizationLedger,
        orders: OrderLedger,
        reconciler: Reconciler,
        locks: Arc<OrgLocks>,
        config: BillingConfig,
    ) -> Self {
        Self {
            processor,
            catalog,
            ledger,
            orders,
            reconciler,
            locks,
            config,
        }
    }

    /// Buy `quantity` seats of `plan_id` for the organization
    pub async fn subscribe(
        &self,
        org_id: Uuid,
        plan_id: Uuid,
        quantity: i32,
    ) -> BillingResult<SubscribeResult> {
        let plan = self.catalog.get(plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::Validation(format!(
                "Plan {} is no longer offered",
                plan.name
            )));
        }
        check_quantity(&plan, quantity)?;

        let guard = self.locks.acquire(org_id).await;

        let org = self.ledger.get(org_id).await?;
        if org.status == SubscriptionStatus::Active && org.subscription_ref.is_some() {
            return Err(BillingError::Validation(
                "Organization already has an active subscription; cancel it first".into(),
            ));
        }
        if org.active_seat_count > plan.max_users {
            return Err(BillingError::SeatLimitExceeded {
                active: org.active_seat_count,
                max: plan.max_users,
            });
        }

        let subscription = self
            .processor
            .create_subscription(&org.customer_ref, &plan.processor_price_ref, quantity)
            .await
            .map_err(|e| {
                tracing::warn!(
                    org_id = %org_id,
                    plan_id = %plan.id,
                    quantity,
                    error = %e,
                    "Processor refused subscription"
                );
                e
            })?;

        let replaced = match live_subscription(&org) {
            Ok(previous) => {
                if let Err(e) = self.retire(org_id, previous).await {
                    self.withdraw(org_id, &subscription.subscription_ref).await;
                    return Err(e);
                }
                Some(previous.to_string())
            }
            Err(_) => None,
        };

        // The order goes first so an early payment event can already find it
        let order = match self
            .orders
            .record_pending(org_id, &plan, quantity, &subscription)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.withdraw(org_id, &subscription.subscription_ref).await;
                return Err(e);
            }
        };
        let status = subscription.initial_local_status();
        let attached = self
            .ledger
            .set_plan(&org, &plan, &subscription.subscription_ref, status)
            .await;
        if let Err(e) = attached {
            self.withdraw(org_id, &subscription.subscription_ref).await;
            self.fail_superseded_orders(org_id, &subscription.subscription_ref)
                .await;
            return Err(e);
        }
        if let Some(previous) = replaced.as_deref() {
            self.fail_superseded_orders(org_id, previous).await;
        }
        drop(guard);

        tracing::info!(
            org_id = %org_id,
            plan_id = %plan.id,
            subscription_ref = %subscription.subscription_ref,
            replaced = ?replaced,
            order_id = %order.id,
            quantity,
            "Subscription created"
        );

        self.replay_parked(&subscription).await;

        Ok(SubscribeResult {
            subscription_ref: subscription.subscription_ref,
            confirmation_handle: subscription.confirmation_handle,
            status,
            order,
        })
    }

    /// Cancel a subscription that is being replaced. One already gone at the
    /// processor counts as canceled.
    async fn retire(&self, org_id: Uuid, subscription_ref: &str) -> BillingResult<()> {
        match self.processor.cancel_subscription(subscription_ref).await {
            Ok(()) => Ok(()),
            Err(ProcessorError::NotFound(_)) => {
                tracing::info!(
                    org_id = %org_id,
                    subscription_ref = %subscription_ref,
                    "Replaced subscription already gone at processor"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    org_id = %org_id,
                    subscription_ref = %subscription_ref,
                    error = %e,
                    "Processor refused to cancel replaced subscription"
                );
                Err(e.into())
            }
        }
    }

    /// Best-effort cancel of a subscription created by a call that then failed
    async fn withdraw(&self, org_id: Uuid, subscription_ref: &str) {
        if let Err(e) = self.processor.cancel_subscription(subscription_ref).await {
            tracing::error!(
                org_id = %org_id,
                subscription_ref = %subscription_ref,
                error = %e,
                "Failed to withdraw subscription; it is not attached to any organization"
            );
        }
    }

    /// Unpaid orders of a replaced or withdrawn subscription will never be paid
    async fn fail_superseded_orders(&self, org_id: Uuid, subscription_ref: &str) {
        let orders = match self.orders.list_for_org(org_id).await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(org_id = %org_id, error = %e, "Could not load orders of replaced subscription");
                return;
            }
        };
        let now = OffsetDateTime::now_utc();
        for order in orders.into_iter().filter(|o| {
            o.status == OrderStatus::Pending && o.subscription_ref.as_deref() == Some(subscription_ref)
        }) {
            if let Err(e) = self.orders.apply_status(order.id, OrderStatus::Failed, now).await {
                tracing::warn!(order_id = %order.id, error = %e, "Could not fail superseded order");
            }
        }
    }

    /// Events for this subscription that arrived before it was recorded locally
    async fn replay_parked(&self, subscription: &ProcessorSubscription) {
        let refs = [
            Some(subscription.subscription_ref.as_str()),
            subscription.payment_intent_ref.as_deref(),
            subscription.invoice_ref.as_deref(),
        ];
        for lookup_ref in refs.into_iter().flatten() {
            for (event_id, outcome) in self.reconciler.replay(lookup_ref).await {
                tracing::info!(
                    event_id = %event_id,
                    subscription_ref = %subscription.subscription_ref,
                    outcome = ?outcome,
                    "Applied early webhook event"
                );
            }
        }
    }

    /// Cancel the organization's subscription at the processor, then locally
    pub async fn cancel(&self, org_id: Uuid) -> BillingResult<Organization> {
        let _guard = self.locks.acquire(org_id).await;

        let org = self.ledger.get(org_id).await?;
        let subscription_ref = live_subscription(&org)?.to_string();

        self.processor
            .cancel_subscription(&subscription_ref)
            .await
            .map_err(|e| {
                tracing::warn!(
                    org_id = %org_id,
                    subscription_ref = %subscription_ref,
                    error = %e,
                    "Processor refused cancellation"
                );
                e
            })?;

        let change = self
            .ledger
            .set_status(
                org_id,
                SubscriptionStatus::Canceled,
                Some(OffsetDateTime::now_utc()),
            )
            .await?;

        tracing::info!(org_id = %org_id, subscription_ref = %subscription_ref, "Subscription canceled");
        Ok(change.organization().clone())
    }

    /// Change the billed seat quantity. Proration is left to the processor; no order
    /// is recorded for the amendment.
    pub async fn change_seat_quantity(
        &self,
        org_id: Uuid,
        quantity: i32,
    ) -> BillingResult<ProcessorSubscription> {
        let _guard = self.locks.acquire(org_id).await;

        let (org, plan) = self.ledger.get_with_plan(org_id).await?;
        check_quantity(&plan, quantity)?;
        let subscription_ref = live_subscription(&org)?;

        let updated = self
            .processor
            .update_subscription_quantity(subscription_ref, quantity)
            .await?;

        tracing::info!(
            org_id = %org_id,
            subscription_ref = %subscription_ref,
            quantity,
            "Subscription quantity updated"
        );
        Ok(updated)
    }

    /// Client handle for saving a card without charging it
    pub async fn create_setup_intent(&self, org_id: Uuid) -> BillingResult<String> {
        let org = self.ledger.get(org_id).await?;
        let handle = self.processor.create_setup_intent(&org.customer_ref).await?;
        tracing::debug!(org_id = %org_id, "Setup intent created");
        Ok(handle)
    }

    /// Expire active organizations whose last paid period ended more than the grace
    /// period before `now`. Returns the organizations that were expired.
    ///
    /// Safe to run while another process applies renewals: the organization is read
    /// before its orders, and a renewal completes its order before touching the
    /// organization, so a renewal the order read missed makes the final swap miss.
    pub async fn expire_lapsed(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let grace = Duration::days(self.config.renewal_grace_days);
        let mut expired = Vec::new();

        for org in self.ledger.list().await? {
            if org.status != SubscriptionStatus::Active {
                continue;
            }

            let _guard = self.locks.acquire(org.id).await;
            let observed = self.ledger.get(org.id).await?;
            if observed.status != SubscriptionStatus::Active {
                continue;
            }
            let Some(last_paid) = self.orders.last_completed(org.id).await? else {
                continue;
            };
            if last_paid.period_end + grace >= now {
                continue;
            }

            match self
                .ledger
                .transition_from(&observed, SubscriptionStatus::Expired, None)
                .await
            {
                Ok(Some(_)) => {
                    tracing::info!(
                        org_id = %org.id,
                        period_end = %last_paid.period_end,
                        "Subscription lapsed"
                    );
                    expired.push(org.id);
                }
                Ok(None) => {
                    tracing::info!(
                        org_id = %org.id,
                        "Organization changed during lapse check; left for the next sweep"
                    );
                }
                Err(e) => {
                    tracing::error!(org_id = %org.id, error = %e, "Failed to expire subscription");
                }
            }
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessorError;
    use crate::organizations::{NewMember, RegisterOrganization};
    use crate::store::InMemoryStore;
    use crate::testing::{seed_plan, FakeProcessor};
    use seatline_shared::{BillingAddress, OrderStatus, PlanTier};

    struct Fixture {
        store: Arc<InMemoryStore>,
        processor: Arc<FakeProcessor>,
        ledger: OrganizationLedger,
        orders: OrderLedger,
        subscriptions: SubscriptionService,
        standard: Plan,
        org: Organization,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let processor = Arc::new(FakeProcessor::new());
        seed_plan(store.as_ref(), PlanTier::Basic, 999, 1, 3).await;
        let standard = seed_plan(store.as_ref(), PlanTier::Standard, 4999, 1, 5).await;

        let config = BillingConfig::default();
        let locks = Arc::new(OrgLocks::new());
        let ledger = OrganizationLedger::new(store.clone(), processor.clone(), config.clone());
        let orders = OrderLedger::new(store.clone());
        let reconciler =
            Reconciler::new(store.clone(), ledger.clone(), orders.clone(), locks.clone());
        let subscriptions = SubscriptionService::new(
            processor.clone(),
            PlanCatalog::new(store.clone(), "inr"),
            ledger.clone(),
            orders.clone(),
            reconciler,
            locks,
            config,
        );
        let (org, _) = ledger
            .register(RegisterOrganization {
                name: "Acme".into(),
                billing_email: "billing@acme.test".into(),
                billing_address: BillingAddress::default(),
                admin: NewMember {
                    name: "Ravi".into(),
                    email: "ravi@acme.test".into(),
                    password_hash: "$argon2id$hash".into(),
                },
            })
            .await
            .unwrap();

        Fixture {
            store,
            processor,
            ledger,
            orders,
            subscriptions,
            standard,
            org,
        }
    }

    #[tokio::test]
    async fn test_subscribe_records_pending_order_and_attaches_plan() {
        let f = fixture().await;

        let result = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 3)
            .await
            .unwrap();

        assert_eq!(result.subscription_ref, "sub_1");
        assert_eq!(result.confirmation_handle.as_deref(), Some("pi_1_secret"));
        assert_eq!(result.status, SubscriptionStatus::Trialing);
        assert_eq!(result.order.amount, 14997);
        assert_eq!(result.order.status, OrderStatus::Pending);

        let org = f.ledger.get(f.org.id).await.unwrap();
        assert_eq!(org.plan_id, f.standard.id);
        assert_eq!(org.subscription_ref.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_out_of_bounds_quantity_before_processor() {
        let f = fixture().await;

        for quantity in [0, 6] {
            let err = f
                .subscriptions
                .subscribe(f.org.id, f.standard.id, quantity)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                BillingError::InvalidQuantity { min: 1, max: 5, .. }
            ));
        }
        assert_eq!(f.processor.call_count("create_subscription"), 0);
        assert!(f.orders.list_for_org(f.org.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_to_inactive_plan_is_rejected() {
        let f = fixture().await;
        PlanCatalog::new(f.store.clone(), "inr")
            .deactivate(f.standard.id)
            .await
            .unwrap();

        let err = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_declined_subscribe_changes_nothing() {
        let f = fixture().await;
        let before = f.ledger.get(f.org.id).await.unwrap();
        f.processor.fail_next(
            "create_subscription",
            ProcessorError::Declined("card_declined".into()),
        );

        let err = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 3)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::Processor(ProcessorError::Declined(_))
        ));
        assert_eq!(f.ledger.get(f.org.id).await.unwrap(), before);
        assert!(f.orders.list_for_org(f.org.id).await.unwrap().is_empty());

        // Retrying the same call is safe
        assert!(f.subscriptions.subscribe(f.org.id, f.standard.id, 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_twice_while_active_is_rejected() {
        let f = fixture().await;
        f.processor.set_subscription_status("active");
        f.subscriptions
            .subscribe(f.org.id, f.standard.id, 3)
            .await
            .unwrap();

        let err = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(f.processor.call_count("create_subscription"), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_resubscribe() {
        let f = fixture().await;
        f.processor.set_subscription_status("active");
        f.subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();

        let canceled = f.subscriptions.cancel(f.org.id).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);

        // Canceling again has nothing to cancel
        let err = f.subscriptions.cancel(f.org.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription));
        assert_eq!(f.processor.call_count("cancel_subscription"), 1);

        let again = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        assert_eq!(again.subscription_ref, "sub_2");
        assert_eq!(again.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_status() {
        let f = fixture().await;
        f.subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        f.processor.fail_next(
            "cancel_subscription",
            ProcessorError::Transient("timeout".into()),
        );

        assert!(f.subscriptions.cancel(f.org.id).await.is_err());
        assert_eq!(
            f.ledger.get(f.org.id).await.unwrap().status,
            SubscriptionStatus::Trialing
        );
    }

    #[tokio::test]
    async fn test_resubscribe_while_unpaid_replaces_previous_subscription() {
        let f = fixture().await;
        let first = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        assert_eq!(first.status, SubscriptionStatus::Trialing);

        let second = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 4)
            .await
            .unwrap();

        assert_eq!(second.subscription_ref, "sub_2");
        assert_eq!(f.processor.canceled(), vec!["sub_1".to_string()]);
        assert_eq!(
            f.ledger.get(f.org.id).await.unwrap().subscription_ref.as_deref(),
            Some("sub_2")
        );

        let orders = f.orders.list_for_org(f.org.id).await.unwrap();
        let pending: Vec<_> = orders
            .iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.order.id);
        assert_eq!(
            f.orders.get(first.order.id).await.unwrap().status,
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_resubscribe_aborts_when_previous_cannot_be_canceled() {
        let f = fixture().await;
        let first = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        let before = f.ledger.get(f.org.id).await.unwrap();
        f.processor.fail_next(
            "cancel_subscription",
            ProcessorError::Transient("timeout".into()),
        );

        let err = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 4)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::Processor(ProcessorError::Transient(_))
        ));
        // The new subscription was withdrawn; the old one is untouched
        assert_eq!(f.processor.canceled(), vec!["sub_2".to_string()]);
        assert_eq!(f.ledger.get(f.org.id).await.unwrap(), before);
        let orders = f.orders.list_for_org(f.org.id).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, first.order.id);
        assert_eq!(orders[0].status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_resubscribe_tolerates_previous_already_gone() {
        let f = fixture().await;
        f.subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        f.processor.fail_next(
            "cancel_subscription",
            ProcessorError::NotFound("No such subscription: sub_1".into()),
        );

        let second = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        assert_eq!(second.subscription_ref, "sub_2");
        assert!(f.processor.canceled().is_empty());
    }

    #[tokio::test]
    async fn test_profile_update_during_subscribe_keeps_both() {
        let f = fixture().await;
        f.processor.set_delay(std::time::Duration::from_millis(50));

        let (subscribed, updated) = tokio::join!(
            f.subscriptions.subscribe(f.org.id, f.standard.id, 3),
            async {
                // Lands while subscribe waits on the processor
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                f.ledger
                    .update_profile(
                        f.org.id,
                        crate::organizations::OrganizationPatch {
                            name: Some("Acme Labs".into()),
                            ..Default::default()
                        },
                    )
                    .await
            }
        );
        subscribed.unwrap();
        updated.unwrap();

        let org = f.ledger.get(f.org.id).await.unwrap();
        assert_eq!(org.name, "Acme Labs");
        assert_eq!(org.subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(org.plan_id, f.standard.id);
    }

    #[tokio::test]
    async fn test_expire_lapsed_leaves_renewed_org_active() {
        let f = fixture().await;
        let now = OffsetDateTime::now_utc();
        f.processor.set_subscription_status("active");
        f.processor
            .set_period(now - Duration::days(370), now - Duration::days(5));
        let result = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        f.orders
            .apply_status(result.order.id, OrderStatus::Completed, now - Duration::days(370))
            .await
            .unwrap();
        let observed = f.ledger.get(f.org.id).await.unwrap();

        // Renewal recorded by another process after the sweep took its snapshot
        f.ledger
            .set_status(f.org.id, SubscriptionStatus::Active, Some(now))
            .await
            .unwrap();
        let outcome = f
            .ledger
            .transition_from(&observed, SubscriptionStatus::Expired, None)
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(
            f.ledger.get(f.org.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_change_seat_quantity_writes_no_order() {
        let f = fixture().await;
        f.subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();

        let updated = f
            .subscriptions
            .change_seat_quantity(f.org.id, 4)
            .await
            .unwrap();
        assert_eq!(updated.quantity, 4);
        assert_eq!(f.orders.list_for_org(f.org.id).await.unwrap().len(), 1);

        let err = f
            .subscriptions
            .change_seat_quantity(f.org.id, 9)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidQuantity { .. }));
        assert_eq!(f.processor.call_count("update_subscription_quantity"), 1);
    }

    #[tokio::test]
    async fn test_change_seat_quantity_without_subscription() {
        let f = fixture().await;
        let err = f
            .subscriptions
            .change_seat_quantity(f.org.id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription));
    }

    #[tokio::test]
    async fn test_setup_intent_uses_customer() {
        let f = fixture().await;
        let handle = f.subscriptions.create_setup_intent(f.org.id).await.unwrap();
        assert_eq!(handle, "seti_1_secret");
    }

    #[tokio::test]
    async fn test_expire_lapsed_respects_grace_period() {
        let f = fixture().await;
        let now = OffsetDateTime::now_utc();
        f.processor.set_subscription_status("active");
        f.processor
            .set_period(now - Duration::days(370), now - Duration::days(5));
        let result = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();
        f.orders
            .apply_status(result.order.id, OrderStatus::Completed, now - Duration::days(370))
            .await
            .unwrap();

        // Five days past the period end, beyond the three-day grace
        let expired = f.subscriptions.expire_lapsed(now).await.unwrap();
        assert_eq!(expired, vec![f.org.id]);
        assert_eq!(
            f.ledger.get(f.org.id).await.unwrap().status,
            SubscriptionStatus::Expired
        );

        // Idempotent
        assert!(f.subscriptions.expire_lapsed(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_lapsed_skips_paid_up_and_unpaid_orgs() {
        let f = fixture().await;
        let now = OffsetDateTime::now_utc();
        f.processor.set_subscription_status("active");
        f.processor
            .set_period(now - Duration::days(364), now + Duration::days(1));
        let result = f
            .subscriptions
            .subscribe(f.org.id, f.standard.id, 2)
            .await
            .unwrap();

        // Active but nothing completed yet
        assert!(f.subscriptions.expire_lapsed(now).await.unwrap().is_empty());

        f.orders
            .apply_status(result.order.id, OrderStatus::Completed, now)
            .await
            .unwrap();
        assert!(f
            .subscriptions
            .expire_lapsed(now + Duration::days(3))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            f.subscriptions
                .expire_lapsed(now + Duration::days(5))
                .await
                .unwrap(),
            vec![f.org.id]
        );
    }
}
