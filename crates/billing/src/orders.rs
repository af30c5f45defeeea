//! Order ledger
//!
//! Append-only record of billing transaction attempts. Orders are created by
//! subscribe and by renewal invoices; their status only moves through
//! reconciliation:
//!
//! ```text
//! pending ──► completed ──► refunded
//!    │            ▲
//!    └──► failed ─┘
//! ```

use std::sync::Arc;

use seatline_shared::{Order, OrderStatus, Plan};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::processor::ProcessorSubscription;
use crate::store::BillingStore;

/// A processor invoice for a subscription period that has no local order yet
#[derive(Debug, Clone)]
pub struct RenewalInvoice {
    pub subscription_ref: String,
    pub invoice_ref: String,
    pub payment_intent_ref: Option<String>,
    pub amount: i64,
    pub quantity: i32,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

/// Outcome of an order status update
#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatusChange {
    Applied(Order),
    /// Same state, or an update older than the last applied one
    Unchanged(Order),
}

impl OrderStatusChange {
    pub fn order(&self) -> &Order {
        match self {
            Self::Applied(order) | Self::Unchanged(order) => order,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// `price × quantity` in minor units
pub fn order_amount(unit_price: i64, quantity: i32) -> BillingResult<i64> {
    unit_price
        .checked_mul(i64::from(quantity))
        .ok_or_else(|| BillingError::Validation("Order amount overflows".into()))
}

#[derive(Clone)]
pub struct OrderLedger {
    store: Arc<dyn BillingStore>,
}

impl OrderLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Record the pending order for a subscription the processor just created
    pub async fn record_pending(
        &self,
        org_id: Uuid,
        plan: &Plan,
        quantity: i32,
        subscription: &ProcessorSubscription,
    ) -> BillingResult<Order> {
        let order = Order {
            id: Uuid::new_v4(),
            org_id,
            plan_id: plan.id,
            plan_name: plan.name,
            unit_price: plan.price,
            quantity,
            amount: order_amount(plan.price, quantity)?,
            currency: plan.currency.clone(),
            status: OrderStatus::Pending,
            subscription_ref: Some(subscription.subscription_ref.clone()),
            payment_intent_ref: subscription.payment_intent_ref.clone(),
            invoice_ref: subscription.invoice_ref.clone(),
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            status_changed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_order(&order).await?;

        tracing::info!(
            order_id = %order.id,
            org_id = %org_id,
            amount = order.amount,
            quantity,
            subscription_ref = %subscription.subscription_ref,
            "Pending order recorded"
        );
        Ok(order)
    }

    /// Record an order for a renewal invoice the processor reported
    pub async fn record_renewal(
        &self,
        org_id: Uuid,
        plan: &Plan,
        invoice: &RenewalInvoice,
        status: OrderStatus,
        at: OffsetDateTime,
    ) -> BillingResult<Order> {
        let quantity = invoice.quantity.max(1);
        let order = Order {
            id: Uuid::new_v4(),
            org_id,
            plan_id: plan.id,
            plan_name: plan.name,
            unit_price: invoice.amount / i64::from(quantity),
            quantity,
            amount: invoice.amount,
            currency: plan.currency.clone(),
            status,
            subscription_ref: Some(invoice.subscription_ref.clone()),
            payment_intent_ref: invoice.payment_intent_ref.clone(),
            invoice_ref: Some(invoice.invoice_ref.clone()),
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            status_changed_at: Some(at),
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_order(&order).await?;

        tracing::info!(
            order_id = %order.id,
            org_id = %org_id,
            invoice_ref = %invoice.invoice_ref,
            status = %status,
            "Renewal order recorded"
        );
        Ok(order)
    }

    pub async fn get(&self, order_id: Uuid) -> BillingResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Order {} not found", order_id)))
    }

    pub async fn find_by_payment_ref(&self, payment_ref: &str) -> BillingResult<Option<Order>> {
        self.store.find_order_by_payment_ref(payment_ref).await
    }

    pub async fn find_by_invoice_ref(&self, invoice_ref: &str) -> BillingResult<Option<Order>> {
        self.store.find_order_by_invoice_ref(invoice_ref).await
    }

    /// Newest first
    pub async fn list_for_org(&self, org_id: Uuid) -> BillingResult<Vec<Order>> {
        self.store.list_orders(org_id).await
    }

    /// Most recent order that was paid for, if any
    pub async fn last_completed(&self, org_id: Uuid) -> BillingResult<Option<Order>> {
        Ok(self
            .list_for_org(org_id)
            .await?
            .into_iter()
            .filter(|o| o.status == OrderStatus::Completed)
            .max_by_key(|o| o.period_end))
    }

    /// Move an order to `status` as of processor time `at`
    pub async fn apply_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        at: OffsetDateTime,
    ) -> BillingResult<OrderStatusChange> {
        let mut order = self.get(order_id).await?;

        if order.status_changed_at.is_some_and(|last| at < last) {
            tracing::info!(
                order_id = %order.id,
                requested = %status,
                current = %order.status,
                "Ignoring order update older than the last applied one"
            );
            return Ok(OrderStatusChange::Unchanged(order));
        }
        if order.status == status {
            return Ok(OrderStatusChange::Unchanged(order));
        }
        if !order.status.can_transition_to(status) {
            tracing::warn!(
                order_id = %order.id,
                from = %order.status,
                to = %status,
                "Rejected order status transition"
            );
            return Err(BillingError::InvariantViolation(format!(
                "Illegal order transition {} -> {} for order {}",
                order.status, status, order.id
            )));
        }

        let previous = order.status;
        order.status = status;
        order.status_changed_at = Some(at);
        self.store.update_order(&order).await?;

        tracing::info!(order_id = %order.id, from = %previous, to = %status, "Order status changed");
        Ok(OrderStatusChange::Applied(order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testing::seed_plan;
    use seatline_shared::PlanTier;
    use time::Duration;

    fn subscription(n: u32) -> ProcessorSubscription {
        let now = OffsetDateTime::now_utc();
        ProcessorSubscription {
            subscription_ref: format!("sub_{}", n),
            status: "incomplete".into(),
            quantity: 3,
            current_period_start: now,
            current_period_end: now + Duration::days(365),
            invoice_ref: Some(format!("in_{}", n)),
            payment_intent_ref: Some(format!("pi_{}", n)),
            confirmation_handle: None,
        }
    }

    async fn ledger() -> (OrderLedger, Plan) {
        let store = Arc::new(InMemoryStore::new());
        let plan = seed_plan(store.as_ref(), PlanTier::Standard, 4999, 1, 5).await;
        (OrderLedger::new(store), plan)
    }

    #[test]
    fn test_order_amount() {
        assert_eq!(order_amount(4999, 3).unwrap(), 14997);
        assert!(order_amount(i64::MAX, 2).is_err());
    }

    #[tokio::test]
    async fn test_record_pending_snapshots_plan() {
        let (orders, plan) = ledger().await;
        let org_id = Uuid::new_v4();

        let order = orders
            .record_pending(org_id, &plan, 3, &subscription(1))
            .await
            .unwrap();

        assert_eq!(order.amount, 14997);
        assert_eq!(order.unit_price, 4999);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.plan_name, PlanTier::Standard);
        assert_eq!(
            orders.find_by_payment_ref("pi_1").await.unwrap().unwrap().id,
            order.id
        );
    }

    #[tokio::test]
    async fn test_apply_status_table() {
        let (orders, plan) = ledger().await;
        let order = orders
            .record_pending(Uuid::new_v4(), &plan, 1, &subscription(1))
            .await
            .unwrap();
        let t = OffsetDateTime::now_utc();

        let failed = orders
            .apply_status(order.id, OrderStatus::Failed, t)
            .await
            .unwrap();
        assert!(failed.is_applied());

        let completed = orders
            .apply_status(order.id, OrderStatus::Completed, t + Duration::seconds(1))
            .await
            .unwrap();
        assert!(completed.is_applied());

        let again = orders
            .apply_status(order.id, OrderStatus::Completed, t + Duration::seconds(2))
            .await
            .unwrap();
        assert!(!again.is_applied());

        let err = orders
            .apply_status(order.id, OrderStatus::Pending, t + Duration::seconds(3))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_late_failure_does_not_override_completion() {
        let (orders, plan) = ledger().await;
        let order = orders
            .record_pending(Uuid::new_v4(), &plan, 1, &subscription(1))
            .await
            .unwrap();
        let t = OffsetDateTime::now_utc();

        orders
            .apply_status(order.id, OrderStatus::Completed, t)
            .await
            .unwrap();
        let late = orders
            .apply_status(order.id, OrderStatus::Failed, t - Duration::seconds(30))
            .await
            .unwrap();

        assert!(!late.is_applied());
        assert_eq!(late.order().status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_for_org_newest_first() {
        let (orders, plan) = ledger().await;
        let org_id = Uuid::new_v4();
        let first = orders
            .record_pending(org_id, &plan, 1, &subscription(1))
            .await
            .unwrap();
        let second = orders
            .record_pending(org_id, &plan, 2, &subscription(2))
            .await
            .unwrap();
        orders
            .record_pending(Uuid::new_v4(), &plan, 1, &subscription(3))
            .await
            .unwrap();

        let listed = orders.list_for_org(org_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }
}
