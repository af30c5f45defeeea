//! Postgres-backed store

use async_trait::async_trait;
use seatline_shared::{Order, Organization, Plan, PlanTier, User};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, EventClaim, EventProcessingResult, ParkedEvent, SeatAdjustment,
    SubscriptionState,
};
use crate::error::{BillingError, BillingResult};
use crate::organizations::OrganizationPatch;

const PLAN_COLUMNS: &str = "id, name, description, price, currency, billing_cycle, min_users, \
    max_users, features, trial_days, processor_product_ref, processor_price_ref, is_active, \
    created_at, updated_at";

const ORG_COLUMNS: &str = "id, name, plan_id, customer_ref, subscription_ref, active_seat_count, \
    trial_ends_at, status, status_changed_at, billing_email, address_line1, address_city, \
    address_state, address_postal_code, address_country, created_at, updated_at";

const USER_COLUMNS: &str = "id, org_id, name, email, password_hash, role, is_active, seat_exempt, \
    removed_at, created_at";

const ORDER_COLUMNS: &str = "id, org_id, plan_id, plan_name, unit_price, quantity, amount, \
    currency, status, subscription_ref, payment_intent_ref, invoice_ref, period_start, \
    period_end, status_changed_at, created_at";

/// [`BillingStore`] over a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Unique violations are caller mistakes (duplicate email, replayed reference), not outages.
fn map_unique(e: sqlx::Error, what: &str) -> BillingError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            BillingError::Validation(format!("{} already exists", what))
        }
        _ => BillingError::from(e),
    }
}

fn ensure_updated(rows: u64, kind: &str, id: Uuid) -> BillingResult<()> {
    if rows == 0 {
        return Err(BillingError::NotFound(format!("{} {} not found", kind, id)));
    }
    Ok(())
}

#[async_trait]
impl BillingStore for PgStore {
    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, name, description, price, currency, billing_cycle, min_users,
                               max_users, features, trial_days, processor_product_ref,
                               processor_price_ref, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(plan.id)
        .bind(plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(&plan.currency)
        .bind(&plan.billing_cycle)
        .bind(plan.min_users)
        .bind(plan.max_users)
        .bind(&plan.features)
        .bind(plan.trial_days)
        .bind(&plan.processor_product_ref)
        .bind(&plan.processor_price_ref)
        .bind(plan.is_active)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Plan"))?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE id = $1",
            PLAN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET name = $2, description = $3, price = $4, currency = $5, billing_cycle = $6,
                min_users = $7, max_users = $8, features = $9, trial_days = $10,
                processor_product_ref = $11, processor_price_ref = $12, is_active = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(plan.id)
        .bind(plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(&plan.currency)
        .bind(&plan.billing_cycle)
        .bind(plan.min_users)
        .bind(plan.max_users)
        .bind(&plan.features)
        .bind(plan.trial_days)
        .bind(&plan.processor_product_ref)
        .bind(&plan.processor_price_ref)
        .bind(plan.is_active)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), "Plan", plan.id)
    }

    async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE ($1 = FALSE OR is_active) ORDER BY price ASC, created_at ASC",
            PLAN_COLUMNS
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    async fn find_active_plan(&self, tier: PlanTier) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE name = $1 AND is_active ORDER BY created_at ASC LIMIT 1",
            PLAN_COLUMNS
        ))
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn insert_organization(&self, org: &Organization) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, plan_id, customer_ref, subscription_ref,
                                       active_seat_count, trial_ends_at, status, status_changed_at,
                                       billing_email, address_line1, address_city, address_state,
                                       address_postal_code, address_country, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(org.plan_id)
        .bind(&org.customer_ref)
        .bind(&org.subscription_ref)
        .bind(org.active_seat_count)
        .bind(org.trial_ends_at)
        .bind(org.status)
        .bind(org.status_changed_at)
        .bind(&org.billing_email)
        .bind(&org.billing_address.line1)
        .bind(&org.billing_address.city)
        .bind(&org.billing_address.state)
        .bind(&org.billing_address.postal_code)
        .bind(&org.billing_address.country)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Organization"))?;
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> BillingResult<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {} FROM organizations WHERE id = $1",
            ORG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    async fn find_organization_by_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {} FROM organizations WHERE subscription_ref = $1",
            ORG_COLUMNS
        ))
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    async fn list_organizations(&self) -> BillingResult<Vec<Organization>> {
        let orgs = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {} FROM organizations ORDER BY created_at ASC",
            ORG_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(orgs)
    }

    async fn delete_organization(&self, id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        ensure_updated(result.rows_affected(), "Organization", id)
    }

    async fn update_organization_profile(
        &self,
        org_id: Uuid,
        patch: &OrganizationPatch,
    ) -> BillingResult<Organization> {
        let address = patch.billing_address.clone().unwrap_or_default();
        let org = sqlx::query_as::<_, Organization>(&format!(
            r#"
            UPDATE organizations
            SET name = COALESCE($2, name),
                billing_email = COALESCE($3, billing_email),
                address_line1 = CASE WHEN $4::BOOLEAN THEN $5::TEXT ELSE address_line1 END,
                address_city = CASE WHEN $4::BOOLEAN THEN $6::TEXT ELSE address_city END,
                address_state = CASE WHEN $4::BOOLEAN THEN $7::TEXT ELSE address_state END,
                address_postal_code = CASE WHEN $4::BOOLEAN THEN $8::TEXT ELSE address_postal_code END,
                address_country = CASE WHEN $4::BOOLEAN THEN $9::TEXT ELSE address_country END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            ORG_COLUMNS
        ))
        .bind(org_id)
        .bind(&patch.name)
        .bind(&patch.billing_email)
        .bind(patch.billing_address.is_some())
        .bind(&address.line1)
        .bind(&address.city)
        .bind(&address.state)
        .bind(&address.postal_code)
        .bind(&address.country)
        .fetch_optional(&self.pool)
        .await?;
        org.ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", org_id)))
    }

    async fn swap_subscription_state(
        &self,
        org_id: Uuid,
        expected: &SubscriptionState,
        next: &SubscriptionState,
    ) -> BillingResult<Option<Organization>> {
        // The WHERE clause is the compare; a concurrent writer in any process makes it miss.
        let swapped = sqlx::query_as::<_, Organization>(&format!(
            r#"
            UPDATE organizations
            SET plan_id = $6, subscription_ref = $7, status = $8, status_changed_at = $9,
                updated_at = NOW()
            WHERE id = $1
              AND plan_id = $2
              AND subscription_ref IS NOT DISTINCT FROM $3
              AND status = $4
              AND status_changed_at IS NOT DISTINCT FROM $5
            RETURNING {}
            "#,
            ORG_COLUMNS
        ))
        .bind(org_id)
        .bind(expected.plan_id)
        .bind(&expected.subscription_ref)
        .bind(expected.status)
        .bind(expected.status_changed_at)
        .bind(next.plan_id)
        .bind(&next.subscription_ref)
        .bind(next.status)
        .bind(next.status_changed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Subscription reference"))?;

        if swapped.is_some() {
            return Ok(swapped);
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(None),
            None => Err(BillingError::NotFound(format!(
                "Organization {} not found",
                org_id
            ))),
        }
    }

    async fn adjust_seat_count(
        &self,
        org_id: Uuid,
        delta: i32,
        ceiling: i32,
    ) -> BillingResult<SeatAdjustment> {
        // Check and increment in one statement so concurrent writers cannot both pass the check.
        let applied: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE organizations
            SET active_seat_count = active_seat_count + $2, updated_at = NOW()
            WHERE id = $1
              AND active_seat_count + $2 >= 0
              AND ($2 <= 0 OR active_seat_count + $2 <= $3)
            RETURNING active_seat_count
            "#,
        )
        .bind(org_id)
        .bind(delta)
        .bind(ceiling)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((count,)) = applied {
            return Ok(SeatAdjustment::Applied(count));
        }

        let current: Option<(i32,)> =
            sqlx::query_as("SELECT active_seat_count FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(BillingError::NotFound(format!(
                "Organization {} not found",
                org_id
            ))),
            Some((current,)) if current + delta < 0 => {
                Ok(SeatAdjustment::WouldGoNegative { current })
            }
            Some((current,)) => Ok(SeatAdjustment::WouldExceed { current }),
        }
    }

    async fn insert_user(&self, user: &User) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, org_id, name, email, password_hash, role, is_active,
                               seat_exempt, removed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id)
        .bind(user.org_id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(user.is_active)
        .bind(user.seat_exempt)
        .bind(user.removed_at)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "A user with this email"))?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE LOWER(email) = LOWER($1)",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn list_users(&self, org_id: Uuid) -> BillingResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE org_id = $1 ORDER BY created_at ASC",
            USER_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn update_user(&self, user: &User) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET name = $2, email = $3, password_hash = $4, role = $5, is_active = $6,
                seat_exempt = $7, removed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(user.is_active)
        .bind(user.seat_exempt)
        .bind(user.removed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "A user with this email"))?;
        ensure_updated(result.rows_affected(), "User", user.id)
    }

    async fn insert_order(&self, order: &Order) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, org_id, plan_id, plan_name, unit_price, quantity, amount,
                                currency, status, subscription_ref, payment_intent_ref,
                                invoice_ref, period_start, period_end, status_changed_at,
                                created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(order.id)
        .bind(order.org_id)
        .bind(order.plan_id)
        .bind(order.plan_name)
        .bind(order.unit_price)
        .bind(order.quantity)
        .bind(order.amount)
        .bind(&order.currency)
        .bind(order.status)
        .bind(&order.subscription_ref)
        .bind(&order.payment_intent_ref)
        .bind(&order.invoice_ref)
        .bind(order.period_start)
        .bind(order.period_end)
        .bind(order.status_changed_at)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Order"))?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn find_order_by_payment_ref(&self, payment_ref: &str) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE payment_intent_ref = $1",
            ORDER_COLUMNS
        ))
        .bind(payment_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn find_order_by_invoice_ref(&self, invoice_ref: &str) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE invoice_ref = $1",
            ORDER_COLUMNS
        ))
        .bind(invoice_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn list_orders(&self, org_id: Uuid) -> BillingResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE org_id = $1 ORDER BY created_at DESC, id DESC",
            ORDER_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    async fn update_order(&self, order: &Order) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, status_changed_at = $3, payment_intent_ref = $4, invoice_ref = $5
            WHERE id = $1
            "#,
        )
        .bind(order.id)
        .bind(order.status)
        .bind(order.status_changed_at)
        .bind(&order.payment_intent_ref)
        .bind(&order.invoice_ref)
        .execute(&self.pool)
        .await?;
        ensure_updated(result.rows_affected(), "Order", order.id)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        created_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        // Only a failed event may be claimed again; anything else is a redelivery.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, event_type, event_created_at, processing_result)
            VALUES ($1, $2, $3, 'processing')
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                error_message = NULL,
                updated_at = NOW()
            WHERE webhook_events.processing_result = 'failed'
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(created_at)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT processing_result FROM webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        let status = existing
            .and_then(|(s,)| s.parse().ok())
            .unwrap_or(EventProcessingResult::Processing);
        Ok(EventClaim::Duplicate(status))
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventProcessingResult,
        error: Option<String>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3, updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn park_event(
        &self,
        lookup_ref: &str,
        event_id: &str,
        payload: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO parked_webhook_events (lookup_ref, event_id, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(lookup_ref)
        .bind(event_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_parked_events(&self, lookup_ref: &str) -> BillingResult<Vec<ParkedEvent>> {
        let mut rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            DELETE FROM parked_webhook_events
            WHERE lookup_ref = $1
            RETURNING id, event_id, payload
            "#,
        )
        .bind(lookup_ref)
        .fetch_all(&self.pool)
        .await?;

        rows.sort_by_key(|(id, _, _)| *id);
        Ok(rows
            .into_iter()
            .map(|(_, event_id, payload)| ParkedEvent { event_id, payload })
            .collect())
    }

    async fn purge_parked_events(&self, parked_before: OffsetDateTime) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM parked_webhook_events WHERE parked_at < $1 RETURNING event_id",
        )
        .bind(parked_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(event_id,)| event_id).collect())
    }
}
