//! Plan catalog
//!
//! Plans are never hard-deleted. Once a live subscription references a plan, its
//! commercial terms (tier, price, seat bounds, processor references) are frozen;
//! only descriptive fields may change and the plan may be deactivated.

use std::sync::Arc;

use seatline_shared::{Plan, PlanTier, BILLING_CYCLE_YEARLY};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// Input for a new catalog entry
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub min_users: i32,
    pub max_users: i32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub trial_days: i32,
    pub processor_product_ref: String,
    pub processor_price_ref: String,
}

/// Partial update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub currency: Option<String>,
    pub min_users: Option<i32>,
    pub max_users: Option<i32>,
    pub features: Option<Vec<String>>,
    pub trial_days: Option<i32>,
    pub processor_product_ref: Option<String>,
    pub processor_price_ref: Option<String>,
}

impl PlanPatch {
    fn touches_terms(&self) -> bool {
        self.name.is_some()
            || self.price.is_some()
            || self.currency.is_some()
            || self.min_users.is_some()
            || self.max_users.is_some()
            || self.processor_product_ref.is_some()
            || self.processor_price_ref.is_some()
    }
}

fn parse_tier(name: &str) -> BillingResult<PlanTier> {
    name.trim().parse::<PlanTier>().map_err(|_| {
        BillingError::Validation(format!(
            "Plan name must be one of Basic, Standard, Plus (got '{}')",
            name
        ))
    })
}

fn normalize_currency(currency: &str) -> BillingResult<String> {
    let currency = currency.trim().to_lowercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(BillingError::Validation(format!(
            "Currency must be a 3-letter code (got '{}')",
            currency
        )));
    }
    Ok(currency)
}

/// Field-level checks shared by create and update
fn validate(plan: &Plan) -> BillingResult<()> {
    if plan.price < 0 {
        return Err(BillingError::Validation("Price cannot be negative".into()));
    }
    if plan.min_users < 1 {
        return Err(BillingError::Validation(
            "Minimum users must be at least 1".into(),
        ));
    }
    if plan.max_users < plan.min_users {
        return Err(BillingError::Validation(
            "Maximum users cannot be less than minimum users".into(),
        ));
    }
    if plan.trial_days < 0 {
        return Err(BillingError::Validation(
            "Trial days cannot be negative".into(),
        ));
    }
    if plan.processor_product_ref.trim().is_empty() || plan.processor_price_ref.trim().is_empty()
    {
        return Err(BillingError::Validation(
            "Processor product and price references are required".into(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
    default_currency: String,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn BillingStore>, default_currency: impl Into<String>) -> Self {
        Self {
            store,
            default_currency: default_currency.into(),
        }
    }

    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans(true).await
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", id)))
    }

    pub async fn create(&self, new_plan: NewPlan) -> BillingResult<Plan> {
        let now = OffsetDateTime::now_utc();
        let currency = match new_plan.currency.as_deref() {
            Some(c) => normalize_currency(c)?,
            None => self.default_currency.clone(),
        };

        let plan = Plan {
            id: Uuid::new_v4(),
            name: parse_tier(&new_plan.name)?,
            description: new_plan.description,
            price: new_plan.price,
            currency,
            billing_cycle: BILLING_CYCLE_YEARLY.to_string(),
            min_users: new_plan.min_users,
            max_users: new_plan.max_users,
            features: new_plan.features,
            trial_days: new_plan.trial_days,
            processor_product_ref: new_plan.processor_product_ref.trim().to_string(),
            processor_price_ref: new_plan.processor_price_ref.trim().to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        validate(&plan)?;

        self.store.insert_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, tier = %plan.name, price = plan.price, "Plan created");
        Ok(plan)
    }

    pub async fn update(&self, id: Uuid, patch: PlanPatch) -> BillingResult<Plan> {
        let mut plan = self.get(id).await?;

        if patch.touches_terms() && self.has_live_subscription(id).await? {
            return Err(BillingError::Validation(
                "Plan is referenced by a live subscription; only description, features and trial days can change"
                    .into(),
            ));
        }

        if let Some(name) = patch.name.as_deref() {
            plan.name = parse_tier(name)?;
        }
        if let Some(currency) = patch.currency.as_deref() {
            plan.currency = normalize_currency(currency)?;
        }
        if let Some(description) = patch.description {
            plan.description = Some(description);
        }
        if let Some(price) = patch.price {
            plan.price = price;
        }
        if let Some(min_users) = patch.min_users {
            plan.min_users = min_users;
        }
        if let Some(max_users) = patch.max_users {
            plan.max_users = max_users;
        }
        if let Some(features) = patch.features {
            plan.features = features;
        }
        if let Some(trial_days) = patch.trial_days {
            plan.trial_days = trial_days;
        }
        if let Some(product) = patch.processor_product_ref {
            plan.processor_product_ref = product.trim().to_string();
        }
        if let Some(price_ref) = patch.processor_price_ref {
            plan.processor_price_ref = price_ref.trim().to_string();
        }
        validate(&plan)?;

        plan.updated_at = OffsetDateTime::now_utc();
        self.store.update_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, "Plan updated");
        Ok(plan)
    }

    /// Soft delete. Organizations and orders that reference the plan keep doing so.
    pub async fn deactivate(&self, id: Uuid) -> BillingResult<Plan> {
        let mut plan = self.get(id).await?;
        if !plan.is_active {
            return Ok(plan);
        }
        plan.is_active = false;
        plan.updated_at = OffsetDateTime::now_utc();
        self.store.update_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, tier = %plan.name, "Plan deactivated");
        Ok(plan)
    }

    async fn has_live_subscription(&self, plan_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .store
            .list_organizations()
            .await?
            .iter()
            .any(|o| {
                o.plan_id == plan_id && o.subscription_ref.is_some() && !o.status.is_terminal()
            }))
    }
}
