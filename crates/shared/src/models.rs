//! Persisted records
//!
//! Money is kept in minor currency units (`i64`), seat quantities as `i32` to
//! match the Postgres `INTEGER` columns.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{OrderStatus, PlanTier, SubscriptionStatus, UserRole};

/// Billing cycle used by every plan in the catalog
pub const BILLING_CYCLE_YEARLY: &str = "yearly";

// =============================================================================
// Plan
// =============================================================================

/// A purchasable tier. Price is per seat, per year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: PlanTier,
    pub description: Option<String>,
    pub price: i64,
    pub currency: String,
    pub billing_cycle: String,
    pub min_users: i32,
    pub max_users: i32,
    pub features: Vec<String>,
    pub trial_days: i32,
    pub processor_product_ref: String,
    pub processor_price_ref: String,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Organization
// =============================================================================

/// Postal address printed on invoices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BillingAddress {
    #[sqlx(rename = "address_line1")]
    pub line1: Option<String>,
    #[sqlx(rename = "address_city")]
    pub city: Option<String>,
    #[sqlx(rename = "address_state")]
    pub state: Option<String>,
    #[sqlx(rename = "address_postal_code")]
    pub postal_code: Option<String>,
    #[sqlx(rename = "address_country")]
    pub country: Option<String>,
}

/// A tenant and its billing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub plan_id: Uuid,
    pub customer_ref: String,
    pub subscription_ref: Option<String>,
    /// Only ever changed through the store's conditional seat adjustment.
    pub active_seat_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    pub status: SubscriptionStatus,
    /// Processor timestamp of the last status change applied from an event.
    #[serde(with = "time::serde::rfc3339::option")]
    pub status_changed_at: Option<OffsetDateTime>,
    pub billing_email: String,
    #[sqlx(flatten)]
    pub billing_address: BillingAddress,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Organization {
    pub fn trial_active(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Trialing
            && self.trial_ends_at.is_some_and(|ends| ends > now)
    }
}

// =============================================================================
// User
// =============================================================================

/// A member of exactly one organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: UserRole,
    pub is_active: bool,
    /// Set only on the admin created at registration; that user never holds a seat.
    pub seat_exempt: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub removed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// Whether this user currently counts toward `active_seat_count`.
    pub fn occupies_seat(&self) -> bool {
        self.is_active && !self.seat_exempt && self.removed_at.is_none()
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }
}

// =============================================================================
// Order
// =============================================================================

/// One billing transaction attempt. Plan fields are a snapshot taken at purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub org_id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: PlanTier,
    pub unit_price: i64,
    pub quantity: i32,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub subscription_ref: Option<String>,
    pub payment_intent_ref: Option<String>,
    pub invoice_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub status_changed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
