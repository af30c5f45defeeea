#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Seatline shared types
//!
//! Closed enumerations, persisted records and database helpers used by the
//! billing core, the API and the worker.

pub mod db;
pub mod models;
pub mod types;

// Database
pub use db::{create_pool, run_migrations};

// Records
pub use models::{BillingAddress, Order, Organization, Plan, User, BILLING_CYCLE_YEARLY};

// Enumerations
pub use types::{Capability, OrderStatus, PlanTier, SubscriptionStatus, UserRole};
