// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors take every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Seatline Billing Core
//!
//! Subscription lifecycle and seat accounting for multi-tenant organizations,
//! kept consistent with the payment processor's asynchronous events.
//!
//! ## Features
//!
//! - **Plan Catalog**: Purchasable tiers with seat bounds and pricing
//! - **Organization Ledger**: Plan, trial window, subscription status and seat count per tenant
//! - **Seat Manager**: Add, deactivate and remove members against the seat budget
//! - **Subscriptions**: Subscribe, change seat quantity, cancel, expire lapsed subscriptions
//! - **Order Ledger**: Append-only record of billing attempts
//! - **Webhooks**: Verified, idempotent reconciliation of processor events
//! - **Invariants**: Read-only consistency checks

pub mod catalog;
pub mod client;
pub mod error;
pub mod invariants;
pub mod locks;
pub mod orders;
pub mod organizations;
pub mod processor;
pub mod seats;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


// Catalog
pub use catalog::{NewPlan, PlanCatalog, PlanPatch};

// Client
pub use client::{BillingConfig, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult, ProcessorError};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Locks
pub use locks::{OrgGuard, OrgLocks};

// Orders
pub use orders::{OrderLedger, OrderStatusChange, RenewalInvoice};

// Organizations
pub use organizations::{
    NewMember, OrganizationLedger, OrganizationPatch, RegisterOrganization, StatusChange,
};

// Processor
pub use processor::{PaymentProcessor, ProcessorSubscription, StripeProcessor};

// Seats
pub use seats::SeatManager;

// Store
pub use store::{BillingStore, InMemoryStore, PgStore};

// Subscriptions
pub use subscriptions::{SubscribeResult, SubscriptionService};

// Webhooks
pub use webhooks::{
    ReconcileOutcome, Reconciler, WebhookEvent, WebhookEventKind, WebhookHandler,
};

use std::sync::Arc;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub organizations: OrganizationLedger,
    pub seats: SeatManager,
    pub orders: OrderLedger,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service backed by Stripe, configured from environment variables
    pub fn from_env(store: Arc<dyn BillingStore>) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let config = BillingConfig::from_env()?;

        Ok(Self::new(
            store,
            Arc::new(StripeProcessor::new(stripe)),
            config,
            webhook_secret,
        ))
    }

    /// Create a billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: BillingConfig,
        webhook_secret: impl Into<String>,
    ) -> Self {
        // One lock table for every path that mutates an organization
        let locks = Arc::new(OrgLocks::new());

        let catalog = PlanCatalog::new(store.clone(), config.currency.clone());
        let organizations =
            OrganizationLedger::new(store.clone(), processor.clone(), config.clone());
        let orders = OrderLedger::new(store.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            organizations.clone(),
            orders.clone(),
            locks.clone(),
        );

        Self {
            seats: SeatManager::new(store.clone(), organizations.clone(), locks.clone()),
            subscriptions: SubscriptionService::new(
                processor,
                catalog.clone(),
                organizations.clone(),
                orders.clone(),
                reconciler.clone(),
                locks,
                config.clone(),
            ),
            webhooks: WebhookHandler::new(
                store.clone(),
                reconciler,
                webhook_secret,
                config.webhook_tolerance_secs,
            )
            .with_parked_ttl_days(config.parked_event_ttl_days),
            invariants: InvariantChecker::new(store),
            catalog,
            organizations,
            orders,
        }
    }
}
