//! Organization ledger
//!
//! Owns the per-tenant billing record: current plan, processor references, trial
//! window, subscription status and the active seat count.
//!
//! ## Seat accounting
//!
//! `active_seat_count` equals the number of users for which [`User::occupies_seat`]
//! is true. The admin created at registration is marked `seat_exempt`, so a freshly
//! registered organization starts at zero seats; every user added afterwards counts.
//! The count only moves through [`OrganizationLedger::adjust_seat_count`], which is a
//! conditional store update bounded by the plan's `max_users`.
//!
//! ## Status transitions
//!
//! `trialing → active`, `active → canceled`, `active → expired`, `trialing → canceled`,
//! plus same-state no-ops. Leaving `canceled` or `expired` is only possible through
//! [`OrganizationLedger::set_plan`] with a fresh subscription.
//!
//! Subscription fields are written with a compare-and-swap against the state the
//! decision was made on, so the API and the worker cannot overwrite each other's
//! changes even though the per-organization locks are process-local. A same-state
//! change carrying a newer processor timestamp still records that timestamp, which
//! is what makes a renewal visible to a concurrent lapse check.

use std::sync::Arc;

use seatline_shared::{
    BillingAddress, Organization, Plan, PlanTier, SubscriptionStatus, User, UserRole,
};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::processor::PaymentProcessor;
use crate::store::{BillingStore, SeatAdjustment, SubscriptionState};

/// Attempts at a status change before giving up on a contended record
const STATUS_CHANGE_ATTEMPTS: usize = 5;

/// Registration input. The admin's secret arrives already hashed.
#[derive(Debug, Clone)]
pub struct RegisterOrganization {
    pub name: String,
    pub billing_email: String,
    pub billing_address: BillingAddress,
    pub admin: NewMember,
}

/// A user to be created in an organization
#[derive(Debug, Clone)]
pub struct NewMember {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

/// Partial profile update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrganizationPatch {
    pub name: Option<String>,
    pub billing_email: Option<String>,
    pub billing_address: Option<BillingAddress>,
}

/// Outcome of a status change request
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    Applied(Organization),
    /// Same state, or an event older than the last applied change
    Unchanged(Organization),
}

impl StatusChange {
    pub fn organization(&self) -> &Organization {
        match self {
            Self::Applied(org) | Self::Unchanged(org) => org,
        }
    }
}

pub(crate) fn validate_email(email: &str) -> BillingResult<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid {
        return Err(BillingError::Validation(format!(
            "Invalid email address '{}'",
            email
        )));
    }
    Ok(email)
}

pub(crate) fn validate_name(name: &str, what: &str) -> BillingResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BillingError::Validation(format!("{} is required", what)));
    }
    Ok(name.to_string())
}

/// Whether `org` can take `additional` more seats under `plan`
pub fn can_accommodate(org: &Organization, plan: &Plan, additional: i32) -> bool {
    org.active_seat_count
        .checked_add(additional)
        .is_some_and(|total| total <= plan.max_users)
}

#[derive(Clone)]
pub struct OrganizationLedger {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    config: BillingConfig,
}

impl OrganizationLedger {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    /// Create an organization on the Basic plan with a trial and its bootstrap admin.
    ///
    /// The processor customer is created before any local write; if that call
    /// fails nothing is persisted. If the admin cannot be stored the organization
    /// is removed again.
    pub async fn register(
        &self,
        input: RegisterOrganization,
    ) -> BillingResult<(Organization, User)> {
        let name = validate_name(&input.name, "Organization name")?;
        let billing_email = validate_email(&input.billing_email)?;
        let admin_name = validate_name(&input.admin.name, "Admin name")?;
        let admin_email = validate_email(&input.admin.email)?;
        if input.admin.password_hash.is_empty() {
            return Err(BillingError::Validation("Admin credentials are required".into()));
        }
        if self.store.find_user_by_email(&admin_email).await?.is_some() {
            return Err(BillingError::Validation(format!(
                "A user with email {} already exists",
                admin_email
            )));
        }

        let plan = self
            .store
            .find_active_plan(PlanTier::Basic)
            .await?
            .ok_or_else(|| BillingError::NotFound("No active Basic plan configured".into()))?;

        let customer_ref = self
            .processor
            .create_customer(&billing_email, &name)
            .await?;

        let now = OffsetDateTime::now_utc();
        let trial_days = if plan.trial_days > 0 {
            i64::from(plan.trial_days)
        } else {
            self.config.trial_days
        };

        let org = Organization {
            id: Uuid::new_v4(),
            name,
            plan_id: plan.id,
            customer_ref,
            subscription_ref: None,
            active_seat_count: 0,
            trial_ends_at: Some(now + Duration::days(trial_days)),
            status: SubscriptionStatus::Trialing,
            status_changed_at: None,
            billing_email,
            billing_address: input.billing_address,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_organization(&org).await?;

        let admin = User {
            id: Uuid::new_v4(),
            org_id: org.id,
            name: admin_name,
            email: admin_email,
            password_hash: input.admin.password_hash,
            role: UserRole::Admin,
            is_active: true,
            seat_exempt: true,
            removed_at: None,
            created_at: now,
        };
        if let Err(e) = self.store.insert_user(&admin).await {
            tracing::warn!(
                org_id = %org.id,
                customer_ref = %org.customer_ref,
                error = %e,
                "Bootstrap admin could not be stored; removing organization"
            );
            if let Err(cleanup) = self.store.delete_organization(org.id).await {
                tracing::error!(
                    org_id = %org.id,
                    error = %cleanup,
                    "Failed to remove organization without an admin"
                );
            }
            return Err(e);
        }

        tracing::info!(
            org_id = %org.id,
            plan_id = %plan.id,
            customer_ref = %org.customer_ref,
            trial_days,
            "Organization registered"
        );
        Ok((org, admin))
    }

    pub async fn get(&self, org_id: Uuid) -> BillingResult<Organization> {
        self.store
            .get_organization(org_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Organization {} not found", org_id)))
    }

    pub async fn list(&self) -> BillingResult<Vec<Organization>> {
        self.store.list_organizations().await
    }

    /// The organization together with the plan it is currently on
    pub async fn get_with_plan(&self, org_id: Uuid) -> BillingResult<(Organization, Plan)> {
        let org = self.get(org_id).await?;
        let plan = self.store.get_plan(org.plan_id).await?.ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "Organization {} references missing plan {}",
                org.id, org.plan_id
            ))
        })?;
        Ok((org, plan))
    }

    pub async fn can_accommodate(&self, org_id: Uuid, additional: i32) -> BillingResult<bool> {
        let (org, plan) = self.get_with_plan(org_id).await?;
        Ok(can_accommodate(&org, &plan, additional))
    }

    /// Move the seat count by `delta`, returning the new count.
    ///
    /// Increments are bounded by the current plan's `max_users` in the same store
    /// operation that applies them.
    pub async fn adjust_seat_count(&self, org_id: Uuid, delta: i32) -> BillingResult<i32> {
        let (_, plan) = self.get_with_plan(org_id).await?;

        match self
            .store
            .adjust_seat_count(org_id, delta, plan.max_users)
            .await?
        {
            SeatAdjustment::Applied(count) => {
                tracing::debug!(org_id = %org_id, delta, seats = count, "Seat count adjusted");
                Ok(count)
            }
            SeatAdjustment::WouldExceed { current } => {
                tracing::info!(
                    org_id = %org_id,
                    seats = current,
                    max_users = plan.max_users,
                    "Seat limit reached"
                );
                Err(BillingError::SeatLimitExceeded {
                    active: current,
                    max: plan.max_users,
                })
            }
            SeatAdjustment::WouldGoNegative { current } => {
                tracing::error!(org_id = %org_id, delta, seats = current, "Seat count would go negative");
                Err(BillingError::InvariantViolation(format!(
                    "Seat count for organization {} would go negative ({} {:+})",
                    org_id, current, delta
                )))
            }
        }
    }

    /// Attach a new subscription: plan, reference and status change together.
    ///
    /// `observed` is the record the caller decided on; if it changed since, nothing
    /// is written and [`BillingError::ConcurrentUpdate`] is returned.
    pub async fn set_plan(
        &self,
        observed: &Organization,
        plan: &Plan,
        subscription_ref: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<Organization> {
        let next = SubscriptionState {
            plan_id: plan.id,
            subscription_ref: Some(subscription_ref.to_string()),
            status,
            // New subscription, new event history
            status_changed_at: None,
        };
        let org = self
            .store
            .swap_subscription_state(observed.id, &SubscriptionState::from(observed), &next)
            .await?
            .ok_or_else(|| {
                tracing::warn!(
                    org_id = %observed.id,
                    subscription_ref = %subscription_ref,
                    "Organization changed while attaching subscription"
                );
                BillingError::ConcurrentUpdate(format!(
                    "Organization {} changed while attaching a subscription",
                    observed.id
                ))
            })?;

        tracing::info!(
            org_id = %org.id,
            plan_id = %plan.id,
            subscription_ref = %subscription_ref,
            from = %observed.status,
            to = %status,
            "Organization plan set"
        );
        Ok(org)
    }

    /// Apply a status change.
    ///
    /// `at` is the processor timestamp of the event causing the change, when there
    /// is one; changes older than the last applied one are ignored.
    pub async fn set_status(
        &self,
        org_id: Uuid,
        status: SubscriptionStatus,
        at: Option<OffsetDateTime>,
    ) -> BillingResult<StatusChange> {
        for _ in 0..STATUS_CHANGE_ATTEMPTS {
            let org = self.get(org_id).await?;
            if let Some(change) = self.transition_from(&org, status, at).await? {
                return Ok(change);
            }
            tracing::debug!(org_id = %org_id, requested = %status, "Status write lost a race; re-reading");
        }
        Err(BillingError::ConcurrentUpdate(format!(
            "Organization {} kept changing while setting status {}",
            org_id, status
        )))
    }

    /// One attempt at a status change, decided on `observed`.
    ///
    /// Returns `None` without writing when the stored record no longer matches
    /// `observed`.
    pub async fn transition_from(
        &self,
        observed: &Organization,
        status: SubscriptionStatus,
        at: Option<OffsetDateTime>,
    ) -> BillingResult<Option<StatusChange>> {
        if let (Some(at), Some(last)) = (at, observed.status_changed_at) {
            if at < last {
                tracing::info!(
                    org_id = %observed.id,
                    requested = %status,
                    current = %observed.status,
                    "Ignoring status change older than the last applied one"
                );
                return Ok(Some(StatusChange::Unchanged(observed.clone())));
            }
        }

        let expected = SubscriptionState::from(observed);
        let mut next = expected.clone();
        if at.is_some() {
            next.status_changed_at = at;
        }

        if observed.status == status {
            if next == expected {
                return Ok(Some(StatusChange::Unchanged(observed.clone())));
            }
            return Ok(self
                .store
                .swap_subscription_state(observed.id, &expected, &next)
                .await?
                .map(StatusChange::Unchanged));
        }

        if !observed.status.can_transition_to(status) {
            tracing::warn!(
                org_id = %observed.id,
                from = %observed.status,
                to = %status,
                "Rejected subscription status transition"
            );
            return Err(BillingError::InvariantViolation(format!(
                "Illegal status transition {} -> {} for organization {}",
                observed.status, status, observed.id
            )));
        }

        next.status = status;
        let Some(org) = self
            .store
            .swap_subscription_state(observed.id, &expected, &next)
            .await?
        else {
            return Ok(None);
        };

        tracing::info!(org_id = %org.id, from = %observed.status, to = %status, "Subscription status changed");
        Ok(Some(StatusChange::Applied(org)))
    }

    /// Update name, billing email or address. Subscription fields and the seat
    /// count are never part of this write.
    pub async fn update_profile(
        &self,
        org_id: Uuid,
        patch: OrganizationPatch,
    ) -> BillingResult<Organization> {
        let patch = OrganizationPatch {
            name: patch
                .name
                .as_deref()
                .map(|name| validate_name(name, "Organization name"))
                .transpose()?,
            billing_email: patch
                .billing_email
                .as_deref()
                .map(validate_email)
                .transpose()?,
            billing_address: patch.billing_address,
        };
        let org = self.store.update_organization_profile(org_id, &patch).await?;

        tracing::info!(org_id = %org.id, "Organization profile updated");
        Ok(org)
    }
}
