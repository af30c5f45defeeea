//! Seat manager
//!
//! Adds, deactivates and removes organization members against the plan's seat
//! budget. Every operation holds the organization's lock for its whole
//! check-then-act sequence, and the seat count itself only moves through the
//! ledger's bounded adjustment.

use std::sync::Arc;

use seatline_shared::{User, UserRole};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::locks::OrgLocks;
use crate::organizations::{validate_email, validate_name, NewMember, OrganizationLedger};
use crate::store::BillingStore;

#[derive(Clone)]
pub struct SeatManager {
    store: Arc<dyn BillingStore>,
    ledger: OrganizationLedger,
    locks: Arc<OrgLocks>,
}

impl SeatManager {
    pub fn new(
        store: Arc<dyn BillingStore>,
        ledger: OrganizationLedger,
        locks: Arc<OrgLocks>,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
        }
    }

    pub async fn list_users(&self, org_id: Uuid) -> BillingResult<Vec<User>> {
        self.ledger.get(org_id).await?;
        self.store.list_users(org_id).await
    }

    pub async fn get_user(&self, user_id: Uuid) -> BillingResult<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
    }

    /// Lookup for sign-in; emails are stored lowercased
    pub async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        self.store
            .find_user_by_email(&email.trim().to_lowercase())
            .await
    }

    /// Add an active `user` member, taking one seat
    pub async fn add_user(&self, org_id: Uuid, member: NewMember) -> BillingResult<User> {
        let name = validate_name(&member.name, "Name")?;
        let email = validate_email(&member.email)?;
        if member.password_hash.is_empty() {
            return Err(BillingError::Validation("Credentials are required".into()));
        }

        let _guard = self.locks.acquire(org_id).await;

        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(BillingError::Validation(format!(
                "A user with email {} already exists",
                email
            )));
        }

        let (org, plan) = self.ledger.get_with_plan(org_id).await?;
        if !crate::organizations::can_accommodate(&org, &plan, 1) {
            tracing::info!(
                org_id = %org_id,
                seats = org.active_seat_count,
                max_users = plan.max_users,
                "Rejected member: seat limit reached"
            );
            return Err(BillingError::SeatLimitExceeded {
                active: org.active_seat_count,
                max: plan.max_users,
            });
        }

        let seats = self.ledger.adjust_seat_count(org_id, 1).await?;

        let user = User {
            id: Uuid::new_v4(),
            org_id,
            name,
            email,
            password_hash: member.password_hash,
            role: UserRole::User,
            is_active: true,
            seat_exempt: false,
            removed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.store.insert_user(&user).await {
            self.release_seat(org_id, 1).await;
            return Err(e);
        }

        tracing::info!(org_id = %org_id, user_id = %user.id, seats, "Member added");
        Ok(user)
    }

    /// Activate or deactivate a member. Admins are left untouched; repeating the
    /// current state changes nothing.
    pub async fn set_user_active(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        active: bool,
    ) -> BillingResult<User> {
        let _guard = self.locks.acquire(org_id).await;

        let mut user = self.member(org_id, user_id).await?;
        if user.is_removed() {
            return Err(BillingError::NotFound(format!("User {} not found", user_id)));
        }
        if user.role.is_admin() {
            tracing::debug!(org_id = %org_id, user_id = %user_id, "Admin activity is not changeable");
            return Ok(user);
        }
        if user.is_active == active {
            return Ok(user);
        }

        let before = user.occupies_seat();
        user.is_active = active;
        let delta = seat_delta(before, user.occupies_seat());

        if delta != 0 {
            self.ledger.adjust_seat_count(org_id, delta).await?;
        }
        if let Err(e) = self.store.update_user(&user).await {
            self.release_seat(org_id, delta).await;
            return Err(e);
        }

        tracing::info!(org_id = %org_id, user_id = %user_id, active, "Member activity changed");
        Ok(user)
    }

    /// Soft-delete a member, freeing their seat if they held one.
    pub async fn remove_user(&self, org_id: Uuid, user_id: Uuid) -> BillingResult<User> {
        let _guard = self.locks.acquire(org_id).await;

        let mut user = self.member(org_id, user_id).await?;
        if user.role.is_admin() {
            tracing::debug!(org_id = %org_id, user_id = %user_id, "Admins cannot be removed");
            return Ok(user);
        }
        if user.is_removed() {
            return Ok(user);
        }

        let before = user.occupies_seat();
        user.is_active = false;
        user.removed_at = Some(OffsetDateTime::now_utc());
        let delta = seat_delta(before, user.occupies_seat());

        if delta != 0 {
            self.ledger.adjust_seat_count(org_id, delta).await?;
        }
        if let Err(e) = self.store.update_user(&user).await {
            self.release_seat(org_id, delta).await;
            return Err(e);
        }

        tracing::info!(org_id = %org_id, user_id = %user_id, "Member removed");
        Ok(user)
    }

    /// A user that belongs to `org_id`; users of other organizations are invisible.
    async fn member(&self, org_id: Uuid, user_id: Uuid) -> BillingResult<User> {
        match self.store.get_user(user_id).await? {
            Some(user) if user.org_id == org_id => Ok(user),
            _ => Err(BillingError::NotFound(format!("User {} not found", user_id))),
        }
    }

    /// Undo a seat adjustment after the user write failed
    async fn release_seat(&self, org_id: Uuid, applied: i32) {
        if applied == 0 {
            return;
        }
        if let Err(e) = self.ledger.adjust_seat_count(org_id, -applied).await {
            tracing::error!(
                org_id = %org_id,
                delta = -applied,
                error = %e,
                "Failed to roll back seat adjustment"
            );
        }
    }
}

fn seat_delta(before: bool, after: bool) -> i32 {
    i32::from(after) - i32::from(before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BillingConfig;
    use crate::organizations::RegisterOrganization;
    use crate::store::InMemoryStore;
    use crate::testing::{seed_plan, FakeProcessor};
    use seatline_shared::{BillingAddress, Organization, PlanTier};

    fn member(email: &str) -> NewMember {
        NewMember {
            name: "Meera".into(),
            email: email.into(),
            password_hash: "$argon2id$hash".into(),
        }
    }

    async fn setup(max_users: i32) -> (SeatManager, OrganizationLedger, Organization, User) {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        seed_plan(store.as_ref(), PlanTier::Basic, 999, 1, max_users).await;
        let ledger = OrganizationLedger::new(
            store.clone(),
            Arc::new(FakeProcessor::new()),
            BillingConfig::default(),
        );
        let (org, admin) = ledger
            .register(RegisterOrganization {
                name: "Acme".into(),
                billing_email: "billing@acme.test".into(),
                billing_address: BillingAddress::default(),
                admin: member("admin@acme.test"),
            })
            .await
            .unwrap();
        let seats = SeatManager::new(store, ledger.clone(), Arc::new(OrgLocks::new()));
        (seats, ledger, org, admin)
    }

    async fn seat_count(ledger: &OrganizationLedger, org_id: Uuid) -> i32 {
        ledger.get(org_id).await.unwrap().active_seat_count
    }

    #[tokio::test]
    async fn test_add_user_counts_seat_but_admin_does_not() {
        let (seats, ledger, org, _) = setup(5).await;
        assert_eq!(seat_count(&ledger, org.id).await, 0);

        let user = seats.add_user(org.id, member("a@acme.test")).await.unwrap();
        assert_eq!(user.role, UserRole::User);
        assert!(user.is_active);
        assert_eq!(seat_count(&ledger, org.id).await, 1);
        assert_eq!(seats.list_users(org.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_user_at_limit_fails() {
        let (seats, ledger, org, _) = setup(2).await;
        seats.add_user(org.id, member("a@acme.test")).await.unwrap();
        seats.add_user(org.id, member("b@acme.test")).await.unwrap();

        let err = seats
            .add_user(org.id, member("c@acme.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SeatLimitExceeded { active: 2, max: 2 }));
        assert_eq!(seat_count(&ledger, org.id).await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_email_takes_no_seat() {
        let (seats, ledger, org, _) = setup(5).await;
        seats.add_user(org.id, member("a@acme.test")).await.unwrap();
        let err = seats
            .add_user(org.id, member("A@acme.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(seat_count(&ledger, org.id).await, 1);
    }

    #[tokio::test]
    async fn test_set_user_active_is_idempotent() {
        let (seats, ledger, org, _) = setup(5).await;
        let user = seats.add_user(org.id, member("a@acme.test")).await.unwrap();

        seats.set_user_active(org.id, user.id, false).await.unwrap();
        seats.set_user_active(org.id, user.id, false).await.unwrap();
        assert_eq!(seat_count(&ledger, org.id).await, 0);

        seats.set_user_active(org.id, user.id, true).await.unwrap();
        seats.set_user_active(org.id, user.id, true).await.unwrap();
        assert_eq!(seat_count(&ledger, org.id).await, 1);
    }

    #[tokio::test]
    async fn test_reactivation_rechecks_capacity() {
        let (seats, ledger, org, _) = setup(1).await;
        let a = seats.add_user(org.id, member("a@acme.test")).await.unwrap();
        seats.set_user_active(org.id, a.id, false).await.unwrap();
        seats.add_user(org.id, member("b@acme.test")).await.unwrap();

        let err = seats
            .set_user_active(org.id, a.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SeatLimitExceeded { .. }));
        assert_eq!(seat_count(&ledger, org.id).await, 1);
    }

    #[tokio::test]
    async fn test_admin_is_immune() {
        let (seats, ledger, org, admin) = setup(5).await;

        let unchanged = seats.set_user_active(org.id, admin.id, false).await.unwrap();
        assert!(unchanged.is_active);

        let kept = seats.remove_user(org.id, admin.id).await.unwrap();
        assert!(kept.removed_at.is_none());
        assert_eq!(seat_count(&ledger, org.id).await, 0);
    }

    #[tokio::test]
    async fn test_remove_user_decrements_once() {
        let (seats, ledger, org, _) = setup(5).await;
        let a = seats.add_user(org.id, member("a@acme.test")).await.unwrap();
        seats.add_user(org.id, member("b@acme.test")).await.unwrap();

        let removed = seats.remove_user(org.id, a.id).await.unwrap();
        assert!(!removed.is_active);
        assert!(removed.removed_at.is_some());
        seats.remove_user(org.id, a.id).await.unwrap();
        assert_eq!(seat_count(&ledger, org.id).await, 1);

        // Removed members cannot come back
        let err = seats.set_user_active(org.id, a.id, true).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_inactive_user_frees_nothing() {
        let (seats, ledger, org, _) = setup(5).await;
        let a = seats.add_user(org.id, member("a@acme.test")).await.unwrap();
        seats.set_user_active(org.id, a.id, false).await.unwrap();
        assert_eq!(seat_count(&ledger, org.id).await, 0);

        seats.remove_user(org.id, a.id).await.unwrap();
        assert_eq!(seat_count(&ledger, org.id).await, 0);
    }

    #[tokio::test]
    async fn test_other_org_user_is_not_found() {
        let (seats, _, org, _) = setup(5).await;
        let user = seats.add_user(org.id, member("a@acme.test")).await.unwrap();

        let err = seats
            .remove_user(Uuid::new_v4(), user.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
