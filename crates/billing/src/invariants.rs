//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing store. They can be run after a
//! batch of mutations or a webhook replay to confirm the ledgers still agree.
//!
//! Checks only read, never write. Violations carry enough context to debug.

use std::sync::Arc;

use seatline_shared::{Organization, SubscriptionStatus, UserRole};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - more seats in use than the plan allows
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

const CHECKS: [&str; 4] = [
    "seat_count_within_plan",
    "seat_count_matches_members",
    "active_org_has_subscription",
    "single_bootstrap_admin",
];

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for check in CHECKS {
            violations.extend(self.run_check(check).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        for violation in &violations {
            tracing::warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                org_ids = ?violation.org_ids,
                "{}",
                violation.description
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Seat count between zero and the current plan's `max_users`
    async fn check_seat_count_within_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for org in self.store.list_organizations().await? {
            let max_users = self
                .store
                .get_plan(org.plan_id)
                .await?
                .map(|plan| plan.max_users);

            let within = match max_users {
                Some(max) => (0..=max).contains(&org.active_seat_count),
                None => false,
            };
            if within {
                continue;
            }
            violations.push(InvariantViolation {
                invariant: "seat_count_within_plan".to_string(),
                org_ids: vec![org.id],
                description: match max_users {
                    Some(max) => format!(
                        "Organization '{}' has {} seats in use but its plan allows {}",
                        org.name, org.active_seat_count, max
                    ),
                    None => format!("Organization '{}' references a missing plan", org.name),
                },
                context: serde_json::json!({
                    "active_seat_count": org.active_seat_count,
                    "plan_id": org.plan_id,
                    "max_users": max_users,
                }),
                severity: ViolationSeverity::Critical,
            });
        }
        Ok(violations)
    }

    /// Stored seat count equals the number of members occupying a seat
    async fn check_seat_count_matches_members(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for org in self.store.list_organizations().await? {
            let occupied = self
                .store
                .list_users(org.id)
                .await?
                .iter()
                .filter(|u| u.occupies_seat())
                .count();
            let occupied = i32::try_from(occupied).unwrap_or(i32::MAX);
            if occupied == org.active_seat_count {
                continue;
            }
            violations.push(InvariantViolation {
                invariant: "seat_count_matches_members".to_string(),
                org_ids: vec![org.id],
                description: format!(
                    "Organization '{}' records {} seats but {} members occupy one",
                    org.name, org.active_seat_count, occupied
                ),
                context: serde_json::json!({
                    "active_seat_count": org.active_seat_count,
                    "occupied": occupied,
                }),
                severity: ViolationSeverity::High,
            });
        }
        Ok(violations)
    }

    async fn check_active_org_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .list_organizations()
            .await?
            .into_iter()
            .filter(|o| o.status == SubscriptionStatus::Active && o.subscription_ref.is_none())
            .map(|org: Organization| InvariantViolation {
                invariant: "active_org_has_subscription".to_string(),
                org_ids: vec![org.id],
                description: format!(
                    "Organization '{}' is active without a processor subscription",
                    org.name
                ),
                context: serde_json::json!({
                    "customer_ref": org.customer_ref,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Exactly one seat-exempt admin per organization
    async fn check_single_bootstrap_admin(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for org in self.store.list_organizations().await? {
            let admins = self
                .store
                .list_users(org.id)
                .await?
                .iter()
                .filter(|u| u.role == UserRole::Admin && u.seat_exempt && !u.is_removed())
                .count();
            if admins == 1 {
                continue;
            }
            violations.push(InvariantViolation {
                invariant: "single_bootstrap_admin".to_string(),
                org_ids: vec![org.id],
                description: format!(
                    "Organization '{}' has {} bootstrap admins (expected 1)",
                    org.name, admins
                ),
                context: serde_json::json!({ "admin_count": admins }),
                severity: ViolationSeverity::Medium,
            });
        }
        Ok(violations)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "seat_count_within_plan" => self.check_seat_count_within_plan().await,
            "seat_count_matches_members" => self.check_seat_count_matches_members().await,
            "active_org_has_subscription" => self.check_active_org_has_subscription().await,
            "single_bootstrap_admin" => self.check_single_bootstrap_admin().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
