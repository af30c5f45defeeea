//! Scheduled job bodies

use seatline_billing::{BillingService, InvariantCheckSummary};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Move active organizations whose paid period lapsed past the grace window to
/// expired. Returns how many were expired.
pub async fn expire_lapsed_subscriptions(billing: &BillingService, now: OffsetDateTime) -> usize {
    match billing.subscriptions.expire_lapsed(now).await {
        Ok(expired) => {
            info!(expired = expired.len(), "Lapsed subscription sweep complete");
            expired.len()
        }
        Err(e) => {
            error!(error = %e, "Lapsed subscription sweep failed");
            0
        }
    }
}

/// Drop webhook events parked past their TTL. Returns how many were dropped.
pub async fn expire_parked_events(billing: &BillingService, now: OffsetDateTime) -> usize {
    match billing.webhooks.expire_parked(now).await {
        Ok(dropped) => {
            if dropped.is_empty() {
                info!("No parked webhook events past their TTL");
            } else {
                warn!(dropped = dropped.len(), "Dropped parked webhook events past their TTL");
            }
            dropped.len()
        }
        Err(e) => {
            error!(error = %e, "Parked webhook event sweep failed");
            0
        }
    }
}

/// Run every invariant check, logging the outcome
pub async fn check_invariants(billing: &BillingService) -> Option<InvariantCheckSummary> {
    match billing.invariants.run_all_checks().await {
        Ok(summary) => {
            if summary.healthy {
                info!(checks_run = summary.checks_run, "Billing invariants hold");
            } else {
                warn!(
                    checks_failed = summary.checks_failed,
                    violations = summary.violations.len(),
                    "Billing invariant violations found"
                );
            }
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant check run failed");
            None
        }
    }
}
