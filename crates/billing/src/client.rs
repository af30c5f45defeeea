//! Stripe client and billing configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Read an optional numeric environment variable, falling back to `default` when unset.
fn env_number<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| {
            BillingError::Config(format!("Invalid {} value '{}': expected a number", key, v))
        }),
        Err(_) => Ok(default),
    }
}

fn env_required(key: &str) -> BillingResult<String> {
    std::env::var(key).map_err(|_| BillingError::Config(format!("{} not set", key)))
}

/// Stripe credentials and call limits
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Upper bound on any single processor call
    pub timeout: Duration,
    /// Retries for idempotent calls on transient failure
    pub max_retries: usize,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: env_required("STRIPE_SECRET_KEY")?,
            webhook_secret: env_required("STRIPE_WEBHOOK_SECRET")?,
            timeout: Duration::from_secs(env_number("STRIPE_TIMEOUT_SECS", 10u64)?),
            max_retries: env_number("STRIPE_MAX_RETRIES", 2usize)?,
        })
    }

    pub fn test() -> Self {
        Self {
            secret_key: "sk_test_seatline".into(),
            webhook_secret: "whsec_test_seatline".into(),
            timeout: Duration::from_secs(10),
            max_retries: 2,
        }
    }
}

/// Thin wrapper around the async-stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Core billing policy knobs
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Trial length used when the plan itself does not define one
    pub trial_days: i64,
    /// How long after a paid period ends an active organization is kept before expiring
    pub renewal_grace_days: i64,
    /// Maximum accepted age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
    /// How long an event waits for the record it refers to before it is dropped
    pub parked_event_ttl_days: i64,
    /// ISO currency code, lower case
    pub currency: String,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let currency = std::env::var("BILLING_CURRENCY")
            .unwrap_or_else(|_| "inr".to_string())
            .to_lowercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::Config(format!(
                "Invalid BILLING_CURRENCY value '{}': expected a 3-letter code",
                currency
            )));
        }

        Ok(Self {
            trial_days: env_number("BILLING_TRIAL_DAYS", 14i64)?,
            renewal_grace_days: env_number("BILLING_RENEWAL_GRACE_DAYS", 3i64)?,
            webhook_tolerance_secs: env_number("WEBHOOK_TOLERANCE_SECS", 300i64)?,
            parked_event_ttl_days: env_number("WEBHOOK_PARKED_TTL_DAYS", 7i64)?,
            currency,
        })
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            trial_days: 14,
            renewal_grace_days: 3,
            webhook_tolerance_secs: 300,
            parked_event_ttl_days: 7,
            currency: "inr".to_string(),
        }
    }
}
