//! Payment processor contract and its Stripe implementation
//!
//! The orchestrator only talks to the processor through [`PaymentProcessor`], which is
//! constructed once at startup and injected. [`StripeProcessor`] bounds every call with
//! a timeout and retries the idempotent ones on transient failure.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use seatline_shared::SubscriptionStatus;
use serde::Serialize;
use stripe::Expandable;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::client::StripeClient;
use crate::error::ProcessorError;

/// Subscription state as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorSubscription {
    pub subscription_ref: String,
    /// Raw processor status (`active`, `incomplete`, `trialing`, ...)
    pub status: String,
    pub quantity: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub invoice_ref: Option<String>,
    pub payment_intent_ref: Option<String>,
    /// Client secret the caller uses to confirm the first payment
    pub confirmation_handle: Option<String>,
}

impl ProcessorSubscription {
    /// Local status to record when this subscription is first attached to an organization.
    ///
    /// Anything short of a settled payment is recorded as `trialing` until the
    /// "payment succeeded" event arrives.
    pub fn initial_local_status(&self) -> SubscriptionStatus {
        match self.status.as_str() {
            "active" => SubscriptionStatus::Active,
            _ => SubscriptionStatus::Trialing,
        }
    }
}

/// Operations the billing core requires from the payment processor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a customer record, returning its reference
    async fn create_customer(&self, email: &str, name: &str) -> Result<String, ProcessorError>;

    /// Start a per-seat subscription for `customer_ref` on `price_ref`
    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        quantity: i32,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    async fn cancel_subscription(&self, subscription_ref: &str) -> Result<(), ProcessorError>;

    async fn update_subscription_quantity(
        &self,
        subscription_ref: &str,
        quantity: i32,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    /// Start a save-card flow, returning the client handle
    async fn create_setup_intent(&self, customer_ref: &str) -> Result<String, ProcessorError>;
}

// =============================================================================
// Stripe
// =============================================================================

/// [`PaymentProcessor`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeProcessor {
    client: StripeClient,
}

impl StripeProcessor {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }

    /// Run one processor call under the configured timeout, retrying transient
    /// failures with exponential backoff when the call is safe to repeat.
    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        retryable: bool,
        mut f: F,
    ) -> Result<T, ProcessorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        let timeout = self.client.config().timeout;
        let attempt = move || {
            let fut = f();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(map_stripe_error(e)),
                    Err(_) => Err(ProcessorError::Transient(format!(
                        "{} timed out after {}s",
                        operation,
                        timeout.as_secs()
                    ))),
                }
            }
        };

        let max_retries = if retryable {
            self.client.config().max_retries
        } else {
            0
        };
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(max_retries);

        let result = RetryIf::spawn(strategy, attempt, |e: &ProcessorError| {
            if e.is_transient() {
                tracing::warn!(operation, error = %e, "Retrying Stripe call after transient error");
                true
            } else {
                false
            }
        })
        .await;

        if let Err(ref e) = result {
            tracing::error!(operation, error = %e, "Stripe call failed");
        }
        result
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn create_customer(&self, email: &str, name: &str) -> Result<String, ProcessorError> {
        let client = self.client.inner().clone();
        let email = email.to_string();
        let name = name.to_string();

        let customer = self
            .call("create_customer", false, || {
                let client = client.clone();
                let email = email.clone();
                let name = name.clone();
                async move {
                    let mut params = stripe::CreateCustomer::new();
                    params.email = Some(&email);
                    params.name = Some(&name);
                    stripe::Customer::create(&client, params).await
                }
            })
            .await?;

        tracing::info!(customer_ref = %customer.id, "Created Stripe customer");
        Ok(customer.id.to_string())
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        quantity: i32,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let client = self.client.inner().clone();
        let customer_id = parse_id::<stripe::CustomerId>(customer_ref, "customer")?;
        let price = price_ref.to_string();
        let quantity = positive_quantity(quantity)?;

        let subscription = self
            .call("create_subscription", false, || {
                let client = client.clone();
                let customer_id = customer_id.clone();
                let price = price.clone();
                async move {
                    let params = subscription_params(customer_id, price, quantity);
                    stripe::Subscription::create(&client, params).await
                }
            })
            .await?;

        tracing::info!(
            customer_ref = %customer_ref,
            subscription_ref = %subscription.id,
            quantity,
            "Created Stripe subscription"
        );
        to_processor_subscription(&subscription)
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> Result<(), ProcessorError> {
        let client = self.client.inner().clone();
        let sub_id = parse_id::<stripe::SubscriptionId>(subscription_ref, "subscription")?;

        self.call("cancel_subscription", true, || {
            let client = client.clone();
            let sub_id = sub_id.clone();
            async move {
                stripe::Subscription::cancel(
                    &client,
                    &sub_id,
                    stripe::CancelSubscription::default(),
                )
                .await
            }
        })
        .await?;

        tracing::info!(subscription_ref = %subscription_ref, "Canceled Stripe subscription");
        Ok(())
    }

    async fn update_subscription_quantity(
        &self,
        subscription_ref: &str,
        quantity: i32,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let client = self.client.inner().clone();
        let sub_id = parse_id::<stripe::SubscriptionId>(subscription_ref, "subscription")?;
        let quantity = positive_quantity(quantity)?;

        let current = self
            .call("retrieve_subscription", true, || {
                let client = client.clone();
                let sub_id = sub_id.clone();
                async move { stripe::Subscription::retrieve(&client, &sub_id, &[]).await }
            })
            .await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                ProcessorError::NotFound(format!("subscription {} has no items", subscription_ref))
            })?;

        let updated = self
            .call("update_subscription_quantity", true, || {
                let client = client.clone();
                let sub_id = sub_id.clone();
                let item_id = item_id.clone();
                async move {
                    let params = stripe::UpdateSubscription {
                        items: Some(vec![stripe::UpdateSubscriptionItems {
                            id: Some(item_id),
                            quantity: Some(quantity),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    };
                    stripe::Subscription::update(&client, &sub_id, params).await
                }
            })
            .await?;

        tracing::info!(
            subscription_ref = %subscription_ref,
            quantity,
            "Updated Stripe subscription quantity"
        );
        to_processor_subscription(&updated)
    }

    async fn create_setup_intent(&self, customer_ref: &str) -> Result<String, ProcessorError> {
        let client = self.client.inner().clone();
        let customer_id = parse_id::<stripe::CustomerId>(customer_ref, "customer")?;

        let intent = self
            .call("create_setup_intent", true, || {
                let client = client.clone();
                let customer_id = customer_id.clone();
                async move {
                    let mut params = stripe::CreateSetupIntent::new();
                    params.customer = Some(customer_id);
                    stripe::SetupIntent::create(&client, params).await
                }
            })
            .await?;

        intent
            .client_secret
            .ok_or_else(|| ProcessorError::Rejected("setup intent has no client secret".into()))
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, kind: &str) -> Result<T, ProcessorError> {
    raw.parse::<T>()
        .map_err(|_| ProcessorError::NotFound(format!("invalid {} reference: {}", kind, raw)))
}

/// Create-subscription request: the first invoice is left open for the client to
/// confirm, and the card it is paid with becomes the default for renewals.
fn subscription_params(
    customer_id: stripe::CustomerId,
    price: String,
    quantity: u64,
) -> stripe::CreateSubscription<'static> {
    let mut params = stripe::CreateSubscription::new(customer_id);
    params.items = Some(vec![stripe::CreateSubscriptionItems {
        price: Some(price),
        quantity: Some(quantity),
        ..Default::default()
    }]);
    params.payment_behavior = Some(stripe::SubscriptionPaymentBehavior::DefaultIncomplete);
    params.payment_settings = Some(stripe::CreateSubscriptionPaymentSettings {
        save_default_payment_method: Some(
            stripe::CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription,
        ),
        ..Default::default()
    });
    params.expand = &["latest_invoice.payment_intent"];
    params
}

fn positive_quantity(quantity: i32) -> Result<u64, ProcessorError> {
    u64::try_from(quantity)
        .ok()
        .filter(|q| *q > 0)
        .ok_or_else(|| ProcessorError::Rejected(format!("invalid quantity {}", quantity)))
}

fn timestamp(secs: i64) -> Result<OffsetDateTime, ProcessorError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| ProcessorError::Rejected(format!("invalid processor timestamp: {}", e)))
}

fn to_processor_subscription(
    sub: &stripe::Subscription,
) -> Result<ProcessorSubscription, ProcessorError> {
    let (invoice_ref, payment_intent_ref, confirmation_handle) = match &sub.latest_invoice {
        Some(Expandable::Object(invoice)) => {
            let (intent_ref, secret) = match &invoice.payment_intent {
                Some(Expandable::Object(intent)) => {
                    (Some(intent.id.to_string()), intent.client_secret.clone())
                }
                Some(Expandable::Id(id)) => (Some(id.to_string()), None),
                None => (None, None),
            };
            (Some(invoice.id.to_string()), intent_ref, secret)
        }
        Some(Expandable::Id(id)) => (Some(id.to_string()), None, None),
        None => (None, None, None),
    };

    let quantity = sub
        .items
        .data
        .first()
        .and_then(|item| item.quantity)
        .and_then(|q| i32::try_from(q).ok())
        .unwrap_or(0);

    Ok(ProcessorSubscription {
        subscription_ref: sub.id.to_string(),
        status: sub.status.as_str().to_string(),
        quantity,
        current_period_start: timestamp(sub.current_period_start)?,
        current_period_end: timestamp(sub.current_period_end)?,
        invoice_ref,
        payment_intent_ref,
        confirmation_handle,
    })
}

/// Map Stripe errors onto processor failure classes
fn map_stripe_error(error: stripe::StripeError) -> ProcessorError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            match request_error.http_status {
                402 => ProcessorError::Declined(message),
                404 => ProcessorError::NotFound(message),
                429 | 500..=599 => ProcessorError::Transient(message),
                _ => ProcessorError::Rejected(message),
            }
        }
        stripe::StripeError::Timeout => ProcessorError::Transient("Request timed out".into()),
        stripe::StripeError::ClientError(msg) => {
            ProcessorError::Transient(format!("HTTP client error: {}", msg))
        }
        stripe::StripeError::QueryStringSerialize(e) => {
            ProcessorError::Rejected(format!("Failed to serialize request: {}", e))
        }
        stripe::StripeError::JSONSerialize(e) => {
            ProcessorError::Rejected(format!("Failed to serialize JSON: {}", e))
        }
        stripe::StripeError::UnsupportedVersion => {
            ProcessorError::Rejected("Unsupported Stripe API version".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(status: &str) -> ProcessorSubscription {
        let now = OffsetDateTime::now_utc();
        ProcessorSubscription {
            subscription_ref: "sub_1".into(),
            status: status.into(),
            quantity: 3,
            current_period_start: now,
            current_period_end: now + time::Duration::days(365),
            invoice_ref: Some("in_1".into()),
            payment_intent_ref: Some("pi_1".into()),
            confirmation_handle: Some("pi_1_secret".into()),
        }
    }

    #[test]
    fn test_subscription_params_save_payment_method_for_renewals() {
        let customer_id = parse_id::<stripe::CustomerId>("cus_123", "customer").unwrap();
        let params = subscription_params(customer_id, "price_standard".into(), 3);

        assert!(matches!(
            params
                .payment_settings
                .as_ref()
                .and_then(|settings| settings.save_default_payment_method.as_ref()),
            Some(stripe::CreateSubscriptionPaymentSettingsSaveDefaultPaymentMethod::OnSubscription)
        ));

        let body = serde_json::to_value(&params).unwrap();
        assert_eq!(
            body["payment_settings"]["save_default_payment_method"],
            "on_subscription"
        );
        assert_eq!(body["payment_behavior"], "default_incomplete");
        assert_eq!(body["items"][0]["price"], "price_standard");
        assert_eq!(body["items"][0]["quantity"], 3);
    }

    #[test]
    fn test_initial_local_status() {
        assert_eq!(
            subscription("active").initial_local_status(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            subscription("incomplete").initial_local_status(),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            subscription("trialing").initial_local_status(),
            SubscriptionStatus::Trialing
        );
    }

    #[test]
    fn test_map_timeout_is_transient() {
        assert!(map_stripe_error(stripe::StripeError::Timeout).is_transient());
        assert!(!map_stripe_error(stripe::StripeError::UnsupportedVersion).is_transient());
    }

    #[test]
    fn test_positive_quantity() {
        assert_eq!(positive_quantity(3).unwrap(), 3);
        assert!(positive_quantity(0).is_err());
        assert!(positive_quantity(-2).is_err());
    }

    #[test]
    fn test_parse_id_rejects_foreign_prefix() {
        assert!(parse_id::<stripe::CustomerId>("cus_123", "customer").is_ok());
        assert!(matches!(
            parse_id::<stripe::CustomerId>("sub_123", "customer"),
            Err(ProcessorError::NotFound(_))
        ));
    }
}
