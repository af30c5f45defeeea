//! Billing error types

use thiserror::Error;

/// Failure reported by the payment processor, classified so callers can react per class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessorError {
    /// The payment method was refused (card declined, insufficient funds, ...)
    #[error("Payment declined: {0}")]
    Declined(String),

    /// The referenced customer, subscription or price does not exist on the processor
    #[error("Processor resource not found: {0}")]
    NotFound(String),

    /// Rate limiting, processor outage, network failure or timeout. Safe to retry.
    #[error("Transient processor failure: {0}")]
    Transient(String),

    /// The request was rejected for any other reason (invalid parameters, auth, ...)
    #[error("Processor rejected request: {0}")]
    Rejected(String),
}

impl ProcessorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Billing errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Seat limit exceeded: {active} of {max} seats in use")]
    SeatLimitExceeded { active: i32, max: i32 },

    #[error("Invalid seat quantity {quantity}: plan allows {min} to {max}")]
    InvalidQuantity { quantity: i32, min: i32, max: i32 },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("No active subscription")]
    NoActiveSubscription,

    /// Another writer changed the record between read and write
    #[error("Concurrent update: {0}")]
    ConcurrentUpdate(String),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_error_classes() {
        assert!(ProcessorError::Transient("timeout".into()).is_transient());
        assert!(!ProcessorError::Declined("card_declined".into()).is_transient());
        assert!(!ProcessorError::NotFound("cus_missing".into()).is_transient());
    }

    #[test]
    fn test_processor_error_wraps_transparently() {
        let err: BillingError = ProcessorError::Declined("insufficient_funds".into()).into();
        assert_eq!(err.to_string(), "Payment declined: insufficient_funds");
        assert!(matches!(
            err,
            BillingError::Processor(ProcessorError::Declined(_))
        ));
    }

    #[test]
    fn test_quantity_message() {
        let err = BillingError::InvalidQuantity {
            quantity: 9,
            min: 1,
            max: 5,
        };
        assert_eq!(err.to_string(), "Invalid seat quantity 9: plan allows 1 to 5");
    }
}
