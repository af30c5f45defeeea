//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use seatline_billing::{BillingError, ProcessorError};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Status code and client-facing message. Infrastructure details stay in the logs.
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
                BillingError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
                BillingError::SeatLimitExceeded { .. } | BillingError::NoActiveSubscription => {
                    (StatusCode::CONFLICT, e.to_string())
                }
                BillingError::ConcurrentUpdate(_) => (
                    StatusCode::CONFLICT,
                    "Billing state changed during the request; retry".to_string(),
                ),
                BillingError::InvalidQuantity { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
                }
                BillingError::InvariantViolation(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "Request would leave billing state inconsistent".to_string(),
                ),
                BillingError::Processor(ProcessorError::Declined(_)) => {
                    (StatusCode::BAD_GATEWAY, "Payment was declined".to_string())
                }
                BillingError::Processor(_) => (
                    StatusCode::BAD_GATEWAY,
                    "Payment processor request failed".to_string(),
                ),
                BillingError::WebhookSignatureInvalid => {
                    (StatusCode::BAD_REQUEST, "Invalid webhook signature".to_string())
                }
                BillingError::WebhookPayload(_) => {
                    (StatusCode::BAD_REQUEST, "Malformed webhook payload".to_string())
                }
                BillingError::Database(_) | BillingError::Config(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                ),
            },
            ApiError::Auth(AuthError::Internal(_)) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            ApiError::Auth(e) => (e.status(), e.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: BillingError) -> StatusCode {
        ApiError::from(e).status_and_message().0
    }

    #[test]
    fn test_billing_error_status_codes() {
        assert_eq!(
            status_of(BillingError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::NotFound("gone".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::SeatLimitExceeded { active: 5, max: 5 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::NoActiveSubscription),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::ConcurrentUpdate("organization".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::InvalidQuantity {
                quantity: 9,
                min: 1,
                max: 5
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(BillingError::Processor(ProcessorError::Transient(
                "timeout".into()
            ))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(BillingError::WebhookSignatureInvalid),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_internal_details_are_not_exposed() {
        let (status, message) =
            ApiError::from(BillingError::Database("relation \"orders\" is locked".into()))
                .status_and_message();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("orders"));

        let (_, message) = ApiError::from(BillingError::Processor(ProcessorError::Rejected(
            "No such price: 'price_live_123'".into(),
        )))
        .status_and_message();
        assert!(!message.contains("price_live_123"));
    }
}
