//! Request authentication
//!
//! Handlers that need a caller take an [`AuthUser`] argument. Extraction validates
//! the bearer token, reloads the user so deactivation and removal take effect
//! immediately, and rejects the request before the handler runs.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use seatline_billing::BillingError;
use seatline_shared::{Capability, UserRole};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::state::AppState;

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: UserRole,
    pub email: String,
}

impl AuthUser {
    /// Fail with 403 unless the caller's role grants `capability`
    pub fn require(&self, capability: Capability) -> Result<(), AuthError> {
        if self.role.can(capability) {
            return Ok(());
        }
        tracing::warn!(
            user_id = %self.user_id,
            role = %self.role,
            capability = ?capability,
            "Capability check failed"
        );
        Err(AuthError::InsufficientPermissions)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Account is inactive")]
    AccountInactive,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("{0}")]
    WeakPassword(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingAuth
            | AuthError::InvalidAuthFormat
            | AuthError::InvalidToken
            | AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::AccountInactive | AuthError::InsufficientPermissions => {
                StatusCode::FORBIDDEN
            }
            AuthError::WeakPassword(_) => StatusCode::BAD_REQUEST,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            AuthError::Internal(e) => {
                tracing::error!(error = %e, "Authentication failed internally");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidAuthFormat)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(parts)?;
        let claims = state.jwt_manager.validate_access_token(token)?;

        let user = match state.billing.seats.get_user(claims.sub).await {
            Ok(user) => user,
            Err(BillingError::NotFound(_)) => {
                tracing::warn!(user_id = %claims.sub, "Token for unknown user");
                return Err(AuthError::InvalidToken);
            }
            Err(e) => return Err(AuthError::Internal(e.to_string())),
        };

        if user.is_removed() || user.org_id != claims.org_id {
            tracing::warn!(user_id = %user.id, "Token for removed or moved user");
            return Err(AuthError::InvalidToken);
        }
        if !user.is_active {
            tracing::info!(user_id = %user.id, "Inactive user refused");
            return Err(AuthError::AccountInactive);
        }

        // Role comes from the stored user so demotions apply to live tokens
        Ok(AuthUser {
            user_id: user.id,
            org_id: user.org_id,
            role: user.role,
            email: user.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/users");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(
            extract_bearer_token(&parts_with(Some("Bearer abc.def"))).unwrap(),
            "abc.def"
        );
        assert!(matches!(
            extract_bearer_token(&parts_with(None)),
            Err(AuthError::MissingAuth)
        ));
        assert!(matches!(
            extract_bearer_token(&parts_with(Some("Basic dXNlcg=="))),
            Err(AuthError::InvalidAuthFormat)
        ));
        assert!(matches!(
            extract_bearer_token(&parts_with(Some("Bearer "))),
            Err(AuthError::InvalidAuthFormat)
        ));
    }

    #[test]
    fn test_require_capability() {
        let caller = |role| AuthUser {
            user_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            role,
            email: "a@acme.test".into(),
        };

        assert!(caller(UserRole::Admin).require(Capability::ManageBilling).is_ok());
        assert!(matches!(
            caller(UserRole::User).require(Capability::ViewOrganization),
            Err(AuthError::InsufficientPermissions)
        ));
        assert!(caller(UserRole::SuperAdmin)
            .require(Capability::ManageBilling)
            .is_err());
    }

    #[test]
    fn test_auth_error_status() {
        assert_eq!(AuthError::MissingAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::AccountInactive.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthError::InsufficientPermissions.status(),
            StatusCode::FORBIDDEN
        );
    }
}
