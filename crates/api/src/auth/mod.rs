//! Authentication module for Seatline

pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{Claims, JwtManager};
pub use middleware::{AuthError, AuthUser};
pub use password::{hash_password, validate_password_strength, verify_password};
