//! Common types used across Seatline

use serde::{Deserialize, Serialize};

// =============================================================================
// Plan tiers
// =============================================================================

/// Purchasable plan tier. The catalog only accepts plans named after one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum PlanTier {
    Basic,
    Standard,
    Plus,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Standard => "Standard",
            Self::Plus => "Plus",
        }
    }

    pub fn all() -> [PlanTier; 3] {
        [Self::Basic, Self::Standard, Self::Plus]
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Basic" => Ok(Self::Basic),
            "Standard" => Ok(Self::Standard),
            "Plus" => Ok(Self::Plus),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

// =============================================================================
// Roles and capabilities
// =============================================================================

/// Something a caller may be allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ViewOrganization,
    UpdateOrganization,
    ViewOrders,
    ViewMembers,
    ManageMembers,
    ManageBilling,
    ManagePlans,
    ViewAllOrganizations,
}

/// User role within an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum UserRole {
    User,
    Admin,
    SuperAdmin,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::User
    }
}

impl UserRole {
    /// The single authorization table. Every call site asks this instead of comparing roles.
    pub fn can(&self, capability: Capability) -> bool {
        use Capability::*;
        match self {
            Self::User => false,
            Self::Admin => matches!(
                capability,
                ViewOrganization
                    | UpdateOrganization
                    | ViewOrders
                    | ViewMembers
                    | ManageMembers
                    | ManageBilling
            ),
            Self::SuperAdmin => matches!(
                capability,
                ViewOrganization | ViewMembers | ManagePlans | ViewAllOrganizations
            ),
        }
    }

    /// Admins cannot be deactivated or removed through seat management.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "superAdmin",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            "superAdmin" => Ok(Self::SuperAdmin),
            _ => Err(format!("Invalid user role: {}", s)),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Subscription status of an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Canceled,
    Expired,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Trialing
    }
}

impl SubscriptionStatus {
    /// Whether a bare status update may move `self` to `to`.
    ///
    /// Leaving `canceled`/`expired` is never a status flip: it requires a fresh subscription.
    pub fn can_transition_to(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, to) {
            _ if *self == to => true,
            (Trialing, Active) | (Active, Canceled) | (Active, Expired) | (Trialing, Canceled) => {
                true
            }
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Order status
// =============================================================================

/// Status of a billing transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl Default for OrderStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OrderStatus {
    /// Same-state is allowed and treated as a no-op by callers.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, to) {
            _ if *self == to => true,
            (Pending, Completed) | (Pending, Failed) | (Failed, Completed) | (Completed, Refunded) => {
                true
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
