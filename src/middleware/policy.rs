use uuid::Uuid;

use crate::{entity::sea_orm_active_enums::UserRole, error::AppError, middleware::auth::AuthUser};

/// Privileged actions. Ordinary users get none of these; they act only on
/// resources they own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ViewAllOrders,
    ManageOrders,
    ViewAllPayments,
    ApproveRefunds,
    ViewAllRefunds,
}

impl Capability {
    fn as_str(&self) -> &'static str {
        match self {
            Capability::ViewAllOrders => "view all orders",
            Capability::ManageOrders => "manage orders",
            Capability::ViewAllPayments => "view all payments",
            Capability::ApproveRefunds => "approve refunds",
            Capability::ViewAllRefunds => "view all refunds",
        }
    }
}

pub fn role_capabilities(role: UserRole) -> &'static [Capability] {
    match role {
        UserRole::Admin => &[
            Capability::ViewAllOrders,
            Capability::ManageOrders,
            Capability::ViewAllPayments,
            Capability::ApproveRefunds,
            Capability::ViewAllRefunds,
        ],
        UserRole::User => &[],
    }
}

impl AuthUser {
    pub fn can(&self, capability: Capability) -> bool {
        role_capabilities(self.role).contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<(), AppError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "not allowed to {}",
                capability.as_str()
            )))
        }
    }

    /// Owners pass; everybody else needs `capability`.
    pub fn require_owner_or(&self, owner_id: Uuid, capability: Capability) -> Result<(), AppError> {
        if self.user_id == owner_id {
            return Ok(());
        }
        self.require(capability)
    }
}
