//! Permission levels and the privileged-operation table
//!
//! The command front-end resolves who the caller is and what rights they hold
//! in the acting community; the core trusts that level and only compares it
//! against the table below before touching the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LedgerError, Result};

/// Caller rights, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PermissionLevel {
    /// Any community member
    #[default]
    Member = 0,
    /// Holds manage-server rights in the acting community
    Manager = 1,
    /// Bot owner or team: global rights
    Staff = 2,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionLevel::Member => write!(f, "member"),
            PermissionLevel::Manager => write!(f, "manager"),
            PermissionLevel::Staff => write!(f, "staff"),
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "member" => Ok(PermissionLevel::Member),
            "manager" => Ok(PermissionLevel::Manager),
            "staff" => Ok(PermissionLevel::Staff),
            other => Err(LedgerError::InvalidInput(format!(
                "unknown permission level: {}",
                other
            ))),
        }
    }
}

/// Required level for a privileged operation.
/// Returns None for operations any member may perform.
pub fn required_permission(operation: &str) -> Option<PermissionLevel> {
    match operation {
        "set_currency"
        | "set_starting_balance"
        | "set_tax_rate"
        | "set_prefix"
        | "toggle_command" => Some(PermissionLevel::Manager),

        "issue_premium_key" | "set_membership" => Some(PermissionLevel::Staff),

        _ => None,
    }
}

/// Check if an operation is allowed for the given level
pub fn is_operation_allowed(operation: &str, level: PermissionLevel) -> bool {
    match required_permission(operation) {
        Some(required) => level >= required,
        None => true,
    }
}

/// Reject with `Unauthorized` unless `level` may perform `operation`.
pub fn authorize(operation: &str, level: PermissionLevel) -> Result<()> {
    if is_operation_allowed(operation, level) {
        Ok(())
    } else {
        tracing::warn!(operation, level = %level, "Rejected privileged operation");
        Err(LedgerError::Unauthorized(format!(
            "{} requires {} rights",
            operation,
            required_permission(operation).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_operations() {
        assert!(is_operation_allowed("work", PermissionLevel::Member));
        assert!(is_operation_allowed("transfer", PermissionLevel::Member));
    }

    #[test]
    fn test_manager_operations() {
        assert!(!is_operation_allowed("toggle_command", PermissionLevel::Member));
        assert!(is_operation_allowed("toggle_command", PermissionLevel::Manager));
        assert!(is_operation_allowed("toggle_command", PermissionLevel::Staff));
    }

    #[test]
    fn test_staff_operations() {
        assert!(!is_operation_allowed("issue_premium_key", PermissionLevel::Manager));
        assert!(is_operation_allowed("issue_premium_key", PermissionLevel::Staff));
    }

    #[test]
    fn test_authorize_reports_required_level() {
        let err = authorize("set_membership", PermissionLevel::Manager).unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(ref m) if m.contains("staff")));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("Manager".parse::<PermissionLevel>().unwrap(), PermissionLevel::Manager);
        assert!("owner".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn test_level_ordering() {
        assert!(PermissionLevel::Staff > PermissionLevel::Manager);
        assert!(PermissionLevel::Manager > PermissionLevel::Member);
    }
}
