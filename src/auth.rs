//! Privilege preflight.

use crate::client::Session;
use crate::error::{ProviderError, Result};

/// Fail unless the session belongs to a system administrator.
///
/// Runs before any lock is taken or SDK call made.
pub fn ensure_sysadmin(session: &Session, resource: &str) -> Result<()> {
    if session.is_sysadmin {
        return Ok(());
    }
    Err(ProviderError::Permission(format!(
        "{} requires System administrator privileges (user '{}' in org '{}')",
        resource, session.user, session.org
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysadmin_passes() {
        assert!(ensure_sysadmin(&Session::sysadmin("admin"), "vcd_nsxt_alb_controller").is_ok());
    }

    #[test]
    fn test_tenant_rejected_with_resource_name() {
        let err = ensure_sysadmin(&Session::tenant("alice", "org1"), "vcd_nsxt_alb_controller")
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permission(_)));
        assert!(err.to_string().contains("vcd_nsxt_alb_controller"));
    }
}
