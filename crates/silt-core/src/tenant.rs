//! Authenticated tenant/user context consumed by every component.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Validated authentication context.
///
/// Produced by the surrounding application after token verification; the
/// core never crosses tenants and checks every operation against this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Stable per-installation client identifier, used as the vector
    /// clock key for local writes.
    pub client_id: String,
}

impl TenantContext {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            roles: Vec::new(),
            client_id: client_id.into(),
        }
    }

    /// Refuse any operation whose declared tenant differs from this context.
    pub fn ensure_tenant(&self, declared: &str) -> Result<()> {
        if declared == self.tenant_id {
            Ok(())
        } else {
            Err(Error::TenantMismatch {
                expected: self.tenant_id.clone(),
                actual: declared.to_string(),
            })
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_tenant_accepts_own_tenant() {
        let ctx = TenantContext::new("t1", "u1", "c1");
        assert!(ctx.ensure_tenant("t1").is_ok());
    }

    #[test]
    fn ensure_tenant_refuses_foreign_tenant() {
        let ctx = TenantContext::new("t1", "u1", "c1");
        let error = ctx.ensure_tenant("t2").unwrap_err();
        assert!(matches!(error, Error::TenantMismatch { .. }));
    }
}
