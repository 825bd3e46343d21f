use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::VaultError;

/// Tracing target for security-relevant events.
pub const SECURITY_TARGET: &str = "vault_kernel::security";

const MAX_TENANT_ID_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// # Errors
    /// Returns [`VaultError::Validation`] for empty, oversized, or control-character ids.
    pub fn new(raw: impl Into<String>) -> Result<Self, VaultError> {
        let value = raw.into();
        if value.trim().is_empty() {
            return Err(VaultError::Validation(
                "tenant_id MUST be non-empty".to_string(),
            ));
        }
        if value.len() > MAX_TENANT_ID_LEN {
            return Err(VaultError::Validation(format!(
                "tenant_id MUST be at most {MAX_TENANT_ID_LEN} bytes"
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(VaultError::Validation(
                "tenant_id MUST NOT contain control characters".to_string(),
            ));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// The caller's tenant scope, required by every engine operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TenantContext {
    tenant_id: TenantId,
    actor: String,
}

impl TenantContext {
    #[must_use]
    pub fn new(tenant_id: TenantId, actor: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor: actor.into(),
        }
    }

    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Checks that a resolved row belongs to this context's tenant.
    ///
    /// A mismatch is logged on [`SECURITY_TARGET`] and returned as a fatal
    /// [`VaultError::TenantIsolationViolation`]. Only the caller's own tenant
    /// is recorded.
    ///
    /// # Errors
    /// Returns [`VaultError::TenantIsolationViolation`] when tenants differ.
    pub fn ensure_same_tenant(
        &self,
        row_tenant: &TenantId,
        operation: &'static str,
    ) -> Result<(), VaultError> {
        if row_tenant == &self.tenant_id {
            return Ok(());
        }

        tracing::error!(
            target: SECURITY_TARGET,
            operation,
            caller_tenant = %self.tenant_id,
            actor = %self.actor,
            "tenant isolation violation"
        );
        Err(VaultError::TenantIsolationViolation { operation })
    }
}
