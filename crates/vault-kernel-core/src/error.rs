/// Engine-level failure taxonomy shared by every storage backend.
///
/// Display strings never carry tenant identifiers or payload contents, so an
/// error can be surfaced to any caller without leaking data across tenants.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum VaultError {
    #[error("key collision on {key}: stored identity does not match the derived inputs")]
    KeyCollision { key: String },
    #[error("content digest collision on {owner}/{kind}: digests match but payloads differ")]
    DigestCollision { owner: String, kind: String },
    #[error("write contention: version transition not applied after {attempts} attempts, please retry")]
    WriteContention { attempts: u32 },
    #[error("tenant isolation violation during {operation}")]
    TenantIsolationViolation { operation: &'static str },
    #[error("unknown entity: {entity}")]
    UnknownEntity { entity: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl VaultError {
    /// Transient failures may be retried by the caller against fresh state.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteContention { .. })
    }

    /// Fatal failures must abort the enclosing business operation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::KeyCollision { .. }
                | Self::DigestCollision { .. }
                | Self::TenantIsolationViolation { .. }
        )
    }

    /// Message suitable for end users of a consuming feature.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::WriteContention { .. } => "the record is busy, please retry".to_string(),
            Self::KeyCollision { .. }
            | Self::DigestCollision { .. }
            | Self::TenantIsolationViolation { .. } => "internal error".to_string(),
            Self::UnknownEntity { .. } => "record not found".to_string(),
            Self::Validation(message) | Self::Configuration(message) => message.clone(),
        }
    }
}
