use rusqlite::ErrorCode;
use vault_kernel_core::VaultError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
    #[error("schema compatibility check failed: {0}")]
    Compatibility(String),
}

impl StoreError {
    #[must_use]
    pub fn vault(&self) -> Option<&VaultError> {
        match self {
            Self::Vault(err) => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Vault(err) => err.is_transient(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Vault(err) => err.is_fatal(),
            Self::Corrupt(_) | Self::Compatibility(_) => true,
            Self::Sqlite(_) | Self::Serialization(_) => false,
        }
    }

    /// Message safe to show to end users of a consuming feature.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Vault(err) => err.user_message(),
            _ => "internal error".to_string(),
        }
    }

    /// Whether the failure came from a racing writer and the attempt may be
    /// replayed against freshly read state.
    pub(crate) fn is_write_conflict(&self) -> bool {
        let Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) = self else {
            return false;
        };

        match err.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
            ErrorCode::ConstraintViolation => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }
}
