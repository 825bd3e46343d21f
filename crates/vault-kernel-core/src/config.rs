use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::VaultError;

const MAX_WRITE_RETRIES_LIMIT: u32 = 64;
const UNSALTED_FINGERPRINT: &str = "unsalted";

/// Engine tuning and key-derivation settings.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Attempts at a version transition before surfacing `WriteContention`.
    pub max_write_retries: u32,
    pub busy_timeout_ms: u64,
    /// Optional hex salt mixed into every derived hub and link key.
    pub key_salt_hex: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_write_retries: 8,
            busy_timeout_ms: 5_000,
            key_salt_hex: None,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`VaultError::Configuration`] when bounds are violated or the
    /// salt is not valid hex.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.max_write_retries == 0 || self.max_write_retries > MAX_WRITE_RETRIES_LIMIT {
            return Err(VaultError::Configuration(format!(
                "max_write_retries MUST be in [1, {MAX_WRITE_RETRIES_LIMIT}]"
            )));
        }

        if self.busy_timeout_ms == 0 {
            return Err(VaultError::Configuration(
                "busy_timeout_ms MUST be >= 1".to_string(),
            ));
        }

        self.key_salt()?;
        Ok(())
    }

    /// # Errors
    /// Returns [`VaultError::Configuration`] when the JSON does not describe a
    /// valid configuration.
    pub fn from_json(value: &Value) -> Result<Self, VaultError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| VaultError::Configuration(format!("invalid engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Decoded salt bytes, if configured.
    ///
    /// # Errors
    /// Returns [`VaultError::Configuration`] when the salt is empty or not hex.
    pub fn key_salt(&self) -> Result<Option<Vec<u8>>, VaultError> {
        let Some(raw) = self.key_salt_hex.as_deref() else {
            return Ok(None);
        };

        let bytes = hex::decode(raw.trim())
            .map_err(|err| VaultError::Configuration(format!("key_salt_hex is not hex: {err}")))?;
        if bytes.is_empty() {
            return Err(VaultError::Configuration(
                "key_salt_hex MUST NOT be empty when provided".to_string(),
            ));
        }
        Ok(Some(bytes))
    }

    /// Stable fingerprint of the salt, persisted alongside the data so a
    /// database is never reopened with a different salt.
    ///
    /// # Errors
    /// Returns [`VaultError::Configuration`] when the salt is invalid.
    pub fn salt_fingerprint(&self) -> Result<String, VaultError> {
        let Some(salt) = self.key_salt()? else {
            return Ok(UNSALTED_FINGERPRINT.to_string());
        };

        let mut hasher = Sha256::new();
        hasher.update(b"vault-kernel/salt/v1");
        hasher.update(&salt);
        Ok(hex::encode(hasher.finalize()))
    }
}
