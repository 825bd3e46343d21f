//! Deterministic surrogate keys for hubs and links.
//!
//! Every input is framed with a big-endian `u64` length prefix before it is
//! hashed, so `("ab", "c")` and `("a", "bc")` can never derive the same key.

use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::{TenantId, VaultError};

pub const KEY_LEN: usize = 32;

const HUB_DOMAIN: &[u8] = b"vault-kernel/hub/v1";
const LINK_DOMAIN: &[u8] = b"vault-kernel/link/v1";

/// A 256-bit derived key.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a lowercase or uppercase hex rendering of a key.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] when the input is not 64 hex digits.
    pub fn from_hex(raw: &str) -> Result<Self, VaultError> {
        let decoded = hex::decode(raw.trim())
            .map_err(|err| VaultError::Validation(format!("invalid key hex: {err}")))?;
        let bytes: [u8; KEY_LEN] = decoded.try_into().map_err(|value: Vec<u8>| {
            VaultError::Validation(format!(
                "key MUST be {KEY_LEN} bytes, got {}",
                value.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct HubKey(pub Key);

impl HubKey {
    /// # Errors
    /// Returns [`VaultError::Validation`] for malformed hex.
    pub fn from_hex(raw: &str) -> Result<Self, VaultError> {
        Key::from_hex(raw).map(Self)
    }
}

impl Display for HubKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct LinkKey(pub Key);

impl LinkKey {
    /// # Errors
    /// Returns [`VaultError::Validation`] for malformed hex.
    pub fn from_hex(raw: &str) -> Result<Self, VaultError> {
        Key::from_hex(raw).map(Self)
    }
}

impl Display for LinkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Derives the surrogate key for a `(business_key, tenant_id)` pair.
///
/// Pure and deterministic. `None` and `Some(b"")` salts are distinct inputs.
#[must_use]
pub fn derive_key(business_key: &[u8], tenant_id: &[u8], salt: Option<&[u8]>) -> Key {
    derive_framed(HUB_DOMAIN, &[business_key, tenant_id], salt)
}

#[must_use]
pub fn derive_hub_key(business_key: &str, tenant_id: &TenantId, salt: Option<&[u8]>) -> HubKey {
    HubKey(derive_key(business_key.as_bytes(), tenant_id.as_bytes(), salt))
}

/// Sorts and deduplicates link participants into canonical order.
///
/// # Errors
/// Returns [`VaultError::Validation`] when fewer than two distinct hubs remain.
pub fn canonical_participants(hub_keys: &[HubKey]) -> Result<Vec<HubKey>, VaultError> {
    let mut participants = hub_keys.to_vec();
    participants.sort_unstable();
    participants.dedup();

    if participants.len() < 2 {
        return Err(VaultError::Validation(format!(
            "a link MUST reference at least two distinct hubs, got {}",
            participants.len()
        )));
    }

    Ok(participants)
}

/// Derives a link key over the canonical participant set and tenant.
///
/// # Errors
/// Returns [`VaultError::Validation`] when fewer than two distinct hubs are given.
pub fn derive_link_key(
    hub_keys: &[HubKey],
    tenant_id: &TenantId,
    salt: Option<&[u8]>,
) -> Result<LinkKey, VaultError> {
    let participants = canonical_participants(hub_keys)?;
    let count = (participants.len() as u64).to_be_bytes();

    let mut fields: Vec<&[u8]> = Vec::with_capacity(participants.len() + 2);
    fields.push(&count);
    for participant in &participants {
        fields.push(participant.0.as_bytes());
    }
    fields.push(tenant_id.as_bytes());

    Ok(LinkKey(derive_framed(LINK_DOMAIN, &fields, salt)))
}

fn derive_framed(domain: &[u8], fields: &[&[u8]], salt: Option<&[u8]>) -> Key {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, domain);
    for field in fields {
        write_field(&mut hasher, field);
    }
    match salt {
        None => hasher.update([0_u8]),
        Some(value) => {
            hasher.update([1_u8]);
            write_field(&mut hasher, value);
        }
    }

    let digest = hasher.finalize();
    let mut bytes = [0_u8; KEY_LEN];
    bytes.copy_from_slice(&digest);
    Key(bytes)
}

fn write_field(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field);
}
