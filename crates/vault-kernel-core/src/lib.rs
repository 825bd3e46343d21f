//! Pure domain model for the vault kernel: deterministic keys, canonical
//! payload digests, tenant scoping, and the record shapes every storage
//! backend returns.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod canonical;
mod config;
mod error;
mod keys;
mod tenant;

pub use canonical::{
    canonical_json, document_digest, tombstone_digest, CanonicalPayload,
};
pub use config::EngineConfig;
pub use error::VaultError;
pub use keys::{
    canonical_participants, derive_hub_key, derive_key, derive_link_key, HubKey, Key, LinkKey,
    KEY_LEN,
};
pub use tenant::{TenantContext, TenantId, SECURITY_TARGET};

const MAX_SATELLITE_KIND_LEN: usize = 64;
const MAX_BUSINESS_KEY_LEN: usize = 512;

/// Name of one attribute group, e.g. `profile` or `billing.address`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SatelliteKind(String);

impl SatelliteKind {
    /// # Errors
    /// Returns [`VaultError::Validation`] unless the name is 1..=64 characters
    /// of `[a-z0-9_.-]` starting with a lowercase letter.
    pub fn new(raw: impl Into<String>) -> Result<Self, VaultError> {
        let value = raw.into();
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(VaultError::Validation(
                "satellite_kind MUST be non-empty".to_string(),
            ));
        };
        if !first.is_ascii_lowercase() {
            return Err(VaultError::Validation(format!(
                "satellite_kind MUST start with a lowercase letter: {value}"
            )));
        }
        if value.len() > MAX_SATELLITE_KIND_LEN {
            return Err(VaultError::Validation(format!(
                "satellite_kind MUST be at most {MAX_SATELLITE_KIND_LEN} characters"
            )));
        }
        if !chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "_.-".contains(ch)) {
            return Err(VaultError::Validation(format!(
                "satellite_kind MUST match [a-z0-9_.-]: {value}"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SatelliteKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SatelliteKind {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SatelliteKind> for String {
    fn from(value: SatelliteKind) -> Self {
        value.0
    }
}

/// Provenance of a writer, recorded on every row for audit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SourceTag(String);

impl SourceTag {
    /// # Errors
    /// Returns [`VaultError::Validation`] when the tag is blank.
    pub fn new(raw: impl Into<String>) -> Result<Self, VaultError> {
        let value = raw.into();
        if value.trim().is_empty() {
            return Err(VaultError::Validation(
                "source_tag MUST be provided for every write".to_string(),
            ));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SourceTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SourceTag {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SourceTag> for String {
    fn from(value: SourceTag) -> Self {
        value.0
    }
}

/// Validates a natural business identifier before it is keyed.
///
/// # Errors
/// Returns [`VaultError::Validation`] for blank or oversized keys.
pub fn validate_business_key(business_key: &str) -> Result<(), VaultError> {
    if business_key.trim().is_empty() {
        return Err(VaultError::Validation(
            "business_key MUST be non-empty".to_string(),
        ));
    }
    if business_key.len() > MAX_BUSINESS_KEY_LEN {
        return Err(VaultError::Validation(format!(
            "business_key MUST be at most {MAX_BUSINESS_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Hub,
    Link,
}

impl OwnerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Link => "link",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hub" => Some(Self::Hub),
            "link" => Some(Self::Link),
            _ => None,
        }
    }
}

/// The entity a satellite is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum EntityRef {
    Hub(HubKey),
    Link(LinkKey),
}

impl EntityRef {
    #[must_use]
    pub fn owner_kind(&self) -> OwnerKind {
        match self {
            Self::Hub(_) => OwnerKind::Hub,
            Self::Link(_) => OwnerKind::Link,
        }
    }

    #[must_use]
    pub fn key(&self) -> Key {
        match self {
            Self::Hub(hub) => hub.0,
            Self::Link(link) => link.0,
        }
    }

    #[must_use]
    pub fn from_parts(owner_kind: OwnerKind, key: Key) -> Self {
        match owner_kind {
            OwnerKind::Hub => Self::Hub(HubKey(key)),
            OwnerKind::Link => Self::Link(LinkKey(key)),
        }
    }
}

impl From<HubKey> for EntityRef {
    fn from(value: HubKey) -> Self {
        Self::Hub(value)
    }
}

impl From<LinkKey> for EntityRef {
    fn from(value: LinkKey) -> Self {
        Self::Link(value)
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_kind().as_str(), self.key())
    }
}

impl FromStr for EntityRef {
    type Err = VaultError;

    /// Parses `hub:<hex>` or `link:<hex>`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((kind_raw, key_raw)) = raw.split_once(':') else {
            return Err(VaultError::Validation(
                "entity MUST be in <hub|link>:<key> format".to_string(),
            ));
        };
        let owner_kind = OwnerKind::parse(kind_raw).ok_or_else(|| {
            VaultError::Validation(format!("unknown entity kind: {kind_raw}"))
        })?;
        Ok(Self::from_parts(owner_kind, Key::from_hex(key_raw)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubRecord {
    pub hub_key: HubKey,
    pub business_key: String,
    pub tenant_id: TenantId,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    pub source_tag: SourceTag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkRecord {
    pub link_key: LinkKey,
    pub tenant_id: TenantId,
    /// Participants in canonical (sorted) order.
    pub participants: Vec<HubKey>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub source_tag: SourceTag,
}

/// Stored attribute values of one satellite version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum SatelliteValue {
    Document(Value),
    Tombstone,
}

impl SatelliteValue {
    #[must_use]
    pub fn as_document(&self) -> Option<&Value> {
        match self {
            Self::Document(value) => Some(value),
            Self::Tombstone => None,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

/// Identity and interval of one satellite version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SatelliteVersion {
    pub version_id: Ulid,
    pub version_seq: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub version_start: OffsetDateTime,
    pub content_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VersionOutcome {
    /// The open version already carries this payload; nothing was written.
    Unchanged(SatelliteVersion),
    NewVersion(SatelliteVersion),
}

impl VersionOutcome {
    #[must_use]
    pub fn is_new_version(&self) -> bool {
        matches!(self, Self::NewVersion(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SatelliteRecord {
    pub owner: EntityRef,
    pub tenant_id: TenantId,
    pub satellite_kind: SatelliteKind,
    pub version_id: Ulid,
    pub version_seq: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub version_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub version_end: Option<OffsetDateTime>,
    pub content_digest: String,
    pub value: SatelliteValue,
    pub source_tag: SourceTag,
    #[serde(with = "time::serde::rfc3339::option")]
    pub erased_at: Option<OffsetDateTime>,
}

impl SatelliteRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.version_end.is_none()
    }

    /// `version_start <= at < version_end`, open intervals extend forever.
    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        self.version_start <= at && self.version_end.map_or(true, |end| at < end)
    }

    /// Decodes the document into a typed attribute group.
    ///
    /// Tombstones decode to `None`.
    ///
    /// # Errors
    /// Returns [`VaultError::Validation`] when the document does not match `G`.
    pub fn decode<G: DeserializeOwned>(&self) -> Result<Option<G>, VaultError> {
        let Some(document) = self.value.as_document() else {
            return Ok(None);
        };
        serde_json::from_value(document.clone())
            .map(Some)
            .map_err(|err| {
                VaultError::Validation(format!(
                    "stored {} payload does not decode: {err}",
                    self.satellite_kind
                ))
            })
    }
}

/// A strongly typed attribute group with its own version timeline.
pub trait AttributeGroup: Serialize + DeserializeOwned {
    const KIND: &'static str;

    /// # Errors
    /// Returns [`VaultError::Validation`] when `KIND` is not a valid kind name.
    fn satellite_kind() -> Result<SatelliteKind, VaultError> {
        SatelliteKind::new(Self::KIND)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`VaultError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, VaultError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| VaultError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(VaultError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`VaultError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, VaultError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| VaultError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Microseconds since the Unix epoch, floored to the microsecond at or
/// before `value`.
///
/// # Errors
/// Returns [`VaultError::Validation`] when the instant is outside the `i64` range.
pub fn to_unix_micros(value: OffsetDateTime) -> Result<i64, VaultError> {
    i64::try_from(value.unix_timestamp_nanos().div_euclid(1_000))
        .map_err(|_| VaultError::Validation("timestamp out of range".to_string()))
}

/// # Errors
/// Returns [`VaultError::Validation`] when `micros` is not a representable instant.
pub fn from_unix_micros(micros: i64) -> Result<OffsetDateTime, VaultError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|err| VaultError::Validation(format!("timestamp out of range: {err}")))
}
