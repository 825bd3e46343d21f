//! Canonical payload encoding and change-detection digests.
//!
//! Object keys are emitted in byte order with no insignificant whitespace, so
//! two semantically equal documents hash identically whatever order their
//! fields were inserted in. Numbers are normalized: integral floats within the
//! exactly representable range are written as integers and `-0` as `0`, so
//! `1`, `1.0` and `1e0` share one digest.

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::VaultError;

const DOCUMENT_DOMAIN: &[u8] = b"vault-kernel/satellite/v1";
const TOMBSTONE_DOMAIN: &[u8] = b"vault-kernel/tombstone/v1";

/// 2^53, the largest magnitude below which every integer is an exact `f64`.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A payload ready to be written: canonical text plus its digest.
///
/// `canonical` is `None` for tombstones.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CanonicalPayload {
    canonical: Option<String>,
    digest: String,
}

impl CanonicalPayload {
    /// # Errors
    /// Returns [`VaultError::Validation`] when a string cannot be encoded or a
    /// number cannot be represented exactly.
    pub fn from_value(value: &Value) -> Result<Self, VaultError> {
        let canonical = canonical_json(value)?;
        let digest = document_digest(&canonical);
        Ok(Self {
            canonical: Some(canonical),
            digest,
        })
    }

    #[must_use]
    pub fn tombstone() -> Self {
        Self {
            canonical: None,
            digest: tombstone_digest(),
        }
    }

    #[must_use]
    pub fn canonical(&self) -> Option<&str> {
        self.canonical.as_deref()
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.canonical.is_none()
    }
}

/// Renders `value` in canonical form.
///
/// # Errors
/// Returns [`VaultError::Validation`] when a string cannot be encoded or a
/// number cannot be represented exactly.
pub fn canonical_json(value: &Value) -> Result<String, VaultError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

#[must_use]
pub fn document_digest(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((DOCUMENT_DOMAIN.len() as u64).to_be_bytes());
    hasher.update(DOCUMENT_DOMAIN);
    hasher.update((canonical.len() as u64).to_be_bytes());
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn tombstone_digest() -> String {
    let mut hasher = Sha256::new();
    hasher.update((TOMBSTONE_DOMAIN.len() as u64).to_be_bytes());
    hasher.update(TOMBSTONE_DOMAIN);
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), VaultError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => write_number(number, out)?,
        Value::String(text) => write_string(text, out)?,
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|lhs, rhs| lhs.0.as_bytes().cmp(rhs.0.as_bytes()));

            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out)?;
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
fn write_number(number: &Number, out: &mut String) -> Result<(), VaultError> {
    if let Some(value) = number.as_i64() {
        out.push_str(&value.to_string());
        return Ok(());
    }
    if let Some(value) = number.as_u64() {
        out.push_str(&value.to_string());
        return Ok(());
    }

    let value = match number.as_f64() {
        Some(value) if value.is_finite() => value,
        _ => {
            return Err(VaultError::Validation(format!(
                "number {number} is not a finite value"
            )))
        }
    };
    if value.fract() == 0.0 {
        // Integers past 2^53 or u64 arrive here already rounded.
        if value.abs() > MAX_EXACT_INTEGER {
            return Err(VaultError::Validation(format!(
                "number {number} cannot be represented exactly"
            )));
        }
        out.push_str(&(value as i64).to_string());
        return Ok(());
    }
    out.push_str(&number.to_string());
    Ok(())
}

fn write_string(text: &str, out: &mut String) -> Result<(), VaultError> {
    let encoded = serde_json::to_string(text)
        .map_err(|err| VaultError::Validation(format!("failed to encode string: {err}")))?;
    out.push_str(&encoded);
    Ok(())
}
