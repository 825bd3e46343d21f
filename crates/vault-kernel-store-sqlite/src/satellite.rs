use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tracing::{debug, error};
use ulid::Ulid;
use vault_kernel_core::{
    AttributeGroup, CanonicalPayload, EntityRef, OwnerKind, SatelliteKind, SatelliteRecord,
    SatelliteValue, SatelliteVersion, SourceTag, TenantContext, TenantId, VaultError,
    VersionOutcome, SECURITY_TARGET,
};

use crate::{
    guard, invalid_data, key_column, micros_to_datetime, next_tx_micros, source_tag_column,
    tenant_column, with_write_retry, Attempt, Result, SqliteVaultStore, StoreError,
};

pub(crate) const SATELLITE_COLUMNS: &str = "owner_key, owner_kind, tenant_id, satellite_kind, \
     version_seq, version_id, version_start_us, version_end_us, content_digest, payload_json, \
     source_tag, erased_us";

/// One `satellites` row as stored, before payload decoding.
#[derive(Debug, Clone)]
pub(crate) struct StoredSatellite {
    pub(crate) owner: EntityRef,
    pub(crate) tenant_id: TenantId,
    pub(crate) satellite_kind: SatelliteKind,
    pub(crate) version_seq: u32,
    pub(crate) version_id: Ulid,
    pub(crate) version_start_us: i64,
    pub(crate) version_end_us: Option<i64>,
    pub(crate) content_digest: String,
    /// `None` for tombstones and erased rows.
    pub(crate) payload_json: Option<String>,
    pub(crate) source_tag: SourceTag,
    pub(crate) erased_us: Option<i64>,
}

impl StoredSatellite {
    pub(crate) fn version(&self) -> Result<SatelliteVersion> {
        Ok(SatelliteVersion {
            version_id: self.version_id,
            version_seq: self.version_seq,
            version_start: micros_to_datetime(6, self.version_start_us)?,
            content_digest: self.content_digest.clone(),
        })
    }

    pub(crate) fn into_record(self) -> Result<SatelliteRecord> {
        let value = match self.payload_json.as_deref() {
            Some(raw) => {
                let document: Value = serde_json::from_str(raw).map_err(|err| {
                    StoreError::Corrupt(format!(
                        "stored payload of version {} is not JSON: {err}",
                        self.version_id
                    ))
                })?;
                SatelliteValue::Document(document)
            }
            None => SatelliteValue::Tombstone,
        };

        Ok(SatelliteRecord {
            owner: self.owner,
            tenant_id: self.tenant_id,
            satellite_kind: self.satellite_kind,
            version_id: self.version_id,
            version_seq: self.version_seq,
            version_start: micros_to_datetime(6, self.version_start_us)?,
            version_end: self
                .version_end_us
                .map(|micros| micros_to_datetime(7, micros))
                .transpose()?,
            content_digest: self.content_digest,
            value,
            source_tag: self.source_tag,
            erased_at: self
                .erased_us
                .map(|micros| micros_to_datetime(11, micros))
                .transpose()?,
        })
    }
}

pub(crate) fn parse_satellite_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSatellite> {
    let owner_kind_raw: String = row.get(1)?;
    let owner_kind = OwnerKind::parse(&owner_kind_raw).ok_or_else(|| {
        invalid_data(1, Type::Text, format!("invalid owner_kind: {owner_kind_raw}"))
    })?;

    let satellite_kind_raw: String = row.get(3)?;
    let satellite_kind = SatelliteKind::new(satellite_kind_raw)
        .map_err(|err| invalid_data(3, Type::Text, err.to_string()))?;

    let version_seq_raw: i64 = row.get(4)?;
    let version_seq = u32::try_from(version_seq_raw).map_err(|_| {
        invalid_data(4, Type::Integer, format!("invalid version_seq: {version_seq_raw}"))
    })?;

    let version_id_raw: String = row.get(5)?;
    let version_id = Ulid::from_string(&version_id_raw).map_err(|err| {
        invalid_data(5, Type::Text, format!("invalid version_id {version_id_raw}: {err}"))
    })?;

    Ok(StoredSatellite {
        owner: EntityRef::from_parts(owner_kind, key_column(row, 0)?),
        tenant_id: tenant_column(row, 2)?,
        satellite_kind,
        version_seq,
        version_id,
        version_start_us: row.get(6)?,
        version_end_us: row.get(7)?,
        content_digest: row.get(8)?,
        payload_json: row.get(9)?,
        source_tag: source_tag_column(row, 10)?,
        erased_us: row.get(11)?,
    })
}

pub(crate) fn load_open_row(
    conn: &Connection,
    owner: &EntityRef,
    satellite_kind: &SatelliteKind,
) -> Result<Option<StoredSatellite>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SATELLITE_COLUMNS}
                 FROM satellites
                 WHERE owner_key = ?1 AND satellite_kind = ?2 AND version_end_us IS NULL"
            ),
            params![owner.key().to_hex(), satellite_kind.as_str()],
            parse_satellite_row,
        )
        .optional()?;
    Ok(row)
}

impl SqliteVaultStore {
    /// Records `payload` as the current value of one attribute group.
    ///
    /// An identical payload (after canonicalization) is a no-op reported as
    /// [`VersionOutcome::Unchanged`]. Otherwise the open version is closed and
    /// a new one opened at the same store-clock instant, atomically.
    pub fn upsert_satellite(
        &mut self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
        payload: &Value,
        source_tag: &SourceTag,
    ) -> Result<VersionOutcome> {
        let payload = CanonicalPayload::from_value(payload)?;
        self.write_version(ctx, owner, satellite_kind, &payload, source_tag, "upsert_satellite")
    }

    /// Appends an explicit tombstone version. Reads then return a record whose
    /// value is [`SatelliteValue::Tombstone`].
    pub fn tombstone_satellite(
        &mut self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
        source_tag: &SourceTag,
    ) -> Result<VersionOutcome> {
        let payload = CanonicalPayload::tombstone();
        self.write_version(ctx, owner, satellite_kind, &payload, source_tag, "tombstone_satellite")
    }

    pub fn upsert_group<G: AttributeGroup>(
        &mut self,
        ctx: &TenantContext,
        owner: &EntityRef,
        group: &G,
        source_tag: &SourceTag,
    ) -> Result<VersionOutcome> {
        let satellite_kind = G::satellite_kind()?;
        let payload = serde_json::to_value(group)?;
        self.upsert_satellite(ctx, owner, &satellite_kind, &payload, source_tag)
    }

    fn write_version(
        &mut self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
        payload: &CanonicalPayload,
        source_tag: &SourceTag,
        operation: &'static str,
    ) -> Result<VersionOutcome> {
        guard::require_owner(&self.conn, ctx, owner, operation)?;

        // Unchanged payloads never take the write lock.
        if let Some(open) = load_open_row(&self.conn, owner, satellite_kind)? {
            ctx.ensure_same_tenant(&open.tenant_id, operation)?;
            if let Some(version) = unchanged_version(&open, payload, owner, satellite_kind)? {
                debug!(
                    owner = %owner,
                    satellite_kind = %satellite_kind,
                    version_seq = version.version_seq,
                    "payload unchanged"
                );
                return Ok(VersionOutcome::Unchanged(version));
            }
        }

        let outcome = with_write_retry(
            &mut self.conn,
            self.config.max_write_retries,
            operation,
            |tx| apply_transition(tx, ctx, owner, satellite_kind, payload, source_tag, operation),
        )?;

        if let VersionOutcome::NewVersion(version) = &outcome {
            debug!(
                owner = %owner,
                satellite_kind = %satellite_kind,
                version_seq = version.version_seq,
                version_id = %version.version_id,
                actor = ctx.actor(),
                source_tag = %source_tag,
                "satellite version opened"
            );
        }
        Ok(outcome)
    }
}

/// One attempt at the close-then-open transition.
///
/// The close is a compare-and-swap on `version_seq`: if another writer moved
/// the open row since it was read, no row changes and the attempt conflicts.
fn apply_transition(
    tx: &Transaction<'_>,
    ctx: &TenantContext,
    owner: &EntityRef,
    satellite_kind: &SatelliteKind,
    payload: &CanonicalPayload,
    source_tag: &SourceTag,
    operation: &'static str,
) -> Result<Attempt<VersionOutcome>> {
    let open = load_open_row(tx, owner, satellite_kind)?;
    let owner_hex = owner.key().to_hex();

    let version_seq = match &open {
        Some(open) => {
            ctx.ensure_same_tenant(&open.tenant_id, operation)?;
            if let Some(version) = unchanged_version(open, payload, owner, satellite_kind)? {
                return Ok(Attempt::Done(VersionOutcome::Unchanged(version)));
            }
            open.version_seq
                .checked_add(1)
                .ok_or_else(|| StoreError::Corrupt("version_seq overflow".to_string()))?
        }
        None => next_seq_without_open_row(tx, &owner_hex, satellite_kind)?,
    };

    let tx_at = next_tx_micros(tx)?;

    if let Some(open) = &open {
        let closed = tx.execute(
            "UPDATE satellites
             SET version_end_us = ?1
             WHERE owner_key = ?2
               AND satellite_kind = ?3
               AND version_seq = ?4
               AND version_end_us IS NULL",
            params![tx_at, owner_hex, satellite_kind.as_str(), open.version_seq],
        )?;
        if closed != 1 {
            return Ok(Attempt::Conflict);
        }
    }

    let version_id = Ulid::new();
    tx.execute(
        "INSERT INTO satellites(
            owner_key, owner_kind, tenant_id, satellite_kind, version_seq, version_id,
            version_start_us, version_end_us, content_digest, is_tombstone, payload_json,
            source_tag, erased_us
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, ?10, ?11, NULL)",
        params![
            owner_hex,
            owner.owner_kind().as_str(),
            ctx.tenant_id().as_str(),
            satellite_kind.as_str(),
            version_seq,
            version_id.to_string(),
            tx_at,
            payload.digest(),
            i64::from(payload.is_tombstone()),
            payload.canonical(),
            source_tag.as_str(),
        ],
    )?;

    Ok(Attempt::Done(VersionOutcome::NewVersion(SatelliteVersion {
        version_id,
        version_seq,
        version_start: micros_to_datetime(6, tx_at)?,
        content_digest: payload.digest().to_string(),
    })))
}

/// Sequence for the first version of a timeline. Timelines never lose their
/// open row once created, so this is normally 1.
fn next_seq_without_open_row(
    tx: &Transaction<'_>,
    owner_hex: &str,
    satellite_kind: &SatelliteKind,
) -> Result<u32> {
    let max_seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version_seq), 0)
         FROM satellites
         WHERE owner_key = ?1 AND satellite_kind = ?2",
        params![owner_hex, satellite_kind.as_str()],
        |row| row.get(0),
    )?;
    u32::try_from(max_seq + 1)
        .map_err(|_| StoreError::Corrupt(format!("invalid version_seq: {max_seq}")))
}

/// `Some` when `open` already carries `payload`.
///
/// A digest match with a different stored payload is reported as a fatal
/// collision instead of silently dropping the write.
fn unchanged_version(
    open: &StoredSatellite,
    payload: &CanonicalPayload,
    owner: &EntityRef,
    satellite_kind: &SatelliteKind,
) -> Result<Option<SatelliteVersion>> {
    if open.content_digest != payload.digest() {
        return Ok(None);
    }

    if open.payload_json.as_deref() != payload.canonical() {
        error!(
            target: SECURITY_TARGET,
            owner = %owner,
            satellite_kind = %satellite_kind,
            version_id = %open.version_id,
            "content digest collision"
        );
        return Err(VaultError::DigestCollision {
            owner: owner.to_string(),
            kind: satellite_kind.to_string(),
        }
        .into());
    }

    open.version().map(Some)
}
