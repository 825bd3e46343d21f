use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;
use vault_kernel_core::{
    from_unix_micros, to_unix_micros, AttributeGroup, EntityRef, SatelliteKind, SatelliteRecord, TenantContext,
};

use crate::guard::{self, OwnerAccess};
use crate::satellite::{load_open_row, parse_satellite_row, StoredSatellite, SATELLITE_COLUMNS};
use crate::{collect_rows, Result, SqliteVaultStore};

impl SqliteVaultStore {
    /// The open version, if the attribute group was ever written.
    pub fn get_current(
        &self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
    ) -> Result<Option<SatelliteRecord>> {
        if let OwnerAccess::Missing = guard::authorize_owner(&self.conn, ctx, owner, "get_current")? {
            return Ok(None);
        }

        let row = load_open_row(&self.conn, owner, satellite_kind)?;
        checked_record(ctx, row, "get_current")
    }

    /// The version valid at `at`: `version_start <= at < version_end`.
    ///
    /// `None` before the first version. A tombstone valid at `at` is returned
    /// as a record, not as `None`.
    pub fn get_as_of(
        &self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
        at: OffsetDateTime,
    ) -> Result<Option<SatelliteRecord>> {
        if let OwnerAccess::Missing = guard::authorize_owner(&self.conn, ctx, owner, "get_as_of")? {
            return Ok(None);
        }

        let at_us = to_unix_micros(at)?;
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SATELLITE_COLUMNS}
                     FROM satellites
                     WHERE owner_key = ?1 AND satellite_kind = ?2 AND version_start_us <= ?3
                     ORDER BY version_start_us DESC
                     LIMIT 1"
                ),
                params![owner.key().to_hex(), satellite_kind.as_str(), at_us],
                parse_satellite_row,
            )
            .optional()?;

        let floor = from_unix_micros(at_us)?;
        let record = checked_record(ctx, row, "get_as_of")?;
        Ok(record.filter(|record| record.contains(floor)))
    }

    /// Every version of the attribute group, oldest first.
    pub fn history(
        &self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
    ) -> Result<Vec<SatelliteRecord>> {
        if let OwnerAccess::Missing = guard::authorize_owner(&self.conn, ctx, owner, "history")? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SATELLITE_COLUMNS}
             FROM satellites
             WHERE owner_key = ?1 AND satellite_kind = ?2
             ORDER BY version_seq ASC"
        ))?;
        let rows = stmt.query_map(
            params![owner.key().to_hex(), satellite_kind.as_str()],
            parse_satellite_row,
        )?;

        let mut records = Vec::new();
        for row in collect_rows(rows)? {
            ctx.ensure_same_tenant(&row.tenant_id, "history")?;
            records.push(row.into_record()?);
        }
        Ok(records)
    }

    /// Current value of a typed group. Tombstoned groups read as `None`.
    pub fn current_group<G: AttributeGroup>(
        &self,
        ctx: &TenantContext,
        owner: &EntityRef,
    ) -> Result<Option<G>> {
        let record = self.get_current(ctx, owner, &G::satellite_kind()?)?;
        decode_group(record.as_ref())
    }

    pub fn group_as_of<G: AttributeGroup>(
        &self,
        ctx: &TenantContext,
        owner: &EntityRef,
        at: OffsetDateTime,
    ) -> Result<Option<G>> {
        let record = self.get_as_of(ctx, owner, &G::satellite_kind()?, at)?;
        decode_group(record.as_ref())
    }
}

fn checked_record(
    ctx: &TenantContext,
    row: Option<StoredSatellite>,
    operation: &'static str,
) -> Result<Option<SatelliteRecord>> {
    let Some(row) = row else {
        return Ok(None);
    };
    ctx.ensure_same_tenant(&row.tenant_id, operation)?;
    row.into_record().map(Some)
}

fn decode_group<G: AttributeGroup>(record: Option<&SatelliteRecord>) -> Result<Option<G>> {
    match record {
        Some(record) => Ok(record.decode()?),
        None => Ok(None),
    }
}
