use rusqlite::types::Type;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;
use ulid::Ulid;
use vault_kernel_core::{
    tombstone_digest, EntityRef, OwnerKind, SatelliteKind, TenantContext, TenantId, VaultError,
    SECURITY_TARGET,
};

use crate::{
    collect_rows, guard, invalid_data, key_column, micros_to_datetime, next_tx_micros,
    tenant_column, with_write_retry, Attempt, Result, SqliteVaultStore, StoreError,
};

/// Out-of-band authorization for erasing one attribute group's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErasureRequest {
    pub authorized_by: String,
    pub reason: String,
}

impl ErasureRequest {
    fn validate(&self) -> Result<(), VaultError> {
        if self.authorized_by.trim().is_empty() {
            return Err(VaultError::Validation(
                "authorized_by MUST be provided for erasure".to_string(),
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(VaultError::Validation(
                "reason MUST be provided for erasure".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErasureReport {
    pub erasure_id: Ulid,
    pub owner: EntityRef,
    pub satellite_kind: SatelliteKind,
    pub rows_erased: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub erased_at: OffsetDateTime,
}

/// Audit row for one run of the erasure procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErasureGrant {
    pub erasure_id: Ulid,
    pub tenant_id: TenantId,
    pub owner: EntityRef,
    pub satellite_kind: SatelliteKind,
    pub authorized_by: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub consumed_at: Option<OffsetDateTime>,
    pub rows_erased: Option<u64>,
}

impl SqliteVaultStore {
    /// Anonymizes every historical version of (`owner`, `satellite_kind`).
    ///
    /// Payloads are dropped and digests replaced by the tombstone digest.
    /// Version boundaries, sequence numbers and provenance stay intact, so
    /// point-in-time reads keep resolving to the same version, now a tombstone.
    /// Already erased versions are left untouched.
    pub fn erase_satellite(
        &mut self,
        ctx: &TenantContext,
        owner: &EntityRef,
        satellite_kind: &SatelliteKind,
        request: &ErasureRequest,
    ) -> Result<ErasureReport> {
        request.validate()?;
        guard::require_owner(&self.conn, ctx, owner, "erase_satellite")?;

        let owner_hex = owner.key().to_hex();
        let tenant = ctx.tenant_id().as_str();
        let tombstone = tombstone_digest();

        let report = with_write_retry(
            &mut self.conn,
            self.config.max_write_retries,
            "erase_satellite",
            |tx| {
                let erased_us = next_tx_micros(tx)?;
                let erasure_id = Ulid::new();

                tx.execute(
                    "INSERT INTO erasure_grants(
                        erasure_id, tenant_id, owner_key, owner_kind, satellite_kind,
                        authorized_by, reason, granted_us, consumed_us, rows_erased
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL)",
                    params![
                        erasure_id.to_string(),
                        tenant,
                        owner_hex,
                        owner.owner_kind().as_str(),
                        satellite_kind.as_str(),
                        request.authorized_by,
                        request.reason,
                        erased_us,
                    ],
                )?;

                let rows_erased = tx.execute(
                    "UPDATE satellites
                     SET is_tombstone = 1,
                         payload_json = NULL,
                         content_digest = ?1,
                         erased_us = ?2
                     WHERE owner_key = ?3
                       AND satellite_kind = ?4
                       AND tenant_id = ?5
                       AND erased_us IS NULL",
                    params![tombstone, erased_us, owner_hex, satellite_kind.as_str(), tenant],
                )?;
                let rows_erased = u64::try_from(rows_erased)
                    .map_err(|_| StoreError::Corrupt("erased row count overflow".to_string()))?;
                let rows_erased_sql = i64::try_from(rows_erased)
                    .map_err(|_| StoreError::Corrupt("erased row count overflow".to_string()))?;

                tx.execute(
                    "UPDATE erasure_grants
                     SET consumed_us = ?1, rows_erased = ?2
                     WHERE erasure_id = ?3",
                    params![erased_us, rows_erased_sql, erasure_id.to_string()],
                )?;

                Ok(Attempt::Done(ErasureReport {
                    erasure_id,
                    owner: *owner,
                    satellite_kind: satellite_kind.clone(),
                    rows_erased,
                    erased_at: micros_to_datetime(7, erased_us)?,
                }))
            },
        )?;

        warn!(
            target: SECURITY_TARGET,
            erasure_id = %report.erasure_id,
            owner = %owner,
            satellite_kind = %satellite_kind,
            authorized_by = %request.authorized_by,
            actor = ctx.actor(),
            rows_erased = report.rows_erased,
            "satellite history erased"
        );
        Ok(report)
    }

    /// Erasure grants of the caller's tenant, oldest first.
    pub fn erasure_log(&self, ctx: &TenantContext) -> Result<Vec<ErasureGrant>> {
        let mut stmt = self.conn.prepare(
            "SELECT erasure_id, tenant_id, owner_key, owner_kind, satellite_kind,
                    authorized_by, reason, granted_us, consumed_us, rows_erased
             FROM erasure_grants
             WHERE tenant_id = ?1
             ORDER BY granted_us ASC, erasure_id ASC",
        )?;
        let rows = stmt.query_map(params![ctx.tenant_id().as_str()], parse_grant_row)?;

        let grants = collect_rows(rows)?;
        for grant in &grants {
            ctx.ensure_same_tenant(&grant.tenant_id, "erasure_log")?;
        }
        Ok(grants)
    }
}

fn parse_grant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErasureGrant> {
    let erasure_id_raw: String = row.get(0)?;
    let erasure_id = Ulid::from_string(&erasure_id_raw).map_err(|err| {
        invalid_data(0, Type::Text, format!("invalid erasure_id {erasure_id_raw}: {err}"))
    })?;

    let owner_kind_raw: String = row.get(3)?;
    let owner_kind = OwnerKind::parse(&owner_kind_raw).ok_or_else(|| {
        invalid_data(3, Type::Text, format!("invalid owner_kind: {owner_kind_raw}"))
    })?;

    let satellite_kind_raw: String = row.get(4)?;
    let satellite_kind = SatelliteKind::new(satellite_kind_raw)
        .map_err(|err| invalid_data(4, Type::Text, err.to_string()))?;

    let consumed_us: Option<i64> = row.get(8)?;
    let rows_erased: Option<i64> = row.get(9)?;
    let rows_erased = rows_erased
        .map(|value| {
            u64::try_from(value).map_err(|_| {
                invalid_data(9, Type::Integer, format!("invalid rows_erased: {value}"))
            })
        })
        .transpose()?;

    Ok(ErasureGrant {
        erasure_id,
        tenant_id: tenant_column(row, 1)?,
        owner: EntityRef::from_parts(owner_kind, key_column(row, 2)?),
        satellite_kind,
        authorized_by: row.get(5)?,
        reason: row.get(6)?,
        granted_at: micros_to_datetime(7, row.get(7)?)?,
        consumed_at: consumed_us
            .map(|micros| micros_to_datetime(8, micros))
            .transpose()?,
        rows_erased,
    })
}
