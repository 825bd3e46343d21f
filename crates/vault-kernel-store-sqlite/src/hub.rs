use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info};
use vault_kernel_core::{
    derive_hub_key, validate_business_key, EntityRef, HubKey, HubRecord, SourceTag,
    TenantContext, VaultError, SECURITY_TARGET,
};

use crate::guard::{self, OwnerAccess};
use crate::{
    key_column, micros_to_datetime, next_tx_micros, source_tag_column, tenant_column,
    with_write_retry, Attempt, Result, SqliteVaultStore,
};

impl SqliteVaultStore {
    /// Key a business identifier would receive in the caller's tenant under
    /// this store's salt. Does not touch the database.
    #[must_use]
    pub fn hub_key_for(&self, ctx: &TenantContext, business_key: &str) -> HubKey {
        derive_hub_key(business_key, ctx.tenant_id(), self.salt())
    }

    /// Returns the hub for `business_key`, creating it on first sight.
    ///
    /// Concurrent duplicate calls converge on one row. An existing row is never
    /// updated; its `first_seen_at` and `source_tag` record the first writer.
    pub fn get_or_create_hub(
        &mut self,
        ctx: &TenantContext,
        business_key: &str,
        source_tag: &SourceTag,
    ) -> Result<HubKey> {
        validate_business_key(business_key)?;
        let hub_key = self.hub_key_for(ctx, business_key);

        if let Some(existing) = load_hub(&self.conn, &hub_key)? {
            verify_hub_identity(&existing, ctx, business_key)?;
            return Ok(hub_key);
        }

        let key_hex = hub_key.to_string();
        let tenant = ctx.tenant_id().as_str();
        let (stored, created) = with_write_retry(
            &mut self.conn,
            self.config.max_write_retries,
            "get_or_create_hub",
            |tx| {
                let first_seen_us = next_tx_micros(tx)?;
                let inserted = tx.execute(
                    "INSERT INTO hubs(hub_key, business_key, tenant_id, first_seen_us, source_tag)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT DO NOTHING",
                    params![key_hex, business_key, tenant, first_seen_us, source_tag.as_str()],
                )?;

                let Some(stored) = load_hub(tx, &hub_key)? else {
                    // (business_key, tenant_id) is held by a row under another key.
                    return Err(collision(&hub_key));
                };
                Ok(Attempt::Done((stored, inserted == 1)))
            },
        )?;

        verify_hub_identity(&stored, ctx, business_key)?;
        if created {
            info!(
                hub_key = %hub_key,
                actor = ctx.actor(),
                source_tag = %source_tag,
                "hub created"
            );
        }
        Ok(hub_key)
    }

    /// `false` only when no hub has this key. A hub owned by another tenant
    /// is an isolation violation, not an absent hub.
    pub fn hub_exists(&self, ctx: &TenantContext, hub_key: &HubKey) -> Result<bool> {
        let owner = EntityRef::Hub(*hub_key);
        match guard::authorize_owner(&self.conn, ctx, &owner, "hub_exists")? {
            OwnerAccess::Authorized => Ok(true),
            OwnerAccess::Missing => Ok(false),
        }
    }

    pub fn get_hub(&self, ctx: &TenantContext, hub_key: &HubKey) -> Result<Option<HubRecord>> {
        let Some(record) = load_hub(&self.conn, hub_key)? else {
            return Ok(None);
        };
        ctx.ensure_same_tenant(&record.tenant_id, "get_hub")?;
        Ok(Some(record))
    }
}

pub(crate) fn load_hub(conn: &Connection, hub_key: &HubKey) -> Result<Option<HubRecord>> {
    let record = conn
        .query_row(
            "SELECT hub_key, business_key, tenant_id, first_seen_us, source_tag
             FROM hubs
             WHERE hub_key = ?1",
            params![hub_key.to_string()],
            parse_hub_row,
        )
        .optional()?;
    Ok(record)
}

pub(crate) fn parse_hub_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HubRecord> {
    Ok(HubRecord {
        hub_key: HubKey(key_column(row, 0)?),
        business_key: row.get(1)?,
        tenant_id: tenant_column(row, 2)?,
        first_seen_at: micros_to_datetime(3, row.get(3)?)?,
        source_tag: source_tag_column(row, 4)?,
    })
}

fn verify_hub_identity(stored: &HubRecord, ctx: &TenantContext, business_key: &str) -> Result<()> {
    if stored.business_key == business_key && &stored.tenant_id == ctx.tenant_id() {
        return Ok(());
    }
    Err(collision(&stored.hub_key))
}

fn collision(hub_key: &HubKey) -> crate::StoreError {
    error!(
        target: SECURITY_TARGET,
        hub_key = %hub_key,
        "hub key collision: stored identity does not match derived inputs"
    );
    VaultError::KeyCollision {
        key: hub_key.to_string(),
    }
    .into()
}
