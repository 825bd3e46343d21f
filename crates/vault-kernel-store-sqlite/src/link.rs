use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info};
use vault_kernel_core::{
    canonical_participants, derive_link_key, EntityRef, HubKey, LinkKey, LinkRecord, SourceTag,
    TenantContext, VaultError, SECURITY_TARGET,
};

use crate::guard::{self, OwnerAccess};
use crate::{
    collect_rows, key_column, micros_to_datetime, next_tx_micros, source_tag_column,
    tenant_column, with_write_retry, Attempt, Result, SqliteVaultStore, StoreError,
};

impl SqliteVaultStore {
    /// Returns the link joining `hub_keys`, creating it on first sight.
    ///
    /// Argument order and duplicates do not affect the key. Every participant
    /// must be an existing hub of the caller's tenant.
    pub fn get_or_create_link(
        &mut self,
        ctx: &TenantContext,
        hub_keys: &[HubKey],
        source_tag: &SourceTag,
    ) -> Result<LinkKey> {
        let participants = canonical_participants(hub_keys)?;
        for hub_key in &participants {
            guard::require_owner(
                &self.conn,
                ctx,
                &EntityRef::Hub(*hub_key),
                "get_or_create_link",
            )?;
        }

        let link_key = derive_link_key(&participants, ctx.tenant_id(), self.salt())?;
        if let Some(existing) = load_link(&self.conn, &link_key)? {
            verify_link_identity(&existing, ctx, &participants)?;
            return Ok(link_key);
        }

        let participant_count = i64::try_from(participants.len())
            .map_err(|_| VaultError::Validation("too many link participants".to_string()))?;
        let key_hex = link_key.to_string();
        let tenant = ctx.tenant_id().as_str();
        let (stored, created) = with_write_retry(
            &mut self.conn,
            self.config.max_write_retries,
            "get_or_create_link",
            |tx| {
                let created_us = next_tx_micros(tx)?;
                let inserted = tx.execute(
                    "INSERT INTO links(link_key, tenant_id, participant_count, created_us, source_tag)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT DO NOTHING",
                    params![key_hex, tenant, participant_count, created_us, source_tag.as_str()],
                )?;

                if inserted == 1 {
                    let mut stmt = tx.prepare(
                        "INSERT INTO link_participants(link_key, position, hub_key, tenant_id)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (position, hub_key) in (0_i64..).zip(&participants) {
                        stmt.execute(params![key_hex, position, hub_key.to_string(), tenant])?;
                    }
                }

                let stored = load_link(tx, &link_key)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("link {link_key} missing after insert"))
                })?;
                Ok(Attempt::Done((stored, inserted == 1)))
            },
        )?;

        verify_link_identity(&stored, ctx, &participants)?;
        if created {
            info!(
                link_key = %link_key,
                participants = participants.len(),
                actor = ctx.actor(),
                source_tag = %source_tag,
                "link created"
            );
        }
        Ok(link_key)
    }

    pub fn link_exists(&self, ctx: &TenantContext, link_key: &LinkKey) -> Result<bool> {
        let owner = EntityRef::Link(*link_key);
        match guard::authorize_owner(&self.conn, ctx, &owner, "link_exists")? {
            OwnerAccess::Authorized => Ok(true),
            OwnerAccess::Missing => Ok(false),
        }
    }

    pub fn get_link(&self, ctx: &TenantContext, link_key: &LinkKey) -> Result<Option<LinkRecord>> {
        let Some(record) = load_link(&self.conn, link_key)? else {
            return Ok(None);
        };
        ctx.ensure_same_tenant(&record.tenant_id, "get_link")?;
        Ok(Some(record))
    }

    /// Links the hub participates in, ordered by link key.
    pub fn links_for_hub(&self, ctx: &TenantContext, hub_key: &HubKey) -> Result<Vec<LinkKey>> {
        let owner = EntityRef::Hub(*hub_key);
        if let OwnerAccess::Missing =
            guard::authorize_owner(&self.conn, ctx, &owner, "links_for_hub")?
        {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT link_key
             FROM link_participants
             WHERE tenant_id = ?1 AND hub_key = ?2
             ORDER BY link_key ASC",
        )?;
        let rows = stmt.query_map(
            params![ctx.tenant_id().as_str(), hub_key.to_string()],
            |row| key_column(row, 0).map(LinkKey),
        )?;
        collect_rows(rows)
    }
}

pub(crate) fn load_link(conn: &Connection, link_key: &LinkKey) -> Result<Option<LinkRecord>> {
    let header = conn
        .query_row(
            "SELECT link_key, tenant_id, participant_count, created_us, source_tag
             FROM links
             WHERE link_key = ?1",
            params![link_key.to_string()],
            |row| {
                Ok((
                    LinkKey(key_column(row, 0)?),
                    tenant_column(row, 1)?,
                    row.get::<_, i64>(2)?,
                    micros_to_datetime(3, row.get(3)?)?,
                    source_tag_column(row, 4)?,
                ))
            },
        )
        .optional()?;

    let Some((link_key, tenant_id, participant_count, created_at, source_tag)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT hub_key
         FROM link_participants
         WHERE link_key = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![link_key.to_string()], |row| {
        key_column(row, 0).map(HubKey)
    })?;
    let participants = collect_rows(rows)?;

    if i64::try_from(participants.len()).ok() != Some(participant_count) {
        return Err(StoreError::Corrupt(format!(
            "link {link_key} records {participant_count} participants but has {}",
            participants.len()
        )));
    }

    Ok(Some(LinkRecord {
        link_key,
        tenant_id,
        participants,
        created_at,
        source_tag,
    }))
}

fn verify_link_identity(
    stored: &LinkRecord,
    ctx: &TenantContext,
    participants: &[HubKey],
) -> Result<()> {
    if &stored.tenant_id == ctx.tenant_id() && stored.participants == participants {
        return Ok(());
    }

    error!(
        target: SECURITY_TARGET,
        link_key = %stored.link_key,
        "link key collision: stored participants do not match derived inputs"
    );
    Err(VaultError::KeyCollision {
        key: stored.link_key.to_string(),
    }
    .into())
}
