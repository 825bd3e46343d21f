use rusqlite::{params, Connection, OptionalExtension};
use vault_kernel_core::{EntityRef, OwnerKind, TenantContext, TenantId, VaultError};

use crate::{Result, StoreError};

pub(crate) enum OwnerAccess {
    Authorized,
    Missing,
}

/// Tenant of the hub or link a satellite hangs off, if the entity exists.
pub(crate) fn owner_tenant(conn: &Connection, owner: &EntityRef) -> Result<Option<TenantId>> {
    let sql = match owner.owner_kind() {
        OwnerKind::Hub => "SELECT tenant_id FROM hubs WHERE hub_key = ?1",
        OwnerKind::Link => "SELECT tenant_id FROM links WHERE link_key = ?1",
    };

    let raw: Option<String> = conn
        .query_row(sql, params![owner.key().to_hex()], |row| row.get(0))
        .optional()?;

    raw.map(|value| {
        TenantId::new(value)
            .map_err(|err| StoreError::Corrupt(format!("invalid stored tenant_id: {err}")))
    })
    .transpose()
}

/// Resolves `owner` and rejects it when it belongs to another tenant.
///
/// A missing owner is not an error here; readers turn it into `None` and
/// writers into [`VaultError::UnknownEntity`] via [`require_owner`].
pub(crate) fn authorize_owner(
    conn: &Connection,
    ctx: &TenantContext,
    owner: &EntityRef,
    operation: &'static str,
) -> Result<OwnerAccess> {
    match owner_tenant(conn, owner)? {
        None => Ok(OwnerAccess::Missing),
        Some(tenant) => {
            ctx.ensure_same_tenant(&tenant, operation)?;
            Ok(OwnerAccess::Authorized)
        }
    }
}

pub(crate) fn require_owner(
    conn: &Connection,
    ctx: &TenantContext,
    owner: &EntityRef,
    operation: &'static str,
) -> Result<()> {
    match authorize_owner(conn, ctx, owner, operation)? {
        OwnerAccess::Authorized => Ok(()),
        OwnerAccess::Missing => Err(VaultError::UnknownEntity {
            entity: owner.to_string(),
        }
        .into()),
    }
}
