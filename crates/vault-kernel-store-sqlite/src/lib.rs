#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! `SQLite` implementation of the vault kernel: hubs, links, versioned
//! satellites, point-in-time reads, and tenant isolation.
//!
//! Every table is append-only at the schema level. The only permitted row
//! mutations are closing an open satellite version once, and the authorized
//! erasure procedure in [`SqliteVaultStore::erase_satellite`].

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use vault_kernel_core::{
    format_rfc3339, from_unix_micros, now_utc, to_unix_micros, EngineConfig, Key, SourceTag,
    TenantId, VaultError,
};

mod erasure;
mod error;
mod guard;
mod hub;
mod integrity;
mod link;
mod reader;
mod satellite;

pub use erasure::{ErasureGrant, ErasureReport, ErasureRequest};
pub use error::StoreError;
pub use integrity::{IntegrityCounts, IntegrityIssue, IntegrityIssueSeverity, IntegrityReport};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

const VAULT_MIGRATION_VERSION: i64 = 1;
const META_CLOCK_KEY: &str = "clock.last_tx_us";
const META_SALT_KEY: &str = "keys.salt_fingerprint";

const SCHEMA_VAULT_V1: &str = r"
CREATE TABLE IF NOT EXISTS vault_meta (
  meta_key TEXT PRIMARY KEY,
  meta_value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hubs (
  hub_key TEXT PRIMARY KEY CHECK (length(hub_key) = 64),
  business_key TEXT NOT NULL,
  tenant_id TEXT NOT NULL,
  first_seen_us INTEGER NOT NULL,
  source_tag TEXT NOT NULL,
  UNIQUE (business_key, tenant_id),
  UNIQUE (hub_key, tenant_id)
);

CREATE TRIGGER IF NOT EXISTS trg_hubs_no_update
BEFORE UPDATE ON hubs
BEGIN
  SELECT RAISE(FAIL, 'hubs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_hubs_no_delete
BEFORE DELETE ON hubs
BEGIN
  SELECT RAISE(FAIL, 'hubs is append-only');
END;

CREATE TABLE IF NOT EXISTS links (
  link_key TEXT PRIMARY KEY CHECK (length(link_key) = 64),
  tenant_id TEXT NOT NULL,
  participant_count INTEGER NOT NULL CHECK (participant_count >= 2),
  created_us INTEGER NOT NULL,
  source_tag TEXT NOT NULL,
  UNIQUE (link_key, tenant_id)
);

CREATE TABLE IF NOT EXISTS link_participants (
  link_key TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  hub_key TEXT NOT NULL,
  tenant_id TEXT NOT NULL,
  PRIMARY KEY (link_key, position),
  UNIQUE (link_key, hub_key),
  FOREIGN KEY (link_key, tenant_id) REFERENCES links(link_key, tenant_id),
  FOREIGN KEY (hub_key, tenant_id) REFERENCES hubs(hub_key, tenant_id)
);

CREATE INDEX IF NOT EXISTS idx_link_participants_hub
  ON link_participants(tenant_id, hub_key, link_key);

CREATE TRIGGER IF NOT EXISTS trg_links_no_update
BEFORE UPDATE ON links
BEGIN
  SELECT RAISE(FAIL, 'links is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_links_no_delete
BEFORE DELETE ON links
BEGIN
  SELECT RAISE(FAIL, 'links is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_link_participants_no_update
BEFORE UPDATE ON link_participants
BEGIN
  SELECT RAISE(FAIL, 'link_participants is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_link_participants_no_delete
BEFORE DELETE ON link_participants
BEGIN
  SELECT RAISE(FAIL, 'link_participants is append-only');
END;

CREATE TABLE IF NOT EXISTS satellites (
  owner_key TEXT NOT NULL,
  owner_kind TEXT NOT NULL CHECK (owner_kind IN ('hub', 'link')),
  tenant_id TEXT NOT NULL,
  satellite_kind TEXT NOT NULL,
  version_seq INTEGER NOT NULL CHECK (version_seq >= 1),
  version_id TEXT NOT NULL UNIQUE,
  version_start_us INTEGER NOT NULL,
  version_end_us INTEGER CHECK (version_end_us IS NULL OR version_end_us > version_start_us),
  content_digest TEXT NOT NULL,
  is_tombstone INTEGER NOT NULL DEFAULT 0 CHECK (is_tombstone IN (0, 1)),
  payload_json TEXT,
  source_tag TEXT NOT NULL,
  erased_us INTEGER,
  PRIMARY KEY (owner_key, satellite_kind, version_start_us),
  UNIQUE (owner_key, satellite_kind, version_seq),
  CHECK ((is_tombstone = 1 AND payload_json IS NULL) OR (is_tombstone = 0 AND payload_json IS NOT NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_satellites_open
  ON satellites(owner_key, satellite_kind)
  WHERE version_end_us IS NULL;

CREATE INDEX IF NOT EXISTS idx_satellites_as_of
  ON satellites(owner_key, satellite_kind, version_start_us DESC);

CREATE INDEX IF NOT EXISTS idx_satellites_tenant
  ON satellites(tenant_id, owner_key, satellite_kind);

CREATE TRIGGER IF NOT EXISTS trg_satellites_owner_tenant
BEFORE INSERT ON satellites
WHEN (NEW.owner_kind = 'hub' AND NOT EXISTS (
        SELECT 1 FROM hubs WHERE hub_key = NEW.owner_key AND tenant_id = NEW.tenant_id))
  OR (NEW.owner_kind = 'link' AND NOT EXISTS (
        SELECT 1 FROM links WHERE link_key = NEW.owner_key AND tenant_id = NEW.tenant_id))
BEGIN
  SELECT RAISE(ABORT, 'satellite owner must exist in the same tenant');
END;

CREATE TABLE IF NOT EXISTS erasure_grants (
  erasure_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  owner_key TEXT NOT NULL,
  owner_kind TEXT NOT NULL CHECK (owner_kind IN ('hub', 'link')),
  satellite_kind TEXT NOT NULL,
  authorized_by TEXT NOT NULL,
  reason TEXT NOT NULL,
  granted_us INTEGER NOT NULL,
  consumed_us INTEGER,
  rows_erased INTEGER
);

CREATE INDEX IF NOT EXISTS idx_erasure_grants_tenant
  ON erasure_grants(tenant_id, granted_us);

CREATE TRIGGER IF NOT EXISTS trg_erasure_grants_consume_once
BEFORE UPDATE ON erasure_grants
WHEN OLD.consumed_us IS NOT NULL
  OR NEW.consumed_us IS NULL
  OR NEW.erasure_id != OLD.erasure_id
  OR NEW.tenant_id != OLD.tenant_id
  OR NEW.owner_key != OLD.owner_key
  OR NEW.owner_kind != OLD.owner_kind
  OR NEW.satellite_kind != OLD.satellite_kind
  OR NEW.authorized_by != OLD.authorized_by
  OR NEW.reason != OLD.reason
  OR NEW.granted_us != OLD.granted_us
BEGIN
  SELECT RAISE(FAIL, 'erasure_grants may only be consumed once');
END;

CREATE TRIGGER IF NOT EXISTS trg_erasure_grants_no_delete
BEFORE DELETE ON erasure_grants
BEGIN
  SELECT RAISE(FAIL, 'erasure_grants is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_satellites_guard_update
BEFORE UPDATE ON satellites
WHEN NOT (
  NEW.owner_key = OLD.owner_key
  AND NEW.owner_kind = OLD.owner_kind
  AND NEW.tenant_id = OLD.tenant_id
  AND NEW.satellite_kind = OLD.satellite_kind
  AND NEW.version_seq = OLD.version_seq
  AND NEW.version_id = OLD.version_id
  AND NEW.version_start_us = OLD.version_start_us
  AND NEW.source_tag = OLD.source_tag
  AND (
    (OLD.version_end_us IS NULL
      AND NEW.version_end_us IS NOT NULL
      AND NEW.content_digest = OLD.content_digest
      AND NEW.is_tombstone = OLD.is_tombstone
      AND NEW.payload_json IS OLD.payload_json
      AND NEW.erased_us IS OLD.erased_us)
    OR
    (NEW.version_end_us IS OLD.version_end_us
      AND OLD.erased_us IS NULL
      AND NEW.erased_us IS NOT NULL
      AND NEW.is_tombstone = 1
      AND NEW.payload_json IS NULL
      AND EXISTS (
        SELECT 1 FROM erasure_grants g
        WHERE g.owner_key = OLD.owner_key
          AND g.satellite_kind = OLD.satellite_kind
          AND g.tenant_id = OLD.tenant_id
          AND g.consumed_us IS NULL))
  )
)
BEGIN
  SELECT RAISE(FAIL, 'satellites is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_satellites_no_delete
BEFORE DELETE ON satellites
BEGIN
  SELECT RAISE(FAIL, 'satellites is append-only');
END;
";

/// Handle onto one vault database.
///
/// A handle owns a single connection and is used from one thread at a time.
/// Concurrent callers open their own handle on the same database file; the
/// version writer serializes them.
pub struct SqliteVaultStore {
    conn: Connection,
    config: EngineConfig,
    salt: Option<Vec<u8>>,
}

impl SqliteVaultStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let salt = config.key_salt()?;

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )?;

        Ok(Self { conn, config, salt })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        self.conn.execute_batch(SCHEMA_VAULT_V1)?;

        let now = format_rfc3339(now_utc())?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![VAULT_MIGRATION_VERSION, now],
        )?;

        self.ensure_salt_fingerprint()?;
        ensure_schema_contract(&self.conn)?;

        tracing::info!(version = VAULT_MIGRATION_VERSION, "vault schema ready");
        Ok(())
    }

    fn ensure_salt_fingerprint(&self) -> Result<()> {
        let expected = self.config.salt_fingerprint()?;
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT meta_value FROM vault_meta WHERE meta_key = ?1",
                params![META_SALT_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            None => {
                self.conn.execute(
                    "INSERT INTO vault_meta(meta_key, meta_value) VALUES (?1, ?2)",
                    params![META_SALT_KEY, expected],
                )?;
                Ok(())
            }
            Some(value) if value == expected => Ok(()),
            Some(_) => Err(VaultError::Configuration(
                "key salt does not match the salt this database was created with".to_string(),
            )
            .into()),
        }
    }

    pub(crate) fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) enum Attempt<T> {
    Done(T),
    /// The state read at the start of the attempt is stale.
    Conflict,
}

/// Runs `attempt` inside an immediate transaction, replaying it against fresh
/// state when a racing writer is detected.
pub(crate) fn with_write_retry<T>(
    conn: &mut Connection,
    max_attempts: u32,
    operation: &'static str,
    mut attempt: impl FnMut(&Transaction<'_>) -> Result<Attempt<T>>,
) -> Result<T> {
    for attempt_no in 1..=max_attempts {
        match run_attempt(conn, &mut attempt) {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Conflict) => {}
            Err(err) if err.is_write_conflict() => {}
            Err(err) => return Err(err),
        }

        tracing::warn!(
            operation,
            attempt = attempt_no,
            max_attempts,
            "write conflict, retrying against fresh state"
        );
        std::thread::sleep(Duration::from_millis(u64::from(attempt_no)));
    }

    Err(VaultError::WriteContention {
        attempts: max_attempts,
    }
    .into())
}

fn run_attempt<T>(
    conn: &mut Connection,
    attempt: &mut impl FnMut(&Transaction<'_>) -> Result<Attempt<T>>,
) -> Result<Attempt<T>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    match attempt(&tx)? {
        Attempt::Done(value) => {
            tx.commit()?;
            Ok(Attempt::Done(value))
        }
        Attempt::Conflict => Ok(Attempt::Conflict),
    }
}

/// Assigns the transaction timestamp for a write.
///
/// Strictly greater than every timestamp previously issued by this database,
/// whatever any writer's wall clock says. Must run inside the write
/// transaction so the high-water mark commits atomically with the rows.
pub(crate) fn next_tx_micros(tx: &Transaction<'_>) -> Result<i64> {
    let last: Option<String> = tx
        .query_row(
            "SELECT meta_value FROM vault_meta WHERE meta_key = ?1",
            params![META_CLOCK_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let last = match last {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| StoreError::Corrupt(format!("invalid store clock value: {raw}")))?,
        None => i64::MIN,
    };

    let wall = to_unix_micros(now_utc())?;
    let next = wall.max(last.saturating_add(1));

    tx.execute(
        "INSERT INTO vault_meta(meta_key, meta_value) VALUES (?1, ?2)
         ON CONFLICT(meta_key) DO UPDATE SET meta_value = excluded.meta_value",
        params![META_CLOCK_KEY, next.to_string()],
    )?;

    Ok(next)
}

fn ensure_schema_contract(conn: &Connection) -> Result<()> {
    for table in ["hubs", "links", "link_participants", "satellites", "erasure_grants"] {
        if !table_exists(conn, table)? {
            return Err(StoreError::Compatibility(format!(
                "expected table {table}"
            )));
        }
    }

    ensure_table_has_columns(
        conn,
        "hubs",
        &["hub_key", "business_key", "tenant_id", "first_seen_us", "source_tag"],
    )?;
    ensure_table_has_columns(
        conn,
        "satellites",
        &[
            "owner_key",
            "owner_kind",
            "tenant_id",
            "satellite_kind",
            "version_seq",
            "version_start_us",
            "version_end_us",
            "content_digest",
            "payload_json",
        ],
    )?;
    ensure_partial_unique_index(conn, "satellites", &["owner_key", "satellite_kind"])?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table_name})"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(StoreError::Compatibility(format!(
                "missing column {table_name}.{required}"
            )));
        }
    }

    Ok(())
}

/// The open-row marker: a UNIQUE index over `columns` restricted by a WHERE
/// clause.
fn ensure_partial_unique_index(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({table_name})"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        let is_partial: i64 = row.get(4)?;
        if is_unique != 1 || is_partial != 1 {
            continue;
        }

        if index_columns(conn, &index_name)? == columns {
            return Ok(());
        }
    }

    Err(StoreError::Compatibility(format!(
        "expected partial UNIQUE({}) on {table_name}",
        columns.join(", ")
    )))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_info({index_name})"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

pub(crate) fn invalid_data(column: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn key_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Key> {
    let raw: String = row.get(column)?;
    Key::from_hex(&raw)
        .map_err(|err| invalid_data(column, Type::Text, format!("invalid key {raw}: {err}")))
}

pub(crate) fn tenant_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<TenantId> {
    let raw: String = row.get(column)?;
    TenantId::new(raw).map_err(|err| invalid_data(column, Type::Text, err.to_string()))
}

pub(crate) fn source_tag_column(
    row: &rusqlite::Row<'_>,
    column: usize,
) -> rusqlite::Result<SourceTag> {
    let raw: String = row.get(column)?;
    SourceTag::new(raw).map_err(|err| invalid_data(column, Type::Text, err.to_string()))
}

pub(crate) fn micros_to_datetime(column: usize, micros: i64) -> rusqlite::Result<OffsetDateTime> {
    from_unix_micros(micros).map_err(|err| invalid_data(column, Type::Integer, err.to_string()))
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}


#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use vault_kernel_core::{
        canonical_json, document_digest, EntityRef, HubKey, SatelliteKind, SatelliteRecord,
        SatelliteValue, SatelliteVersion, TenantContext, VersionOutcome,
    };

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_vault<T>(result: Result<T, VaultError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_err<T>(result: Result<T>) -> StoreError {
        match result {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        }
    }

    fn fixture_store() -> SqliteVaultStore {
        let store = must(SqliteVaultStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn ctx(tenant: &str) -> TenantContext {
        TenantContext::new(must_vault(TenantId::new(tenant)), "tester")
    }

    fn tag() -> SourceTag {
        must_vault(SourceTag::new("crm-sync"))
    }

    fn kind(name: &str) -> SatelliteKind {
        must_vault(SatelliteKind::new(name))
    }

    fn count(store: &SqliteVaultStore, sql: &str) -> i64 {
        match store.connection().query_row(sql, [], |row| row.get(0)) {
            Ok(value) => value,
            Err(err) => panic!("count query failed: {err}"),
        }
    }

    fn new_version(outcome: VersionOutcome) -> SatelliteVersion {
        match outcome {
            VersionOutcome::NewVersion(version) => version,
            VersionOutcome::Unchanged(version) => {
                panic!("expected a new version, got unchanged seq {}", version.version_seq)
            }
        }
    }

    fn document(record: Option<SatelliteRecord>) -> Value {
        match record.map(|record| record.value) {
            Some(SatelliteValue::Document(value)) => value,
            other => panic!("expected a document, got {other:?}"),
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Profile {
        name: String,
        tier: u8,
    }

    impl vault_kernel_core::AttributeGroup for Profile {
        const KIND: &'static str = "profile";
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM schema_migrations"), 1);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM vault_meta WHERE meta_key = 'keys.salt_fingerprint'"),
            1
        );
    }

    #[test]
    fn schema_contract_requires_partial_open_index() {
        let store = fixture_store();
        if let Err(err) = store
            .connection()
            .execute_batch("DROP INDEX idx_satellites_open;")
        {
            panic!("failed to drop index: {err}");
        }

        let err = must_err(ensure_schema_contract(store.connection()));
        assert!(matches!(err, StoreError::Compatibility(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn end_to_end_profile_timeline() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let profile = kind("profile");

        let hub = must(store.get_or_create_hub(&t1, "acct-42", &tag()));
        assert_eq!(hub, derive_hub_key_for("acct-42", &t1));
        let owner = EntityRef::Hub(hub);

        let v1 = new_version(must(store.upsert_satellite(
            &t1,
            &owner,
            &profile,
            &json!({"name": "A"}),
            &tag(),
        )));
        assert_eq!(v1.version_seq, 1);

        let again = must(store.upsert_satellite(&t1, &owner, &profile, &json!({"name": "A"}), &tag()));
        assert_eq!(again, VersionOutcome::Unchanged(v1.clone()));

        let v2 = new_version(must(store.upsert_satellite(
            &t1,
            &owner,
            &profile,
            &json!({"name": "B"}),
            &tag(),
        )));
        assert_eq!(v2.version_seq, 2);
        assert!(v2.version_start > v1.version_start);

        let history = must(store.history(&t1, &owner, &profile));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_end, Some(v2.version_start));
        assert!(history[1].is_open());

        let as_of_v1 = must(store.get_as_of(&t1, &owner, &profile, v1.version_start));
        assert_eq!(document(as_of_v1), json!({"name": "A"}));

        let current = must(store.get_current(&t1, &owner, &profile));
        assert_eq!(document(current), json!({"name": "B"}));

        assert_eq!(count(&store, "SELECT COUNT(*) FROM satellites"), 2);
    }

    fn derive_hub_key_for(business_key: &str, ctx: &TenantContext) -> HubKey {
        vault_kernel_core::derive_hub_key(business_key, ctx.tenant_id(), None)
    }

    #[test]
    fn reordered_keys_are_the_same_payload() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));
        let address = kind("address");

        let first = json!({"street": "Main", "city": "Oslo", "zip": "0150"});
        let reordered = json!({"zip": "0150", "city": "Oslo", "street": "Main"});

        let _ = new_version(must(store.upsert_satellite(&t1, &owner, &address, &first, &tag())));
        let outcome = must(store.upsert_satellite(&t1, &owner, &address, &reordered, &tag()));
        assert!(!outcome.is_new_version());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM satellites"), 1);
    }

    #[test]
    fn as_of_resolves_boundaries() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));
        let status = kind("status");

        let v1 = new_version(must(store.upsert_satellite(&t1, &owner, &status, &json!("active"), &tag())));
        let v2 = new_version(must(store.upsert_satellite(&t1, &owner, &status, &json!("frozen"), &tag())));
        let one_micro = time::Duration::microseconds(1);

        let before = must(store.get_as_of(&t1, &owner, &status, v1.version_start - one_micro));
        assert!(before.is_none());

        let last_of_v1 = must(store.get_as_of(&t1, &owner, &status, v2.version_start - one_micro));
        assert_eq!(document(last_of_v1), json!("active"));

        let at_v2 = must(store.get_as_of(&t1, &owner, &status, v2.version_start));
        assert_eq!(document(at_v2), json!("frozen"));

        let far_future = v2.version_start + time::Duration::days(365);
        let latest = must(store.get_as_of(&t1, &owner, &status, far_future));
        assert_eq!(document(latest), json!("frozen"));
    }

    #[test]
    fn tombstone_is_distinct_from_absent() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));

        must(store.upsert_group(&t1, &owner, &Profile { name: "A".to_string(), tier: 1 }, &tag()));
        let tombstone = new_version(must(store.tombstone_satellite(&t1, &owner, &kind("profile"), &tag())));
        assert_eq!(tombstone.version_seq, 2);
        assert_eq!(tombstone.content_digest, vault_kernel_core::tombstone_digest());

        let again = must(store.tombstone_satellite(&t1, &owner, &kind("profile"), &tag()));
        assert!(!again.is_new_version());

        let current = match must(store.get_current(&t1, &owner, &kind("profile"))) {
            Some(record) => record,
            None => panic!("tombstone must be readable"),
        };
        assert!(current.value.is_tombstone());
        assert!(must(store.get_current(&t1, &owner, &kind("never_written"))).is_none());

        let typed: Option<Profile> = must(store.current_group(&t1, &owner));
        assert!(typed.is_none());

        let revived = new_version(must(store.upsert_group(
            &t1,
            &owner,
            &Profile { name: "B".to_string(), tier: 2 },
            &tag(),
        )));
        assert_eq!(revived.version_seq, 3);
    }

    #[test]
    fn typed_groups_read_back_at_points_in_time() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-7", &tag())));

        let gold = Profile { name: "Ada".to_string(), tier: 3 };
        let v1 = new_version(must(store.upsert_group(&t1, &owner, &gold, &tag())));
        let platinum = Profile { name: "Ada".to_string(), tier: 4 };
        must(store.upsert_group(&t1, &owner, &platinum, &tag()));

        let then: Option<Profile> = must(store.group_as_of(&t1, &owner, v1.version_start));
        assert_eq!(then, Some(gold));
        let now: Option<Profile> = must(store.current_group(&t1, &owner));
        assert_eq!(now, Some(platinum));
    }

    #[test]
    fn append_only_triggers_reject_mutation() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));
        let profile = kind("profile");
        must(store.upsert_satellite(&t1, &owner, &profile, &json!({"name": "A"}), &tag()));
        must(store.upsert_satellite(&t1, &owner, &profile, &json!({"name": "B"}), &tag()));

        let conn = store.connection();
        for sql in [
            "UPDATE hubs SET business_key = 'other'",
            "DELETE FROM hubs",
            "DELETE FROM satellites",
            "UPDATE satellites SET payload_json = '{\"name\":\"Z\"}' WHERE version_seq = 1",
            "UPDATE satellites SET version_end_us = NULL WHERE version_seq = 1",
            "UPDATE satellites SET source_tag = 'forged' WHERE version_seq = 2",
        ] {
            let err = match conn.execute(sql, []) {
                Ok(_) => panic!("statement must be rejected: {sql}"),
                Err(err) => err,
            };
            assert!(err.to_string().contains("append-only"), "{sql}: {err}");
        }
    }

    #[test]
    fn erasure_keeps_boundaries_and_consumes_grant() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-9", &tag())));
        let profile = kind("profile");

        let v1 = new_version(must(store.upsert_satellite(&t1, &owner, &profile, &json!({"ssn": "1"}), &tag())));
        let v2 = new_version(must(store.upsert_satellite(&t1, &owner, &profile, &json!({"ssn": "2"}), &tag())));

        let request = ErasureRequest {
            authorized_by: "dpo@example.com".to_string(),
            reason: "subject access request".to_string(),
        };
        let report = must(store.erase_satellite(&t1, &owner, &profile, &request));
        assert_eq!(report.rows_erased, 2);

        let history = must(store.history(&t1, &owner, &profile));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version_start, v1.version_start);
        assert_eq!(history[0].version_end, Some(v2.version_start));
        assert!(history.iter().all(|record| record.value.is_tombstone()));
        assert!(history.iter().all(|record| record.erased_at.is_some()));

        let as_of = match must(store.get_as_of(&t1, &owner, &profile, v1.version_start)) {
            Some(record) => record,
            None => panic!("erased version must still resolve"),
        };
        assert_eq!(as_of.version_id, v1.version_id);
        assert!(as_of.value.is_tombstone());

        let log = must(store.erasure_log(&t1));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].erasure_id, report.erasure_id);
        assert_eq!(log[0].rows_erased, Some(2));
        assert!(log[0].consumed_at.is_some());
        assert!(must(store.erasure_log(&ctx("T2"))).is_empty());

        // A consumed grant does not authorize further payload edits.
        let forged = store.connection().execute(
            "UPDATE satellites SET payload_json = '{}', is_tombstone = 0 WHERE version_seq = 1",
            [],
        );
        assert!(forged.is_err());

        let report_again = must(store.erase_satellite(&t1, &owner, &profile, &request));
        assert_eq!(report_again.rows_erased, 0);

        let check = must(store.integrity_check(Some(&t1)));
        assert!(check.healthy, "{:?}", check.issues);
        assert_eq!(check.counts.erased_rows, 2);

        let v3 = new_version(must(store.upsert_satellite(&t1, &owner, &profile, &json!({"ssn": "3"}), &tag())));
        assert_eq!(v3.version_seq, 3);
    }

    #[test]
    fn erasure_requires_authorization_details() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-9", &tag())));
        let request = ErasureRequest {
            authorized_by: " ".to_string(),
            reason: "cleanup".to_string(),
        };
        let err = must_err(store.erase_satellite(&t1, &owner, &kind("profile"), &request));
        assert!(matches!(err.vault(), Some(VaultError::Validation(_))));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM erasure_grants"), 0);
    }

    #[test]
    fn foreign_tenant_access_is_an_isolation_violation() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let t2 = ctx("T2");
        let hub = must(store.get_or_create_hub(&t1, "acct-42", &tag()));
        let owner = EntityRef::Hub(hub);
        must(store.upsert_satellite(&t1, &owner, &kind("profile"), &json!({"name": "A"}), &tag()));

        let same_name_other_tenant = must(store.get_or_create_hub(&t2, "acct-42", &tag()));
        assert_ne!(same_name_other_tenant, hub);

        let violations = [
            must_err(store.hub_exists(&t2, &hub)),
            must_err(store.get_hub(&t2, &hub)),
            must_err(store.get_current(&t2, &owner, &kind("profile"))),
            must_err(store.get_as_of(&t2, &owner, &kind("profile"), now_utc())),
            must_err(store.history(&t2, &owner, &kind("profile"))),
            must_err(store.links_for_hub(&t2, &hub)),
            must_err(store.upsert_satellite(&t2, &owner, &kind("profile"), &json!({}), &tag())),
            must_err(store.tombstone_satellite(&t2, &owner, &kind("profile"), &tag())),
        ];
        for err in violations {
            assert!(
                matches!(err.vault(), Some(VaultError::TenantIsolationViolation { .. })),
                "unexpected error: {err}"
            );
            assert!(err.is_fatal());
            assert!(!err.to_string().contains("T1"));
            assert!(!err.to_string().contains("T2"));
            assert_eq!(err.user_message(), "internal error");
        }

        assert_eq!(count(&store, "SELECT COUNT(*) FROM satellites"), 1);
    }

    #[test]
    fn links_never_join_hubs_across_tenants() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let t2 = ctx("T2");
        let mine = must(store.get_or_create_hub(&t1, "acct-1", &tag()));
        let mine_too = must(store.get_or_create_hub(&t1, "acct-2", &tag()));
        let theirs = must(store.get_or_create_hub(&t2, "acct-3", &tag()));

        let err = must_err(store.get_or_create_link(&t1, &[mine, theirs], &tag()));
        assert!(matches!(err.vault(), Some(VaultError::TenantIsolationViolation { .. })));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM links"), 0);

        let link = must(store.get_or_create_link(&t1, &[mine, mine_too], &tag()));
        let err = must_err(store.get_link(&t2, &link));
        assert!(matches!(err.vault(), Some(VaultError::TenantIsolationViolation { .. })));
        let err = must_err(store.get_current(&t2, &EntityRef::Link(link), &kind("ownership")));
        assert!(matches!(err.vault(), Some(VaultError::TenantIsolationViolation { .. })));

        // The composite foreign key rejects a forged foreign participant.
        let forged = store.connection().execute(
            "INSERT INTO link_participants(link_key, position, hub_key, tenant_id)
             VALUES (?1, 2, ?2, 'T1')",
            params![link.to_string(), theirs.to_string()],
        );
        assert!(forged.is_err());

        assert!(must(store.links_for_hub(&t2, &theirs)).is_empty());
        assert_eq!(must(store.links_for_hub(&t1, &mine)), vec![link]);
    }

    #[test]
    fn link_identity_ignores_participant_order() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let a = must(store.get_or_create_hub(&t1, "acct-a", &tag()));
        let b = must(store.get_or_create_hub(&t1, "acct-b", &tag()));
        let c = must(store.get_or_create_hub(&t1, "acct-c", &tag()));

        let forward = must(store.get_or_create_link(&t1, &[a, b, c], &tag()));
        let backward = must(store.get_or_create_link(&t1, &[c, b, a, b], &tag()));
        assert_eq!(forward, backward);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM links"), 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM link_participants"), 3);

        let record = match must(store.get_link(&t1, &forward)) {
            Some(record) => record,
            None => panic!("link must exist"),
        };
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(record.participants, expected);
        assert!(must(store.link_exists(&t1, &forward)));

        let owner = EntityRef::Link(forward);
        let v1 = new_version(must(store.upsert_satellite(
            &t1,
            &owner,
            &kind("ownership"),
            &json!({"share": 0.5}),
            &tag(),
        )));
        assert_eq!(v1.version_seq, 1);
        assert_eq!(must(store.links_for_hub(&t1, &b)), vec![forward]);

        let err = must_err(store.get_or_create_link(&t1, &[a, a], &tag()));
        assert!(matches!(err.vault(), Some(VaultError::Validation(_))));
    }

    #[test]
    fn missing_owners_are_absent_for_reads_and_unknown_for_writes() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let ghost = derive_hub_key_for("never-created", &t1);
        let owner = EntityRef::Hub(ghost);

        assert!(!must(store.hub_exists(&t1, &ghost)));
        assert!(must(store.get_hub(&t1, &ghost)).is_none());
        assert!(must(store.get_current(&t1, &owner, &kind("profile"))).is_none());
        assert!(must(store.history(&t1, &owner, &kind("profile"))).is_empty());

        let err = must_err(store.upsert_satellite(&t1, &owner, &kind("profile"), &json!({}), &tag()));
        assert!(matches!(err.vault(), Some(VaultError::UnknownEntity { .. })));

        let real = must(store.get_or_create_hub(&t1, "acct-1", &tag()));
        let err = must_err(store.get_or_create_link(&t1, &[real, ghost], &tag()));
        assert!(matches!(err.vault(), Some(VaultError::UnknownEntity { .. })));
    }

    #[test]
    fn hub_creation_is_idempotent_and_keeps_first_provenance() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let first = must(store.get_or_create_hub(&t1, "acct-1", &tag()));
        let second = must(store.get_or_create_hub(&t1, "acct-1", &must_vault(SourceTag::new("billing"))));
        assert_eq!(first, second);

        let record = match must(store.get_hub(&t1, &first)) {
            Some(record) => record,
            None => panic!("hub must exist"),
        };
        assert_eq!(record.business_key, "acct-1");
        assert_eq!(record.source_tag.as_str(), "crm-sync");
        assert_eq!(count(&store, "SELECT COUNT(*) FROM hubs"), 1);

        let err = must_err(store.get_or_create_hub(&t1, "  ", &tag()));
        assert!(matches!(err.vault(), Some(VaultError::Validation(_))));
    }

    #[test]
    fn hub_key_collision_is_fatal() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let key = derive_hub_key_for("acct-1", &t1);
        if let Err(err) = store.connection().execute(
            "INSERT INTO hubs(hub_key, business_key, tenant_id, first_seen_us, source_tag)
             VALUES (?1, 'someone-else', 'T1', 1, 'forged')",
            params![key.to_string()],
        ) {
            panic!("failed to seed colliding hub: {err}");
        }

        let err = must_err(store.get_or_create_hub(&t1, "acct-1", &tag()));
        assert!(matches!(err.vault(), Some(VaultError::KeyCollision { .. })));
        assert!(err.is_fatal());
    }

    #[test]
    fn link_key_collision_is_fatal() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let a = must(store.get_or_create_hub(&t1, "cust-1", &tag()));
        let b = must(store.get_or_create_hub(&t1, "acct-9", &tag()));
        let c = must(store.get_or_create_hub(&t1, "acct-10", &tag()));

        let participants = must_vault(vault_kernel_core::canonical_participants(&[a, b]));
        let key = must_vault(vault_kernel_core::derive_link_key(&participants, t1.tenant_id(), None));
        let seeded = store.connection().execute_batch(&format!(
            "INSERT INTO links(link_key, tenant_id, participant_count, created_us, source_tag)
             VALUES ('{key}', 'T1', 2, 1, 'forged');
             INSERT INTO link_participants(link_key, position, hub_key, tenant_id)
             VALUES ('{key}', 0, '{a}', 'T1'), ('{key}', 1, '{c}', 'T1');"
        ));
        if let Err(err) = seeded {
            panic!("failed to seed colliding link: {err}");
        }

        let err = must_err(store.get_or_create_link(&t1, &[b, a], &tag()));
        assert!(matches!(err.vault(), Some(VaultError::KeyCollision { .. })));
        assert!(err.is_fatal());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM link_participants"), 2);
    }

    #[test]
    fn numerically_equal_payloads_do_not_open_a_version() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));
        let balance = kind("balance");

        let _ = new_version(must(store.upsert_satellite(&t1, &owner, &balance, &json!({"amount": 1}), &tag())));
        let replayed: Value = must(
            serde_json::from_str(r#"{"amount":1.0}"#).map_err(StoreError::from),
        );
        let outcome = must(store.upsert_satellite(&t1, &owner, &balance, &replayed, &tag()));
        assert!(!outcome.is_new_version());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM satellites"), 1);
    }

    #[test]
    fn digest_match_with_different_payload_is_a_collision() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let hub = must(store.get_or_create_hub(&t1, "acct-1", &tag()));
        let wanted = json!({"name": "A"});
        let digest = document_digest(&must_vault(canonical_json(&wanted)));

        if let Err(err) = store.connection().execute(
            "INSERT INTO satellites(
                owner_key, owner_kind, tenant_id, satellite_kind, version_seq, version_id,
                version_start_us, version_end_us, content_digest, is_tombstone, payload_json,
                source_tag, erased_us
             ) VALUES (?1, 'hub', 'T1', 'profile', 1, ?2, 1, NULL, ?3, 0, '{\"name\":\"Z\"}', 'forged', NULL)",
            params![hub.to_string(), ulid::Ulid::new().to_string(), digest],
        ) {
            panic!("failed to seed colliding satellite: {err}");
        }

        let err = must_err(store.upsert_satellite(&t1, &EntityRef::Hub(hub), &kind("profile"), &wanted, &tag()));
        assert!(matches!(err.vault(), Some(VaultError::DigestCollision { .. })));
        assert!(err.is_fatal());
    }

    #[test]
    fn store_clock_never_moves_backwards() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));

        let ahead = must_vault(to_unix_micros(now_utc())) + 60_000_000;
        if let Err(err) = store.connection().execute(
            "UPDATE vault_meta SET meta_value = ?1 WHERE meta_key = ?2",
            params![ahead.to_string(), META_CLOCK_KEY],
        ) {
            panic!("failed to advance clock: {err}");
        }

        let version = new_version(must(store.upsert_satellite(&t1, &owner, &kind("status"), &json!(1), &tag())));
        assert_eq!(must_vault(to_unix_micros(version.version_start)), ahead + 1);

        let next = new_version(must(store.upsert_satellite(&t1, &owner, &kind("status"), &json!(2), &tag())));
        assert_eq!(must_vault(to_unix_micros(next.version_start)), ahead + 2);
    }

    #[test]
    fn reopening_with_a_different_salt_is_rejected() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let db_path = dir.path().join("vault.sqlite3");
        let salt_a = EngineConfig {
            key_salt_hex: Some("a1a1".to_string()),
            ..EngineConfig::default()
        };
        let salt_b = EngineConfig {
            key_salt_hex: Some("b2b2".to_string()),
            ..EngineConfig::default()
        };

        let mut store = must(SqliteVaultStore::open_with_config(&db_path, salt_a.clone()));
        must(store.migrate());
        let t1 = ctx("T1");
        let salted = must(store.get_or_create_hub(&t1, "acct-1", &tag()));
        assert_ne!(salted, derive_hub_key_for("acct-1", &t1));
        drop(store);

        let store = must(SqliteVaultStore::open_with_config(&db_path, salt_b));
        let err = must_err(store.migrate());
        assert!(matches!(err.vault(), Some(VaultError::Configuration(_))));
        drop(store);

        let store = must(SqliteVaultStore::open_with_config(&db_path, salt_a));
        must(store.migrate());
        assert!(must(store.hub_exists(&t1, &salted)));
        let check = must(store.integrity_check(None));
        assert!(check.healthy, "{:?}", check.issues);
    }

    #[test]
    fn integrity_check_flags_tampered_digests() {
        let mut store = fixture_store();
        let t1 = ctx("T1");
        let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-1", &tag())));
        must(store.upsert_satellite(&t1, &owner, &kind("profile"), &json!({"name": "A"}), &tag()));
        must(store.upsert_satellite(&t1, &owner, &kind("profile"), &json!({"name": "B"}), &tag()));

        let healthy = must(store.integrity_check(None));
        assert_eq!(healthy.contract_version, "integrity_check.v1");
        assert!(healthy.healthy, "{:?}", healthy.issues);
        assert_eq!(healthy.counts.hubs, 1);
        assert_eq!(healthy.counts.satellite_rows, 2);
        assert_eq!(healthy.counts.timelines, 1);
        assert_eq!(healthy.counts.open_versions, 1);

        if let Err(err) = store.connection().execute_batch(
            "DROP TRIGGER trg_satellites_guard_update;
             UPDATE satellites SET content_digest = 'tampered' WHERE version_seq = 1;",
        ) {
            panic!("failed to tamper: {err}");
        }

        let check = must(store.integrity_check(None));
        assert!(!check.healthy);
        assert!(check.issues.iter().any(|issue| issue.code == "digest_mismatch"));

        let other_tenant = must(store.integrity_check(Some(&ctx("T2"))));
        assert!(other_tenant.healthy);
        assert_eq!(other_tenant.counts.satellite_rows, 0);
    }

    #[test]
    fn write_retry_gives_up_after_the_configured_attempts() {
        let mut store = fixture_store();
        let mut calls = 0_u32;
        let result: Result<()> = with_write_retry(&mut store.conn, 3, "test", |_| {
            calls += 1;
            Ok(Attempt::Conflict)
        });

        let err = must_err(result);
        assert_eq!(calls, 3);
        assert!(matches!(
            err.vault(),
            Some(VaultError::WriteContention { attempts: 3 })
        ));
        assert!(err.is_transient());
        assert_eq!(err.user_message(), "the record is busy, please retry");
    }

    #[test]
    fn concurrent_hub_creation_converges_on_one_row() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let db_path = dir.path().join("vault.sqlite3");
        must(must(SqliteVaultStore::open(&db_path)).migrate());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = db_path.clone();
                std::thread::spawn(move || {
                    let mut store = must(SqliteVaultStore::open(&path));
                    must(store.get_or_create_hub(&ctx("T1"), "acct-42", &tag()))
                })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(key) => keys.push(key),
                Err(err) => panic!("hub thread panicked: {err:?}"),
            }
        }

        assert!(keys.iter().all(|key| *key == keys[0]));
        let store = must(SqliteVaultStore::open(&db_path));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM hubs"), 1);
    }

    #[test]
    fn concurrent_upserts_keep_a_single_contiguous_timeline() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let db_path = dir.path().join("vault.sqlite3");
        let mut setup = must(SqliteVaultStore::open(&db_path));
        must(setup.migrate());
        let hub = must(setup.get_or_create_hub(&ctx("T1"), "acct-42", &tag()));
        drop(setup);

        let threads = 6_u32;
        let writes_per_thread = 5_u32;
        let handles: Vec<_> = (0..threads)
            .map(|thread| {
                let path = db_path.clone();
                std::thread::spawn(move || {
                    let mut store = must(SqliteVaultStore::open(&path));
                    let owner = EntityRef::Hub(hub);
                    for write in 0..writes_per_thread {
                        let payload = json!({"thread": thread, "write": write});
                        let outcome =
                            must(store.upsert_satellite(&ctx("T1"), &owner, &kind("balance"), &payload, &tag()));
                        assert!(outcome.is_new_version());
                    }
                })
            })
            .collect();

        for handle in handles {
            if let Err(err) = handle.join() {
                panic!("writer thread panicked: {err:?}");
            }
        }

        let store = must(SqliteVaultStore::open(&db_path));
        let history = must(store.history(&ctx("T1"), &EntityRef::Hub(hub), &kind("balance")));
        let expected = usize::try_from(threads * writes_per_thread).unwrap_or(usize::MAX);
        assert_eq!(history.len(), expected);
        assert_eq!(history.iter().filter(|record| record.is_open()).count(), 1);
        for pair in history.windows(2) {
            assert_eq!(pair[0].version_seq + 1, pair[1].version_seq);
            assert_eq!(pair[0].version_end, Some(pair[1].version_start));
        }

        let check = must(store.integrity_check(None));
        assert!(check.healthy, "{:?}", check.issues);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_timeline_matches_distinct_writes(codes in prop::collection::vec(0u8..4, 1..24)) {
            let mut store = fixture_store();
            let t1 = ctx("T1");
            let owner = EntityRef::Hub(must(store.get_or_create_hub(&t1, "acct-p", &tag())));
            let status = kind("status");

            let mut expected_versions = 0_usize;
            let mut previous = None;
            for code in codes.iter().copied() {
                let outcome = must(store.upsert_satellite(&t1, &owner, &status, &json!({"code": code}), &tag()));
                let changed = previous != Some(code);
                prop_assert_eq!(outcome.is_new_version(), changed);
                if changed {
                    expected_versions += 1;
                }
                previous = Some(code);
            }

            let history = must(store.history(&t1, &owner, &status));
            prop_assert_eq!(history.len(), expected_versions);
            prop_assert_eq!(history.iter().filter(|record| record.is_open()).count(), 1);

            let one_micro = time::Duration::microseconds(1);
            let before = must(store.get_as_of(&t1, &owner, &status, history[0].version_start - one_micro));
            prop_assert!(before.is_none());

            for record in &history {
                let resolved = must(store.get_as_of(&t1, &owner, &status, record.version_start));
                prop_assert_eq!(resolved.map(|found| found.version_id), Some(record.version_id));
                if let Some(end) = record.version_end {
                    let last = must(store.get_as_of(&t1, &owner, &status, end - one_micro));
                    prop_assert_eq!(last.map(|found| found.version_id), Some(record.version_id));
                }
            }
        }
    }
}
