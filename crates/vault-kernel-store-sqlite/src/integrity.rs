use rusqlite::params;
use serde::{Deserialize, Serialize};
use vault_kernel_core::{
    canonical_json, derive_hub_key, derive_link_key, document_digest, tombstone_digest, LinkKey,
    TenantContext,
};

use crate::hub::parse_hub_row;
use crate::link::load_link;
use crate::satellite::{parse_satellite_row, StoredSatellite, SATELLITE_COLUMNS};
use crate::{key_column, Result, SqliteVaultStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub code: String,
    pub severity: IntegrityIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityCounts {
    pub hubs: usize,
    pub links: usize,
    pub satellite_rows: usize,
    pub timelines: usize,
    pub open_versions: usize,
    pub erased_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub contract_version: String,
    pub healthy: bool,
    pub tenant_scoped: bool,
    pub counts: IntegrityCounts,
    pub issues: Vec<IntegrityIssue>,
}

impl SqliteVaultStore {
    /// Re-derives every invariant the write path maintains and reports the
    /// rows that violate one.
    ///
    /// With a context the check covers that tenant only; without one it
    /// covers the whole database and is meant for operators.
    pub fn integrity_check(&self, scope: Option<&TenantContext>) -> Result<IntegrityReport> {
        let tenant = scope.map(|ctx| ctx.tenant_id().as_str().to_string());
        let mut counts = IntegrityCounts::default();
        let mut issues = Vec::new();

        self.check_hubs(tenant.as_deref(), &mut counts, &mut issues)?;
        self.check_links(tenant.as_deref(), &mut counts, &mut issues)?;
        self.check_satellites(tenant.as_deref(), &mut counts, &mut issues)?;
        self.check_satellite_owners(tenant.as_deref(), &mut issues)?;

        let healthy = !issues
            .iter()
            .any(|item| item.severity == IntegrityIssueSeverity::Error);

        Ok(IntegrityReport {
            contract_version: "integrity_check.v1".to_string(),
            healthy,
            tenant_scoped: scope.is_some(),
            counts,
            issues,
        })
    }

    fn check_hubs(
        &self,
        tenant: Option<&str>,
        counts: &mut IntegrityCounts,
        issues: &mut Vec<IntegrityIssue>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT hub_key, business_key, tenant_id, first_seen_us, source_tag
             FROM hubs
             WHERE ?1 IS NULL OR tenant_id = ?1
             ORDER BY hub_key ASC",
        )?;
        let rows = stmt.query_map(params![tenant], parse_hub_row)?;

        for row in rows {
            let hub = row?;
            counts.hubs += 1;
            let expected = derive_hub_key(&hub.business_key, &hub.tenant_id, self.salt());
            if expected != hub.hub_key {
                issues.push(error_issue(
                    "hub_key_mismatch",
                    format!("hub {} does not recompute from its business key", hub.hub_key),
                ));
            }
        }
        Ok(())
    }

    fn check_links(
        &self,
        tenant: Option<&str>,
        counts: &mut IntegrityCounts,
        issues: &mut Vec<IntegrityIssue>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT link_key
             FROM links
             WHERE ?1 IS NULL OR tenant_id = ?1
             ORDER BY link_key ASC",
        )?;
        let rows = stmt.query_map(params![tenant], |row| key_column(row, 0).map(LinkKey))?;

        for row in rows {
            let link_key = row?;
            counts.links += 1;
            let Some(link) = load_link(&self.conn, &link_key)? else {
                continue;
            };
            let recomputed = derive_link_key(&link.participants, &link.tenant_id, self.salt());
            if recomputed.ok() != Some(link.link_key) {
                issues.push(error_issue(
                    "link_key_mismatch",
                    format!("link {link_key} does not recompute from its participants"),
                ));
            }
        }
        Ok(())
    }

    fn check_satellites(
        &self,
        tenant: Option<&str>,
        counts: &mut IntegrityCounts,
        issues: &mut Vec<IntegrityIssue>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SATELLITE_COLUMNS}
             FROM satellites
             WHERE ?1 IS NULL OR tenant_id = ?1
             ORDER BY owner_key ASC, satellite_kind ASC, version_seq ASC"
        ))?;
        let rows = stmt.query_map(params![tenant], parse_satellite_row)?;

        let mut previous: Option<StoredSatellite> = None;
        let mut open_in_timeline = 0_usize;
        for row in rows {
            let row = row?;
            counts.satellite_rows += 1;
            if row.version_end_us.is_none() {
                counts.open_versions += 1;
            }
            if row.erased_us.is_some() {
                counts.erased_rows += 1;
            }
            check_digest(&row, issues);

            let same_timeline = previous.as_ref().is_some_and(|prev| {
                prev.owner == row.owner && prev.satellite_kind == row.satellite_kind
            });
            if same_timeline {
                if let Some(prev) = &previous {
                    check_adjacent(prev, &row, issues);
                }
            } else {
                if let Some(prev) = &previous {
                    finish_timeline(prev, open_in_timeline, issues);
                }
                counts.timelines += 1;
                open_in_timeline = 0;
                if row.version_seq != 1 {
                    issues.push(error_issue(
                        "version_chain_gap",
                        format!(
                            "{}/{} starts at version_seq {}",
                            row.owner, row.satellite_kind, row.version_seq
                        ),
                    ));
                }
            }

            if row.version_end_us.is_none() {
                open_in_timeline += 1;
            }
            previous = Some(row);
        }
        if let Some(prev) = &previous {
            finish_timeline(prev, open_in_timeline, issues);
        }
        Ok(())
    }

    fn check_satellite_owners(
        &self,
        tenant: Option<&str>,
        issues: &mut Vec<IntegrityIssue>,
    ) -> Result<()> {
        let orphaned: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM satellites s
             WHERE (?1 IS NULL OR s.tenant_id = ?1)
               AND (
                 (s.owner_kind = 'hub' AND NOT EXISTS (
                    SELECT 1 FROM hubs h
                    WHERE h.hub_key = s.owner_key AND h.tenant_id = s.tenant_id))
                 OR (s.owner_kind = 'link' AND NOT EXISTS (
                    SELECT 1 FROM links l
                    WHERE l.link_key = s.owner_key AND l.tenant_id = s.tenant_id))
               )",
            params![tenant],
            |row| row.get(0),
        )?;

        if orphaned > 0 {
            issues.push(error_issue(
                "satellite_owner_tenant_mismatch",
                format!("{orphaned} satellite rows are not owned by an entity of their tenant"),
            ));
        }
        Ok(())
    }
}

fn check_digest(row: &StoredSatellite, issues: &mut Vec<IntegrityIssue>) {
    let Some(payload) = row.payload_json.as_deref() else {
        if row.content_digest != tombstone_digest() {
            issues.push(error_issue(
                "digest_mismatch",
                format!("tombstone version {} carries a document digest", row.version_id),
            ));
        }
        return;
    };

    if document_digest(payload) != row.content_digest {
        issues.push(error_issue(
            "digest_mismatch",
            format!("version {} does not recompute its content digest", row.version_id),
        ));
    }

    let canonical = serde_json::from_str(payload)
        .ok()
        .and_then(|value| canonical_json(&value).ok());
    if canonical.as_deref() != Some(payload) {
        issues.push(IntegrityIssue {
            code: "non_canonical_payload".to_string(),
            severity: IntegrityIssueSeverity::Warning,
            message: format!("version {} payload is not in canonical form", row.version_id),
        });
    }
}

fn check_adjacent(
    prev: &StoredSatellite,
    next: &StoredSatellite,
    issues: &mut Vec<IntegrityIssue>,
) {
    if next.version_seq != prev.version_seq.saturating_add(1) {
        issues.push(error_issue(
            "version_chain_gap",
            format!(
                "{}/{} jumps from version_seq {} to {}",
                next.owner, next.satellite_kind, prev.version_seq, next.version_seq
            ),
        ));
    }

    match prev.version_end_us {
        Some(end) if end == next.version_start_us => {}
        Some(end) if end < next.version_start_us => issues.push(error_issue(
            "version_chain_gap",
            format!(
                "{}/{} has a gap after version_seq {}",
                next.owner, next.satellite_kind, prev.version_seq
            ),
        )),
        _ => issues.push(error_issue(
            "version_chain_overlap",
            format!(
                "{}/{} versions {} and {} overlap",
                next.owner, next.satellite_kind, prev.version_seq, next.version_seq
            ),
        )),
    }
}

fn finish_timeline(last: &StoredSatellite, open_rows: usize, issues: &mut Vec<IntegrityIssue>) {
    if open_rows > 1 {
        issues.push(error_issue(
            "multiple_open_versions",
            format!(
                "{}/{} has {open_rows} open versions",
                last.owner, last.satellite_kind
            ),
        ));
    } else if last.version_end_us.is_some() {
        issues.push(error_issue(
            "missing_open_version",
            format!(
                "{}/{} has no open version after version_seq {}",
                last.owner, last.satellite_kind, last.version_seq
            ),
        ));
    }
}

fn error_issue(code: &str, message: String) -> IntegrityIssue {
    IntegrityIssue {
        code: code.to_string(),
        severity: IntegrityIssueSeverity::Error,
        message,
    }
}
