//! Operator command surface for a vault database.
//!
//! Hosts can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_vault_with_db`] for a [`VaultCommand`] against a DB path.
//! - [`run_vault`] for execution against an existing [`SqliteVaultStore`].
//!
//! Every command prints JSON on stdout, except `check` without `--json`.
//! Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use vault_kernel_core::{
    derive_hub_key, parse_rfc3339_utc, EngineConfig, EntityRef, HubKey, LinkKey, SatelliteKind,
    SourceTag, TenantContext, TenantId,
};
use vault_kernel_store_sqlite::{
    ErasureRequest, IntegrityIssueSeverity, IntegrityReport, SqliteVaultStore,
};

const DEFAULT_LOG_FILTER: &str =
    "vault_kernel_core=info,vault_kernel_store_sqlite=info,vault_kernel::security=warn,warn";

#[derive(Debug, Parser)]
#[command(name = "vk")]
#[command(about = "Vault Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./vault_kernel.sqlite3")]
    db: PathBuf,

    /// JSON file with engine settings (`max_write_retries`, `busy_timeout_ms`,
    /// `key_salt_hex`).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Vault {
        #[command(subcommand)]
        command: Box<VaultCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum VaultCommand {
    Migrate,
    Hub {
        #[command(subcommand)]
        command: Box<HubCommand>,
    },
    Sat {
        #[command(subcommand)]
        command: Box<SatCommand>,
    },
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    Check(CheckArgs),
    Erasures(TenantArgs),
    Key {
        #[command(subcommand)]
        command: Box<KeyCommand>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct TenantArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long, default_value = "vk-cli")]
    actor: String,
}

#[derive(Debug, Subcommand)]
pub enum HubCommand {
    Create(HubCreateArgs),
    Show(HubShowArgs),
}

#[derive(Debug, Args)]
pub struct HubCreateArgs {
    #[command(flatten)]
    tenant: TenantArgs,
    #[arg(long)]
    business_key: String,
    #[arg(long, default_value = "vk-cli")]
    source_tag: String,
}

#[derive(Debug, Args)]
pub struct HubShowArgs {
    #[command(flatten)]
    tenant: TenantArgs,
    #[arg(long)]
    hub_key: String,
}

#[derive(Debug, Subcommand)]
pub enum SatCommand {
    Upsert(SatUpsertArgs),
    Current(SatTargetArgs),
    AsOf(SatAsOfArgs),
    History(SatTargetArgs),
    Tombstone(SatTombstoneArgs),
    Erase(SatEraseArgs),
}

#[derive(Debug, Args)]
pub struct SatTargetArgs {
    #[command(flatten)]
    tenant: TenantArgs,
    /// `hub:<key>` or `link:<key>`.
    #[arg(long)]
    owner: String,
    #[arg(long)]
    kind: String,
}

#[derive(Debug, Args)]
pub struct SatUpsertArgs {
    #[command(flatten)]
    target: SatTargetArgs,
    #[arg(long)]
    payload_json: String,
    #[arg(long, default_value = "vk-cli")]
    source_tag: String,
}

#[derive(Debug, Args)]
pub struct SatAsOfArgs {
    #[command(flatten)]
    target: SatTargetArgs,
    /// RFC3339 UTC instant.
    #[arg(long)]
    at: String,
}

#[derive(Debug, Args)]
pub struct SatTombstoneArgs {
    #[command(flatten)]
    target: SatTargetArgs,
    #[arg(long, default_value = "vk-cli")]
    source_tag: String,
}

#[derive(Debug, Args)]
pub struct SatEraseArgs {
    #[command(flatten)]
    target: SatTargetArgs,
    #[arg(long)]
    authorized_by: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Subcommand)]
pub enum LinkCommand {
    Create(LinkCreateArgs),
    Show(LinkShowArgs),
    ForHub(HubShowArgs),
}

#[derive(Debug, Args)]
pub struct LinkCreateArgs {
    #[command(flatten)]
    tenant: TenantArgs,
    /// Participant hub key; repeat for each participant.
    #[arg(long = "hub", required = true)]
    hubs: Vec<String>,
    #[arg(long, default_value = "vk-cli")]
    source_tag: String,
}

#[derive(Debug, Args)]
pub struct LinkShowArgs {
    #[command(flatten)]
    tenant: TenantArgs,
    #[arg(long)]
    link_key: String,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Restrict the check to one tenant.
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum KeyCommand {
    Derive(KeyDeriveArgs),
}

#[derive(Debug, Args)]
pub struct KeyDeriveArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    business_key: String,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    // A host may already have installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes a fully parsed CLI invocation.
///
/// # Errors
/// Returns an error when configuration loading, store open/migrate, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Vault { command } => run_vault_with_db(&cli.db, config, *command),
    }
}

/// Executes a parsed vault command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_vault_with_db(
    db_path: &Path,
    config: EngineConfig,
    command: VaultCommand,
) -> Result<()> {
    match command {
        VaultCommand::Key { command } => run_key(&config, *command),
        vault_command => {
            tracing::debug!(db = %db_path.display(), "opening vault");
            let mut store = SqliteVaultStore::open_with_config(db_path, config)
                .with_context(|| format!("failed to open {}", db_path.display()))?;
            store.migrate()?;
            run_vault(vault_command, &mut store)
        }
    }
}

/// Executes a parsed vault command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, persistence, or retrieval fails, or
/// when a requested record does not exist.
pub fn run_vault(command: VaultCommand, store: &mut SqliteVaultStore) -> Result<()> {
    match command {
        VaultCommand::Migrate => print_json(&json!({ "migrated": true })),
        VaultCommand::Hub { command } => run_hub(*command, store),
        VaultCommand::Sat { command } => run_sat(*command, store),
        VaultCommand::Link { command } => run_link(*command, store),
        VaultCommand::Check(args) => run_check(&args, store),
        VaultCommand::Erasures(args) => {
            let ctx = tenant_context(&args)?;
            print_json(&store.erasure_log(&ctx)?)
        }
        VaultCommand::Key { command } => run_key(store.config(), *command),
    }
}

fn run_hub(command: HubCommand, store: &mut SqliteVaultStore) -> Result<()> {
    match command {
        HubCommand::Create(args) => {
            let ctx = tenant_context(&args.tenant)?;
            let source_tag = parse_source_tag(&args.source_tag)?;
            let hub_key = store.get_or_create_hub(&ctx, &args.business_key, &source_tag)?;
            print_json(&json!({ "hub_key": hub_key }))
        }
        HubCommand::Show(args) => {
            let ctx = tenant_context(&args.tenant)?;
            let hub_key = parse_hub_key(&args.hub_key)?;
            let Some(record) = store.get_hub(&ctx, &hub_key)? else {
                return Err(anyhow!("hub not found: {hub_key}"));
            };
            print_json(&record)
        }
    }
}

fn run_sat(command: SatCommand, store: &mut SqliteVaultStore) -> Result<()> {
    match command {
        SatCommand::Upsert(args) => {
            let (ctx, owner, kind) = parse_target(&args.target)?;
            let payload: serde_json::Value =
                serde_json::from_str(&args.payload_json).with_context(|| {
                    format!("payload_json must be valid JSON: {}", args.payload_json)
                })?;
            let source_tag = parse_source_tag(&args.source_tag)?;
            let outcome = store.upsert_satellite(&ctx, &owner, &kind, &payload, &source_tag)?;
            print_json(&outcome)
        }
        SatCommand::Current(args) => {
            let (ctx, owner, kind) = parse_target(&args)?;
            let Some(record) = store.get_current(&ctx, &owner, &kind)? else {
                return Err(anyhow!("no current version for {owner}/{kind}"));
            };
            print_json(&record)
        }
        SatCommand::AsOf(args) => {
            let (ctx, owner, kind) = parse_target(&args.target)?;
            let at = parse_rfc3339_utc(&args.at)
                .map_err(|err| anyhow!("invalid --at value: {err}"))?;
            let Some(record) = store.get_as_of(&ctx, &owner, &kind, at)? else {
                return Err(anyhow!("no version of {owner}/{kind} valid at {}", args.at));
            };
            print_json(&record)
        }
        SatCommand::History(args) => {
            let (ctx, owner, kind) = parse_target(&args)?;
            print_json(&store.history(&ctx, &owner, &kind)?)
        }
        SatCommand::Tombstone(args) => {
            let (ctx, owner, kind) = parse_target(&args.target)?;
            let source_tag = parse_source_tag(&args.source_tag)?;
            print_json(&store.tombstone_satellite(&ctx, &owner, &kind, &source_tag)?)
        }
        SatCommand::Erase(args) => {
            let (ctx, owner, kind) = parse_target(&args.target)?;
            let request = ErasureRequest {
                authorized_by: args.authorized_by,
                reason: args.reason,
            };
            print_json(&store.erase_satellite(&ctx, &owner, &kind, &request)?)
        }
    }
}

fn run_link(command: LinkCommand, store: &mut SqliteVaultStore) -> Result<()> {
    match command {
        LinkCommand::Create(args) => {
            let ctx = tenant_context(&args.tenant)?;
            let hubs = args
                .hubs
                .iter()
                .map(|raw| parse_hub_key(raw))
                .collect::<Result<Vec<_>>>()?;
            let source_tag = parse_source_tag(&args.source_tag)?;
            let link_key = store.get_or_create_link(&ctx, &hubs, &source_tag)?;
            print_json(&json!({ "link_key": link_key }))
        }
        LinkCommand::Show(args) => {
            let ctx = tenant_context(&args.tenant)?;
            let link_key = LinkKey::from_hex(&args.link_key)
                .with_context(|| format!("invalid link key: {}", args.link_key))?;
            let Some(record) = store.get_link(&ctx, &link_key)? else {
                return Err(anyhow!("link not found: {link_key}"));
            };
            print_json(&record)
        }
        LinkCommand::ForHub(args) => {
            let ctx = tenant_context(&args.tenant)?;
            let hub_key = parse_hub_key(&args.hub_key)?;
            print_json(&store.links_for_hub(&ctx, &hub_key)?)
        }
    }
}

fn run_check(args: &CheckArgs, store: &SqliteVaultStore) -> Result<()> {
    let scope = args
        .tenant
        .as_deref()
        .map(|tenant| {
            TenantId::new(tenant)
                .map(|tenant_id| TenantContext::new(tenant_id, "vk-cli"))
                .map_err(|err| anyhow!("invalid --tenant: {err}"))
        })
        .transpose()?;

    let report = store.integrity_check(scope.as_ref())?;
    if args.json {
        print_json(&report)?;
    } else {
        print_integrity_report(&report);
    }

    if !report.healthy {
        return Err(anyhow!(
            "integrity check failed: {}",
            report
                .issues
                .iter()
                .map(|item| format!("{}:{}", item.code, item.message))
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }
    Ok(())
}

fn run_key(config: &EngineConfig, command: KeyCommand) -> Result<()> {
    match command {
        KeyCommand::Derive(args) => {
            let tenant_id =
                TenantId::new(args.tenant).map_err(|err| anyhow!("invalid --tenant: {err}"))?;
            let salt = config.key_salt()?;
            let hub_key = derive_hub_key(&args.business_key, &tenant_id, salt.as_deref());
            print_json(&json!({
                "business_key": args.business_key,
                "hub_key": hub_key,
                "salted": salt.is_some(),
            }))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config {} must be valid JSON", path.display()))?;
    Ok(EngineConfig::from_json(&value)?)
}

fn tenant_context(args: &TenantArgs) -> Result<TenantContext> {
    let tenant_id =
        TenantId::new(args.tenant.clone()).map_err(|err| anyhow!("invalid --tenant: {err}"))?;
    Ok(TenantContext::new(tenant_id, args.actor.clone()))
}

fn parse_target(args: &SatTargetArgs) -> Result<(TenantContext, EntityRef, SatelliteKind)> {
    let ctx = tenant_context(&args.tenant)?;
    let owner: EntityRef = args
        .owner
        .parse()
        .with_context(|| format!("invalid --owner: {}", args.owner))?;
    let kind = SatelliteKind::new(args.kind.clone())
        .with_context(|| format!("invalid --kind: {}", args.kind))?;
    Ok((ctx, owner, kind))
}

fn parse_hub_key(raw: &str) -> Result<HubKey> {
    HubKey::from_hex(raw).with_context(|| format!("invalid hub key: {raw}"))
}

fn parse_source_tag(raw: &str) -> Result<SourceTag> {
    SourceTag::new(raw).map_err(|err| anyhow!("invalid --source-tag: {err}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_integrity_report(report: &IntegrityReport) {
    println!("contract={}", report.contract_version);
    println!(
        "hubs={} links={} satellite_rows={} timelines={} open_versions={} erased_rows={}",
        report.counts.hubs,
        report.counts.links,
        report.counts.satellite_rows,
        report.counts.timelines,
        report.counts.open_versions,
        report.counts.erased_rows
    );
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    if report.issues.is_empty() {
        return;
    }

    println!("{:<8} {:<32} message", "severity", "code");
    println!("{}", "-".repeat(90));
    for item in &report.issues {
        let severity = match item.severity {
            IntegrityIssueSeverity::Warning => "warning",
            IntegrityIssueSeverity::Error => "error",
        };
        println!("{severity:<8} {:<32} {}", item.code, item.message);
    }
}
