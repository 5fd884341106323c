use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bm_recon_api::{BmReconApi, GapScanRequest, ReconcileRequest};
use bm_recon_core::{parse_settlement_date, ReconConfig, VersionedRecord};
use bm_recon_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use time::Date;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SIG_FILE: &str = "manifest.sig";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Parser)]
#[command(name = "bmr")]
#[command(about = "Balancing-mechanism reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./bm_recon.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Ingest(IngestArgs),
    Gaps(GapsArgs),
    Reconcile(ReconcileArgs),
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
    Summary(SummaryArgs),
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// NDJSON file with one versioned record per line.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct GapsArgs {
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long)]
    min_periods: Option<usize>,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long)]
    date: String,
    #[arg(long)]
    price_outlier_threshold: Option<f64>,
    #[arg(long)]
    low_volume_threshold: Option<f64>,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List(AuditListArgs),
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long)]
    date: String,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    #[arg(long)]
    date: String,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Show(ReportShowArgs),
}

#[derive(Debug, Args)]
struct ReportShowArgs {
    #[arg(long)]
    report_id: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = BmReconApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(*command, &cli.db, &api),
        Command::Ingest(args) => run_ingest(&args, &api),
        Command::Gaps(args) => run_gaps(&args, &api),
        Command::Reconcile(args) => run_reconcile(&args, &api),
        Command::Audit { command } => match *command {
            AuditCommand::List(args) => run_audit_list(&args, &api),
        },
        Command::Summary(args) => run_summary(&args, &api),
        Command::Report { command } => match *command {
            ReportCommand::Show(args) => run_report_show(&args, &api),
        },
    }
}

fn run_db(command: DbCommand, db_path: &Path, api: &BmReconApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Export(args) => run_db_export(&args, db_path),
        DbCommand::Import(args) => run_db_import(&args, db_path),
        DbCommand::Backup(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let store = SqliteStore::open(db_path)?;
            let report = store.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_db_export(args: &DbExportArgs, db_path: &Path) -> Result<()> {
    let mut store = SqliteStore::open(db_path)?;
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;

    if let Some(key_path) = args.signing_key_file.as_ref() {
        let signing_key = read_hex_key_file(key_path)?;
        let manifest_path = args.out.join(MANIFEST_FILE);
        let manifest_bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
        write_manifest_signature(&args.out, &manifest_bytes, &signing_key)?;
    } else {
        remove_if_exists(&args.out.join(MANIFEST_SIG_FILE))?;
    }

    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, db_path: &Path) -> Result<()> {
    let verify_key =
        args.verify_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;
    check_import_signature(&args.input, verify_key.as_ref(), args.allow_unsigned)?;

    let mut store = SqliteStore::open(db_path)?;
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_ingest(args: &IngestArgs, api: &BmReconApi) -> Result<()> {
    let records = read_ndjson_records(&args.file)?;
    let summary = api.ingest(&records)?;
    emit_json(serde_json::json!({
        "file": args.file,
        "records_read": records.len(),
        "summary": summary
    }))
}

fn run_gaps(args: &GapsArgs, api: &BmReconApi) -> Result<()> {
    let result = api.scan_gaps(GapScanRequest {
        start: parse_date_arg(&args.start)?,
        end: parse_date_arg(&args.end)?,
        min_periods: args.min_periods,
    })?;
    emit_json(serde_json::to_value(&result).context("failed to serialize gap scan result")?)
}

fn run_reconcile(args: &ReconcileArgs, api: &BmReconApi) -> Result<()> {
    let settlement_date = parse_date_arg(&args.date)?;

    let config = if args.price_outlier_threshold.is_some() || args.low_volume_threshold.is_some() {
        let mut config = ReconConfig::default();
        if let Some(threshold) = args.price_outlier_threshold {
            config.price_outlier_threshold = threshold;
        }
        if let Some(threshold) = args.low_volume_threshold {
            config.low_volume_threshold = threshold;
        }
        Some(config)
    } else {
        None
    };

    let result = api.reconcile_date(ReconcileRequest { settlement_date, config })?;
    emit_json(serde_json::to_value(&result).context("failed to serialize reconcile result")?)
}

fn run_audit_list(args: &AuditListArgs, api: &BmReconApi) -> Result<()> {
    let settlement_date = parse_date_arg(&args.date)?;
    let exclusions = api.audit_trail(settlement_date)?;
    emit_json(serde_json::json!({
        "settlement_date": args.date,
        "exclusions": exclusions
    }))
}

fn run_summary(args: &SummaryArgs, api: &BmReconApi) -> Result<()> {
    let settlement_date = parse_date_arg(&args.date)?;
    let summaries = api.revenue_summaries(settlement_date)?;
    emit_json(serde_json::json!({
        "settlement_date": args.date,
        "summaries": summaries
    }))
}

fn run_report_show(args: &ReportShowArgs, api: &BmReconApi) -> Result<()> {
    let report = api.report_show(&args.report_id)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize report")?)
}

fn parse_date_arg(raw: &str) -> Result<Date> {
    parse_settlement_date(raw).map_err(|err| anyhow!("{err}"))
}

fn read_ndjson_records(path: &Path) -> Result<Vec<VersionedRecord>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read records file {}", path.display()))?;

    let mut records = Vec::new();
    for (index, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: VersionedRecord = serde_json::from_str(line).with_context(|| {
            format!("failed to parse record on line {} of {}", index + 1, path.display())
        })?;
        records.push(record);
    }
    Ok(records)
}

fn read_hex_key_file(path: &Path) -> Result<[u8; 32]> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let trimmed = body.trim();
    let bytes = hex::decode(trimmed)
        .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "key file {} must decode to exactly 32 bytes (got {})",
            path.display(),
            bytes.len()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn write_manifest_signature(out_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature key: {err}"))?;
    mac.update(manifest_bytes);
    let signature_hex = hex::encode(mac.finalize().into_bytes());
    let signature_path = out_dir.join(MANIFEST_SIG_FILE);
    fs::write(&signature_path, signature_hex)
        .with_context(|| format!("failed to write manifest signature {}", signature_path.display()))
}

fn verify_manifest_signature(in_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let signature_path = in_dir.join(MANIFEST_SIG_FILE);
    let signature_body = fs::read_to_string(&signature_path).with_context(|| {
        format!("failed to read manifest signature file {}", signature_path.display())
    })?;
    let signature = hex::decode(signature_body.trim()).with_context(|| {
        format!("manifest signature file is not valid hex: {}", signature_path.display())
    })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature verification key: {err}"))?;
    mac.update(manifest_bytes);
    mac.verify_slice(&signature).map_err(|_| {
        anyhow!("manifest signature verification failed for {}", signature_path.display())
    })
}

fn check_import_signature(
    input_dir: &Path,
    verify_key: Option<&[u8; 32]>,
    allow_unsigned: bool,
) -> Result<()> {
    let manifest_path = input_dir.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;

    let signature_path = input_dir.join(MANIFEST_SIG_FILE);
    if signature_path.exists() {
        let key = verify_key.ok_or_else(|| {
            anyhow!(
                "snapshot is signed; provide --verify-key-file to verify {}",
                signature_path.display()
            )
        })?;
        verify_manifest_signature(input_dir, &manifest_bytes, key)?;
    } else if !allow_unsigned {
        return Err(anyhow!(
            "snapshot is unsigned; rerun with --allow-unsigned for explicit override"
        ));
    }

    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display()))?;
    }
    Ok(())
}
