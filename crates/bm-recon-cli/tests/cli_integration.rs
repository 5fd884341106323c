use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_bmr<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_bmr"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute bmr binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_bmr(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "bmr command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_f64(value: &Value, key: &str) -> f64 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing number field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_day_fixture(dir: &Path) -> PathBuf {
    // One matched acceptance, one submission, and one SO-flagged test acceptance.
    let lines = [
        r#"{"bm_unit":"T_DRAXX-1","settlement_date":"2026-01-15","revision":2,"payload":{"record_type":"acceptance","payload":{"acceptance_number":9001,"period_from":10,"period_to":10,"level_from":100.0,"level_to":150.0,"so_flag":false,"storage_flag":false}}}"#,
        r#"{"bm_unit":"T_DRAXX-1","settlement_date":"2026-01-15","revision":1,"payload":{"record_type":"submission","payload":{"period":10,"pair_id":1,"offer_price":45.0,"bid_price":30.0}}}"#,
        r#"{"bm_unit":"T_TESTU-1","settlement_date":"2026-01-15","revision":1,"payload":{"record_type":"acceptance","payload":{"acceptance_number":9002,"period_from":40,"period_to":42,"level_from":50.0,"level_to":0.0,"so_flag":true,"storage_flag":false}}}"#,
    ];
    let path = dir.join("records.ndjson");
    fs::write(&path, lines.join("\n"))
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
    path
}

#[test]
fn db_commands_cover_migrate_integrity_backup_restore_export_import() {
    let sandbox = unique_temp_dir("bmrecon-cli-db");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let db_c = sandbox.join("c.sqlite3");
    let export_dir = sandbox.join("export");
    let backup_file = sandbox.join("backup.sqlite3");
    let fixture = write_day_fixture(&sandbox);

    let schema_before = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db_a), "db", "migrate", "--dry-run"]);
    assert_eq!(as_i64(&dry_run, "current_version"), 0);
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 2);

    let schema_after_dry_run = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db_a), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let ingest = run_json(["--db", path_str(&db_a), "ingest", "--file", path_str(&fixture)]);
    let ingest_summary = ingest
        .get("summary")
        .unwrap_or_else(|| panic!("ingest output should include summary: {ingest}"));
    assert_eq!(as_i64(ingest_summary, "inserted"), 3);

    let integrity = run_json(["--db", path_str(&db_a), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));

    let backup =
        run_json(["--db", path_str(&db_a), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(Path::new(as_str(&backup, "backup_path")).exists());

    let export =
        run_json(["--db", path_str(&db_a), "db", "export", "--out", path_str(&export_dir)]);
    let manifest = export
        .get("manifest")
        .unwrap_or_else(|| panic!("export should include manifest: {export}"));
    assert_eq!(as_array(manifest, "files").len(), 2);
    assert!(export_dir.join("manifest.json").exists());
    assert!(!export_dir.join("manifest.sig").exists());

    let import = run_json([
        "--db",
        path_str(&db_b),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--allow-unsigned",
    ]);
    let import_summary = import
        .get("summary")
        .unwrap_or_else(|| panic!("import output should include summary: {import}"));
    assert_eq!(as_i64(import_summary, "imported_records"), 3);
    assert_eq!(as_i64(import_summary, "skipped_existing_records"), 0);

    let restore =
        run_json(["--db", path_str(&db_c), "db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restore, "current_version"), 2);

    let restored_ingest =
        run_json(["--db", path_str(&db_c), "ingest", "--file", path_str(&fixture)]);
    let restored_summary = restored_ingest
        .get("summary")
        .unwrap_or_else(|| panic!("ingest output should include summary: {restored_ingest}"));
    // Restored database already holds the fixture records.
    assert_eq!(as_i64(restored_summary, "duplicates_skipped"), 3);
}

#[test]
fn signed_export_verifies_and_rejects_tampering() {
    let sandbox = unique_temp_dir("bmrecon-cli-signed");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let export_dir = sandbox.join("export");
    let key_file = sandbox.join("signing.key");
    let fixture = write_day_fixture(&sandbox);

    fs::write(&key_file, "a3f1c2d4e5b6978811223344556677889900aabbccddeeff0011223344556677")
        .unwrap_or_else(|err| panic!("failed to write key file: {err}"));

    run_json(["--db", path_str(&db_a), "ingest", "--file", path_str(&fixture)]);
    run_json([
        "--db",
        path_str(&db_a),
        "db",
        "export",
        "--out",
        path_str(&export_dir),
        "--signing-key-file",
        path_str(&key_file),
    ]);
    assert!(export_dir.join("manifest.sig").exists());

    // Importing a signed snapshot without the key is refused.
    let missing_key = run_bmr([
        "--db",
        path_str(&db_b),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--allow-unsigned",
    ]);
    assert!(!missing_key.status.success());
    let stderr = String::from_utf8_lossy(&missing_key.stderr);
    assert!(stderr.contains("snapshot is signed"), "unexpected stderr: {stderr}");

    let import = run_json([
        "--db",
        path_str(&db_b),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--verify-key-file",
        path_str(&key_file),
    ]);
    let summary = import
        .get("summary")
        .unwrap_or_else(|| panic!("import output should include summary: {import}"));
    assert_eq!(as_i64(summary, "imported_records"), 3);

    // Any manifest edit invalidates the signature.
    let manifest_path = export_dir.join("manifest.json");
    let mut manifest_bytes = fs::read(&manifest_path)
        .unwrap_or_else(|err| panic!("failed to read manifest: {err}"));
    manifest_bytes.push(b'\n');
    fs::write(&manifest_path, &manifest_bytes)
        .unwrap_or_else(|err| panic!("failed to rewrite manifest: {err}"));

    let tampered = run_bmr([
        "--db",
        path_str(&db_b),
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--verify-key-file",
        path_str(&key_file),
    ]);
    assert!(!tampered.status.success());
    let stderr = String::from_utf8_lossy(&tampered.stderr);
    assert!(stderr.contains("signature verification failed"), "unexpected stderr: {stderr}");
}

#[test]
fn reconcile_flow_produces_report_audit_and_summaries() {
    let sandbox = unique_temp_dir("bmrecon-cli-reconcile");
    let db = sandbox.join("recon.sqlite3");
    let fixture = write_day_fixture(&sandbox);

    run_json(["--db", path_str(&db), "ingest", "--file", path_str(&fixture)]);

    let result = run_json(["--db", path_str(&db), "reconcile", "--date", "2026-01-15"]);
    assert_eq!(as_i64(&result, "exclusions_recorded"), 1);
    assert_eq!(as_i64(&result, "summaries_recorded"), 1);

    let report = result
        .get("report")
        .unwrap_or_else(|| panic!("reconcile output should include report: {result}"));
    assert_eq!(as_str(report, "report_id"), "recon_2026-01-15");

    let valid = as_array(report, "valid");
    assert_eq!(valid.len(), 1);
    let price = valid[0]
        .get("price")
        .unwrap_or_else(|| panic!("validation result should include price: {report}"));
    assert_eq!(as_str(price, "selection_rule"), "offer_selected");
    assert!((as_f64(price, "selected_price") - 45.0).abs() < f64::EPSILON);
    assert!((as_f64(price, "volume_mw") - 50.0).abs() < f64::EPSILON);

    let audit = run_json(["--db", path_str(&db), "audit", "list", "--date", "2026-01-15"]);
    let exclusions = as_array(&audit, "exclusions");
    assert_eq!(exclusions.len(), 1);
    assert_eq!(as_str(&exclusions[0], "outcome"), "so_test");
    assert_eq!(as_i64(&exclusions[0], "acceptance_number"), 9002);

    let summary = run_json(["--db", path_str(&db), "summary", "--date", "2026-01-15"]);
    let summaries = as_array(&summary, "summaries");
    assert_eq!(summaries.len(), 1);
    let revenue = summaries[0]
        .get("summary")
        .unwrap_or_else(|| panic!("summary row should nest the revenue summary: {summary}"));
    assert_eq!(as_str(revenue, "bm_unit"), "T_DRAXX-1");
    assert!((as_f64(revenue, "revenue_gbp") - 2250.0).abs() < f64::EPSILON);

    let shown = run_json(["--db", path_str(&db), "report", "show", "--report-id", "recon_2026-01-15"]);
    assert_eq!(as_str(&shown, "report_id"), "recon_2026-01-15");
    assert_eq!(as_str(&shown, "contract_version"), "cli.v1");

    // Re-running the same date upserts instead of duplicating rows.
    run_json(["--db", path_str(&db), "reconcile", "--date", "2026-01-15"]);
    let audit_again = run_json(["--db", path_str(&db), "audit", "list", "--date", "2026-01-15"]);
    assert_eq!(as_array(&audit_again, "exclusions").len(), 1);
}

#[test]
fn gaps_scan_reports_missing_and_partial_dates() {
    let sandbox = unique_temp_dir("bmrecon-cli-gaps");
    let db = sandbox.join("gaps.sqlite3");
    let fixture = write_day_fixture(&sandbox);

    run_json(["--db", path_str(&db), "ingest", "--file", path_str(&fixture)]);

    let result = run_json([
        "--db",
        path_str(&db),
        "gaps",
        "--start",
        "2026-01-14",
        "--end",
        "2026-01-16",
    ]);
    assert_eq!(as_i64(&result, "min_periods"), 48);
    let missing: Vec<&str> =
        as_array(&result, "missing_dates").iter().filter_map(Value::as_str).collect();
    assert_eq!(missing, vec!["2026-01-14", "2026-01-16"]);
    let under: Vec<&str> =
        as_array(&result, "under_covered_dates").iter().filter_map(Value::as_str).collect();
    assert_eq!(under, vec!["2026-01-15"]);
}

#[test]
fn invalid_date_argument_is_rejected() {
    let sandbox = unique_temp_dir("bmrecon-cli-baddate");
    let db = sandbox.join("baddate.sqlite3");

    let output = run_bmr(["--db", path_str(&db), "reconcile", "--date", "2026-13-99"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid settlement date"), "unexpected stderr: {stderr}");
}

#[test]
fn custom_thresholds_change_classification() {
    let sandbox = unique_temp_dir("bmrecon-cli-thresholds");
    let db = sandbox.join("thresholds.sqlite3");
    let fixture = write_day_fixture(&sandbox);

    run_json(["--db", path_str(&db), "ingest", "--file", path_str(&fixture)]);

    // A 40.0 GBP/MWh ceiling pushes the 45.0 derived price into the audit trail.
    let result = run_json([
        "--db",
        path_str(&db),
        "reconcile",
        "--date",
        "2026-01-15",
        "--price-outlier-threshold",
        "40.0",
    ]);
    let report = result
        .get("report")
        .unwrap_or_else(|| panic!("reconcile output should include report: {result}"));
    assert_eq!(as_array(report, "valid").len(), 0);

    let outcomes: Vec<&str> = as_array(report, "exclusions")
        .iter()
        .filter_map(|row| row.get("outcome").and_then(Value::as_str))
        .collect();
    assert!(outcomes.contains(&"price_outlier"), "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&"so_test"), "outcomes: {outcomes:?}");
}
