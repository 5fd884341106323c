use std::path::PathBuf;

use anyhow::{anyhow, Result};
use bm_recon_core::{
    missing_dates, reconcile_day, under_covered_dates, ReconConfig, ReconReport, VersionedRecord,
};
use bm_recon_store_sqlite::{
    AuditExclusionRow, IngestSummary, SchemaStatus, SqliteStore, SummaryRow,
};
use serde::{Deserialize, Serialize};
use time::Date;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapScanRequest {
    #[serde(with = "bm_recon_core::serde_date")]
    pub start: Date,
    #[serde(with = "bm_recon_core::serde_date")]
    pub end: Date,
    /// Minimum distinct submission periods before a covered date counts as
    /// complete. Defaults to the configured expectation (48).
    pub min_periods: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapScanResult {
    #[serde(with = "bm_recon_core::serde_date")]
    pub start: Date,
    #[serde(with = "bm_recon_core::serde_date")]
    pub end: Date,
    pub min_periods: usize,
    pub missing_dates: Vec<String>,
    pub under_covered_dates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileRequest {
    #[serde(with = "bm_recon_core::serde_date")]
    pub settlement_date: Date,
    pub config: Option<ReconConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileResult {
    pub report: ReconReport,
    pub exclusions_recorded: usize,
    pub summaries_recorded: usize,
}

/// Typed operation surface over the store and the reconciliation kernel.
/// Each operation opens the database, migrates to the latest schema, and
/// delegates; callers hold no connection state.
#[derive(Debug, Clone)]
pub struct BmReconApi {
    db_path: PathBuf,
}

impl BmReconApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Ingest a batch of versioned records, append-only.
    ///
    /// # Errors
    /// Returns an error when validation, divergence detection, or writes fail.
    pub fn ingest(&self, records: &[VersionedRecord]) -> Result<IngestSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.ingest_records(records)
    }

    /// Scan a date window for fully missing and partially covered dates.
    ///
    /// # Errors
    /// Returns an error when the window is inverted or coverage cannot be read.
    pub fn scan_gaps(&self, input: GapScanRequest) -> Result<GapScanResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let min_periods = input
            .min_periods
            .unwrap_or(usize::from(ReconConfig::default().expected_periods_per_day));

        let covered = store.covered_dates()?;
        let missing = missing_dates(input.start, input.end, &covered)?;

        let period_counts = store.submission_period_counts()?;
        let under = under_covered_dates(input.start, input.end, &period_counts, min_periods)?;

        Ok(GapScanResult {
            start: input.start,
            end: input.end,
            min_periods,
            missing_dates: missing.iter().map(ToString::to_string).collect(),
            under_covered_dates: under.iter().map(ToString::to_string).collect(),
        })
    }

    /// Reconcile one settlement date end-to-end and persist the outputs:
    /// the report artifact, audit exclusions, and revenue summaries.
    ///
    /// Re-running the same date upserts rather than duplicates.
    ///
    /// # Errors
    /// Returns an error when record loading, the kernel, or persistence fails.
    pub fn reconcile_date(&self, input: ReconcileRequest) -> Result<ReconcileResult> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let config = input.config.unwrap_or_default();
        let records = store.records_for_date(input.settlement_date)?;
        let report = reconcile_day(&records, input.settlement_date, &config)?;

        let mut exclusions_recorded = 0;
        for exclusion in &report.exclusions {
            store.upsert_exclusion(exclusion)?;
            exclusions_recorded += 1;
        }

        let mut summaries_recorded = 0;
        for summary in &report.summaries {
            store.upsert_summary(summary, &report.report_id)?;
            summaries_recorded += 1;
        }

        store.save_report(&report)?;

        Ok(ReconcileResult { report, exclusions_recorded, summaries_recorded })
    }

    /// Audit exclusions recorded for one settlement date.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn audit_trail(&self, settlement_date: Date) -> Result<Vec<AuditExclusionRow>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.exclusions_for_date(settlement_date)
    }

    /// Revenue summaries recorded for one settlement date.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn revenue_summaries(&self, settlement_date: Date) -> Result<Vec<SummaryRow>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.summaries_for_date(settlement_date)
    }

    /// Fetch a previously persisted reconciliation report.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the report does not exist.
    pub fn report_show(&self, report_id: &str) -> Result<ReconReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store
            .get_report(report_id)?
            .ok_or_else(|| anyhow!("report not found: {report_id}"))
    }
}

#[cfg(test)]
mod tests {
    use bm_recon_core::{
        AcceptancePayload, BmUnitId, Outcome, RecordPayload, SettlementPeriod, SubmissionPayload,
    };
    use time::macros::date;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("bmrecon-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn sp(index: u8) -> Result<SettlementPeriod> {
        SettlementPeriod::new(index).map_err(|err| anyhow!("fixture period {index}: {err}"))
    }

    fn day_fixture(day: Date) -> Result<Vec<VersionedRecord>> {
        Ok(vec![
            VersionedRecord {
                bm_unit: BmUnitId::new("T_DRAXX-1"),
                settlement_date: day,
                revision: 2,
                payload: RecordPayload::Acceptance(AcceptancePayload {
                    acceptance_number: 9001,
                    period_from: sp(10)?,
                    period_to: sp(10)?,
                    level_from: 100.0,
                    level_to: 150.0,
                    so_flag: false,
                    storage_flag: false,
                }),
            },
            VersionedRecord {
                bm_unit: BmUnitId::new("T_DRAXX-1"),
                settlement_date: day,
                revision: 1,
                payload: RecordPayload::Submission(SubmissionPayload {
                    period: sp(10)?,
                    pair_id: 1,
                    offer_price: 45.0,
                    bid_price: 30.0,
                }),
            },
            VersionedRecord {
                bm_unit: BmUnitId::new("T_TESTU-1"),
                settlement_date: day,
                revision: 1,
                payload: RecordPayload::Acceptance(AcceptancePayload {
                    acceptance_number: 9002,
                    period_from: sp(40)?,
                    period_to: sp(42)?,
                    level_from: 50.0,
                    level_to: 0.0,
                    so_flag: true,
                    storage_flag: false,
                }),
            },
        ])
    }

    #[test]
    fn api_ingest_reconcile_and_audit_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = BmReconApi::new(db_path.clone());
        let day = date!(2026 - 01 - 15);

        let summary = api.ingest(&day_fixture(day)?)?;
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.duplicates_skipped, 0);

        let result = api.reconcile_date(ReconcileRequest { settlement_date: day, config: None })?;
        assert_eq!(result.report.report_id, "recon_2026-01-15");
        assert_eq!(result.report.valid.len(), 1);
        assert_eq!(result.exclusions_recorded, 1);
        assert_eq!(result.summaries_recorded, 1);

        let audit = api.audit_trail(day)?;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, Outcome::SoTest);

        let summaries = api.revenue_summaries(day)?;
        assert_eq!(summaries.len(), 1);
        assert!((summaries[0].summary.revenue_gbp - 2250.0).abs() < f64::EPSILON);

        let report = api.report_show(&result.report.report_id)?;
        assert_eq!(report, result.report);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_reconcile_rerun_is_idempotent() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = BmReconApi::new(db_path.clone());
        let day = date!(2026 - 01 - 15);

        api.ingest(&day_fixture(day)?)?;
        // A re-fetched batch inserts nothing new.
        let second_ingest = api.ingest(&day_fixture(day)?)?;
        assert_eq!(second_ingest.inserted, 0);
        assert_eq!(second_ingest.duplicates_skipped, 3);

        let first = api.reconcile_date(ReconcileRequest { settlement_date: day, config: None })?;
        let second = api.reconcile_date(ReconcileRequest { settlement_date: day, config: None })?;
        assert_eq!(first.report, second.report);
        assert_eq!(api.audit_trail(day)?.len(), 1);
        assert_eq!(api.revenue_summaries(day)?.len(), 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_gap_scan_reports_missing_and_partial_dates() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = BmReconApi::new(db_path.clone());
        let covered_day = date!(2026 - 01 - 15);

        api.ingest(&day_fixture(covered_day)?)?;

        let result = api.scan_gaps(GapScanRequest {
            start: date!(2026 - 01 - 14),
            end: date!(2026 - 01 - 16),
            min_periods: None,
        })?;

        assert_eq!(result.min_periods, 48);
        assert_eq!(result.missing_dates, vec!["2026-01-14", "2026-01-16"]);
        // One stored submission period out of 48 expected.
        assert_eq!(result.under_covered_dates, vec!["2026-01-15"]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_dry_run_plans_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = BmReconApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!(plan.current_version, 0);
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        assert_eq!(plan.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
