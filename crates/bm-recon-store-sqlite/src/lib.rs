use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bm_recon_core::{
    parse_settlement_date, AcceptancePayload, BmUnitId, Outcome, ReconReport, RecordPayload,
    RevenueSummary, SelectionRule, SettlementPeriod, SubmissionPayload, ValidationResult,
    VersionedRecord,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::Date;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS acceptance_records (
  bm_unit TEXT NOT NULL,
  settlement_date TEXT NOT NULL,
  acceptance_number INTEGER NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 0),
  period_from INTEGER NOT NULL CHECK (period_from BETWEEN 1 AND 50),
  period_to INTEGER NOT NULL CHECK (period_to BETWEEN 1 AND 50),
  level_from REAL NOT NULL,
  level_to REAL NOT NULL,
  so_flag INTEGER NOT NULL CHECK (so_flag IN (0, 1)),
  storage_flag INTEGER NOT NULL CHECK (storage_flag IN (0, 1)),
  ingested_at TEXT NOT NULL,
  PRIMARY KEY (bm_unit, settlement_date, acceptance_number, revision)
);

CREATE TABLE IF NOT EXISTS submission_records (
  bm_unit TEXT NOT NULL,
  settlement_date TEXT NOT NULL,
  period INTEGER NOT NULL CHECK (period BETWEEN 1 AND 50),
  pair_id INTEGER NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 0),
  offer_price REAL NOT NULL,
  bid_price REAL NOT NULL,
  ingested_at TEXT NOT NULL,
  PRIMARY KEY (bm_unit, settlement_date, period, pair_id, revision)
);

CREATE INDEX IF NOT EXISTS idx_acceptance_records_date ON acceptance_records(settlement_date);
CREATE INDEX IF NOT EXISTS idx_submission_records_date ON submission_records(settlement_date);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS audit_exclusions (
  bm_unit TEXT NOT NULL,
  settlement_date TEXT NOT NULL,
  acceptance_number INTEGER NOT NULL,
  period INTEGER NOT NULL CHECK (period BETWEEN 0 AND 50),
  revision INTEGER NOT NULL CHECK (revision >= 0),
  outcome TEXT NOT NULL CHECK (outcome IN ('price_outlier','so_test','low_volume','unmatched')),
  selection_rule TEXT NOT NULL CHECK (selection_rule IN ('offer_selected','bid_selected','neutral_average','unmatched')),
  selected_price REAL,
  volume_mw REAL NOT NULL,
  reason TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  PRIMARY KEY (bm_unit, settlement_date, acceptance_number, period, revision)
);

CREATE TABLE IF NOT EXISTS revenue_summaries (
  bm_unit TEXT NOT NULL,
  settlement_date TEXT NOT NULL,
  revenue_gbp REAL NOT NULL,
  volume_mw REAL NOT NULL,
  acceptance_count INTEGER NOT NULL CHECK (acceptance_count >= 0),
  report_id TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (bm_unit, settlement_date)
);

CREATE TABLE IF NOT EXISTS recon_reports (
  report_id TEXT PRIMARY KEY,
  settlement_date TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  report_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_exclusions_date ON audit_exclusions(settlement_date);
CREATE INDEX IF NOT EXISTS idx_revenue_summaries_date ON revenue_summaries(settlement_date);
";

// audit_exclusions.period uses 0 for "no matched period" (unmatched rows) so
// the upsert key stays total; SQLite treats NULLs in a composite key as
// distinct, which would break idempotent re-runs.
const UNMATCHED_PERIOD_SENTINEL: i64 = 0;

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted,
    DuplicateSkipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub duplicates_skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditExclusionRow {
    pub bm_unit: BmUnitId,
    #[serde(with = "bm_recon_core::serde_date")]
    pub settlement_date: Date,
    pub acceptance_number: i64,
    pub period: Option<SettlementPeriod>,
    pub revision: u32,
    pub outcome: Outcome,
    pub selection_rule: SelectionRule,
    pub selected_price: Option<f64>,
    pub volume_mw: f64,
    pub reason: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRow {
    pub summary: RevenueSummary,
    pub report_id: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_existing_records: usize,
    pub imported_reports: usize,
    pub skipped_existing_reports: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version < 2 {
            self.conn.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
            record_schema_version(&self.conn, 2)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one validated versioned record, append-only.
    ///
    /// A republication identical to an already-stored (key, revision) row is
    /// skipped; a divergent payload at an already-stored (key, revision) is
    /// rejected so upstream feed corruption never silently overwrites data.
    ///
    /// # Errors
    /// Returns an error when validation fails, a divergent republication is
    /// detected, or the write transaction fails.
    pub fn ingest_record(&mut self, record: &VersionedRecord) -> Result<IngestOutcome> {
        record.validate().map_err(|err| anyhow!("record validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start ingest transaction")?;
        let outcome = match &record.payload {
            RecordPayload::Acceptance(event) => Self::ingest_acceptance(&tx, record, event)?,
            RecordPayload::Submission(submission) => {
                Self::ingest_submission(&tx, record, submission)?
            }
        };
        tx.commit().context("failed to commit ingest transaction")?;
        Ok(outcome)
    }

    /// Ingest a batch of records, tallying inserts and skipped duplicates.
    ///
    /// # Errors
    /// Returns an error on the first record that fails to ingest.
    pub fn ingest_records(&mut self, records: &[VersionedRecord]) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        for record in records {
            match self.ingest_record(record)? {
                IngestOutcome::Inserted => summary.inserted += 1,
                IngestOutcome::DuplicateSkipped => summary.duplicates_skipped += 1,
            }
        }
        Ok(summary)
    }

    fn ingest_acceptance(
        tx: &rusqlite::Transaction<'_>,
        record: &VersionedRecord,
        event: &AcceptancePayload,
    ) -> Result<IngestOutcome> {
        let existing = tx
            .query_row(
                "SELECT period_from, period_to, level_from, level_to, so_flag, storage_flag
                 FROM acceptance_records
                 WHERE bm_unit = ?1 AND settlement_date = ?2
                   AND acceptance_number = ?3 AND revision = ?4",
                params![
                    record.bm_unit.as_str(),
                    date_text(record.settlement_date),
                    event.acceptance_number,
                    i64::from(record.revision),
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to probe for existing acceptance row")?;

        if let Some((period_from, period_to, level_from, level_to, so_flag, storage_flag)) =
            existing
        {
            let identical = period_from == i64::from(event.period_from.get())
                && period_to == i64::from(event.period_to.get())
                && level_from.to_bits() == event.level_from.to_bits()
                && level_to.to_bits() == event.level_to.to_bits()
                && so_flag == i64::from(event.so_flag)
                && storage_flag == i64::from(event.storage_flag);
            if identical {
                return Ok(IngestOutcome::DuplicateSkipped);
            }
            return Err(anyhow!(
                "conflicting payloads at revision {} for acceptance {}/{}/{}",
                record.revision,
                record.bm_unit,
                date_text(record.settlement_date),
                event.acceptance_number
            ));
        }

        tx.execute(
            "INSERT INTO acceptance_records(
                bm_unit, settlement_date, acceptance_number, revision,
                period_from, period_to, level_from, level_to, so_flag, storage_flag, ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.bm_unit.as_str(),
                date_text(record.settlement_date),
                event.acceptance_number,
                i64::from(record.revision),
                i64::from(event.period_from.get()),
                i64::from(event.period_to.get()),
                event.level_from,
                event.level_to,
                i64::from(event.so_flag),
                i64::from(event.storage_flag),
                now_rfc3339()?,
            ],
        )
        .context("failed to insert acceptance record")?;

        Ok(IngestOutcome::Inserted)
    }

    fn ingest_submission(
        tx: &rusqlite::Transaction<'_>,
        record: &VersionedRecord,
        submission: &SubmissionPayload,
    ) -> Result<IngestOutcome> {
        let existing = tx
            .query_row(
                "SELECT offer_price, bid_price
                 FROM submission_records
                 WHERE bm_unit = ?1 AND settlement_date = ?2
                   AND period = ?3 AND pair_id = ?4 AND revision = ?5",
                params![
                    record.bm_unit.as_str(),
                    date_text(record.settlement_date),
                    i64::from(submission.period.get()),
                    i64::from(submission.pair_id),
                    i64::from(record.revision),
                ],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()
            .context("failed to probe for existing submission row")?;

        if let Some((offer_price, bid_price)) = existing {
            let identical = offer_price.to_bits() == submission.offer_price.to_bits()
                && bid_price.to_bits() == submission.bid_price.to_bits();
            if identical {
                return Ok(IngestOutcome::DuplicateSkipped);
            }
            return Err(anyhow!(
                "conflicting payloads at revision {} for submission {}/{}/sp{}/pair{}",
                record.revision,
                record.bm_unit,
                date_text(record.settlement_date),
                submission.period,
                submission.pair_id
            ));
        }

        tx.execute(
            "INSERT INTO submission_records(
                bm_unit, settlement_date, period, pair_id, revision,
                offer_price, bid_price, ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.bm_unit.as_str(),
                date_text(record.settlement_date),
                i64::from(submission.period.get()),
                i64::from(submission.pair_id),
                i64::from(record.revision),
                submission.offer_price,
                submission.bid_price,
                now_rfc3339()?,
            ],
        )
        .context("failed to insert submission record")?;

        Ok(IngestOutcome::Inserted)
    }

    /// Load every stored revision of every record for one settlement date.
    ///
    /// All revisions come back; revision resolution is the kernel's job, so
    /// divergence between equal revisions surfaces there instead of being
    /// collapsed by the read path.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn records_for_date(&self, settlement_date: Date) -> Result<Vec<VersionedRecord>> {
        let date = date_text(settlement_date);
        let mut records = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT bm_unit, revision, acceptance_number, period_from, period_to,
                    level_from, level_to, so_flag, storage_flag
             FROM acceptance_records
             WHERE settlement_date = ?1
             ORDER BY bm_unit ASC, acceptance_number ASC, revision ASC",
        )?;
        let mut rows = stmt.query(params![date])?;
        while let Some(row) = rows.next()? {
            records.push(VersionedRecord {
                bm_unit: BmUnitId::new(row.get::<_, String>(0)?),
                settlement_date,
                revision: revision_from_i64(row.get(1)?)?,
                payload: RecordPayload::Acceptance(AcceptancePayload {
                    acceptance_number: row.get(2)?,
                    period_from: period_from_i64(row.get(3)?)?,
                    period_to: period_from_i64(row.get(4)?)?,
                    level_from: row.get(5)?,
                    level_to: row.get(6)?,
                    so_flag: row.get::<_, i64>(7)? != 0,
                    storage_flag: row.get::<_, i64>(8)? != 0,
                }),
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT bm_unit, revision, period, pair_id, offer_price, bid_price
             FROM submission_records
             WHERE settlement_date = ?1
             ORDER BY bm_unit ASC, period ASC, pair_id ASC, revision ASC",
        )?;
        let mut rows = stmt.query(params![date])?;
        while let Some(row) = rows.next()? {
            records.push(VersionedRecord {
                bm_unit: BmUnitId::new(row.get::<_, String>(0)?),
                settlement_date,
                revision: revision_from_i64(row.get(1)?)?,
                payload: RecordPayload::Submission(SubmissionPayload {
                    period: period_from_i64(row.get(2)?)?,
                    pair_id: pair_id_from_i64(row.get(3)?)?,
                    offer_price: row.get(4)?,
                    bid_price: row.get(5)?,
                }),
            });
        }

        Ok(records)
    }

    /// Every settlement date with at least one stored record of either type.
    ///
    /// # Errors
    /// Returns an error when coverage rows cannot be read.
    pub fn covered_dates(&self) -> Result<BTreeSet<Date>> {
        let mut stmt = self.conn.prepare(
            "SELECT settlement_date FROM acceptance_records
             UNION
             SELECT settlement_date FROM submission_records",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut dates = BTreeSet::new();
        for row in rows {
            let raw = row?;
            dates.insert(
                parse_settlement_date(&raw)
                    .map_err(|err| anyhow!("invalid stored settlement_date {raw}: {err}"))?,
            );
        }
        Ok(dates)
    }

    /// Distinct submission periods stored per settlement date, for
    /// partial-coverage detection.
    ///
    /// # Errors
    /// Returns an error when coverage rows cannot be read.
    pub fn submission_period_counts(&self) -> Result<BTreeMap<Date, usize>> {
        let mut stmt = self.conn.prepare(
            "SELECT settlement_date, COUNT(DISTINCT period)
             FROM submission_records
             GROUP BY settlement_date",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (raw, count) = row?;
            let date = parse_settlement_date(&raw)
                .map_err(|err| anyhow!("invalid stored settlement_date {raw}: {err}"))?;
            let count = usize::try_from(count)
                .map_err(|_| anyhow!("negative period count for {raw}"))?;
            counts.insert(date, count);
        }
        Ok(counts)
    }

    /// Idempotently record one excluded derived price in the audit trail.
    ///
    /// Keyed on (unit, date, acceptance, period, revision); re-running a
    /// day's reconciliation updates the row instead of duplicating it.
    ///
    /// # Errors
    /// Returns an error when the result is valid (valid rows belong to
    /// revenue summaries) or the write fails.
    pub fn upsert_exclusion(&mut self, result: &ValidationResult) -> Result<()> {
        if result.outcome == Outcome::Valid {
            return Err(anyhow!(
                "valid results belong to revenue summaries, not the audit trail"
            ));
        }
        let reason = result
            .reason
            .as_deref()
            .ok_or_else(|| anyhow!("excluded result is missing its audit reason"))?;

        let period = result
            .price
            .period
            .map_or(UNMATCHED_PERIOD_SENTINEL, |period| i64::from(period.get()));

        self.conn
            .execute(
                "INSERT INTO audit_exclusions(
                    bm_unit, settlement_date, acceptance_number, period, revision,
                    outcome, selection_rule, selected_price, volume_mw, reason, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(bm_unit, settlement_date, acceptance_number, period, revision)
                DO UPDATE SET
                    outcome = excluded.outcome,
                    selection_rule = excluded.selection_rule,
                    selected_price = excluded.selected_price,
                    volume_mw = excluded.volume_mw,
                    reason = excluded.reason,
                    recorded_at = excluded.recorded_at",
                params![
                    result.price.bm_unit.as_str(),
                    date_text(result.price.settlement_date),
                    result.price.acceptance_number,
                    period,
                    i64::from(result.price.revision),
                    result.outcome.as_str(),
                    result.price.selection_rule.as_str(),
                    result.price.selected_price,
                    result.price.volume_mw,
                    reason,
                    now_rfc3339()?,
                ],
            )
            .context("failed to upsert audit exclusion")?;
        Ok(())
    }

    /// Audit exclusions for one settlement date, in key order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn exclusions_for_date(&self, settlement_date: Date) -> Result<Vec<AuditExclusionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT bm_unit, acceptance_number, period, revision, outcome,
                    selection_rule, selected_price, volume_mw, reason, recorded_at
             FROM audit_exclusions
             WHERE settlement_date = ?1
             ORDER BY bm_unit ASC, acceptance_number ASC, period ASC, revision ASC",
        )?;

        let mut rows = stmt.query(params![date_text(settlement_date)])?;
        let mut exclusions = Vec::new();
        while let Some(row) = rows.next()? {
            let outcome_raw: String = row.get(4)?;
            let rule_raw: String = row.get(5)?;
            let period_raw: i64 = row.get(2)?;
            let period = if period_raw == UNMATCHED_PERIOD_SENTINEL {
                None
            } else {
                Some(period_from_i64(period_raw)?)
            };

            exclusions.push(AuditExclusionRow {
                bm_unit: BmUnitId::new(row.get::<_, String>(0)?),
                settlement_date,
                acceptance_number: row.get(1)?,
                period,
                revision: revision_from_i64(row.get(3)?)?,
                outcome: Outcome::parse(&outcome_raw)
                    .ok_or_else(|| anyhow!("unknown outcome: {outcome_raw}"))?,
                selection_rule: SelectionRule::parse(&rule_raw)
                    .ok_or_else(|| anyhow!("unknown selection_rule: {rule_raw}"))?,
                selected_price: row.get(6)?,
                volume_mw: row.get(7)?,
                reason: row.get(8)?,
                recorded_at: row.get(9)?,
            });
        }

        Ok(exclusions)
    }

    /// Idempotently record one per-unit revenue summary for a report run.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_summary(&mut self, summary: &RevenueSummary, report_id: &str) -> Result<()> {
        let acceptance_count = i64::try_from(summary.acceptance_count)
            .map_err(|_| anyhow!("acceptance count overflows storage"))?;

        self.conn
            .execute(
                "INSERT INTO revenue_summaries(
                    bm_unit, settlement_date, revenue_gbp, volume_mw,
                    acceptance_count, report_id, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(bm_unit, settlement_date)
                DO UPDATE SET
                    revenue_gbp = excluded.revenue_gbp,
                    volume_mw = excluded.volume_mw,
                    acceptance_count = excluded.acceptance_count,
                    report_id = excluded.report_id,
                    updated_at = excluded.updated_at",
                params![
                    summary.bm_unit.as_str(),
                    date_text(summary.settlement_date),
                    summary.revenue_gbp,
                    summary.volume_mw,
                    acceptance_count,
                    report_id,
                    now_rfc3339()?,
                ],
            )
            .context("failed to upsert revenue summary")?;
        Ok(())
    }

    /// Revenue summaries for one settlement date, ordered by unit.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn summaries_for_date(&self, settlement_date: Date) -> Result<Vec<SummaryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT bm_unit, revenue_gbp, volume_mw, acceptance_count, report_id, updated_at
             FROM revenue_summaries
             WHERE settlement_date = ?1
             ORDER BY bm_unit ASC",
        )?;

        let mut rows = stmt.query(params![date_text(settlement_date)])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            let acceptance_count: i64 = row.get(3)?;
            summaries.push(SummaryRow {
                summary: RevenueSummary {
                    bm_unit: BmUnitId::new(row.get::<_, String>(0)?),
                    settlement_date,
                    revenue_gbp: row.get(1)?,
                    volume_mw: row.get(2)?,
                    acceptance_count: usize::try_from(acceptance_count)
                        .map_err(|_| anyhow!("negative acceptance count in storage"))?,
                },
                report_id: row.get(4)?,
                updated_at: row.get(5)?,
            });
        }

        Ok(summaries)
    }

    /// Persist one reconciliation report artifact, replacing a previous run
    /// for the same deterministic report id.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn save_report(&mut self, report: &ReconReport) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO recon_reports(
                    report_id, settlement_date, generated_at, report_json
                ) VALUES (?1, ?2, ?3, ?4)",
                params![
                    report.report_id,
                    date_text(report.settlement_date),
                    now_rfc3339()?,
                    serde_json::to_string(report).context("failed to serialize recon report")?,
                ],
            )
            .context("failed to persist recon report")?;
        Ok(())
    }

    /// Retrieve a reconciliation report by its deterministic identifier.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_report(&self, report_id: &str) -> Result<Option<ReconReport>> {
        let mut stmt = self
            .conn
            .prepare("SELECT report_json FROM recon_reports WHERE report_id = ?1")?;
        let value = stmt
            .query_row(params![report_id], |row| row.get::<_, String>(0))
            .optional()?;

        match value {
            Some(json) => {
                let report = serde_json::from_str(&json)
                    .context("failed to deserialize stored recon report")?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    /// Export raw records and reports as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list_all_records()?;
        let reports = self.list_reports()?;

        let records_path = out_dir.join("raw_records.ndjson");
        let record_digest = write_ndjson_file(&records_path, &records)?;

        let reports_path = out_dir.join("recon_reports.ndjson");
        let report_digest = write_ndjson_file(&reports_path, &reports)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "raw_records.ndjson".to_string(),
                    sha256: record_digest.0,
                    records: record_digest.1,
                },
                ExportFileDigest {
                    path: "recon_reports.ndjson".to_string(),
                    sha256: report_digest.0,
                    records: report_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing,
    /// duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest_path = in_dir.join("manifest.json");
        let manifest = read_export_manifest(&manifest_path)?;
        validate_import_manifest(in_dir, &manifest)?;

        let records_path = in_dir.join("raw_records.ndjson");
        let reports_path = in_dir.join("recon_reports.ndjson");

        let mut summary = ImportSummary::default();

        for record in read_ndjson_file::<VersionedRecord>(&records_path)? {
            match self.ingest_record(&record)? {
                IngestOutcome::Inserted => summary.imported_records += 1,
                IngestOutcome::DuplicateSkipped => {
                    if !skip_existing {
                        return Err(anyhow!("record already exists for {}", record.key()));
                    }
                    summary.skipped_existing_records += 1;
                }
            }
        }

        for report in read_ndjson_file::<ReconReport>(&reports_path)? {
            if self.report_exists(&report.report_id)? {
                if skip_existing {
                    summary.skipped_existing_reports += 1;
                    continue;
                }
                return Err(anyhow!("report already exists: {}", report.report_id));
            }
            self.save_report(&report)?;
            summary.imported_reports += 1;
        }

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn list_all_records(&self) -> Result<Vec<VersionedRecord>> {
        let mut dates = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT settlement_date FROM acceptance_records
                 UNION
                 SELECT settlement_date FROM submission_records
                 ORDER BY settlement_date ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let raw = row?;
                dates.push(
                    parse_settlement_date(&raw)
                        .map_err(|err| anyhow!("invalid stored settlement_date {raw}: {err}"))?,
                );
            }
        }

        let mut records = Vec::new();
        for date in dates {
            records.extend(self.records_for_date(date)?);
        }
        Ok(records)
    }

    fn list_reports(&self) -> Result<Vec<ReconReport>> {
        let mut stmt = self
            .conn
            .prepare("SELECT report_json FROM recon_reports ORDER BY report_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut reports = Vec::new();
        for row in rows {
            let raw = row?;
            let parsed = serde_json::from_str::<ReconReport>(&raw)
                .context("failed to deserialize recon report row")?;
            reports.push(parsed);
        }
        Ok(reports)
    }

    fn report_exists(&self, report_id: &str) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM recon_reports WHERE report_id = ?1)",
            params![report_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn date_text(date: Date) -> String {
    date.to_string()
}

fn revision_from_i64(raw: i64) -> Result<u32> {
    u32::try_from(raw).map_err(|_| anyhow!("invalid stored revision: {raw}"))
}

fn period_from_i64(raw: i64) -> Result<SettlementPeriod> {
    let index = u8::try_from(raw).map_err(|_| anyhow!("invalid stored period: {raw}"))?;
    SettlementPeriod::new(index).map_err(|err| anyhow!("invalid stored period {raw}: {err}"))
}

fn pair_id_from_i64(raw: i64) -> Result<i32> {
    i32::try_from(raw).map_err(|_| anyhow!("invalid stored pair_id: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in ["raw_records.ndjson", "recon_reports.ndjson"] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
