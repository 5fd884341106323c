use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Date;

pub const MAX_SETTLEMENT_PERIOD: u8 = 50;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReconError {
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Serde helper for calendar settlement dates as `YYYY-MM-DD` strings.
pub mod serde_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::FormatItem;
    use time::macros::format_description;
    use time::Date;

    const FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");

    /// # Errors
    /// Fails when the date cannot be formatted.
    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = date.format(&FORMAT).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails when the input is not a `YYYY-MM-DD` date.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Date::parse(&raw, &FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Parse a `YYYY-MM-DD` settlement date.
///
/// # Errors
/// Returns [`ReconError::Validation`] when the input is not a calendar date.
pub fn parse_settlement_date(raw: &str) -> Result<Date, ReconError> {
    use time::macros::format_description;
    Date::parse(raw, &format_description!("[year]-[month]-[day]"))
        .map_err(|err| ReconError::Validation(format!("invalid settlement date {raw}: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BmUnitId(pub String);

impl BmUnitId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BmUnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A discrete half-hourly trading interval, indexed 1..=50.
///
/// Most days have 48 periods; clock-change days have 46 or 50.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct SettlementPeriod(u8);

impl SettlementPeriod {
    /// # Errors
    /// Returns [`ReconError::Validation`] when the index is outside 1..=50.
    pub fn new(index: u8) -> Result<Self, ReconError> {
        if (1..=MAX_SETTLEMENT_PERIOD).contains(&index) {
            Ok(Self(index))
        } else {
            Err(ReconError::Validation(format!(
                "settlement period {index} is outside 1..={MAX_SETTLEMENT_PERIOD}"
            )))
        }
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SettlementPeriod {
    type Error = ReconError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index)
    }
}

impl From<SettlementPeriod> for u8 {
    fn from(period: SettlementPeriod) -> Self {
        period.0
    }
}

impl Display for SettlementPeriod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Acceptance,
    Submission,
}

impl RecordType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acceptance => "acceptance",
            Self::Submission => "submission",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "acceptance" => Some(Self::Acceptance),
            "submission" => Some(Self::Submission),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Increase,
    Decrease,
    Neutral,
}

/// One bid-offer acceptance: an instructed level change over a contiguous
/// range of settlement periods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptancePayload {
    pub acceptance_number: i64,
    pub period_from: SettlementPeriod,
    pub period_to: SettlementPeriod,
    pub level_from: f64,
    pub level_to: f64,
    pub so_flag: bool,
    pub storage_flag: bool,
}

impl AcceptancePayload {
    #[must_use]
    pub fn direction(&self) -> Direction {
        if self.level_to > self.level_from {
            Direction::Increase
        } else if self.level_to < self.level_from {
            Direction::Decrease
        } else {
            Direction::Neutral
        }
    }

    #[must_use]
    pub fn volume_mw(&self) -> f64 {
        (self.level_to - self.level_from).abs()
    }
}

/// One bid-offer pair submission, valid for exactly one settlement period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionPayload {
    pub period: SettlementPeriod,
    pub pair_id: i32,
    pub offer_price: f64,
    pub bid_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record_type", content = "payload", rename_all = "snake_case")]
pub enum RecordPayload {
    Acceptance(AcceptancePayload),
    Submission(SubmissionPayload),
}

impl RecordPayload {
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Acceptance(_) => RecordType::Acceptance,
            Self::Submission(_) => RecordType::Submission,
        }
    }
}

/// One publication of a fact about a BM unit for a settlement date.
///
/// Records are immutable once stored; a republication with a higher
/// `revision` logically supersedes all lower revisions of the same key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRecord {
    pub bm_unit: BmUnitId,
    #[serde(with = "serde_date")]
    pub settlement_date: Date,
    pub revision: u32,
    pub payload: RecordPayload,
}

/// Resolution identity of a versioned record. Acceptances are identified by
/// their upstream acceptance number; submissions by period and pair.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum RecordKey {
    Acceptance { bm_unit: BmUnitId, settlement_date: Date, acceptance_number: i64 },
    Submission { bm_unit: BmUnitId, settlement_date: Date, period: SettlementPeriod, pair_id: i32 },
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acceptance { bm_unit, settlement_date, acceptance_number } => {
                write!(f, "acceptance {bm_unit}/{settlement_date}/{acceptance_number}")
            }
            Self::Submission { bm_unit, settlement_date, period, pair_id } => {
                write!(f, "submission {bm_unit}/{settlement_date}/sp{period}/pair{pair_id}")
            }
        }
    }
}

impl VersionedRecord {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match &self.payload {
            RecordPayload::Acceptance(event) => RecordKey::Acceptance {
                bm_unit: self.bm_unit.clone(),
                settlement_date: self.settlement_date,
                acceptance_number: event.acceptance_number,
            },
            RecordPayload::Submission(submission) => RecordKey::Submission {
                bm_unit: self.bm_unit.clone(),
                settlement_date: self.settlement_date,
                period: submission.period,
                pair_id: submission.pair_id,
            },
        }
    }

    /// Validate one record against the ingestion-boundary invariants.
    ///
    /// # Errors
    /// Returns [`ReconError::Validation`] when the unit id is blank, an
    /// acceptance window is inverted, or any numeric field is non-finite.
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.bm_unit.as_str().trim().is_empty() {
            return Err(ReconError::Validation("bm_unit MUST be non-empty".to_string()));
        }

        match &self.payload {
            RecordPayload::Acceptance(event) => {
                if event.period_from > event.period_to {
                    return Err(ReconError::Validation(format!(
                        "acceptance {} has inverted period window {}..{}",
                        event.acceptance_number, event.period_from, event.period_to
                    )));
                }
                if !event.level_from.is_finite() || !event.level_to.is_finite() {
                    return Err(ReconError::Validation(format!(
                        "acceptance {} has non-finite levels",
                        event.acceptance_number
                    )));
                }
            }
            RecordPayload::Submission(submission) => {
                if !submission.offer_price.is_finite() || !submission.bid_price.is_finite() {
                    return Err(ReconError::Validation(format!(
                        "submission pair {} sp {} has non-finite prices",
                        submission.pair_id, submission.period
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    OfferSelected,
    BidSelected,
    NeutralAverage,
    Unmatched,
}

impl SelectionRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OfferSelected => "offer_selected",
            Self::BidSelected => "bid_selected",
            Self::NeutralAverage => "neutral_average",
            Self::Unmatched => "unmatched",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer_selected" => Some(Self::OfferSelected),
            "bid_selected" => Some(Self::BidSelected),
            "neutral_average" => Some(Self::NeutralAverage),
            "unmatched" => Some(Self::Unmatched),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Valid,
    PriceOutlier,
    SoTest,
    LowVolume,
    Unmatched,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::PriceOutlier => "price_outlier",
            Self::SoTest => "so_test",
            Self::LowVolume => "low_volume",
            Self::Unmatched => "unmatched",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "valid" => Some(Self::Valid),
            "price_outlier" => Some(Self::PriceOutlier),
            "so_test" => Some(Self::SoTest),
            "low_volume" => Some(Self::LowVolume),
            "unmatched" => Some(Self::Unmatched),
            _ => None,
        }
    }
}

/// The authoritative unit price derived for one acceptance/submission match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedPrice {
    pub bm_unit: BmUnitId,
    #[serde(with = "serde_date")]
    pub settlement_date: Date,
    pub acceptance_number: i64,
    pub revision: u32,
    pub period: Option<SettlementPeriod>,
    pub selected_price: Option<f64>,
    pub selection_rule: SelectionRule,
    pub volume_mw: f64,
    pub revenue_estimate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub price: DerivedPrice,
    pub outcome: Outcome,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevenueSummary {
    pub bm_unit: BmUnitId,
    #[serde(with = "serde_date")]
    pub settlement_date: Date,
    pub revenue_gbp: f64,
    pub volume_mw: f64,
    pub acceptance_count: usize,
}

/// Thresholds and expectations passed into every component explicitly.
/// The core never reads ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconConfig {
    /// Absolute price magnitude (GBP/MWh) beyond which a derived price is
    /// excluded as implausible.
    pub price_outlier_threshold: f64,
    /// Volume (MW) below which an acceptance is excluded as noise.
    pub low_volume_threshold: f64,
    /// Expected submission periods per date for coverage policies.
    /// 48 on normal days, 46 or 50 on clock-change days.
    pub expected_periods_per_day: u16,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            price_outlier_threshold: 1000.0,
            low_volume_threshold: 0.001,
            expected_periods_per_day: 48,
        }
    }
}

/// One settlement date's reconciliation output: valid derived prices,
/// excluded rows with reasons, and per-unit revenue summaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconReport {
    pub report_id: String,
    #[serde(with = "serde_date")]
    pub settlement_date: Date,
    pub valid: Vec<ValidationResult>,
    pub exclusions: Vec<ValidationResult>,
    pub summaries: Vec<RevenueSummary>,
}

/// Dates in `[start, end]` with zero stored coverage, sorted ascending.
///
/// A date with any record at all is not missing; stricter partial-coverage
/// policies belong to [`under_covered_dates`]. Safe to call repeatedly with
/// overlapping windows.
///
/// # Errors
/// Returns [`ReconError::Validation`] when `start > end`.
pub fn missing_dates(
    start: Date,
    end: Date,
    covered: &BTreeSet<Date>,
) -> Result<Vec<Date>, ReconError> {
    if start > end {
        return Err(ReconError::Validation(format!(
            "gap window start {start} is after end {end}"
        )));
    }

    let mut missing = Vec::new();
    let mut cursor = start;
    loop {
        if !covered.contains(&cursor) {
            missing.push(cursor);
        }
        if cursor == end {
            break;
        }
        cursor = cursor.next_day().ok_or_else(|| {
            ReconError::Validation("gap window exceeds the supported calendar".to_string())
        })?;
    }

    Ok(missing)
}

/// Dates in `[start, end]` with some coverage but fewer than `min_periods`
/// stored periods. `min_periods` is a policy parameter because expected
/// period counts differ by feed and by clock-change day (48 vs 50).
///
/// # Errors
/// Returns [`ReconError::Validation`] when `start > end`.
pub fn under_covered_dates(
    start: Date,
    end: Date,
    period_counts: &BTreeMap<Date, usize>,
    min_periods: usize,
) -> Result<Vec<Date>, ReconError> {
    if start > end {
        return Err(ReconError::Validation(format!(
            "coverage window start {start} is after end {end}"
        )));
    }

    let mut under = Vec::new();
    let mut cursor = start;
    loop {
        let count = period_counts.get(&cursor).copied().unwrap_or(0);
        if count > 0 && count < min_periods {
            under.push(cursor);
        }
        if cursor == end {
            break;
        }
        cursor = cursor.next_day().ok_or_else(|| {
            ReconError::Validation("coverage window exceeds the supported calendar".to_string())
        })?;
    }

    Ok(under)
}

/// Reduce a stream of versioned records to exactly one per [`RecordKey`]:
/// the record with the highest `revision`.
///
/// Resolution is by revision number, never by fetch or publish time; a later
/// fetch can legitimately carry an older revision. Re-fetched duplicates
/// (equal revision, identical payload) collapse silently, so the function is
/// a fixed point under self-concatenation of its input.
///
/// # Errors
/// Returns [`ReconError::Integrity`] when two records share a key and
/// revision but differ in payload, and [`ReconError::Validation`] when any
/// input record is malformed.
pub fn resolve_latest(records: &[VersionedRecord]) -> Result<Vec<VersionedRecord>, ReconError> {
    let mut by_key: BTreeMap<RecordKey, &VersionedRecord> = BTreeMap::new();

    for record in records {
        record.validate()?;
        let key = record.key();
        match by_key.get(&key) {
            None => {
                by_key.insert(key, record);
            }
            Some(existing) => match existing.revision.cmp(&record.revision) {
                Ordering::Less => {
                    by_key.insert(key, record);
                }
                Ordering::Greater => {}
                Ordering::Equal => {
                    if existing.payload != record.payload {
                        return Err(ReconError::Integrity(format!(
                            "conflicting payloads at revision {} for {key}",
                            record.revision
                        )));
                    }
                }
            },
        }
    }

    Ok(by_key.into_values().cloned().collect())
}

/// Submissions whose single period lies inside the acceptance window
/// `[period_from, period_to]`. Zero matches is a valid outcome and produces
/// an unmatched derived price downstream, not an error.
#[must_use]
pub fn matched_submissions<'a>(
    event: &AcceptancePayload,
    submissions: &'a [SubmissionPayload],
) -> Vec<&'a SubmissionPayload> {
    submissions
        .iter()
        .filter(|submission| {
            event.period_from <= submission.period && submission.period <= event.period_to
        })
        .collect()
}

/// Derive the economically correct price for one acceptance from its matched
/// submissions.
///
/// Multi-match policy: one [`DerivedPrice`] per matching submission, with the
/// acceptance's total volume `|level_to - level_from|` apportioned equally
/// across the matches. The same rule applies regardless of where either
/// record was stored.
///
/// # Errors
/// Returns [`ReconError::Validation`] when `acceptance` is not an acceptance
/// record.
pub fn derive_prices(
    acceptance: &VersionedRecord,
    matched: &[&SubmissionPayload],
) -> Result<Vec<DerivedPrice>, ReconError> {
    let RecordPayload::Acceptance(event) = &acceptance.payload else {
        return Err(ReconError::Validation(
            "price derivation requires an acceptance record".to_string(),
        ));
    };

    let total_volume = event.volume_mw();

    if matched.is_empty() {
        return Ok(vec![DerivedPrice {
            bm_unit: acceptance.bm_unit.clone(),
            settlement_date: acceptance.settlement_date,
            acceptance_number: event.acceptance_number,
            revision: acceptance.revision,
            period: None,
            selected_price: None,
            selection_rule: SelectionRule::Unmatched,
            volume_mw: total_volume,
            revenue_estimate: None,
        }]);
    }

    #[allow(clippy::cast_precision_loss)]
    let apportioned = total_volume / matched.len() as f64;
    let direction = event.direction();

    Ok(matched
        .iter()
        .map(|submission| {
            let (selected_price, selection_rule) = match direction {
                Direction::Increase => (submission.offer_price, SelectionRule::OfferSelected),
                Direction::Decrease => (submission.bid_price, SelectionRule::BidSelected),
                Direction::Neutral => (
                    (submission.offer_price + submission.bid_price) / 2.0,
                    SelectionRule::NeutralAverage,
                ),
            };

            DerivedPrice {
                bm_unit: acceptance.bm_unit.clone(),
                settlement_date: acceptance.settlement_date,
                acceptance_number: event.acceptance_number,
                revision: acceptance.revision,
                period: Some(submission.period),
                selected_price: Some(selected_price),
                selection_rule,
                volume_mw: apportioned,
                revenue_estimate: Some(selected_price * apportioned),
            }
        })
        .collect())
}

/// Classify one derived price with a fixed, ordered rule set; first match
/// wins. Unmatched rows never reach the numeric checks (they have no price),
/// and SO-test rows are excluded even with otherwise plausible numbers.
#[must_use]
pub fn classify(
    price: &DerivedPrice,
    event: &AcceptancePayload,
    config: &ReconConfig,
) -> ValidationResult {
    if price.selection_rule == SelectionRule::Unmatched {
        return ValidationResult {
            price: price.clone(),
            outcome: Outcome::Unmatched,
            reason: Some("no submission overlaps the acceptance window".to_string()),
        };
    }

    if event.so_flag {
        return ValidationResult {
            price: price.clone(),
            outcome: Outcome::SoTest,
            reason: Some(format!("system operator test acceptance (so_flag={})", event.so_flag)),
        };
    }

    if let Some(selected) = price.selected_price {
        if selected.abs() > config.price_outlier_threshold {
            return ValidationResult {
                price: price.clone(),
                outcome: Outcome::PriceOutlier,
                reason: Some(format!(
                    "selected price {selected} GBP/MWh exceeds outlier threshold {}",
                    config.price_outlier_threshold
                )),
            };
        }
    }

    if price.volume_mw < config.low_volume_threshold {
        return ValidationResult {
            price: price.clone(),
            outcome: Outcome::LowVolume,
            reason: Some(format!(
                "volume {} MW is below threshold {}",
                price.volume_mw, config.low_volume_threshold
            )),
        };
    }

    ValidationResult { price: price.clone(), outcome: Outcome::Valid, reason: None }
}

/// Group valid results by (unit, date): revenue sum, volume sum, count.
/// Non-valid results are ignored here; they belong to the audit trail.
#[must_use]
pub fn summarize(results: &[ValidationResult]) -> Vec<RevenueSummary> {
    let mut grouped: BTreeMap<(BmUnitId, Date), RevenueSummary> = BTreeMap::new();

    for result in results {
        if result.outcome != Outcome::Valid {
            continue;
        }
        let entry = grouped
            .entry((result.price.bm_unit.clone(), result.price.settlement_date))
            .or_insert_with(|| RevenueSummary {
                bm_unit: result.price.bm_unit.clone(),
                settlement_date: result.price.settlement_date,
                revenue_gbp: 0.0,
                volume_mw: 0.0,
                acceptance_count: 0,
            });
        entry.revenue_gbp += result.price.revenue_estimate.unwrap_or(0.0);
        entry.volume_mw += result.price.volume_mw;
        entry.acceptance_count += 1;
    }

    grouped.into_values().collect()
}

/// Reconcile one settlement date: resolve revisions, match acceptances to
/// submissions per unit, derive prices, classify, and aggregate.
///
/// Pure and deterministic; settlement dates are independent, so the same
/// input always produces the same report and re-runs are idempotent.
///
/// # Errors
/// Returns [`ReconError::Integrity`] on divergent same-revision
/// republications and [`ReconError::Validation`] on malformed input records.
pub fn reconcile_day(
    records: &[VersionedRecord],
    settlement_date: Date,
    config: &ReconConfig,
) -> Result<ReconReport, ReconError> {
    let resolved = resolve_latest(records)?;

    let mut acceptances: Vec<&VersionedRecord> = Vec::new();
    let mut submissions_by_unit: BTreeMap<BmUnitId, Vec<SubmissionPayload>> = BTreeMap::new();

    for record in &resolved {
        if record.settlement_date != settlement_date {
            continue;
        }
        match &record.payload {
            RecordPayload::Acceptance(_) => acceptances.push(record),
            RecordPayload::Submission(submission) => submissions_by_unit
                .entry(record.bm_unit.clone())
                .or_default()
                .push(submission.clone()),
        }
    }

    let mut valid = Vec::new();
    let mut exclusions = Vec::new();
    let empty: Vec<SubmissionPayload> = Vec::new();

    for acceptance in acceptances {
        let RecordPayload::Acceptance(event) = &acceptance.payload else {
            continue;
        };
        let submissions = submissions_by_unit.get(&acceptance.bm_unit).unwrap_or(&empty);
        let matched = matched_submissions(event, submissions);
        for price in derive_prices(acceptance, &matched)? {
            let result = classify(&price, event, config);
            if result.outcome == Outcome::Valid {
                valid.push(result);
            } else {
                exclusions.push(result);
            }
        }
    }

    let summaries = summarize(&valid);

    Ok(ReconReport {
        report_id: format!("recon_{settlement_date}"),
        settlement_date,
        valid,
        exclusions,
        summaries,
    })
}
