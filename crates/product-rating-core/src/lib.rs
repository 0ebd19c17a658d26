use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::{date, format_description};
use time::{Date, Duration};

/// Calendar year the aggregate schema is pinned to. The monthly columns of
/// the aggregate table are named after this year, so the generation window
/// must stay inside it.
pub const REPORT_YEAR: i32 = 2024;

/// Number of products reported per month.
pub const TOP_N: usize = 3;

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RatingsError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("format error: {0}")]
    Format(String),
}

/// One synthetic user-product-rating observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingEvent {
    pub timestamp: Date,
    pub user_id: u32,
    pub product_id: u32,
    pub rating: u32,
}

/// Calendar month of the fixed report year, in the order the aggregate
/// table lays its columns out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportMonth {
    January,
    February,
    March,
    April,
    May,
    June,
    July,
    August,
    September,
    October,
    November,
    December,
}

impl ReportMonth {
    pub const ALL: [Self; 12] = [
        Self::January,
        Self::February,
        Self::March,
        Self::April,
        Self::May,
        Self::June,
        Self::July,
        Self::August,
        Self::September,
        Self::October,
        Self::November,
        Self::December,
    ];

    /// Bucket key produced by the store's aggregation query.
    #[must_use]
    pub fn month_key(self) -> &'static str {
        match self {
            Self::January => "2024_01",
            Self::February => "2024_02",
            Self::March => "2024_03",
            Self::April => "2024_04",
            Self::May => "2024_05",
            Self::June => "2024_06",
            Self::July => "2024_07",
            Self::August => "2024_08",
            Self::September => "2024_09",
            Self::October => "2024_10",
            Self::November => "2024_11",
            Self::December => "2024_12",
        }
    }

    /// Column name in the aggregate table.
    #[must_use]
    pub fn column_name(self) -> &'static str {
        match self {
            Self::January => "Jan2024",
            Self::February => "Feb2024",
            Self::March => "Mar2024",
            Self::April => "Apr2024",
            Self::May => "May2024",
            Self::June => "Jun2024",
            Self::July => "Jul2024",
            Self::August => "Aug2024",
            Self::September => "Sep2024",
            Self::October => "Oct2024",
            Self::November => "Nov2024",
            Self::December => "Dec2024",
        }
    }

    #[must_use]
    pub fn parse_key(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|month| month.month_key() == value)
    }

    /// Zero-based position within the pivot row's month columns.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl Display for ReportMonth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.column_name())
    }
}

/// Parameters for one pipeline run. Defaults reproduce the reference
/// workload: 100 000 events over the whole of 2024, 1000 users, 1000
/// products, ratings 1..=5, seed 20.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub total_records: usize,
    pub max_user_id: u32,
    pub max_product_id: u32,
    pub max_rating: u32,
    pub start_date: Date,
    pub end_date: Date,
    pub seed: u64,
    /// Keep rows already present in the store instead of truncating
    /// before insert. Re-running with this set accumulates duplicate raw
    /// rows.
    pub keep_existing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            total_records: 100_000,
            max_user_id: 1_000,
            max_product_id: 1_000,
            max_rating: 5,
            start_date: date!(2024 - 01 - 01),
            end_date: date!(2024 - 12 - 31),
            seed: 20,
            keep_existing: false,
        }
    }
}

impl PipelineConfig {
    /// Validates bounds before a run.
    ///
    /// # Errors
    /// Returns [`RatingsError::Configuration`] when a maximum is zero, the
    /// date window is inverted, or the window leaves the report year.
    pub fn validate(&self) -> Result<(), RatingsError> {
        if self.max_user_id == 0 || self.max_product_id == 0 || self.max_rating == 0 {
            return Err(RatingsError::Configuration(
                "max_user_id, max_product_id and max_rating MUST be >= 1".to_string(),
            ));
        }

        if self.start_date > self.end_date {
            return Err(RatingsError::Configuration(
                "start_date MUST NOT be after end_date".to_string(),
            ));
        }

        if self.start_date.year() != REPORT_YEAR || self.end_date.year() != REPORT_YEAR {
            return Err(RatingsError::Configuration(format!(
                "generation window MUST stay within report year {REPORT_YEAR}"
            )));
        }

        Ok(())
    }
}

/// Uniform inclusive integer source the generator draws from.
///
/// The generator consumes draws in a fixed order (day offset, user id,
/// product id, rating per event), so any two sources yielding the same
/// values produce identical event sequences.
pub trait DrawSource {
    fn draw(&mut self, low: i64, high: i64) -> i64;
}

/// Deterministic [`DrawSource`] over a seeded PRNG. The same seed always
/// yields the same draw sequence.
pub struct SeededDraws {
    rng: StdRng,
}

impl SeededDraws {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DrawSource for SeededDraws {
    fn draw(&mut self, low: i64, high: i64) -> i64 {
        self.rng.gen_range(low..=high)
    }
}

/// Produces a lazy sequence of exactly `total_records` rating events.
///
/// Per event the source is consumed in the order day-offset, user id,
/// product id, rating. A `total_records` of zero yields nothing.
pub fn generate_events<'a, D: DrawSource>(
    config: &PipelineConfig,
    draws: &'a mut D,
) -> impl Iterator<Item = RatingEvent> + 'a {
    let span_days = (config.end_date - config.start_date).whole_days().max(0);
    let start_date = config.start_date;
    let max_user_id = config.max_user_id;
    let max_product_id = config.max_product_id;
    let max_rating = config.max_rating;

    (0..config.total_records).map(move |_| {
        let day_offset = draws.draw(0, span_days);
        let timestamp = start_date + Duration::days(day_offset);
        let user_id = u32::try_from(draws.draw(1, i64::from(max_user_id))).unwrap_or(max_user_id);
        let product_id =
            u32::try_from(draws.draw(1, i64::from(max_product_id))).unwrap_or(max_product_id);
        let rating = u32::try_from(draws.draw(1, i64::from(max_rating))).unwrap_or(max_rating);

        RatingEvent {
            timestamp,
            user_id,
            product_id,
            rating,
        }
    })
}

/// One (month, product, average) triple from the store's GROUP BY query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonthlyAverageRow {
    pub month: ReportMonth,
    pub product_id: u32,
    pub average_rating: f64,
}

/// Sparse per-product, per-month rounded averages.
pub type StructuredAverages = BTreeMap<u32, BTreeMap<ReportMonth, f64>>;

/// Reshapes aggregate rows into the per-product month map, rounding each
/// average to two decimal places. Input order is irrelevant; if a
/// (product, month) pair repeats the later row wins.
#[must_use]
pub fn structure_monthly_averages(rows: &[MonthlyAverageRow]) -> StructuredAverages {
    let mut structured = StructuredAverages::new();

    for row in rows {
        structured
            .entry(row.product_id)
            .or_default()
            .insert(row.month, round2(row.average_rating));
    }

    structured
}

/// Dense fixed-width row for the aggregate table: product id plus one
/// value per calendar month.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotRow {
    pub product_id: u32,
    pub monthly: [f64; 12],
}

/// Densifies the structured averages into pivot rows, one per product in
/// ascending product-id order. Months with no data are emitted as 0.0; a
/// true zero average cannot occur since ratings start at 1, so zero-filled
/// months sort last in the top-N queries.
pub fn pivot_rows(structured: &StructuredAverages) -> impl Iterator<Item = PivotRow> + '_ {
    structured.iter().map(|(product_id, by_month)| {
        let mut monthly = [0.0_f64; 12];
        for (month, value) in by_month {
            monthly[month.index()] = *value;
        }

        PivotRow {
            product_id: *product_id,
            monthly,
        }
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TopProduct {
    pub product_id: u32,
    pub average_rating: f64,
}

/// Ranked products for one month, sorted descending by average with
/// ascending product id as tie-break.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonthTopProducts {
    pub month: ReportMonth,
    pub products: Vec<TopProduct>,
}

/// Rounds half away from zero to two decimal places.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Formats a calendar date as `YYYY-MM-DD` for storage.
///
/// # Errors
/// Returns [`RatingsError::Format`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, RatingsError> {
    value
        .format(DATE_FORMAT)
        .map_err(|err| RatingsError::Format(format!("failed to format date: {err}")))
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`RatingsError::Format`] when the input does not match.
pub fn parse_date(value: &str) -> Result<Date, RatingsError> {
    Date::parse(value, DATE_FORMAT)
        .map_err(|err| RatingsError::Format(format!("invalid date {value:?}: {err}")))
}
