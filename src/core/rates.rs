//! Exchange-rate domain types

use super::error::{RateError, RateResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

fn normalize_code(code: &str) -> RateResult<String> {
    let code = code.trim().to_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RateError::InvalidPair(format!(
            "'{code}' is not a three-letter currency code"
        )));
    }
    Ok(code)
}

/// An ordered (base, quote) currency pair; the rate is quote units per base unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawPair")]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

#[derive(Deserialize)]
struct RawPair {
    base: String,
    quote: String,
}

impl TryFrom<RawPair> for CurrencyPair {
    type Error = RateError;

    fn try_from(raw: RawPair) -> RateResult<Self> {
        CurrencyPair::new(&raw.base, &raw.quote)
    }
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> RateResult<Self> {
        let base = normalize_code(base)?;
        let quote = normalize_code(quote)?;
        if base == quote {
            return Err(RateError::InvalidPair(format!(
                "base and quote are both {base}"
            )));
        }
        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Storage form, e.g. `USD-JPY`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

impl Display for CurrencyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = RateError;

    /// Accepts `USD/JPY`, `USD-JPY` and `USDJPY`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((base, quote)) = s.split_once(['/', '-']) {
            return CurrencyPair::new(base, quote);
        }
        if s.len() == 6 && s.is_ascii() {
            return CurrencyPair::new(&s[..3], &s[3..]);
        }
        Err(RateError::InvalidPair(format!("cannot parse '{s}'")))
    }
}

/// Lookback window of a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "90d")]
    NinetyDays,
    #[serde(rename = "180d")]
    HalfYear,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::SevenDays,
        Period::ThirtyDays,
        Period::NinetyDays,
        Period::HalfYear,
    ];

    pub fn days(&self) -> i64 {
        match self {
            Period::SevenDays => 7,
            Period::ThirtyDays => 30,
            Period::NinetyDays => 90,
            Period::HalfYear => 180,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::SevenDays => "7d",
            Period::ThirtyDays => "30d",
            Period::NinetyDays => "90d",
            Period::HalfYear => "180d",
        }
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Period {
    type Err = RateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.strip_suffix('d').unwrap_or(&normalized) {
            "7" => Ok(Period::SevenDays),
            "30" => Ok(Period::ThirtyDays),
            "90" => Ok(Period::NinetyDays),
            "180" => Ok(Period::HalfYear),
            _ => Err(RateError::InvalidPeriod(format!(
                "'{s}' (expected one of 7d, 30d, 90d, 180d)"
            ))),
        }
    }
}

/// One observation of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePoint {
    pub t: DateTime<Utc>,
    pub rate: Decimal,
}

impl RatePoint {
    /// A daily rate, stamped at midnight UTC of `date`.
    pub fn on_date(date: NaiveDate, rate: Decimal) -> Self {
        Self {
            t: date.and_time(NaiveTime::MIN).and_utc(),
            rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("series has no points")]
    Empty,
    #[error("duplicate timestamp {0}")]
    Duplicate(DateTime<Utc>),
    #[error("non-positive rate {rate} at {t}")]
    NonPositive { t: DateTime<Utc>, rate: Decimal },
}

impl From<SeriesError> for RateError {
    fn from(err: SeriesError) -> Self {
        RateError::Parse(err.to_string())
    }
}

/// A non-empty series with strictly increasing timestamps and positive rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RatePoint>", into = "Vec<RatePoint>")]
pub struct RateSeries {
    points: Vec<RatePoint>,
}

impl RateSeries {
    /// Sorts `points` by timestamp and checks the series invariants.
    pub fn new(mut points: Vec<RatePoint>) -> Result<Self, SeriesError> {
        if points.is_empty() {
            return Err(SeriesError::Empty);
        }
        points.sort_by_key(|p| p.t);
        for pair in points.windows(2) {
            if pair[0].t == pair[1].t {
                return Err(SeriesError::Duplicate(pair[1].t));
            }
        }
        if let Some(bad) = points.iter().find(|p| p.rate <= Decimal::ZERO) {
            return Err(SeriesError::NonPositive {
                t: bad.t,
                rate: bad.rate,
            });
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[RatePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> &RatePoint {
        &self.points[0]
    }

    pub fn last(&self) -> &RatePoint {
        &self.points[self.points.len() - 1]
    }

    /// Rate published for `date`, if the series has one.
    pub fn rate_on(&self, date: NaiveDate) -> Option<Decimal> {
        let t = RatePoint::on_date(date, Decimal::ONE).t;
        self.points
            .binary_search_by_key(&t, |p| p.t)
            .ok()
            .map(|index| self.points[index].rate)
    }

    pub fn min_rate(&self) -> Decimal {
        self.points.iter().map(|p| p.rate).min().unwrap_or_default()
    }

    pub fn max_rate(&self) -> Decimal {
        self.points.iter().map(|p| p.rate).max().unwrap_or_default()
    }

    /// Percentage change from the first to the last point.
    pub fn change_pct(&self) -> Decimal {
        let first = self.first().rate;
        (self.last().rate - first) / first * Decimal::ONE_HUNDRED
    }
}

impl TryFrom<Vec<RatePoint>> for RateSeries {
    type Error = SeriesError;

    fn try_from(points: Vec<RatePoint>) -> Result<Self, Self::Error> {
        RateSeries::new(points)
    }
}

impl From<RateSeries> for Vec<RatePoint> {
    fn from(series: RateSeries) -> Self {
        series.points
    }
}

/// Address of one cached series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub pair: CurrencyPair,
    pub period: Period,
}

impl CacheKey {
    pub fn new(pair: CurrencyPair, period: Period) -> Self {
        Self { pair, period }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.pair.key(), self.period)
    }
}

impl FromStr for CacheKey {
    type Err = RateError;

    /// Parses the storage form `BASE-QUOTE-PERIOD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, period) = s
            .rsplit_once('-')
            .ok_or_else(|| RateError::InvalidPair(format!("malformed cache key '{s}'")))?;
        Ok(Self::new(pair.parse()?, period.parse()?))
    }
}

/// A committed series plus the metadata used to judge its freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub period: Period,
    pub series: RateSeries,
    pub fetched_at: DateTime<Utc>,
    pub source_version: String,
}
