//! Rate series cache with period-dependent freshness
//!
//! Reads are served from an in-memory index of `Arc<CacheEntry>` snapshots;
//! writes go to the backing collection first and then swap the snapshot, so a
//! reader sees either the previous entry or the new one, never a partial write.

use super::error::{RateError, RateResult};
use super::rates::{CacheEntry, CacheKey, CurrencyPair, Period, RateSeries};
use crate::store::KeyValueCollection;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// How long an entry of each period stays fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessPolicy {
    windows: BTreeMap<Period, Duration>,
}

impl FreshnessPolicy {
    pub const DEFAULT_MINUTES: [(Period, i64); 4] = [
        (Period::SevenDays, 60),
        (Period::ThirtyDays, 3 * 60),
        (Period::NinetyDays, 6 * 60),
        (Period::HalfYear, 12 * 60),
    ];

    /// Builds a policy from per-period minutes. Periods missing from
    /// `minutes` keep their default. Shorter periods must not stay fresh
    /// longer than longer ones.
    pub fn from_minutes(minutes: &BTreeMap<Period, u64>) -> Result<Self> {
        let mut windows = Self::default().windows;
        for (period, mins) in minutes {
            let window = i64::try_from(*mins)
                .ok()
                .and_then(Duration::try_minutes)
                .with_context(|| format!("freshness window for {period} ({mins} min) is too large"))?;
            windows.insert(*period, window);
        }

        let ordered: Vec<_> = windows.iter().collect();
        for pair in ordered.windows(2) {
            let ((short, short_window), (long, long_window)) = (pair[0], pair[1]);
            if short_window > long_window {
                bail!(
                    "freshness window for {short} ({} min) exceeds the one for {long} ({} min)",
                    short_window.num_minutes(),
                    long_window.num_minutes()
                );
            }
        }
        Ok(Self { windows })
    }

    pub fn window(&self, period: Period) -> Duration {
        self.windows
            .get(&period)
            .copied()
            .unwrap_or_else(|| Duration::hours(1))
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            windows: Self::DEFAULT_MINUTES
                .iter()
                .map(|(period, mins)| (*period, Duration::minutes(*mins)))
                .collect(),
        }
    }
}

pub struct CacheStore {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    collection: Arc<dyn KeyValueCollection>,
    policy: FreshnessPolicy,
}

impl CacheStore {
    /// Loads every committed entry from `collection`.
    ///
    /// Entries that no longer decode, or whose contents disagree with their
    /// key, are reported as corrupt, removed and treated as misses.
    pub fn load(collection: Arc<dyn KeyValueCollection>, policy: FreshnessPolicy) -> Self {
        let mut entries = HashMap::new();
        match collection.entries() {
            Ok(raw_entries) => {
                for (raw_key, bytes) in raw_entries {
                    match decode_entry(&raw_key, &bytes) {
                        Ok((key, entry)) => {
                            entries.insert(key, Arc::new(entry));
                        }
                        Err(err) => {
                            warn!(error = %err, "Discarding cache entry");
                            if let Err(e) = collection.remove(&raw_key) {
                                warn!(key = %raw_key, error = %e, "Failed to remove corrupt entry");
                            }
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to read cache collection, starting empty"),
        }
        info!(entries = entries.len(), "Loaded rate cache");

        Self {
            entries: RwLock::new(entries),
            collection,
            policy,
        }
    }

    pub fn get(&self, pair: &CurrencyPair, period: Period) -> Option<Arc<CacheEntry>> {
        let key = CacheKey::new(pair.clone(), period);
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if entry.is_some() {
            debug!(%key, "Cache HIT");
        } else {
            debug!(%key, "Cache MISS");
        }
        entry
    }

    /// Commits `series` as the entry for (pair, period), stamped now.
    pub fn put(
        &self,
        pair: &CurrencyPair,
        period: Period,
        series: RateSeries,
        source_version: impl Into<String>,
    ) -> RateResult<Arc<CacheEntry>> {
        self.put_at(pair, period, series, source_version, Utc::now())
    }

    /// Commits an entry with an explicit fetch time, e.g. when importing data
    /// fetched elsewhere.
    pub fn put_at(
        &self,
        pair: &CurrencyPair,
        period: Period,
        series: RateSeries,
        source_version: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> RateResult<Arc<CacheEntry>> {
        if series.is_empty() {
            return Err(RateError::Parse("refusing to cache an empty series".into()));
        }
        let key = CacheKey::new(pair.clone(), period);
        let entry = CacheEntry {
            period,
            series,
            fetched_at,
            source_version: source_version.into(),
        };

        let bytes =
            serde_json::to_vec(&entry).map_err(|e| RateError::Storage(e.to_string()))?;
        self.collection
            .put(&key.to_string(), &bytes)
            .map_err(|e| RateError::Storage(e.to_string()))?;

        let entry = Arc::new(entry);
        debug!(%key, points = entry.series.len(), "Cache PUT");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn is_stale(&self, entry: &CacheEntry) -> bool {
        self.is_stale_at(entry, Utc::now())
    }

    pub fn is_stale_at(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.fetched_at > self.policy.window(entry.period)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn decode_entry(raw_key: &str, bytes: &[u8]) -> RateResult<(CacheKey, CacheEntry)> {
    let corrupt = |reason: String| RateError::CacheCorrupt {
        key: raw_key.to_string(),
        reason,
    };
    let key: CacheKey = raw_key.parse().map_err(|e: RateError| corrupt(e.to_string()))?;
    let entry: CacheEntry =
        serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    if entry.period != key.period {
        return Err(corrupt(format!(
            "entry period {} does not match key",
            entry.period
        )));
    }
    Ok((key, entry))
}
