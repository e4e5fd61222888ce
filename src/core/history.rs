use super::rates::{CacheKey, CurrencyPair, Period};
use crate::store::KeyValueCollection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub pair: CurrencyPair,
    pub last_viewed_at: DateTime<Utc>,
    pub cached_periods: BTreeSet<Period>,
}

/// Remembers every pair that has been viewed, for recall and background refresh.
///
/// Records are only ever added or updated.
pub struct PairHistory {
    records: RwLock<HashMap<CurrencyPair, HistoryRecord>>,
    collection: Arc<dyn KeyValueCollection>,
}

impl PairHistory {
    pub fn load(collection: Arc<dyn KeyValueCollection>) -> Self {
        let mut records = HashMap::new();
        match collection.entries() {
            Ok(entries) => {
                for (key, bytes) in entries {
                    match serde_json::from_slice::<HistoryRecord>(&bytes) {
                        Ok(record) => {
                            records.insert(record.pair.clone(), record);
                        }
                        Err(e) => warn!(%key, error = %e, "Skipping unreadable history record"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to read pair history"),
        }

        Self {
            records: RwLock::new(records),
            collection,
        }
    }

    pub fn record(&self, pair: &CurrencyPair, period: Period) -> HistoryRecord {
        self.record_at(pair, period, Utc::now())
    }

    pub fn record_at(
        &self,
        pair: &CurrencyPair,
        period: Period,
        viewed_at: DateTime<Utc>,
    ) -> HistoryRecord {
        let record = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let record = records
                .entry(pair.clone())
                .or_insert_with(|| HistoryRecord {
                    pair: pair.clone(),
                    last_viewed_at: viewed_at,
                    cached_periods: BTreeSet::new(),
                });
            record.last_viewed_at = record.last_viewed_at.max(viewed_at);
            record.cached_periods.insert(period);
            record.clone()
        };

        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                if let Err(e) = self.collection.put(&pair.key(), &bytes) {
                    warn!(%pair, error = %e, "Failed to persist history record");
                }
            }
            Err(e) => warn!(%pair, error = %e, "Failed to encode history record"),
        }
        debug!(%pair, %period, "Recorded pair view");
        record
    }

    /// Records ordered most-recently-viewed first.
    pub fn list(&self) -> Vec<HistoryRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.last_viewed_at
                .cmp(&a.last_viewed_at)
                .then_with(|| a.pair.cmp(&b.pair))
        });
        records
    }

    /// Every (pair, period) the history knows about, in `list` order.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.list()
            .into_iter()
            .flat_map(|record| {
                record
                    .cached_periods
                    .into_iter()
                    .map(move |period| CacheKey::new(record.pair.clone(), period))
            })
            .collect()
    }
}
