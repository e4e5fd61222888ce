//! Chart data for the presentation layer
//!
//! Serves cached series with stale-while-revalidate semantics and hides
//! credentials and refresh tasks behind plain data.

use super::cache::CacheStore;
use super::currency::{self, Currency};
use super::error::RateResult;
use super::history::{HistoryRecord, PairHistory};
use super::rates::{CacheEntry, CurrencyPair, Period, RateSeries};
use super::scheduler::{Bootstrap, RefreshScheduler, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartData {
    pub series: RateSeries,
    pub freshness: Freshness,
    pub fetched_at: DateTime<Utc>,
}

impl ChartData {
    fn from_entry(entry: &CacheEntry, freshness: Freshness) -> Self {
        Self {
            series: entry.series.clone(),
            freshness,
            fetched_at: entry.fetched_at,
        }
    }
}

/// Result of a non-blocking chart request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChartPoll {
    Ready(ChartData),
    Pending,
}

/// Raw chart request parameters, as received from a query string.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartQuery {
    pub base: String,
    pub quote: String,
    pub period: String,
}

impl ChartQuery {
    pub fn parse(&self) -> RateResult<(CurrencyPair, Period)> {
        Ok((
            CurrencyPair::new(&self.base, &self.quote)?,
            self.period.parse()?,
        ))
    }
}

pub struct ChartService {
    cache: Arc<CacheStore>,
    history: Arc<PairHistory>,
    scheduler: RefreshScheduler,
    bootstrap: Bootstrap,
}

impl ChartService {
    pub fn new(scheduler: RefreshScheduler, bootstrap: Bootstrap) -> Self {
        Self {
            cache: Arc::clone(scheduler.cache()),
            history: Arc::clone(scheduler.history()),
            scheduler,
            bootstrap,
        }
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub async fn get_chart(&self, pair: &CurrencyPair, period: Period) -> RateResult<ChartData> {
        self.get_chart_with_progress(pair, period, |_| {}).await
    }

    /// Returns the chart for (pair, period).
    ///
    /// Cached data is returned at once, tagged `Stale` and refreshed in the
    /// background once past its freshness window. Without cached data this
    /// waits for the fetch, reporting its status to `progress`, and a failed
    /// fetch is an error.
    #[instrument(name = "GetChart", skip(self, progress), fields(pair = %pair, period = %period))]
    pub async fn get_chart_with_progress(
        &self,
        pair: &CurrencyPair,
        period: Period,
        progress: impl FnMut(TaskStatus),
    ) -> RateResult<ChartData> {
        self.bootstrap.wait().await;

        let chart = match self.cache.get(pair, period) {
            Some(entry) if self.cache.is_stale(&entry) => {
                debug!(fetched_at = %entry.fetched_at, "Serving stale chart, refreshing");
                self.scheduler.schedule(pair, period);
                ChartData::from_entry(&entry, Freshness::Stale)
            }
            Some(entry) => ChartData::from_entry(&entry, Freshness::Fresh),
            None => {
                let entry = self
                    .scheduler
                    .schedule(pair, period)
                    .wait_with_progress(progress)
                    .await?;
                ChartData::from_entry(&entry, Freshness::Fresh)
            }
        };

        self.history.record(pair, period);
        Ok(chart)
    }

    /// Like [`ChartService::get_chart`], but never waits for a fetch.
    pub fn poll_chart(&self, pair: &CurrencyPair, period: Period) -> ChartPoll {
        if !self.bootstrap.is_complete() {
            return ChartPoll::Pending;
        }

        match self.cache.get(pair, period) {
            Some(entry) => {
                let freshness = if self.cache.is_stale(&entry) {
                    self.scheduler.schedule(pair, period);
                    Freshness::Stale
                } else {
                    Freshness::Fresh
                };
                self.history.record(pair, period);
                ChartPoll::Ready(ChartData::from_entry(&entry, freshness))
            }
            None => {
                self.scheduler.schedule(pair, period);
                ChartPoll::Pending
            }
        }
    }

    pub fn history(&self) -> Vec<HistoryRecord> {
        self.history.list()
    }

    pub fn search_currencies(&self, prefix: &str) -> Vec<&'static Currency> {
        currency::search(prefix)
    }
}
