//! Core rate acquisition, caching and serving

pub mod cache;
pub mod chart;
pub mod config;
pub mod credential;
pub mod currency;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod log;
pub mod rates;
pub mod scheduler;

// Re-export main types for cleaner imports
pub use cache::{CacheStore, FreshnessPolicy};
pub use chart::{ChartData, ChartPoll, ChartService, Freshness};
pub use credential::{Credential, CredentialAcquirer, CredentialStore};
pub use error::{RateError, RateResult};
pub use fetcher::{RateFetcher, RateSource, RetryPolicy};
pub use history::{HistoryRecord, PairHistory};
pub use rates::{CacheEntry, CurrencyPair, Period, RatePoint, RateSeries};
pub use scheduler::{RefreshScheduler, TaskStatus};
