//! Rate sources and the retry policy wrapped around them

use super::credential::{Credential, CredentialStore};
use super::error::{RateError, RateResult};
use super::rates::{CurrencyPair, Period, RatePoint, RateSeries};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// A series as returned by a source, with the source's version marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSeries {
    pub series: RateSeries,
    pub source_version: String,
}

#[async_trait]
pub trait RateSource: Send + Sync {
    /// Makes one attempt at fetching the window for `pair` and `period`.
    ///
    /// `previous` holds points already known for the same key; sources may
    /// reuse them instead of requesting them again, but must return the
    /// complete window. Every point requested from the network is also pushed
    /// to `collected` as it arrives, so a failed attempt keeps its progress.
    async fn fetch(
        &self,
        pair: &CurrencyPair,
        period: Period,
        credential: &Credential,
        previous: Option<&RateSeries>,
        collected: &mut Vec<RatePoint>,
    ) -> RateResult<FetchedSeries>;
}

/// `previous` overlaid with the points collected by failed attempts.
fn known_points(previous: Option<&RateSeries>, collected: &[RatePoint]) -> Option<RateSeries> {
    let mut by_time: BTreeMap<_, _> = previous
        .map(|series| series.points().iter().map(|p| (p.t, p.rate)).collect())
        .unwrap_or_default();
    by_time.extend(collected.iter().map(|p| (p.t, p.rate)));
    let points = by_time
        .into_iter()
        .map(|(t, rate)| RatePoint { t, rate })
        .collect();
    RateSeries::new(points).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff before each retry of a transient failure; its length is the retry count.
    pub transient_delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_delays: vec![Duration::from_secs(1), Duration::from_secs(3)],
        }
    }
}

impl RetryPolicy {
    pub fn no_delay(retries: usize) -> Self {
        Self {
            transient_delays: vec![Duration::ZERO; retries],
        }
    }
}

/// Fetches through a [`RateSource`] with bounded recovery:
/// transient errors are retried per the [`RetryPolicy`], a rejected session
/// is replaced once and the fetch retried once, parse errors are surfaced
/// immediately.
#[derive(Clone)]
pub struct RateFetcher {
    source: Arc<dyn RateSource>,
    credentials: Arc<CredentialStore>,
    policy: RetryPolicy,
}

impl RateFetcher {
    pub fn new(
        source: Arc<dyn RateSource>,
        credentials: Arc<CredentialStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            credentials,
            policy,
        }
    }

    #[instrument(name = "RateFetch", skip(self, previous), fields(pair = %pair, period = %period))]
    pub async fn fetch(
        &self,
        pair: &CurrencyPair,
        period: Period,
        previous: Option<&RateSeries>,
    ) -> RateResult<FetchedSeries> {
        let mut credential = self.credentials.current().await?;
        let mut transient_retries = 0;
        let mut reauthenticated = false;
        let mut collected = Vec::new();

        loop {
            let merged = (!collected.is_empty())
                .then(|| known_points(previous, &collected))
                .flatten();
            let known = merged.as_ref().or(previous);
            match self
                .source
                .fetch(pair, period, &credential, known, &mut collected)
                .await
            {
                Ok(fetched) => return Ok(fetched),
                Err(RateError::Transient(reason))
                    if transient_retries < self.policy.transient_delays.len() =>
                {
                    let delay = self.policy.transient_delays[transient_retries];
                    transient_retries += 1;
                    warn!(
                        %reason,
                        retry = transient_retries,
                        ?delay,
                        kept = collected.len(),
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(RateError::AuthRejected(reason)) if !reauthenticated => {
                    info!(%reason, "Session rejected, re-authenticating");
                    reauthenticated = true;
                    credential = self.credentials.replace(&credential).await?;
                }
                Err(e @ RateError::Parse(_)) => {
                    error!(error = %e, "Source response format changed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Fetch failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::credential::tests::{ScriptedAcquirer, credential};
    use crate::core::rates::RatePoint;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn sample_series(rate: i64) -> RateSeries {
        let day = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        RateSeries::new(vec![
            RatePoint::on_date(day, Decimal::new(rate, 2)),
            RatePoint::on_date(day.succ_opt().unwrap(), Decimal::new(rate + 1, 2)),
        ])
        .unwrap()
    }

    /// Source that replays scripted outcomes, then keeps succeeding.
    pub(crate) struct ScriptedSource {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        delay: Duration,
        script: Mutex<VecDeque<RateResult<FetchedSeries>>>,
        seen_tokens: Mutex<Vec<String>>,
        seen_known: Mutex<Vec<usize>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<RateResult<FetchedSeries>>) -> Self {
            Self::with_delay(script, Duration::ZERO)
        }

        pub(crate) fn with_delay(script: Vec<RateResult<FetchedSeries>>, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                delay,
                script: Mutex::new(script.into()),
                seen_tokens: Mutex::new(Vec::new()),
                seen_known: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Most fetches that were running at the same time.
        pub(crate) fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        fn seen_tokens(&self) -> Vec<String> {
            self.seen_tokens.lock().unwrap().clone()
        }

        /// Length of the known series handed to each attempt.
        fn seen_known(&self) -> Vec<usize> {
            self.seen_known.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RateSource for ScriptedSource {
        async fn fetch(
            &self,
            _pair: &CurrencyPair,
            _period: Period,
            credential: &Credential,
            previous: Option<&RateSeries>,
            collected: &mut Vec<RatePoint>,
        ) -> RateResult<FetchedSeries> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_tokens
                .lock()
                .unwrap()
                .push(credential.cookies[0].value.clone());
            self.seen_known
                .lock()
                .unwrap()
                .push(previous.map_or(0, RateSeries::len));

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self.script.lock().unwrap().pop_front();
            if let Some(Err(RateError::Transient(_))) = &next {
                // A failing attempt still got one new day through
                let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                    + chrono::Duration::days(collected.len() as i64);
                collected.push(RatePoint::on_date(day, Decimal::new(99, 2)));
            }
            next.unwrap_or_else(|| {
                Ok(FetchedSeries {
                    series: sample_series(100),
                    source_version: "2025-01-07".to_string(),
                })
            })
        }
    }

    fn fetcher_with(
        source: Arc<ScriptedSource>,
        acquirer: Arc<ScriptedAcquirer>,
    ) -> RateFetcher {
        let credentials = Arc::new(
            CredentialStore::new(acquirer, "www.mastercard.com").with_credential(credential("seed")),
        );
        RateFetcher::new(source, credentials, RetryPolicy::no_delay(2))
    }

    fn usd_jpy() -> CurrencyPair {
        CurrencyPair::new("USD", "JPY").unwrap()
    }

    #[tokio::test]
    async fn test_auth_rejected_reauthenticates_exactly_once() {
        let rejections = (0..5)
            .map(|_| Err(RateError::AuthRejected("HTTP 403".into())))
            .collect();
        let source = Arc::new(ScriptedSource::new(rejections));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![]));
        let fetcher = fetcher_with(source.clone(), acquirer.clone());

        let err = fetcher
            .fetch(&usd_jpy(), Period::ThirtyDays, None)
            .await
            .unwrap_err();

        assert!(matches!(err, RateError::AuthRejected(_)));
        assert_eq!(source.calls(), 2);
        assert_eq!(acquirer.calls(), 1);
        // The retry used the replacement credential
        assert_eq!(source.seen_tokens(), vec!["seed", "token-0"]);
    }

    #[tokio::test]
    async fn test_auth_rejected_then_success() {
        let source = Arc::new(ScriptedSource::new(vec![Err(RateError::AuthRejected(
            "HTTP 401".into(),
        ))]));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![]));
        let fetcher = fetcher_with(source.clone(), acquirer.clone());

        let fetched = fetcher
            .fetch(&usd_jpy(), Period::SevenDays, None)
            .await
            .unwrap();
        assert_eq!(fetched.series.len(), 2);
        assert_eq!(source.calls(), 2);
        assert_eq!(acquirer.calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_error_is_never_retried() {
        let source = Arc::new(ScriptedSource::new(vec![Err(RateError::Parse(
            "missing conversionRate".into(),
        ))]));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![]));
        let fetcher = fetcher_with(source.clone(), acquirer.clone());

        let err = fetcher
            .fetch(&usd_jpy(), Period::SevenDays, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RateError::Parse(_)));
        assert_eq!(source.calls(), 1);
        assert_eq!(acquirer.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_twice() {
        let failures = (0..5)
            .map(|_| Err(RateError::Transient("HTTP 503".into())))
            .collect();
        let source = Arc::new(ScriptedSource::new(failures));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![]));
        let fetcher = fetcher_with(source.clone(), acquirer.clone());

        let err = fetcher
            .fetch(&usd_jpy(), Period::NinetyDays, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RateError::Transient(_)));
        assert_eq!(source.calls(), 3);
        // Transient failures never trigger re-authentication
        assert_eq!(acquirer.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_recovers_within_budget() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(RateError::Transient("timeout".into())),
            Err(RateError::Transient("timeout".into())),
        ]));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![]));
        let fetcher = fetcher_with(source.clone(), acquirer);

        assert!(fetcher.fetch(&usd_jpy(), Period::HalfYear, None).await.is_ok());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_keeps_points_from_failed_attempts() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(RateError::Transient("HTTP 503".into())),
            Err(RateError::Transient("HTTP 503".into())),
        ]));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![]));
        let fetcher = fetcher_with(source.clone(), acquirer);

        let previous = sample_series(100);
        fetcher
            .fetch(&usd_jpy(), Period::SevenDays, Some(&previous))
            .await
            .unwrap();

        // Each retry sees the cached points plus every day fetched so far
        assert_eq!(source.seen_known(), vec![2, 3, 4]);
    }

    #[test]
    fn test_known_points_overlay_collected_days() {
        let previous = sample_series(100);
        let day = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        let later = NaiveDate::from_ymd_opt(2025, 1, 8).unwrap();
        let collected = vec![
            RatePoint::on_date(later, Decimal::new(120, 2)),
            RatePoint::on_date(day, Decimal::new(110, 2)),
        ];

        let known = known_points(Some(&previous), &collected).unwrap();
        assert_eq!(known.len(), 3);
        assert_eq!(known.rate_on(day), Some(Decimal::new(110, 2)));
        assert_eq!(known.rate_on(later), Some(Decimal::new(120, 2)));

        assert_eq!(known_points(None, &[]), None);
        assert_eq!(known_points(None, &collected).map(|s| s.len()), Some(2));
    }

    #[tokio::test]
    async fn test_failed_reacquisition_is_surfaced() {
        let source = Arc::new(ScriptedSource::new(vec![Err(RateError::AuthRejected(
            "HTTP 403".into(),
        ))]));
        let acquirer = Arc::new(ScriptedAcquirer::new(vec![
            Err(RateError::AcquisitionFailed("no browser".into())),
            Err(RateError::AcquisitionFailed("no browser".into())),
        ]));
        let fetcher = fetcher_with(source.clone(), acquirer.clone());

        let err = fetcher
            .fetch(&usd_jpy(), Period::SevenDays, None)
            .await
            .unwrap_err();
        assert!(err.is_acquisition());
        assert_eq!(source.calls(), 1);
        assert_eq!(acquirer.calls(), 2);
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.transient_delays,
            vec![Duration::from_secs(1), Duration::from_secs(3)]
        );
    }
}
