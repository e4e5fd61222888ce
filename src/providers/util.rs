use chrono::{Datelike, NaiveDate, Weekday};
use std::time::Duration;
use tracing::debug;

/// Monday to Friday dates in `start..=end`, oldest first.
pub fn business_days(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| !matches!(day.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

/// Jittered pause between consecutive requests to the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPacing {
    min: Duration,
    max: Duration,
}

impl RequestPacing {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// A delay drawn uniformly from `min..=max`.
    pub fn next_delay(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(fastrand::u64(min..=max))
    }

    pub async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            debug!(?delay, "Pacing before next request");
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RequestPacing {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3))
    }
}
