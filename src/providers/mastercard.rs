use async_trait::async_trait;
use chrono::{Duration as DateDuration, NaiveDate, Utc};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::util::{RequestPacing, business_days};
use crate::core::credential::Credential;
use crate::core::error::{RateError, RateResult};
use crate::core::fetcher::{FetchedSeries, RateSource};
use crate::core::rates::{CurrencyPair, Period, RatePoint, RateSeries};

pub const DEFAULT_BASE_URL: &str = "https://www.mastercard.com";
pub const RATES_PATH: &str =
    "/marketingservices/public/mccom-services/currency-conversions/conversion-rates";
pub const LANDING_PATH: &str = "/us/en/personal/get-support/currency-exchange-rate-converter.html";
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:146.0) Gecko/20100101 Firefox/146.0";

/// Daily card-network conversion rates from Mastercard's public converter.
///
/// The endpoint answers one date per request and sits behind a bot manager,
/// so every request carries the browser session cookies and requests are
/// paced.
pub struct MastercardSource {
    client: reqwest::Client,
    base_url: Url,
    rates_url: Url,
    pacing: RequestPacing,
    end_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct ConversionResponse {
    data: Option<ConversionData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionData {
    conversion_rate: Option<serde_json::Value>,
    error_code: Option<serde_json::Value>,
    error_message: Option<String>,
}

#[derive(Debug, PartialEq)]
enum DailyRate {
    Published(Decimal),
    Unpublished(String),
}

impl MastercardSource {
    pub fn new(base_url: &str, timeout: Duration, pacing: RequestPacing) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))?;
        let rates_url = base_url.join(RATES_PATH)?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(browser_headers())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            rates_url,
            pacing,
            end_date: None,
        })
    }

    /// Pins the last day of every window instead of using today's date.
    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// Host the session cookies belong to.
    pub fn identity(&self) -> String {
        self.base_url.host_str().unwrap_or("localhost").to_string()
    }

    pub fn landing_url(&self) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), LANDING_PATH)
    }

    pub fn rates_url(&self) -> &Url {
        &self.rates_url
    }

    fn day_url(&self, pair: &CurrencyPair, day: NaiveDate) -> Url {
        let mut url = self.rates_url.clone();
        url.query_pairs_mut()
            .append_pair("exchange_date", &day.format("%Y-%m-%d").to_string())
            .append_pair("transaction_currency", pair.base())
            .append_pair("cardholder_billing_currency", pair.quote())
            .append_pair("bank_fee", "0")
            .append_pair("transaction_amount", "1");
        url
    }

    async fn fetch_day(
        &self,
        pair: &CurrencyPair,
        day: NaiveDate,
        cookies: &HeaderValue,
    ) -> RateResult<DailyRate> {
        let url = self.day_url(pair, day);
        debug!(%url, "Requesting conversion rate");

        let response = self
            .client
            .get(url)
            .header(header::COOKIE, cookies.clone())
            .send()
            .await
            .map_err(|e| RateError::Transient(format!("request for {day} failed: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(RateError::AuthRejected(format!("HTTP {status} for {day}")));
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                return Err(RateError::Transient(format!("HTTP {status} for {day}")));
            }
            s if s.is_server_error() => {
                return Err(RateError::Transient(format!("HTTP {status} for {day}")));
            }
            StatusCode::OK => {}
            _ => return Err(RateError::Parse(format!("unexpected HTTP {status} for {day}"))),
        }

        let body = response
            .text()
            .await
            .map_err(|e| RateError::Transient(format!("reading body for {day} failed: {e}")))?;
        parse_daily_rate(&body).map_err(|e| match e {
            RateError::Parse(reason) => RateError::Parse(format!("{day}: {reason}")),
            other => other,
        })
    }
}

#[async_trait]
impl RateSource for MastercardSource {
    #[instrument(
        name = "MastercardFetch",
        skip(self, credential, previous, collected),
        fields(pair = %pair, period = %period)
    )]
    async fn fetch(
        &self,
        pair: &CurrencyPair,
        period: Period,
        credential: &Credential,
        previous: Option<&RateSeries>,
        collected: &mut Vec<RatePoint>,
    ) -> RateResult<FetchedSeries> {
        let cookies = HeaderValue::from_str(&credential.cookie_header()).map_err(|_| {
            RateError::AuthRejected("credential cookies are not a valid header".into())
        })?;

        let end = self.end_date.unwrap_or_else(|| Utc::now().date_naive());
        let start = end - DateDuration::days(period.days());
        let days = business_days(start, end);

        let mut points = Vec::with_capacity(days.len());
        let mut requested = 0usize;
        let mut reused = 0usize;
        for day in days {
            if let Some(rate) = previous.and_then(|series| series.rate_on(day)) {
                points.push(RatePoint::on_date(day, rate));
                reused += 1;
                continue;
            }

            if requested > 0 {
                self.pacing.pause().await;
            }
            requested += 1;
            match self.fetch_day(pair, day, &cookies).await? {
                DailyRate::Published(rate) => {
                    let point = RatePoint::on_date(day, rate);
                    collected.push(point);
                    points.push(point);
                }
                DailyRate::Unpublished(reason) => {
                    debug!(%day, %reason, "No rate published, skipping day");
                }
            }
        }

        if points.is_empty() {
            warn!(%start, %end, "Window yielded no rates");
            return Err(RateError::Parse(format!(
                "no rates published for {pair} between {start} and {end}"
            )));
        }

        let series = RateSeries::new(points)?;
        let source_version = series.last().t.date_naive().to_string();
        debug!(points = series.len(), requested, reused, %source_version, "Fetched window");
        Ok(FetchedSeries {
            series,
            source_version,
        })
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static("application/json,text/html;q=0.9,*/*;q=0.8"),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.5"),
    );
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(
        header::UPGRADE_INSECURE_REQUESTS,
        HeaderValue::from_static("1"),
    );
    for (name, value) in [
        ("sec-gpc", "1"),
        ("sec-fetch-dest", "document"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-site", "none"),
        ("sec-fetch-user", "?1"),
    ] {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(256).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype") || head.contains("<html")
}

fn parse_daily_rate(body: &str) -> RateResult<DailyRate> {
    // The bot manager answers an expired session with a 200 challenge page.
    if looks_like_html(body) {
        return Err(RateError::AuthRejected(
            "received an HTML challenge instead of JSON".into(),
        ));
    }

    let response: ConversionResponse =
        serde_json::from_str(body).map_err(|e| RateError::Parse(format!("invalid JSON: {e}")))?;
    let data = response
        .data
        .ok_or_else(|| RateError::Parse("response has no data object".into()))?;

    if let Some(rate) = data.conversion_rate {
        let rate = decimal_from_json(&rate)?;
        if rate <= Decimal::ZERO {
            return Err(RateError::Parse(format!("non-positive rate {rate}")));
        }
        return Ok(DailyRate::Published(rate));
    }

    match data.error_code {
        Some(code) => {
            let code = code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string());
            let message = data.error_message.unwrap_or_default();
            Ok(DailyRate::Unpublished(format!("{code} {message}").trim().to_string()))
        }
        None => Err(RateError::Parse(
            "response has neither conversionRate nor errorCode".into(),
        )),
    }
}

fn decimal_from_json(value: &serde_json::Value) -> RateResult<Decimal> {
    let text = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(RateError::Parse(format!("conversionRate is {other}"))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| RateError::Parse(format!("conversionRate {text:?}: {e}")))
}
