use async_trait::async_trait;
use chrono::Utc;
use fxchart::App;
use fxchart::core::config::AppConfig;
use fxchart::core::credential::{Cookie, Credential, CredentialAcquirer};
use fxchart::core::{CurrencyPair, Freshness, Period, RateResult};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

mod test_utils {
    use fxchart::providers::mastercard::RATES_PATH;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub const RATE_BODY: &str = r#"{"name":"settlement-conversion-rate","data":{"conversionRate":"0.251241","transCurr":"TWD","crdhldBillCurr":"HKD"}}"#;

    pub async fn create_mock_server(rate_body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RATES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(rate_body))
            .mount(&mock_server)
            .await;
        mock_server
    }

    /// Rejects the `stale` session with 403 and serves rates to the `fresh` one.
    pub async fn create_session_checking_server() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(RATES_PATH))
            .and(header("cookie", "_abck=stale"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Access Denied"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(RATES_PATH))
            .and(header("cookie", "_abck=fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RATE_BODY))
            .mount(&mock_server)
            .await;
        mock_server
    }
}

/// Hands out one cookie per acquisition, repeating the last token.
struct StubAcquirer {
    tokens: Mutex<VecDeque<&'static str>>,
    calls: AtomicUsize,
}

impl StubAcquirer {
    fn new(tokens: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(tokens.iter().copied().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialAcquirer for StubAcquirer {
    async fn acquire(&self) -> RateResult<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let token = {
            let mut tokens = self.tokens.lock().unwrap();
            if tokens.len() > 1 {
                tokens.pop_front().unwrap()
            } else {
                *tokens.front().unwrap()
            }
        };
        Ok(Credential {
            cookies: vec![Cookie {
                name: "_abck".to_string(),
                value: token.to_string(),
                domain: "127.0.0.1".to_string(),
                path: "/".to_string(),
            }],
            acquired_at: Utc::now(),
            expires_hint: None,
        })
    }
}

fn test_config(base_url: &str, data_path: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.data_path = Some(data_path.display().to_string());
    config.source.base_url = base_url.to_string();
    config.source.min_delay_ms = 0;
    config.source.max_delay_ms = 0;
    config.source.retry_delays_ms = vec![10, 10];
    config.refresh.default_period = Period::SevenDays;
    config
}

#[test_log::test(tokio::test)]
async fn test_cold_start_bootstraps_then_serves_chart() {
    let mock_server = test_utils::create_mock_server(test_utils::RATE_BODY).await;
    let data_dir = tempfile::tempdir().unwrap();
    let acquirer = StubAcquirer::new(&["fresh"]);

    let app = App::with_acquirer(test_config(&mock_server.uri(), data_dir.path()), acquirer.clone())
        .unwrap();
    let service = app.chart_service().unwrap();

    let usd_jpy = CurrencyPair::new("USD", "JPY").unwrap();
    let chart = service.get_chart(&usd_jpy, Period::SevenDays).await.unwrap();
    info!(points = chart.series.len(), "Received chart");

    assert_eq!(chart.freshness, Freshness::Fresh);
    assert!(!chart.series.is_empty());
    let expected = Decimal::from_str("0.251241").unwrap();
    assert!(chart.series.points().iter().all(|p| p.rate == expected));

    // The default pair was fetched first, then the requested one
    let cache = app.scheduler().cache();
    assert!(cache.get(&CurrencyPair::new("TWD", "HKD").unwrap(), Period::SevenDays).is_some());
    let history: Vec<String> = service.history().iter().map(|r| r.pair.to_string()).collect();
    assert_eq!(history.len(), 2);
    assert!(history.contains(&"USD/JPY".to_string()));
    assert!(history.contains(&"TWD/HKD".to_string()));

    // One browser session serves every request
    assert_eq!(acquirer.calls(), 1);
}

#[test_log::test(tokio::test)]
async fn test_restart_serves_from_disk_without_network() {
    let data_dir = tempfile::tempdir().unwrap();
    let eur_gbp = CurrencyPair::new("EUR", "GBP").unwrap();

    {
        let mock_server = test_utils::create_mock_server(test_utils::RATE_BODY).await;
        let app = App::with_acquirer(
            test_config(&mock_server.uri(), data_dir.path()),
            StubAcquirer::new(&["fresh"]),
        )
        .unwrap();
        let service = app.chart_service().unwrap();
        service.get_chart(&eur_gbp, Period::SevenDays).await.unwrap();
        app.persist().unwrap();
    }

    let offline = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::any())
        .respond_with(wiremock::ResponseTemplate::new(500))
        .expect(0)
        .mount(&offline)
        .await;

    let acquirer = StubAcquirer::new(&["unused"]);
    let app = App::with_acquirer(test_config(&offline.uri(), data_dir.path()), acquirer.clone())
        .unwrap();
    let service = app.chart_service().unwrap();
    let chart = service.get_chart(&eur_gbp, Period::SevenDays).await.unwrap();

    assert_eq!(chart.freshness, Freshness::Fresh);
    assert_eq!(service.history()[0].pair, eur_gbp);
    // The saved session was restored instead of launching a browser
    assert_eq!(app.credentials().peek().unwrap().cookies[0].value, "fresh");
    assert_eq!(acquirer.calls(), 0);
}

#[test_log::test(tokio::test)]
async fn test_rejected_session_is_replaced_once() {
    let mock_server = test_utils::create_session_checking_server().await;
    let data_dir = tempfile::tempdir().unwrap();
    let acquirer = StubAcquirer::new(&["stale", "fresh"]);

    let app = App::with_acquirer(test_config(&mock_server.uri(), data_dir.path()), acquirer.clone())
        .unwrap();
    let service = app.chart_service().unwrap();

    let usd_jpy = CurrencyPair::new("USD", "JPY").unwrap();
    let chart = service.get_chart(&usd_jpy, Period::SevenDays).await.unwrap();

    assert_eq!(chart.freshness, Freshness::Fresh);
    assert_eq!(acquirer.calls(), 2);
    assert_eq!(app.credentials().peek().unwrap().cookies[0].value, "fresh");
}

#[test_log::test(tokio::test)]
async fn test_parse_failure_on_cold_cache_is_reported() {
    let mock_server = test_utils::create_mock_server(r#"{"unexpected":"layout"}"#).await;
    let data_dir = tempfile::tempdir().unwrap();

    let app = App::with_acquirer(
        test_config(&mock_server.uri(), data_dir.path()),
        StubAcquirer::new(&["fresh"]),
    )
    .unwrap();
    let service = app.chart_service().unwrap();

    let usd_jpy = CurrencyPair::new("USD", "JPY").unwrap();
    let err = service.get_chart(&usd_jpy, Period::SevenDays).await.unwrap_err();
    assert!(matches!(err, fxchart::core::RateError::Parse(_)));
    assert!(app.scheduler().cache().is_empty());

    // One request per fetch: the bootstrap's and this one, never retried
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_lookup_commands_run_without_network() {
    let offline = wiremock::MockServer::start().await;
    let data_dir = tempfile::tempdir().unwrap();
    let acquirer = StubAcquirer::new(&["unused"]);
    let app = App::with_acquirer(test_config(&offline.uri(), data_dir.path()), acquirer.clone())
        .unwrap();

    app.run(fxchart::AppCommand::Search {
        query: "hk".to_string(),
    })
    .await
    .unwrap();
    app.run(fxchart::AppCommand::History).await.unwrap();

    assert_eq!(acquirer.calls(), 0);
    assert!(offline.received_requests().await.unwrap().is_empty());
}
