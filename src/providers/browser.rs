//! Browser-driven credential acquisition
//!
//! The rate endpoint only answers requests carrying the cookies its bot
//! manager plants through JavaScript, so a real Chromium is launched with a
//! throwaway profile and driven over the DevTools protocol until the required
//! cookies appear.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, trace, warn};

use super::mastercard::USER_AGENT;
use crate::core::credential::{Cookie, Credential, CredentialAcquirer};
use crate::core::error::{RateError, RateResult};

pub const EXECUTABLE_CANDIDATES: [&str; 4] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

const DEVTOOLS_BANNER: &str = "DevTools listening on ";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WARMUP_SETTLE: Duration = Duration::from_secs(2);
/// Allowance on top of the cookie wait for DevTools round trips.
const SESSION_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    /// How long the page may take to plant the required cookies.
    pub wait: Duration,
    /// How long the browser may take to expose its DevTools endpoint.
    pub launch_timeout: Duration,
    pub required_cookies: Vec<String>,
    pub landing_url: String,
    /// Visited once after the required cookies appear, so the session has
    /// also been seen on the API host.
    pub warmup_url: Option<String>,
    /// Cookies are kept when their domain falls under this one.
    pub cookie_domain: String,
}

impl BrowserSettings {
    pub fn new(landing_url: impl Into<String>, cookie_domain: impl Into<String>) -> Self {
        Self {
            executable: None,
            headless: false,
            wait: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(20),
            required_cookies: vec!["_abck".into(), "bm_sz".into(), "bm_sv".into()],
            landing_url: landing_url.into(),
            warmup_url: None,
            cookie_domain: cookie_domain.into(),
        }
    }
}

/// Launches a local Chromium for every acquisition.
pub struct ChromiumAcquirer {
    settings: BrowserSettings,
}

impl ChromiumAcquirer {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    fn resolve_executable(&self) -> RateResult<PathBuf> {
        match &self.settings.executable {
            Some(path) if path.components().count() > 1 => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(RateError::AcquisitionFailed(format!(
                        "browser executable {} does not exist",
                        path.display()
                    )))
                }
            }
            Some(name) => {
                let name = name.to_string_lossy();
                find_executable(&[name.as_ref()], search_path()).ok_or_else(|| {
                    RateError::AcquisitionFailed(format!("{name} not found in PATH"))
                })
            }
            None => find_executable(&EXECUTABLE_CANDIDATES, search_path()).ok_or_else(|| {
                RateError::AcquisitionFailed(format!(
                    "no browser found in PATH (tried {})",
                    EXECUTABLE_CANDIDATES.join(", ")
                ))
            }),
        }
    }
}

#[async_trait]
impl CredentialAcquirer for ChromiumAcquirer {
    #[instrument(name = "BrowserAcquire", skip(self), fields(url = %self.settings.landing_url))]
    async fn acquire(&self) -> RateResult<Credential> {
        let executable = self.resolve_executable()?;
        let browser = BrowserProcess::launch(&executable, &self.settings).await?;

        let result = collect(&browser.devtools_url, &self.settings).await;
        browser.shutdown().await;
        result
    }
}

/// Upper bound for a whole DevTools session, from connect to close.
fn session_budget(settings: &BrowserSettings) -> Duration {
    let warmup = if settings.warmup_url.is_some() {
        WARMUP_SETTLE
    } else {
        Duration::ZERO
    };
    settings
        .wait
        .saturating_add(warmup)
        .saturating_add(SESSION_MARGIN)
}

/// Harvests the session cookies over DevTools within [`session_budget`].
async fn collect(devtools_url: &str, settings: &BrowserSettings) -> RateResult<Credential> {
    let budget = session_budget(settings);
    let session = async {
        let mut session = DevToolsSession::connect(devtools_url).await?;
        let harvested = harvest(&mut session, settings).await;
        session.close().await;
        harvested
    };
    match timeout(budget, session).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?budget, "DevTools session did not finish in time");
            Err(RateError::AcquisitionTimeout(budget))
        }
    }
}

/// A running browser and its throwaway profile.
///
/// The child is killed when dropped, so early returns and cancellation never
/// leave a browser behind.
struct BrowserProcess {
    child: Child,
    devtools_url: String,
    _profile: TempDir,
}

impl BrowserProcess {
    async fn launch(executable: &Path, settings: &BrowserSettings) -> RateResult<Self> {
        let profile = TempDir::new()
            .map_err(|e| RateError::AcquisitionFailed(format!("temporary profile: {e}")))?;

        let mut command = Command::new(executable);
        command
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg(format!("--user-agent={USER_AGENT}"))
            .args([
                "--no-first-run",
                "--no-default-browser-check",
                "--disable-blink-features=AutomationControlled",
                "--disable-dev-shm-usage",
            ]);
        if settings.headless {
            command.arg("--headless=new");
        }
        command
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(executable = %executable.display(), headless = settings.headless, "Launching browser");
        let mut child = command.spawn().map_err(|e| {
            RateError::AcquisitionFailed(format!("failed to start {}: {e}", executable.display()))
        })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RateError::AcquisitionFailed("browser stderr unavailable".into()))?;

        let mut lines = BufReader::new(stderr).lines();
        let devtools_url = timeout(settings.launch_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(%line, "browser");
                if let Some(url) = devtools_url_from_line(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await
        .map_err(|_| {
            RateError::AcquisitionFailed(format!(
                "browser did not expose DevTools within {:?}",
                settings.launch_timeout
            ))
        })?
        .ok_or_else(|| {
            RateError::AcquisitionFailed("browser exited before exposing DevTools".into())
        })?;

        // Keep draining stderr so the browser never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(%line, "browser");
            }
        });

        debug!(%devtools_url, "Browser ready");
        Ok(Self {
            child,
            devtools_url,
            _profile: profile,
        })
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Browser already exited");
        }
        match timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Browser stopped"),
            Ok(Err(e)) => warn!(error = %e, "Failed to reap browser"),
            Err(_) => warn!("Browser did not stop in time"),
        }
    }
}

type DevToolsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Request/response channel to the browser-level DevTools endpoint.
struct DevToolsSession {
    stream: DevToolsStream,
    next_id: u64,
}

impl DevToolsSession {
    async fn connect(url: &str) -> RateResult<Self> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| RateError::AcquisitionFailed(format!("DevTools connection: {e}")))?;
        Ok(Self { stream, next_id: 0 })
    }

    async fn call(&mut self, method: &str, params: Value) -> RateResult<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({ "id": id, "method": method, "params": params });
        self.stream
            .send(Message::text(request.to_string()))
            .await
            .map_err(|e| RateError::AcquisitionFailed(format!("{method}: {e}")))?;

        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let Ok(reply) = serde_json::from_str::<Value>(&text) else {
                        warn!("Ignoring malformed DevTools message");
                        continue;
                    };
                    if reply.get("id").and_then(Value::as_u64) != Some(id) {
                        // Events and replies to earlier calls
                        continue;
                    }
                    if let Some(error) = reply.get("error") {
                        return Err(RateError::AcquisitionFailed(format!("{method}: {error}")));
                    }
                    return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(RateError::AcquisitionFailed(format!("{method}: {e}"))),
            }
        }
        Err(RateError::AcquisitionFailed(format!(
            "DevTools connection closed during {method}"
        )))
    }

    async fn open_page(&mut self, url: &str) -> RateResult<()> {
        let result = self.call("Target.createTarget", json!({ "url": url })).await?;
        debug!(%url, target = %result["targetId"], "Opened page");
        Ok(())
    }

    async fn cookies(&mut self) -> RateResult<Vec<DevToolsCookie>> {
        let result = self.call("Storage.getCookies", json!({})).await?;
        let cookies = result.get("cookies").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(cookies)
            .map_err(|e| RateError::AcquisitionFailed(format!("unreadable cookies: {e}")))
    }

    async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            trace!(error = %e, "DevTools close");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DevToolsCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    /// Seconds since the epoch, negative for session cookies.
    #[serde(default)]
    expires: f64,
}

async fn harvest(session: &mut DevToolsSession, settings: &BrowserSettings) -> RateResult<Credential> {
    session.open_page(&settings.landing_url).await?;

    let deadline = Instant::now().checked_add(settings.wait);
    loop {
        let cookies = scoped_cookies(session.cookies().await?, &settings.cookie_domain);
        let missing = missing_names(&cookies, &settings.required_cookies);
        if missing.is_empty() {
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(?missing, "Required cookies did not appear");
            return Err(RateError::AcquisitionTimeout(settings.wait));
        }
        trace!(?missing, "Waiting for cookies");
        sleep(POLL_INTERVAL).await;
    }

    if let Some(warmup_url) = &settings.warmup_url {
        session.open_page(warmup_url).await?;
        sleep(WARMUP_SETTLE).await;
    }

    let cookies = scoped_cookies(session.cookies().await?, &settings.cookie_domain);
    let missing = missing_names(&cookies, &settings.required_cookies);
    if !missing.is_empty() {
        return Err(RateError::AcquisitionFailed(format!(
            "cookies disappeared after warm-up: {}",
            missing.join(", ")
        )));
    }
    Ok(credential_from(cookies, &settings.required_cookies, Utc::now()))
}

fn devtools_url_from_line(line: &str) -> Option<String> {
    line.split_once(DEVTOOLS_BANNER)
        .map(|(_, url)| url.trim().to_string())
        .filter(|url| url.starts_with("ws://"))
}

fn scoped_cookies(cookies: Vec<DevToolsCookie>, domain: &str) -> Vec<DevToolsCookie> {
    cookies
        .into_iter()
        .filter(|c| {
            let host = c.domain.trim_start_matches('.');
            host == domain || host.ends_with(&format!(".{domain}"))
        })
        .collect()
}

fn missing_names<'a>(cookies: &[DevToolsCookie], required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|name| !cookies.iter().any(|c| &c.name == *name))
        .map(String::as_str)
        .collect()
}

/// The earliest expiry among the required cookies becomes the hint.
fn credential_from(
    cookies: Vec<DevToolsCookie>,
    required: &[String],
    acquired_at: DateTime<Utc>,
) -> Credential {
    let expires_hint = cookies
        .iter()
        .filter(|c| c.expires > 0.0 && required.contains(&c.name))
        .filter_map(|c| DateTime::from_timestamp(c.expires as i64, 0))
        .min();

    Credential {
        cookies: cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect(),
        acquired_at,
        expires_hint,
    }
}

fn search_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default()
}

fn find_executable(candidates: &[&str], dirs: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.iter().find_map(|name| {
        dirs.iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    })
}

/// Registrable part of a host, used to scope cookies: `www.mastercard.com`
/// becomes `mastercard.com`.
pub fn cookie_domain_for(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 || host.parse::<std::net::IpAddr>().is_ok() {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}
