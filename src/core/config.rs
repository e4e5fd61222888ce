use anyhow::{Context, Result, bail, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};
use tracing::debug;

use super::cache::FreshnessPolicy;
use super::fetcher::RetryPolicy;
use super::rates::{CurrencyPair, Period};
use crate::providers::mastercard::DEFAULT_BASE_URL;

/// Longest accepted timeout or wait, in seconds.
const MAX_WAIT_SECS: u64 = 10 * 60;
/// Longest accepted refresh interval, in seconds.
const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Backoff before each retry of a transient failure.
    pub retry_delays_ms: Vec<u64>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 15,
            retry_delays_ms: vec![1000, 3000],
            min_delay_ms: 1000,
            max_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrowserConfig {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub wait_secs: u64,
    pub launch_timeout_secs: u64,
    pub required_cookies: Vec<String>,
    /// Also open the rate endpoint once the session cookies are set.
    pub warmup: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        BrowserConfig {
            executable: None,
            headless: false,
            wait_secs: 10,
            launch_timeout_secs: 20,
            required_cookies: vec!["_abck".into(), "bm_sz".into(), "bm_sv".into()],
            warmup: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub default_base: String,
    pub default_quote: String,
    pub default_period: Period,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            interval_secs: 300,
            default_base: "TWD".to_string(),
            default_quote: "HKD".to_string(),
            default_period: Period::HalfYear,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub data_path: Option<String>,
    pub freshness_minutes: BTreeMap<Period, u64>,
    pub source: SourceConfig,
    pub browser: BrowserConfig,
    pub refresh: RefreshConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            data_path: None,
            freshness_minutes: FreshnessPolicy::DEFAULT_MINUTES
                .iter()
                .map(|(period, minutes)| (*period, *minutes as u64))
                .collect(),
            source: SourceConfig::default(),
            browser: BrowserConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads the config from the default location, falling back to defaults
    /// when no file exists there.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            debug!(path = %config_path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "fxchart", "fxchart")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("io", "fxchart", "fxchart")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.freshness_policy()?;
        self.default_pair()?;
        reqwest::Url::parse(&self.source.base_url)
            .with_context(|| format!("source.base_url is not a URL: {}", self.source.base_url))?;
        ensure!(
            self.source.min_delay_ms <= self.source.max_delay_ms,
            "source.min_delay_ms ({}) exceeds source.max_delay_ms ({})",
            self.source.min_delay_ms,
            self.source.max_delay_ms
        );
        for (name, secs) in [
            ("source.timeout_secs", self.source.timeout_secs),
            ("browser.wait_secs", self.browser.wait_secs),
            ("browser.launch_timeout_secs", self.browser.launch_timeout_secs),
        ] {
            ensure!(
                (1..=MAX_WAIT_SECS).contains(&secs),
                "{name} must be between 1 and {MAX_WAIT_SECS}, got {secs}"
            );
        }
        ensure!(
            self.source.retry_delays_ms.iter().all(|ms| *ms <= MAX_WAIT_SECS * 1000),
            "source.retry_delays_ms must not exceed {} ms",
            MAX_WAIT_SECS * 1000
        );
        ensure!(
            !self.browser.required_cookies.is_empty(),
            "browser.required_cookies must name at least one cookie"
        );
        if !(1..=MAX_INTERVAL_SECS).contains(&self.refresh.interval_secs) {
            bail!(
                "refresh.interval_secs must be between 1 and {MAX_INTERVAL_SECS}, got {}",
                self.refresh.interval_secs
            );
        }
        Ok(())
    }

    pub fn freshness_policy(&self) -> Result<FreshnessPolicy> {
        FreshnessPolicy::from_minutes(&self.freshness_minutes)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            transient_delays: self
                .source
                .retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }

    pub fn default_pair(&self) -> Result<(CurrencyPair, Period)> {
        let pair = CurrencyPair::new(&self.refresh.default_base, &self.refresh.default_quote)
            .context("Invalid default pair in refresh settings")?;
        Ok((pair, self.refresh.default_period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        config.validate().unwrap();

        let (pair, period) = config.default_pair().unwrap();
        assert_eq!(pair.to_string(), "TWD/HKD");
        assert_eq!(period, Period::HalfYear);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.freshness_policy().unwrap(), FreshnessPolicy::default());
    }

    #[test]
    fn test_config_deserialization() {
        let yaml_str = r#"
data_path: /tmp/fxchart
freshness_minutes:
  7d: 30
  180d: 1440
source:
  base_url: "http://localhost:8080"
  retry_delays_ms: [10, 20, 40]
browser:
  executable: /usr/bin/chromium
  headless: true
refresh:
  default_base: usd
  default_quote: jpy
  default_period: 30d
"#;

        let config: AppConfig = serde_yaml::from_str(yaml_str).expect("Failed to deserialize");
        config.validate().unwrap();

        assert_eq!(config.data_path.as_deref(), Some("/tmp/fxchart"));
        assert_eq!(config.default_data_path().unwrap(), PathBuf::from("/tmp/fxchart"));
        assert_eq!(config.source.base_url, "http://localhost:8080");
        assert_eq!(config.source.timeout_secs, 15);
        assert_eq!(config.retry_policy().transient_delays.len(), 3);
        assert_eq!(
            config.browser.executable,
            Some(PathBuf::from("/usr/bin/chromium"))
        );
        assert!(config.browser.headless);
        assert_eq!(config.browser.wait_secs, 10);

        let policy = config.freshness_policy().unwrap();
        assert_eq!(policy.window(Period::SevenDays), chrono::Duration::minutes(30));
        assert_eq!(policy.window(Period::ThirtyDays), chrono::Duration::minutes(180));
        assert_eq!(policy.window(Period::HalfYear), chrono::Duration::minutes(1440));

        let (pair, period) = config.default_pair().unwrap();
        assert_eq!(pair.to_string(), "USD/JPY");
        assert_eq!(period, Period::ThirtyDays);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let non_monotonic: AppConfig =
            serde_yaml::from_str("freshness_minutes:\n  7d: 1000\n  30d: 10\n").unwrap();
        assert!(non_monotonic.validate().is_err());

        let bad_pair: AppConfig =
            serde_yaml::from_str("refresh:\n  default_base: USD\n  default_quote: USD\n").unwrap();
        assert!(bad_pair.validate().is_err());

        let bad_delays: AppConfig =
            serde_yaml::from_str("source:\n  min_delay_ms: 500\n  max_delay_ms: 100\n").unwrap();
        assert!(bad_delays.validate().is_err());

        assert!(serde_yaml::from_str::<AppConfig>("refresh:\n  default_period: 1y\n").is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_durations() {
        let huge_freshness: AppConfig =
            serde_yaml::from_str("freshness_minutes:\n  180d: 9223372036854775807\n").unwrap();
        assert!(huge_freshness.validate().is_err());

        for yaml in [
            "browser:\n  wait_secs: 18446744073709551615\n",
            "browser:\n  launch_timeout_secs: 0\n",
            "source:\n  timeout_secs: 86400\n",
            "source:\n  retry_delays_ms: [1000, 18446744073709551615]\n",
            "refresh:\n  interval_secs: 18446744073709551615\n",
        ] {
            let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("must"), "{yaml}: {err}");
        }
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: AppConfig =
            serde_yaml::from_str(include_str!("../../docs/example_config.yaml")).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "refresh:\n  interval_secs: 60\n").unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(config.refresh.interval_secs, 60);

        fs::write(&path, "refresh:\n  interval_secs: 0\n").unwrap();
        assert!(AppConfig::load_from_path(&path).is_err());
        assert!(AppConfig::load_from_path(dir.path().join("missing.yaml")).is_err());
    }
}
