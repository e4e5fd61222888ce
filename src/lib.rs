pub mod cli;
pub mod core;
pub mod providers;
pub mod store;

use crate::core::chart::ChartService;
use crate::core::config::AppConfig;
use crate::core::credential::{CredentialAcquirer, CredentialStore};
use crate::core::fetcher::{RateFetcher, RateSource};
use crate::core::scheduler::{Bootstrap, RefreshScheduler};
use crate::core::{CacheStore, CurrencyPair, PairHistory, Period};
use crate::providers::browser::{BrowserSettings, ChromiumAcquirer, cookie_domain_for};
use crate::providers::mastercard::MastercardSource;
use crate::providers::util::RequestPacing;
use crate::store::KeyValueStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const RATES_COLLECTION: &str = "rates";
const HISTORY_COLLECTION: &str = "history";
const CREDENTIALS_COLLECTION: &str = "credentials";

pub enum AppCommand {
    Chart {
        pair: CurrencyPair,
        period: Period,
        json: bool,
    },
    History,
    Search {
        query: String,
    },
    Login,
    Refresh,
    Watch,
}

/// The wired-up application: store, credential holder and scheduler.
pub struct App {
    config: AppConfig,
    store: KeyValueStore,
    credentials: Arc<CredentialStore>,
    scheduler: RefreshScheduler,
}

impl App {
    /// Builds the application against Mastercard, acquiring sessions with a
    /// local Chromium.
    pub fn build(config: AppConfig) -> Result<Self> {
        let source = mastercard_source(&config)?;
        let mut settings = BrowserSettings::new(
            source.landing_url(),
            cookie_domain_for(&source.identity()),
        );
        settings.executable = config.browser.executable.clone();
        settings.headless = config.browser.headless;
        settings.wait = Duration::from_secs(config.browser.wait_secs);
        settings.launch_timeout = Duration::from_secs(config.browser.launch_timeout_secs);
        settings.required_cookies = config.browser.required_cookies.clone();
        settings.warmup_url = config
            .browser
            .warmup
            .then(|| source.rates_url().to_string());

        let identity = source.identity();
        Self::assemble(
            config,
            Arc::new(source),
            identity,
            Arc::new(ChromiumAcquirer::new(settings)),
        )
    }

    /// Builds the application against the configured source with a custom
    /// session acquirer.
    pub fn with_acquirer(config: AppConfig, acquirer: Arc<dyn CredentialAcquirer>) -> Result<Self> {
        let source = mastercard_source(&config)?;
        let identity = source.identity();
        Self::assemble(config, Arc::new(source), identity, acquirer)
    }

    fn assemble(
        config: AppConfig,
        source: Arc<dyn RateSource>,
        identity: String,
        acquirer: Arc<dyn CredentialAcquirer>,
    ) -> Result<Self> {
        config.validate()?;
        let data_path = config.default_data_path()?;
        let store = KeyValueStore::open(&data_path)?;
        debug!(path = %data_path.display(), "Opened data store");

        let cache = Arc::new(CacheStore::load(
            store.collection(RATES_COLLECTION)?,
            config.freshness_policy()?,
        ));
        let history = Arc::new(PairHistory::load(store.collection(HISTORY_COLLECTION)?));
        let credentials = Arc::new(CredentialStore::with_persistence(
            acquirer,
            identity,
            store.collection(CREDENTIALS_COLLECTION)?,
        ));
        let fetcher = RateFetcher::new(source, Arc::clone(&credentials), config.retry_policy());
        let scheduler = RefreshScheduler::new(cache, history, fetcher);

        Ok(Self {
            config,
            store,
            credentials,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// A chart service that first fetches the default chart into an empty cache.
    pub fn chart_service(&self) -> Result<ChartService> {
        let (pair, period) = self.config.default_pair()?;
        let bootstrap = self.scheduler.bootstrap(pair, period);
        Ok(ChartService::new(self.scheduler.clone(), bootstrap))
    }

    /// Flushes cached series, history and the session to disk.
    pub fn persist(&self) -> Result<()> {
        self.store.persist()
    }

    fn lookup_service(&self) -> ChartService {
        ChartService::new(self.scheduler.clone(), Bootstrap::completed())
    }

    pub async fn run(&self, command: AppCommand) -> Result<()> {
        let result = match command {
            AppCommand::Chart { pair, period, json } => {
                let service = self.chart_service()?;
                cli::chart::run(&service, &pair, period, json).await
            }
            AppCommand::History => {
                cli::history::run(&self.lookup_service().history());
                Ok(())
            }
            AppCommand::Search { query } => {
                cli::search::run(&query, &self.lookup_service().search_currencies(&query));
                Ok(())
            }
            AppCommand::Login => {
                let credential = self
                    .credentials
                    .refresh()
                    .await
                    .context("Failed to acquire a browser session")?;
                cli::session::show(self.credentials.identity(), &credential);
                Ok(())
            }
            AppCommand::Refresh => {
                let pb = cli::ui::new_spinner("Refreshing stale charts");
                let summary = self.scheduler.refresh_stale().await;
                pb.finish_and_clear();
                println!(
                    "Checked {} charts: {} refreshed, {} failed",
                    summary.checked, summary.refreshed, summary.failed
                );
                Ok(())
            }
            AppCommand::Watch => self.watch().await,
        };

        self.persist()?;
        result
    }

    async fn watch(&self) -> Result<()> {
        let service = self.chart_service()?;
        let bootstrap_pb = cli::ui::new_spinner("Preparing cache");
        let (pair, period) = self.config.default_pair()?;
        // Waits for the bootstrap fetch when the cache was empty
        if let Err(e) = service.get_chart(&pair, period).await {
            tracing::warn!(error = %e, "Default chart unavailable");
        }
        bootstrap_pb.finish_and_clear();

        let every = Duration::from_secs(self.config.refresh.interval_secs);
        let refresh_loop = self.scheduler.spawn_refresh_loop(every);
        println!(
            "Refreshing viewed charts every {}s, press Ctrl-C to stop",
            every.as_secs()
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Stopping refresh loop");
        refresh_loop.shutdown().await;
        Ok(())
    }
}

fn mastercard_source(config: &AppConfig) -> Result<MastercardSource> {
    MastercardSource::new(
        &config.source.base_url,
        Duration::from_secs(config.source.timeout_secs),
        RequestPacing::new(
            Duration::from_millis(config.source.min_delay_ms),
            Duration::from_millis(config.source.max_delay_ms),
        ),
    )
    .with_context(|| format!("Invalid source settings for {}", config.source.base_url))
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("fxchart starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let app = App::build(config)?;
    app.run(command).await
}
