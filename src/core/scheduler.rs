//! Deduplicated rate refreshes
//!
//! Every refresh runs as a task keyed by (pair, period). A request for a key
//! whose task is still live subscribes to it instead of starting another, and
//! all subscribers observe the same terminal state.

use super::cache::CacheStore;
use super::error::{RateError, RateResult};
use super::fetcher::RateFetcher;
use super::history::PairHistory;
use super::rates::{CacheEntry, CacheKey, CurrencyPair, Period};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot of a live task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub pair: CurrencyPair,
    pub period: Period,
    pub requested_at: DateTime<Utc>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
enum TaskState {
    Pending,
    InProgress,
    Done(Arc<CacheEntry>),
    Failed(RateError),
}

impl TaskState {
    fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::InProgress => TaskStatus::InProgress,
            TaskState::Done(_) => TaskStatus::Done,
            TaskState::Failed(_) => TaskStatus::Failed,
        }
    }
}

struct LiveTask {
    id: u64,
    requested_at: DateTime<Utc>,
    tx: Arc<watch::Sender<TaskState>>,
}

/// A subscription to one task's outcome.
pub struct TaskHandle {
    key: CacheKey,
    rx: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub async fn wait(self) -> RateResult<Arc<CacheEntry>> {
        self.wait_with_progress(|_| {}).await
    }

    /// Waits for the task to finish, calling `progress` on every status change.
    pub async fn wait_with_progress(
        mut self,
        mut progress: impl FnMut(TaskStatus),
    ) -> RateResult<Arc<CacheEntry>> {
        let mut reported = None;
        loop {
            let state = self.rx.borrow_and_update().clone();
            if reported != Some(state.status()) {
                reported = Some(state.status());
                progress(state.status());
            }
            match state {
                TaskState::Done(entry) => return Ok(entry),
                TaskState::Failed(err) => return Err(err),
                TaskState::Pending | TaskState::InProgress => {}
            }
            if self.rx.changed().await.is_err() {
                return match &*self.rx.borrow() {
                    TaskState::Done(entry) => Ok(Arc::clone(entry)),
                    TaskState::Failed(err) => Err(err.clone()),
                    _ => Err(RateError::Transient(format!(
                        "refresh of {} ended without a result",
                        self.key
                    ))),
                };
            }
        }
    }
}

/// Signals that the startup fetch has finished, successfully or not.
#[derive(Clone)]
pub struct Bootstrap {
    rx: watch::Receiver<bool>,
}

impl Bootstrap {
    pub fn completed() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender means the bootstrap task is gone; nothing left to wait for.
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub checked: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Handle to the background refresh loop; the loop stops when this is shut
/// down or dropped.
pub struct RefreshLoop {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RefreshLoop {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "Refresh loop ended abnormally");
        }
    }
}

struct SchedulerInner {
    cache: Arc<CacheStore>,
    history: Arc<PairHistory>,
    fetcher: RateFetcher,
    tasks: Mutex<HashMap<CacheKey, LiveTask>>,
    next_id: AtomicU64,
}

/// Removes a task from the live table when its runner finishes, including by
/// panic, unless a newer task has taken the key.
struct LiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
    key: &'a CacheKey,
    id: u64,
}

impl Drop for LiveTaskGuard<'_> {
    fn drop(&mut self) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if tasks.get(self.key).is_some_and(|task| task.id == self.id) {
            tasks.remove(self.key);
        }
    }
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
    pub fn new(cache: Arc<CacheStore>, history: Arc<PairHistory>, fetcher: RateFetcher) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                cache,
                history,
                fetcher,
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    pub fn history(&self) -> &Arc<PairHistory> {
        &self.inner.history
    }

    /// Starts a refresh of (pair, period), or joins the one already running.
    pub fn schedule(&self, pair: &CurrencyPair, period: Period) -> TaskHandle {
        let key = CacheKey::new(pair.clone(), period);
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(live) = tasks.get(&key) {
            debug!(%key, "Joining in-flight refresh");
            return TaskHandle {
                key,
                rx: live.tx.subscribe(),
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(TaskState::Pending);
        let tx = Arc::new(tx);
        tasks.insert(
            key.clone(),
            LiveTask {
                id,
                requested_at: Utc::now(),
                tx: Arc::clone(&tx),
            },
        );
        drop(tasks);

        debug!(%key, id, "Scheduled refresh");
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        tokio::spawn(async move { inner.run_task(task_key, id, tx).await });

        TaskHandle { key, rx }
    }

    /// Live tasks, oldest request first.
    pub fn tasks(&self) -> Vec<FetchTask> {
        let mut tasks: Vec<FetchTask> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, live)| FetchTask {
                pair: key.pair.clone(),
                period: key.period,
                requested_at: live.requested_at,
                status: live.tx.borrow().status(),
            })
            .collect();
        tasks.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        tasks
    }

    /// Fetches the default chart when the cache is empty.
    ///
    /// The returned signal completes once that fetch has finished, or
    /// immediately when the cache already holds data.
    pub fn bootstrap(&self, pair: CurrencyPair, period: Period) -> Bootstrap {
        if !self.inner.cache.is_empty() {
            debug!(entries = self.inner.cache.len(), "Cache populated, skipping bootstrap");
            return Bootstrap::completed();
        }

        info!(%pair, %period, "Cache empty, fetching default chart");
        let handle = self.schedule(&pair, period);
        let history = Arc::clone(&self.inner.history);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(_) => {
                    history.record(&pair, period);
                }
                Err(e) => warn!(%pair, %period, error = %e, "Bootstrap fetch failed"),
            }
            tx.send_replace(true);
        });
        Bootstrap { rx }
    }

    /// Refreshes every remembered key that is missing or stale, one at a time.
    pub async fn refresh_stale(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        for key in self.inner.history.keys() {
            summary.checked += 1;
            let due = match self.inner.cache.get(&key.pair, key.period) {
                Some(entry) => self.inner.cache.is_stale(&entry),
                None => true,
            };
            if !due {
                continue;
            }

            match self.schedule(&key.pair, key.period).wait().await {
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(%key, error = %e, "Background refresh failed");
                }
            }
        }
        info!(
            checked = summary.checked,
            refreshed = summary.refreshed,
            failed = summary.failed,
            "Refresh pass finished"
        );
        summary
    }

    /// Runs [`RefreshScheduler::refresh_stale`] every `every` until shut down.
    pub fn spawn_refresh_loop(&self, every: Duration) -> RefreshLoop {
        let scheduler = self.clone();
        let (tx, mut rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?every, "Refresh loop started");
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = &mut rx => break,
                    _ = scheduler.refresh_stale() => {}
                }
            }
            info!("Refresh loop stopped");
        });

        RefreshLoop {
            shutdown: Some(tx),
            handle,
        }
    }
}

impl SchedulerInner {
    async fn run_task(&self, key: CacheKey, id: u64, tx: Arc<watch::Sender<TaskState>>) {
        let guard = LiveTaskGuard {
            inner: self,
            key: &key,
            id,
        };
        tx.send_replace(TaskState::InProgress);

        let previous = self.cache.get(&key.pair, key.period);
        let outcome = self
            .fetcher
            .fetch(&key.pair, key.period, previous.as_ref().map(|entry| &entry.series))
            .await
            .and_then(|fetched| {
                self.cache
                    .put(&key.pair, key.period, fetched.series, fetched.source_version)
            });

        let state = match outcome {
            Ok(entry) => {
                info!(%key, points = entry.series.len(), version = %entry.source_version, "Refresh done");
                TaskState::Done(entry)
            }
            Err(e) => {
                warn!(%key, error = %e, kept_previous = previous.is_some(), "Refresh failed");
                TaskState::Failed(e)
            }
        };

        // Leave the table before publishing, so a request arriving after the
        // outcome starts a new task instead of joining a finished one.
        drop(guard);
        tx.send_replace(state);
    }
}
