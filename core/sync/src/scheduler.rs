//! Background sync scheduling.
//!
//! Every account gets one long-lived task that wakes on a periodic tick or
//! on an explicit trigger. A run takes the account lock, then a worker
//! permit, so one account never syncs twice at once and the number of
//! concurrent provider requests stays bounded.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{SyncContext, SyncUpdate};
use crate::locks::AccountGuard;
use crate::refresher::TokenRefresher;
use crate::retry::{RetryAttempt, RetryConfig, RetryExecutor};
use crate::state::{SyncState, SyncStatus};
use calvault_common::{CredentialPayload, Error, Event, Result, TimeRange};
use calvault_providers::{FetchOutcome, ProviderAdapter};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period between background runs of one account.
    pub sync_interval_secs: u64,
    /// Maximum age of the last full fetch before the cursor is ignored.
    pub full_resync_interval_secs: u64,
    /// Number of accounts that may sync at the same time.
    pub max_concurrent_syncs: usize,
    /// Whole days before today included in the fetch window.
    pub window_past_days: i64,
    /// Whole days after today included in the fetch window.
    pub window_future_days: i64,
    /// Sync every account as soon as it is scheduled at startup.
    pub sync_on_start: bool,
    /// Backoff for transient failures.
    pub retry: RetryConfig,
}

impl SchedulerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn full_resync_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.full_resync_interval_secs as i64)
    }

    /// Fetch window around `now`, aligned to UTC midnight.
    ///
    /// The window only moves once a day, so providers can tell whether a
    /// previous fetch still covers it.
    pub fn window(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        let today = now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc();
        TimeRange::new(
            today - chrono::Duration::days(self.window_past_days),
            today + chrono::Duration::days(self.window_future_days + 1),
        )
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 15 * 60,
            full_resync_interval_secs: 24 * 60 * 60,
            max_concurrent_syncs: 4,
            window_past_days: 30,
            window_future_days: 90,
            sync_on_start: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of one successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub label: String,
    /// Whether the stored cursor was ignored.
    pub full: bool,
    /// Events held for the account afterwards.
    pub event_count: usize,
    pub synced_at: DateTime<Utc>,
}

/// Runs syncs. Shared by every account task.
struct SyncRunner {
    ctx: Arc<SyncContext>,
    refresher: Arc<TokenRefresher>,
    config: SchedulerConfig,
    permits: Semaphore,
}

impl SyncRunner {
    /// Sync with backoff on transient failures, recording the outcome.
    async fn run(
        &self,
        label: &str,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let executor = RetryExecutor::new(self.config.retry.clone());
        let result = executor
            .execute_observed(
                cancel,
                || self.sync_once(label, force_full, cancel),
                |attempt| self.record_backoff(label, attempt),
            )
            .await;

        if let Err(e) = &result {
            self.record_failure(label, e).await;
        }
        result
    }

    async fn sync_once(
        &self,
        label: &str,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let guard = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            guard = self.ctx.locks.lock(label) => guard,
        };
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            permit = self.permits.acquire() => permit.map_err(|_| cancelled())?,
        };

        let now = Utc::now();
        let state = self
            .ctx
            .states
            .get(label)
            .await
            .unwrap_or_else(|| SyncState::new(label));
        let window = self.config.window(now)?;

        let (provider, payload) = self.refresher.ensure_fresh(&guard).await?;
        let adapter = self.ctx.registry.get(provider)?;

        // Deltas need a snapshot to merge into; after a restart there is none
        let mut full = force_full
            || !self.ctx.snapshot.contains(label)
            || state.needs_full_sync(now, self.config.full_resync_interval());
        let cursor = if full { None } else { state.cursor.clone() };

        debug!(
            "Syncing account {} ({})",
            label,
            if full { "full" } else { "incremental" }
        );

        let outcome = match self
            .fetch(adapter.as_ref(), &payload, &window, cursor.as_deref(), cancel)
            .await
        {
            Err(Error::CursorExpired(reason)) => {
                warn!("Cursor of account {} expired ({}), resyncing", label, reason);
                full = true;
                self.fetch(adapter.as_ref(), &payload, &window, None, cancel)
                    .await?
            }
            Err(Error::Auth(reason)) if payload.is_refreshable() => {
                debug!("Account {} rejected its token: {}", label, reason);
                let fresh = self.force_refresh(&guard, &payload).await?;
                self.fetch(adapter.as_ref(), &fresh, &window, cursor.as_deref(), cancel)
                    .await?
            }
            other => other?,
        };

        let FetchOutcome {
            mut changes,
            cursor: next_cursor,
        } = outcome;
        changes.attribute_to(label);
        let event_count = self.ctx.snapshot.apply(label, changes);

        let synced_at = Utc::now();
        let state = self
            .ctx
            .states
            .update(label, |state| {
                state.cursor = next_cursor;
                state.last_synced_at = Some(synced_at);
                if full {
                    state.last_full_sync_at = Some(synced_at);
                }
                state.status = SyncStatus::Ok;
                state.last_error = None;
            })
            .await?;
        self.ctx
            .publish(SyncUpdate::from_state(&state, Some(event_count)));

        info!(
            "Synced account {}: {} events ({})",
            label,
            event_count,
            if full { "full" } else { "incremental" }
        );
        Ok(SyncReport {
            label: label.to_string(),
            full,
            event_count,
            synced_at,
        })
    }

    async fn fetch(
        &self,
        adapter: &dyn ProviderAdapter,
        payload: &CredentialPayload,
        window: &TimeRange,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            outcome = adapter.fetch_events(payload, window, cursor) => outcome,
        }
    }

    async fn force_refresh(
        &self,
        guard: &AccountGuard,
        payload: &CredentialPayload,
    ) -> Result<CredentialPayload> {
        self.refresher
            .force_refresh(guard, payload.provider(), payload)
            .await
    }

    async fn record_backoff(&self, label: &str, attempt: RetryAttempt) {
        let delay =
            chrono::Duration::from_std(attempt.delay).unwrap_or_else(|_| chrono::Duration::zero());
        let retry_at = Utc::now() + delay;
        let committed = self
            .ctx
            .states
            .update(label, |state| {
                state.status = SyncStatus::Backoff {
                    attempt: attempt.attempt,
                    retry_at,
                };
                state.last_error = Some(attempt.error.clone());
            })
            .await;

        match committed {
            Ok(state) => self.ctx.publish(SyncUpdate::from_state(&state, None)),
            Err(e) => error!("Failed to record backoff of account {}: {}", label, e),
        }
    }

    async fn record_failure(&self, label: &str, err: &Error) {
        if matches!(err, Error::Cancelled(_)) {
            debug!("Sync of account {} cancelled", label);
            return;
        }
        if matches!(err, Error::NotFound(_)) && self.ctx.states.get(label).await.is_none() {
            debug!("Account {} was removed during sync", label);
            return;
        }

        if err.requires_reauth() {
            self.refresher.suspend(label, err).await;
            return;
        }

        let status = if err.is_transient() {
            let retry_at = Utc::now()
                + chrono::Duration::from_std(self.config.sync_interval())
                    .unwrap_or_else(|_| chrono::Duration::zero());
            SyncStatus::Backoff {
                attempt: self.config.retry.max_retries + 1,
                retry_at,
            }
        } else {
            SyncStatus::Failed
        };

        if err.is_fatal() {
            error!("Sync of account {} failed: {}", label, err);
        } else {
            warn!("Sync of account {} failed: {}", label, err);
        }

        let committed = self
            .ctx
            .states
            .update(label, |state| {
                state.status = status;
                state.last_error = Some(err.to_string());
            })
            .await;
        match committed {
            Ok(state) => self.ctx.publish(SyncUpdate::from_state(&state, None)),
            Err(e) => error!("Failed to record failure of account {}: {}", label, e),
        }
    }
}

fn cancelled() -> Error {
    Error::Cancelled("Sync cancelled by shutdown".to_string())
}

/// Background task of one account.
struct Worker {
    trigger: mpsc::Sender<()>,
    /// Set by full resync requests, consumed by the next run.
    full_pending: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Scheduler of per-account sync tasks.
pub struct SyncScheduler {
    runner: Arc<SyncRunner>,
    root: CancellationToken,
    workers: Mutex<HashMap<String, Worker>>,
    refresher_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    /// Create a scheduler and start the token refresher loop.
    ///
    /// Account tasks are started with [`SyncScheduler::add_account`].
    pub fn start(
        ctx: Arc<SyncContext>,
        refresher: Arc<TokenRefresher>,
        config: SchedulerConfig,
        root: CancellationToken,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent_syncs.max(1));
        let refresher_task = tokio::spawn(refresher.clone().run());
        info!(
            "Sync scheduler started ({} workers, every {:?})",
            config.max_concurrent_syncs.max(1),
            config.sync_interval()
        );

        Self {
            runner: Arc::new(SyncRunner {
                ctx,
                refresher,
                config,
                permits,
            }),
            root,
            workers: Mutex::new(HashMap::new()),
            refresher_task: Mutex::new(Some(refresher_task)),
        }
    }

    /// Start the background task of an account.
    ///
    /// The first run happens after `initial_delay`, or after one sync
    /// interval when `None`.
    ///
    /// # Errors
    /// - `AlreadyExists` if the account is already scheduled
    pub async fn add_account(&self, label: &str, initial_delay: Option<Duration>) -> Result<()> {
        if self.is_scheduled(label) {
            return Err(Error::AlreadyExists(format!(
                "Account {} is already scheduled",
                label
            )));
        }
        self.runner.ctx.states.ensure(label).await?;

        let (trigger, triggers) = mpsc::channel(1);
        let full_pending = Arc::new(AtomicBool::new(false));
        let cancel = self.root.child_token();
        let delay = initial_delay.unwrap_or_else(|| self.runner.config.sync_interval());
        let handle = tokio::spawn(worker_loop(
            self.runner.clone(),
            label.to_string(),
            triggers,
            full_pending.clone(),
            cancel.clone(),
            delay,
        ));

        let mut workers = self.worker_map();
        if workers.contains_key(label) {
            drop(workers);
            cancel.cancel();
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Duplicate task of account {} ended abnormally", label);
                }
            }
            return Err(Error::AlreadyExists(format!(
                "Account {} is already scheduled",
                label
            )));
        }
        workers.insert(
            label.to_string(),
            Worker {
                trigger,
                full_pending,
                cancel,
                handle,
            },
        );
        debug!("Scheduled account {}", label);
        Ok(())
    }

    /// Stop an account's task and drop its state and events.
    ///
    /// # Errors
    /// - `NotFound` if the account is not scheduled
    pub async fn remove_account(&self, label: &str) -> Result<()> {
        let worker = self
            .worker_map()
            .remove(label)
            .ok_or_else(|| not_scheduled(label))?;
        worker.cancel.cancel();
        if worker.handle.await.is_err() {
            warn!("Task of account {} ended abnormally", label);
        }

        let ctx = &self.runner.ctx;
        ctx.snapshot.remove(label);
        ctx.locks.remove(label);
        self.runner.refresher.forget(label);
        ctx.states.remove(label).await?;
        debug!("Unscheduled account {}", label);
        Ok(())
    }

    /// Whether the account has a running task.
    pub fn is_scheduled(&self, label: &str) -> bool {
        self.worker_map().contains_key(label)
    }

    /// Ask for a run as soon as possible without waiting for it.
    ///
    /// Triggers issued while one is already pending are coalesced.
    pub fn trigger(&self, label: &str) -> Result<()> {
        self.send_trigger(label, false)
    }

    /// Ask for a run that ignores the stored cursor.
    ///
    /// The request survives coalescing with a pending plain trigger.
    pub fn request_full_resync(&self, label: &str) -> Result<()> {
        self.send_trigger(label, true)
    }

    /// Run one sync of the account and wait for it.
    ///
    /// # Errors
    /// - `NotFound` if the account is not scheduled
    /// - the run's error after retries are exhausted
    pub async fn sync_now(&self, label: &str) -> Result<SyncReport> {
        let cancel = self
            .worker_map()
            .get(label)
            .map(|worker| worker.cancel.clone())
            .ok_or_else(|| not_scheduled(label))?;
        self.runner.run(label, false, &cancel).await
    }

    /// Events of the account overlapping `range`, sorted by start.
    pub fn events(&self, label: &str, range: &TimeRange) -> Vec<Event> {
        self.runner.ctx.snapshot.events(label, range)
    }

    /// Current state of an account.
    pub async fn status(&self, label: &str) -> Option<SyncState> {
        self.runner.ctx.states.get(label).await
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.runner.ctx.subscribe()
    }

    /// Lift a re-authentication suspension and sync right away.
    pub async fn resume(&self, label: &str) -> Result<()> {
        self.runner.refresher.resume(label);
        let state = self
            .runner
            .ctx
            .states
            .update(label, |state| {
                if state.status.needs_reauth() {
                    state.status = SyncStatus::Pending;
                }
            })
            .await?;
        self.runner.ctx.publish(SyncUpdate::from_state(&state, None));
        self.trigger(label)
    }

    /// Cancel every task and wait up to `grace` for them to finish.
    ///
    /// Tasks still running after the grace period are aborted. In-flight
    /// runs are interrupted before they commit, so the persisted state is
    /// the last committed one.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down sync scheduler");
        self.root.cancel();

        let mut handles: Vec<JoinHandle<()>> = self
            .worker_map()
            .drain()
            .map(|(_, worker)| worker.handle)
            .collect();
        if let Some(refresher) = self
            .refresher_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handles.push(refresher);
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!("Sync tasks did not stop within {:?}, aborting", grace);
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Sync scheduler stopped");
    }

    fn send_trigger(&self, label: &str, full: bool) -> Result<()> {
        let workers = self.worker_map();
        let worker = workers.get(label).ok_or_else(|| not_scheduled(label))?;

        if full {
            worker.full_pending.store(true, Ordering::SeqCst);
        }
        match worker.trigger.try_send(()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Sync of account {} already pending", label);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Cancelled(format!(
                "Task of account {} has stopped",
                label
            ))),
        }
    }

    fn worker_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_scheduled(label: &str) -> Error {
    Error::NotFound(format!("Account {} is not scheduled", label))
}

async fn worker_loop(
    runner: Arc<SyncRunner>,
    label: String,
    mut triggers: mpsc::Receiver<()>,
    full_pending: Arc<AtomicBool>,
    cancel: CancellationToken,
    initial_delay: Duration,
) {
    let mut ticker = interval_at(Instant::now() + initial_delay, runner.config.sync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
        }

        if runner.refresher.is_suspended(&label) {
            debug!("Skipping account {} until it is re-authenticated", label);
            continue;
        }
        let full = full_pending.swap(false, Ordering::SeqCst);
        // Failures are recorded in the account's state
        let _ = runner.run(&label, full, &cancel).await;
    }

    debug!("Task of account {} stopped", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresher::RefresherConfig;
    use crate::testing::{event, today, Fixture};
    use calvault_common::ProviderKind;
    use calvault_providers::{MemoryAdapter, ScriptedFailure};
    use chrono::Duration as ChronoDuration;
    use chrono::TimeZone;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            sync_interval_secs: 3600,
            retry: RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(5))
                .with_jitter(false),
            ..SchedulerConfig::default()
        }
    }

    fn scheduler(fixture: &Fixture, config: SchedulerConfig) -> SyncScheduler {
        let root = CancellationToken::new();
        let refresher = Arc::new(TokenRefresher::new(
            fixture.ctx.clone(),
            RefresherConfig::default(),
            root.child_token(),
        ));
        SyncScheduler::start(fixture.ctx.clone(), refresher, config, root)
    }

    fn day() -> TimeRange {
        TimeRange::new(today(), today() + ChronoDuration::days(1)).unwrap()
    }

    #[tokio::test]
    async fn test_sync_now_populates_snapshot() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud)
                .with_events(vec![event("standup", 9), event("lunch", 12)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();

        assert!(scheduler.events("Personal", &day()).is_empty());
        let report = scheduler.sync_now("Personal").await.unwrap();
        assert!(report.full);
        assert_eq!(report.event_count, 2);

        let events = scheduler.events("Personal", &day());
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["standup", "lunch"]);
        assert!(events.iter().all(|e| e.source_account == "Personal"));

        let state = scheduler.status("Personal").await.unwrap();
        assert_eq!(state.status, SyncStatus::Ok);
        assert!(state.cursor.is_some());
        assert_eq!(state.last_full_sync_at, state.last_synced_at);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_second_run_is_incremental() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("a", 9)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();

        scheduler.sync_now("Personal").await.unwrap();
        fixture
            .icloud
            .push_delta(vec![event("b", 10)], vec!["a".to_string()])
            .await;
        let report = scheduler.sync_now("Personal").await.unwrap();

        assert!(!report.full);
        let ids: Vec<_> = scheduler
            .events("Personal", &day())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["b"]);

        let cursors = fixture.icloud.cursors_seen().await;
        assert_eq!(cursors.len(), 2);
        assert!(cursors[0].is_none());
        assert!(cursors[1].is_some());

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_expired_cursor_triggers_full_resync() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("a", 9)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        scheduler.sync_now("Personal").await.unwrap();

        fixture
            .icloud
            .fail_next_fetch(ScriptedFailure::CursorExpired)
            .await;
        let report = scheduler.sync_now("Personal").await.unwrap();

        assert!(report.full);
        let cursors = fixture.icloud.cursors_seen().await;
        assert_eq!(cursors.len(), 3);
        assert!(cursors[1].is_some());
        assert!(cursors[2].is_none());

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_full_resync_survives_pending_trigger() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("a", 9)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        scheduler.sync_now("Personal").await.unwrap();
        let mut updates = scheduler.subscribe();

        // Both land before the task wakes, so they share one run
        scheduler.trigger("Personal").unwrap();
        scheduler.request_full_resync("Personal").unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, SyncStatus::Ok);

        let cursors = fixture.icloud.cursors_seen().await;
        assert_eq!(cursors.len(), 2);
        assert!(cursors[1].is_none());
        let state = scheduler.status("Personal").await.unwrap();
        assert_eq!(state.last_full_sync_at, state.last_synced_at);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_concurrent_add_schedules_once() {
        let fixture = Fixture::new().await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());

        let (first, second) = tokio::join!(
            scheduler.add_account("Personal", None),
            scheduler.add_account("Personal", None)
        );

        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            first.and(second),
            Err(Error::AlreadyExists(_))
        ));
        assert!(scheduler.is_scheduled("Personal"));
        scheduler.remove_account("Personal").await.unwrap();
        assert!(!scheduler.is_scheduled("Personal"));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_window_is_day_aligned() {
        let config = SchedulerConfig::default();
        let morning = Utc.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 3, 2, 22, 5, 0).unwrap();

        let window = config.window(morning).unwrap();
        assert_eq!(window, config.window(evening).unwrap());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        assert!(window.start <= morning - ChronoDuration::days(30));
        assert!(window.end >= evening + ChronoDuration::days(90));
    }

    #[tokio::test]
    async fn test_concurrent_runs_never_overlap() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud)
                .with_events(vec![event("a", 9)])
                .with_latency(Duration::from_millis(20)),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = Arc::new(scheduler(&fixture, fast_config()));
        scheduler.add_account("Personal", None).await.unwrap();

        let mut updates = scheduler.subscribe();
        let runs: Vec<_> = (0..5)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.sync_now("Personal").await })
            })
            .collect();
        for run in join_all(runs).await {
            run.unwrap().unwrap();
        }

        assert_eq!(fixture.icloud.fetch_calls(), 5);
        assert_eq!(fixture.icloud.max_in_flight(), 1);

        let mut synced = Vec::new();
        while let Ok(update) = updates.try_recv() {
            synced.push(update.last_synced_at.unwrap());
        }
        assert_eq!(synced.len(), 5);
        assert!(synced.windows(2).all(|pair| pair[0] <= pair[1]));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("home", 9)]),
            MemoryAdapter::new(ProviderKind::Google).with_events(vec![event("office", 10)]),
        )
        .await;
        fixture.add_password("Personal").await;
        fixture
            .add_oauth("Work", Utc::now() + ChronoDuration::hours(1))
            .await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        scheduler.add_account("Work", None).await.unwrap();

        fixture.google.fail_next_fetch(ScriptedFailure::Auth).await;
        fixture.google.fail_next_fetch(ScriptedFailure::Auth).await;
        assert!(scheduler.sync_now("Work").await.is_err());
        scheduler.sync_now("Personal").await.unwrap();

        assert_eq!(scheduler.events("Personal", &day()).len(), 1);
        assert!(scheduler.events("Work", &day()).is_empty());
        assert_eq!(
            scheduler.status("Personal").await.unwrap().status,
            SyncStatus::Ok
        );

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_succeed() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("a", 9)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        fixture.icloud.fail_next_fetch(ScriptedFailure::Network).await;
        fixture.icloud.fail_next_fetch(ScriptedFailure::Network).await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        let mut updates = scheduler.subscribe();

        scheduler.sync_now("Personal").await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(update) = updates.try_recv() {
            statuses.push(update.status);
        }
        assert!(matches!(statuses[0], SyncStatus::Backoff { attempt: 1, .. }));
        assert!(matches!(statuses[1], SyncStatus::Backoff { attempt: 2, .. }));
        assert_eq!(statuses[2], SyncStatus::Ok);
        assert_eq!(fixture.icloud.fetch_calls(), 3);

        let state = scheduler.status("Personal").await.unwrap();
        assert!(state.last_error.is_none());

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_backoff() {
        let fixture = Fixture::new().await;
        fixture.add_password("Personal").await;
        for _ in 0..3 {
            fixture.icloud.fail_next_fetch(ScriptedFailure::Network).await;
        }
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();

        let result = scheduler.sync_now("Personal").await;
        assert!(matches!(result, Err(Error::Network(_))));

        let state = scheduler.status("Personal").await.unwrap();
        assert!(matches!(state.status, SyncStatus::Backoff { attempt: 3, .. }));
        assert!(state.last_error.is_some());

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_auth_failure_needs_reauth_without_retry() {
        let fixture = Fixture::new().await;
        fixture.add_password("Personal").await;
        fixture.icloud.fail_next_fetch(ScriptedFailure::Auth).await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();

        let result = scheduler.sync_now("Personal").await;
        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(fixture.icloud.fetch_calls(), 1);
        assert_eq!(
            scheduler.status("Personal").await.unwrap().status,
            SyncStatus::NeedsReauth
        );

        // Parked until resumed
        let result = scheduler.sync_now("Personal").await;
        assert!(matches!(result, Err(Error::ReauthRequired(_))));
        assert_eq!(fixture.icloud.fetch_calls(), 1);

        scheduler.resume("Personal").await.unwrap();
        scheduler.sync_now("Personal").await.unwrap();
        assert_eq!(
            scheduler.status("Personal").await.unwrap().status,
            SyncStatus::Ok
        );

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud),
            MemoryAdapter::new(ProviderKind::Google).with_events(vec![event("office", 10)]),
        )
        .await;
        fixture
            .add_oauth("Work", Utc::now() + ChronoDuration::hours(1))
            .await;
        fixture.google.fail_next_fetch(ScriptedFailure::Auth).await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Work", None).await.unwrap();

        let report = scheduler.sync_now("Work").await.unwrap();

        assert_eq!(report.event_count, 1);
        assert_eq!(fixture.google.refresh_calls(), 1);
        assert_eq!(fixture.google.fetch_calls(), 2);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_stops_refreshing() {
        let fixture = Fixture::new().await;
        fixture
            .add_oauth("Work", Utc::now() - ChronoDuration::minutes(1))
            .await;
        fixture.google.fail_next_refresh(ScriptedFailure::Reauth).await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Work", None).await.unwrap();

        let result = scheduler.sync_now("Work").await;
        assert!(matches!(result, Err(Error::ReauthRequired(_))));
        assert_eq!(
            scheduler.status("Work").await.unwrap().status,
            SyncStatus::NeedsReauth
        );

        scheduler.trigger("Work").unwrap();
        let _ = scheduler.sync_now("Work").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fixture.google.refresh_calls(), 1);
        assert_eq!(fixture.google.fetch_calls(), 0);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_integrity_failure_is_not_retried() {
        let fixture = Fixture::new().await;
        fixture.add_password("Personal").await;
        let file = fixture
            .ctx
            .store
            .dir()
            .join(calvault_vault::EncryptedCredential::file_name("Personal"));
        let mut record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
        record["key_version"] = serde_json::json!(7);
        std::fs::write(&file, serde_json::to_vec(&record).unwrap()).unwrap();

        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        let result = scheduler.sync_now("Personal").await;

        assert!(matches!(result, Err(Error::Integrity(_))));
        assert_eq!(fixture.icloud.fetch_calls(), 0);
        let state = scheduler.status("Personal").await.unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert!(state.last_error.unwrap().contains("Integrity"));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_trigger_runs_in_background() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("a", 9)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        let mut updates = scheduler.subscribe();

        scheduler.trigger("Personal").unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(update.label, "Personal");
        assert_eq!(update.status, SyncStatus::Ok);
        assert_eq!(update.event_count, Some(1));
        assert!(matches!(scheduler.trigger("Unknown"), Err(Error::NotFound(_))));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_initial_delay_schedules_first_run() {
        let fixture = Fixture::new().await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        let mut updates = scheduler.subscribe();

        scheduler
            .add_account("Personal", Some(Duration::ZERO))
            .await
            .unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, SyncStatus::Ok);
        assert!(matches!(
            scheduler.add_account("Personal", None).await,
            Err(Error::AlreadyExists(_))
        ));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_remove_account_clears_everything() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_events(vec![event("a", 9)]),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler.add_account("Personal", None).await.unwrap();
        scheduler.sync_now("Personal").await.unwrap();

        scheduler.remove_account("Personal").await.unwrap();

        assert!(!scheduler.is_scheduled("Personal"));
        assert!(scheduler.events("Personal", &day()).is_empty());
        assert!(scheduler.status("Personal").await.is_none());
        assert!(matches!(
            scheduler.remove_account("Personal").await,
            Err(Error::NotFound(_))
        ));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_in_flight_sync() {
        let fixture = Fixture::with_adapters(
            MemoryAdapter::new(ProviderKind::ICloud).with_latency(Duration::from_secs(30)),
            MemoryAdapter::new(ProviderKind::Google),
        )
        .await;
        fixture.add_password("Personal").await;
        let scheduler = scheduler(&fixture, fast_config());
        scheduler
            .add_account("Personal", Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        scheduler.shutdown(Duration::from_secs(5)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        let state = scheduler.status("Personal").await.unwrap();
        assert_eq!(state.status, SyncStatus::Pending);
        assert!(state.last_synced_at.is_none());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"sync_interval_secs": 60, "retry": {"max_retries": 1}}"#)
                .unwrap();
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.max_concurrent_syncs, 4);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
    }
}
