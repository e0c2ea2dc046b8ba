//! Sync coordinator: pushes pending local changes, pulls remote ones, and
//! purges expired cache rows, on a timer, on network transitions and on demand.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use localbase_core::config::SyncConfig;
use localbase_core::errors::Error;
use localbase_core::sync::{
    next_cycle_delay, ManualSyncReport, SyncCycleResult, SyncCycleStatus, SyncCycleTrigger,
    SyncEngineStatus, SyncState, SYNC_INTERVAL_JITTER_SECS, SYNC_PUSH_BATCH_LIMIT,
};
use localbase_storage_sqlite::SyncStateRepository;

use crate::error::{Result, SyncError};
use crate::ports::{CredentialProvider, SyncTransport};

/// Pull cursor used before the first successful pull.
const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00+00:00";

#[derive(Debug)]
struct CoordinatorStatus {
    state: SyncState,
    consecutive_failures: i32,
    last_error: Option<String>,
    last_cycle: Option<SyncCycleResult>,
    initial_done: bool,
}

struct CoordinatorInner {
    repo: SyncStateRepository,
    transport: Arc<dyn SyncTransport>,
    credentials: Arc<dyn CredentialProvider>,
    config: SyncConfig,
    status: Mutex<CoordinatorStatus>,
    online: watch::Sender<bool>,
    cycle_lock: TokioMutex<()>,
    background_task: TokioMutex<Option<JoinHandle<()>>>,
}

/// Tracks progress during a sync cycle.
struct CycleContext {
    cycle_id: String,
    trigger: SyncCycleTrigger,
    started_at: Instant,
    pushed_tables: Vec<String>,
    failed_tables: Vec<String>,
    pushed_records: usize,
    pulled_records: usize,
    errors: Vec<String>,
}

impl CycleContext {
    fn new(trigger: SyncCycleTrigger) -> Self {
        Self {
            cycle_id: Uuid::now_v7().to_string(),
            trigger,
            started_at: Instant::now(),
            pushed_tables: Vec::new(),
            failed_tables: Vec::new(),
            pushed_records: 0,
            pulled_records: 0,
            errors: Vec::new(),
        }
    }

    fn finish(
        self,
        status: SyncCycleStatus,
        purged_rows: usize,
        message: Option<String>,
    ) -> SyncCycleResult {
        let message = message.or_else(|| {
            if self.errors.is_empty() {
                None
            } else {
                Some(self.errors.join("; "))
            }
        });
        SyncCycleResult {
            cycle_id: self.cycle_id,
            status,
            trigger: self.trigger,
            pushed_tables: self.pushed_tables,
            failed_tables: self.failed_tables,
            pushed_records: self.pushed_records,
            pulled_records: self.pulled_records,
            purged_rows,
            duration_ms: self.started_at.elapsed().as_millis() as i64,
            message,
        }
    }
}

/// Handle to the sync coordinator. Clones share the same state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        repo: SyncStateRepository,
        transport: Arc<dyn SyncTransport>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(CoordinatorInner {
                repo,
                transport,
                credentials,
                config,
                status: Mutex::new(CoordinatorStatus {
                    state: SyncState::Idle,
                    consecutive_failures: 0,
                    last_error: None,
                    last_cycle: None,
                    initial_done: false,
                }),
                online,
                cycle_lock: TokioMutex::new(()),
                background_task: TokioMutex::new(None),
            }),
        }
    }

    /// Spawns the background loop: an initial cycle right away, then one per
    /// interval, plus one after every offline-to-online transition.
    /// Calling it while the loop runs is a no-op.
    pub async fn start(&self) {
        let mut guard = self.inner.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
            guard.take();
        }

        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            inner.run_loop().await;
        }));
        info!(
            "[Sync] Background sync started (interval {:?})",
            self.inner.config.interval
        );
    }

    /// Aborts the background loop. An in-flight cycle is dropped at its next
    /// await point; storage work already handed to a blocking thread completes.
    pub async fn stop(&self) {
        let mut guard = self.inner.background_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            info!("[Sync] Background sync stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .background_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Feeds a network transition. Going offline suspends sync and cancels
    /// in-flight requests; coming back online lets the loop run a fresh cycle.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        let mut status = self.inner.lock_status();
        if online {
            if status.state == SyncState::Suspended {
                status.state = SyncState::Idle;
            }
            info!("[Sync] Network online; resuming sync");
        } else {
            status.state = SyncState::Suspended;
            info!("[Sync] Network offline; sync suspended");
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    /// Runs one push-then-pull cycle inline. Fails without touching the
    /// network while suspended.
    pub async fn sync_now(&self) -> ManualSyncReport {
        if !self.inner.is_online() {
            return ManualSyncReport {
                success: false,
                message: "Sync is suspended while the network is offline".to_string(),
                result: None,
            };
        }

        let result = self.inner.run_cycle(SyncCycleTrigger::Manual).await;
        let message = match (&result.status, &result.message) {
            (SyncCycleStatus::Ok, _) => format!(
                "Sync completed: pushed {} records, pulled {} records",
                result.pushed_records, result.pulled_records
            ),
            (_, Some(message)) => message.clone(),
            (status, None) => format!("Sync finished with status {:?}", status),
        };
        ManualSyncReport {
            success: result.status.is_success(),
            message,
            result: Some(result),
        }
    }

    /// Runs one cycle for `trigger`, waiting for any cycle already in progress.
    pub async fn run_cycle(&self, trigger: SyncCycleTrigger) -> SyncCycleResult {
        self.inner.run_cycle(trigger).await
    }

    pub fn status(&self) -> SyncEngineStatus {
        let status = self.inner.lock_status();
        SyncEngineStatus {
            state: status.state,
            online: self.inner.is_online(),
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
            last_cycle: status.last_cycle.clone(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("api_url", &self.inner.config.api_url)
            .field("status", &self.status())
            .finish()
    }
}

impl CoordinatorInner {
    fn lock_status(&self) -> MutexGuard<'_, CoordinatorStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut online_rx = self.online.subscribe();
        let mut trigger = SyncCycleTrigger::Startup;
        loop {
            if !*online_rx.borrow_and_update() {
                let resumed = online_rx.wait_for(|online| *online).await.is_ok();
                if !resumed {
                    break;
                }
                trigger = SyncCycleTrigger::NetworkOnline;
            }

            let result = self.run_cycle(trigger).await;
            debug!(
                "[Sync] Cycle {} complete status={:?} pushed={} pulled={} purged={}",
                result.cycle_id,
                result.status,
                result.pushed_records,
                result.pulled_records,
                result.purged_rows
            );

            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    trigger = SyncCycleTrigger::Periodic;
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    trigger = SyncCycleTrigger::NetworkOnline;
                }
            }
        }
    }

    /// [`next_cycle_delay`] for the current failure count, plus jitter.
    fn next_delay(&self) -> Duration {
        let failures = self.lock_status().consecutive_failures;
        let base = next_cycle_delay(failures, self.config.interval);
        let jitter_bound = SYNC_INTERVAL_JITTER_SECS.saturating_mul(1000);
        let jitter_ms = if jitter_bound > 0 {
            rand::thread_rng().gen_range(0..jitter_bound)
        } else {
            0
        };
        base + Duration::from_millis(jitter_ms)
    }

    async fn run_cycle(&self, trigger: SyncCycleTrigger) -> SyncCycleResult {
        let _cycle = self.cycle_lock.lock().await;
        let mut ctx = CycleContext::new(trigger);

        if !self.is_online() {
            let result = ctx.finish(
                SyncCycleStatus::Suspended,
                0,
                Some("Network offline".to_string()),
            );
            self.record_outcome(&result);
            return result;
        }

        let initial = {
            let mut status = self.lock_status();
            let initial = !status.initial_done && trigger != SyncCycleTrigger::Manual;
            status.state = if initial {
                SyncState::InitialSync
            } else {
                SyncState::Syncing
            };
            initial
        };
        info!(
            "[Sync] Cycle {} started (trigger={:?}, initial={})",
            ctx.cycle_id, trigger, initial
        );

        let exchange = self.exchange(&mut ctx, initial).await;

        let caches = self.config.cache_tables.clone();
        let purged = match self
            .with_repo(move |repo| repo.purge_expired(&caches))
            .await
        {
            Ok(purged) => purged,
            Err(err) => {
                warn!("[Sync] Cache purge failed: {}", err);
                ctx.errors.push(format!("Cache purge failed: {}", err));
                0
            }
        };

        let result = match exchange {
            Ok(()) if ctx.failed_tables.is_empty() && ctx.errors.is_empty() => {
                ctx.finish(SyncCycleStatus::Ok, purged, None)
            }
            Ok(()) => ctx.finish(SyncCycleStatus::Partial, purged, None),
            Err(SyncError::Cancelled) => ctx.finish(
                SyncCycleStatus::Suspended,
                purged,
                Some("Network went offline during the cycle".to_string()),
            ),
            Err(err) if err.is_auth() => {
                warn!("[Sync] Authentication failed; cycle aborted: {}", err);
                let message = Error::from(err).to_string();
                ctx.finish(SyncCycleStatus::AuthError, purged, Some(message))
            }
            Err(SyncError::Storage(err)) => {
                warn!("[Sync] Local storage failed during sync: {}", err);
                ctx.finish(SyncCycleStatus::StorageError, purged, Some(err.to_string()))
            }
            Err(err) => {
                warn!("[Sync] Cycle failed: {}", err);
                let message = err.to_string();
                ctx.finish(SyncCycleStatus::Partial, purged, Some(message))
            }
        };

        self.record_outcome(&result);
        info!(
            "[Sync] Cycle {} finished status={:?} in {}ms",
            result.cycle_id, result.status, result.duration_ms
        );
        result
    }

    /// Push and pull in the order the cycle calls for. Returns early on an
    /// auth failure, on cancellation, and on local storage errors.
    async fn exchange(&self, ctx: &mut CycleContext, initial: bool) -> Result<()> {
        let token = match self.credentials.access_token().await? {
            Some(token) => token,
            None => return Err(SyncError::auth("No access token available")),
        };

        if initial {
            self.pull(ctx, &token).await?;
            self.push(ctx, &token).await
        } else {
            self.push(ctx, &token).await?;
            self.pull(ctx, &token).await
        }
    }

    async fn push(&self, ctx: &mut CycleContext, token: &str) -> Result<()> {
        let batches = self
            .with_repo(|repo| repo.collect_pending_batches(SYNC_PUSH_BATCH_LIMIT))
            .await?;
        if batches.is_empty() {
            debug!("[Sync] Nothing to push");
        }

        for batch in batches {
            let table = batch.table_name.clone();
            let count = batch.records.len();
            let pushed = self
                .guarded(self.transport.push_table(token, &table, &batch.records))
                .await;

            let pushed = pushed.and_then(|response| match response.accepted {
                Some(accepted) if accepted < count => Err(SyncError::PartiallyAccepted {
                    accepted,
                    sent: count,
                }),
                _ => Ok(response),
            });

            match pushed {
                Ok(_) => {
                    self.with_repo(move |repo| repo.acknowledge_push(&batch))
                        .await?;
                    debug!("[Sync] Pushed {} records to '{}'", count, table);
                    ctx.pushed_records += count;
                    ctx.pushed_tables.push(table);
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    let message = err.to_string();
                    warn!("[Sync] Push failed for '{}': {}", table, message);
                    let failed = table.clone();
                    let stored = message.clone();
                    self.with_repo(move |repo| repo.record_push_error(&failed, &stored))
                        .await?;
                    ctx.failed_tables.push(table.clone());
                    if err.is_auth() {
                        return Err(err);
                    }
                    ctx.errors.push(format!("{}: {}", table, message));
                }
            }
        }
        Ok(())
    }

    async fn pull(&self, ctx: &mut CycleContext, token: &str) -> Result<()> {
        let since = self
            .with_repo(|repo| repo.last_pull_at())
            .await?
            .unwrap_or_else(|| EPOCH_TIMESTAMP.to_string());
        let requested_at = Utc::now().to_rfc3339();

        let changes = match self.guarded(self.transport.pull_since(token, &since)).await {
            Ok(changes) => changes,
            Err(err) if err.is_auth() || matches!(err, SyncError::Cancelled) => {
                return Err(err)
            }
            Err(err) => {
                warn!("[Sync] Pull failed: {}", err);
                ctx.errors.push(format!("Pull failed: {}", err));
                return Ok(());
            }
        };

        let policy = self.config.conflict_policy;
        let report = self
            .with_repo(move |repo| repo.apply_remote_changes(&changes, policy))
            .await?;
        for (table, reason) in &report.rejected_tables {
            ctx.errors.push(format!("Pulled rows for '{}' rejected: {}", table, reason));
        }
        ctx.pulled_records += report.applied_rows;

        // A rejected table rolled back whole; its rows must come again.
        if report.rejected_tables.is_empty() {
            self.with_repo(move |repo| repo.set_last_pull_at(&requested_at))
                .await?;
        } else {
            warn!(
                "[Sync] Keeping pull cursor at {}; {} table(s) rejected",
                since,
                report.rejected_tables.len()
            );
        }
        debug!(
            "[Sync] Pulled {} rows ({} kept local)",
            report.applied_rows, report.skipped_rows
        );
        Ok(())
    }

    fn record_outcome(&self, result: &SyncCycleResult) {
        let mut status = self.lock_status();
        status.state = if self.is_online() {
            SyncState::Idle
        } else {
            SyncState::Suspended
        };
        match result.status {
            SyncCycleStatus::Ok => {
                status.consecutive_failures = 0;
                status.last_error = None;
            }
            SyncCycleStatus::Suspended => {}
            _ => {
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.last_error = result.message.clone();
            }
        }
        if matches!(
            result.status,
            SyncCycleStatus::Ok | SyncCycleStatus::Partial
        ) {
            status.initial_done = true;
        }
        status.last_cycle = Some(result.clone());
    }

    /// Applies the request timeout and cancels the request if the network
    /// goes offline before it completes.
    async fn guarded<T>(&self, request: impl Future<Output = Result<T>>) -> Result<T> {
        let mut online_rx = self.online.subscribe();
        if !*online_rx.borrow_and_update() {
            return Err(SyncError::Cancelled);
        }
        let timeout = self.config.request_timeout;
        tokio::select! {
            result = tokio::time::timeout(timeout, request) => {
                result.map_err(|_| SyncError::Timeout(timeout))?
            }
            _ = wait_offline(&mut online_rx) => Err(SyncError::Cancelled),
        }
    }

    /// Runs repository work on the blocking pool.
    async fn with_repo<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SyncStateRepository) -> localbase_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .map_err(|e| {
                SyncError::Storage(Error::internal(format!("Sync storage task failed: {}", e)))
            })?
            .map_err(SyncError::from)
    }
}

async fn wait_offline(online_rx: &mut watch::Receiver<bool>) {
    let _ = online_rx.wait_for(|online| !*online).await;
}
