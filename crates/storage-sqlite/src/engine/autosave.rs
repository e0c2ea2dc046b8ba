//! Debounced snapshot writes for the key-blob tier.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use localbase_core::errors::{Error, Result};

/// Produces a snapshot of the live engine and stores it. Returns the image size.
pub trait SnapshotWriter: Send + Sync {
    fn write_snapshot(&self) -> Result<usize>;
}

/// What caused a snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    /// The debounce timer fired.
    Debounced,
    /// Written right after a mutation because no timer could be armed.
    Immediate,
    Import,
    Close,
}

impl fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debounced => "debounced",
            Self::Immediate => "immediate",
            Self::Import => "import",
            Self::Close => "close",
        };
        f.write_str(label)
    }
}

/// Receives the outcome of every snapshot write attempt.
pub trait SnapshotObserver: Send + Sync {
    fn on_snapshot(&self, partition: &str, trigger: SnapshotTrigger, outcome: &Result<usize>);
}

/// Default observer: failures at `error`, successes at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSnapshotObserver;

impl SnapshotObserver for LoggingSnapshotObserver {
    fn on_snapshot(&self, partition: &str, trigger: SnapshotTrigger, outcome: &Result<usize>) {
        match outcome {
            Ok(bytes) => debug!(
                "[Localbase] Snapshot of '{}' saved ({} bytes, {})",
                partition, bytes, trigger
            ),
            Err(err) => error!(
                "[Localbase] Snapshot of '{}' failed ({}): {}",
                partition, trigger, err
            ),
        }
    }
}

/// Counters for snapshot writes performed on behalf of a database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutosaveStats {
    pub writes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// A single pending delayed job. Scheduling again aborts the previous one.
#[derive(Debug, Default)]
pub(crate) struct DebouncedTask {
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DebouncedTask {
    /// Runs `job` on the blocking pool once `delay` passes without another call.
    pub fn schedule<F>(&self, runtime: &Handle, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let current = Arc::clone(&self.generation);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::Acquire) != generation {
                return;
            }
            if let Err(err) = tokio::task::spawn_blocking(job).await {
                warn!("[Localbase] Debounced job did not complete: {}", err);
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.replace(task) {
                previous.abort();
            }
        }
    }

    /// Aborts the pending job, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let previous = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.take());
        match previous {
            Some(task) => {
                let was_pending = !task.is_finished();
                task.abort();
                was_pending
            }
            None => false,
        }
    }
}

struct AutosaveShared {
    partition: String,
    writer: Weak<dyn SnapshotWriter>,
    observer: Arc<dyn SnapshotObserver>,
    stats: Mutex<AutosaveStats>,
}

impl AutosaveShared {
    fn record(&self, trigger: SnapshotTrigger, outcome: &Result<usize>) {
        if let Ok(mut stats) = self.stats.lock() {
            match outcome {
                Ok(_) => stats.writes += 1,
                Err(err) => {
                    stats.failures += 1;
                    stats.last_error = Some(err.to_string());
                }
            }
        }
        self.observer.on_snapshot(&self.partition, trigger, outcome);
    }

    fn run(&self, trigger: SnapshotTrigger) -> Option<Result<usize>> {
        let writer = self.writer.upgrade()?;
        let outcome = writer.write_snapshot();
        if matches!(outcome, Err(Error::NotInitialized)) {
            // Closed while the timer was pending; close wrote its own snapshot.
            return None;
        }
        self.record(trigger, &outcome);
        Some(outcome)
    }
}

/// Debounces snapshot writes after mutations.
pub struct AutosaveScheduler {
    shared: Arc<AutosaveShared>,
    debounce: Duration,
    task: DebouncedTask,
    warned_no_runtime: AtomicBool,
}

impl fmt::Debug for AutosaveScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutosaveScheduler")
            .field("partition", &self.shared.partition)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl AutosaveScheduler {
    pub(crate) fn new(
        partition: impl Into<String>,
        debounce: Duration,
        writer: Weak<dyn SnapshotWriter>,
        observer: Arc<dyn SnapshotObserver>,
    ) -> Self {
        Self {
            shared: Arc::new(AutosaveShared {
                partition: partition.into(),
                writer,
                observer,
                stats: Mutex::new(AutosaveStats::default()),
            }),
            debounce,
            task: DebouncedTask::default(),
            warned_no_runtime: AtomicBool::new(false),
        }
    }

    /// Called after every successful mutation. Must not hold the engine lock.
    pub fn notify(&self) {
        match Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(&self.shared);
                self.task.schedule(&runtime, self.debounce, move || {
                    shared.run(SnapshotTrigger::Debounced);
                });
            }
            Err(_) => {
                if !self.warned_no_runtime.swap(true, Ordering::AcqRel) {
                    debug!(
                        "[Localbase] No async runtime available; '{}' snapshots are written after each mutation",
                        self.shared.partition
                    );
                }
                self.shared.run(SnapshotTrigger::Immediate);
            }
        }
    }

    /// Drops the pending debounced write.
    pub fn cancel(&self) -> bool {
        let cancelled = self.task.cancel();
        if cancelled {
            debug!(
                "[Localbase] Cancelled pending snapshot for '{}'",
                self.shared.partition
            );
        }
        cancelled
    }

    /// Writes a snapshot now, bypassing the timer.
    pub fn flush_now(&self, trigger: SnapshotTrigger) -> Result<usize> {
        self.task.cancel();
        self.shared
            .run(trigger)
            .unwrap_or(Err(Error::NotInitialized))
    }

    /// Records an outcome produced outside the scheduler (the close path).
    pub(crate) fn report(&self, trigger: SnapshotTrigger, outcome: &Result<usize>) {
        self.shared.record(trigger, outcome);
    }

    pub fn stats(&self) -> AutosaveStats {
        self.shared
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWriter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl SnapshotWriter for CountingWriter {
        fn write_snapshot(&self) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::persistence("disk full"));
            }
            Ok(128)
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        outcomes: Mutex<Vec<(SnapshotTrigger, bool)>>,
    }

    impl SnapshotObserver for RecordingObserver {
        fn on_snapshot(&self, _partition: &str, trigger: SnapshotTrigger, outcome: &Result<usize>) {
            self.outcomes
                .lock()
                .expect("observer lock")
                .push((trigger, outcome.is_ok()));
        }
    }

    fn scheduler(
        fail: bool,
        debounce: Duration,
    ) -> (AutosaveScheduler, Arc<CountingWriter>, Arc<RecordingObserver>) {
        let writer = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail,
        });
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn SnapshotWriter> = Arc::downgrade(&writer) as Weak<dyn SnapshotWriter>;
        let scheduler = AutosaveScheduler::new(
            "test",
            debounce,
            weak,
            Arc::clone(&observer) as Arc<dyn SnapshotObserver>,
        );
        (scheduler, writer, observer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bursts_inside_the_window_produce_one_write() {
        let (scheduler, writer, _observer) = scheduler(false, Duration::from_millis(100));
        for _ in 0..10 {
            scheduler.notify();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().writes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_drops_the_pending_write() {
        let (scheduler, writer, _observer) = scheduler(false, Duration::from_millis(100));
        scheduler.notify();
        assert!(scheduler.cancel());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_go_to_the_observer_and_stats() {
        let (scheduler, _writer, observer) = scheduler(true, Duration::from_millis(20));
        scheduler.notify();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.failures, 1);
        assert!(stats
            .last_error
            .as_deref()
            .is_some_and(|msg| msg.contains("disk full")));
        let outcomes = observer.outcomes.lock().expect("observer lock").clone();
        assert_eq!(outcomes, vec![(SnapshotTrigger::Debounced, false)]);
    }

    #[test]
    fn without_a_runtime_each_mutation_writes_immediately() {
        let (scheduler, writer, observer) = scheduler(false, Duration::from_millis(500));
        scheduler.notify();
        scheduler.notify();
        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
        let outcomes = observer.outcomes.lock().expect("observer lock").clone();
        assert!(outcomes
            .iter()
            .all(|(trigger, ok)| *trigger == SnapshotTrigger::Immediate && *ok));
    }

    #[test]
    fn flush_now_returns_the_outcome() {
        let (scheduler, _writer, _observer) = scheduler(true, Duration::from_millis(500));
        let err = scheduler
            .flush_now(SnapshotTrigger::Import)
            .expect_err("writer fails");
        assert!(matches!(err, Error::Persistence(_)));
    }
}
