//! Multi-rate simulation scheduler.
//!
//! One Tokio task per module fires on that module's period. Each firing
//! produces a batch, merges it into the snapshot table under a single write
//! lock, hands it to the history store on a detached task and then fans it
//! out to subscribers in registration order.

use crate::config::{AppConfig, ModuleSpec};
use crate::history::{HistoryError, HistoryStats, HistoryStore};
use crate::module::{GeneratorError, ModuleRunner};
use crate::telemetry::{now_ms, Reading, Snapshot, SnapshotEntry};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

pub type BatchSubscriber = Arc<dyn Fn(&[Reading]) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("simulator must be started from within a Tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("history storage is not enabled")]
    HistoryDisabled,
    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorStats {
    pub ticks_completed: u64,
    pub generator_faults: u64,
    pub subscriber_faults: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    ticks_completed: AtomicU64,
    generator_faults: AtomicU64,
    subscriber_faults: AtomicU64,
    persistence_failures: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> SimulatorStats {
        SimulatorStats {
            ticks_completed: self.ticks_completed.load(Ordering::Relaxed),
            generator_faults: self.generator_faults.load(Ordering::Relaxed),
            subscriber_faults: self.subscriber_faults.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the simulator handle and its module tasks.
struct Shared {
    table: RwLock<HashMap<String, SnapshotEntry>>,
    subscribers: RwLock<Vec<BatchSubscriber>>,
    history: Option<Arc<dyn HistoryStore>>,
    stats: Arc<StatCounters>,
    /// Woken after every snapshot merge.
    merged: Notify,
}

/// Gate for one start/stop cycle. Ticks hold the read side while running;
/// `stop` takes the write side, so it returns only after in-flight ticks finish.
struct RunGate {
    active: RwLock<bool>,
}

struct ActiveRun {
    gate: Arc<RunGate>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Simulator {
    modules: Vec<(ModuleSpec, Duration)>,
    shared: Arc<Shared>,
    run: Mutex<Option<ActiveRun>>,
}

impl Simulator {
    pub fn new(config: &AppConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_history(config: &AppConfig, store: Arc<dyn HistoryStore>) -> Self {
        info!("historical data storage enabled");
        Self::build(config, Some(store))
    }

    fn build(config: &AppConfig, history: Option<Arc<dyn HistoryStore>>) -> Self {
        let modules = config
            .modules
            .iter()
            .map(|module| (module.clone(), config.module_period(module)))
            .collect();

        Self {
            modules,
            shared: Arc::new(Shared {
                table: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                history,
                stats: Arc::new(StatCounters::default()),
                merged: Notify::new(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Start one timer per module, stopping any previous run first.
    pub fn start(&self) -> Result<(), SimulatorError> {
        let handle = Handle::try_current().map_err(|_| SimulatorError::NoRuntime)?;
        self.stop();

        let gate = Arc::new(RunGate {
            active: RwLock::new(true),
        });
        // Build every runner before spawning so a bad module leaves no timers behind.
        let runners = self
            .modules
            .iter()
            .map(|(spec, period)| ModuleRunner::new(spec).map(|runner| (runner, *period)))
            .collect::<Result<Vec<_>, _>>()?;

        let tasks: Vec<JoinHandle<()>> = runners
            .into_iter()
            .map(|(runner, period)| {
                debug!(
                    module_id = runner.module_id(),
                    period_ms = period.as_millis() as u64,
                    "starting module timer"
                );
                let shared = Arc::clone(&self.shared);
                handle.spawn(run_module(runner, period, shared, Arc::clone(&gate)))
            })
            .collect();

        info!(modules = tasks.len(), "simulator started");
        *self.run.lock() = Some(ActiveRun { gate, tasks });
        Ok(())
    }

    /// Cancel every module timer. Safe to call repeatedly, including when never started.
    pub fn stop(&self) {
        let Some(run) = self.run.lock().take() else {
            return;
        };

        *run.gate.active.write() = false;
        for task in &run.tasks {
            task.abort();
        }
        info!(modules = run.tasks.len(), "simulator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.run.lock().is_some()
    }

    /// Register a batch subscriber. Callbacks run on the tick path and must not call `stop`.
    pub fn on_batch<F>(&self, callback: F)
    where
        F: Fn(&[Reading]) + Send + Sync + 'static,
    {
        self.shared.subscribers.write().push(Arc::new(callback));
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    /// Owned copy of the last known value per sensor.
    pub fn snapshot(&self) -> Snapshot {
        self.shared
            .table
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    /// True once every configured module has at least one reading in the snapshot.
    pub fn is_populated(&self) -> bool {
        let table = self.shared.table.read();
        self.modules
            .iter()
            .all(|(spec, _)| table.values().any(|entry| entry.module_id == spec.id))
    }

    /// Wait until every module has ticked at least once. Returns false on timeout.
    pub async fn wait_until_populated(&self, timeout: Duration) -> bool {
        let populated = async {
            loop {
                let merged = self.shared.merged.notified();
                tokio::pin!(merged);
                merged.as_mut().enable();
                if self.is_populated() {
                    return;
                }
                merged.await;
            }
        };
        time::timeout(timeout, populated).await.is_ok()
    }

    pub fn longest_period(&self) -> Duration {
        self.modules
            .iter()
            .map(|(_, period)| *period)
            .max()
            .unwrap_or_default()
    }

    pub fn module_periods(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        self.modules.iter().map(|(spec, period)| (spec.id, *period))
    }

    pub fn stats(&self) -> SimulatorStats {
        self.shared.stats.snapshot()
    }

    pub fn history(&self) -> Option<Arc<dyn HistoryStore>> {
        self.shared.history.clone()
    }

    /// Drop history older than `days` days.
    pub async fn cleanup_history(&self, days: u64) -> Result<u64, SimulatorError> {
        let store = self.history().ok_or(SimulatorError::HistoryDisabled)?;
        let cutoff = now_ms().saturating_sub(days.saturating_mul(MS_PER_DAY));
        Ok(store.cleanup(cutoff).await?)
    }

    pub async fn history_stats(&self) -> Result<HistoryStats, SimulatorError> {
        let store = self.history().ok_or(SimulatorError::HistoryDisabled)?;
        Ok(store.stats().await?)
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_module(runner: ModuleRunner, period: Duration, shared: Arc<Shared>, gate: Arc<RunGate>) {
    // First firing is one full period after start.
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let still_active = {
            let active = gate.active.read();
            if *active {
                shared.tick(&runner);
            }
            *active
        };
        if !still_active {
            break;
        }
    }
}

impl Shared {
    fn tick(&self, runner: &ModuleRunner) {
        let module_id = runner.module_id();
        let outcome = catch_unwind(AssertUnwindSafe(|| runner.tick()))
            .unwrap_or(Err(GeneratorError::Panicked { module_id }));

        let batch = match outcome {
            Ok(batch) => batch,
            Err(e) => {
                self.stats.generator_faults.fetch_add(1, Ordering::Relaxed);
                warn!(module_id, error = %e, "generator fault, skipping tick");
                return;
            }
        };

        self.merge(&batch);
        self.persist(&batch);
        self.broadcast(&batch);
        self.stats.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn merge(&self, batch: &[Reading]) {
        {
            let mut table = self.table.write();
            for reading in batch {
                table.insert(reading.name.clone(), SnapshotEntry::from(reading));
            }
        }
        self.merged.notify_waiters();
    }

    fn persist(&self, batch: &[Reading]) {
        let Some(store) = self.history.clone() else {
            return;
        };

        let readings = batch.to_vec();
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            if let Err(e) = store.save_batch(&readings).await {
                stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, count = readings.len(), "failed to save readings to history");
            }
        });
    }

    fn broadcast(&self, batch: &[Reading]) {
        // Clone the list so a subscriber registering mid-fan-out cannot deadlock.
        let subscribers: Vec<BatchSubscriber> = self.subscribers.read().clone();

        for (index, subscriber) in subscribers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(batch))).is_err() {
                self.stats.subscriber_faults.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = index, "batch subscriber panicked");
            }
        }
    }
}
