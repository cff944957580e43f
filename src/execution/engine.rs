use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::order_monitor::{MonitorStats, OrderMonitor, OrderMonitorConfig};
use super::runner::{RunStatus, RunnerContext, RunnerSettings, StrategyRunState, StrategyRunner};
use super::{EngineEvent, TradeLedger};
use crate::api::{MarketDataSource, OrderGateway, ThrottledMarket};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::{OrderRecord, StrategyHandle};
use crate::strategy::StrategyDefinition;

struct RunnerEntry {
    strategy_id: String,
    state: watch::Receiver<StrategyRunState>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    placement_gate: Arc<AsyncMutex<()>>,
    /// Set when the task was aborted at shutdown before publishing a final state
    aborted_at: Option<DateTime<Utc>>,
}

impl RunnerEntry {
    fn snapshot(&self) -> StrategyRunState {
        let mut state = self.state.borrow().clone();
        if let Some(aborted_at) = self.aborted_at {
            if !state.status.is_finished() {
                state.status = RunStatus::Cancelled;
                state.finished_at = Some(aborted_at);
            }
        }
        state
    }
}

/// Runs many strategies concurrently and tracks their lifecycle
///
/// Each submitted strategy gets its own tokio task. The engine holds a
/// registry of runner handles, the shared trade ledger, and the order
/// monitor that reconciles open orders with the broker.
pub struct StrategyEngine {
    config: EngineConfig,
    ctx: RunnerContext,
    runners: Mutex<HashMap<StrategyHandle, RunnerEntry>>,
    monitor: OrderMonitor,
    shutting_down: AtomicBool,
}

impl StrategyEngine {
    /// Create the engine and start the order monitor
    ///
    /// Fails with `EngineError::Config` if the settings are unusable (zero
    /// intervals or timeouts). Must be called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        market: Arc<dyn MarketDataSource>,
        gateway: Arc<dyn OrderGateway>,
    ) -> Result<Self> {
        config.validate()?;

        let market: Arc<dyn MarketDataSource> = match config
            .max_data_requests_per_minute
            .and_then(NonZeroU32::new)
        {
            Some(limit) => {
                info!("Market data limited to {} requests/minute", limit);
                Arc::new(ThrottledMarket::new(market, limit))
            }
            None => market,
        };

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let ledger = Arc::new(TradeLedger::new());

        let monitor = OrderMonitor::new(
            gateway.clone(),
            ledger.clone(),
            events.clone(),
            OrderMonitorConfig {
                check_interval: config.monitor_interval(),
                query_timeout: config.call_timeout(),
            },
        );
        monitor.start();

        info!(
            poll_interval = ?config.poll_interval(),
            monitor_interval = ?config.monitor_interval(),
            call_timeout = ?config.call_timeout(),
            max_retries = config.max_retries,
            "Strategy engine started"
        );

        Ok(Self {
            config,
            ctx: RunnerContext {
                market,
                gateway,
                ledger,
                events,
            },
            runners: Mutex::new(HashMap::new()),
            monitor,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Validate a strategy and start running it
    pub fn submit(&self, definition: StrategyDefinition) -> Result<StrategyHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        definition.validate()?;
        self.prune_finished();

        let handle = StrategyHandle::new();
        let settings = RunnerSettings::resolve(&self.config, &definition);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let placement_gate = Arc::new(AsyncMutex::new(()));
        let strategy_id = definition.id.clone();

        info!(
            strategy_id = %strategy_id,
            handle = %handle,
            symbol = %definition.symbol,
            kind = definition.kind.name(),
            "Submitting strategy"
        );

        let (runner, state_rx) = StrategyRunner::new(
            handle,
            definition,
            self.ctx.clone(),
            settings,
            cancel_rx,
            placement_gate.clone(),
        );

        let mut runners = self.lock_runners();
        // Re-check under the lock so shutdown never misses a runner
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let task = tokio::spawn(runner.run());
        runners.insert(
            handle,
            RunnerEntry {
                strategy_id,
                state: state_rx,
                cancel: cancel_tx,
                task: Some(task),
                placement_gate,
                aborted_at: None,
            },
        );

        Ok(handle)
    }

    /// Request cooperative cancellation
    ///
    /// No effect on a runner that already finished.
    pub fn cancel(&self, handle: StrategyHandle) -> Result<()> {
        let runners = self.lock_runners();
        let entry = runners.get(&handle).ok_or(EngineError::NotFound(handle))?;

        if entry.snapshot().status.is_finished() {
            debug!(handle = %handle, "Cancel ignored, strategy already finished");
            return Ok(());
        }

        info!(strategy_id = %entry.strategy_id, handle = %handle, "Cancel requested");
        entry.cancel.send_replace(true);
        Ok(())
    }

    /// Latest published state of a runner
    pub fn status(&self, handle: StrategyHandle) -> Result<StrategyRunState> {
        self.lock_runners()
            .get(&handle)
            .map(RunnerEntry::snapshot)
            .ok_or(EngineError::NotFound(handle))
    }

    /// Wait until a runner reaches a terminal state
    pub async fn wait_for(&self, handle: StrategyHandle) -> Result<StrategyRunState> {
        let mut state = {
            let runners = self.lock_runners();
            runners
                .get(&handle)
                .ok_or(EngineError::NotFound(handle))?
                .state
                .clone()
        };

        // Err means the runner task is gone; its last state is final
        let _ = state.wait_for(|s| s.status.is_finished()).await;
        self.status(handle)
    }

    /// Subscribe to engine events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn ledger(&self) -> Arc<TradeLedger> {
        self.ctx.ledger.clone()
    }

    /// All ledger records in insertion order
    pub fn ledger_snapshot(&self) -> Vec<OrderRecord> {
        self.ctx.ledger.snapshot()
    }

    pub fn handles(&self) -> Vec<StrategyHandle> {
        self.lock_runners().keys().copied().collect()
    }

    /// Number of runners not yet in a terminal state
    pub fn active_count(&self) -> usize {
        self.lock_runners()
            .values()
            .filter(|entry| !entry.snapshot().status.is_finished())
            .count()
    }

    pub fn monitor_stats(&self) -> MonitorStats {
        self.monitor.stats()
    }

    /// Drop finished runners older than the retention window
    ///
    /// Returns how many were removed. Their handles report NotFound afterwards.
    pub fn prune_finished(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.finished_retention())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();

        let mut runners = self.lock_runners();
        let before = runners.len();
        runners.retain(|_, entry| {
            let state = entry.snapshot();
            match state.finished_at {
                Some(finished_at) if state.status.is_finished() => now - finished_at < retention,
                _ => true,
            }
        });

        let pruned = before - runners.len();
        if pruned > 0 {
            debug!("Pruned {} finished strategies", pruned);
        }
        pruned
    }

    /// Cancel every runner, wait out the grace period, then stop the monitor
    ///
    /// Runners that have not finished by the deadline are aborted, but only
    /// after any in-flight order placement has been recorded. Calling this
    /// twice is a no-op.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let grace = self.config.shutdown_grace();
        let pending: Vec<(StrategyHandle, JoinHandle<()>, Arc<AsyncMutex<()>>)> = {
            let mut runners = self.lock_runners();
            runners
                .iter_mut()
                .filter_map(|(handle, entry)| {
                    entry.cancel.send_replace(true);
                    entry
                        .task
                        .take()
                        .map(|task| (*handle, task, entry.placement_gate.clone()))
                })
                .collect()
        };

        info!(
            "Shutting down: cancelling {} strategies (grace {:?})",
            pending.len(),
            grace
        );

        let deadline = Instant::now() + grace;
        let mut aborted = Vec::new();
        for (handle, mut task, gate) in pending {
            if tokio::time::timeout_at(deadline, &mut task).await.is_ok() {
                continue;
            }

            // Let an in-flight placement finish recording first
            let _placement = gate.lock().await;
            task.abort();
            let _ = task.await;
            warn!(handle = %handle, "Strategy did not stop within grace period, aborted");
            aborted.push(handle);
        }

        if !aborted.is_empty() {
            let aborted_at = Utc::now();
            let mut runners = self.lock_runners();
            for handle in &aborted {
                if let Some(entry) = runners.get_mut(handle) {
                    entry.aborted_at = Some(aborted_at);
                }
            }
        }

        self.monitor.stop().await;
        info!(
            orders = self.ctx.ledger.len(),
            aborted = aborted.len(),
            "Strategy engine stopped"
        );
    }

    /// Grace period used by `shutdown`
    pub fn shutdown_grace(&self) -> Duration {
        self.config.shutdown_grace()
    }

    fn lock_runners(&self) -> MutexGuard<'_, HashMap<StrategyHandle, RunnerEntry>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
