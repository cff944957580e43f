//! Order status reconciliation
//!
//! Periodically queries the broker for every non-terminal ledger record and
//! applies status changes. A record that reaches a terminal status is frozen
//! and dropped from later sweeps. Query failures are counted and logged; the
//! record is simply checked again on the next sweep.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{EngineEvent, StatusUpdate, TradeLedger};
use crate::api::OrderGateway;
use crate::models::{OrderRecord, OrderStatus};

/// Configuration for the order monitor
#[derive(Debug, Clone)]
pub struct OrderMonitorConfig {
    /// Interval between sweeps
    pub check_interval: Duration,
    /// Timeout for each status query
    pub query_timeout: Duration,
}

/// Order monitoring statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    pub sweeps: u64,
    pub orders_checked: u64,
    pub transitions: u64,
    pub orders_terminal: u64,
    pub query_errors: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

/// Result of a single sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub transitions: usize,
    pub errors: usize,
}

/// What checking one record did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Unchanged,
    Transitioned(OrderStatus),
    /// Query or ledger update failed; retried next sweep
    Failed,
}

#[derive(Clone)]
struct Shared {
    gateway: Arc<dyn OrderGateway>,
    ledger: Arc<TradeLedger>,
    events: broadcast::Sender<EngineEvent>,
    config: OrderMonitorConfig,
    stats: Arc<Mutex<MonitorStats>>,
}

/// Background reconciler for open orders
pub struct OrderMonitor {
    shared: Shared,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OrderMonitor {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        ledger: Arc<TradeLedger>,
        events: broadcast::Sender<EngineEvent>,
        config: OrderMonitorConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Shared {
                gateway,
                ledger,
                events,
                config,
                stats: Arc::new(Mutex::new(MonitorStats::default())),
            },
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Start the sweep loop; a second call is a no-op
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!("Order monitor already running");
            return;
        }

        info!(
            "Starting order monitor (interval: {:?}, query timeout: {:?})",
            self.shared.config.check_interval, self.shared.config.query_timeout
        );

        let shared = self.shared.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            let period = shared.config.check_interval;
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        Self::run_sweep(&shared).await;
                    }
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
            }

            info!("Order monitor stopped");
        }));
    }

    /// Run one sweep immediately
    pub async fn sweep(&self) -> SweepReport {
        Self::run_sweep(&self.shared).await
    }

    /// Stop the loop and wait for an in-progress sweep to finish
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Order monitor task ended abnormally: {}", e);
            }
        }
    }

    pub fn stats(&self) -> MonitorStats {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_sweep(shared: &Shared) -> SweepReport {
        let open = shared.ledger.open_records();
        let mut report = SweepReport::default();
        let mut terminal = 0u64;

        if !open.is_empty() {
            debug!("Reconciling {} open orders", open.len());
        }

        for record in open {
            report.checked += 1;
            match Self::check_order(shared, &record).await {
                CheckOutcome::Transitioned(to) => {
                    report.transitions += 1;
                    if to.is_terminal() {
                        terminal += 1;
                    }
                }
                CheckOutcome::Unchanged => {}
                CheckOutcome::Failed => report.errors += 1,
            }
        }

        let mut stats = shared.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.sweeps += 1;
        stats.orders_checked += report.checked as u64;
        stats.transitions += report.transitions as u64;
        stats.orders_terminal += terminal;
        stats.query_errors += report.errors as u64;
        stats.last_sweep = Some(Utc::now());

        report
    }

    /// Query and apply one record's status
    async fn check_order(shared: &Shared, record: &OrderRecord) -> CheckOutcome {
        let query = shared.gateway.query_status(&record.handle);
        let status = match tokio::time::timeout(shared.config.query_timeout, query).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(
                    order = %record.handle,
                    strategy_id = %record.strategy_id,
                    "Status query failed: {}",
                    e
                );
                return CheckOutcome::Failed;
            }
            Err(_) => {
                warn!(
                    order = %record.handle,
                    strategy_id = %record.strategy_id,
                    "Status query timed out after {:?}",
                    shared.config.query_timeout
                );
                return CheckOutcome::Failed;
            }
        };

        match shared.ledger.update_status(&record.handle, status, Utc::now()) {
            Ok(StatusUpdate::Transitioned { from, to }) => {
                info!(
                    order = %record.handle,
                    strategy_id = %record.strategy_id,
                    "Order {:?} → {:?}",
                    from,
                    to
                );
                let _ = shared.events.send(EngineEvent::OrderStatusChanged {
                    order: record.handle.clone(),
                    strategy_id: record.strategy_id.clone(),
                    from,
                    to,
                });
                CheckOutcome::Transitioned(to)
            }
            Ok(StatusUpdate::Unchanged) => CheckOutcome::Unchanged,
            Ok(StatusUpdate::TerminalLocked(current)) => {
                debug!(
                    order = %record.handle,
                    "Ignoring {:?} for order already {:?}",
                    status,
                    current
                );
                CheckOutcome::Unchanged
            }
            Err(e) => {
                warn!(order = %record.handle, "Ledger update failed: {}", e);
                CheckOutcome::Failed
            }
        }
    }
}
