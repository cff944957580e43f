use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::{EngineEvent, TradeLedger};
use crate::api::{MarketDataSource, OrderGateway};
use crate::config::EngineConfig;
use crate::error::{GatewayError, StrategyError};
use crate::models::{OrderHandle, OrderRecord, OrderRequest, OrderSide, StrategyHandle};
use crate::strategy::{
    Averages, BreakoutTrigger, CrossoverTrigger, StrategyDefinition, StrategyKind, Trigger,
    TriggerBaseline,
};

/// Runner lifecycle: Pending → Running → {Triggered → Completed | Cancelled | Failed}
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Triggered,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }
}

/// Point-in-time view of one runner
#[derive(Debug, Clone, Serialize)]
pub struct StrategyRunState {
    pub handle: StrategyHandle,
    pub strategy_id: String,
    pub symbol: String,
    pub status: RunStatus,
    pub baseline: Option<TriggerBaseline>,
    pub polls: u64,
    pub triggers: u64,
    pub last_price: Option<f64>,
    pub orders: Vec<OrderHandle>,
    pub last_error: Option<StrategyError>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StrategyRunState {
    fn new(handle: StrategyHandle, definition: &StrategyDefinition) -> Self {
        Self {
            handle,
            strategy_id: definition.id.clone(),
            symbol: definition.symbol.clone(),
            status: RunStatus::Pending,
            baseline: None,
            polls: 0,
            triggers: 0,
            last_price: None,
            orders: Vec::new(),
            last_error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Timing and retry settings for one runner
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RunnerSettings {
    /// Engine defaults, with the strategy's own poll interval if it has one
    pub fn resolve(config: &EngineConfig, definition: &StrategyDefinition) -> Self {
        Self {
            poll_interval: definition
                .poll_interval()
                .unwrap_or_else(|| config.poll_interval()),
            call_timeout: config.call_timeout(),
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
        }
    }
}

/// Collaborators shared by every runner
#[derive(Clone)]
pub struct RunnerContext {
    pub market: Arc<dyn MarketDataSource>,
    pub gateway: Arc<dyn OrderGateway>,
    pub ledger: Arc<TradeLedger>,
    pub events: broadcast::Sender<EngineEvent>,
}

/// Why the polling loop stopped
enum Exit {
    /// Final state already published
    Done,
    Cancelled,
    Failed(StrategyError),
}

#[derive(Debug, Clone, Copy)]
enum MarketCall {
    CurrentPrice,
    NDayHigh(u32),
    MovingAverage(u32),
}

impl fmt::Display for MarketCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketCall::CurrentPrice => write!(f, "current price"),
            MarketCall::NDayHigh(days) => write!(f, "{}-day high", days),
            MarketCall::MovingAverage(period) => write!(f, "SMA({})", period),
        }
    }
}

/// Executes one strategy: polls market data, evaluates the trigger and
/// places the order
///
/// The runner is the only writer of its `StrategyRunState`; the engine reads
/// published snapshots. Cancellation is cooperative and checked at the poll
/// boundaries: the poll-interval wait, retry backoff, and between receiving
/// market data and acting on it.
pub struct StrategyRunner {
    definition: StrategyDefinition,
    ctx: RunnerContext,
    settings: RunnerSettings,
    state: StrategyRunState,
    state_tx: watch::Sender<StrategyRunState>,
    cancel_rx: watch::Receiver<bool>,
    /// Held for the whole place-and-record step
    placement_gate: Arc<AsyncMutex<()>>,
}

impl StrategyRunner {
    pub fn new(
        handle: StrategyHandle,
        definition: StrategyDefinition,
        ctx: RunnerContext,
        settings: RunnerSettings,
        cancel_rx: watch::Receiver<bool>,
        placement_gate: Arc<AsyncMutex<()>>,
    ) -> (Self, watch::Receiver<StrategyRunState>) {
        let state = StrategyRunState::new(handle, &definition);
        let (state_tx, state_rx) = watch::channel(state.clone());

        let runner = Self {
            definition,
            ctx,
            settings,
            state,
            state_tx,
            cancel_rx,
            placement_gate,
        };
        (runner, state_rx)
    }

    /// Drive the strategy until it completes, fails or is cancelled
    pub async fn run(mut self) {
        self.transition(RunStatus::Running);
        tracing::info!(
            strategy_id = %self.definition.id,
            symbol = %self.definition.symbol,
            kind = self.definition.kind.name(),
            poll_interval = ?self.settings.poll_interval,
            recurring = self.definition.recurring,
            "Strategy runner started"
        );

        match self.run_loop().await {
            Exit::Done => {}
            Exit::Cancelled => self.finish(RunStatus::Cancelled, None),
            Exit::Failed(error) => self.finish(RunStatus::Failed, Some(error)),
        }
    }

    async fn run_loop(&mut self) -> Exit {
        if self.is_cancelled() {
            return Exit::Cancelled;
        }

        let mut trigger = match self.arm().await {
            Ok(trigger) => trigger,
            Err(exit) => return exit,
        };

        let period = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.wait_for_tick(&mut ticker).await {
                return Exit::Cancelled;
            }

            let fired_at = match self.poll(&mut trigger).await {
                Ok(fired_at) => fired_at,
                Err(exit) => return exit,
            };

            // Data is in but not yet acted on
            if self.is_cancelled() {
                return Exit::Cancelled;
            }

            if let Some(price) = fired_at {
                if let Some(exit) = self.place(price).await {
                    return exit;
                }
            }
        }
    }

    /// Build the trigger and its starting baseline
    async fn arm(&mut self) -> Result<Trigger, Exit> {
        let trigger = match self.definition.kind {
            StrategyKind::BreakoutBuy { lookback_days } => {
                let high = self.fetch(MarketCall::NDayHigh(lookback_days)).await?;
                tracing::info!(
                    strategy_id = %self.definition.id,
                    symbol = %self.definition.symbol,
                    lookback_days,
                    high,
                    "Breakout baseline cached"
                );
                Trigger::Breakout(BreakoutTrigger::new(high))
            }
            StrategyKind::MovingAverageCrossover {
                short_period,
                long_period,
            } => Trigger::Crossover(CrossoverTrigger::new(short_period, long_period)),
        };

        self.state.baseline = trigger.baseline();
        self.publish();
        Ok(trigger)
    }

    /// One poll; returns the price to act on if the trigger fired
    async fn poll(&mut self, trigger: &mut Trigger) -> Result<Option<f64>, Exit> {
        let price = self.fetch(MarketCall::CurrentPrice).await?;

        let fired = match trigger {
            Trigger::Breakout(breakout) => breakout.observe(price),
            Trigger::Crossover(crossover) => {
                let (short_period, long_period) = crossover.periods();
                let short = self.fetch(MarketCall::MovingAverage(short_period)).await?;
                let long = self.fetch(MarketCall::MovingAverage(long_period)).await?;
                crossover.observe(Averages::new(short, long))
            }
        };

        self.state.polls += 1;
        self.state.last_price = Some(price);
        self.state.baseline = trigger.baseline();
        self.publish();

        tracing::debug!(
            strategy_id = %self.definition.id,
            symbol = %self.definition.symbol,
            poll = self.state.polls,
            price,
            baseline = ?self.state.baseline,
            fired,
            "Polled"
        );
        self.emit(EngineEvent::Polled {
            handle: self.state.handle,
            strategy_id: self.definition.id.clone(),
            price,
            triggered: fired,
        });

        Ok(fired.then_some(price))
    }

    /// Call the market with timeout, retrying transient failures with
    /// exponential backoff
    async fn fetch(&mut self, call: MarketCall) -> Result<f64, Exit> {
        let attempts = self.settings.max_retries.saturating_add(1);
        let mut backoff = self.settings.initial_backoff;
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            // Queueing for a rate-limit slot is not part of the call timeout
            if self.wait_for_capacity().await {
                return Err(Exit::Cancelled);
            }

            let outcome =
                tokio::time::timeout(self.settings.call_timeout, self.call_market(call)).await;
            let reason = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        tracing::info!(
                            strategy_id = %self.definition.id,
                            "✓ Fetched {} for {} after {} attempts",
                            call,
                            self.definition.symbol,
                            attempt
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(Exit::Failed(StrategyError::MarketData(e.to_string())));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("{} timed out after {:?}", call, self.settings.call_timeout),
            };

            if attempt < attempts {
                tracing::warn!(
                    strategy_id = %self.definition.id,
                    "Attempt {}/{} for {} of {} failed: {}. Retrying in {:?}",
                    attempt,
                    attempts,
                    call,
                    self.definition.symbol,
                    reason,
                    backoff
                );
                if self.pause(backoff).await {
                    return Err(Exit::Cancelled);
                }
                backoff = backoff.saturating_mul(2);
            }
            last_reason = reason;
        }

        Err(Exit::Failed(StrategyError::DataUnavailable {
            symbol: self.definition.symbol.clone(),
            attempts,
            reason: last_reason,
        }))
    }

    async fn call_market(&self, call: MarketCall) -> Result<f64, crate::error::MarketDataError> {
        let symbol = self.definition.symbol.as_str();
        match call {
            MarketCall::CurrentPrice => self.ctx.market.current_price(symbol).await,
            MarketCall::NDayHigh(days) => self.ctx.market.n_day_high(symbol, days).await,
            MarketCall::MovingAverage(period) => {
                self.ctx.market.moving_average(symbol, period).await
            }
        }
    }

    /// Submit the order for a fired trigger and record it
    ///
    /// Returns `Some` when the runner is finished. The placement gate is held
    /// until the outcome is recorded and published, so shutdown never aborts
    /// between an accepted order and its ledger entry.
    async fn place(&mut self, price: f64) -> Option<Exit> {
        self.state.triggers += 1;
        self.transition(RunStatus::Triggered);

        let request = OrderRequest {
            symbol: self.definition.symbol.clone(),
            side: OrderSide::Buy,
            quantity: self.definition.quantity,
            price: self.definition.kind.order_price(price),
        };

        tracing::info!(
            strategy_id = %self.definition.id,
            symbol = %request.symbol,
            quantity = request.quantity,
            price = %request.price,
            "🎯 Trigger fired at {:.2}, placing order",
            price
        );

        let gate = self.placement_gate.clone();
        let _placement = gate.lock().await;

        match self.ctx.gateway.place_order(&request).await {
            Ok(order) => {
                let record = OrderRecord::new(order.clone(), self.definition.id.clone(), &request);
                if let Err(e) = self.ctx.ledger.append(record) {
                    tracing::error!(
                        strategy_id = %self.definition.id,
                        order = %order,
                        "Failed to record accepted order: {}",
                        e
                    );
                    self.finish(RunStatus::Failed, Some(StrategyError::Ledger(e.to_string())));
                    return Some(Exit::Done);
                }

                self.state.orders.push(order.clone());
                self.emit(EngineEvent::OrderPlaced {
                    handle: self.state.handle,
                    strategy_id: self.definition.id.clone(),
                    order: order.clone(),
                });
                tracing::info!(
                    strategy_id = %self.definition.id,
                    order = %order,
                    "✓ Order placed and recorded"
                );

                if self.definition.recurring {
                    self.transition(RunStatus::Running);
                    None
                } else {
                    self.finish(RunStatus::Completed, None);
                    Some(Exit::Done)
                }
            }
            Err(GatewayError::Rejected(reason)) => {
                tracing::warn!(
                    strategy_id = %self.definition.id,
                    symbol = %request.symbol,
                    "Order rejected: {}",
                    reason
                );
                self.emit(EngineEvent::OrderRejected {
                    handle: self.state.handle,
                    strategy_id: self.definition.id.clone(),
                    reason: reason.clone(),
                });
                self.finish(RunStatus::Failed, Some(StrategyError::OrderRejected(reason)));
                Some(Exit::Done)
            }
            Err(e) => {
                let reason = match e {
                    GatewayError::Unreachable(reason) => reason,
                    other => other.to_string(),
                };
                self.finish(
                    RunStatus::Failed,
                    Some(StrategyError::GatewayUnreachable(reason)),
                );
                Some(Exit::Done)
            }
        }
    }

    /// Wait for the next poll; true if cancelled meanwhile
    async fn wait_for_tick(&mut self, ticker: &mut Interval) -> bool {
        self.unless_cancelled(ticker.tick()).await
    }

    /// Sleep for a backoff delay; true if cancelled meanwhile
    async fn pause(&mut self, duration: Duration) -> bool {
        self.unless_cancelled(tokio::time::sleep(duration)).await
    }

    /// Wait for request capacity at the source; true if cancelled meanwhile
    async fn wait_for_capacity(&mut self) -> bool {
        let market = self.ctx.market.clone();
        self.unless_cancelled(market.ready()).await
    }

    /// Await `wait` or cancellation, whichever comes first; true if cancelled
    async fn unless_cancelled<F, T>(&mut self, wait: F) -> bool
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return true;
        }
        let sender_gone = tokio::select! {
            _ = wait => false,
            changed = self.cancel_rx.changed() => changed.is_err(),
        };
        sender_gone || self.is_cancelled()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn transition(&mut self, to: RunStatus) {
        let from = self.state.status;
        if from == to {
            return;
        }

        self.state.status = to;
        self.publish();
        self.emit(EngineEvent::StatusChanged {
            handle: self.state.handle,
            strategy_id: self.definition.id.clone(),
            from,
            to,
        });
    }

    fn finish(&mut self, status: RunStatus, error: Option<StrategyError>) {
        match (&status, &error) {
            (RunStatus::Failed, Some(e)) => tracing::warn!(
                strategy_id = %self.definition.id,
                "✗ Strategy failed: {}",
                e
            ),
            _ => tracing::info!(
                strategy_id = %self.definition.id,
                status = ?status,
                polls = self.state.polls,
                orders = self.state.orders.len(),
                "Strategy finished"
            ),
        }

        self.state.last_error = error;
        self.state.finished_at = Some(Utc::now());
        self.transition(status);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.ctx.events.send(event);
    }
}
