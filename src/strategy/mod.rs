// Strategy definitions and trigger predicates
pub mod breakout;
pub mod crossover;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::models::PriceSpec;

pub use breakout::BreakoutTrigger;
pub use crossover::{Averages, CrossoverTrigger};

/// Kind-specific strategy parameters
///
/// Deserializes from a `type` tag, so unknown kinds fail before reaching the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StrategyKind {
    /// Buy at market once the price breaks above the N-day high
    BreakoutBuy { lookback_days: u32 },
    /// Buy at the current price when the short SMA crosses above the long SMA
    MovingAverageCrossover { short_period: u32, long_period: u32 },
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::BreakoutBuy { .. } => "BreakoutBuy",
            StrategyKind::MovingAverageCrossover { .. } => "MovingAverageCrossover",
        }
    }

    /// Price for the order placed when this kind triggers
    pub fn order_price(&self, current_price: f64) -> PriceSpec {
        match self {
            StrategyKind::BreakoutBuy { .. } => PriceSpec::Market,
            StrategyKind::MovingAverageCrossover { .. } => PriceSpec::Limit(current_price),
        }
    }
}

/// What to watch and when to act
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyDefinition {
    pub id: String,
    pub symbol: String,
    #[serde(flatten)]
    pub kind: StrategyKind,
    /// Shares bought per trigger
    pub quantity: u64,
    /// Re-arm after a trigger instead of completing
    #[serde(default)]
    pub recurring: bool,
    /// Overrides the engine's default poll interval
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl StrategyDefinition {
    pub fn breakout_buy(id: &str, symbol: &str, lookback_days: u32, quantity: u64) -> Self {
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            kind: StrategyKind::BreakoutBuy { lookback_days },
            quantity,
            recurring: false,
            poll_interval_ms: None,
        }
    }

    pub fn ma_crossover(
        id: &str,
        symbol: &str,
        short_period: u32,
        long_period: u32,
        quantity: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            kind: StrategyKind::MovingAverageCrossover {
                short_period,
                long_period,
            },
            quantity,
            recurring: false,
            poll_interval_ms: None,
        }
    }

    pub fn recurring(mut self) -> Self {
        self.recurring = true;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    /// Check the parameters are consistent for the kind
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(invalid("strategy id must not be empty"));
        }
        if self.symbol.trim().is_empty() {
            return Err(invalid(format!("{}: symbol must not be empty", self.id)));
        }
        if self.quantity == 0 {
            return Err(invalid(format!("{}: quantity must be positive", self.id)));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(invalid(format!("{}: poll interval must be positive", self.id)));
        }

        match self.kind {
            StrategyKind::BreakoutBuy { lookback_days } => {
                if lookback_days == 0 {
                    return Err(invalid(format!(
                        "{}: lookback_days must be at least 1",
                        self.id
                    )));
                }
            }
            StrategyKind::MovingAverageCrossover {
                short_period,
                long_period,
            } => {
                if short_period == 0 {
                    return Err(invalid(format!(
                        "{}: short_period must be at least 1",
                        self.id
                    )));
                }
                if short_period >= long_period {
                    return Err(invalid(format!(
                        "{}: short_period ({}) must be less than long_period ({})",
                        self.id, short_period, long_period
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidStrategy(reason.into())
}

/// Per-kind trigger state, owned by a runner
#[derive(Debug, Clone)]
pub enum Trigger {
    Breakout(BreakoutTrigger),
    Crossover(CrossoverTrigger),
}

/// Snapshot of what a trigger compares against
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub enum TriggerBaseline {
    NDayHigh(f64),
    Averages(Averages),
}

impl Trigger {
    pub fn baseline(&self) -> Option<TriggerBaseline> {
        match self {
            Trigger::Breakout(trigger) => Some(TriggerBaseline::NDayHigh(trigger.baseline())),
            Trigger::Crossover(trigger) => trigger.previous().map(TriggerBaseline::Averages),
        }
    }
}
