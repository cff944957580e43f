use serde::Serialize;

use super::runner::RunStatus;
use crate::models::{OrderHandle, OrderStatus, StrategyHandle};

/// Observable engine activity, delivered through `StrategyEngine::subscribe`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum EngineEvent {
    StatusChanged {
        handle: StrategyHandle,
        strategy_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    /// One completed poll and whether the trigger fired on it
    Polled {
        handle: StrategyHandle,
        strategy_id: String,
        price: f64,
        triggered: bool,
    },
    OrderPlaced {
        handle: StrategyHandle,
        strategy_id: String,
        order: OrderHandle,
    },
    OrderRejected {
        handle: StrategyHandle,
        strategy_id: String,
        reason: String,
    },
    OrderStatusChanged {
        order: OrderHandle,
        strategy_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
}

impl EngineEvent {
    /// Strategy id the event belongs to
    pub fn strategy_id(&self) -> &str {
        match self {
            EngineEvent::StatusChanged { strategy_id, .. }
            | EngineEvent::Polled { strategy_id, .. }
            | EngineEvent::OrderPlaced { strategy_id, .. }
            | EngineEvent::OrderRejected { strategy_id, .. }
            | EngineEvent::OrderStatusChanged { strategy_id, .. } => strategy_id,
        }
    }
}
