use serde::Serialize;
use thiserror::Error;

use crate::models::{OrderHandle, StrategyHandle};

/// Errors returned by the engine's public operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("Strategy not found: {0}")]
    NotFound(StrategyHandle),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Why a strategy runner ended in Failed
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum StrategyError {
    #[error("Market data unavailable for {symbol} after {attempts} attempts: {reason}")]
    DataUnavailable {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    #[error("Market data error: {0}")]
    MarketData(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

/// Errors reported by a MarketDataSource
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    /// Transient; the caller may retry
    #[error("Data unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl MarketDataError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MarketDataError::Unavailable(_))
    }
}

/// Errors reported by an OrderGateway
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Order not found: {0}")]
    NotFound(OrderHandle),

    #[error("Gateway unreachable: {0}")]
    Unreachable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Order {0} already recorded")]
    DuplicateHandle(OrderHandle),

    #[error("Order {0} not in ledger")]
    UnknownHandle(OrderHandle),
}

pub type Result<T> = std::result::Result<T, EngineError>;
