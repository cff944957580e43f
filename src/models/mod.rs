use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one submission of a strategy to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyHandle(Uuid);

impl StrategyHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StrategyHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StrategyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque order identifier issued by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle(String);

impl OrderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// How the order is priced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum PriceSpec {
    Market,
    Limit(f64),
}

impl fmt::Display for PriceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSpec::Market => write!(f, "market"),
            PriceSpec::Limit(price) => write!(f, "limit@{:.2}", price),
        }
    }
}

/// Order sent to the gateway when a strategy triggers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: PriceSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// No further change is expected once an order reaches one of these
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// Ledger entry for an accepted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub handle: OrderHandle,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub price: PriceSpec,
    pub submitted_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn new(handle: OrderHandle, strategy_id: String, request: &OrderRequest) -> Self {
        Self {
            handle,
            strategy_id,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            submitted_at: Utc::now(),
            status: OrderStatus::Submitted,
            last_checked: None,
        }
    }
}
