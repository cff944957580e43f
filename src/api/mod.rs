// External collaborators consumed by the engine
pub mod paper;
pub mod throttle;

use async_trait::async_trait;

use crate::error::{GatewayError, MarketDataError};
use crate::models::{OrderHandle, OrderRequest, OrderStatus};

pub use paper::{PaperBroker, PaperMarket};
pub use throttle::ThrottledMarket;

/// Quote and history provider
///
/// Implementations may be slow or fail transiently; callers bound each call
/// with their own timeout.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Latest traded price
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError>;

    /// Highest daily close over the last `days` sessions
    async fn n_day_high(&self, symbol: &str, days: u32) -> Result<f64, MarketDataError>;

    /// Simple moving average over `period` daily closes
    async fn moving_average(&self, symbol: &str, period: u32) -> Result<f64, MarketDataError>;

    /// Wait until one request may be issued
    ///
    /// Callers await this before each request and outside any per-call
    /// timeout. Unthrottled sources are always ready.
    async fn ready(&self) {}
}

/// Brokerage order entry and status lookup
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, GatewayError>;

    async fn query_status(&self, handle: &OrderHandle) -> Result<OrderStatus, GatewayError>;
}
