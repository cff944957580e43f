use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use super::MarketDataSource;
use crate::error::MarketDataError;

type DataRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Rate-limited view of a market data source
///
/// Brokerage quote APIs cap requests per minute per account. All runners
/// share one limiter, so a clone of this wrapper shares the quota. A slot is
/// taken in `ready`; the data calls themselves never wait, so time spent
/// queueing for a slot is not charged to a caller's call timeout.
#[derive(Clone)]
pub struct ThrottledMarket {
    inner: Arc<dyn MarketDataSource>,
    rate_limiter: Arc<DataRateLimiter>,
}

impl ThrottledMarket {
    pub fn new(inner: Arc<dyn MarketDataSource>, requests_per_minute: NonZeroU32) -> Self {
        let quota = Quota::per_minute(requests_per_minute);
        Self {
            inner,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[async_trait]
impl MarketDataSource for ThrottledMarket {
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        self.inner.current_price(symbol).await
    }

    async fn n_day_high(&self, symbol: &str, days: u32) -> Result<f64, MarketDataError> {
        self.inner.n_day_high(symbol, days).await
    }

    async fn moving_average(&self, symbol: &str, period: u32) -> Result<f64, MarketDataError> {
        self.inner.moving_average(symbol, period).await
    }

    async fn ready(&self) {
        self.rate_limiter.until_ready().await;
        self.inner.ready().await;
    }
}
