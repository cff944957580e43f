use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{MarketDataSource, OrderGateway};
use crate::error::{GatewayError, MarketDataError};
use crate::indicators::{calculate_high, calculate_sma};
use crate::models::{OrderHandle, OrderRequest, OrderStatus};

/// Daily closes kept per symbol; older ones are dropped
pub const MAX_CLOSES: usize = 2_000;

#[derive(Debug, Default)]
struct SymbolBook {
    /// Daily closes, oldest first
    closes: Vec<f64>,
    /// Live quotes served one per `current_price` call
    ticks: VecDeque<f64>,
    last_price: Option<f64>,
    high_overrides: HashMap<u32, f64>,
    scripted_averages: HashMap<u32, VecDeque<f64>>,
    last_averages: HashMap<u32, f64>,
    pending_failures: u32,
    latency: Option<Duration>,
}

/// In-memory market for paper trading and tests
///
/// Quotes come from scripted ticks (the last one repeats once the script runs
/// out). N-day highs and moving averages are computed from the recorded daily
/// closes unless a value has been scripted for that symbol and window.
#[derive(Debug, Default)]
pub struct PaperMarket {
    books: Mutex<HashMap<String, SymbolBook>>,
}

impl PaperMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the daily close history for a symbol
    pub fn set_history(&self, symbol: &str, mut closes: Vec<f64>) {
        if closes.len() > MAX_CLOSES {
            closes.drain(..closes.len() - MAX_CLOSES);
        }
        self.with_book(symbol, |book| book.closes = closes);
    }

    /// Append one daily close, dropping the oldest past `MAX_CLOSES`
    pub fn record_close(&self, symbol: &str, close: f64) {
        self.with_book(symbol, |book| {
            book.closes.push(close);
            if book.closes.len() > MAX_CLOSES {
                book.closes.remove(0);
            }
        });
    }

    /// Make `price` the live quote, discarding any queued ticks
    ///
    /// Every reader sees the latest quote, however often it polls.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.with_book(symbol, |book| {
            book.ticks.clear();
            book.last_price = Some(price);
        });
    }

    /// Queue live quotes, served in order
    pub fn push_prices(&self, symbol: &str, prices: impl IntoIterator<Item = f64>) {
        self.with_book(symbol, |book| book.ticks.extend(prices));
    }

    pub fn push_price(&self, symbol: &str, price: f64) {
        self.push_prices(symbol, [price]);
    }

    /// Pin the N-day high returned for `days`
    pub fn set_n_day_high(&self, symbol: &str, days: u32, high: f64) {
        self.with_book(symbol, |book| {
            book.high_overrides.insert(days, high);
        });
    }

    /// Queue moving-average values for `period`, served one per call
    pub fn push_moving_averages(
        &self,
        symbol: &str,
        period: u32,
        values: impl IntoIterator<Item = f64>,
    ) {
        self.with_book(symbol, |book| {
            book.scripted_averages
                .entry(period)
                .or_default()
                .extend(values)
        });
    }

    /// Make the next `count` calls for `symbol` fail as unavailable
    pub fn fail_next(&self, symbol: &str, count: u32) {
        self.with_book(symbol, |book| book.pending_failures += count);
    }

    /// Delay every response for `symbol`
    pub fn set_latency(&self, symbol: &str, latency: Duration) {
        self.with_book(symbol, |book| book.latency = Some(latency));
    }

    fn with_book<R>(&self, symbol: &str, f: impl FnOnce(&mut SymbolBook) -> R) -> R {
        let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        f(books.entry(symbol.to_string()).or_default())
    }

    /// Look up a book, applying injected latency and failures
    async fn serve<R>(
        &self,
        symbol: &str,
        f: impl FnOnce(&mut SymbolBook) -> Result<R, MarketDataError>,
    ) -> Result<R, MarketDataError> {
        let latency = {
            let books = self.books.lock().unwrap_or_else(|e| e.into_inner());
            books
                .get(symbol)
                .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))?
                .latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut books = self.books.lock().unwrap_or_else(|e| e.into_inner());
        let book = books
            .get_mut(symbol)
            .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))?;

        if book.pending_failures > 0 {
            book.pending_failures -= 1;
            return Err(MarketDataError::Unavailable(format!(
                "{} quote service temporarily unavailable",
                symbol
            )));
        }

        f(book)
    }
}

#[async_trait]
impl MarketDataSource for PaperMarket {
    async fn current_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        self.serve(symbol, |book| {
            if let Some(price) = book.ticks.pop_front() {
                book.last_price = Some(price);
            }
            book.last_price
                .ok_or_else(|| MarketDataError::Unavailable(format!("no quote yet for {}", symbol)))
        })
        .await
    }

    async fn n_day_high(&self, symbol: &str, days: u32) -> Result<f64, MarketDataError> {
        self.serve(symbol, |book| {
            if let Some(high) = book.high_overrides.get(&days) {
                return Ok(*high);
            }
            calculate_high(&book.closes, days as usize).ok_or_else(|| {
                MarketDataError::Unavailable(format!(
                    "{} has {} closes, need {}",
                    symbol,
                    book.closes.len(),
                    days
                ))
            })
        })
        .await
    }

    async fn moving_average(&self, symbol: &str, period: u32) -> Result<f64, MarketDataError> {
        self.serve(symbol, |book| {
            if let Some(value) = book
                .scripted_averages
                .get_mut(&period)
                .and_then(|queue| queue.pop_front())
            {
                book.last_averages.insert(period, value);
                return Ok(value);
            }
            if let Some(value) = book.last_averages.get(&period) {
                return Ok(*value);
            }
            calculate_sma(&book.closes, period as usize).ok_or_else(|| {
                MarketDataError::Unavailable(format!(
                    "{} has {} closes, need {} for SMA",
                    symbol,
                    book.closes.len(),
                    period
                ))
            })
        })
        .await
    }
}

#[derive(Debug, Default)]
struct BrokerBook {
    rejections: VecDeque<String>,
    unreachable_placements: u32,
    unreachable_queries: u32,
    fill_plan: Vec<OrderStatus>,
    placement_attempts: usize,
    placed: Vec<(OrderHandle, OrderRequest)>,
    progress: HashMap<OrderHandle, VecDeque<OrderStatus>>,
    current: HashMap<OrderHandle, OrderStatus>,
    queries: HashMap<OrderHandle, usize>,
}

/// Paper broker: accepts every order unless told otherwise
///
/// Each accepted order walks through the fill plan, one status per query
/// (default: filled on the first query), then keeps its last status.
#[derive(Debug)]
pub struct PaperBroker {
    book: Mutex<BrokerBook>,
    place_latency: Mutex<Option<Duration>>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            book: Mutex::new(BrokerBook {
                fill_plan: vec![OrderStatus::Filled],
                ..Default::default()
            }),
            place_latency: Mutex::new(None),
        }
    }

    /// Reject the next placement with `reason`
    pub fn reject_next(&self, reason: &str) {
        self.lock().rejections.push_back(reason.to_string());
    }

    /// Statuses reported for orders accepted from now on
    pub fn set_fill_plan(&self, plan: Vec<OrderStatus>) {
        self.lock().fill_plan = plan;
    }

    /// Override the remaining statuses for an accepted order
    pub fn script_status(&self, handle: &OrderHandle, statuses: Vec<OrderStatus>) {
        self.lock().progress.insert(handle.clone(), statuses.into());
    }

    pub fn fail_next_placements(&self, count: u32) {
        self.lock().unreachable_placements += count;
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.lock().unreachable_queries += count;
    }

    pub fn set_place_latency(&self, latency: Duration) {
        *self.place_latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
    }

    /// Orders accepted so far, in placement order
    pub fn placed_orders(&self) -> Vec<(OrderHandle, OrderRequest)> {
        self.lock().placed.clone()
    }

    /// Placement calls received, accepted or not
    pub fn placement_attempts(&self) -> usize {
        self.lock().placement_attempts
    }

    /// Status queries received for `handle`
    pub fn query_count(&self, handle: &OrderHandle) -> usize {
        self.lock().queries.get(handle).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OrderGateway for PaperBroker {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, GatewayError> {
        let latency = *self.place_latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut book = self.lock();
        book.placement_attempts += 1;
        if book.unreachable_placements > 0 {
            book.unreachable_placements -= 1;
            return Err(GatewayError::Unreachable("paper broker offline".to_string()));
        }
        if let Some(reason) = book.rejections.pop_front() {
            return Err(GatewayError::Rejected(reason));
        }

        let handle = OrderHandle::new(format!("PAPER-{}", Uuid::new_v4().simple()));
        let plan: VecDeque<OrderStatus> = book.fill_plan.iter().copied().collect();
        book.progress.insert(handle.clone(), plan);
        book.current.insert(handle.clone(), OrderStatus::Submitted);
        book.placed.push((handle.clone(), request.clone()));

        tracing::debug!(
            handle = %handle,
            symbol = %request.symbol,
            quantity = request.quantity,
            price = %request.price,
            "Paper order accepted"
        );

        Ok(handle)
    }

    async fn query_status(&self, handle: &OrderHandle) -> Result<OrderStatus, GatewayError> {
        let mut book = self.lock();
        if book.unreachable_queries > 0 {
            book.unreachable_queries -= 1;
            return Err(GatewayError::Unreachable("paper broker offline".to_string()));
        }
        if !book.current.contains_key(handle) {
            return Err(GatewayError::NotFound(handle.clone()));
        }

        *book.queries.entry(handle.clone()).or_insert(0) += 1;

        let next = book
            .progress
            .get_mut(handle)
            .and_then(|queue| queue.pop_front());
        if let Some(status) = next {
            book.current.insert(handle.clone(), status);
        }

        book.current
            .get(handle)
            .copied()
            .ok_or_else(|| GatewayError::NotFound(handle.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, PriceSpec};

    fn buy(symbol: &str) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity: 10,
            price: PriceSpec::Market,
        }
    }

    #[tokio::test]
    async fn test_ticks_served_in_order_then_last_repeats() {
        let market = PaperMarket::new();
        market.push_prices("US.AAPL", [48.0, 49.0]);

        assert_eq!(market.current_price("US.AAPL").await, Ok(48.0));
        assert_eq!(market.current_price("US.AAPL").await, Ok(49.0));
        assert_eq!(market.current_price("US.AAPL").await, Ok(49.0));
    }

    #[tokio::test]
    async fn test_set_price_replaces_queued_ticks() {
        let market = PaperMarket::new();
        market.push_prices("US.AAPL", [48.0, 49.0, 50.0]);
        market.set_price("US.AAPL", 52.5);

        assert_eq!(market.current_price("US.AAPL").await, Ok(52.5));
        assert_eq!(market.current_price("US.AAPL").await, Ok(52.5));

        market.set_price("US.AAPL", 53.0);
        assert_eq!(market.current_price("US.AAPL").await, Ok(53.0));
    }

    #[tokio::test]
    async fn test_close_history_is_capped() {
        let market = PaperMarket::new();
        market.set_history("US.MSFT", vec![1.0; MAX_CLOSES + 10]);
        market.record_close("US.MSFT", 500.0);

        let len = market.with_book("US.MSFT", |book| book.closes.len());
        assert_eq!(len, MAX_CLOSES);
        assert_eq!(market.n_day_high("US.MSFT", 1).await, Ok(500.0));
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_not_retryable() {
        let market = PaperMarket::new();
        let err = market.current_price("US.NOPE").await.unwrap_err();
        assert_eq!(err, MarketDataError::UnknownSymbol("US.NOPE".to_string()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let market = PaperMarket::new();
        market.push_price("US.TSLA", 250.0);
        market.fail_next("US.TSLA", 2);

        assert!(market.current_price("US.TSLA").await.unwrap_err().is_retryable());
        assert!(market.current_price("US.TSLA").await.is_err());
        assert_eq!(market.current_price("US.TSLA").await, Ok(250.0));
    }

    #[tokio::test]
    async fn test_high_and_average_from_history() {
        let market = PaperMarket::new();
        market.set_history("US.MSFT", vec![400.0, 410.0, 405.0, 395.0]);

        assert_eq!(market.n_day_high("US.MSFT", 3).await, Ok(410.0));
        assert_eq!(market.moving_average("US.MSFT", 2).await, Ok(400.0));
        assert!(market.n_day_high("US.MSFT", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_values_override_history() {
        let market = PaperMarket::new();
        market.set_history("US.MSFT", vec![1.0, 2.0, 3.0]);
        market.set_n_day_high("US.MSFT", 20, 50.0);
        market.push_moving_averages("US.MSFT", 5, [9.0, 11.0]);

        assert_eq!(market.n_day_high("US.MSFT", 20).await, Ok(50.0));
        assert_eq!(market.moving_average("US.MSFT", 5).await, Ok(9.0));
        assert_eq!(market.moving_average("US.MSFT", 5).await, Ok(11.0));
        assert_eq!(market.moving_average("US.MSFT", 5).await, Ok(11.0));
    }

    #[tokio::test]
    async fn test_broker_rejects_then_accepts() {
        let broker = PaperBroker::new();
        broker.reject_next("insufficient funds");

        let err = broker.place_order(&buy("US.AAPL")).await.unwrap_err();
        assert_eq!(err, GatewayError::Rejected("insufficient funds".to_string()));

        let handle = broker.place_order(&buy("US.AAPL")).await.unwrap();
        assert_eq!(broker.placed_orders().len(), 1);
        assert_eq!(broker.placed_orders()[0].0, handle);
    }

    #[tokio::test]
    async fn test_broker_offline_counts_attempt() {
        let broker = PaperBroker::new();
        broker.fail_next_placements(1);

        let err = broker.place_order(&buy("US.AAPL")).await.unwrap_err();
        assert_eq!(err, GatewayError::Unreachable("paper broker offline".to_string()));
        assert_eq!(broker.placement_attempts(), 1);
        assert!(broker.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_broker_walks_fill_plan() {
        let broker = PaperBroker::new();
        broker.set_fill_plan(vec![OrderStatus::PartiallyFilled, OrderStatus::Filled]);
        let handle = broker.place_order(&buy("US.AAPL")).await.unwrap();

        assert_eq!(broker.query_status(&handle).await, Ok(OrderStatus::PartiallyFilled));
        assert_eq!(broker.query_status(&handle).await, Ok(OrderStatus::Filled));
        assert_eq!(broker.query_status(&handle).await, Ok(OrderStatus::Filled));
        assert_eq!(broker.query_count(&handle), 3);
    }

    #[tokio::test]
    async fn test_broker_unknown_handle() {
        let broker = PaperBroker::new();
        let handle = OrderHandle::new("missing");
        assert_eq!(
            broker.query_status(&handle).await,
            Err(GatewayError::NotFound(handle.clone()))
        );
    }
}
