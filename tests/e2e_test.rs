use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stockbot::*;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 1_000,
        monitor_interval_ms: 5_000,
        call_timeout_ms: 500,
        max_retries: 2,
        initial_backoff_ms: 100,
        shutdown_grace_ms: 2_000,
        ..EngineConfig::default()
    }
}

fn start_engine() -> (StrategyEngine, Arc<PaperMarket>, Arc<PaperBroker>) {
    let market = Arc::new(PaperMarket::new());
    let broker = Arc::new(PaperBroker::new());
    let engine = StrategyEngine::start(test_config(), market.clone(), broker.clone()).unwrap();
    (engine, market, broker)
}

fn drain(events: &mut broadcast::Receiver<EngineEvent>, strategy_id: &str) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.strategy_id() == strategy_id {
            out.push(event);
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_e2e_breakout_workflow() {
    let _ = tracing_subscriber::fmt::try_init();

    println!("=== Starting E2E Breakout Test ===\n");

    // 1. Market where the 20-day high is 50 and price breaks out on the third poll
    println!("1. Scripting market...");
    let (engine, market, _broker) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [48.0, 49.0, 51.0]);
    let mut events = engine.subscribe();

    // 2. Run to completion
    println!("2. Running strategy...");
    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl-breakout", "US.AAPL", 20, 10))
        .unwrap();
    let state = engine.wait_for(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.polls, 3);
    assert_eq!(state.last_price, Some(51.0));
    println!("   ✓ Completed after {} polls", state.polls);

    // 3. Ledger holds exactly one market order
    println!("3. Checking ledger...");
    let records = engine.ledger_snapshot();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.strategy_id, "aapl-breakout");
    assert_eq!(record.symbol, "US.AAPL");
    assert_eq!(record.side, OrderSide::Buy);
    assert_eq!(record.quantity, 10);
    assert_eq!(record.price, PriceSpec::Market);
    assert_eq!(record.status, OrderStatus::Submitted);
    println!("   ✓ Order {} recorded", record.handle);

    // 4. Event sequence
    println!("4. Checking events...");
    let seen = drain(&mut events, "aapl-breakout");
    let statuses: Vec<(RunStatus, RunStatus)> = seen
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StatusChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            (RunStatus::Pending, RunStatus::Running),
            (RunStatus::Running, RunStatus::Triggered),
            (RunStatus::Triggered, RunStatus::Completed),
        ]
    );
    let polled: Vec<bool> = seen
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Polled { triggered, .. } => Some(*triggered),
            _ => None,
        })
        .collect();
    assert_eq!(polled, vec![false, false, true]);
    assert!(seen
        .iter()
        .any(|e| matches!(e, EngineEvent::OrderPlaced { order, .. } if *order == record.handle)));

    // 5. Monitor reconciles the fill
    println!("5. Waiting for order monitor...");
    tokio::time::sleep(Duration::from_secs(6)).await;
    let filled = engine.ledger().get(&record.handle).unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert!(filled.last_checked.is_some());
    assert_eq!(engine.monitor_stats().orders_terminal, 1);
    println!("   ✓ Order filled");

    engine.shutdown().await;
    println!("\n=== E2E Breakout Test Complete ===");
}

#[tokio::test(start_paused = true)]
async fn test_rejected_order_fails_strategy() {
    let (engine, market, broker) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [51.0]);
    broker.reject_next("insufficient funds");

    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl", "US.AAPL", 20, 10))
        .unwrap();
    let state = engine.wait_for(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(
        state.last_error,
        Some(StrategyError::OrderRejected("insufficient funds".to_string()))
    );
    assert!(engine.ledger_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_crossover_places_one_limit_order() {
    let (engine, market, broker) = start_engine();
    market.push_prices("US.MSFT", [400.0, 402.5, 405.0]);
    market.push_moving_averages("US.MSFT", 5, [9.0, 11.0, 12.0]);
    market.push_moving_averages("US.MSFT", 20, [10.0, 10.0, 10.0]);

    let handle = engine
        .submit(StrategyDefinition::ma_crossover("msft-cross", "US.MSFT", 5, 20, 4))
        .unwrap();
    let state = engine.wait_for(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    let placed = broker.placed_orders();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].1.price, PriceSpec::Limit(402.5));
    assert_eq!(engine.ledger_snapshot().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_right_after_submit() {
    let (engine, market, _) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [40.0]);

    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl", "US.AAPL", 20, 1))
        .unwrap();
    let status = engine.status(handle).unwrap().status;
    assert!(matches!(status, RunStatus::Pending | RunStatus::Running));

    engine.cancel(handle).unwrap();
    let state = engine.wait_for(handle).await.unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(engine.ledger_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run_and_unknown_handle() {
    let (engine, market, _) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [45.0]);

    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl", "US.AAPL", 20, 1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert_eq!(engine.status(handle).unwrap().polls, 4);

    engine.cancel(handle).unwrap();
    let state = engine.wait_for(handle).await.unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.polls, 4);

    // Cancelling again is a no-op
    assert_ok!(engine.cancel(handle));
    assert_eq!(engine.status(handle).unwrap().status, RunStatus::Cancelled);

    let unknown = StrategyHandle::new();
    assert_err!(engine.cancel(unknown));
    assert!(matches!(engine.status(unknown), Err(EngineError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn test_slow_symbol_does_not_delay_others() {
    let (engine, market, _) = start_engine();
    market.set_n_day_high("US.SLOW", 20, 50.0);
    market.set_latency("US.SLOW", Duration::from_secs(30));
    market.set_n_day_high("US.FAST", 20, 50.0);
    market.push_prices("US.FAST", [55.0]);

    let slow = engine
        .submit(StrategyDefinition::breakout_buy("slow", "US.SLOW", 20, 1))
        .unwrap();
    let fast = engine
        .submit(StrategyDefinition::breakout_buy("fast", "US.FAST", 20, 1))
        .unwrap();

    let fast_state = tokio::time::timeout(Duration::from_millis(1_500), engine.wait_for(fast))
        .await
        .expect("fast strategy blocked by slow one")
        .unwrap();
    assert_eq!(fast_state.status, RunStatus::Completed);

    let slow_state = engine.wait_for(slow).await.unwrap();
    assert_eq!(slow_state.status, RunStatus::Failed);
    assert!(matches!(
        slow_state.last_error,
        Some(StrategyError::DataUnavailable { attempts: 3, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_many_strategies_record_unique_orders() {
    let (engine, market, _) = start_engine();
    let mut handles = Vec::new();
    for i in 0..20 {
        let symbol = format!("US.S{}", i);
        market.set_n_day_high(&symbol, 10, 100.0);
        market.push_prices(&symbol, [99.0, 101.0]);
        handles.push(
            engine
                .submit(StrategyDefinition::breakout_buy(&format!("s{}", i), &symbol, 10, 1))
                .unwrap(),
        );
    }

    for handle in &handles {
        assert_eq!(engine.wait_for(*handle).await.unwrap().status, RunStatus::Completed);
    }

    let records = engine.ledger_snapshot();
    assert_eq!(records.len(), 20);
    let unique: HashSet<_> = records.iter().map(|r| r.handle.clone()).collect();
    assert_eq!(unique.len(), 20);
    assert_eq!(engine.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_order_is_never_requeried() {
    let (engine, market, broker) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [51.0]);

    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl", "US.AAPL", 20, 1))
        .unwrap();
    engine.wait_for(handle).await.unwrap();
    let order = engine.ledger_snapshot()[0].handle.clone();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.ledger().get(&order).unwrap().status, OrderStatus::Filled);

    // Broker now claims otherwise; the record must stay Filled
    broker.script_status(&order, vec![OrderStatus::Cancelled]);
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(engine.ledger().get(&order).unwrap().status, OrderStatus::Filled);
    assert_eq!(broker.query_count(&order), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_inflight_placement() {
    let (engine, market, broker) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [51.0]);
    broker.set_place_latency(Duration::from_secs(10));

    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl", "US.AAPL", 20, 1))
        .unwrap();

    // Past the first poll, so placement is in flight
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(engine.status(handle).unwrap().status, RunStatus::Triggered);

    engine.shutdown().await;

    // The accepted order must be in the ledger and the runner finished
    assert_eq!(engine.ledger_snapshot().len(), 1);
    assert_eq!(broker.placed_orders().len(), 1);
    let state = engine.status(handle).unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.orders.len(), 1);

    assert!(matches!(
        engine.submit(StrategyDefinition::breakout_buy("late", "US.AAPL", 20, 1)),
        Err(EngineError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_idempotent() {
    let (engine, market, _) = start_engine();
    market.set_n_day_high("US.AAPL", 20, 50.0);
    market.push_prices("US.AAPL", [40.0]);

    let handle = engine
        .submit(StrategyDefinition::breakout_buy("aapl", "US.AAPL", 20, 1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    engine.shutdown().await;
    engine.shutdown().await;
    assert_eq!(engine.status(handle).unwrap().status, RunStatus::Cancelled);
}
