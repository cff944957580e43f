// Strategy execution: runners, the engine that owns them, and order bookkeeping
pub mod engine;
pub mod events;
pub mod ledger;
pub mod order_monitor;
pub mod runner;

pub use engine::StrategyEngine;
pub use events::EngineEvent;
pub use ledger::{StatusUpdate, TradeLedger};
pub use order_monitor::{MonitorStats, OrderMonitor, OrderMonitorConfig, SweepReport};
pub use runner::{RunStatus, RunnerContext, RunnerSettings, StrategyRunState, StrategyRunner};
