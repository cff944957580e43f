// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod strategy;

// Re-export commonly used types
pub use api::{MarketDataSource, OrderGateway, PaperBroker, PaperMarket};
pub use config::EngineConfig;
pub use error::{EngineError, Result, StrategyError};
pub use execution::{EngineEvent, RunStatus, StrategyEngine, StrategyRunState, TradeLedger};
pub use models::*;
pub use strategy::{StrategyDefinition, StrategyKind};
