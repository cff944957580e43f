use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stockbot::{
    EngineConfig, MarketDataSource, PaperBroker, PaperMarket, StrategyDefinition, StrategyEngine,
};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Daily closes generated per symbol before strategies start
const HISTORY_DAYS: usize = 250;
const BASE_PRICE: f64 = 150.0;

#[derive(Parser)]
#[command(name = "stockbot")]
#[command(version = "0.1.0")]
#[command(about = "Concurrent stock strategy execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml and environment overrides
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run strategies against the paper market and broker
    Run {
        /// JSON file with a list of strategy definitions
        #[arg(short, long)]
        strategies: PathBuf,
        /// Seed for the simulated price feed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Check strategy definitions without running them
    Validate {
        #[arg(short, long)]
        strategies: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { strategies } => {
            let definitions = load_strategies(&strategies)?;
            for definition in &definitions {
                definition.validate()?;
                println!(
                    "✓ {} ({} on {}, qty {})",
                    definition.id,
                    definition.kind.name(),
                    definition.symbol,
                    definition.quantity
                );
            }
            println!("{} strategies valid", definitions.len());
            Ok(())
        }
        Commands::Run { strategies, seed } => {
            let config = EngineConfig::load_from(&cli.config_dir)
                .with_context(|| format!("loading config from {}", cli.config_dir.display()))?;
            let definitions = load_strategies(&strategies)?;
            run(config, definitions, seed).await
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stockbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_strategies(path: &Path) -> Result<Vec<StrategyDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading strategies from {}", path.display()))?;
    let definitions: Vec<StrategyDefinition> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing strategies in {}", path.display()))?;
    Ok(definitions)
}

async fn run(config: EngineConfig, definitions: Vec<StrategyDefinition>, seed: u64) -> Result<()> {
    tracing::info!("🚀 Stockbot starting with {} strategies", definitions.len());

    let symbols: BTreeSet<String> = definitions.iter().map(|d| d.symbol.clone()).collect();
    let market = Arc::new(PaperMarket::new());
    let mut rng = StdRng::seed_from_u64(seed);
    let mut quotes = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let history = random_walk(&mut rng, BASE_PRICE, HISTORY_DAYS);
        let last = history.last().copied().unwrap_or(BASE_PRICE);
        market.set_history(&symbol, history);
        quotes.push((symbol, last));
    }
    let feed = spawn_price_feed(market.clone(), quotes, config.poll_interval(), rng);

    let broker = Arc::new(PaperBroker::new());
    let source: Arc<dyn MarketDataSource> = market;
    let engine =
        StrategyEngine::start(config, source, broker).context("starting strategy engine")?;

    let mut handles = Vec::new();
    for definition in definitions {
        let id = definition.id.clone();
        match engine.submit(definition) {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::error!("❌ Strategy {} not submitted: {}", id, e),
        }
    }

    let wait_all = async {
        for handle in &handles {
            if let Ok(state) = engine.wait_for(*handle).await {
                tracing::info!(
                    strategy_id = %state.strategy_id,
                    status = ?state.status,
                    polls = state.polls,
                    "Strategy done"
                );
            }
        }
    };

    tokio::select! {
        _ = wait_all => tracing::info!("All strategies finished"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received, shutting down"),
    }

    engine.shutdown().await;
    feed.abort();

    for handle in &handles {
        if let Ok(state) = engine.status(*handle) {
            println!(
                "{:<24} {:<10} {:?} polls={} orders={}",
                state.strategy_id,
                state.symbol,
                state.status,
                state.polls,
                state.orders.len()
            );
        }
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&engine.ledger_snapshot())
            .context("serializing trade ledger")?
    );

    Ok(())
}

/// Geometric random walk with ±2% daily moves
fn random_walk(rng: &mut StdRng, start: f64, len: usize) -> Vec<f64> {
    let mut price = start;
    (0..len)
        .map(|_| {
            price *= 1.0 + rng.gen_range(-0.02..0.02);
            price
        })
        .collect()
}

/// Publish a fresh quote for every symbol each poll interval
///
/// The quote replaces the previous one, so every strategy on a symbol reads
/// the same latest price. Each quote is also recorded as a close so the
/// averages move at paper speed.
fn spawn_price_feed(
    market: Arc<PaperMarket>,
    mut quotes: Vec<(String, f64)>,
    period: Duration,
    mut rng: StdRng,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for (symbol, price) in &quotes {
            market.set_price(symbol, *price);
        }

        let mut interval = interval_at(Instant::now() + period / 2, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            for (symbol, price) in quotes.iter_mut() {
                *price *= 1.0 + rng.gen_range(-0.01..0.012);
                market.set_price(symbol, *price);
                market.record_close(symbol, *price);
            }
            tracing::trace!(at = %Utc::now(), "Paper quotes pushed");
        }
    })
}
