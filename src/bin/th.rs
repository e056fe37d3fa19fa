use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

use tapehouse::backtest::{
    create_strategy, list_strategies, BacktestConfig, BacktestEngine, ExecutionConfig,
};
use tapehouse::capture::{ForwardFiller, Listener, ListenerConfig};
use tapehouse::data::{BatchWriter, SqliteStore};
use tapehouse::types::Venue;
use tapehouse::venue::auth::RequestSigner;
use tapehouse::venue::kalshi::{KalshiDiscovery, KalshiStream};
use tapehouse::venue::polymarket::{PolymarketDiscovery, PolymarketStream};
use tapehouse::venue::{MarketDiscovery, MarketStream};

#[derive(Parser)]
#[command(name = "th", about = "tapehouse -- record prediction market tape, replay it honestly")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run live capture for every active listener in the database
    Capture {
        /// Path to the capture database
        #[arg(long)]
        db: String,

        /// Seed listeners from a JSON file before starting
        #[arg(long)]
        listeners: Option<String>,
    },

    /// Replay recorded data through a strategy
    Backtest {
        /// Path to the capture database
        #[arg(long)]
        db: String,

        /// Strategy to run
        #[arg(short, long, default_value = "inside_quoter")]
        strategy: String,

        /// Asset the strategy trades
        #[arg(long)]
        asset: String,

        /// Start of the replay window (ms since epoch)
        #[arg(long)]
        start_ms: i64,

        /// End of the replay window (ms since epoch)
        #[arg(long)]
        end_ms: i64,

        /// Restrict to one listener's data
        #[arg(long)]
        listener: Option<String>,

        /// Starting cash
        #[arg(long, default_value = "10000")]
        initial_cash: Decimal,

        /// Replay forward-filled heartbeat snapshots too
        #[arg(long)]
        include_forward_filled: bool,

        /// Maker fee in basis points
        #[arg(long, default_value = "0")]
        maker_fee_bps: u32,

        /// Taker fee in basis points
        #[arg(long, default_value = "0")]
        taker_fee_bps: u32,

        /// Queue fill probability (1.0 = deterministic)
        #[arg(long, default_value = "1.0")]
        fill_probability: f64,

        /// RNG seed for probabilistic fills
        #[arg(long)]
        seed: Option<u64>,

        /// Order size / quote size for the strategy
        #[arg(long, default_value = "10")]
        size: Decimal,

        /// Minimum spread before quoting (inside_quoter)
        #[arg(long, default_value = "0.02")]
        min_spread: Decimal,

        /// Export equity curve to CSV
        #[arg(long)]
        equity_csv: Option<String>,
    },

    /// List available strategies
    Strategies,
}

/// Exit codes: 0 normal, 1 configuration error, 2 connection/IO error.
enum CliError {
    Config(anyhow::Error),
    Io(anyhow::Error),
}

impl CliError {
    fn code(&self) -> u8 {
        match self {
            CliError::Config(_) => 1,
            CliError::Io(_) => 2,
        }
    }

    fn message(&self) -> &anyhow::Error {
        match self {
            CliError::Config(err) | CliError::Io(err) => err,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Capture { db, listeners } => cmd_capture(db, listeners).await,
        Commands::Backtest {
            db,
            strategy,
            asset,
            start_ms,
            end_ms,
            listener,
            initial_cash,
            include_forward_filled,
            maker_fee_bps,
            taker_fee_bps,
            fill_probability,
            seed,
            size,
            min_spread,
            equity_csv,
        } => cmd_backtest(BacktestArgs {
            db,
            strategy,
            asset,
            start_ms,
            end_ms,
            listener,
            initial_cash,
            include_forward_filled,
            maker_fee_bps,
            taker_fee_bps,
            fill_probability,
            seed,
            size,
            min_spread,
            equity_csv,
        }),
        Commands::Strategies => {
            cmd_strategies();
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err.message());
            ExitCode::from(err.code())
        }
    }
}

// ---------------------------------------------------------------------
// capture
// ---------------------------------------------------------------------

async fn cmd_capture(db: String, listeners_file: Option<String>) -> Result<(), CliError> {
    let store = SqliteStore::open(&PathBuf::from(&db)).map_err(CliError::Io)?;
    store.init().map_err(CliError::Io)?;
    let store = Arc::new(store);

    if let Some(path) = listeners_file {
        seed_listeners(&store, &path).map_err(CliError::Config)?;
    }

    let configs = store.load_active_listeners().map_err(CliError::Io)?;
    if configs.is_empty() {
        return Err(CliError::Config(anyhow!(
            "no active listeners in {db}; seed some with --listeners"
        )));
    }

    let mut listeners: Vec<Arc<Listener>> = Vec::new();
    for config in configs {
        let listener = build_listener(&store, config).map_err(CliError::Config)?;
        listener.start().await.map_err(CliError::Io)?;
        listeners.push(listener);
    }
    println!("capturing with {} listener(s); ctrl-c to stop", listeners.len());

    tokio::signal::ctrl_c().await.map_err(|e| CliError::Io(e.into()))?;
    println!("shutting down...");
    for listener in &listeners {
        listener.stop().await;
    }
    Ok(())
}

fn seed_listeners(store: &SqliteStore, path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read listeners file {path}"))?;
    let configs: Vec<ListenerConfig> =
        serde_json::from_str(&raw).context("listeners file is not a JSON array of listeners")?;
    for config in &configs {
        store.upsert_listener(config)?;
    }
    println!("seeded {} listener(s) from {path}", configs.len());
    Ok(())
}

fn build_listener(store: &Arc<SqliteStore>, config: ListenerConfig) -> Result<Arc<Listener>> {
    let writer = Arc::new(BatchWriter::new(Arc::clone(store), &config.id));
    let forward_filler = config.enable_forward_fill.then(|| {
        Arc::new(ForwardFiller::new(
            &config.id,
            config.emit_interval_ms,
            Arc::clone(&writer),
        ))
    });

    let (discovery, stream): (Arc<dyn MarketDiscovery>, Arc<dyn MarketStream>) = match config.venue
    {
        Venue::Polymarket => (
            Arc::new(PolymarketDiscovery::new()),
            Arc::new(PolymarketStream::new(&config.id)),
        ),
        Venue::Kalshi => {
            let signer = Arc::new(kalshi_signer_from_env()?);
            (
                Arc::new(KalshiDiscovery::new(Arc::clone(&signer))),
                Arc::new(KalshiStream::new(&config.id, signer)),
            )
        }
    };

    Ok(Arc::new(Listener::new(
        config,
        discovery,
        stream,
        Arc::clone(store),
        writer,
        forward_filler,
    )))
}

fn kalshi_signer_from_env() -> Result<RequestSigner> {
    let api_key = std::env::var("KALSHI_API_KEY")
        .context("KALSHI_API_KEY is required for kalshi listeners")?;
    let pem = match std::env::var("KALSHI_PRIVATE_KEY_PEM") {
        Ok(pem) => pem,
        Err(_) => {
            let path = std::env::var("KALSHI_PRIVATE_KEY_PATH")
                .context("set KALSHI_PRIVATE_KEY_PEM or KALSHI_PRIVATE_KEY_PATH")?;
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read private key at {path}"))?
        }
    };
    RequestSigner::from_pem(&api_key, &pem).map_err(|err| anyhow!(err))
}

// ---------------------------------------------------------------------
// backtest
// ---------------------------------------------------------------------

struct BacktestArgs {
    db: String,
    strategy: String,
    asset: String,
    start_ms: i64,
    end_ms: i64,
    listener: Option<String>,
    initial_cash: Decimal,
    include_forward_filled: bool,
    maker_fee_bps: u32,
    taker_fee_bps: u32,
    fill_probability: f64,
    seed: Option<u64>,
    size: Decimal,
    min_spread: Decimal,
    equity_csv: Option<String>,
}

fn cmd_backtest(args: BacktestArgs) -> Result<(), CliError> {
    let mut strategy = create_strategy(&args.strategy, &args.asset, args.size, args.min_spread)
        .ok_or_else(|| {
            let names: Vec<&str> = list_strategies().iter().map(|(name, _)| *name).collect();
            CliError::Config(anyhow!(
                "unknown strategy '{}'; available: {}",
                args.strategy,
                names.join(", ")
            ))
        })?;

    let mut config = BacktestConfig::new(args.start_ms, args.end_ms);
    config.asset_ids = Some(vec![args.asset.clone()]);
    config.listener_id = args.listener.clone();
    config.initial_cash = args.initial_cash;
    config.include_forward_filled = args.include_forward_filled;
    config.maker_fee_bps = args.maker_fee_bps;
    config.taker_fee_bps = args.taker_fee_bps;
    config.validate().map_err(|e| CliError::Config(e.into()))?;

    let execution_config = ExecutionConfig {
        fill_probability: args.fill_probability,
        seed: args.seed,
        ..ExecutionConfig::default()
    };
    execution_config
        .validate()
        .map_err(|e| CliError::Config(e.into()))?;

    let store = SqliteStore::open(&PathBuf::from(&args.db)).map_err(CliError::Io)?;
    let engine = BacktestEngine::new(config, execution_config);
    let result = engine
        .run(Arc::new(store), strategy.as_mut())
        .map_err(CliError::Io)?;

    tapehouse::report::print_summary(&result);

    if let Some(path) = args.equity_csv {
        tapehouse::report::export_equity_csv(&result.equity_curve, &PathBuf::from(&path))
            .map_err(CliError::Io)?;
        println!("equity curve exported to {path}");
    }
    Ok(())
}

fn cmd_strategies() {
    println!();
    println!("Available strategies:");
    println!();
    for (name, description) in list_strategies() {
        println!("  {name:<16} {description}");
    }
    println!();
}
