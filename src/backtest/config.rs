//! Backtest configuration, fee schedules, and the run result.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::Venue;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("start_time_ms ({0}) must be less than end_time_ms ({1})")]
    EmptyTimeRange(i64, i64),
    #[error("initial_cash must be positive")]
    NonPositiveCash,
    #[error("either asset_ids or listener_id must define the backtest scope")]
    NoScope,
    #[error("max_events_in_memory must be positive")]
    ZeroEventBudget,
    #[error("fill_probability must be within [0, 1], got {0}")]
    BadFillProbability(f64),
}

/// What to replay and under which account assumptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub venue: Option<Venue>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    /// Explicit asset scope; when absent, resolved from `listener_id`.
    pub asset_ids: Option<Vec<String>>,
    pub listener_id: Option<String>,
    pub initial_cash: Decimal,
    pub include_forward_filled: bool,
    pub maker_fee_bps: u32,
    pub taker_fee_bps: u32,
    /// Soft safety limit; exceeding it only warns.
    pub max_events_in_memory: usize,
    /// Sample equity every N replay events.
    pub equity_sample_interval_events: usize,
}

impl BacktestConfig {
    pub fn new(start_time_ms: i64, end_time_ms: i64) -> Self {
        Self {
            venue: None,
            start_time_ms,
            end_time_ms,
            asset_ids: None,
            listener_id: None,
            initial_cash: dec!(10000),
            include_forward_filled: false,
            maker_fee_bps: 0,
            taker_fee_bps: 0,
            max_events_in_memory: 5_000_000,
            equity_sample_interval_events: 5_000,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_time_ms >= self.end_time_ms {
            return Err(ConfigError::EmptyTimeRange(self.start_time_ms, self.end_time_ms));
        }
        if self.initial_cash <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveCash);
        }
        if self.asset_ids.is_none() && self.listener_id.is_none() {
            return Err(ConfigError::NoScope);
        }
        if self.max_events_in_memory == 0 {
            return Err(ConfigError::ZeroEventBudget);
        }
        Ok(())
    }
}

/// Execution-engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Probability a queue-eligible order actually fills. 1.0 is
    /// deterministic; anything lower draws per eligibility check.
    pub fill_probability: f64,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    /// Resting orders older than this are cancelled; `None` never expires.
    pub order_max_age_ms: Option<i64>,
    /// RNG seed for reproducible probabilistic fills.
    pub seed: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fill_probability: 1.0,
            min_order_size: dec!(0.1),
            max_order_size: dec!(100000),
            order_max_age_ms: None,
            seed: None,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fill_probability) {
            return Err(ConfigError::BadFillProbability(self.fill_probability));
        }
        Ok(())
    }
}

/// Maker/taker fee rates in basis points of notional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_fee_bps: u32,
    pub taker_fee_bps: u32,
}

impl FeeSchedule {
    pub fn new(maker_fee_bps: u32, taker_fee_bps: u32) -> Self {
        Self {
            maker_fee_bps,
            taker_fee_bps,
        }
    }

    pub fn fee(&self, quantity: Decimal, price: Decimal, is_maker: bool) -> Decimal {
        let bps = if is_maker {
            self.maker_fee_bps
        } else {
            self.taker_fee_bps
        };
        quantity * price * Decimal::from(bps) / dec!(10000)
    }

    /// Polymarket charges nothing on either side.
    pub fn polymarket() -> Self {
        Self::new(0, 0)
    }

    /// Kalshi's published maker/taker schedule.
    pub fn kalshi() -> Self {
        Self::new(50, 150)
    }
}

/// Everything a finished run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub total_return: f64,
    pub annualized_return_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Negative fraction (-0.05 = 5% drawdown from peak).
    pub max_drawdown: f64,
    pub max_drawdown_duration_ms: i64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub num_trades: usize,
    pub num_winning_trades: usize,
    pub num_losing_trades: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_trade_pnl: f64,
    pub total_fees_paid: f64,
    pub fees_pct_of_volume: f64,
    pub equity_curve: Vec<(i64, f64)>,
    pub drawdown_curve: Vec<(i64, f64)>,
    pub final_equity: f64,
    pub events_processed: usize,
}
