//! Deterministic replay: matching, portfolio accounting, and metrics.

pub mod config;
pub mod engine;
pub mod execution;
pub mod market_pair;
pub mod metrics;
pub mod order;
pub mod portfolio;
pub mod position;
pub mod queue_sim;
pub mod strategy;

pub use config::{BacktestConfig, BacktestResult, ExecutionConfig, FeeSchedule};
pub use engine::BacktestEngine;
pub use execution::ExecutionEngine;
pub use market_pair::{MarketPair, MarketPairRegistry};
pub use metrics::{EquityPoint, MetricsCollector, MetricsSummary, TradeRecord};
pub use order::{
    Fill, FillReason, Order, OrderSide, OrderStatus, OrderType, RejectReason, TimeInForce,
};
pub use portfolio::{Portfolio, PortfolioView};
pub use position::{MarketPosition, Position};
pub use queue_sim::QueueSimulator;
pub use strategy::{
    create_strategy, list_strategies, BacktestContext, BuyAndHold, InsideQuoter, Strategy,
    StrategyCtx,
};
