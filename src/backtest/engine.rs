//! The replay driver: merged events in, `BacktestResult` out.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::data::loader::{BacktestDataset, DataLoader, EventKind};
use crate::data::store::SqliteStore;
use crate::types::{OrderbookSnapshot, Trade};

use super::config::{BacktestConfig, BacktestResult, ExecutionConfig, FeeSchedule};
use super::execution::ExecutionEngine;
use super::market_pair::MarketPairRegistry;
use super::metrics::MetricsCollector;
use super::portfolio::{Portfolio, PortfolioView};
use super::strategy::{BacktestContext, Strategy, StrategyCtx};

const PROGRESS_LOG_INTERVAL: usize = 10_000;
const EQUITY_SAMPLE_INTERVAL_MS: i64 = 60_000;

pub struct BacktestEngine {
    config: BacktestConfig,
    execution_config: ExecutionConfig,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig, execution_config: ExecutionConfig) -> Self {
        Self {
            config,
            execution_config,
        }
    }

    /// Load data from the store and replay it against the strategy.
    pub fn run(&self, store: Arc<SqliteStore>, strategy: &mut dyn Strategy) -> Result<BacktestResult> {
        self.execution_config.validate()?;
        let dataset = DataLoader::new(store).load(&self.config)?;
        Ok(self.run_dataset(&dataset, strategy))
    }

    /// Replay an already-loaded dataset. An empty dataset still produces
    /// a completed (all-zero) result.
    pub fn run_dataset(&self, dataset: &BacktestDataset, strategy: &mut dyn Strategy) -> BacktestResult {
        info!(
            strategy = strategy.name(),
            initial_cash = %self.config.initial_cash,
            total_events = dataset.total_events(),
            "backtest starting"
        );

        let pairs = Arc::new(MarketPairRegistry::from_markets(dataset.markets.values()));
        let mut portfolio = Portfolio::new(self.config.initial_cash, Some(Arc::clone(&pairs)));
        let fees = FeeSchedule::new(self.config.maker_fee_bps, self.config.taker_fee_bps);
        let mut engine = ExecutionEngine::new(fees, self.execution_config.clone(), Some(pairs));
        let mut metrics =
            MetricsCollector::new(self.config.initial_cash, EQUITY_SAMPLE_INTERVAL_MS);

        let context = BacktestContext {
            start_time_ms: dataset.start_time_ms,
            end_time_ms: dataset.end_time_ms,
            initial_cash: self.config.initial_cash,
            venue: self.config.venue,
            markets: dataset.markets.clone(),
        };

        if let Err(err) = strategy.on_start(&context) {
            error!(error = %err, "strategy on_start failed");
        }

        let mut last_prices: HashMap<String, Decimal> = HashMap::new();
        let mut event_count = 0usize;

        for event in dataset.events() {
            event_count += 1;
            if event_count % PROGRESS_LOG_INTERVAL == 0 {
                info!(events_processed = event_count, "backtest progress");
            }

            match event.kind {
                EventKind::Orderbook(snapshot) => {
                    if let Some(mid) = snapshot.mid_price {
                        last_prices.insert(snapshot.asset_id.clone(), mid);
                    }
                    Self::process_orderbook(
                        snapshot,
                        &mut engine,
                        &mut portfolio,
                        &mut metrics,
                        strategy,
                    );
                }
                EventKind::Trade(trade) => {
                    Self::process_trade(trade, &mut engine, &mut portfolio, &mut metrics, strategy);
                }
            }

            // Periodic equity sampling, independent of fills.
            if self.config.equity_sample_interval_events > 0
                && event_count % self.config.equity_sample_interval_events == 0
                && !last_prices.is_empty()
            {
                metrics.record_equity_point(event.timestamp_ms, &mut portfolio, &last_prices);
            }
        }

        if !last_prices.is_empty() {
            metrics.record_equity_point(dataset.end_time_ms, &mut portfolio, &last_prices);
        }

        info!(total_events = event_count, "event loop complete");

        if let Err(err) = strategy.on_end(&context) {
            error!(error = %err, "strategy on_end failed");
        }

        let result = self.build_result(strategy.name(), &portfolio, &metrics, event_count);
        info!(
            strategy = strategy.name(),
            final_equity = result.final_equity,
            total_return = result.total_return,
            num_trades = result.num_trades,
            "backtest complete"
        );
        result
    }

    /// Snapshot path, ordered to avoid lookahead: match first, then mark,
    /// then notify.
    fn process_orderbook(
        snapshot: &OrderbookSnapshot,
        engine: &mut ExecutionEngine,
        portfolio: &mut Portfolio,
        metrics: &mut MetricsCollector,
        strategy: &mut dyn Strategy,
    ) {
        let fills = engine.process_orderbook_update(snapshot, portfolio);

        if let Some(mid) = snapshot.mid_price {
            let prices: HashMap<String, Decimal> =
                [(snapshot.asset_id.clone(), mid)].into_iter().collect();
            portfolio.update_mark_prices(&prices);
        }

        for fill in &fills {
            metrics.record_fill(fill, portfolio);
            if let Err(err) = strategy.on_fill(fill) {
                error!(error = %err, fill_id = %fill.fill_id, "strategy on_fill failed");
            }
        }

        let mut ctx = StrategyCtx { engine, portfolio };
        if let Err(err) = strategy.on_orderbook(snapshot, snapshot.is_forward_filled, &mut ctx) {
            error!(
                error = %err,
                asset_id = %snapshot.asset_id,
                timestamp = snapshot.timestamp,
                "strategy on_orderbook failed"
            );
        }
    }

    fn process_trade(
        trade: &Trade,
        engine: &mut ExecutionEngine,
        portfolio: &mut Portfolio,
        metrics: &mut MetricsCollector,
        strategy: &mut dyn Strategy,
    ) {
        let fills = engine.process_trade(trade, portfolio);

        for fill in &fills {
            metrics.record_fill(fill, portfolio);
            if let Err(err) = strategy.on_fill(fill) {
                error!(error = %err, fill_id = %fill.fill_id, "strategy on_fill failed");
            }
        }

        let mut ctx = StrategyCtx { engine, portfolio };
        if let Err(err) = strategy.on_trade(trade, &mut ctx) {
            error!(
                error = %err,
                asset_id = %trade.asset_id,
                timestamp = trade.timestamp,
                "strategy on_trade failed"
            );
        }
    }

    fn build_result(
        &self,
        strategy_name: &str,
        portfolio: &Portfolio,
        metrics: &MetricsCollector,
        events_processed: usize,
    ) -> BacktestResult {
        let summary = metrics.calculate();
        let final_equity = portfolio.total_value().to_f64().unwrap_or(0.0);
        let initial_cash = self.config.initial_cash.to_f64().unwrap_or(0.0);
        let total_return = if initial_cash > 0.0 {
            (final_equity - initial_cash) / initial_cash
        } else {
            0.0
        };

        let equity_curve: Vec<(i64, f64)> = metrics
            .equity_curve()
            .iter()
            .map(|p| (p.timestamp_ms, p.equity.to_f64().unwrap_or(0.0)))
            .collect();
        let drawdown_curve = Self::drawdown_curve(&equity_curve);

        BacktestResult {
            strategy_name: strategy_name.to_string(),
            total_return,
            annualized_return_pct: summary.annualized_return_pct,
            sharpe_ratio: summary.sharpe_ratio,
            sortino_ratio: summary.sortino_ratio,
            max_drawdown: summary.max_drawdown_pct / 100.0,
            max_drawdown_duration_ms: summary.max_drawdown_duration_ms,
            win_rate: summary.win_rate,
            profit_factor: summary.profit_factor,
            expectancy: summary.expectancy,
            num_trades: summary.num_trades,
            num_winning_trades: summary.num_winning_trades,
            num_losing_trades: summary.num_losing_trades,
            avg_win: summary.avg_win,
            avg_loss: summary.avg_loss,
            avg_trade_pnl: summary.avg_trade_pnl,
            total_fees_paid: summary.total_fees,
            fees_pct_of_volume: summary.fees_pct_of_volume,
            equity_curve,
            drawdown_curve,
            final_equity,
            events_processed,
        }
    }

    /// Drawdown at each point: `(equity - running_max) / running_max`,
    /// a non-positive fraction.
    fn drawdown_curve(equity_curve: &[(i64, f64)]) -> Vec<(i64, f64)> {
        let mut running_max = f64::MIN;
        equity_curve
            .iter()
            .map(|(ts, equity)| {
                running_max = running_max.max(*equity);
                let dd = if running_max > 0.0 {
                    (equity - running_max) / running_max
                } else {
                    0.0
                };
                (*ts, dd)
            })
            .collect()
    }
}


/// End-to-end scenarios: rows written through the batch writer come
/// back out of the replay engine with correct accounting.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;

    use anyhow::Result;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::backtest::{
        BacktestConfig, BacktestEngine, ExecutionConfig, InsideQuoter, Order, OrderSide,
        OrderStatus, Strategy, StrategyCtx, TimeInForce,
    };
    use crate::data::{BatchWriter, SchemaCaps, SqliteStore};
    use crate::types::{Market, OrderbookSnapshot, PriceLevel, Trade, TradeSide, Venue};

    fn snapshot(
        asset: &str,
        ts: i64,
        bids: &[(&str, &str)],
        asks: &[(&str, &str)],
    ) -> OrderbookSnapshot {
        let to_levels = |levels: &[(&str, &str)]| {
            levels
                .iter()
                .map(|(p, s)| PriceLevel::new(p.parse().unwrap(), s.parse().unwrap()))
                .collect()
        };
        let mut snap =
            OrderbookSnapshot::new("l1", asset, "mkt", ts, to_levels(bids), to_levels(asks));
        snap.venue = Some(Venue::Polymarket);
        snap
    }

    fn tape(asset: &str, ts: i64, price: &str, size: &str) -> Trade {
        Trade {
            listener_id: "l1".to_string(),
            asset_id: asset.to_string(),
            market: "mkt".to_string(),
            timestamp: ts,
            price: price.parse().unwrap(),
            size: size.parse().unwrap(),
            side: TradeSide::Sell,
            fee_rate_bps: None,
            venue: Some(Venue::Polymarket),
        }
    }

    fn outcome_market(condition: &str, token: &str, outcome: &str, index: i64) -> Market {
        let mut market = Market::new("l1", condition, token, Venue::Polymarket);
        market.outcome = Some(outcome.to_string());
        market.outcome_index = Some(index);
        market.question = Some("integration".to_string());
        market
    }

    fn seeded_store() -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        Arc::new(store)
    }

    fn backtest_config(asset: &str, start: i64, end: i64) -> BacktestConfig {
        let mut config = BacktestConfig::new(start, end);
        config.asset_ids = Some(vec![asset.to_string()]);
        config
    }

    #[test]
    fn test_full_pipeline_market_buy_walks_levels() {
        let store = seeded_store();
        store
            .upsert_market(&Market::new("l1", "tok", "tok", Venue::Kalshi))
            .unwrap();

        // Persist through the batch writer, exactly as live capture would.
        let writer = BatchWriter::with_tuning(Arc::clone(&store), "l1", 10, 60_000);
        writer.write_snapshot(snapshot(
            "tok",
            1_000,
            &[("0.54", "100")],
            &[("0.56", "50"), ("0.57", "100")],
        ));
        writer.flush();

        struct MarketBuyer {
            done: bool,
        }
        impl Strategy for MarketBuyer {
            fn name(&self) -> &str {
                "market_buyer"
            }
            fn on_orderbook(
                &mut self,
                snapshot: &OrderbookSnapshot,
                _ff: bool,
                ctx: &mut StrategyCtx<'_>,
            ) -> Result<()> {
                if !self.done {
                    let order = Order::market(
                        &snapshot.asset_id,
                        OrderSide::Buy,
                        dec!(80),
                        TimeInForce::Gtc,
                    )?;
                    let id = ctx.submit_order(order);
                    let order = ctx.open_orders(None);
                    assert!(order.is_empty(), "market order should be terminal");
                    assert_eq!(ctx.order_status(&id), Some(OrderStatus::Filled));
                    self.done = true;
                }
                Ok(())
            }
        }

        let engine = BacktestEngine::new(
            backtest_config("tok", 0, 10_000),
            ExecutionConfig::default(),
        );
        let mut strategy = MarketBuyer { done: false };
        let result = engine.run(Arc::clone(&store), &mut strategy).unwrap();

        // 50 @ 0.56 + 30 @ 0.57 = 45.10 spent; marked back at mid 0.55.
        let expected = 10_000.0 - 45.10 + 80.0 * 0.55;
        assert!((result.final_equity - expected).abs() < 1e-9);
    }

    #[test]
    fn test_forward_filled_rows_excluded_unless_requested() {
        let store = seeded_store();
        store
            .upsert_market(&Market::new("l1", "tok", "tok", Venue::Kalshi))
            .unwrap();

        let mut synthetic = snapshot("tok", 2_000, &[("0.54", "10")], &[("0.56", "10")]);
        synthetic.is_forward_filled = true;
        synthetic.source_timestamp = Some(1_000);
        store
            .insert_snapshot_rows(
                &[
                    snapshot("tok", 1_000, &[("0.54", "10")], &[("0.56", "10")]),
                    synthetic,
                ],
                SchemaCaps::default(),
            )
            .unwrap();

        struct CountingStrategy {
            real: usize,
            synthetic: usize,
        }
        impl Strategy for CountingStrategy {
            fn name(&self) -> &str {
                "counting"
            }
            fn on_orderbook(
                &mut self,
                _s: &OrderbookSnapshot,
                is_forward_filled: bool,
                _ctx: &mut StrategyCtx<'_>,
            ) -> Result<()> {
                if is_forward_filled {
                    self.synthetic += 1;
                } else {
                    self.real += 1;
                }
                Ok(())
            }
        }

        let engine = BacktestEngine::new(
            backtest_config("tok", 0, 10_000),
            ExecutionConfig::default(),
        );
        let mut strategy = CountingStrategy { real: 0, synthetic: 0 };
        engine.run(Arc::clone(&store), &mut strategy).unwrap();
        assert_eq!((strategy.real, strategy.synthetic), (1, 0));

        let mut config = backtest_config("tok", 0, 10_000);
        config.include_forward_filled = true;
        let engine = BacktestEngine::new(config, ExecutionConfig::default());
        let mut strategy = CountingStrategy { real: 0, synthetic: 0 };
        engine.run(Arc::clone(&store), &mut strategy).unwrap();
        assert_eq!((strategy.real, strategy.synthetic), (1, 1));
    }

    #[test]
    fn test_complement_conversion_end_to_end() {
        let store = seeded_store();
        store
            .upsert_market(&outcome_market("cond", "Y", "Yes", 0))
            .unwrap();
        store
            .upsert_market(&outcome_market("cond", "N", "No", 1))
            .unwrap();
        store
            .insert_snapshot_rows(
                &[
                    snapshot("Y", 1_000, &[("0.59", "50")], &[("0.61", "50")]),
                    snapshot("N", 1_000, &[("0.39", "50")], &[("0.40", "50")]),
                ],
                SchemaCaps::default(),
            )
            .unwrap();

        struct ShortSeller {
            done: bool,
        }
        impl Strategy for ShortSeller {
            fn name(&self) -> &str {
                "short_seller"
            }
            fn on_orderbook(
                &mut self,
                snapshot: &OrderbookSnapshot,
                _ff: bool,
                ctx: &mut StrategyCtx<'_>,
            ) -> Result<()> {
                // Sell Yes with no position: must become a No buy at 1-p.
                if !self.done && snapshot.asset_id == "N" {
                    let order =
                        Order::limit("Y", OrderSide::Sell, dec!(0.60), dec!(10), TimeInForce::Gtc)?;
                    let id = ctx.submit_order(order);
                    let rewritten = ctx.open_orders(None);
                    // Converted and immediately marketable against N's ask.
                    assert!(rewritten.is_empty());
                    assert_eq!(ctx.order_status(&id), Some(OrderStatus::Filled));
                    self.done = true;
                }
                Ok(())
            }
        }

        let mut config = BacktestConfig::new(0, 10_000);
        config.asset_ids = Some(vec!["Y".to_string(), "N".to_string()]);
        let engine = BacktestEngine::new(config, ExecutionConfig::default());
        let mut strategy = ShortSeller { done: false };
        let result = engine.run(Arc::clone(&store), &mut strategy).unwrap();

        // Bought 10 N at 0.40; marked at N's mid 0.395 and Y untouched.
        let expected = 10_000.0 - 4.0 + 10.0 * 0.395;
        assert!((result.final_equity - expected).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_probabilistic_runs_reproducible() {
        let store = seeded_store();
        store
            .upsert_market(&Market::new("l1", "tok", "tok", Venue::Kalshi))
            .unwrap();

        let mut snapshots = Vec::new();
        let mut trades = Vec::new();
        for i in 0..20i64 {
            snapshots.push(snapshot(
                "tok",
                1_000 + i * 1_000,
                &[("0.50", "20")],
                &[("0.60", "20")],
            ));
            trades.push(tape("tok", 1_500 + i * 1_000, "0.50", "25"));
        }
        store
            .insert_snapshot_rows(&snapshots, SchemaCaps::default())
            .unwrap();
        store
            .insert_trade_rows(&trades, SchemaCaps::default())
            .unwrap();

        let run = |seed: u64| {
            let execution = ExecutionConfig {
                fill_probability: 0.5,
                seed: Some(seed),
                ..ExecutionConfig::default()
            };
            let engine = BacktestEngine::new(backtest_config("tok", 0, 60_000), execution);
            let mut strategy = InsideQuoter::new("tok", dec!(5), dec!(0.02));
            engine.run(Arc::clone(&store), &mut strategy).unwrap()
        };

        let first = run(42);
        let second = run(42);
        assert_eq!(first.final_equity, second.final_equity);
        assert_eq!(first.num_trades, second.num_trades);
        assert_eq!(first.equity_curve, second.equity_curve);
    }

    #[test]
    fn test_cash_conservation_across_replayed_fills() {
        let store = seeded_store();
        store
            .upsert_market(&Market::new("l1", "tok", "tok", Venue::Kalshi))
            .unwrap();
        store
            .insert_snapshot_rows(
                &[
                    snapshot("tok", 1_000, &[("0.50", "30")], &[("0.60", "30")]),
                    snapshot("tok", 5_000, &[("0.50", "30")], &[("0.60", "30")]),
                ],
                SchemaCaps::default(),
            )
            .unwrap();
        store
            .insert_trade_rows(
                &[
                    tape("tok", 2_000, "0.50", "40"),
                    tape("tok", 6_000, "0.60", "80"),
                ],
                SchemaCaps::default(),
            )
            .unwrap();

        /// Tracks every fill to reconcile cash by hand.
        struct Auditor {
            quoter: InsideQuoter,
            signed_notional: Decimal,
            fees: Decimal,
        }
        impl Strategy for Auditor {
            fn name(&self) -> &str {
                "auditor"
            }
            fn on_orderbook(
                &mut self,
                snapshot: &OrderbookSnapshot,
                ff: bool,
                ctx: &mut StrategyCtx<'_>,
            ) -> Result<()> {
                self.quoter.on_orderbook(snapshot, ff, ctx)
            }
            fn on_fill(&mut self, fill: &crate::backtest::Fill) -> Result<()> {
                let notional = fill.price * fill.quantity;
                match fill.side {
                    OrderSide::Buy => self.signed_notional += notional,
                    OrderSide::Sell => self.signed_notional -= notional,
                }
                self.fees += fill.fees;
                Ok(())
            }
        }

        let mut config = backtest_config("tok", 0, 60_000);
        config.maker_fee_bps = 50;
        config.taker_fee_bps = 150;
        let engine = BacktestEngine::new(config, ExecutionConfig::default());
        let mut strategy = Auditor {
            quoter: InsideQuoter::new("tok", dec!(5), dec!(0.02)),
            signed_notional: Decimal::ZERO,
            fees: Decimal::ZERO,
        };
        let result = engine.run(Arc::clone(&store), &mut strategy).unwrap();

        // cash + sum(signed notional) + sum(fees) == initial cash. The
        // position is flat at the end (bought 5, sold 5), so final equity
        // is exactly the cash balance.
        let signed_notional = strategy.signed_notional.to_f64().unwrap();
        let fees = strategy.fees.to_f64().unwrap();
        assert!((result.final_equity + signed_notional + fees - 10_000.0).abs() < 1e-9);
    }
}
