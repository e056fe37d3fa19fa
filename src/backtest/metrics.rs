//! Equity tracking, entry/exit trade pairing, and performance statistics.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::order::Fill;
use super::portfolio::{Portfolio, PortfolioView};

/// A paired entry and exit on one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub asset_id: String,
    /// Side of the entry ("buy" entries close with sells and vice versa).
    pub side: super::order::OrderSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub entry_time_ms: i64,
    pub exit_time_ms: i64,
    pub realized_pnl: Decimal,
    /// Entry fees attributed pro rata plus the exit fee share.
    pub fees: Decimal,
    pub is_winner: bool,
}

/// Portfolio equity at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp_ms: i64,
    pub equity: Decimal,
    pub cash: Decimal,
    pub position_value: Decimal,
}

/// Accumulates entry fills on one asset until an opposite-side fill
/// closes some or all of them.
#[derive(Debug)]
struct OpenTracker {
    side: super::order::OrderSide,
    total_quantity: Decimal,
    total_cost: Decimal,
    total_fees: Decimal,
    first_entry_time_ms: i64,
}

impl OpenTracker {
    fn avg_entry_price(&self) -> Decimal {
        if self.total_quantity == Decimal::ZERO {
            Decimal::ZERO
        } else {
            self.total_cost / self.total_quantity
        }
    }
}

/// Derived performance numbers. Floats are fine here: these are
/// statistics, not account state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown_duration_ms: i64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub num_trades: usize,
    pub num_winning_trades: usize,
    pub num_losing_trades: usize,
    pub avg_trade_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub total_fees: f64,
    pub fees_pct_of_volume: f64,
}

pub struct MetricsCollector {
    initial_cash: Decimal,
    equity_sample_interval_ms: i64,
    equity_curve: Vec<EquityPoint>,
    trade_log: Vec<TradeRecord>,
    open_trackers: HashMap<String, OpenTracker>,
    last_sample_ts: Option<i64>,
}

impl MetricsCollector {
    pub fn new(initial_cash: Decimal, equity_sample_interval_ms: i64) -> Self {
        Self {
            initial_cash,
            equity_sample_interval_ms,
            equity_curve: Vec::new(),
            trade_log: Vec::new(),
            open_trackers: HashMap::new(),
            last_sample_ts: None,
        }
    }

    /// Record a fill into the trade-pairing tracker and, if the sampling
    /// interval has elapsed, snapshot equity.
    pub fn record_fill(&mut self, fill: &Fill, portfolio: &Portfolio) {
        self.pair_fill(fill);

        let due = match self.last_sample_ts {
            None => true,
            Some(last) => fill.timestamp_ms - last >= self.equity_sample_interval_ms,
        };
        if due {
            self.sample_equity(fill.timestamp_ms, portfolio);
        }
    }

    /// Explicit equity snapshot: refresh marks, then sample.
    pub fn record_equity_point(
        &mut self,
        timestamp_ms: i64,
        portfolio: &mut Portfolio,
        prices: &HashMap<String, Decimal>,
    ) {
        portfolio.update_mark_prices(prices);
        self.sample_equity(timestamp_ms, portfolio);
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn trade_log(&self) -> &[TradeRecord] {
        &self.trade_log
    }

    /// Compute the full metric set from the equity curve and trade log.
    pub fn calculate(&self) -> MetricsSummary {
        let mut summary = MetricsSummary::default();
        self.return_metrics(&mut summary);
        self.risk_metrics(&mut summary);
        self.trade_metrics(&mut summary);
        info!(
            total_return_pct = summary.total_return_pct,
            sharpe = summary.sharpe_ratio,
            num_trades = summary.num_trades,
            "metrics calculated"
        );
        summary
    }

    // ------------------------------------------------------------------
    // Trade pairing
    // ------------------------------------------------------------------

    /// Same-side fills accumulate into the open tracker; opposite-side
    /// fills close against it, emitting a [`TradeRecord`] for the matched
    /// quantity. A close larger than the tracker flips the remainder into
    /// a fresh tracker on the other side.
    fn pair_fill(&mut self, fill: &Fill) {
        if !self.open_trackers.contains_key(&fill.asset_id) {
            self.open_trackers.insert(
                fill.asset_id.clone(),
                OpenTracker {
                    side: fill.side,
                    total_quantity: fill.quantity,
                    total_cost: fill.price * fill.quantity,
                    total_fees: fill.fees,
                    first_entry_time_ms: fill.timestamp_ms,
                },
            );
            return;
        }
        let tracker = self
            .open_trackers
            .get_mut(&fill.asset_id)
            .expect("presence checked above");

        if fill.side == tracker.side {
            tracker.total_quantity += fill.quantity;
            tracker.total_cost += fill.price * fill.quantity;
            tracker.total_fees += fill.fees;
            return;
        }

        let avg_entry = tracker.avg_entry_price();
        let entry_time = tracker.first_entry_time_ms;
        let entry_side = tracker.side;
        let close_qty = fill.quantity;

        if close_qty >= tracker.total_quantity {
            // Full close; any excess re-opens on the other side.
            let matched_qty = tracker.total_quantity;
            let remaining_qty = close_qty - matched_qty;

            let realized = match entry_side {
                super::order::OrderSide::Buy => (fill.price - avg_entry) * matched_qty,
                super::order::OrderSide::Sell => (avg_entry - fill.price) * matched_qty,
            };

            let entry_fees = tracker.total_fees;
            let exit_fees = if fill.quantity > Decimal::ZERO {
                fill.fees * (matched_qty / fill.quantity)
            } else {
                Decimal::ZERO
            };

            self.trade_log.push(TradeRecord {
                asset_id: fill.asset_id.clone(),
                side: entry_side,
                entry_price: avg_entry,
                exit_price: fill.price,
                quantity: matched_qty,
                entry_time_ms: entry_time,
                exit_time_ms: fill.timestamp_ms,
                realized_pnl: realized,
                fees: entry_fees + exit_fees,
                is_winner: realized > Decimal::ZERO,
            });

            self.open_trackers.remove(&fill.asset_id);

            if remaining_qty > Decimal::ZERO {
                self.open_trackers.insert(
                    fill.asset_id.clone(),
                    OpenTracker {
                        side: fill.side,
                        total_quantity: remaining_qty,
                        total_cost: fill.price * remaining_qty,
                        total_fees: fill.fees - exit_fees,
                        first_entry_time_ms: fill.timestamp_ms,
                    },
                );
            }
        } else {
            // Partial close: carve the matched slice out of the tracker.
            let realized = match entry_side {
                super::order::OrderSide::Buy => (fill.price - avg_entry) * close_qty,
                super::order::OrderSide::Sell => (avg_entry - fill.price) * close_qty,
            };

            let fee_fraction = if tracker.total_quantity > Decimal::ZERO {
                close_qty / tracker.total_quantity
            } else {
                Decimal::ZERO
            };
            let attributed_entry_fees = tracker.total_fees * fee_fraction;

            self.trade_log.push(TradeRecord {
                asset_id: fill.asset_id.clone(),
                side: entry_side,
                entry_price: avg_entry,
                exit_price: fill.price,
                quantity: close_qty,
                entry_time_ms: entry_time,
                exit_time_ms: fill.timestamp_ms,
                realized_pnl: realized,
                fees: attributed_entry_fees + fill.fees,
                is_winner: realized > Decimal::ZERO,
            });

            tracker.total_cost -= avg_entry * close_qty;
            tracker.total_quantity -= close_qty;
            tracker.total_fees -= attributed_entry_fees;
        }
    }

    fn sample_equity(&mut self, timestamp_ms: i64, portfolio: &Portfolio) {
        let equity = portfolio.total_value();
        let cash = portfolio.cash();
        self.equity_curve.push(EquityPoint {
            timestamp_ms,
            equity,
            cash,
            position_value: equity - cash,
        });
        self.last_sample_ts = Some(timestamp_ms);
    }

    // ------------------------------------------------------------------
    // Metric computation
    // ------------------------------------------------------------------

    fn return_metrics(&self, summary: &mut MetricsSummary) {
        if self.equity_curve.len() < 2 {
            return;
        }
        let initial: f64 = decimal_to_f64(self.initial_cash);
        if initial == 0.0 {
            return;
        }
        let last = self.equity_curve.last().expect("len checked");
        let first = self.equity_curve.first().expect("len checked");
        let final_equity = decimal_to_f64(last.equity);

        let total_return = (final_equity - initial) / initial;
        summary.total_return_pct = total_return * 100.0;

        // Prediction markets never close, so a year is 365 days of wall
        // clock, matching the sqrt(365) factor below.
        let elapsed_ms = last.timestamp_ms - first.timestamp_ms;
        let elapsed_years = elapsed_ms as f64 / (365.0 * 24.0 * 3600.0 * 1000.0);
        if elapsed_years > 0.0 && (1.0 + total_return) > 0.0 {
            summary.annualized_return_pct =
                ((1.0 + total_return).powf(1.0 / elapsed_years) - 1.0) * 100.0;
        }
    }

    fn risk_metrics(&self, summary: &mut MetricsSummary) {
        if self.equity_curve.len() < 2 {
            return;
        }
        let equity: Vec<f64> = self
            .equity_curve
            .iter()
            .map(|p| decimal_to_f64(p.equity))
            .collect();

        // Period-over-period returns, guarding zero equity.
        let returns: Vec<f64> = equity
            .windows(2)
            .map(|w| if w[0] == 0.0 { 0.0 } else { (w[1] - w[0]) / w[0] })
            .collect();

        let mean_return = mean(&returns);
        let std_return = population_std(&returns, mean_return);
        if std_return > 0.0 {
            summary.sharpe_ratio = mean_return / std_return * 365f64.sqrt();
        }

        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if !downside.is_empty() {
            let downside_std = population_std(&downside, mean(&downside));
            if downside_std > 0.0 {
                summary.sortino_ratio = mean_return / downside_std * 365f64.sqrt();
            }
        }

        // Max drawdown against the running peak.
        let mut running_max = f64::MIN;
        let mut max_drawdown = 0.0f64;
        for value in &equity {
            running_max = running_max.max(*value);
            if running_max > 0.0 {
                max_drawdown = max_drawdown.min((value - running_max) / running_max);
            }
        }
        summary.max_drawdown_pct = max_drawdown * 100.0;
        summary.max_drawdown_duration_ms = self.max_drawdown_duration(&equity);
    }

    /// Longest contiguous stretch spent below the running peak.
    fn max_drawdown_duration(&self, equity: &[f64]) -> i64 {
        let timestamps: Vec<i64> = self.equity_curve.iter().map(|p| p.timestamp_ms).collect();
        let mut running_max = f64::MIN;
        let mut max_duration = 0i64;
        let mut drawdown_start: Option<usize> = None;

        for (i, value) in equity.iter().enumerate() {
            running_max = running_max.max(*value);
            if *value < running_max {
                if drawdown_start.is_none() {
                    drawdown_start = Some(i);
                }
            } else if let Some(start) = drawdown_start.take() {
                max_duration = max_duration.max(timestamps[i] - timestamps[start]);
            }
        }
        if let Some(start) = drawdown_start {
            max_duration = max_duration.max(timestamps[timestamps.len() - 1] - timestamps[start]);
        }
        max_duration
    }

    fn trade_metrics(&self, summary: &mut MetricsSummary) {
        let trades = &self.trade_log;
        summary.num_trades = trades.len();
        if trades.is_empty() {
            return;
        }

        let winning: Vec<&TradeRecord> =
            trades.iter().filter(|t| t.realized_pnl > Decimal::ZERO).collect();
        let losing: Vec<&TradeRecord> =
            trades.iter().filter(|t| t.realized_pnl <= Decimal::ZERO).collect();

        summary.num_winning_trades = winning.len();
        summary.num_losing_trades = losing.len();
        summary.win_rate = winning.len() as f64 / trades.len() as f64;

        let gross_profit: Decimal = winning.iter().map(|t| t.realized_pnl).sum();
        let gross_loss: Decimal = losing.iter().map(|t| t.realized_pnl).sum::<Decimal>().abs();

        summary.profit_factor = if gross_loss > Decimal::ZERO {
            decimal_to_f64(gross_profit) / decimal_to_f64(gross_loss)
        } else {
            f64::INFINITY
        };

        summary.avg_win = if winning.is_empty() {
            0.0
        } else {
            decimal_to_f64(gross_profit) / winning.len() as f64
        };
        summary.avg_loss = if losing.is_empty() {
            0.0
        } else {
            decimal_to_f64(gross_loss) / losing.len() as f64
        };
        summary.expectancy =
            summary.win_rate * summary.avg_win - (1.0 - summary.win_rate) * summary.avg_loss;

        let total_pnl: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
        summary.avg_trade_pnl = decimal_to_f64(total_pnl) / trades.len() as f64;

        let total_fees: Decimal = trades.iter().map(|t| t.fees).sum();
        summary.total_fees = decimal_to_f64(total_fees);
        let total_volume: Decimal = trades.iter().map(|t| t.entry_price * t.quantity).sum();
        if total_volume > Decimal::ZERO {
            summary.fees_pct_of_volume = decimal_to_f64(total_fees / total_volume) * 100.0;
        }
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::order::{FillReason, OrderSide};
    use rust_decimal_macros::dec;

    fn fill(asset: &str, side: OrderSide, price: &str, qty: &str, fees: &str, ts: i64) -> Fill {
        Fill {
            fill_id: "f".to_string(),
            order_id: "o".to_string(),
            asset_id: asset.to_string(),
            side,
            price: price.parse().unwrap(),
            quantity: qty.parse().unwrap(),
            fees: fees.parse().unwrap(),
            timestamp_ms: ts,
            is_maker: false,
            reason: FillReason::Immediate,
        }
    }

    fn collector() -> (MetricsCollector, Portfolio) {
        (
            MetricsCollector::new(dec!(100), 60_000),
            Portfolio::new(dec!(100), None),
        )
    }

    #[test]
    fn test_round_trip_produces_winning_trade() {
        let (mut metrics, mut portfolio) = collector();

        let buy = fill("tok", OrderSide::Buy, "0.40", "10", "0", 1_000);
        portfolio.apply_fill(&buy);
        metrics.record_fill(&buy, &portfolio);

        let sell = fill("tok", OrderSide::Sell, "0.60", "10", "0", 2_000);
        portfolio.apply_fill(&sell);
        metrics.record_fill(&sell, &portfolio);

        let log = metrics.trade_log();
        assert_eq!(log.len(), 1);
        let trade = &log[0];
        assert_eq!(trade.realized_pnl, dec!(2.00));
        assert!(trade.is_winner);
        assert_eq!(trade.entry_price, dec!(0.40));
        assert_eq!(trade.exit_price, dec!(0.60));
        assert_eq!(trade.entry_time_ms, 1_000);
        assert_eq!(trade.exit_time_ms, 2_000);
        // Round trip with no fees nets +2.00 cash.
        assert_eq!(portfolio.cash(), dec!(102));
    }

    #[test]
    fn test_same_side_fills_accumulate() {
        let (mut metrics, portfolio) = collector();
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "10", "0", 1_000), &portfolio);
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.50", "10", "0", 2_000), &portfolio);
        assert!(metrics.trade_log().is_empty());

        // Closing realizes against the blended 0.45 entry.
        metrics.record_fill(&fill("tok", OrderSide::Sell, "0.55", "20", "0", 3_000), &portfolio);
        let trade = &metrics.trade_log()[0];
        assert_eq!(trade.entry_price, dec!(0.45));
        assert_eq!(trade.quantity, dec!(20));
        assert_eq!(trade.realized_pnl, dec!(2.00));
    }

    #[test]
    fn test_partial_close_attributes_fees_pro_rata() {
        let (mut metrics, portfolio) = collector();
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "10", "0.10", 1_000), &portfolio);
        metrics.record_fill(&fill("tok", OrderSide::Sell, "0.50", "4", "0.02", 2_000), &portfolio);

        let trade = &metrics.trade_log()[0];
        assert_eq!(trade.quantity, dec!(4));
        // 40% of the 0.10 entry fee plus the whole exit fee.
        assert_eq!(trade.fees, dec!(0.04) + dec!(0.02));
        assert_eq!(trade.realized_pnl, dec!(0.40));
    }

    #[test]
    fn test_overflow_close_opens_opposite_tracker() {
        let (mut metrics, portfolio) = collector();
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "10", "0", 1_000), &portfolio);
        // Sell 15: closes 10, leaves a 5-lot short entry.
        metrics.record_fill(&fill("tok", OrderSide::Sell, "0.50", "15", "0", 2_000), &portfolio);
        assert_eq!(metrics.trade_log().len(), 1);
        assert_eq!(metrics.trade_log()[0].quantity, dec!(10));

        // Buying back the 5 closes the short tracker.
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.45", "5", "0", 3_000), &portfolio);
        assert_eq!(metrics.trade_log().len(), 2);
        let short_trade = &metrics.trade_log()[1];
        assert_eq!(short_trade.side, OrderSide::Sell);
        assert_eq!(short_trade.quantity, dec!(5));
        assert_eq!(short_trade.realized_pnl, dec!(0.25));
    }

    #[test]
    fn test_losing_trade_flagged() {
        let (mut metrics, portfolio) = collector();
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.60", "10", "0", 1_000), &portfolio);
        metrics.record_fill(&fill("tok", OrderSide::Sell, "0.40", "10", "0", 2_000), &portfolio);

        let trade = &metrics.trade_log()[0];
        assert_eq!(trade.realized_pnl, dec!(-2.00));
        assert!(!trade.is_winner);
    }

    #[test]
    fn test_equity_sampling_is_time_gated() {
        let (mut metrics, portfolio) = collector();
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "1", "0", 1_000), &portfolio);
        // 30s later: inside the 60s window, no new sample.
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "1", "0", 31_000), &portfolio);
        assert_eq!(metrics.equity_curve().len(), 1);
        // 61s after the first sample: sampled.
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "1", "0", 62_000), &portfolio);
        assert_eq!(metrics.equity_curve().len(), 2);
    }

    #[test]
    fn test_explicit_equity_point_updates_marks() {
        let (mut metrics, mut portfolio) = collector();
        let buy = fill("tok", OrderSide::Buy, "0.40", "10", "0", 1_000);
        portfolio.apply_fill(&buy);

        let prices: HashMap<String, Decimal> =
            [("tok".to_string(), dec!(0.50))].into_iter().collect();
        metrics.record_equity_point(5_000, &mut portfolio, &prices);

        let point = &metrics.equity_curve()[0];
        assert_eq!(point.timestamp_ms, 5_000);
        // 96 cash + 10 * 0.50 marked value.
        assert_eq!(point.equity, dec!(101));
        assert_eq!(point.cash, dec!(96));
        assert_eq!(point.position_value, dec!(5));
    }

    #[test]
    fn test_empty_collector_yields_zeroed_metrics() {
        let metrics = MetricsCollector::new(dec!(100), 60_000);
        let summary = metrics.calculate();
        assert_eq!(summary.num_trades, 0);
        assert_eq!(summary.total_return_pct, 0.0);
        assert_eq!(summary.sharpe_ratio, 0.0);
        assert_eq!(summary.max_drawdown_pct, 0.0);
    }

    #[test]
    fn test_profit_factor_infinite_without_losers() {
        let (mut metrics, portfolio) = collector();
        metrics.record_fill(&fill("tok", OrderSide::Buy, "0.40", "10", "0", 1_000), &portfolio);
        metrics.record_fill(&fill("tok", OrderSide::Sell, "0.60", "10", "0", 2_000), &portfolio);

        let summary = metrics.calculate();
        assert_eq!(summary.num_winning_trades, 1);
        assert!(summary.profit_factor.is_infinite());
        assert_eq!(summary.win_rate, 1.0);
    }

    #[test]
    fn test_win_rate_and_expectancy() {
        let (mut metrics, portfolio) = collector();
        // Winner: +2.00.
        metrics.record_fill(&fill("a", OrderSide::Buy, "0.40", "10", "0", 1_000), &portfolio);
        metrics.record_fill(&fill("a", OrderSide::Sell, "0.60", "10", "0", 2_000), &portfolio);
        // Loser: -1.00.
        metrics.record_fill(&fill("b", OrderSide::Buy, "0.50", "10", "0", 3_000), &portfolio);
        metrics.record_fill(&fill("b", OrderSide::Sell, "0.40", "10", "0", 4_000), &portfolio);

        let summary = metrics.calculate();
        assert_eq!(summary.num_trades, 2);
        assert_eq!(summary.win_rate, 0.5);
        assert_eq!(summary.profit_factor, 2.0);
        // 0.5*2.00 - 0.5*1.00
        assert!((summary.expectancy - 0.5).abs() < 1e-12);
        assert!((summary.avg_trade_pnl - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_max_drawdown_from_equity_curve() {
        let mut metrics = MetricsCollector::new(dec!(100), 0);
        let mut portfolio = Portfolio::new(dec!(100), None);
        let empty: HashMap<String, Decimal> = HashMap::new();

        // Drive cash (and so equity) through 100 -> 110 -> 88 -> 110.
        metrics.record_equity_point(0, &mut portfolio, &empty);
        portfolio.apply_fill(&fill("tok", OrderSide::Sell, "0.50", "20", "0", 0));
        metrics.record_equity_point(1_000, &mut portfolio, &empty);
        portfolio.apply_fill(&fill("tok", OrderSide::Buy, "0.50", "20", "12", 0));
        metrics.record_equity_point(2_000, &mut portfolio, &empty);
        portfolio.apply_fill(&fill("tok", OrderSide::Sell, "0.55", "40", "0", 0));
        metrics.record_equity_point(3_000, &mut portfolio, &empty);

        let summary = metrics.calculate();
        // Trough 88 against peak 110: -20%.
        assert!((summary.max_drawdown_pct - -20.0).abs() < 1e-9);
        // Below peak from t=2000 until the end (t=3000).
        assert_eq!(summary.max_drawdown_duration_ms, 1_000);
    }
}
