//! Cash and position state driven by execution fills.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::market_pair::MarketPairRegistry;
use super::order::{Fill, OrderSide};
use super::position::{MarketPosition, Position};

/// Read-only view handed to strategies.
///
/// The engine owns the mutable [`Portfolio`]; strategies query state
/// through this trait and change it only indirectly, by submitting
/// orders.
pub trait PortfolioView {
    fn cash(&self) -> Decimal;
    fn initial_cash(&self) -> Decimal;
    /// Cash plus mark-to-market value of positions with known marks.
    fn total_value(&self) -> Decimal;
    /// No margin: buying power equals cash.
    fn buying_power(&self) -> Decimal;
    fn position(&self, asset_id: &str) -> Option<&Position>;
    fn positions(&self) -> &HashMap<String, Position>;
    fn market_position(&self, condition_id: &str) -> Option<&MarketPosition>;
}

/// Mutable portfolio state for a backtest run.
pub struct Portfolio {
    cash: Decimal,
    initial_cash: Decimal,
    positions: HashMap<String, Position>,
    market_positions: HashMap<String, MarketPosition>,
    mark_prices: HashMap<String, Decimal>,
    fills: Vec<Fill>,
    pairs: Option<Arc<MarketPairRegistry>>,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal, pairs: Option<Arc<MarketPairRegistry>>) -> Self {
        Self {
            cash: initial_cash,
            initial_cash,
            positions: HashMap::new(),
            market_positions: HashMap::new(),
            mark_prices: HashMap::new(),
            fills: Vec::new(),
            pairs,
        }
    }

    /// Apply a fill: update the asset position, move cash, and refresh the
    /// condition-level aggregate.
    ///
    /// Cash flows are signed by side: buys cost `price * qty + fees`,
    /// sells credit `price * qty - fees`.
    pub fn apply_fill(&mut self, fill: &Fill) {
        self.fills.push(fill.clone());

        let position = self
            .positions
            .entry(fill.asset_id.clone())
            .or_insert_with(|| Position::new(&fill.asset_id));
        position.apply_fill(fill.side, fill.price, fill.quantity, fill.fees);
        let updated = position.clone();

        let notional = fill.price * fill.quantity;
        match fill.side {
            OrderSide::Buy => self.cash -= notional + fill.fees,
            OrderSide::Sell => self.cash += notional - fill.fees,
        }

        if let Some(condition_id) = self.condition_for(&fill.asset_id) {
            self.market_positions
                .entry(condition_id.clone())
                .or_insert_with(|| MarketPosition::new(&condition_id))
                .positions
                .insert(fill.asset_id.clone(), updated);
        }
    }

    /// Merge new mark prices and refresh unrealized P&L everywhere.
    pub fn update_mark_prices(&mut self, prices: &HashMap<String, Decimal>) {
        self.mark_prices.extend(prices.iter().map(|(k, v)| (k.clone(), *v)));

        for (asset_id, position) in &mut self.positions {
            if let Some(mark) = self.mark_prices.get(asset_id) {
                position.update_unrealized_pnl(*mark);
            }
        }
        for market_position in self.market_positions.values_mut() {
            for (asset_id, position) in &mut market_position.positions {
                if let Some(mark) = self.mark_prices.get(asset_id) {
                    position.update_unrealized_pnl(*mark);
                }
            }
        }
    }

    pub fn total_pnl(&self) -> Decimal {
        self.positions.values().map(Position::total_pnl).sum()
    }

    /// Fractional return on initial cash (0.15 = +15%).
    pub fn portfolio_return(&self) -> f64 {
        if self.initial_cash == Decimal::ZERO {
            return 0.0;
        }
        let ratio = (self.total_value() - self.initial_cash) / self.initial_cash;
        ratio.to_f64().unwrap_or(0.0)
    }

    pub fn total_fees_paid(&self) -> Decimal {
        self.fills.iter().map(|f| f.fees).sum()
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn mark_price(&self, asset_id: &str) -> Option<Decimal> {
        self.mark_prices.get(asset_id).copied()
    }

    fn condition_for(&self, asset_id: &str) -> Option<String> {
        self.pairs
            .as_ref()?
            .pair_for_token(asset_id)
            .map(|p| p.condition_id.clone())
    }
}

impl PortfolioView for Portfolio {
    fn cash(&self) -> Decimal {
        self.cash
    }

    fn initial_cash(&self) -> Decimal {
        self.initial_cash
    }

    fn total_value(&self) -> Decimal {
        let position_value: Decimal = self
            .positions
            .iter()
            .filter_map(|(asset_id, pos)| {
                self.mark_prices.get(asset_id).map(|mark| pos.market_value(*mark))
            })
            .sum();
        self.cash + position_value
    }

    fn buying_power(&self) -> Decimal {
        self.cash
    }

    fn position(&self, asset_id: &str) -> Option<&Position> {
        self.positions.get(asset_id)
    }

    fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    fn market_position(&self, condition_id: &str) -> Option<&MarketPosition> {
        self.market_positions.get(condition_id)
    }
}
