//! Strategy callbacks and the handle they act through.

use std::collections::HashMap;

use anyhow::Result;
use rust_decimal::Decimal;

use crate::types::{Market, OrderbookSnapshot, Trade, Venue};

use super::execution::ExecutionEngine;
use super::order::{Fill, Order, OrderSide, OrderStatus, TimeInForce};
use super::portfolio::{Portfolio, PortfolioView};

/// Run-level facts handed to `on_start` / `on_end`.
pub struct BacktestContext {
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub initial_cash: Decimal,
    pub venue: Option<Venue>,
    pub markets: HashMap<String, Market>,
}

/// The strategy's only lever on the simulation: order entry plus
/// read-only views of the book and the portfolio. Borrowed per callback
/// so the engine keeps sole ownership between events.
pub struct StrategyCtx<'a> {
    pub(crate) engine: &'a mut ExecutionEngine,
    pub(crate) portfolio: &'a mut Portfolio,
}

impl StrategyCtx<'_> {
    pub fn submit_order(&mut self, order: Order) -> String {
        self.engine.submit_order(order, self.portfolio)
    }

    pub fn cancel_order(&mut self, order_id: &str) -> bool {
        self.engine.cancel_order(order_id)
    }

    pub fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.engine.order_status(order_id)
    }

    pub fn open_orders(&self, asset_id: Option<&str>) -> Vec<&Order> {
        self.engine.open_orders(asset_id)
    }

    pub fn latest_book(&self, asset_id: &str) -> Option<&OrderbookSnapshot> {
        self.engine.latest_book(asset_id)
    }

    pub fn timestamp(&self) -> i64 {
        self.engine.current_timestamp()
    }

    pub fn portfolio(&self) -> &dyn PortfolioView {
        self.portfolio
    }
}

/// A trading strategy driven by the replay event loop.
///
/// Callbacks returning `Err` are logged and swallowed by the engine; a
/// faulty strategy cannot tear down the backtest.
pub trait Strategy {
    fn name(&self) -> &str;

    fn on_start(&mut self, _context: &BacktestContext) -> Result<()> {
        Ok(())
    }

    /// Called for every replayed snapshot after the engine has matched
    /// resting orders against it.
    fn on_orderbook(
        &mut self,
        _snapshot: &OrderbookSnapshot,
        _is_forward_filled: bool,
        _ctx: &mut StrategyCtx<'_>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called for every tape print after queue advancement.
    fn on_trade(&mut self, _trade: &Trade, _ctx: &mut StrategyCtx<'_>) -> Result<()> {
        Ok(())
    }

    fn on_fill(&mut self, _fill: &Fill) -> Result<()> {
        Ok(())
    }

    fn on_end(&mut self, _context: &BacktestContext) -> Result<()> {
        Ok(())
    }
}

/// Joins the inside of the book on one asset: rests a bid while flat,
/// rests an offer once holding inventory. Ships as the worked example
/// for the strategy surface.
pub struct InsideQuoter {
    asset_id: String,
    quote_size: Decimal,
    min_spread: Decimal,
}

impl InsideQuoter {
    pub fn new(asset_id: &str, quote_size: Decimal, min_spread: Decimal) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            quote_size,
            min_spread,
        }
    }
}

/// Market-buys a fixed quantity at the first real snapshot, then holds.
/// Useful as a baseline and for wiring checks.
pub struct BuyAndHold {
    asset_id: String,
    quantity: Decimal,
    bought: bool,
}

impl BuyAndHold {
    pub fn new(asset_id: &str, quantity: Decimal) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            quantity,
            bought: false,
        }
    }
}

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    fn on_orderbook(
        &mut self,
        snapshot: &OrderbookSnapshot,
        is_forward_filled: bool,
        ctx: &mut StrategyCtx<'_>,
    ) -> Result<()> {
        if self.bought
            || is_forward_filled
            || snapshot.asset_id != self.asset_id
            || snapshot.best_ask.is_none()
        {
            return Ok(());
        }
        let order = Order::market(&self.asset_id, OrderSide::Buy, self.quantity, TimeInForce::Gtc)?;
        ctx.submit_order(order);
        self.bought = true;
        Ok(())
    }
}

/// Create a registered strategy by name.
pub fn create_strategy(
    name: &str,
    asset_id: &str,
    size: Decimal,
    min_spread: Decimal,
) -> Option<Box<dyn Strategy>> {
    match name {
        "inside_quoter" => Some(Box::new(InsideQuoter::new(asset_id, size, min_spread))),
        "buy_and_hold" => Some(Box::new(BuyAndHold::new(asset_id, size))),
        _ => None,
    }
}

/// All registered strategy names with descriptions.
pub fn list_strategies() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "inside_quoter",
            "Joins the inside bid while flat, offers out inventory at the inside ask",
        ),
        (
            "buy_and_hold",
            "Market-buys once at the first snapshot and holds to the end",
        ),
    ]
}

impl Strategy for InsideQuoter {
    fn name(&self) -> &str {
        "inside_quoter"
    }

    fn on_orderbook(
        &mut self,
        snapshot: &OrderbookSnapshot,
        is_forward_filled: bool,
        ctx: &mut StrategyCtx<'_>,
    ) -> Result<()> {
        // Heartbeat copies carry no new information to quote on.
        if is_forward_filled || snapshot.asset_id != self.asset_id {
            return Ok(());
        }
        let (Some(bid), Some(ask), Some(spread)) =
            (snapshot.best_bid, snapshot.best_ask, snapshot.spread)
        else {
            return Ok(());
        };
        if spread < self.min_spread {
            return Ok(());
        }

        let held = ctx
            .portfolio()
            .position(&self.asset_id)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let open = ctx.open_orders(Some(&self.asset_id));
        let has_buy = open.iter().any(|o| o.side == OrderSide::Buy);
        let has_sell = open.iter().any(|o| o.side == OrderSide::Sell);

        if held <= Decimal::ZERO && !has_buy {
            let order =
                Order::limit(&self.asset_id, OrderSide::Buy, bid, self.quote_size, TimeInForce::Gtc)?;
            ctx.submit_order(order);
        } else if held >= self.quote_size && !has_sell {
            let order = Order::limit(
                &self.asset_id,
                OrderSide::Sell,
                ask,
                self.quote_size,
                TimeInForce::Gtc,
            )?;
            ctx.submit_order(order);
        }
        Ok(())
    }
}
