//! Order matching against the historical orderbook and tape.
//!
//! The engine replays L2 snapshots and trade prints against simulated
//! orders. Market orders and marketable limits walk the last observed
//! book level by level; non-marketable limits rest with the queue
//! simulator until the tape carries enough volume through their price.
//! All order-state mutation funnels through [`ExecutionEngine::create_fill`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::types::{OrderbookSnapshot, Trade};

use super::config::{ExecutionConfig, FeeSchedule};
use super::market_pair::{MarketPair, MarketPairRegistry};
use super::order::{Fill, FillReason, Order, OrderSide, OrderStatus, OrderType, RejectReason, TimeInForce};
use super::portfolio::{Portfolio, PortfolioView};
use super::queue_sim::QueueSimulator;

pub struct ExecutionEngine {
    fees: FeeSchedule,
    config: ExecutionConfig,
    pairs: Option<Arc<MarketPairRegistry>>,

    orders: HashMap<String, Order>,
    /// Pending limit orders by asset, for O(1) re-checks on book updates.
    pending_by_asset: HashMap<String, HashSet<String>>,
    /// Latest observed snapshot per asset.
    books: HashMap<String, OrderbookSnapshot>,
    current_timestamp: i64,
    queue: QueueSimulator,

    order_counter: u64,
    fill_counter: u64,
}

impl ExecutionEngine {
    pub fn new(
        fees: FeeSchedule,
        config: ExecutionConfig,
        pairs: Option<Arc<MarketPairRegistry>>,
    ) -> Self {
        let queue = QueueSimulator::new(config.fill_probability, config.seed);
        Self {
            fees,
            config,
            pairs,
            orders: HashMap::new(),
            pending_by_asset: HashMap::new(),
            books: HashMap::new(),
            current_timestamp: 0,
            queue,
            order_counter: 0,
            fill_counter: 0,
        }
    }

    /// Submit an order. Always returns the assigned id; rejected orders
    /// are stored with their rejection reason rather than dropped.
    pub fn submit_order(&mut self, mut order: Order, portfolio: &mut Portfolio) -> String {
        order.order_id = self.next_order_id();
        let order_id = order.order_id.clone();

        // Size bounds.
        if order.quantity < self.config.min_order_size || order.quantity > self.config.max_order_size
        {
            warn!(order_id = %order_id, quantity = %order.quantity, "order rejected: size out of bounds");
            return self.store_rejected(order, RejectReason::InvalidSize);
        }

        // Price bounds (fields are public, so re-check at the boundary).
        if let Some(price) = order.price {
            if price < Decimal::ZERO || price > dec!(1) {
                warn!(order_id = %order_id, price = %price, "order rejected: price out of range");
                return self.store_rejected(order, RejectReason::InvalidPrice);
            }
        }

        // Worst-case cost check for buys: a market buy could pay 1.0.
        if order.side == OrderSide::Buy {
            let max_cost = order.quantity * order.price.unwrap_or(dec!(1));
            if portfolio.buying_power() < max_cost {
                warn!(
                    order_id = %order_id,
                    required = %max_cost,
                    available = %portfolio.buying_power(),
                    "order rejected: insufficient funds"
                );
                return self.store_rejected(order, RejectReason::InsufficientFunds);
            }
        }

        // Sells need a position, or a complement to convert into.
        if order.side == OrderSide::Sell {
            let held = portfolio
                .position(&order.asset_id)
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO);
            if held < order.quantity {
                match self.resolve_short_sale(&order) {
                    ShortSale::Convert { token, price } => {
                        info!(
                            order_id = %order_id,
                            original_asset = %order.asset_id,
                            complement_asset = %token,
                            "converting sell to complement buy"
                        );
                        order.side = OrderSide::Buy;
                        order.asset_id = token;
                        if order.order_type == OrderType::Limit {
                            order.price = price;
                        }
                    }
                    ShortSale::Native => {
                        // Single-ticker book carries both sides; the sell
                        // matches against the asks without a position.
                        debug!(order_id = %order_id, asset = %order.asset_id, "native sell on self-pair");
                    }
                    ShortSale::Reject => {
                        warn!(
                            order_id = %order_id,
                            asset = %order.asset_id,
                            required = %order.quantity,
                            available = %held,
                            "order rejected: insufficient position"
                        );
                        return self.store_rejected(order, RejectReason::InsufficientPosition);
                    }
                }
            }
        }

        order.submitted_at = Some(self.current_timestamp);
        order.status = OrderStatus::Pending;

        match order.order_type {
            OrderType::Market => self.submit_market(order, portfolio),
            OrderType::Limit => self.submit_limit(order, portfolio),
        }

        order_id
    }

    /// Cancel a live order. Returns false for unknown or terminal orders.
    pub fn cancel_order(&mut self, order_id: &str) -> bool {
        let Some(order) = self.orders.get_mut(order_id) else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        order.status = OrderStatus::Cancelled;
        let asset_id = order.asset_id.clone();
        self.queue.remove_order(order_id);
        self.unindex(&asset_id, order_id);
        info!(order_id = %order_id, "order cancelled");
        true
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.orders.get(order_id).map(|o| o.status)
    }

    /// All pending/partial orders, optionally scoped to one asset.
    pub fn open_orders(&self, asset_id: Option<&str>) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Pending | OrderStatus::Partial))
            .filter(|o| asset_id.map_or(true, |a| o.asset_id == a))
            .collect()
    }

    pub fn latest_book(&self, asset_id: &str) -> Option<&OrderbookSnapshot> {
        self.books.get(asset_id)
    }

    pub fn current_timestamp(&self) -> i64 {
        self.current_timestamp
    }

    /// Absorb a new snapshot: advance the clock, expire stale orders, and
    /// execute any resting limit that the new book crosses.
    pub fn process_orderbook_update(
        &mut self,
        snapshot: &OrderbookSnapshot,
        portfolio: &mut Portfolio,
    ) -> Vec<Fill> {
        self.books.insert(snapshot.asset_id.clone(), snapshot.clone());
        self.current_timestamp = snapshot.timestamp;

        if self.config.order_max_age_ms.is_some() {
            self.expire_old_orders();
        }

        let pending_ids: Vec<String> = self
            .pending_by_asset
            .get(&snapshot.asset_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut fills = Vec::new();
        for order_id in pending_ids {
            let Some(order) = self.orders.get(&order_id) else {
                continue;
            };
            if !matches!(order.status, OrderStatus::Pending | OrderStatus::Partial)
                || order.order_type != OrderType::Limit
            {
                continue;
            }
            if Self::is_marketable(order, snapshot) {
                self.queue.remove_order(&order_id);
                fills.extend(self.execute_limit(&order_id, snapshot, portfolio));
            }
        }

        if !fills.is_empty() {
            debug!(
                asset_id = %snapshot.asset_id,
                fills = fills.len(),
                "book update matched resting orders"
            );
        }

        fills
    }

    /// Advance queue positions with a tape print; orders whose simulated
    /// queue position is reached fill in full at their limit price as
    /// makers.
    pub fn process_trade(&mut self, trade: &Trade, portfolio: &mut Portfolio) -> Vec<Fill> {
        self.current_timestamp = trade.timestamp;

        let mut fills = Vec::new();
        for order_id in self.queue.process_trade(trade) {
            let Some(order) = self.orders.get(&order_id) else {
                warn!(order_id = %order_id, "queued fill for unknown order");
                continue;
            };
            let quantity = order.remaining_quantity();
            let price = order.price.expect("queued orders are limit orders");

            self.queue.remove_order(&order_id);
            let fill = self.create_fill(
                &order_id,
                quantity,
                price,
                FillReason::QueueReached,
                true,
                portfolio,
            );
            if let Some(fill) = fill {
                debug!(
                    order_id = %order_id,
                    price = %price,
                    quantity = %quantity,
                    "queue order filled"
                );
                fills.push(fill);
            }
        }

        fills
    }

    // ------------------------------------------------------------------
    // Submission paths
    // ------------------------------------------------------------------

    fn submit_market(&mut self, order: Order, portfolio: &mut Portfolio) {
        let order_id = order.order_id.clone();
        let asset_id = order.asset_id.clone();
        self.orders.insert(order_id.clone(), order);

        match self.books.get(&asset_id).cloned() {
            Some(snapshot) => {
                let fills = self.execute_market(&order_id, &snapshot, portfolio);
                // A market order cannot rest; whatever the book could not
                // satisfy is gone.
                if let Some(order) = self.orders.get_mut(&order_id) {
                    if order.status == OrderStatus::Partial {
                        order.status = OrderStatus::Cancelled;
                    }
                }
                info!(
                    order_id = %order_id,
                    fills = fills.len(),
                    status = ?self.orders.get(&order_id).map(|o| o.status),
                    "market order executed"
                );
            }
            None => {
                warn!(order_id = %order_id, asset_id = %asset_id, "no orderbook for market order");
                let order = self.orders.get_mut(&order_id).expect("just inserted");
                order.status = OrderStatus::Rejected;
                order.rejection_reason = Some(RejectReason::NoLiquidity);
            }
        }
    }

    fn submit_limit(&mut self, order: Order, portfolio: &mut Portfolio) {
        let order_id = order.order_id.clone();
        let asset_id = order.asset_id.clone();
        let tif = order.time_in_force;
        self.orders.insert(order_id.clone(), order);

        let Some(snapshot) = self.books.get(&asset_id).cloned() else {
            // Nothing observed for this asset yet. IOC/FOK cannot wait;
            // GTC rests at the front of an empty queue.
            match tif {
                TimeInForce::Ioc => {
                    let order = self.orders.get_mut(&order_id).expect("just inserted");
                    order.status = OrderStatus::Cancelled;
                    order.rejection_reason = Some(RejectReason::NoLiquidity);
                }
                TimeInForce::Fok => {
                    let order = self.orders.get_mut(&order_id).expect("just inserted");
                    order.status = OrderStatus::Rejected;
                    order.rejection_reason = Some(RejectReason::FokNotFillable);
                }
                TimeInForce::Gtc => self.rest_order(&order_id, None),
            }
            return;
        };

        let marketable = {
            let order = self.orders.get(&order_id).expect("just inserted");
            Self::is_marketable(order, &snapshot)
        };

        if marketable {
            match tif {
                TimeInForce::Fok => {
                    let fillable = {
                        let order = self.orders.get(&order_id).expect("just inserted");
                        Self::can_fully_fill(order, &snapshot)
                    };
                    if fillable {
                        let fills = self.execute_limit(&order_id, &snapshot, portfolio);
                        info!(order_id = %order_id, fills = fills.len(), "FOK limit executed");
                    } else {
                        let order = self.orders.get_mut(&order_id).expect("just inserted");
                        order.status = OrderStatus::Rejected;
                        order.rejection_reason = Some(RejectReason::FokNotFillable);
                        info!(order_id = %order_id, "FOK limit rejected");
                    }
                }
                TimeInForce::Ioc => {
                    self.execute_limit(&order_id, &snapshot, portfolio);
                    let order = self.orders.get_mut(&order_id).expect("just inserted");
                    if order.status == OrderStatus::Partial {
                        info!(
                            order_id = %order_id,
                            filled = %order.filled_quantity,
                            cancelled = %order.remaining_quantity(),
                            "IOC remainder cancelled"
                        );
                        order.status = OrderStatus::Cancelled;
                    }
                }
                TimeInForce::Gtc => {
                    self.execute_limit(&order_id, &snapshot, portfolio);
                    // Leave any remainder resting.
                    let needs_rest = self
                        .orders
                        .get(&order_id)
                        .map(|o| o.status == OrderStatus::Partial)
                        .unwrap_or(false);
                    if needs_rest {
                        self.rest_order(&order_id, Some(&snapshot));
                    }
                }
            }
        } else {
            match tif {
                TimeInForce::Ioc => {
                    let order = self.orders.get_mut(&order_id).expect("just inserted");
                    order.status = OrderStatus::Cancelled;
                    order.rejection_reason = Some(RejectReason::NoLiquidity);
                    info!(order_id = %order_id, "IOC limit not marketable");
                }
                TimeInForce::Fok => {
                    let order = self.orders.get_mut(&order_id).expect("just inserted");
                    order.status = OrderStatus::Rejected;
                    order.rejection_reason = Some(RejectReason::FokNotFillable);
                    info!(order_id = %order_id, "FOK limit not marketable");
                }
                TimeInForce::Gtc => self.rest_order(&order_id, Some(&snapshot)),
            }
        }
    }

    /// Register a pending limit with the queue simulator and pending index.
    fn rest_order(&mut self, order_id: &str, snapshot: Option<&OrderbookSnapshot>) {
        let order = self.orders.get(order_id).expect("order exists").clone();
        match snapshot {
            Some(snapshot) => self.queue.add_order(&order, snapshot),
            None => {
                // No book yet: nothing is ahead of us.
                let empty = OrderbookSnapshot::new(
                    &order.asset_id,
                    &order.asset_id,
                    "",
                    self.current_timestamp,
                    Vec::new(),
                    Vec::new(),
                );
                self.queue.add_order(&order, &empty);
            }
        }
        self.pending_by_asset
            .entry(order.asset_id.clone())
            .or_default()
            .insert(order_id.to_string());
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Walk the far side of the book for a market order, taking each level
    /// until the quantity is satisfied or the book runs out. The fill is
    /// reported at the volume-weighted average price.
    fn execute_market(
        &mut self,
        order_id: &str,
        snapshot: &OrderbookSnapshot,
        portfolio: &mut Portfolio,
    ) -> Vec<Fill> {
        let order = self.orders.get(order_id).expect("order exists").clone();
        let levels = match order.side {
            OrderSide::Buy => &snapshot.asks,
            OrderSide::Sell => &snapshot.bids,
        };
        if levels.is_empty() {
            warn!(order_id = %order_id, side = %order.side, "no liquidity for market order");
            let order = self.orders.get_mut(order_id).expect("order exists");
            order.status = OrderStatus::Rejected;
            order.rejection_reason = Some(RejectReason::NoLiquidity);
            return Vec::new();
        }

        let mut remaining = order.remaining_quantity();
        let mut total_cost = Decimal::ZERO;
        let mut total_qty = Decimal::ZERO;

        for level in levels {
            let take = remaining.min(level.size);
            total_qty += take;
            total_cost += take * level.price;
            remaining -= take;
            if remaining <= Decimal::ZERO {
                break;
            }
        }

        if total_qty == Decimal::ZERO {
            let order = self.orders.get_mut(order_id).expect("order exists");
            order.status = OrderStatus::Rejected;
            order.rejection_reason = Some(RejectReason::NoLiquidity);
            return Vec::new();
        }

        if order.time_in_force == TimeInForce::Fok && total_qty < order.quantity {
            info!(
                order_id = %order_id,
                requested = %order.quantity,
                available = %total_qty,
                "FOK market order rejected"
            );
            let order = self.orders.get_mut(order_id).expect("order exists");
            order.status = OrderStatus::Rejected;
            order.rejection_reason = Some(RejectReason::FokNotFillable);
            return Vec::new();
        }

        let avg_price = total_cost / total_qty;
        self.create_fill(
            order_id,
            total_qty,
            avg_price,
            FillReason::Immediate,
            false,
            portfolio,
        )
        .into_iter()
        .collect()
    }

    /// Level walk bounded by the limit price, for marketable limits.
    fn execute_limit(
        &mut self,
        order_id: &str,
        snapshot: &OrderbookSnapshot,
        portfolio: &mut Portfolio,
    ) -> Vec<Fill> {
        let order = self.orders.get(order_id).expect("order exists").clone();
        let limit = order.price.expect("limit orders carry a price");
        let levels = match order.side {
            OrderSide::Buy => &snapshot.asks,
            OrderSide::Sell => &snapshot.bids,
        };
        if levels.is_empty() {
            return Vec::new();
        }

        let mut remaining = order.remaining_quantity();
        let mut total_cost = Decimal::ZERO;
        let mut total_qty = Decimal::ZERO;

        for level in levels {
            let within_limit = match order.side {
                OrderSide::Buy => level.price <= limit,
                OrderSide::Sell => level.price >= limit,
            };
            if !within_limit {
                break;
            }
            let take = remaining.min(level.size);
            total_qty += take;
            total_cost += take * level.price;
            remaining -= take;
            if remaining <= Decimal::ZERO {
                break;
            }
        }

        if total_qty == Decimal::ZERO {
            return Vec::new();
        }

        let avg_price = total_cost / total_qty;
        self.create_fill(
            order_id,
            total_qty,
            avg_price,
            FillReason::Immediate,
            // Marketable-limit fills are classified maker here: the
            // resting half of the print was on the book first. Market
            // orders are the only strict takers in this simulation.
            true,
            portfolio,
        )
        .into_iter()
        .collect()
    }

    /// Sole mutation path for fills: fee calculation, order state
    /// transitions, dust cancellation, index upkeep, and portfolio
    /// application.
    fn create_fill(
        &mut self,
        order_id: &str,
        quantity: Decimal,
        price: Decimal,
        reason: FillReason,
        is_maker: bool,
        portfolio: &mut Portfolio,
    ) -> Option<Fill> {
        let fees = self.fees.fee(quantity, price, is_maker);
        self.fill_counter += 1;
        let fill_id = format!("fill_{}", self.fill_counter);

        let order = self.orders.get_mut(order_id)?;

        let fill = Fill {
            fill_id,
            order_id: order.order_id.clone(),
            asset_id: order.asset_id.clone(),
            side: order.side,
            price,
            quantity,
            fees,
            timestamp_ms: self.current_timestamp,
            is_maker,
            reason,
        };

        order.filled_quantity += quantity;
        order.avg_fill_price = Some(match order.avg_fill_price {
            None => price,
            Some(prev) => {
                let prev_value = prev * (order.filled_quantity - quantity);
                (prev_value + price * quantity) / order.filled_quantity
            }
        });

        let asset_id = order.asset_id.clone();
        if order.is_fully_filled() {
            order.status = OrderStatus::Filled;
            self.unindex(&asset_id, order_id);
        } else {
            order.status = OrderStatus::Partial;
            if order.remaining_quantity() < self.config.min_order_size {
                // Dust: the remainder can never be filled on its own.
                info!(
                    order_id = %order_id,
                    remaining = %order.remaining_quantity(),
                    min_size = %self.config.min_order_size,
                    "dust remainder cancelled"
                );
                order.status = OrderStatus::Cancelled;
                self.queue.remove_order(order_id);
                self.unindex(&asset_id, order_id);
            }
        }

        portfolio.apply_fill(&fill);

        debug!(
            fill_id = %fill.fill_id,
            order_id = %fill.order_id,
            asset_id = %fill.asset_id,
            side = %fill.side,
            price = %fill.price,
            quantity = %fill.quantity,
            fees = %fill.fees,
            is_maker = fill.is_maker,
            "fill created"
        );

        Some(fill)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn resolve_short_sale(&self, order: &Order) -> ShortSale {
        let Some(pairs) = &self.pairs else {
            return ShortSale::Reject;
        };
        let Some(pair) = pairs.pair_for_token(&order.asset_id) else {
            return ShortSale::Reject;
        };
        if pair.is_self_pair() {
            return ShortSale::Native;
        }
        match pair.complement_token(&order.asset_id) {
            Some(token) => ShortSale::Convert {
                token: token.to_string(),
                price: order.price.map(MarketPair::complement_price),
            },
            None => ShortSale::Reject,
        }
    }

    fn is_marketable(order: &Order, snapshot: &OrderbookSnapshot) -> bool {
        let Some(price) = order.price else {
            return false;
        };
        match order.side {
            OrderSide::Buy => snapshot.best_ask.is_some_and(|ask| price >= ask),
            OrderSide::Sell => snapshot.best_bid.is_some_and(|bid| price <= bid),
        }
    }

    /// FOK pre-check: enough volume at or better than the limit.
    fn can_fully_fill(order: &Order, snapshot: &OrderbookSnapshot) -> bool {
        let Some(limit) = order.price else {
            return false;
        };
        let levels = match order.side {
            OrderSide::Buy => &snapshot.asks,
            OrderSide::Sell => &snapshot.bids,
        };

        let mut available = Decimal::ZERO;
        for level in levels {
            let within_limit = match order.side {
                OrderSide::Buy => level.price <= limit,
                OrderSide::Sell => level.price >= limit,
            };
            if !within_limit {
                break;
            }
            available += level.size;
            if available >= order.remaining_quantity() {
                return true;
            }
        }
        false
    }

    fn expire_old_orders(&mut self) {
        let Some(max_age) = self.config.order_max_age_ms else {
            return;
        };
        let expired: Vec<(String, String)> = self
            .orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Pending | OrderStatus::Partial))
            .filter(|o| {
                o.submitted_at
                    .is_some_and(|at| self.current_timestamp - at > max_age)
            })
            .map(|o| (o.order_id.clone(), o.asset_id.clone()))
            .collect();

        for (order_id, asset_id) in expired {
            if let Some(order) = self.orders.get_mut(&order_id) {
                info!(
                    order_id = %order_id,
                    age_ms = self.current_timestamp - order.submitted_at.unwrap_or_default(),
                    max_age_ms = max_age,
                    "order expired"
                );
                order.status = OrderStatus::Cancelled;
                order.rejection_reason = Some(RejectReason::OrderExpired);
            }
            self.queue.remove_order(&order_id);
            self.unindex(&asset_id, &order_id);
        }
    }

    fn store_rejected(&mut self, mut order: Order, reason: RejectReason) -> String {
        order.status = OrderStatus::Rejected;
        order.rejection_reason = Some(reason);
        let order_id = order.order_id.clone();
        self.orders.insert(order_id.clone(), order);
        order_id
    }

    fn unindex(&mut self, asset_id: &str, order_id: &str) {
        if let Some(set) = self.pending_by_asset.get_mut(asset_id) {
            set.remove(order_id);
        }
    }

    fn next_order_id(&mut self) -> String {
        self.order_counter += 1;
        format!("order_{}", self.order_counter)
    }
}

enum ShortSale {
    /// Rewrite the sell as a buy on the complement token.
    Convert { token: String, price: Option<Decimal> },
    /// Self-pair: sell directly into the single-ticker book.
    Native,
    Reject,
}
