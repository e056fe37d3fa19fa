//! Queue position simulation for resting limit orders.
//!
//! A limit order that does not cross the spread rests behind the volume
//! already quoted at its price. This simulator estimates that volume at
//! registration time (`size_ahead`) and advances each order as the trade
//! tape prints through its price. Once cumulative printed volume reaches
//! `size_ahead` the order is eligible to fill, deterministically at
//! `fill_probability = 1.0` or by Bernoulli draw below that.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::types::{OrderbookSnapshot, Trade};

use super::order::{Order, OrderSide};

/// Tracking state for one resting order.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub order_id: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Resting volume at or better than our price when we joined.
    pub size_ahead: Decimal,
    /// Tape volume printed through our price since we joined.
    pub cumulative_volume_at_price: Decimal,
}

pub struct QueueSimulator {
    entries: HashMap<String, QueueEntry>,
    fill_probability: f64,
    rng: StdRng,
}

impl QueueSimulator {
    /// `fill_probability` outside [0, 1] is clamped with a warning. Pass a
    /// seed for reproducible runs under probabilistic fills.
    pub fn new(fill_probability: f64, seed: Option<u64>) -> Self {
        let fill_probability = if (0.0..=1.0).contains(&fill_probability) {
            fill_probability
        } else {
            warn!(fill_probability, "fill probability out of range, clamping");
            fill_probability.clamp(0.0, 1.0)
        };
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            entries: HashMap::new(),
            fill_probability,
            rng,
        }
    }

    /// Register a freshly-rested limit order.
    ///
    /// `size_ahead` for a buy sums bid levels priced at or above the
    /// limit; for a sell, ask levels at or below. Either way it is the
    /// volume that must trade before this order reaches the front.
    pub fn add_order(&mut self, order: &Order, snapshot: &OrderbookSnapshot) {
        if self.entries.contains_key(&order.order_id) {
            warn!(order_id = %order.order_id, "order already queued");
            return;
        }
        let Some(price) = order.price else {
            warn!(order_id = %order.order_id, "market order cannot rest in queue");
            return;
        };

        let size_ahead: Decimal = match order.side {
            OrderSide::Buy => snapshot
                .bids
                .iter()
                .filter(|level| level.price >= price)
                .map(|level| level.size)
                .sum(),
            OrderSide::Sell => snapshot
                .asks
                .iter()
                .filter(|level| level.price <= price)
                .map(|level| level.size)
                .sum(),
        };

        debug!(
            order_id = %order.order_id,
            side = %order.side,
            price = %price,
            size_ahead = %size_ahead,
            "order joined queue"
        );

        self.entries.insert(
            order.order_id.clone(),
            QueueEntry {
                order_id: order.order_id.clone(),
                asset_id: order.asset_id.clone(),
                side: order.side,
                price,
                quantity: order.quantity,
                size_ahead,
                cumulative_volume_at_price: Decimal::ZERO,
            },
        );
    }

    /// Drop an order from tracking (cancelled or filled elsewhere).
    pub fn remove_order(&mut self, order_id: &str) {
        if let Some(entry) = self.entries.remove(order_id) {
            debug!(
                order_id = %order_id,
                cumulative_volume = %entry.cumulative_volume_at_price,
                size_ahead = %entry.size_ahead,
                "order left queue"
            );
        }
    }

    /// Advance queues with one tape print and return the orders that fill.
    ///
    /// A print aggresses a resting buy when it trades at or below the
    /// buy's price, and a resting sell when it trades at or above.
    pub fn process_trade(&mut self, trade: &Trade) -> Vec<String> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        let mut filled = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.asset_id != trade.asset_id {
                continue;
            }

            let aggressed = match entry.side {
                OrderSide::Buy => trade.price <= entry.price,
                OrderSide::Sell => trade.price >= entry.price,
            };
            if !aggressed {
                continue;
            }

            entry.cumulative_volume_at_price += trade.size;

            if entry.cumulative_volume_at_price >= entry.size_ahead {
                let fires =
                    self.fill_probability >= 1.0 || self.rng.gen::<f64>() < self.fill_probability;
                if fires {
                    debug!(
                        order_id = %entry.order_id,
                        price = %entry.price,
                        cumulative_volume = %entry.cumulative_volume_at_price,
                        size_ahead = %entry.size_ahead,
                        "queue position reached"
                    );
                    filled.push(entry.order_id.clone());
                }
            }
        }

        filled
    }

    pub fn entry(&self, order_id: &str) -> Option<&QueueEntry> {
        self.entries.get(order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::order::TimeInForce;
    use crate::types::{PriceLevel, TradeSide};
    use rust_decimal_macros::dec;

    fn snapshot(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> OrderbookSnapshot {
        let to_levels = |levels: &[(&str, &str)]| {
            levels
                .iter()
                .map(|(p, s)| PriceLevel::new(p.parse().unwrap(), s.parse().unwrap()))
                .collect()
        };
        OrderbookSnapshot::new("l1", "tok", "mkt", 1_000, to_levels(bids), to_levels(asks))
    }

    fn resting_buy(id: &str, price: &str, qty: &str) -> Order {
        let mut order = Order::limit(
            "tok",
            OrderSide::Buy,
            price.parse().unwrap(),
            qty.parse().unwrap(),
            TimeInForce::Gtc,
        )
        .unwrap();
        order.order_id = id.to_string();
        order
    }

    fn tape(price: &str, size: &str) -> Trade {
        Trade {
            listener_id: "l1".to_string(),
            asset_id: "tok".to_string(),
            market: "mkt".to_string(),
            timestamp: 2_000,
            price: price.parse().unwrap(),
            size: size.parse().unwrap(),
            side: TradeSide::Sell,
            fee_rate_bps: None,
            venue: None,
        }
    }

    #[test]
    fn test_size_ahead_sums_better_or_equal_bids() {
        let snap = snapshot(&[("0.56", "30"), ("0.55", "20"), ("0.54", "99")], &[]);
        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);

        // Levels at 0.56 and 0.55 count; 0.54 is behind us.
        assert_eq!(sim.entry("o1").unwrap().size_ahead, dec!(50));
    }

    #[test]
    fn test_size_ahead_for_sell_sums_lower_or_equal_asks() {
        let snap = snapshot(&[], &[("0.56", "10"), ("0.57", "25"), ("0.60", "99")]);
        let mut order = Order::limit("tok", OrderSide::Sell, dec!(0.57), dec!(5), TimeInForce::Gtc)
            .unwrap();
        order.order_id = "o1".to_string();

        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&order, &snap);
        assert_eq!(sim.entry("o1").unwrap().size_ahead, dec!(35));
    }

    #[test]
    fn test_no_fill_before_queue_consumed() {
        let snap = snapshot(&[("0.55", "100")], &[]);
        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);

        assert!(sim.process_trade(&tape("0.55", "40")).is_empty());
        assert!(sim.process_trade(&tape("0.55", "40")).is_empty());
        // 40 + 40 + 40 >= 100: fill on the third print.
        assert_eq!(sim.process_trade(&tape("0.55", "40")), vec!["o1".to_string()]);
    }

    #[test]
    fn test_trade_at_worse_price_does_not_advance() {
        let snap = snapshot(&[("0.55", "10")], &[]);
        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);

        // A print above our bid does not touch our level.
        assert!(sim.process_trade(&tape("0.56", "100")).is_empty());
        assert_eq!(
            sim.entry("o1").unwrap().cumulative_volume_at_price,
            Decimal::ZERO
        );

        // A print below does (the book traded through us).
        assert_eq!(sim.process_trade(&tape("0.54", "10")), vec!["o1".to_string()]);
    }

    #[test]
    fn test_other_asset_ignored() {
        let snap = snapshot(&[("0.55", "5")], &[]);
        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);

        let mut other = tape("0.55", "50");
        other.asset_id = "different".to_string();
        assert!(sim.process_trade(&other).is_empty());
    }

    #[test]
    fn test_remove_order_stops_tracking() {
        let snap = snapshot(&[("0.55", "5")], &[]);
        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);
        sim.remove_order("o1");

        assert!(sim.is_empty());
        assert!(sim.process_trade(&tape("0.55", "50")).is_empty());
    }

    #[test]
    fn test_zero_probability_never_fills() {
        let snap = snapshot(&[("0.55", "5")], &[]);
        let mut sim = QueueSimulator::new(0.0, Some(7));
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);

        for _ in 0..50 {
            assert!(sim.process_trade(&tape("0.55", "50")).is_empty());
        }
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let snap = snapshot(&[("0.55", "5")], &[]);
        let run = |seed: u64| {
            let mut sim = QueueSimulator::new(0.5, Some(seed));
            sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);
            let mut fired_at = None;
            for i in 0..100 {
                if !sim.process_trade(&tape("0.55", "50")).is_empty() {
                    fired_at = Some(i);
                    break;
                }
            }
            fired_at
        };

        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_empty_book_means_front_of_queue() {
        let snap = snapshot(&[], &[]);
        let mut sim = QueueSimulator::new(1.0, None);
        sim.add_order(&resting_buy("o1", "0.55", "5"), &snap);

        assert_eq!(sim.entry("o1").unwrap().size_ahead, Decimal::ZERO);
        // First aggressing print fills immediately.
        assert_eq!(sim.process_trade(&tape("0.55", "1")), vec!["o1".to_string()]);
    }
}
