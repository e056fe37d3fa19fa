//! Order and fill models for the replay execution engine.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Good 'til cancelled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
}

/// Why a fill happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillReason {
    /// Matched immediately against resting liquidity.
    Immediate,
    /// A resting order's simulated queue position was reached by the tape.
    QueueReached,
    /// Filled at market settlement.
    Settlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientFunds,
    InsufficientPosition,
    NoLiquidity,
    InvalidPrice,
    InvalidSize,
    FokNotFillable,
    OrderExpired,
}

/// Construction-time validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("quantity must be greater than zero")]
    NonPositiveQuantity,
    #[error("limit price must be within [0, 1]")]
    PriceOutOfRange,
}

/// A simulated order tracked through its lifecycle.
///
/// `order_id` is assigned by the execution engine on submission; the
/// remaining state (`status`, `filled_quantity`, `avg_fill_price`,
/// `rejection_reason`) is mutated only by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Present for limit orders, absent for market orders.
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub submitted_at: Option<i64>,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub rejection_reason: Option<RejectReason>,
}

impl Order {
    /// Create a limit order. Fails when the quantity is non-positive or
    /// the price falls outside [0, 1].
    pub fn limit(
        asset_id: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        time_in_force: TimeInForce,
    ) -> Result<Order, OrderError> {
        if quantity <= Decimal::ZERO {
            return Err(OrderError::NonPositiveQuantity);
        }
        if price < Decimal::ZERO || price > dec!(1) {
            return Err(OrderError::PriceOutOfRange);
        }
        Ok(Order {
            order_id: String::new(),
            asset_id: asset_id.to_string(),
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity,
            time_in_force,
            status: OrderStatus::Pending,
            submitted_at: None,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            rejection_reason: None,
        })
    }

    /// Create a market order. Market orders never carry a price.
    pub fn market(
        asset_id: &str,
        side: OrderSide,
        quantity: Decimal,
        time_in_force: TimeInForce,
    ) -> Result<Order, OrderError> {
        if quantity <= Decimal::ZERO {
            return Err(OrderError::NonPositiveQuantity);
        }
        Ok(Order {
            order_id: String::new(),
            asset_id: asset_id.to_string(),
            side,
            order_type: OrderType::Market,
            price: None,
            quantity,
            time_in_force,
            status: OrderStatus::Pending,
            submitted_at: None,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            rejection_reason: None,
        })
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }
}

/// An execution against a simulated order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fees: Decimal,
    pub timestamp_ms: i64,
    /// Whether the fill provided liquidity (fee attribution).
    pub is_maker: bool,
    pub reason: FillReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_order_construction() {
        let order = Order::limit("tok", OrderSide::Buy, dec!(0.55), dec!(10), TimeInForce::Gtc)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.price, Some(dec!(0.55)));
        assert_eq!(order.remaining_quantity(), dec!(10));
        assert!(!order.is_fully_filled());
    }

    #[test]
    fn test_limit_order_rejects_bad_price() {
        assert_eq!(
            Order::limit("tok", OrderSide::Buy, dec!(1.5), dec!(10), TimeInForce::Gtc),
            Err(OrderError::PriceOutOfRange)
        );
        assert_eq!(
            Order::limit("tok", OrderSide::Buy, dec!(-0.1), dec!(10), TimeInForce::Gtc),
            Err(OrderError::PriceOutOfRange)
        );
    }

    #[test]
    fn test_non_positive_quantity_rejected() {
        assert_eq!(
            Order::limit("tok", OrderSide::Sell, dec!(0.5), Decimal::ZERO, TimeInForce::Gtc),
            Err(OrderError::NonPositiveQuantity)
        );
        assert_eq!(
            Order::market("tok", OrderSide::Buy, dec!(-1), TimeInForce::Gtc),
            Err(OrderError::NonPositiveQuantity)
        );
    }

    #[test]
    fn test_market_order_has_no_price() {
        let order = Order::market("tok", OrderSide::Sell, dec!(3), TimeInForce::Ioc).unwrap();
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.price, None);
    }

    #[test]
    fn test_remaining_quantity_tracks_fills() {
        let mut order =
            Order::limit("tok", OrderSide::Buy, dec!(0.5), dec!(10), TimeInForce::Gtc).unwrap();
        order.filled_quantity = dec!(4);
        assert_eq!(order.remaining_quantity(), dec!(6));
        order.filled_quantity = dec!(10);
        assert!(order.is_fully_filled());
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
