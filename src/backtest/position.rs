//! Per-asset position accounting with signed quantities.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

/// Position in a single asset.
///
/// Quantity is signed: positive long, negative short. The average entry
/// price is maintained over additions and resets to zero when the
/// position goes flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset_id: String,
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_fees_paid: Decimal,
}

impl Position {
    pub fn new(asset_id: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            total_fees_paid: Decimal::ZERO,
        }
    }

    /// Apply a fill and return the realized P&L from this fill (zero when
    /// the fill only opens or adds to the position).
    ///
    /// Buys against a short and sells against a long reduce first; any
    /// excess flips the position with a fresh entry price at the fill
    /// price.
    pub fn apply_fill(
        &mut self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        fees: Decimal,
    ) -> Decimal {
        let mut realized = Decimal::ZERO;
        self.total_fees_paid += fees;

        match side {
            OrderSide::Buy => {
                if self.quantity >= Decimal::ZERO {
                    // Adding to a long (or opening from flat).
                    let total_cost = self.avg_entry_price * self.quantity + price * quantity;
                    self.quantity += quantity;
                    if self.quantity > Decimal::ZERO {
                        self.avg_entry_price = total_cost / self.quantity;
                    } else {
                        self.avg_entry_price = Decimal::ZERO;
                    }
                } else {
                    // Reducing a short.
                    let reduce_qty = quantity.min(self.quantity.abs());
                    realized = (self.avg_entry_price - price) * reduce_qty;
                    self.realized_pnl += realized;
                    self.quantity += quantity;

                    if self.quantity > Decimal::ZERO {
                        self.avg_entry_price = price;
                    } else if self.quantity == Decimal::ZERO {
                        self.avg_entry_price = Decimal::ZERO;
                    }
                }
            }
            OrderSide::Sell => {
                if self.quantity > Decimal::ZERO {
                    // Reducing a long.
                    let reduce_qty = quantity.min(self.quantity);
                    realized = (price - self.avg_entry_price) * reduce_qty;
                    self.realized_pnl += realized;
                    self.quantity -= quantity;

                    if self.quantity < Decimal::ZERO {
                        self.avg_entry_price = price;
                    } else if self.quantity == Decimal::ZERO {
                        self.avg_entry_price = Decimal::ZERO;
                    }
                } else {
                    // Adding to a short (or opening from flat).
                    let total_cost = self.avg_entry_price * self.quantity.abs() + price * quantity;
                    self.quantity -= quantity;
                    if self.quantity != Decimal::ZERO {
                        self.avg_entry_price = total_cost / self.quantity.abs();
                    } else {
                        self.avg_entry_price = Decimal::ZERO;
                    }
                }
            }
        }

        realized
    }

    /// Refresh unrealized P&L against a mark price.
    pub fn update_unrealized_pnl(&mut self, mark: Decimal) {
        if self.quantity > Decimal::ZERO {
            self.unrealized_pnl = (mark - self.avg_entry_price) * self.quantity;
        } else if self.quantity < Decimal::ZERO {
            self.unrealized_pnl = (self.avg_entry_price - mark) * self.quantity.abs();
        } else {
            self.unrealized_pnl = Decimal::ZERO;
        }
    }

    pub fn market_value(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }
}

/// All positions belonging to one condition (question).
///
/// A binary market carries up to two outcome tokens; this aggregates
/// them for market-level P&L and exposure queries.
#[derive(Debug, Clone, Default)]
pub struct MarketPosition {
    pub market_id: String,
    pub positions: HashMap<String, Position>,
}

impl MarketPosition {
    pub fn new(market_id: &str) -> Self {
        Self {
            market_id: market_id.to_string(),
            positions: HashMap::new(),
        }
    }

    pub fn position(&self, asset_id: &str) -> Option<&Position> {
        self.positions.get(asset_id)
    }

    pub fn total_pnl(&self) -> Decimal {
        self.positions.values().map(Position::total_pnl).sum()
    }

    /// Net market-value exposure over positions with known marks.
    pub fn net_exposure(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .iter()
            .filter_map(|(asset_id, pos)| prices.get(asset_id).map(|p| pos.market_value(*p)))
            .sum()
    }
}
