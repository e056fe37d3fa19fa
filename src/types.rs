//! Venue-agnostic types shared by the capture pipeline and the backtester.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Polymarket,
    Kalshi,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Polymarket => "polymarket",
            Venue::Kalshi => "kalshi",
        }
    }

    pub fn parse(s: &str) -> Option<Venue> {
        match s {
            "polymarket" => Some(Venue::Polymarket),
            "kalshi" => Some(Venue::Kalshi),
            _ => None,
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a tracked market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketState {
    Discovered,
    Tracking,
    Closed,
    Resolved,
}

impl MarketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketState::Discovered => "discovered",
            MarketState::Tracking => "tracking",
            MarketState::Closed => "closed",
            MarketState::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<MarketState> {
        match s {
            "discovered" => Some(MarketState::Discovered),
            "tracking" => Some(MarketState::Tracking),
            "closed" => Some(MarketState::Closed),
            "resolved" => Some(MarketState::Resolved),
            _ => None,
        }
    }
}

/// One tradable outcome token.
///
/// For two-token venues each question yields two of these (one per
/// outcome); for single-ticker venues the ticker is both the condition
/// and the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub listener_id: String,
    /// Question identifier shared by both outcome tokens.
    pub condition_id: String,
    /// Tradable-asset identifier (token id or ticker).
    pub token_id: String,
    pub market_slug: Option<String>,
    pub question: Option<String>,
    /// Outcome label ("Yes"/"No") where the venue provides one.
    pub outcome: Option<String>,
    /// 0 = Yes, 1 = No.
    pub outcome_index: Option<i64>,
    pub event_id: Option<String>,
    pub event_title: Option<String>,
    pub category: Option<String>,
    pub series_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    pub volume: Option<Decimal>,
    pub liquidity: Option<Decimal>,
    pub is_active: bool,
    pub is_closed: bool,
    pub state: MarketState,
    pub venue: Venue,
}

impl Market {
    /// Minimal market for tests and discovery paths that only know identity.
    pub fn new(listener_id: &str, condition_id: &str, token_id: &str, venue: Venue) -> Self {
        Self {
            listener_id: listener_id.to_string(),
            condition_id: condition_id.to_string(),
            token_id: token_id.to_string(),
            market_slug: None,
            question: None,
            outcome: None,
            outcome_index: None,
            event_id: None,
            event_title: None,
            category: None,
            series_id: None,
            tags: None,
            description: None,
            volume: None,
            liquidity: None,
            is_active: true,
            is_closed: false,
            state: MarketState::Discovered,
            venue,
        }
    }
}

/// A single price level: exact price in [0, 1] and resting size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Full orderbook state for one asset at one instant.
///
/// Bids are ordered best-first (descending price), asks best-first
/// (ascending price). Derived fields are populated by
/// [`compute_metrics`](OrderbookSnapshot::compute_metrics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub listener_id: String,
    pub asset_id: String,
    pub market: String,
    /// Milliseconds UTC.
    pub timestamp: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub hash: Option<String>,

    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub bid_depth: Option<Decimal>,
    pub ask_depth: Option<Decimal>,

    /// True when this row is a synthetic copy emitted by the forward filler.
    pub is_forward_filled: bool,
    /// Original event timestamp when forward-filled.
    pub source_timestamp: Option<i64>,
    pub venue: Option<Venue>,
}

impl OrderbookSnapshot {
    pub fn new(
        listener_id: &str,
        asset_id: &str,
        market: &str,
        timestamp: i64,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        let mut snapshot = Self {
            listener_id: listener_id.to_string(),
            asset_id: asset_id.to_string(),
            market: market.to_string(),
            timestamp,
            bids,
            asks,
            hash: None,
            best_bid: None,
            best_ask: None,
            spread: None,
            mid_price: None,
            bid_depth: None,
            ask_depth: None,
            is_forward_filled: false,
            source_timestamp: None,
            venue: None,
        };
        snapshot.compute_metrics();
        snapshot
    }

    /// Recompute derived fields from the level vectors.
    pub fn compute_metrics(&mut self) {
        if let Some(best) = self.bids.first() {
            self.best_bid = Some(best.price);
            self.bid_depth = Some(self.bids.iter().map(|l| l.size).sum());
        }
        if let Some(best) = self.asks.first() {
            self.best_ask = Some(best.price);
            self.ask_depth = Some(self.asks.iter().map(|l| l.size).sum());
        }
        if let (Some(bid), Some(ask)) = (self.best_bid, self.best_ask) {
            self.spread = Some(ask - bid);
            self.mid_price = Some((bid + ask) / dec!(2));
        }
    }

    /// True when both sides are populated and the book is crossed.
    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best_bid, self.best_ask),
            (Some(bid), Some(ask)) if bid >= ask
        )
    }
}

/// Aggressor side of a tape print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<TradeSide> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "yes" => Some(TradeSide::Buy),
            "sell" | "no" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One print from the venue trade tape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub listener_id: String,
    pub asset_id: String,
    pub market: String,
    /// Milliseconds UTC.
    pub timestamp: i64,
    pub price: Decimal,
    pub size: Decimal,
    pub side: TradeSide,
    pub fee_rate_bps: Option<u32>,
    pub venue: Option<Venue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: &str, size: &str) -> PriceLevel {
        PriceLevel::new(price.parse().unwrap(), size.parse().unwrap())
    }

    #[test]
    fn test_compute_metrics_full_book() {
        let snap = OrderbookSnapshot::new(
            "l1",
            "tok",
            "mkt",
            1_000,
            vec![level("0.55", "10"), level("0.54", "20")],
            vec![level("0.56", "5"), level("0.57", "15")],
        );

        assert_eq!(snap.best_bid, Some(dec!(0.55)));
        assert_eq!(snap.best_ask, Some(dec!(0.56)));
        assert_eq!(snap.spread, Some(dec!(0.01)));
        assert_eq!(snap.mid_price, Some(dec!(0.555)));
        assert_eq!(snap.bid_depth, Some(dec!(30)));
        assert_eq!(snap.ask_depth, Some(dec!(20)));
        assert!(!snap.is_crossed());
    }

    #[test]
    fn test_compute_metrics_one_sided() {
        let snap = OrderbookSnapshot::new("l1", "tok", "mkt", 0, vec![level("0.40", "7")], vec![]);

        assert_eq!(snap.best_bid, Some(dec!(0.40)));
        assert_eq!(snap.best_ask, None);
        assert_eq!(snap.spread, None);
        assert_eq!(snap.mid_price, None);
        assert_eq!(snap.ask_depth, None);
        assert!(!snap.is_crossed());
    }

    #[test]
    fn test_crossed_book_detected() {
        let snap = OrderbookSnapshot::new(
            "l1",
            "tok",
            "mkt",
            0,
            vec![level("0.60", "10")],
            vec![level("0.58", "10")],
        );
        assert!(snap.is_crossed());
    }

    #[test]
    fn test_mid_price_is_exact() {
        // 0.55 and 0.56 must give exactly 0.555, not a binary float approximation.
        let snap = OrderbookSnapshot::new(
            "l1",
            "tok",
            "mkt",
            0,
            vec![level("0.55", "1")],
            vec![level("0.56", "1")],
        );
        assert_eq!(snap.mid_price.unwrap().to_string(), "0.555");
    }

    #[test]
    fn test_trade_side_parsing() {
        assert_eq!(TradeSide::parse("buy"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("SELL"), Some(TradeSide::Sell));
        // Single-ticker venues report the taker side as yes/no.
        assert_eq!(TradeSide::parse("yes"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("no"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("hold"), None);
    }

    #[test]
    fn test_venue_roundtrip() {
        assert_eq!(Venue::parse("kalshi"), Some(Venue::Kalshi));
        assert_eq!(Venue::parse(Venue::Polymarket.as_str()), Some(Venue::Polymarket));
        assert_eq!(Venue::parse("nyse"), None);
    }

    #[test]
    fn test_market_state_roundtrip() {
        for state in [
            MarketState::Discovered,
            MarketState::Tracking,
            MarketState::Closed,
            MarketState::Resolved,
        ] {
            assert_eq!(MarketState::parse(state.as_str()), Some(state));
        }
    }
}
