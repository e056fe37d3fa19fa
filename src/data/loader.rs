//! Historical data loading and the time-merged replay event stream.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backtest::config::BacktestConfig;
use crate::types::{Market, OrderbookSnapshot, Trade};

use super::store::SqliteStore;

const GAP_THRESHOLD_MS: i64 = 10_000;

/// Everything a single backtest run replays.
pub struct BacktestDataset {
    pub orderbooks: Vec<OrderbookSnapshot>,
    pub trades: Vec<Trade>,
    pub markets: HashMap<String, Market>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
}

/// One element of the merged stream.
#[derive(Debug)]
pub struct BacktestEvent<'a> {
    /// Strictly increasing across the run; usable for deterministic
    /// sampling.
    pub event_index: u64,
    pub timestamp_ms: i64,
    pub kind: EventKind<'a>,
}

#[derive(Debug)]
pub enum EventKind<'a> {
    Orderbook(&'a OrderbookSnapshot),
    Trade(&'a Trade),
}

impl BacktestDataset {
    pub fn total_events(&self) -> usize {
        self.orderbooks.len() + self.trades.len()
    }

    /// Merge snapshots and trades into a single non-decreasing timestamp
    /// stream. At equal timestamps the trade comes first: the print is
    /// the cause of the book change that follows.
    pub fn events(&self) -> EventIter<'_> {
        EventIter {
            dataset: self,
            book_idx: 0,
            trade_idx: 0,
            next_index: 0,
        }
    }
}

pub struct EventIter<'a> {
    dataset: &'a BacktestDataset,
    book_idx: usize,
    trade_idx: usize,
    next_index: u64,
}

impl<'a> Iterator for EventIter<'a> {
    type Item = BacktestEvent<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let book = self.dataset.orderbooks.get(self.book_idx);
        let trade = self.dataset.trades.get(self.trade_idx);

        let take_trade = match (book, trade) {
            (None, None) => return None,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(book), Some(trade)) => trade.timestamp <= book.timestamp,
        };

        let event_index = self.next_index;
        self.next_index += 1;

        if take_trade {
            let trade = trade.expect("checked above");
            self.trade_idx += 1;
            Some(BacktestEvent {
                event_index,
                timestamp_ms: trade.timestamp,
                kind: EventKind::Trade(trade),
            })
        } else {
            let book = book.expect("checked above");
            self.book_idx += 1;
            Some(BacktestEvent {
                event_index,
                timestamp_ms: book.timestamp,
                kind: EventKind::Orderbook(book),
            })
        }
    }
}

/// Loads a [`BacktestDataset`] from the capture store and runs warn-only
/// sanity checks over it. Load failures are fatal to the run; data
/// quality findings are not.
pub struct DataLoader {
    store: Arc<SqliteStore>,
}

impl DataLoader {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, config: &BacktestConfig) -> Result<BacktestDataset> {
        config.validate().context("invalid backtest config")?;

        info!(
            start_time_ms = config.start_time_ms,
            end_time_ms = config.end_time_ms,
            venue = ?config.venue,
            listener_id = ?config.listener_id,
            include_forward_filled = config.include_forward_filled,
            "loading backtest data"
        );

        let asset_ids: Option<Vec<String>> = match (&config.asset_ids, &config.listener_id) {
            (Some(ids), _) => Some(ids.clone()),
            (None, Some(listener_id)) => {
                let ids = self
                    .store
                    .asset_ids_for_listener(listener_id, config.venue)
                    .context("failed to resolve listener assets")?;
                info!(listener_id = %listener_id, asset_count = ids.len(), "resolved assets from listener");
                Some(ids)
            }
            (None, None) => None,
        };

        let orderbooks = self
            .store
            .load_snapshots_range(
                config.start_time_ms,
                config.end_time_ms,
                config.venue,
                config.listener_id.as_deref(),
                asset_ids.as_deref(),
                config.include_forward_filled,
            )
            .context("failed to load orderbook snapshots")?;

        let trades = self
            .store
            .load_trades_range(
                config.start_time_ms,
                config.end_time_ms,
                config.venue,
                config.listener_id.as_deref(),
                asset_ids.as_deref(),
            )
            .context("failed to load trades")?;

        let markets = self
            .store
            .load_markets(asset_ids.as_deref(), config.venue, config.listener_id.as_deref())
            .context("failed to load market metadata")?;

        if orderbooks.is_empty() && trades.is_empty() {
            warn!(
                start_time_ms = config.start_time_ms,
                end_time_ms = config.end_time_ms,
                "empty dataset: no orderbooks or trades in range"
            );
        }

        validate_monotonic(
            orderbooks.iter().map(|s| (s.asset_id.as_str(), s.timestamp)),
            "orderbook",
        );
        validate_monotonic(
            trades.iter().map(|t| (t.asset_id.as_str(), t.timestamp)),
            "trade",
        );
        detect_gaps(orderbooks.iter().map(|s| (s.asset_id.as_str(), s.timestamp)));

        let total = orderbooks.len() + trades.len();
        if total > config.max_events_in_memory {
            warn!(
                total_events = total,
                max_events = config.max_events_in_memory,
                "loaded events exceed safety limit"
            );
        }

        info!(
            orderbooks = orderbooks.len(),
            trades = trades.len(),
            markets = markets.len(),
            "data loaded"
        );

        Ok(BacktestDataset {
            orderbooks,
            trades,
            markets,
            start_time_ms: config.start_time_ms,
            end_time_ms: config.end_time_ms,
        })
    }
}

/// Per-asset timestamps must not go backwards; violations are logged,
/// not fatal.
fn validate_monotonic<'a, I>(events: I, event_type: &str)
where
    I: Iterator<Item = (&'a str, i64)>,
{
    let mut last_seen: HashMap<&str, i64> = HashMap::new();
    let mut violations = 0usize;
    for (asset_id, timestamp) in events {
        if let Some(prev) = last_seen.get(asset_id) {
            if timestamp < *prev {
                violations += 1;
                warn!(
                    asset_id = %asset_id,
                    event_type = %event_type,
                    prev_timestamp = prev,
                    curr_timestamp = timestamp,
                    "out-of-order timestamp"
                );
            }
        }
        last_seen.insert(asset_id, timestamp);
    }
    if violations > 0 {
        warn!(
            total_violations = violations,
            event_type = %event_type,
            "found out-of-order timestamps"
        );
    }
}

fn detect_gaps<'a, I>(events: I)
where
    I: Iterator<Item = (&'a str, i64)>,
{
    let mut last_seen: HashMap<&str, i64> = HashMap::new();
    let mut gaps = 0usize;
    for (asset_id, timestamp) in events {
        if let Some(prev) = last_seen.get(asset_id) {
            let gap = timestamp - prev;
            if gap > GAP_THRESHOLD_MS {
                gaps += 1;
                warn!(
                    asset_id = %asset_id,
                    gap_start_ms = prev,
                    gap_end_ms = timestamp,
                    gap_duration_ms = gap,
                    "data gap in orderbook snapshots"
                );
            }
        }
        last_seen.insert(asset_id, timestamp);
    }
    if gaps > 0 {
        warn!(total_gaps = gaps, "found data gaps over threshold");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::SchemaCaps;
    use crate::types::{Market, PriceLevel, TradeSide, Venue};
    use rust_decimal_macros::dec;

    fn snapshot(asset: &str, ts: i64) -> OrderbookSnapshot {
        let mut snap = OrderbookSnapshot::new(
            "l1",
            asset,
            "mkt",
            ts,
            vec![PriceLevel::new(dec!(0.55), dec!(10))],
            vec![PriceLevel::new(dec!(0.56), dec!(5))],
        );
        snap.venue = Some(Venue::Polymarket);
        snap
    }

    fn trade(asset: &str, ts: i64) -> Trade {
        Trade {
            listener_id: "l1".to_string(),
            asset_id: asset.to_string(),
            market: "mkt".to_string(),
            timestamp: ts,
            price: dec!(0.55),
            size: dec!(2),
            side: TradeSide::Buy,
            fee_rate_bps: None,
            venue: Some(Venue::Polymarket),
        }
    }

    fn dataset(orderbooks: Vec<OrderbookSnapshot>, trades: Vec<Trade>) -> BacktestDataset {
        BacktestDataset {
            orderbooks,
            trades,
            markets: HashMap::new(),
            start_time_ms: 0,
            end_time_ms: 10_000,
        }
    }

    #[test]
    fn test_merge_orders_by_timestamp() {
        let ds = dataset(
            vec![snapshot("a", 1_000), snapshot("a", 3_000)],
            vec![trade("a", 2_000)],
        );
        let timestamps: Vec<i64> = ds.events().map(|e| e.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn test_trade_precedes_snapshot_at_equal_timestamp() {
        let ds = dataset(vec![snapshot("a", 1_000)], vec![trade("a", 1_000)]);
        let events: Vec<_> = ds.events().collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_index, 0);
        assert!(matches!(events[0].kind, EventKind::Trade(_)));
        assert_eq!(events[1].event_index, 1);
        assert!(matches!(events[1].kind, EventKind::Orderbook(_)));
    }

    #[test]
    fn test_event_index_strictly_increases_and_ts_non_decreasing() {
        let ds = dataset(
            vec![snapshot("a", 1_000), snapshot("b", 1_000), snapshot("a", 2_000)],
            vec![trade("a", 1_000), trade("a", 2_000), trade("b", 2_000)],
        );
        let events: Vec<_> = ds.events().collect();
        assert_eq!(events.len(), 6);
        for pair in events.windows(2) {
            assert_eq!(pair[1].event_index, pair[0].event_index + 1);
            assert!(pair[1].timestamp_ms >= pair[0].timestamp_ms);
        }
    }

    #[test]
    fn test_empty_dataset_yields_no_events() {
        let ds = dataset(vec![], vec![]);
        assert_eq!(ds.events().count(), 0);
        assert_eq!(ds.total_events(), 0);
    }

    fn seeded_store() -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        store
            .upsert_market(&Market::new("l1", "cond", "tok", Venue::Polymarket))
            .unwrap();
        store
            .insert_snapshot_rows(
                &[snapshot("tok", 1_000), snapshot("tok", 3_000)],
                SchemaCaps::default(),
            )
            .unwrap();
        store
            .insert_trade_rows(&[trade("tok", 2_000)], SchemaCaps::default())
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_load_resolves_assets_from_listener() {
        let loader = DataLoader::new(seeded_store());
        let mut config = BacktestConfig::new(0, 10_000);
        config.listener_id = Some("l1".to_string());

        let ds = loader.load(&config).unwrap();
        assert_eq!(ds.orderbooks.len(), 2);
        assert_eq!(ds.trades.len(), 1);
        assert_eq!(ds.markets.len(), 1);
        assert!(ds.markets.contains_key("tok"));
    }

    #[test]
    fn test_load_with_explicit_assets() {
        let loader = DataLoader::new(seeded_store());
        let mut config = BacktestConfig::new(0, 10_000);
        config.asset_ids = Some(vec!["other".to_string()]);

        let ds = loader.load(&config).unwrap();
        assert!(ds.orderbooks.is_empty());
        assert!(ds.trades.is_empty());
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let loader = DataLoader::new(seeded_store());
        // No scope at all.
        let config = BacktestConfig::new(0, 10_000);
        assert!(loader.load(&config).is_err());
    }

    #[test]
    fn test_time_range_bounds_load() {
        let loader = DataLoader::new(seeded_store());
        let mut config = BacktestConfig::new(0, 1_500);
        config.listener_id = Some("l1".to_string());

        let ds = loader.load(&config).unwrap();
        assert_eq!(ds.orderbooks.len(), 1);
        assert!(ds.trades.is_empty());
    }
}
