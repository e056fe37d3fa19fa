//! Buffered persistence with schema tolerance.
//!
//! Snapshots and trades accumulate in per-listener buffers and flush as
//! one multi-row insert when a buffer reaches its threshold or the
//! periodic flush task fires. A missing-column failure downgrades the
//! writer's schema capabilities and retries once without the offending
//! fields; a foreign-key failure (data raced ahead of discovery) drops
//! the batch outright. Live capture favors forward progress over
//! at-least-once delivery of every row.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::types::{OrderbookSnapshot, Trade};

use super::store::{SchemaCaps, SqliteStore};

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL_MS: u64 = 1_000;

enum WriteFailure {
    MissingColumn(String),
    ForeignKey,
    Other,
}

fn classify(err: &rusqlite::Error) -> WriteFailure {
    let message = err.to_string().to_lowercase();
    if let Some(idx) = message.find("no column named ") {
        let column = message[idx + "no column named ".len()..]
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        return WriteFailure::MissingColumn(column);
    }
    if message.contains("foreign key") {
        return WriteFailure::ForeignKey;
    }
    WriteFailure::Other
}

/// Lower the capability that covers `column`. Returns false when the
/// column is not one the writer knows how to live without.
fn downgrade(caps: &mut SchemaCaps, column: &str) -> bool {
    match column {
        "venue" if caps.has_venue_column => {
            caps.has_venue_column = false;
            true
        }
        "is_forward_filled" | "source_timestamp" if caps.has_forward_fill_columns => {
            caps.has_forward_fill_columns = false;
            true
        }
        _ => false,
    }
}

struct WriterInner {
    snapshots: Vec<OrderbookSnapshot>,
    trades: Vec<Trade>,
    caps: SchemaCaps,
}

pub struct BatchWriter {
    store: Arc<SqliteStore>,
    listener_id: String,
    inner: Mutex<WriterInner>,
    batch_size: usize,
    flush_interval_ms: u64,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    pub fn new(store: Arc<SqliteStore>, listener_id: &str) -> Self {
        Self::with_tuning(store, listener_id, BATCH_SIZE, FLUSH_INTERVAL_MS)
    }

    pub fn with_tuning(
        store: Arc<SqliteStore>,
        listener_id: &str,
        batch_size: usize,
        flush_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            listener_id: listener_id.to_string(),
            inner: Mutex::new(WriterInner {
                snapshots: Vec::new(),
                trades: Vec::new(),
                caps: SchemaCaps::default(),
            }),
            batch_size,
            flush_interval_ms,
            flush_task: Mutex::new(None),
        }
    }

    /// Spawn the periodic flush task.
    pub fn start(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        let interval = Duration::from_millis(self.flush_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                writer.flush();
            }
        });
        *self.flush_task.lock() = Some(handle);
        debug!(listener_id = %self.listener_id, "batch writer started");
    }

    /// Stop the flush task and drain whatever is buffered.
    pub fn stop(&self) {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
        self.flush();
        debug!(listener_id = %self.listener_id, "batch writer stopped");
    }

    pub fn write_snapshot(&self, snapshot: OrderbookSnapshot) {
        let should_flush = {
            let mut inner = self.inner.lock();
            inner.snapshots.push(snapshot);
            inner.snapshots.len() >= self.batch_size
        };
        if should_flush {
            self.flush_snapshots();
        }
    }

    pub fn write_trade(&self, trade: Trade) {
        let should_flush = {
            let mut inner = self.inner.lock();
            inner.trades.push(trade);
            inner.trades.len() >= self.batch_size
        };
        if should_flush {
            self.flush_trades();
        }
    }

    pub fn flush(&self) {
        self.flush_snapshots();
        self.flush_trades();
    }

    pub fn caps(&self) -> SchemaCaps {
        self.inner.lock().caps
    }

    fn flush_snapshots(&self) {
        let (batch, mut caps) = {
            let mut inner = self.inner.lock();
            if inner.snapshots.is_empty() {
                return;
            }
            (mem::take(&mut inner.snapshots), inner.caps)
        };

        // Each missing-column failure strips one capability and retries;
        // with two downgradable capabilities the loop is bounded.
        loop {
            match self.store.insert_snapshot_rows(&batch, caps) {
                Ok(()) => {
                    debug!(listener_id = %self.listener_id, count = batch.len(), "flushed snapshots");
                    return;
                }
                Err(err) => match classify(&err) {
                    WriteFailure::ForeignKey => {
                        // Rows referencing markets discovery has not
                        // persisted yet will never succeed; drop them.
                        warn!(
                            listener_id = %self.listener_id,
                            dropped = batch.len(),
                            "snapshot flush hit foreign key violation, dropping batch"
                        );
                        return;
                    }
                    WriteFailure::MissingColumn(column) => {
                        let mut inner = self.inner.lock();
                        if downgrade(&mut inner.caps, &column) {
                            warn!(
                                listener_id = %self.listener_id,
                                column = %column,
                                "schema missing column, retrying without it"
                            );
                            caps = inner.caps;
                            continue;
                        }
                        error!(listener_id = %self.listener_id, error = %err, "snapshot flush failed");
                        inner.snapshots.splice(0..0, batch);
                        return;
                    }
                    WriteFailure::Other => {
                        error!(listener_id = %self.listener_id, error = %err, "snapshot flush failed");
                        self.inner.lock().snapshots.splice(0..0, batch);
                        return;
                    }
                },
            }
        }
    }

    fn flush_trades(&self) {
        let (batch, mut caps) = {
            let mut inner = self.inner.lock();
            if inner.trades.is_empty() {
                return;
            }
            (mem::take(&mut inner.trades), inner.caps)
        };

        loop {
            match self.store.insert_trade_rows(&batch, caps) {
                Ok(()) => {
                    debug!(listener_id = %self.listener_id, count = batch.len(), "flushed trades");
                    return;
                }
                Err(err) => match classify(&err) {
                    WriteFailure::ForeignKey => {
                        warn!(
                            listener_id = %self.listener_id,
                            dropped = batch.len(),
                            "trade flush hit foreign key violation, dropping batch"
                        );
                        return;
                    }
                    WriteFailure::MissingColumn(column) => {
                        let mut inner = self.inner.lock();
                        if downgrade(&mut inner.caps, &column) {
                            warn!(
                                listener_id = %self.listener_id,
                                column = %column,
                                "schema missing column, retrying without it"
                            );
                            caps = inner.caps;
                            continue;
                        }
                        error!(listener_id = %self.listener_id, error = %err, "trade flush failed");
                        inner.trades.splice(0..0, batch);
                        return;
                    }
                    WriteFailure::Other => {
                        error!(listener_id = %self.listener_id, error = %err, "trade flush failed");
                        self.inner.lock().trades.splice(0..0, batch);
                        return;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Market, PriceLevel, TradeSide, Venue};
    use rust_decimal_macros::dec;

    fn store_with_market(token: &str) -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        store
            .upsert_market(&Market::new("l1", "cond", token, Venue::Polymarket))
            .unwrap();
        Arc::new(store)
    }

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

    fn snapshot_count(store: &SqliteStore) -> i64 {
        store
            .conn()
            .query_row("SELECT COUNT(*) FROM orderbook_snapshots", [], |r| r.get(0))
            .unwrap()
    }

    fn trade_count(store: &SqliteStore) -> i64 {
        store
            .conn()
            .query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_buffer_flushes_at_threshold() {
        let store = store_with_market("tok");
        let writer = BatchWriter::with_tuning(Arc::clone(&store), "l1", 3, 60_000);

        writer.write_snapshot(snapshot("tok", 1));
        writer.write_snapshot(snapshot("tok", 2));
        assert_eq!(snapshot_count(&store), 0);

        // Third write crosses the threshold.
        writer.write_snapshot(snapshot("tok", 3));
        assert_eq!(snapshot_count(&store), 3);
    }

    #[test]
    fn test_explicit_flush_drains_partial_buffers() {
        let store = store_with_market("tok");
        let writer = BatchWriter::with_tuning(Arc::clone(&store), "l1", 100, 60_000);

        writer.write_snapshot(snapshot("tok", 1));
        writer.write_trade(trade("tok", 1));
        writer.flush();

        assert_eq!(snapshot_count(&store), 1);
        assert_eq!(trade_count(&store), 1);
    }

    #[test]
    fn test_fk_violation_drops_batch() {
        let store = store_with_market("tok");
        let writer = BatchWriter::with_tuning(Arc::clone(&store), "l1", 100, 60_000);

        // "ghost" has no market row: the whole batch is dropped, not retried.
        writer.write_snapshot(snapshot("ghost", 1));
        writer.flush();
        assert_eq!(snapshot_count(&store), 0);

        // The writer keeps going afterwards.
        writer.write_snapshot(snapshot("tok", 2));
        writer.flush();
        assert_eq!(snapshot_count(&store), 1);
    }

    #[test]
    fn test_missing_venue_column_downgrades_and_retries() {
        let store = SqliteStore::in_memory().unwrap();
        // Old deployment: markets exist but snapshots lack venue and
        // forward-fill columns.
        store
            .conn()
            .execute_batch(
                "CREATE TABLE markets (
                     listener_id TEXT NOT NULL, token_id TEXT NOT NULL,
                     condition_id TEXT NOT NULL, market_slug TEXT, question TEXT,
                     outcome TEXT, outcome_index INTEGER, event_id TEXT,
                     event_title TEXT, category TEXT, series_id TEXT, tags TEXT,
                     description TEXT, volume TEXT, liquidity TEXT,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     is_closed INTEGER NOT NULL DEFAULT 0,
                     state TEXT NOT NULL DEFAULT 'discovered', venue TEXT,
                     PRIMARY KEY (listener_id, token_id)
                 );
                 CREATE TABLE orderbook_snapshots (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     listener_id TEXT NOT NULL, asset_id TEXT NOT NULL,
                     market TEXT NOT NULL DEFAULT '', timestamp INTEGER NOT NULL,
                     bids TEXT NOT NULL, asks TEXT NOT NULL,
                     best_bid TEXT, best_ask TEXT, spread TEXT, mid_price TEXT,
                     bid_depth TEXT, ask_depth TEXT, hash TEXT
                 );
                 CREATE TABLE trades (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     listener_id TEXT NOT NULL, asset_id TEXT NOT NULL,
                     market TEXT NOT NULL DEFAULT '', timestamp INTEGER NOT NULL,
                     price TEXT NOT NULL, size TEXT NOT NULL, side TEXT NOT NULL,
                     fee_rate_bps INTEGER
                 );",
            )
            .unwrap();
        let store = Arc::new(store);
        store
            .upsert_market(&Market::new("l1", "cond", "tok", Venue::Polymarket))
            .unwrap();

        let writer = BatchWriter::with_tuning(Arc::clone(&store), "l1", 100, 60_000);
        assert!(writer.caps().has_forward_fill_columns);

        writer.write_snapshot(snapshot("tok", 1));
        writer.flush();

        // The batch landed despite the old schema, and the writer
        // remembers both downgrades for subsequent batches.
        assert_eq!(snapshot_count(&store), 1);
        let caps = writer.caps();
        assert!(!caps.has_forward_fill_columns);
        assert!(!caps.has_venue_column);

        writer.write_snapshot(snapshot("tok", 2));
        writer.flush();
        assert_eq!(snapshot_count(&store), 2);

        // Trades go through the same downgrade path.
        writer.write_trade(trade("tok", 1));
        writer.flush();
        assert_eq!(trade_count(&store), 1);
    }

    #[tokio::test]
    async fn test_periodic_flush_task() {
        let store = store_with_market("tok");
        let writer = Arc::new(BatchWriter::with_tuning(Arc::clone(&store), "l1", 100, 50));
        writer.start();

        writer.write_snapshot(snapshot("tok", 1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(snapshot_count(&store), 1);

        writer.write_trade(trade("tok", 1));
        writer.stop();
        // stop() drains whatever was still buffered.
        assert_eq!(trade_count(&store), 1);
    }
}
