//! Heartbeat snapshots between real book updates.
//!
//! Downstream replay wants a regular pulse of book state even when the
//! venue is quiet. The filler keeps the last real snapshot per tracked
//! token and, on a timer, writes a copy stamped with the current clock,
//! `is_forward_filled = true`, and the original event time in
//! `source_timestamp`. Loaders can exclude the synthetic rows by flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::data::writer::BatchWriter;
use crate::types::OrderbookSnapshot;

#[derive(Debug, Default)]
struct TokenState {
    last_snapshot: Option<OrderbookSnapshot>,
}

pub struct ForwardFiller {
    listener_id: String,
    emit_interval_ms: u64,
    writer: Arc<BatchWriter>,
    tokens: Mutex<HashMap<String, TokenState>>,
    emitted: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardFiller {
    pub fn new(listener_id: &str, emit_interval_ms: u64, writer: Arc<BatchWriter>) -> Self {
        Self {
            listener_id: listener_id.to_string(),
            emit_interval_ms,
            writer,
            tokens: Mutex::new(HashMap::new()),
            emitted: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn add_token(&self, token_id: &str, condition_id: &str) {
        let mut tokens = self.tokens.lock();
        tokens.entry(token_id.to_string()).or_insert_with(|| {
            debug!(token_id = %token_id, condition_id = %condition_id, "forward filler tracking token");
            TokenState::default()
        });
    }

    pub fn remove_token(&self, token_id: &str) {
        if self.tokens.lock().remove(token_id).is_some() {
            debug!(token_id = %token_id, "forward filler dropped token");
        }
    }

    /// Record the latest real snapshot for its token. Untracked tokens
    /// are ignored.
    pub fn update_state(&self, snapshot: &OrderbookSnapshot) {
        let mut tokens = self.tokens.lock();
        if let Some(state) = tokens.get_mut(&snapshot.asset_id) {
            state.last_snapshot = Some(snapshot.clone());
        }
    }

    pub fn start(self: &Arc<Self>) {
        let filler = Arc::clone(self);
        let interval = Duration::from_millis(self.emit_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                filler.emit_once(chrono::Utc::now().timestamp_millis());
            }
        });
        *self.task.lock() = Some(handle);
        info!(
            listener_id = %self.listener_id,
            interval_ms = self.emit_interval_ms,
            "forward filler started"
        );
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        info!(listener_id = %self.listener_id, "forward filler stopped");
    }

    /// One timer tick: emit a synthetic copy for every token that has
    /// seen at least one real snapshot.
    fn emit_once(&self, now_ms: i64) {
        let synthetic: Vec<OrderbookSnapshot> = {
            let tokens = self.tokens.lock();
            tokens
                .values()
                .filter_map(|state| state.last_snapshot.as_ref())
                .map(|original| Self::synthesize(original, now_ms))
                .collect()
        };
        for snapshot in synthetic {
            self.writer.write_snapshot(snapshot);
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn synthesize(original: &OrderbookSnapshot, now_ms: i64) -> OrderbookSnapshot {
        let mut copy = original.clone();
        copy.timestamp = now_ms;
        copy.is_forward_filled = true;
        copy.source_timestamp = Some(original.timestamp);
        copy
    }

    pub fn tracked_count(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn tokens_with_state(&self) -> usize {
        self.tokens
            .lock()
            .values()
            .filter(|state| state.last_snapshot.is_some())
            .count()
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::SqliteStore;
    use crate::types::{Market, PriceLevel, Venue};
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

    fn writer_with_market(token: &str) -> (Arc<SqliteStore>, Arc<BatchWriter>) {
        let store = SqliteStore::in_memory().unwrap();
        store.init().unwrap();
        store
            .upsert_market(&Market::new("l1", "cond", token, Venue::Polymarket))
            .unwrap();
        let store = Arc::new(store);
        let writer = Arc::new(BatchWriter::with_tuning(Arc::clone(&store), "l1", 1_000, 60_000));
        (store, writer)
    }

    #[test]
    fn test_synthetic_copy_marks_and_restamps() {
        let original = snapshot("tok", 1_000);
        let copy = ForwardFiller::synthesize(&original, 5_000);

        assert_eq!(copy.timestamp, 5_000);
        assert!(copy.is_forward_filled);
        assert_eq!(copy.source_timestamp, Some(1_000));
        // Book contents are identical to the source snapshot.
        assert_eq!(copy.bids, original.bids);
        assert_eq!(copy.asks, original.asks);
        assert_eq!(copy.best_bid, original.best_bid);
    }

    #[test]
    fn test_emit_skips_tokens_without_state() {
        let (_store, writer) = writer_with_market("tok");
        let filler = ForwardFiller::new("l1", 100, writer);
        filler.add_token("tok", "cond");

        filler.emit_once(10_000);
        assert_eq!(filler.emitted_count(), 0);
        assert_eq!(filler.tokens_with_state(), 0);

        filler.update_state(&snapshot("tok", 1_000));
        filler.emit_once(10_000);
        assert_eq!(filler.emitted_count(), 1);
        assert_eq!(filler.tokens_with_state(), 1);
    }

    #[test]
    fn test_untracked_tokens_ignored() {
        let (_store, writer) = writer_with_market("tok");
        let filler = ForwardFiller::new("l1", 100, writer);

        filler.update_state(&snapshot("tok", 1_000));
        filler.emit_once(10_000);
        assert_eq!(filler.emitted_count(), 0);
    }

    #[test]
    fn test_removed_token_stops_emitting() {
        let (_store, writer) = writer_with_market("tok");
        let filler = ForwardFiller::new("l1", 100, writer);
        filler.add_token("tok", "cond");
        filler.update_state(&snapshot("tok", 1_000));
        filler.emit_once(2_000);
        assert_eq!(filler.emitted_count(), 1);

        filler.remove_token("tok");
        filler.emit_once(3_000);
        assert_eq!(filler.emitted_count(), 1);
        assert_eq!(filler.tracked_count(), 0);
    }

    #[test]
    fn test_emitted_rows_reach_storage_flagged() {
        let (store, writer) = writer_with_market("tok");
        let filler = ForwardFiller::new("l1", 100, Arc::clone(&writer));
        filler.add_token("tok", "cond");
        filler.update_state(&snapshot("tok", 1_000));
        filler.emit_once(2_000);
        writer.flush();

        let rows = store
            .load_snapshots_range(0, 10_000, None, None, None, true)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_forward_filled);
        assert_eq!(rows[0].source_timestamp, Some(1_000));
        assert_eq!(rows[0].timestamp, 2_000);

        // Real-only loads exclude it.
        let real = store
            .load_snapshots_range(0, 10_000, None, None, None, false)
            .unwrap();
        assert!(real.is_empty());
    }

    #[tokio::test]
    async fn test_timer_emits_on_interval() {
        let (store, writer) = writer_with_market("tok");
        let filler = Arc::new(ForwardFiller::new("l1", 20, Arc::clone(&writer)));
        filler.add_token("tok", "cond");
        filler.update_state(&snapshot("tok", 1_000));

        filler.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        filler.stop();
        writer.flush();

        let rows = store
            .load_snapshots_range(0, i64::MAX, None, None, None, true)
            .unwrap();
        // Several ticks worth of synthetic snapshots landed.
        assert!(rows.len() >= 2, "expected >= 2 rows, got {}", rows.len());
        assert!(rows.iter().all(|r| r.is_forward_filled));
    }
}
