//! One listener: venue feed in, database rows out.
//!
//! Three cooperating tasks per listener:
//!
//! - the receive task pulls normalized events off the venue stream and
//!   pushes them onto the high-priority data queue;
//! - the discovery task periodically sweeps the venue's market set and
//!   pushes lifecycle events onto the control queue;
//! - the processor drains the data queue fully before taking at most
//!   one control item, so market data is never starved by discovery.
//!
//! Discovery persists a market (row plus state transition) before its
//! token is subscribed; data for unknown assets is dropped so every
//! stored snapshot and trade references an existing market row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::data::store::SqliteStore;
use crate::data::writer::BatchWriter;
use crate::types::{Market, MarketState};
use crate::venue::{MarketDiscovery, MarketStream, VenueEvent};

use super::config::ListenerConfig;
use super::events::CaptureEvent;
use super::forward_fill::ForwardFiller;

const CONTROL_POLL_MS: u64 = 100;
const IDLE_YIELD_MS: u64 = 10;

/// Counters exposed for status reporting.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub events_processed: AtomicU64,
    pub errors: AtomicU64,
}

pub struct Listener {
    config: ListenerConfig,
    discovery: Arc<dyn MarketDiscovery>,
    stream: Arc<dyn MarketStream>,
    store: Arc<SqliteStore>,
    writer: Arc<BatchWriter>,
    forward_filler: Option<Arc<ForwardFiller>>,

    /// Tokens currently subscribed; mutated only by discovery sync and
    /// the control-event handlers.
    subscribed: Arc<Mutex<HashMap<String, Market>>>,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,

    data_tx: UnboundedSender<CaptureEvent>,
    data_rx: Mutex<Option<UnboundedReceiver<CaptureEvent>>>,
    control_tx: UnboundedSender<CaptureEvent>,
    control_rx: Mutex<Option<UnboundedReceiver<CaptureEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        discovery: Arc<dyn MarketDiscovery>,
        stream: Arc<dyn MarketStream>,
        store: Arc<SqliteStore>,
        writer: Arc<BatchWriter>,
        forward_filler: Option<Arc<ForwardFiller>>,
    ) -> Self {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            discovery,
            stream,
            store,
            writer,
            forward_filler,
            subscribed: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ListenerStats::default()),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.config.id
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(listener_id = %self.config.id, name = %self.config.name, "listener starting");
        self.running.store(true, Ordering::SeqCst);

        self.writer.start();
        if let Some(filler) = &self.forward_filler {
            filler.start();
        }
        self.stream.connect().await?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::run_receive_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::run_discovery_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(Self::run_processor(Arc::clone(self))));
        Ok(())
    }

    /// Stop everything and flush. Every shutdown path releases the venue
    /// session and drains the writer.
    pub async fn stop(&self) {
        info!(listener_id = %self.config.id, "listener stopping");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.control_tx.send(CaptureEvent::Shutdown);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(filler) = &self.forward_filler {
            filler.stop();
        }
        self.stream.disconnect().await;
        self.writer.stop();
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn run_receive_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            match self.stream.recv().await {
                Some(VenueEvent::Orderbook(snapshot)) => {
                    if self.data_tx.send(CaptureEvent::Orderbook(snapshot)).is_err() {
                        break;
                    }
                }
                Some(VenueEvent::Trade(trade)) => {
                    if self.data_tx.send(CaptureEvent::Trade(trade)).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        debug!(listener_id = %self.config.id, "receive loop ended");
    }

    async fn run_discovery_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.discovery_interval_secs.max(1));
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.discover_and_sync().await {
                error!(listener_id = %self.config.id, error = %err, "discovery sweep failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Diff the venue's current market set against our subscriptions.
    /// New markets are fully persisted before their data is accepted;
    /// vanished markets are retired through the control queue.
    async fn discover_and_sync(self: &Arc<Self>) -> Result<()> {
        let discovered = self
            .discovery
            .discover(&self.config.id, &self.config.filters)
            .await?;
        let discovered: HashMap<String, Market> = discovered
            .into_iter()
            .map(|market| (market.token_id.clone(), market))
            .collect();

        let (new_tokens, removed): (Vec<String>, Vec<Market>) = {
            let subscribed = self.subscribed.lock();
            let new_tokens = discovered
                .keys()
                .filter(|token| !subscribed.contains_key(*token))
                .cloned()
                .collect();
            let removed = subscribed
                .iter()
                .filter(|(token, _)| !discovered.contains_key(*token))
                .map(|(_, market)| market.clone())
                .collect();
            (new_tokens, removed)
        };

        if !new_tokens.is_empty() {
            for token in &new_tokens {
                let mut market = discovered[token].clone();
                market.listener_id = self.config.id.clone();
                market.state = MarketState::Tracking;
                self.track_market(market)?;
            }
            self.stream.subscribe(&new_tokens).await;
            info!(listener_id = %self.config.id, count = new_tokens.len(), "markets batch subscribed");
        }

        for market in removed {
            let _ = self.control_tx.send(CaptureEvent::MarketClosed(market));
        }
        Ok(())
    }

    /// Persist a market and register it everywhere. Must complete before
    /// the token's data events are accepted.
    fn track_market(&self, market: Market) -> Result<()> {
        info!(
            listener_id = %self.config.id,
            token_id = %market.token_id,
            question = %market.question.as_deref().unwrap_or(""),
            "market discovered"
        );
        self.store.upsert_market(&market)?;
        self.store.append_state_transition(
            &self.config.id,
            &market.condition_id,
            None,
            MarketState::Tracking.as_str(),
            &serde_json::json!({"question": market.question}),
            chrono::Utc::now().timestamp_millis(),
        )?;
        if let Some(filler) = &self.forward_filler {
            filler.add_token(&market.token_id, &market.condition_id);
        }
        self.subscribed.lock().insert(market.token_id.clone(), market);
        Ok(())
    }

    /// Two-priority processor: drain the data queue, then poll one
    /// control item with a bounded wait, then yield briefly when idle.
    async fn run_processor(self: Arc<Self>) {
        let mut data_rx = self.data_rx.lock().take().expect("processor started twice");
        let mut control_rx = self
            .control_rx
            .lock()
            .take()
            .expect("processor started twice");

        while self.running.load(Ordering::SeqCst) {
            let mut drained = 0usize;
            while let Ok(event) = data_rx.try_recv() {
                self.handle_data_event(event);
                self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
                drained += 1;
            }

            match tokio::time::timeout(
                Duration::from_millis(CONTROL_POLL_MS),
                control_rx.recv(),
            )
            .await
            {
                Ok(Some(event)) => {
                    self.handle_control_event(event).await;
                    self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => break,
                Err(_) => {
                    if drained == 0 {
                        tokio::time::sleep(Duration::from_millis(IDLE_YIELD_MS)).await;
                    }
                }
            }
        }
        debug!(listener_id = %self.config.id, "processor ended");
    }

    fn handle_data_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::Orderbook(snapshot) => {
                if !self.subscribed.lock().contains_key(&snapshot.asset_id) {
                    debug!(asset_id = %snapshot.asset_id, "orderbook for unknown market dropped");
                    return;
                }
                if let Some(filler) = &self.forward_filler {
                    filler.update_state(&snapshot);
                }
                self.writer.write_snapshot(snapshot);
            }
            CaptureEvent::Trade(trade) => {
                if !self.subscribed.lock().contains_key(&trade.asset_id) {
                    debug!(asset_id = %trade.asset_id, "trade for unknown market dropped");
                    return;
                }
                self.writer.write_trade(trade);
            }
            other => {
                warn!(event = ?other, "non-data event on data queue");
            }
        }
    }

    async fn handle_control_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::MarketDiscovered(market) => {
                let token_id = market.token_id.clone();
                if let Err(err) = self.track_market(market) {
                    error!(error = %err, "failed to persist discovered market");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.stream.subscribe(&[token_id]).await;
            }
            CaptureEvent::MarketClosed(market) => {
                info!(
                    listener_id = %self.config.id,
                    token_id = %market.token_id,
                    "market closed"
                );
                if let Err(err) = self.store.append_state_transition(
                    &self.config.id,
                    &market.condition_id,
                    Some(market.state.as_str()),
                    MarketState::Closed.as_str(),
                    &serde_json::json!({}),
                    chrono::Utc::now().timestamp_millis(),
                ) {
                    error!(error = %err, "failed to record close transition");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                self.stream.unsubscribe(&[market.token_id.clone()]).await;
                if let Some(filler) = &self.forward_filler {
                    filler.remove_token(&market.token_id);
                }
                self.subscribed.lock().remove(&market.token_id);
            }
            CaptureEvent::ConnectionLost { reason } => {
                // The stream reconnects itself and replays subscriptions.
                warn!(listener_id = %self.config.id, reason = %reason, "venue connection lost");
            }
            CaptureEvent::Shutdown => {
                self.running.store(false, Ordering::SeqCst);
            }
            CaptureEvent::Orderbook(_) | CaptureEvent::Trade(_) => {
                warn!("data event on control queue");
            }
        }
    }

    /// Test and tooling hook: push a lifecycle event through the control
    /// queue, exactly as the discovery loop would.
    pub fn submit_control_event(&self, event: CaptureEvent) {
        let _ = self.control_tx.send(event);
    }
}
