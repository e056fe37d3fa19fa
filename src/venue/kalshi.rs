//! Single-ticker venue adapter (Kalshi).
//!
//! One ticker carries both sides of the question on one book, quoted in
//! integer cents. The wire interleaves full snapshots with seq-numbered
//! deltas, so the adapter keeps per-ticker level maps and rebuilds a
//! normalized snapshot after every accepted update:
//!
//! - yes levels become bids at `cents / 100`, best first;
//! - no levels become asks at `(100 - cents) / 100`, best first.
//!
//! Deltas at or behind the current seq are stale and dropped. A gap in
//! seq is logged and accepted; the venue re-snapshots on resubscribe.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::capture::config::DiscoveryFilters;
use crate::error::CaptureError;
use crate::types::{Market, MarketState, OrderbookSnapshot, PriceLevel, Trade, TradeSide, Venue};

use super::auth::RequestSigner;
use super::{Backoff, MarketDiscovery, MarketStream, VenueEvent};

pub const REST_API_URL: &str = "https://api.elections.kalshi.com";
pub const WS_URL: &str = "wss://api.elections.kalshi.com/trade-api/ws/v2";

const MARKETS_PATH: &str = "/trade-api/v2/markets";

// ---------------------------------------------------------------------
// Book state
// ---------------------------------------------------------------------

/// Reconstructed book for one ticker, in cents.
#[derive(Debug, Default)]
pub struct BookState {
    pub seq: u64,
    yes: BTreeMap<u32, i64>,
    no: BTreeMap<u32, i64>,
}

impl BookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides atomically.
    pub fn apply_snapshot(&mut self, yes: &[(u32, i64)], no: &[(u32, i64)], seq: u64) {
        self.yes = yes.iter().filter(|(_, qty)| *qty > 0).copied().collect();
        self.no = no.iter().filter(|(_, qty)| *qty > 0).copied().collect();
        self.seq = seq;
    }

    /// Apply one signed-quantity delta. Returns false for stale updates
    /// (seq at or behind the current state), which must be discarded.
    pub fn apply_delta(&mut self, price_cents: u32, delta: i64, side: &str, seq: u64) -> bool {
        if seq <= self.seq {
            return false;
        }
        if seq > self.seq + 1 {
            // Venue replays a snapshot on resubscribe; carry on meanwhile.
            warn!(expected = self.seq + 1, got = seq, "sequence gap in deltas");
        }
        self.seq = seq;

        let levels = if side == "yes" { &mut self.yes } else { &mut self.no };
        let quantity = levels.get(&price_cents).copied().unwrap_or(0) + delta;
        if quantity <= 0 {
            levels.remove(&price_cents);
        } else {
            levels.insert(price_cents, quantity);
        }
        true
    }

    /// Build the normalized snapshot, or `None` while the reconstruction
    /// is crossed (stale overlap between the two sides).
    pub fn normalize(&self, listener_id: &str, ticker: &str, timestamp_ms: i64) -> Option<OrderbookSnapshot> {
        // Levels above 100 cents are wire garbage; drop them rather than
        // emit prices outside [0, 1].
        let bids: Vec<PriceLevel> = self
            .yes
            .iter()
            .rev()
            .filter(|(&cents, _)| cents <= 100)
            .map(|(&cents, &qty)| PriceLevel::new(cents_to_price(cents), Decimal::from(qty)))
            .collect();
        let asks: Vec<PriceLevel> = self
            .no
            .iter()
            .rev()
            .filter(|(&cents, _)| cents <= 100)
            .map(|(&cents, &qty)| PriceLevel::new(cents_to_price(100 - cents), Decimal::from(qty)))
            .collect();

        let mut snapshot =
            OrderbookSnapshot::new(listener_id, ticker, ticker, timestamp_ms, bids, asks);
        snapshot.venue = Some(Venue::Kalshi);
        if snapshot.is_crossed() {
            debug!(ticker = %ticker, seq = self.seq, "discarding crossed reconstruction");
            return None;
        }
        Some(snapshot)
    }
}

fn cents_to_price(cents: u32) -> Decimal {
    Decimal::from(cents) / dec!(100)
}

// ---------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    OrderbookSnapshot(Envelope<SnapshotMsg>),
    OrderbookDelta(Envelope<DeltaMsg>),
    Trade(Envelope<TradeMsg>),
    Subscribed(serde_json::Value),
    Error(serde_json::Value),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    seq: u64,
    msg: T,
}

#[derive(Debug, Deserialize)]
struct SnapshotMsg {
    market_ticker: String,
    #[serde(default)]
    yes: Vec<(u32, i64)>,
    #[serde(default)]
    no: Vec<(u32, i64)>,
    /// Seconds.
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DeltaMsg {
    market_ticker: String,
    price: u32,
    delta: i64,
    side: String,
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TradeMsg {
    market_ticker: String,
    /// Cents.
    yes_price: u32,
    count: i64,
    #[serde(default)]
    taker_side: String,
    /// Seconds.
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SubscribeCmd<'a> {
    id: u64,
    cmd: &'static str,
    params: SubscribeParams<'a>,
}

#[derive(Debug, Serialize)]
struct SubscribeParams<'a> {
    channels: [&'static str; 1],
    market_ticker: &'a str,
}

fn seconds_to_ms(ts: Option<i64>) -> i64 {
    match ts {
        Some(seconds) => seconds * 1_000,
        None => chrono::Utc::now().timestamp_millis(),
    }
}

// ---------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MarketsPage {
    #[serde(default)]
    markets: Vec<ApiMarket>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMarket {
    ticker: String,
    event_ticker: Option<String>,
    title: Option<String>,
    status: Option<String>,
    volume: Option<i64>,
    liquidity: Option<i64>,
}

pub struct KalshiDiscovery {
    client: reqwest::Client,
    base_url: String,
    signer: Arc<RequestSigner>,
}

impl KalshiDiscovery {
    pub fn new(signer: Arc<RequestSigner>) -> Self {
        Self::with_base_url(signer, REST_API_URL)
    }

    pub fn with_base_url(signer: Arc<RequestSigner>, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
        }
    }

    async fn fetch_page(
        &self,
        filters: &DiscoveryFilters,
        series_ticker: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<MarketsPage, CaptureError> {
        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, MARKETS_PATH))
            .query(&[("limit", "200")]);
        if let Some(series) = series_ticker {
            request = request.query(&[("series_ticker", series)]);
        }
        if let Some(event) = filters.event_tickers.first() {
            request = request.query(&[("event_ticker", event)]);
        }
        if let Some(status) = &filters.status {
            request = request.query(&[("status", status)]);
        }
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        for (name, value) in self.signer.headers("GET", MARKETS_PATH, "")? {
            request = request.header(name, value);
        }
        Ok(request.send().await?.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl MarketDiscovery for KalshiDiscovery {
    async fn discover(
        &self,
        listener_id: &str,
        filters: &DiscoveryFilters,
    ) -> Result<Vec<Market>, CaptureError> {
        let mut markets = Vec::new();
        // One cursor walk per series filter; a single unfiltered walk
        // when none are configured.
        let series: Vec<Option<&str>> = if filters.series_tickers.is_empty() {
            vec![None]
        } else {
            filters.series_tickers.iter().map(|s| Some(s.as_str())).collect()
        };

        for series_ticker in series {
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .fetch_page(filters, series_ticker, cursor.as_deref())
                    .await?;
                for api_market in &page.markets {
                    if let Some(market) = convert_market(listener_id, api_market, filters) {
                        markets.push(market);
                    }
                }
                match page.cursor.filter(|c| !c.is_empty()) {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        info!(listener_id = %listener_id, count = markets.len(), "kalshi discovery complete");
        Ok(markets)
    }
}

/// One ticker is one market row: the ticker doubles as condition and
/// token id, which downstream pairing reads as a self-pair.
fn convert_market(
    listener_id: &str,
    api_market: &ApiMarket,
    filters: &DiscoveryFilters,
) -> Option<Market> {
    if !filters.market_tickers.is_empty()
        && !filters.market_tickers.iter().any(|t| t == &api_market.ticker)
    {
        return None;
    }
    if let Some(needle) = &filters.title_contains {
        let title = api_market.title.as_deref().unwrap_or("");
        if !title.to_lowercase().contains(&needle.to_lowercase()) {
            return None;
        }
    }

    let mut market = Market::new(listener_id, &api_market.ticker, &api_market.ticker, Venue::Kalshi);
    market.question = api_market.title.clone();
    market.event_id = api_market.event_ticker.clone();
    market.volume = api_market.volume.map(Decimal::from);
    market.liquidity = api_market.liquidity.map(|cents| Decimal::from(cents) / dec!(100));
    market.is_active = matches!(api_market.status.as_deref(), None | Some("active") | Some("open"));
    market.is_closed = matches!(api_market.status.as_deref(), Some("closed") | Some("settled"));
    market.state = MarketState::Discovered;
    Some(market)
}

// ---------------------------------------------------------------------
// Websocket stream
// ---------------------------------------------------------------------

enum StreamCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Authenticated snapshot+delta feed normalized to [`VenueEvent`]s.
pub struct KalshiStream {
    url: String,
    listener_id: String,
    signer: Arc<RequestSigner>,
    desired: Arc<Mutex<HashSet<String>>>,
    running: Arc<AtomicBool>,
    cmd_tx: UnboundedSender<StreamCommand>,
    cmd_rx: Mutex<Option<UnboundedReceiver<StreamCommand>>>,
    event_tx: UnboundedSender<VenueEvent>,
    event_rx: tokio::sync::Mutex<UnboundedReceiver<VenueEvent>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl KalshiStream {
    pub fn new(listener_id: &str, signer: Arc<RequestSigner>) -> Self {
        Self::with_url(listener_id, signer, WS_URL)
    }

    pub fn with_url(listener_id: &str, signer: Arc<RequestSigner>, url: &str) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            url: url.to_string(),
            listener_id: listener_id.to_string(),
            signer,
            desired: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(AtomicBool::new(false)),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            task: Mutex::new(None),
        }
    }

    async fn run_session_loop(
        url: String,
        listener_id: String,
        signer: Arc<RequestSigner>,
        desired: Arc<Mutex<HashSet<String>>>,
        running: Arc<AtomicBool>,
        mut cmd_rx: UnboundedReceiver<StreamCommand>,
        event_tx: UnboundedSender<VenueEvent>,
    ) {
        let mut backoff = Backoff::new();
        let msg_id = AtomicU64::new(1);

        while running.load(Ordering::SeqCst) {
            // Sign the upgrade request itself; there is no in-band login.
            let request = match Self::build_request(&url, &signer) {
                Ok(request) => request,
                Err(err) => {
                    error!(error = %err, "cannot build signed upgrade request");
                    return;
                }
            };

            let (ws, _) = match connect_async(request).await {
                Ok(ok) => ok,
                Err(err) => {
                    let delay = backoff.next_delay();
                    error!(error = %err, retry_in_s = delay.as_secs(), "websocket connect failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            info!("websocket connected");
            backoff.reset();

            let (mut sink, mut stream) = ws.split();
            let mut books: HashMap<String, BookState> = HashMap::new();

            let tickers: Vec<String> = desired.lock().iter().cloned().collect();
            if !tickers.is_empty() {
                info!(count = tickers.len(), "resubscribing");
                if Self::send_subscriptions(&mut sink, &msg_id, &tickers, "subscribe")
                    .await
                    .is_err()
                {
                    continue;
                }
            }

            loop {
                tokio::select! {
                    command = cmd_rx.recv() => match command {
                        Some(StreamCommand::Subscribe(tickers)) => {
                            if Self::send_subscriptions(&mut sink, &msg_id, &tickers, "subscribe")
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(StreamCommand::Unsubscribe(tickers)) => {
                            for ticker in &tickers {
                                books.remove(ticker);
                            }
                            if Self::send_subscriptions(&mut sink, &msg_id, &tickers, "unsubscribe")
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => return,
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            for event in handle_text(&listener_id, &mut books, &text) {
                                if event_tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!(frame = ?frame, "websocket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            error!(error = %err, "websocket error");
                            break;
                        }
                        None => break,
                    },
                }
                if !running.load(Ordering::SeqCst) {
                    return;
                }
            }
        }
    }

    fn build_request(
        url: &str,
        signer: &RequestSigner,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, CaptureError> {
        let mut request = url.into_client_request()?;
        for (name, value) in signer.ws_headers()? {
            let value = value
                .parse()
                .map_err(|_| CaptureError::Signing("invalid header value".to_string()))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    async fn send_subscriptions<S>(
        sink: &mut S,
        msg_id: &AtomicU64,
        tickers: &[String],
        cmd: &'static str,
    ) -> Result<(), ()>
    where
        S: SinkExt<Message> + Unpin,
    {
        for ticker in tickers {
            for channel in ["orderbook_delta", "trade"] {
                let command = SubscribeCmd {
                    id: msg_id.fetch_add(1, Ordering::Relaxed),
                    cmd,
                    params: SubscribeParams {
                        channels: [channel],
                        market_ticker: ticker,
                    },
                };
                let json = serde_json::to_string(&command).expect("static message shape");
                if sink.send(Message::Text(json)).await.is_err() {
                    warn!(ticker = %ticker, "subscription send failed, reconnecting");
                    return Err(());
                }
            }
        }
        Ok(())
    }
}

/// Decode one frame and fold it into the per-ticker books, emitting
/// normalized events for accepted updates.
fn handle_text(
    listener_id: &str,
    books: &mut HashMap<String, BookState>,
    text: &str,
) -> Vec<VenueEvent> {
    let message: WireMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "undecodable frame dropped");
            return Vec::new();
        }
    };

    match message {
        WireMessage::OrderbookSnapshot(envelope) => {
            let msg = envelope.msg;
            let state = books.entry(msg.market_ticker.clone()).or_default();
            state.apply_snapshot(&msg.yes, &msg.no, envelope.seq);
            debug!(
                ticker = %msg.market_ticker,
                seq = envelope.seq,
                yes_levels = msg.yes.len(),
                no_levels = msg.no.len(),
                "orderbook snapshot"
            );
            state
                .normalize(listener_id, &msg.market_ticker, seconds_to_ms(msg.ts))
                .map(VenueEvent::Orderbook)
                .into_iter()
                .collect()
        }
        WireMessage::OrderbookDelta(envelope) => {
            let msg = envelope.msg;
            let Some(state) = books.get_mut(&msg.market_ticker) else {
                warn!(ticker = %msg.market_ticker, "delta before snapshot dropped");
                return Vec::new();
            };
            if !state.apply_delta(msg.price, msg.delta, &msg.side, envelope.seq) {
                trace!(ticker = %msg.market_ticker, seq = envelope.seq, "stale delta dropped");
                return Vec::new();
            }
            state
                .normalize(listener_id, &msg.market_ticker, seconds_to_ms(msg.ts))
                .map(VenueEvent::Orderbook)
                .into_iter()
                .collect()
        }
        WireMessage::Trade(envelope) => {
            let msg = envelope.msg;
            let trade = Trade {
                listener_id: listener_id.to_string(),
                asset_id: msg.market_ticker.clone(),
                market: msg.market_ticker,
                timestamp: seconds_to_ms(msg.ts),
                price: cents_to_price(msg.yes_price),
                size: Decimal::from(msg.count),
                side: TradeSide::parse(&msg.taker_side).unwrap_or(TradeSide::Buy),
                fee_rate_bps: None,
                venue: Some(Venue::Kalshi),
            };
            vec![VenueEvent::Trade(trade)]
        }
        WireMessage::Subscribed(msg) => {
            debug!(msg = %msg, "subscription confirmed");
            Vec::new()
        }
        WireMessage::Error(msg) => {
            error!(msg = %msg, "venue error message");
            Vec::new()
        }
        WireMessage::Unknown => {
            trace!("unknown message type ignored");
            Vec::new()
        }
    }
}

#[async_trait]
impl MarketStream for KalshiStream {
    async fn connect(&self) -> Result<(), CaptureError> {
        if self.task.lock().is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let cmd_rx = self
            .cmd_rx
            .lock()
            .take()
            .expect("connect called after shutdown");
        let handle = tokio::spawn(Self::run_session_loop(
            self.url.clone(),
            self.listener_id.clone(),
            Arc::clone(&self.signer),
            Arc::clone(&self.desired),
            Arc::clone(&self.running),
            cmd_rx,
            self.event_tx.clone(),
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        debug!(listener_id = %self.listener_id, "kalshi stream disconnected");
    }

    async fn subscribe(&self, asset_ids: &[String]) {
        let fresh: Vec<String> = {
            let mut desired = self.desired.lock();
            asset_ids
                .iter()
                .filter(|id| desired.insert((*id).clone()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return;
        }
        debug!(count = fresh.len(), "subscribing to tickers");
        let _ = self.cmd_tx.send(StreamCommand::Subscribe(fresh));
    }

    async fn unsubscribe(&self, asset_ids: &[String]) {
        let removed: Vec<String> = {
            let mut desired = self.desired.lock();
            asset_ids
                .iter()
                .filter(|id| desired.remove(id.as_str()))
                .cloned()
                .collect()
        };
        if removed.is_empty() {
            return;
        }
        let _ = self.cmd_tx.send(StreamCommand::Unsubscribe(removed));
    }

    async fn recv(&self) -> Option<VenueEvent> {
        self.event_rx.lock().await.recv().await
    }
}
