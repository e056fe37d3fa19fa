//! Two-token venue adapter (Polymarket).
//!
//! Discovery walks the gamma REST API; each market row carries parallel
//! `clobTokenIds` / `outcomes` arrays and expands to one [`Market`] per
//! outcome token. The websocket delivers a full book snapshot on every
//! update, so normalization is a pass-through with sorted levels.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::capture::config::DiscoveryFilters;
use crate::error::CaptureError;
use crate::types::{Market, MarketState, OrderbookSnapshot, PriceLevel, Trade, TradeSide, Venue};

use super::{Backoff, MarketDiscovery, MarketStream, VenueEvent};

pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const CLOB_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

const DISCOVERY_PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GammaEvent {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    condition_id: Option<String>,
    question: Option<String>,
    slug: Option<String>,
    /// JSON-encoded array of outcome labels, parallel to `clobTokenIds`.
    outcomes: Option<String>,
    clob_token_ids: Option<String>,
    volume: Option<String>,
    liquidity: Option<String>,
    active: Option<bool>,
    closed: Option<bool>,
}

pub struct PolymarketDiscovery {
    client: reqwest::Client,
    base_url: String,
}

impl PolymarketDiscovery {
    pub fn new() -> Self {
        Self::with_base_url(GAMMA_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for PolymarketDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDiscovery for PolymarketDiscovery {
    async fn discover(
        &self,
        listener_id: &str,
        filters: &DiscoveryFilters,
    ) -> Result<Vec<Market>, CaptureError> {
        let mut markets = Vec::new();
        let mut offset = 0usize;

        loop {
            let mut request = self
                .client
                .get(format!("{}/events", self.base_url))
                .query(&[("limit", DISCOVERY_PAGE_SIZE.to_string())])
                .query(&[("offset", offset.to_string())])
                .query(&[("active", "true"), ("closed", "false")]);
            if let Some(series_id) = filters.series_ids.first() {
                request = request.query(&[("series_id", series_id)]);
            }
            if let Some(tag_id) = filters.tag_ids.first() {
                request = request.query(&[("tag_id", tag_id)]);
            }

            let events: Vec<GammaEvent> = request.send().await?.error_for_status()?.json().await?;
            if events.is_empty() {
                break;
            }
            let page_len = events.len();

            for event in events {
                for market in &event.markets {
                    markets.extend(expand_market(listener_id, &event, market, filters));
                }
            }

            if page_len < DISCOVERY_PAGE_SIZE {
                break;
            }
            offset += DISCOVERY_PAGE_SIZE;
        }

        info!(listener_id = %listener_id, count = markets.len(), "polymarket discovery complete");
        Ok(markets)
    }
}

/// Expand one gamma market into per-outcome-token rows, applying the
/// listener's filters. Rows that fail to parse are skipped with a
/// warning rather than failing the sweep.
fn expand_market(
    listener_id: &str,
    event: &GammaEvent,
    market: &GammaMarket,
    filters: &DiscoveryFilters,
) -> Vec<Market> {
    let Some(condition_id) = market.condition_id.as_deref() else {
        return Vec::new();
    };
    if !filters.condition_ids.is_empty()
        && !filters.condition_ids.iter().any(|c| c == condition_id)
    {
        return Vec::new();
    }
    if !filters.slug_patterns.is_empty() {
        let slug = market.slug.as_deref().unwrap_or("");
        if !filters.slug_patterns.iter().any(|p| slug.contains(p.as_str())) {
            return Vec::new();
        }
    }

    let volume = market.volume.as_deref().and_then(|v| v.parse::<Decimal>().ok());
    let liquidity = market.liquidity.as_deref().and_then(|v| v.parse::<Decimal>().ok());
    if let Some(min) = filters.min_volume {
        if volume.unwrap_or_default() < min {
            return Vec::new();
        }
    }
    if let Some(min) = filters.min_liquidity {
        if liquidity.unwrap_or_default() < min {
            return Vec::new();
        }
    }

    // The gamma API double-encodes both parallel arrays.
    let outcomes: Vec<String> = match market
        .outcomes
        .as_deref()
        .map(serde_json::from_str::<Vec<String>>)
    {
        Some(Ok(outcomes)) => outcomes,
        _ => {
            warn!(condition_id = %condition_id, "unparseable outcomes field");
            return Vec::new();
        }
    };
    let token_ids: Vec<String> = match market
        .clob_token_ids
        .as_deref()
        .map(serde_json::from_str::<Vec<String>>)
    {
        Some(Ok(ids)) => ids,
        _ => {
            warn!(condition_id = %condition_id, "unparseable clobTokenIds field");
            return Vec::new();
        }
    };
    if outcomes.len() != token_ids.len() {
        warn!(
            condition_id = %condition_id,
            outcomes = outcomes.len(),
            tokens = token_ids.len(),
            "outcome and token arrays disagree"
        );
        return Vec::new();
    }

    token_ids
        .into_iter()
        .zip(outcomes)
        .enumerate()
        .map(|(index, (token_id, outcome))| {
            let mut row = Market::new(listener_id, condition_id, &token_id, Venue::Polymarket);
            row.market_slug = market.slug.clone();
            row.question = market.question.clone();
            row.outcome = Some(outcome);
            row.outcome_index = Some(index as i64);
            row.event_id = event.id.clone();
            row.event_title = event.title.clone();
            row.volume = volume;
            row.liquidity = liquidity;
            row.is_active = market.active.unwrap_or(true);
            row.is_closed = market.closed.unwrap_or(false);
            row.state = MarketState::Discovered;
            row
        })
        .collect()
}

// ---------------------------------------------------------------------
// Websocket stream
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubscribeMessage {
    assets_ids: Vec<String>,
    #[serde(rename = "type")]
    channel: &'static str,
}

impl SubscribeMessage {
    fn market(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            channel: "market",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: Decimal,
    size: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum WireMessage {
    Book(BookMessage),
    LastTradePrice(TradeMessage),
    PriceChange(serde_json::Value),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct BookMessage {
    asset_id: String,
    #[serde(default)]
    market: String,
    #[serde(deserialize_with = "de_i64_flexible")]
    timestamp: i64,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeMessage {
    asset_id: String,
    #[serde(default)]
    market: String,
    #[serde(deserialize_with = "de_i64_flexible")]
    timestamp: i64,
    price: Decimal,
    size: Decimal,
    #[serde(default)]
    side: String,
    #[serde(default, deserialize_with = "de_opt_u32_flexible")]
    fee_rate_bps: Option<u32>,
}

/// Numbers that arrive as either JSON numbers or decimal strings.
fn de_i64_flexible<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }
    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_u32_flexible<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u32),
        Str(String),
    }
    match Option::<NumOrStr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrStr::Num(n)) => Ok(Some(n)),
        Some(NumOrStr::Str(s)) => Ok(s.parse().ok()),
    }
}

enum StreamCommand {
    Subscribe(Vec<String>),
    Resync,
}

/// Live full-snapshot feed normalized to [`VenueEvent`]s.
pub struct PolymarketStream {
    url: String,
    listener_id: String,
    desired: Arc<Mutex<HashSet<String>>>,
    running: Arc<AtomicBool>,
    cmd_tx: UnboundedSender<StreamCommand>,
    cmd_rx: Mutex<Option<UnboundedReceiver<StreamCommand>>>,
    event_tx: UnboundedSender<VenueEvent>,
    event_rx: tokio::sync::Mutex<UnboundedReceiver<VenueEvent>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PolymarketStream {
    pub fn new(listener_id: &str) -> Self {
        Self::with_url(listener_id, CLOB_WS_URL)
    }

    pub fn with_url(listener_id: &str, url: &str) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            url: url.to_string(),
            listener_id: listener_id.to_string(),
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
        desired: Arc<Mutex<HashSet<String>>>,
        running: Arc<AtomicBool>,
        mut cmd_rx: UnboundedReceiver<StreamCommand>,
        event_tx: UnboundedSender<VenueEvent>,
    ) {
        let mut backoff = Backoff::new();

        while running.load(Ordering::SeqCst) {
            let (ws, response) = match connect_async(&url).await {
                Ok(ok) => ok,
                Err(err) => {
                    let delay = backoff.next_delay();
                    error!(error = %err, retry_in_s = delay.as_secs(), "websocket connect failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            info!(status = %response.status(), "websocket connected");
            backoff.reset();

            let (mut sink, mut stream) = ws.split();

            // Replay the desired subscription set on every (re)connect.
            let assets: Vec<String> = desired.lock().iter().cloned().collect();
            if !assets.is_empty() {
                let msg = SubscribeMessage::market(assets);
                if let Ok(json) = serde_json::to_string(&msg) {
                    if let Err(err) = sink.send(Message::Text(json)).await {
                        warn!(error = %err, "subscribe send failed, reconnecting");
                        continue;
                    }
                }
            }

            loop {
                tokio::select! {
                    command = cmd_rx.recv() => match command {
                        Some(StreamCommand::Subscribe(assets)) => {
                            let msg = SubscribeMessage::market(assets);
                            if let Ok(json) = serde_json::to_string(&msg) {
                                if let Err(err) = sink.send(Message::Text(json)).await {
                                    warn!(error = %err, "subscribe send failed, reconnecting");
                                    break;
                                }
                            }
                        }
                        // The feed has no unsubscribe op: drop the session
                        // and come back with the reduced desired set.
                        Some(StreamCommand::Resync) => break,
                        None => return,
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_text(&listener_id, &text) {
                                if event_tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "websocket closed by server");
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
}

/// Decode one websocket text frame. The feed sends both single events
/// and arrays of events; anything undecodable is dropped with a warning.
fn parse_text(listener_id: &str, text: &str) -> Vec<VenueEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "undecodable frame dropped");
            return Vec::new();
        }
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut events = Vec::new();
    for item in items {
        match serde_json::from_value::<WireMessage>(item) {
            Ok(WireMessage::Book(book)) => {
                events.push(VenueEvent::Orderbook(normalize_book(listener_id, book)));
            }
            Ok(WireMessage::LastTradePrice(trade)) => {
                events.push(VenueEvent::Trade(normalize_trade(listener_id, trade)));
            }
            Ok(WireMessage::PriceChange(_)) => {
                // Delta notifications are redundant here: the venue sends
                // a full book snapshot alongside every change.
                trace!("price_change ignored");
            }
            Ok(WireMessage::Unknown) => trace!("unknown event_type ignored"),
            Err(err) => warn!(error = %err, "undecodable event dropped"),
        }
    }
    events
}

fn normalize_book(listener_id: &str, book: BookMessage) -> OrderbookSnapshot {
    let mut bids: Vec<PriceLevel> = book
        .bids
        .into_iter()
        .map(|l| PriceLevel::new(l.price, l.size))
        .collect();
    let mut asks: Vec<PriceLevel> = book
        .asks
        .into_iter()
        .map(|l| PriceLevel::new(l.price, l.size))
        .collect();
    // The wire orders bids worst-first; normalize to best-first both sides.
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    asks.sort_by(|a, b| a.price.cmp(&b.price));

    let mut snapshot = OrderbookSnapshot::new(
        listener_id,
        &book.asset_id,
        &book.market,
        book.timestamp,
        bids,
        asks,
    );
    snapshot.hash = book.hash;
    snapshot.venue = Some(Venue::Polymarket);
    snapshot
}

fn normalize_trade(listener_id: &str, trade: TradeMessage) -> Trade {
    Trade {
        listener_id: listener_id.to_string(),
        asset_id: trade.asset_id,
        market: trade.market,
        timestamp: trade.timestamp,
        price: trade.price,
        size: trade.size,
        side: TradeSide::parse(&trade.side).unwrap_or(TradeSide::Buy),
        fee_rate_bps: trade.fee_rate_bps,
        venue: Some(Venue::Polymarket),
    }
}

#[async_trait]
impl MarketStream for PolymarketStream {
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
        debug!(listener_id = %self.listener_id, "polymarket stream disconnected");
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
        debug!(count = fresh.len(), "subscribing to assets");
        let _ = self.cmd_tx.send(StreamCommand::Subscribe(fresh));
    }

    async fn unsubscribe(&self, asset_ids: &[String]) {
        let removed = {
            let mut desired = self.desired.lock();
            let before = desired.len();
            for id in asset_ids {
                desired.remove(id);
            }
            before != desired.len()
        };
        if removed {
            let _ = self.cmd_tx.send(StreamCommand::Resync);
        }
    }

    async fn recv(&self) -> Option<VenueEvent> {
        self.event_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_book_message_normalizes_sorted() {
        let text = r#"{
            "event_type": "book",
            "asset_id": "tok-1",
            "market": "0xcond",
            "timestamp": "1700000000123",
            "hash": "abc123",
            "bids": [{"price": "0.53", "size": "10"}, {"price": "0.55", "size": "5"}],
            "asks": [{"price": "0.58", "size": "7"}, {"price": "0.56", "size": "3"}]
        }"#;
        let events = parse_text("l1", text);
        assert_eq!(events.len(), 1);

        let VenueEvent::Orderbook(snap) = &events[0] else {
            panic!("expected orderbook");
        };
        assert_eq!(snap.asset_id, "tok-1");
        assert_eq!(snap.timestamp, 1_700_000_000_123);
        assert_eq!(snap.best_bid, Some(dec!(0.55)));
        assert_eq!(snap.best_ask, Some(dec!(0.56)));
        assert_eq!(snap.hash.as_deref(), Some("abc123"));
        assert_eq!(snap.venue, Some(Venue::Polymarket));
        assert!(!snap.is_forward_filled);
    }

    #[test]
    fn test_trade_message_normalizes() {
        let text = r#"{
            "event_type": "last_trade_price",
            "asset_id": "tok-1",
            "market": "0xcond",
            "timestamp": 1700000000500,
            "price": "0.55",
            "size": "12.5",
            "side": "SELL",
            "fee_rate_bps": "0"
        }"#;
        let events = parse_text("l1", text);
        assert_eq!(events.len(), 1);

        let VenueEvent::Trade(trade) = &events[0] else {
            panic!("expected trade");
        };
        assert_eq!(trade.price, dec!(0.55));
        assert_eq!(trade.size, dec!(12.5));
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.fee_rate_bps, Some(0));
    }

    #[test]
    fn test_array_frame_yields_multiple_events() {
        let text = r#"[
            {"event_type": "book", "asset_id": "a", "timestamp": 1, "bids": [], "asks": []},
            {"event_type": "last_trade_price", "asset_id": "a", "timestamp": 2,
             "price": "0.5", "size": "1", "side": "BUY"}
        ]"#;
        let events = parse_text("l1", text);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_undecodable_and_unknown_frames_dropped() {
        assert!(parse_text("l1", "not json at all").is_empty());
        assert!(parse_text("l1", r#"{"event_type": "tick_size_change"}"#).is_empty());
        // price_change carries no book: ignored.
        assert!(parse_text("l1", r#"{"event_type": "price_change", "asset_id": "a"}"#).is_empty());
        // Well-formed JSON missing required fields is dropped, not fatal.
        assert!(parse_text("l1", r#"{"event_type": "book"}"#).is_empty());
    }

    fn gamma_event(markets: Vec<GammaMarket>) -> GammaEvent {
        GammaEvent {
            id: Some("ev-1".to_string()),
            title: Some("Game night".to_string()),
            markets,
        }
    }

    fn gamma_market() -> GammaMarket {
        GammaMarket {
            condition_id: Some("0xcond".to_string()),
            question: Some("Will X win?".to_string()),
            slug: Some("will-x-win".to_string()),
            outcomes: Some(r#"["Yes", "No"]"#.to_string()),
            clob_token_ids: Some(r#"["tok-yes", "tok-no"]"#.to_string()),
            volume: Some("1500.5".to_string()),
            liquidity: Some("300".to_string()),
            active: Some(true),
            closed: Some(false),
        }
    }

    #[test]
    fn test_expand_market_yields_one_row_per_token() {
        let event = gamma_event(vec![]);
        let rows = expand_market("l1", &event, &gamma_market(), &DiscoveryFilters::default());

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].token_id, "tok-yes");
        assert_eq!(rows[0].outcome.as_deref(), Some("Yes"));
        assert_eq!(rows[0].outcome_index, Some(0));
        assert_eq!(rows[1].token_id, "tok-no");
        assert_eq!(rows[1].outcome_index, Some(1));
        assert_eq!(rows[0].condition_id, rows[1].condition_id);
        assert_eq!(rows[0].volume, Some(dec!(1500.5)));
        assert_eq!(rows[0].event_id.as_deref(), Some("ev-1"));
    }

    #[test]
    fn test_expand_market_applies_filters() {
        let event = gamma_event(vec![]);

        let mut filters = DiscoveryFilters::default();
        filters.condition_ids = vec!["0xother".to_string()];
        assert!(expand_market("l1", &event, &gamma_market(), &filters).is_empty());

        let mut filters = DiscoveryFilters::default();
        filters.slug_patterns = vec!["x-win".to_string()];
        assert_eq!(expand_market("l1", &event, &gamma_market(), &filters).len(), 2);

        let mut filters = DiscoveryFilters::default();
        filters.min_liquidity = Some(dec!(1000));
        assert!(expand_market("l1", &event, &gamma_market(), &filters).is_empty());
    }

    #[test]
    fn test_expand_market_skips_malformed_arrays() {
        let event = gamma_event(vec![]);
        let mut market = gamma_market();
        market.clob_token_ids = Some(r#"["only-one"]"#.to_string());
        assert!(expand_market("l1", &event, &market, &DiscoveryFilters::default()).is_empty());

        let mut market = gamma_market();
        market.outcomes = Some("not json".to_string());
        assert!(expand_market("l1", &event, &market, &DiscoveryFilters::default()).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_tracks_desired_set() {
        let stream = PolymarketStream::new("l1");
        stream.subscribe(&["a".to_string(), "b".to_string()]).await;
        stream.subscribe(&["a".to_string()]).await;
        assert_eq!(stream.desired.lock().len(), 2);

        stream.unsubscribe(&["a".to_string()]).await;
        assert_eq!(stream.desired.lock().len(), 1);
        assert!(stream.desired.lock().contains("b"));
    }
}
