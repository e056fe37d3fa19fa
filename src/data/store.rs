//! SQLite-backed storage for listeners, markets, snapshots, and trades.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::capture::config::{DiscoveryFilters, ListenerConfig};
use crate::types::{Market, MarketState, OrderbookSnapshot, PriceLevel, Trade, TradeSide, Venue};

use super::schema;

/// Which optional columns the live schema carries. The batch writer
/// downgrades these when an insert reports a missing column.
#[derive(Debug, Clone, Copy)]
pub struct SchemaCaps {
    pub has_venue_column: bool,
    pub has_forward_fill_columns: bool,
}

impl Default for SchemaCaps {
    fn default() -> Self {
        Self {
            has_venue_column: true,
            has_forward_fill_columns: true,
        }
    }
}

/// Shared connection handle. The capture tasks and the loader both go
/// through the same store; the mutex serializes access around rusqlite's
/// single connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open a file-backed database with WAL and enforced foreign keys.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(schema::CREATE_LISTENERS)?;
        conn.execute_batch(schema::CREATE_MARKETS)?;
        conn.execute_batch(schema::CREATE_ORDERBOOK_SNAPSHOTS)?;
        conn.execute_batch(schema::CREATE_TRADES)?;
        conn.execute_batch(schema::CREATE_MARKET_STATE_HISTORY)?;
        conn.execute_batch(schema::CREATE_INDEXES)?;
        Ok(())
    }

    /// Borrow the underlying connection (ad-hoc queries, migrations in tests).
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn upsert_listener(&self, config: &ListenerConfig) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.lock().execute(
            "INSERT INTO listeners
             (id, name, venue, filters, discovery_interval_s, emit_interval_ms,
              enable_forward_fill, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                venue = excluded.venue,
                filters = excluded.filters,
                discovery_interval_s = excluded.discovery_interval_s,
                emit_interval_ms = excluded.emit_interval_ms,
                enable_forward_fill = excluded.enable_forward_fill,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            rusqlite::params![
                config.id,
                config.name,
                config.venue.as_str(),
                serde_json::to_string(&config.filters)?,
                config.discovery_interval_secs as i64,
                config.emit_interval_ms as i64,
                config.enable_forward_fill,
                config.is_active,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn load_active_listeners(&self) -> Result<Vec<ListenerConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, venue, filters, discovery_interval_s, emit_interval_ms,
                    enable_forward_fill, is_active
             FROM listeners WHERE is_active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let venue_str: String = row.get(2)?;
            let filters_json: String = row.get(3)?;
            Ok((
                ListenerConfig {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    venue: Venue::parse(&venue_str).unwrap_or(Venue::Polymarket),
                    filters: DiscoveryFilters::default(),
                    discovery_interval_secs: row.get::<_, i64>(4)? as u64,
                    emit_interval_ms: row.get::<_, i64>(5)? as u64,
                    enable_forward_fill: row.get(6)?,
                    is_active: row.get(7)?,
                },
                filters_json,
            ))
        })?;

        let mut listeners = Vec::new();
        for row in rows {
            let (mut config, filters_json) = row?;
            config.filters = serde_json::from_str(&filters_json)
                .with_context(|| format!("bad filters JSON for listener {}", config.id))?;
            listeners.push(config);
        }
        Ok(listeners)
    }

    // ------------------------------------------------------------------
    // Markets
    // ------------------------------------------------------------------

    /// Insert or refresh a market row, keyed on `(listener_id, token_id)`.
    pub fn upsert_market(&self, market: &Market) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO markets
             (listener_id, token_id, condition_id, market_slug, question, outcome,
              outcome_index, event_id, event_title, category, series_id, tags,
              description, volume, liquidity, is_active, is_closed, state, venue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(listener_id, token_id) DO UPDATE SET
                condition_id = excluded.condition_id,
                market_slug = excluded.market_slug,
                question = excluded.question,
                outcome = excluded.outcome,
                outcome_index = excluded.outcome_index,
                event_id = excluded.event_id,
                event_title = excluded.event_title,
                category = excluded.category,
                series_id = excluded.series_id,
                tags = excluded.tags,
                description = excluded.description,
                volume = excluded.volume,
                liquidity = excluded.liquidity,
                is_active = excluded.is_active,
                is_closed = excluded.is_closed,
                state = excluded.state,
                venue = excluded.venue",
            rusqlite::params![
                market.listener_id,
                market.token_id,
                market.condition_id,
                market.market_slug,
                market.question,
                market.outcome,
                market.outcome_index,
                market.event_id,
                market.event_title,
                market.category,
                market.series_id,
                market.tags.as_ref().map(|t| serde_json::to_string(t).unwrap_or_default()),
                market.description,
                market.volume.map(|v| v.to_string()),
                market.liquidity.map(|v| v.to_string()),
                market.is_active,
                market.is_closed,
                market.state.as_str(),
                market.venue.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn append_state_transition(
        &self,
        listener_id: &str,
        condition_id: &str,
        previous_state: Option<&str>,
        new_state: &str,
        metadata: &serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO market_state_history
             (listener_id, condition_id, previous_state, new_state, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                listener_id,
                condition_id,
                previous_state,
                new_state,
                metadata.to_string(),
                timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn asset_ids_for_listener(&self, listener_id: &str, venue: Option<Venue>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut sql =
            String::from("SELECT DISTINCT token_id FROM markets WHERE listener_id = ?");
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(listener_id.to_string())];
        if let Some(venue) = venue {
            sql.push_str(" AND venue = ?");
            params.push(Box::new(venue.as_str().to_string()));
        }

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Market metadata keyed by token id.
    pub fn load_markets(
        &self,
        asset_ids: Option<&[String]>,
        venue: Option<Venue>,
        listener_id: Option<&str>,
    ) -> Result<HashMap<String, Market>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT listener_id, token_id, condition_id, market_slug, question, outcome,
                    outcome_index, event_id, event_title, category, series_id, tags,
                    description, volume, liquidity, is_active, is_closed, state, venue
             FROM markets WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(venue) = venue {
            sql.push_str(" AND venue = ?");
            params.push(Box::new(venue.as_str().to_string()));
        }
        if let Some(listener_id) = listener_id {
            sql.push_str(" AND listener_id = ?");
            params.push(Box::new(listener_id.to_string()));
        }
        if let Some(asset_ids) = asset_ids {
            if asset_ids.is_empty() {
                return Ok(HashMap::new());
            }
            let placeholders: Vec<&str> = asset_ids.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND token_id IN ({})", placeholders.join(",")));
            for id in asset_ids {
                params.push(Box::new(id.clone()));
            }
        }

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let tags_json: Option<String> = row.get(11)?;
            let volume: Option<String> = row.get(13)?;
            let liquidity: Option<String> = row.get(14)?;
            let state_str: String = row.get(17)?;
            let venue_str: Option<String> = row.get(18)?;
            Ok(Market {
                listener_id: row.get(0)?,
                token_id: row.get(1)?,
                condition_id: row.get(2)?,
                market_slug: row.get(3)?,
                question: row.get(4)?,
                outcome: row.get(5)?,
                outcome_index: row.get(6)?,
                event_id: row.get(7)?,
                event_title: row.get(8)?,
                category: row.get(9)?,
                series_id: row.get(10)?,
                tags: tags_json.and_then(|t| serde_json::from_str(&t).ok()),
                description: row.get(12)?,
                volume: volume.and_then(|v| Decimal::from_str(&v).ok()),
                liquidity: liquidity.and_then(|v| Decimal::from_str(&v).ok()),
                is_active: row.get(15)?,
                is_closed: row.get(16)?,
                state: MarketState::parse(&state_str).unwrap_or(MarketState::Discovered),
                venue: venue_str
                    .and_then(|v| Venue::parse(&v))
                    .unwrap_or(Venue::Polymarket),
            })
        })?;

        let mut markets = HashMap::new();
        for row in rows {
            let market: Market = row?;
            markets.insert(market.token_id.clone(), market);
        }
        Ok(markets)
    }

    // ------------------------------------------------------------------
    // Batch inserts (used by the writer; raw rusqlite errors preserved
    // so the caller can classify schema and FK failures)
    // ------------------------------------------------------------------

    pub fn insert_snapshot_rows(
        &self,
        snapshots: &[OrderbookSnapshot],
        caps: SchemaCaps,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut columns = vec![
                "listener_id", "asset_id", "market", "timestamp", "bids", "asks",
                "best_bid", "best_ask", "spread", "mid_price", "bid_depth", "ask_depth", "hash",
            ];
            if caps.has_forward_fill_columns {
                columns.push("is_forward_filled");
                columns.push("source_timestamp");
            }
            if caps.has_venue_column {
                columns.push("venue");
            }
            let placeholders: Vec<String> =
                (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO orderbook_snapshots ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare_cached(&sql)?;

            for snap in snapshots {
                let bids = serde_json::to_string(&snap.bids).unwrap_or_else(|_| "[]".into());
                let asks = serde_json::to_string(&snap.asks).unwrap_or_else(|_| "[]".into());
                let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
                    Box::new(snap.listener_id.clone()),
                    Box::new(snap.asset_id.clone()),
                    Box::new(snap.market.clone()),
                    Box::new(snap.timestamp),
                    Box::new(bids),
                    Box::new(asks),
                    Box::new(snap.best_bid.map(|v| v.to_string())),
                    Box::new(snap.best_ask.map(|v| v.to_string())),
                    Box::new(snap.spread.map(|v| v.to_string())),
                    Box::new(snap.mid_price.map(|v| v.to_string())),
                    Box::new(snap.bid_depth.map(|v| v.to_string())),
                    Box::new(snap.ask_depth.map(|v| v.to_string())),
                    Box::new(snap.hash.clone()),
                ];
                if caps.has_forward_fill_columns {
                    values.push(Box::new(snap.is_forward_filled));
                    values.push(Box::new(snap.source_timestamp));
                }
                if caps.has_venue_column {
                    values.push(Box::new(snap.venue.map(|v| v.as_str().to_string())));
                }
                let refs: Vec<&dyn rusqlite::types::ToSql> =
                    values.iter().map(|v| v.as_ref()).collect();
                stmt.execute(refs.as_slice())?;
            }
        }
        tx.commit()
    }

    pub fn insert_trade_rows(&self, trades: &[Trade], caps: SchemaCaps) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let sql = if caps.has_venue_column {
                "INSERT INTO trades
                 (listener_id, asset_id, market, timestamp, price, size, side, fee_rate_bps, venue)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            } else {
                "INSERT INTO trades
                 (listener_id, asset_id, market, timestamp, price, size, side, fee_rate_bps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            };
            let mut stmt = tx.prepare_cached(sql)?;
            for trade in trades {
                if caps.has_venue_column {
                    stmt.execute(rusqlite::params![
                        trade.listener_id,
                        trade.asset_id,
                        trade.market,
                        trade.timestamp,
                        trade.price.to_string(),
                        trade.size.to_string(),
                        trade.side.as_str(),
                        trade.fee_rate_bps,
                        trade.venue.map(|v| v.as_str().to_string()),
                    ])?;
                } else {
                    stmt.execute(rusqlite::params![
                        trade.listener_id,
                        trade.asset_id,
                        trade.market,
                        trade.timestamp,
                        trade.price.to_string(),
                        trade.size.to_string(),
                        trade.side.as_str(),
                        trade.fee_rate_bps,
                    ])?;
                }
            }
        }
        tx.commit()
    }

    // ------------------------------------------------------------------
    // Range loads (replay side)
    // ------------------------------------------------------------------

    pub fn load_snapshots_range(
        &self,
        start_ms: i64,
        end_ms: i64,
        venue: Option<Venue>,
        listener_id: Option<&str>,
        asset_ids: Option<&[String]>,
        include_forward_filled: bool,
    ) -> Result<Vec<OrderbookSnapshot>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT listener_id, asset_id, market, timestamp, bids, asks, hash,
                    is_forward_filled, source_timestamp, venue
             FROM orderbook_snapshots
             WHERE timestamp >= ? AND timestamp <= ?",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(start_ms), Box::new(end_ms)];

        if !include_forward_filled {
            sql.push_str(" AND is_forward_filled = 0");
        }
        if let Some(venue) = venue {
            sql.push_str(" AND venue = ?");
            params.push(Box::new(venue.as_str().to_string()));
        }
        if let Some(listener_id) = listener_id {
            sql.push_str(" AND listener_id = ?");
            params.push(Box::new(listener_id.to_string()));
        }
        if let Some(asset_ids) = asset_ids {
            if asset_ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<&str> = asset_ids.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND asset_id IN ({})", placeholders.join(",")));
            for id in asset_ids {
                params.push(Box::new(id.clone()));
            }
        }
        sql.push_str(" ORDER BY timestamp ASC, asset_id ASC");

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let bids_json: String = row.get(4)?;
            let asks_json: String = row.get(5)?;
            let venue_str: Option<String> = row.get(9)?;
            Ok(OrderbookSnapshot {
                listener_id: row.get(0)?,
                asset_id: row.get(1)?,
                market: row.get(2)?,
                timestamp: row.get(3)?,
                bids: serde_json::from_str::<Vec<PriceLevel>>(&bids_json).unwrap_or_default(),
                asks: serde_json::from_str::<Vec<PriceLevel>>(&asks_json).unwrap_or_default(),
                hash: row.get(6)?,
                best_bid: None,
                best_ask: None,
                spread: None,
                mid_price: None,
                bid_depth: None,
                ask_depth: None,
                is_forward_filled: row.get(7)?,
                source_timestamp: row.get(8)?,
                venue: venue_str.and_then(|v| Venue::parse(&v)),
            })
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let mut snap: OrderbookSnapshot = row?;
            snap.compute_metrics();
            snapshots.push(snap);
        }
        Ok(snapshots)
    }

    pub fn load_trades_range(
        &self,
        start_ms: i64,
        end_ms: i64,
        venue: Option<Venue>,
        listener_id: Option<&str>,
        asset_ids: Option<&[String]>,
    ) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT listener_id, asset_id, market, timestamp, price, size, side, fee_rate_bps, venue
             FROM trades
             WHERE timestamp >= ? AND timestamp <= ?",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(start_ms), Box::new(end_ms)];

        if let Some(venue) = venue {
            sql.push_str(" AND venue = ?");
            params.push(Box::new(venue.as_str().to_string()));
        }
        if let Some(listener_id) = listener_id {
            sql.push_str(" AND listener_id = ?");
            params.push(Box::new(listener_id.to_string()));
        }
        if let Some(asset_ids) = asset_ids {
            if asset_ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<&str> = asset_ids.iter().map(|_| "?").collect();
            sql.push_str(&format!(" AND asset_id IN ({})", placeholders.join(",")));
            for id in asset_ids {
                params.push(Box::new(id.clone()));
            }
        }
        sql.push_str(" ORDER BY timestamp ASC, asset_id ASC");

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let price: String = row.get(4)?;
            let size: String = row.get(5)?;
            let side: String = row.get(6)?;
            let venue_str: Option<String> = row.get(8)?;
            Ok(Trade {
                listener_id: row.get(0)?,
                asset_id: row.get(1)?,
                market: row.get(2)?,
                timestamp: row.get(3)?,
                price: Decimal::from_str(&price).unwrap_or_default(),
                size: Decimal::from_str(&size).unwrap_or_default(),
                side: TradeSide::parse(&side).unwrap_or(TradeSide::Buy),
                fee_rate_bps: row.get(7)?,
                venue: venue_str.and_then(|v| Venue::parse(&v)),
            })
        })?;

        let mut trades = Vec::new();
        for row in rows {
            trades.push(row?);
        }
        Ok(trades)
    }
}
