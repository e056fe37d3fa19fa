//! DDL for the capture database.
//!
//! Prices, sizes, and depths are stored as decimal strings so nothing on
//! the accounting path ever passes through binary floating point.

pub const CREATE_LISTENERS: &str = "
CREATE TABLE IF NOT EXISTS listeners (
    id                   TEXT PRIMARY KEY,
    name                 TEXT NOT NULL,
    venue                TEXT NOT NULL,
    filters              TEXT NOT NULL DEFAULT '{}',
    discovery_interval_s INTEGER NOT NULL DEFAULT 60,
    emit_interval_ms     INTEGER NOT NULL DEFAULT 100,
    enable_forward_fill  INTEGER NOT NULL DEFAULT 0,
    is_active            INTEGER NOT NULL DEFAULT 1,
    created_at           INTEGER NOT NULL DEFAULT 0,
    updated_at           INTEGER NOT NULL DEFAULT 0
);
";

pub const CREATE_MARKETS: &str = "
CREATE TABLE IF NOT EXISTS markets (
    listener_id   TEXT NOT NULL,
    token_id      TEXT NOT NULL,
    condition_id  TEXT NOT NULL,
    market_slug   TEXT,
    question      TEXT,
    outcome       TEXT,
    outcome_index INTEGER,
    event_id      TEXT,
    event_title   TEXT,
    category      TEXT,
    series_id     TEXT,
    tags          TEXT,
    description   TEXT,
    volume        TEXT,
    liquidity     TEXT,
    is_active     INTEGER NOT NULL DEFAULT 1,
    is_closed     INTEGER NOT NULL DEFAULT 0,
    state         TEXT NOT NULL DEFAULT 'discovered',
    venue         TEXT,
    PRIMARY KEY (listener_id, token_id)
);
";

pub const CREATE_ORDERBOOK_SNAPSHOTS: &str = "
CREATE TABLE IF NOT EXISTS orderbook_snapshots (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    listener_id       TEXT NOT NULL,
    asset_id          TEXT NOT NULL,
    market            TEXT NOT NULL DEFAULT '',
    timestamp         INTEGER NOT NULL,
    bids              TEXT NOT NULL,
    asks              TEXT NOT NULL,
    best_bid          TEXT,
    best_ask          TEXT,
    spread            TEXT,
    mid_price         TEXT,
    bid_depth         TEXT,
    ask_depth         TEXT,
    hash              TEXT,
    is_forward_filled INTEGER NOT NULL DEFAULT 0,
    source_timestamp  INTEGER,
    venue             TEXT,
    FOREIGN KEY (listener_id, asset_id) REFERENCES markets(listener_id, token_id)
);
";

pub const CREATE_TRADES: &str = "
CREATE TABLE IF NOT EXISTS trades (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    listener_id  TEXT NOT NULL,
    asset_id     TEXT NOT NULL,
    market       TEXT NOT NULL DEFAULT '',
    timestamp    INTEGER NOT NULL,
    price        TEXT NOT NULL,
    size         TEXT NOT NULL,
    side         TEXT NOT NULL,
    fee_rate_bps INTEGER,
    venue        TEXT,
    FOREIGN KEY (listener_id, asset_id) REFERENCES markets(listener_id, token_id)
);
";

/// State transitions are append-only history, never updated in place.
pub const CREATE_MARKET_STATE_HISTORY: &str = "
CREATE TABLE IF NOT EXISTS market_state_history (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    listener_id    TEXT NOT NULL,
    condition_id   TEXT NOT NULL,
    previous_state TEXT,
    new_state      TEXT NOT NULL,
    metadata       TEXT,
    timestamp      INTEGER NOT NULL
);
";

pub const CREATE_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_snapshots_asset_ts ON orderbook_snapshots(asset_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_snapshots_listener_ts ON orderbook_snapshots(listener_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_asset_ts ON trades(asset_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_listener_ts ON trades(listener_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_state_history_condition ON market_state_history(condition_id, timestamp);
";
