//! Listener configuration and discovery filters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Venue;

/// What a discovery sweep should match.
///
/// The two venues use different vocabularies; a filter set carries both
/// and each adapter reads the fields it understands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryFilters {
    // Two-token venue
    pub series_ids: Vec<String>,
    pub tag_ids: Vec<String>,
    pub condition_ids: Vec<String>,
    pub slug_patterns: Vec<String>,
    pub min_liquidity: Option<Decimal>,
    pub min_volume: Option<Decimal>,
    // Single-ticker venue
    pub series_tickers: Vec<String>,
    pub event_tickers: Vec<String>,
    pub market_tickers: Vec<String>,
    pub status: Option<String>,
    pub title_contains: Option<String>,
}

/// One listener: a venue, a filter set, and its cadence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub id: String,
    pub name: String,
    pub venue: Venue,
    #[serde(default)]
    pub filters: DiscoveryFilters,
    pub discovery_interval_secs: u64,
    pub emit_interval_ms: u64,
    pub enable_forward_fill: bool,
    pub is_active: bool,
}

impl ListenerConfig {
    pub fn new(id: &str, name: &str, venue: Venue) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            venue,
            filters: DiscoveryFilters::default(),
            discovery_interval_secs: 60,
            emit_interval_ms: 100,
            enable_forward_fill: false,
            is_active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_deserialize_with_defaults() {
        let filters: DiscoveryFilters =
            serde_json::from_str(r#"{"series_tickers": ["KXBTC"], "status": "open"}"#).unwrap();
        assert_eq!(filters.series_tickers, vec!["KXBTC".to_string()]);
        assert_eq!(filters.status.as_deref(), Some("open"));
        assert!(filters.condition_ids.is_empty());
        assert!(filters.min_liquidity.is_none());
    }

    #[test]
    fn test_listener_config_roundtrip() {
        let mut config = ListenerConfig::new("l1", "test", Venue::Polymarket);
        config.filters.condition_ids = vec!["0xabc".to_string()];

        let json = serde_json::to_string(&config).unwrap();
        let back: ListenerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "l1");
        assert_eq!(back.venue, Venue::Polymarket);
        assert_eq!(back.filters.condition_ids, vec!["0xabc".to_string()]);
        assert_eq!(back.discovery_interval_secs, 60);
    }
}
