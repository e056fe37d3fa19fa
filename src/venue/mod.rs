//! Venue adapters: heterogeneous wire feeds in, normalized events out.

pub mod auth;
pub mod kalshi;
pub mod polymarket;

use std::time::Duration;

use async_trait::async_trait;

use crate::capture::config::DiscoveryFilters;
use crate::error::CaptureError;
use crate::types::{Market, OrderbookSnapshot, Trade};

/// A normalized market-data event, identical in shape for every venue.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    Orderbook(OrderbookSnapshot),
    Trade(Trade),
}

/// REST discovery of the current market set matching a filter.
#[async_trait]
pub trait MarketDiscovery: Send + Sync {
    async fn discover(
        &self,
        listener_id: &str,
        filters: &DiscoveryFilters,
    ) -> Result<Vec<Market>, CaptureError>;
}

/// A live market-data session.
///
/// `connect` is idempotent and retries with exponential backoff until it
/// lands. Subscriptions are tracked client-side as a desired set and
/// replayed after every reconnect; calling `subscribe` before the
/// session is up just queues the tokens.
#[async_trait]
pub trait MarketStream: Send + Sync {
    async fn connect(&self) -> Result<(), CaptureError>;
    async fn disconnect(&self);
    async fn subscribe(&self, asset_ids: &[String]);
    async fn unsubscribe(&self, asset_ids: &[String]);
    /// Next normalized event; `None` after shutdown.
    async fn recv(&self) -> Option<VenueEvent>;
}

/// Exponential reconnect backoff: 1 s doubling to a 60 s ceiling.
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self { delay: Self::INITIAL }
    }

    /// The delay to sleep before the next attempt; doubles afterwards.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }
}
