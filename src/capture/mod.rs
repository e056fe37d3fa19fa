//! Live ingestion: listeners, the two-priority pipeline, forward-filling.

pub mod config;
pub mod events;
pub mod forward_fill;
pub mod listener;

pub use config::{DiscoveryFilters, ListenerConfig};
pub use events::CaptureEvent;
pub use forward_fill::ForwardFiller;
pub use listener::{Listener, ListenerStats};
