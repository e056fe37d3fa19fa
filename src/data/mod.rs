//! Persistence: schema, store, batched writer, and the replay loader.

pub mod loader;
pub mod schema;
pub mod store;
pub mod writer;

pub use loader::{BacktestDataset, BacktestEvent, DataLoader, EventKind};
pub use store::{SchemaCaps, SqliteStore};
pub use writer::BatchWriter;
