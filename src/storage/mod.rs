//! Storage layer for entity-event.
//!
//! The router reaches storage only through [`RoutingStore`] transactions.
//! [`InMemoryStore`] is the bundled backend.

mod memory;
mod traits;

pub use memory::{InMemoryStore, InMemoryTransaction};
pub use traits::{
    CatalogStore, EventFilter, EventStore, RoutingStore, StorageError, SubscriptionStore,
    Transaction,
};
