//! Abstract storage traits for entity-event.
//!
//! The router talks to storage only through a [`Transaction`]. Backends
//! decide how to isolate one: the in-memory backend holds a single write
//! lock and keeps an undo log; a relational backend would map it onto a
//! database transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::EntityId;
use crate::event::{Event, EventActor, EventSeen};
use crate::id::{EventId, MediumId, SourceGroupId, SourceId, SubscriptionId};
use crate::medium::Medium;
use crate::source::{Source, SourceGroup};
use crate::subscription::{Subscription, Unsubscription};
use crate::time::TimeBounds;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Medium not found.
    #[error("Medium not found: {0}")]
    MediumNotFound(MediumId),

    /// Source not found.
    #[error("Source not found: {0}")]
    SourceNotFound(SourceId),

    /// Source group not found.
    #[error("Source group not found: {0}")]
    SourceGroupNotFound(SourceGroupId),

    /// Event not found.
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// Unique key already exists.
    #[error("Duplicate key in {table}: {key}")]
    DuplicateKey {
        /// Table or index that rejected the write.
        table: &'static str,
        /// The conflicting key.
        key: String,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Event-level filters, evaluated conjunctively.
///
/// `seen` is checked against the seen records of `medium` only:
/// `Some(true)` keeps events seen on it, `Some(false)` keeps events not seen
/// on it, `None` does no seen filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub medium: MediumId,
    pub bounds: TimeBounds,
    pub seen: Option<bool>,
    pub include_expired: bool,
    /// Reference instant for the expiry check.
    pub now: DateTime<Utc>,
}

impl EventFilter {
    /// Returns true if `event` passes the time and expiry filters.
    ///
    /// The seen predicate needs storage and is left to the backend.
    #[must_use]
    pub fn matches_time(&self, event: &Event) -> bool {
        self.bounds.contains(event.time) && (self.include_expired || !event.is_expired(self.now))
    }
}

/// Reference data: mediums, sources, source groups.
pub trait CatalogStore {
    /// Insert a medium. Fails on a duplicate id or name.
    fn insert_medium(&mut self, medium: Medium) -> Result<(), StorageError>;

    /// Replace a medium's stored row. The name must not collide with another medium.
    fn update_medium(&mut self, medium: Medium) -> Result<(), StorageError>;

    /// Get a medium by id.
    fn get_medium(&self, id: MediumId) -> Result<Option<Medium>, StorageError>;

    /// Find a medium by its unique name.
    fn find_medium_by_name(&self, name: &str) -> Result<Option<Medium>, StorageError>;

    /// Insert a source group. Fails on a duplicate id or name.
    fn insert_source_group(&mut self, group: SourceGroup) -> Result<(), StorageError>;

    /// Get a source group by id.
    fn get_source_group(&self, id: SourceGroupId) -> Result<Option<SourceGroup>, StorageError>;

    /// Find a source group by its unique name.
    fn find_source_group_by_name(&self, name: &str) -> Result<Option<SourceGroup>, StorageError>;

    /// Insert a source. Its group must exist.
    fn insert_source(&mut self, source: Source) -> Result<(), StorageError>;

    /// Replace a source's stored row.
    fn update_source(&mut self, source: Source) -> Result<(), StorageError>;

    /// Get a source by id.
    fn get_source(&self, id: SourceId) -> Result<Option<Source>, StorageError>;

    /// Find a source by its unique name.
    fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StorageError>;
}

/// Subscription and unsubscription rows.
pub trait SubscriptionStore {
    /// Insert a subscription. Its medium and source must exist.
    fn insert_subscription(&mut self, subscription: Subscription) -> Result<(), StorageError>;

    /// Delete a subscription. Returns true if it existed.
    fn delete_subscription(&mut self, id: SubscriptionId) -> Result<bool, StorageError>;

    /// All subscriptions for a medium, in insertion order.
    fn subscriptions_for_medium(&self, medium: MediumId) -> Result<Vec<Subscription>, StorageError>;

    /// Insert an unsubscription. Its medium and source must exist.
    fn insert_unsubscription(&mut self, unsubscription: Unsubscription) -> Result<(), StorageError>;

    /// Delete every unsubscription row for the triple. Returns the number removed.
    fn delete_unsubscriptions(
        &mut self,
        entity: EntityId,
        medium: MediumId,
        source: SourceId,
    ) -> Result<usize, StorageError>;

    /// All unsubscriptions for a medium.
    fn unsubscriptions_for_medium(&self, medium: MediumId) -> Result<Vec<Unsubscription>, StorageError>;

    /// True iff an unsubscription exists for exactly this triple.
    fn is_unsubscribed(
        &self,
        entity: EntityId,
        source: SourceId,
        medium: MediumId,
    ) -> Result<bool, StorageError>;
}

/// Events, actors and seen state.
pub trait EventStore {
    /// Insert an event with its actor rows, all or nothing.
    ///
    /// Fails with `DuplicateKey` if the uuid is taken and with
    /// `SourceNotFound` if the source does not exist.
    fn insert_event(&mut self, event: Event, actors: Vec<EventActor>) -> Result<(), StorageError>;

    /// Get an event by id.
    fn get_event(&self, id: EventId) -> Result<Option<Event>, StorageError>;

    /// Find an event by its idempotency key.
    fn find_event_by_uuid(&self, uuid: &str) -> Result<Option<Event>, StorageError>;

    /// Events passing `filter`, ordered by creation time then insertion.
    fn filtered_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StorageError>;

    /// Actor entity ids for each of `events`. Events without actors map to an empty list.
    fn actors_for(&self, events: &[EventId]) -> Result<HashMap<EventId, Vec<EntityId>>, StorageError>;

    /// Ensure a seen row exists for each `(event, medium)` pair.
    ///
    /// Pairs that are already marked are left untouched. Returns the number
    /// of rows created.
    fn mark_seen(
        &mut self,
        medium: MediumId,
        events: &[EventId],
        time_seen: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    /// Seen rows recorded for an event, across all mediums.
    fn seen_records(&self, event: EventId) -> Result<Vec<EventSeen>, StorageError>;
}

/// One isolated unit of work.
///
/// Writes become visible to other transactions only on [`commit`]. Dropping
/// an uncommitted transaction discards them.
///
/// [`commit`]: Transaction::commit
pub trait Transaction: CatalogStore + SubscriptionStore + EventStore {
    /// Make this transaction's writes durable and release it.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// A backend able to open transactions.
pub trait RoutingStore: Send + Sync {
    /// Open a transaction. Blocks while a conflicting one is open.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError>;
}
