//! In-memory storage backend.
//!
//! Thread-safe reference implementation of [`RoutingStore`], intended for
//! embedded usage and tests. A transaction holds the store's write lock for
//! its whole lifetime and records an undo entry for every write; dropping it
//! without committing replays the undo log in reverse.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::entity::EntityId;
use crate::event::{Event, EventActor, EventSeen};
use crate::id::{EventId, MediumId, SourceGroupId, SourceId, SubscriptionId, UnsubscriptionId};
use crate::medium::Medium;
use crate::source::{Source, SourceGroup};
use crate::storage::traits::{
    CatalogStore, EventFilter, EventStore, RoutingStore, StorageError, SubscriptionStore,
    Transaction,
};
use crate::subscription::{Subscription, Unsubscription};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Stable sort: ties on `time` keep insertion order.
fn ordered(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by_key(|e| e.time);
    events
}

fn duplicate(table: &'static str, key: impl ToString) -> StorageError {
    StorageError::DuplicateKey {
        table,
        key: key.to_string(),
    }
}

#[derive(Debug, Default)]
struct StoreState {
    mediums: HashMap<MediumId, Medium>,
    medium_names: HashMap<String, MediumId>,
    groups: HashMap<SourceGroupId, SourceGroup>,
    group_names: HashMap<String, SourceGroupId>,
    sources: HashMap<SourceId, Source>,
    source_names: HashMap<String, SourceId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    subscriptions_by_medium: HashMap<MediumId, Vec<SubscriptionId>>,
    unsubscriptions: HashMap<UnsubscriptionId, Unsubscription>,
    unsubscriptions_by_medium: HashMap<MediumId, Vec<UnsubscriptionId>>,
    events: HashMap<EventId, Event>,
    event_order: Vec<EventId>,
    event_uuids: HashMap<String, EventId>,
    actors: HashMap<EventId, Vec<EntityId>>,
    seen: HashMap<EventId, HashMap<MediumId, EventSeen>>,
}

/// Inverse of one write, replayed on rollback.
#[derive(Debug)]
enum Undo {
    InsertMedium(MediumId),
    UpdateMedium(Medium),
    InsertSourceGroup(SourceGroupId),
    InsertSource(SourceId),
    UpdateSource(Source),
    InsertSubscription(SubscriptionId),
    DeleteSubscription { subscription: Subscription, position: usize },
    InsertUnsubscription(UnsubscriptionId),
    DeleteUnsubscription(Unsubscription),
    InsertEvent(EventId),
    MarkSeen { event: EventId, medium: MediumId },
}

impl StoreState {
    fn put_medium(&mut self, medium: Medium) -> Option<Medium> {
        let prev = self.mediums.insert(medium.id, medium.clone());
        if let Some(prev) = &prev {
            self.medium_names.remove(&prev.name);
        }
        self.medium_names.insert(medium.name, medium.id);
        prev
    }

    fn put_source(&mut self, source: Source) -> Option<Source> {
        let prev = self.sources.insert(source.id, source.clone());
        if let Some(prev) = &prev {
            self.source_names.remove(&prev.name);
        }
        self.source_names.insert(source.name, source.id);
        prev
    }

    fn remove_subscription(&mut self, id: SubscriptionId) -> Option<(Subscription, usize)> {
        let subscription = self.subscriptions.remove(&id)?;
        let ids = self
            .subscriptions_by_medium
            .entry(subscription.medium)
            .or_default();
        let position = ids.iter().position(|s| *s == id).unwrap_or(ids.len());
        if position < ids.len() {
            ids.remove(position);
        }
        Some((subscription, position))
    }

    fn remove_unsubscription(&mut self, id: UnsubscriptionId) -> Option<Unsubscription> {
        let unsubscription = self.unsubscriptions.remove(&id)?;
        if let Some(ids) = self.unsubscriptions_by_medium.get_mut(&unsubscription.medium) {
            ids.retain(|u| *u != id);
        }
        Some(unsubscription)
    }

    fn push_unsubscription(&mut self, unsubscription: Unsubscription) {
        self.unsubscriptions_by_medium
            .entry(unsubscription.medium)
            .or_default()
            .push(unsubscription.id);
        self.unsubscriptions.insert(unsubscription.id, unsubscription);
    }

    fn remove_event(&mut self, id: EventId) {
        if let Some(event) = self.events.remove(&id) {
            self.event_uuids.remove(&event.uuid);
        }
        self.event_order.retain(|e| *e != id);
        self.actors.remove(&id);
        self.seen.remove(&id);
    }

    fn is_seen(&self, event: EventId, medium: MediumId) -> bool {
        self.seen
            .get(&event)
            .map_or(false, |by_medium| by_medium.contains_key(&medium))
    }

    fn revert(&mut self, op: Undo) {
        match op {
            Undo::InsertMedium(id) => {
                if let Some(medium) = self.mediums.remove(&id) {
                    self.medium_names.remove(&medium.name);
                }
            }
            Undo::UpdateMedium(prev) => {
                self.put_medium(prev);
            }
            Undo::InsertSourceGroup(id) => {
                if let Some(group) = self.groups.remove(&id) {
                    self.group_names.remove(&group.name);
                }
            }
            Undo::InsertSource(id) => {
                if let Some(source) = self.sources.remove(&id) {
                    self.source_names.remove(&source.name);
                }
            }
            Undo::UpdateSource(prev) => {
                self.put_source(prev);
            }
            Undo::InsertSubscription(id) => {
                self.remove_subscription(id);
            }
            Undo::DeleteSubscription {
                subscription,
                position,
            } => {
                let ids = self
                    .subscriptions_by_medium
                    .entry(subscription.medium)
                    .or_default();
                ids.insert(position.min(ids.len()), subscription.id);
                self.subscriptions.insert(subscription.id, subscription);
            }
            Undo::InsertUnsubscription(id) => {
                self.remove_unsubscription(id);
            }
            Undo::DeleteUnsubscription(unsubscription) => {
                self.push_unsubscription(unsubscription);
            }
            Undo::InsertEvent(id) => self.remove_event(id),
            Undo::MarkSeen { event, medium } => {
                if let Some(by_medium) = self.seen.get_mut(&event) {
                    by_medium.remove(&medium);
                    if by_medium.is_empty() {
                        self.seen.remove(&event);
                    }
                }
            }
        }
    }
}

/// Thread-safe in-memory store.
///
/// Every transaction holds the store's write lock until it commits or is
/// dropped, read-only ones included. Transactions are therefore fully
/// serialized, and concurrent readers wait on each other.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoutingStore for InMemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("store.begin"))?;
        Ok(Box::new(InMemoryTransaction {
            state,
            undo: Vec::new(),
            committed: false,
        }))
    }
}

/// Transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction<'a> {
    state: RwLockWriteGuard<'a, StoreState>,
    undo: Vec<Undo>,
    committed: bool,
}

impl std::fmt::Debug for InMemoryTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("pending_writes", &self.undo.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(op) = self.undo.pop() {
            self.state.revert(op);
        }
    }
}

impl Transaction for InMemoryTransaction<'_> {
    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}

impl CatalogStore for InMemoryTransaction<'_> {
    fn insert_medium(&mut self, medium: Medium) -> Result<(), StorageError> {
        if self.state.mediums.contains_key(&medium.id) {
            return Err(duplicate("medium.id", medium.id));
        }
        if self.state.medium_names.contains_key(&medium.name) {
            return Err(duplicate("medium.name", &medium.name));
        }
        self.undo.push(Undo::InsertMedium(medium.id));
        self.state.put_medium(medium);
        Ok(())
    }

    fn update_medium(&mut self, medium: Medium) -> Result<(), StorageError> {
        if !self.state.mediums.contains_key(&medium.id) {
            return Err(StorageError::MediumNotFound(medium.id));
        }
        if let Some(owner) = self.state.medium_names.get(&medium.name) {
            if *owner != medium.id {
                return Err(duplicate("medium.name", &medium.name));
            }
        }
        if let Some(prev) = self.state.put_medium(medium) {
            self.undo.push(Undo::UpdateMedium(prev));
        }
        Ok(())
    }

    fn get_medium(&self, id: MediumId) -> Result<Option<Medium>, StorageError> {
        Ok(self.state.mediums.get(&id).cloned())
    }

    fn find_medium_by_name(&self, name: &str) -> Result<Option<Medium>, StorageError> {
        Ok(self
            .state
            .medium_names
            .get(name)
            .and_then(|id| self.state.mediums.get(id))
            .cloned())
    }

    fn insert_source_group(&mut self, group: SourceGroup) -> Result<(), StorageError> {
        if self.state.groups.contains_key(&group.id) {
            return Err(duplicate("source_group.id", group.id));
        }
        if self.state.group_names.contains_key(&group.name) {
            return Err(duplicate("source_group.name", &group.name));
        }
        self.undo.push(Undo::InsertSourceGroup(group.id));
        self.state.group_names.insert(group.name.clone(), group.id);
        self.state.groups.insert(group.id, group);
        Ok(())
    }

    fn get_source_group(&self, id: SourceGroupId) -> Result<Option<SourceGroup>, StorageError> {
        Ok(self.state.groups.get(&id).cloned())
    }

    fn find_source_group_by_name(&self, name: &str) -> Result<Option<SourceGroup>, StorageError> {
        Ok(self
            .state
            .group_names
            .get(name)
            .and_then(|id| self.state.groups.get(id))
            .cloned())
    }

    fn insert_source(&mut self, source: Source) -> Result<(), StorageError> {
        if !self.state.groups.contains_key(&source.group) {
            return Err(StorageError::SourceGroupNotFound(source.group));
        }
        if self.state.sources.contains_key(&source.id) {
            return Err(duplicate("source.id", source.id));
        }
        if self.state.source_names.contains_key(&source.name) {
            return Err(duplicate("source.name", &source.name));
        }
        self.undo.push(Undo::InsertSource(source.id));
        self.state.put_source(source);
        Ok(())
    }

    fn update_source(&mut self, source: Source) -> Result<(), StorageError> {
        if !self.state.sources.contains_key(&source.id) {
            return Err(StorageError::SourceNotFound(source.id));
        }
        if !self.state.groups.contains_key(&source.group) {
            return Err(StorageError::SourceGroupNotFound(source.group));
        }
        if let Some(owner) = self.state.source_names.get(&source.name) {
            if *owner != source.id {
                return Err(duplicate("source.name", &source.name));
            }
        }
        if let Some(prev) = self.state.put_source(source) {
            self.undo.push(Undo::UpdateSource(prev));
        }
        Ok(())
    }

    fn get_source(&self, id: SourceId) -> Result<Option<Source>, StorageError> {
        Ok(self.state.sources.get(&id).cloned())
    }

    fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StorageError> {
        Ok(self
            .state
            .source_names
            .get(name)
            .and_then(|id| self.state.sources.get(id))
            .cloned())
    }
}

impl InMemoryTransaction<'_> {
    fn require_medium_and_source(&self, medium: MediumId, source: SourceId) -> Result<(), StorageError> {
        if !self.state.mediums.contains_key(&medium) {
            return Err(StorageError::MediumNotFound(medium));
        }
        if !self.state.sources.contains_key(&source) {
            return Err(StorageError::SourceNotFound(source));
        }
        Ok(())
    }

    fn unsubscription_ids(&self, medium: MediumId) -> &[UnsubscriptionId] {
        self.state
            .unsubscriptions_by_medium
            .get(&medium)
            .map_or(&[], Vec::as_slice)
    }
}

impl SubscriptionStore for InMemoryTransaction<'_> {
    fn insert_subscription(&mut self, subscription: Subscription) -> Result<(), StorageError> {
        self.require_medium_and_source(subscription.medium, subscription.source)?;
        if self.state.subscriptions.contains_key(&subscription.id) {
            return Err(duplicate("subscription.id", subscription.id));
        }
        self.undo.push(Undo::InsertSubscription(subscription.id));
        self.state
            .subscriptions_by_medium
            .entry(subscription.medium)
            .or_default()
            .push(subscription.id);
        self.state.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    fn delete_subscription(&mut self, id: SubscriptionId) -> Result<bool, StorageError> {
        let Some((subscription, position)) = self.state.remove_subscription(id) else {
            return Ok(false);
        };
        self.undo.push(Undo::DeleteSubscription {
            subscription,
            position,
        });
        Ok(true)
    }

    fn subscriptions_for_medium(&self, medium: MediumId) -> Result<Vec<Subscription>, StorageError> {
        let Some(ids) = self.state.subscriptions_by_medium.get(&medium) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.state.subscriptions.get(id).cloned())
            .collect())
    }

    fn insert_unsubscription(&mut self, unsubscription: Unsubscription) -> Result<(), StorageError> {
        self.require_medium_and_source(unsubscription.medium, unsubscription.source)?;
        if self.state.unsubscriptions.contains_key(&unsubscription.id) {
            return Err(duplicate("unsubscription.id", unsubscription.id));
        }
        self.undo.push(Undo::InsertUnsubscription(unsubscription.id));
        self.state.push_unsubscription(unsubscription);
        Ok(())
    }

    fn delete_unsubscriptions(
        &mut self,
        entity: EntityId,
        medium: MediumId,
        source: SourceId,
    ) -> Result<usize, StorageError> {
        let matching: Vec<UnsubscriptionId> = self
            .unsubscription_ids(medium)
            .iter()
            .copied()
            .filter(|id| {
                self.state
                    .unsubscriptions
                    .get(id)
                    .map_or(false, |u| u.matches(entity, source, medium))
            })
            .collect();

        for id in &matching {
            if let Some(removed) = self.state.remove_unsubscription(*id) {
                self.undo.push(Undo::DeleteUnsubscription(removed));
            }
        }
        Ok(matching.len())
    }

    fn unsubscriptions_for_medium(&self, medium: MediumId) -> Result<Vec<Unsubscription>, StorageError> {
        Ok(self
            .unsubscription_ids(medium)
            .iter()
            .filter_map(|id| self.state.unsubscriptions.get(id).cloned())
            .collect())
    }

    fn is_unsubscribed(
        &self,
        entity: EntityId,
        source: SourceId,
        medium: MediumId,
    ) -> Result<bool, StorageError> {
        Ok(self.unsubscription_ids(medium).iter().any(|id| {
            self.state
                .unsubscriptions
                .get(id)
                .map_or(false, |u| u.matches(entity, source, medium))
        }))
    }
}

impl EventStore for InMemoryTransaction<'_> {
    fn insert_event(&mut self, event: Event, actors: Vec<EventActor>) -> Result<(), StorageError> {
        if !self.state.sources.contains_key(&event.source) {
            return Err(StorageError::SourceNotFound(event.source));
        }
        if self.state.events.contains_key(&event.id) {
            return Err(duplicate("event.id", event.id));
        }
        if self.state.event_uuids.contains_key(&event.uuid) {
            return Err(duplicate("event.uuid", &event.uuid));
        }
        if let Some(stray) = actors.iter().find(|a| a.event != event.id) {
            return Err(StorageError::BackendError(format!(
                "actor row for event {} passed with event {}",
                stray.event, event.id
            )));
        }

        let id = event.id;
        self.undo.push(Undo::InsertEvent(id));
        self.state.event_uuids.insert(event.uuid.clone(), id);
        self.state.event_order.push(id);
        self.state.events.insert(id, event);
        self.state
            .actors
            .insert(id, actors.into_iter().map(|a| a.entity).collect());
        Ok(())
    }

    fn get_event(&self, id: EventId) -> Result<Option<Event>, StorageError> {
        Ok(self.state.events.get(&id).cloned())
    }

    fn find_event_by_uuid(&self, uuid: &str) -> Result<Option<Event>, StorageError> {
        Ok(self
            .state
            .event_uuids
            .get(uuid)
            .and_then(|id| self.state.events.get(id))
            .cloned())
    }

    fn filtered_events(&self, filter: &EventFilter) -> Result<Vec<Event>, StorageError> {
        let events = self
            .state
            .event_order
            .iter()
            .filter_map(|id| self.state.events.get(id))
            .filter(|event| filter.matches_time(event))
            .filter(|event| match filter.seen {
                Some(seen) => self.state.is_seen(event.id, filter.medium) == seen,
                None => true,
            })
            .cloned()
            .collect();
        Ok(ordered(events))
    }

    fn actors_for(&self, events: &[EventId]) -> Result<HashMap<EventId, Vec<EntityId>>, StorageError> {
        Ok(events
            .iter()
            .map(|id| {
                let actors = self.state.actors.get(id).cloned().unwrap_or_default();
                (*id, actors)
            })
            .collect())
    }

    fn mark_seen(
        &mut self,
        medium: MediumId,
        events: &[EventId],
        time_seen: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        if !self.state.mediums.contains_key(&medium) {
            return Err(StorageError::MediumNotFound(medium));
        }
        if let Some(missing) = events.iter().find(|id| !self.state.events.contains_key(id)) {
            return Err(StorageError::EventNotFound(*missing));
        }

        let mut created = 0;
        for &event in events {
            if self.state.is_seen(event, medium) {
                continue;
            }
            self.state.seen.entry(event).or_default().insert(
                medium,
                EventSeen {
                    event,
                    medium,
                    time_seen,
                },
            );
            self.undo.push(Undo::MarkSeen { event, medium });
            created += 1;
        }
        Ok(created)
    }

    fn seen_records(&self, event: EventId) -> Result<Vec<EventSeen>, StorageError> {
        let mut records: Vec<EventSeen> = self
            .state
            .seen
            .get(&event)
            .map(|by_medium| by_medium.values().copied().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| (r.time_seen, r.medium));
        Ok(records)
    }
}
