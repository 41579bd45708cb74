//! The event router.
//!
//! Every public operation runs inside exactly one storage transaction. Query
//! operations read their candidate events first, materialized, and only then
//! apply the optional mark-seen write, so an `unseen` query that marks what
//! it reads still returns those events.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{MarkSeenScope, RouterConfig};
use crate::context::{Context, ContextLoader, ContextLoaderRegistry};
use crate::entity::{Entity, EntityId, EntityKind, EntitySet};
use crate::error::{ConfigurationError, ConstraintError, EventError, EventResult};
use crate::event::{Event, EventActor, EventSeen, NewEvent, DISPLAY_TIME_FORMAT};
use crate::graph::EntityGraph;
use crate::id::{EventId, MediumId, SourceGroupId, SourceId, SubscriptionId};
use crate::medium::Medium;
use crate::source::{Source, SourceGroup};
use crate::storage::{EventFilter, RoutingStore, StorageError, Transaction};
use crate::subscription::{Subscription, Unsubscription};
use crate::time::{Clock, SystemClock, TimeBounds};

use super::follow::{FollowPolicy, FollowResolver};
use super::index::{subscribed_entities, SubscriptionIndex};
use super::predicate::{SubscriptionClause, SubscriptionPredicate};
use super::unsubscription::UnsubscriptionCache;

/// Event-level filters shared by the router's query operations.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use entity_event::router::EventQuery;
///
/// let query = EventQuery::new()
///     .since(Utc::now() - Duration::days(1))
///     .unseen()
///     .mark_seen();
/// assert_eq!(query.seen, Some(false));
/// assert!(query.mark_seen);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Inclusive creation time bounds.
    pub bounds: TimeBounds,
    /// `Some(true)`: only events seen on the medium. `Some(false)`: only
    /// events not seen on it. `None`: no seen filtering.
    pub seen: Option<bool>,
    /// Keep events whose expiry has passed.
    pub include_expired: bool,
    /// Record the events as seen on the medium after reading them.
    pub mark_seen: bool,
}

impl EventQuery {
    /// A query with no filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only events created at or after `start`.
    #[must_use]
    pub const fn since(mut self, start: DateTime<Utc>) -> Self {
        self.bounds.start = Some(start);
        self
    }

    /// Only events created at or before `end`.
    #[must_use]
    pub const fn until(mut self, end: DateTime<Utc>) -> Self {
        self.bounds.end = Some(end);
        self
    }

    /// Filter on seen state.
    #[must_use]
    pub const fn seen(mut self, seen: bool) -> Self {
        self.seen = Some(seen);
        self
    }

    /// Only events not yet seen on the medium.
    #[must_use]
    pub const fn unseen(self) -> Self {
        self.seen(false)
    }

    /// Keep expired events.
    #[must_use]
    pub const fn include_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }

    /// Mark the events as seen.
    ///
    /// Applies whatever the `seen` filter is, not only alongside
    /// [`unseen`](Self::unseen).
    #[must_use]
    pub const fn mark_seen(mut self) -> Self {
        self.mark_seen = true;
        self
    }

    fn filter(&self, medium: MediumId, now: DateTime<Utc>) -> EventFilter {
        EventFilter {
            medium,
            bounds: self.bounds,
            seen: self.seen,
            include_expired: self.include_expired,
            now,
        }
    }
}

/// An event with the entities it should be delivered to.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTargets {
    /// The routed event.
    pub event: Event,
    /// Never empty. May repeat an entity unless `dedupe_targets` is set.
    pub targets: Vec<Entity>,
}

/// Builder for [`EventRouter`].
pub struct EventRouterBuilder {
    store: Arc<dyn RoutingStore>,
    graph: Arc<dyn EntityGraph>,
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    loaders: ContextLoaderRegistry,
    follow_policies: HashMap<String, Arc<dyn FollowPolicy>>,
}

impl EventRouterBuilder {
    /// Sets the router configuration.
    #[must_use]
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for event times, expiry and seen stamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the loaders sources may refer to.
    #[must_use]
    pub fn context_loaders(mut self, loaders: ContextLoaderRegistry) -> Self {
        self.loaders = loaders;
        self
    }

    /// Overrides the follow policy of the medium named `medium`.
    #[must_use]
    pub fn follow_policy(
        mut self,
        medium: impl Into<String>,
        policy: impl FollowPolicy + 'static,
    ) -> Self {
        self.follow_policies.insert(medium.into(), Arc::new(policy));
        self
    }

    /// Builds the router.
    #[must_use]
    pub fn build(self) -> EventRouter {
        EventRouter {
            store: self.store,
            graph: self.graph,
            default_follow: self.config.default_follow.into(),
            config: self.config,
            clock: self.clock,
            loaders: self.loaders,
            follow_policies: self.follow_policies,
            resolved_loaders: RwLock::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for EventRouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouterBuilder")
            .field("config", &self.config)
            .field("loaders", &self.loaders)
            .field("follow_policies", &self.follow_policies.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Routes events to mediums and entities.
pub struct EventRouter {
    store: Arc<dyn RoutingStore>,
    graph: Arc<dyn EntityGraph>,
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    loaders: ContextLoaderRegistry,
    follow_policies: HashMap<String, Arc<dyn FollowPolicy>>,
    default_follow: Arc<dyn FollowPolicy>,
    resolved_loaders: RwLock<HashMap<SourceId, Arc<dyn ContextLoader>>>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("config", &self.config)
            .field("loaders", &self.loaders)
            .field("default_follow", &self.default_follow.name())
            .field("follow_policies", &self.follow_policies.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Maps missing foreign rows to constraint errors.
fn missing_reference(err: StorageError) -> EventError {
    match err {
        StorageError::MediumNotFound(id) => ConstraintError::UnknownMedium { id }.into(),
        StorageError::SourceNotFound(id) => ConstraintError::UnknownSource { id }.into(),
        StorageError::SourceGroupNotFound(id) => ConstraintError::UnknownSourceGroup { id }.into(),
        other => other.into(),
    }
}

fn duplicate_name(table: &'static str, name: &str) -> EventError {
    ConstraintError::DuplicateName {
        table,
        name: name.to_string(),
    }
    .into()
}

impl EventRouter {
    /// A router with the default configuration and the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn RoutingStore>, graph: Arc<dyn EntityGraph>) -> Self {
        Self::builder(store, graph).build()
    }

    /// Starts building a router over `store` and `graph`.
    #[must_use]
    pub fn builder(store: Arc<dyn RoutingStore>, graph: Arc<dyn EntityGraph>) -> EventRouterBuilder {
        EventRouterBuilder {
            store,
            graph,
            config: RouterConfig::default(),
            clock: Arc::new(SystemClock),
            loaders: ContextLoaderRegistry::new(),
            follow_policies: HashMap::new(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&dyn Transaction) -> Result<T, StorageError>,
    ) -> EventResult<T> {
        let tx = self.store.begin()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn policy_for(&self, medium: &Medium) -> &dyn FollowPolicy {
        self.follow_policies
            .get(&medium.name)
            .unwrap_or(&self.default_follow)
            .as_ref()
    }

    fn resolver(&self, medium: &Medium) -> FollowResolver<'_> {
        FollowResolver::new(self.graph.as_ref(), self.policy_for(medium))
    }

    // ----- reference data -----

    /// Creates a source group.
    ///
    /// # Errors
    ///
    /// Validation errors, or `ConstraintError::DuplicateName`.
    pub fn create_source_group(&self, group: SourceGroup) -> EventResult<SourceGroup> {
        group.validate()?;
        let mut tx = self.store.begin()?;
        if tx.find_source_group_by_name(&group.name)?.is_some() {
            return Err(duplicate_name("source group", &group.name));
        }
        tx.insert_source_group(group.clone())?;
        tx.commit()?;
        info!(source_group = %group.name, id = %group.id, "created source group");
        Ok(group)
    }

    /// Creates a medium.
    ///
    /// # Errors
    ///
    /// Validation errors, or `ConstraintError::DuplicateName`.
    pub fn create_medium(&self, medium: Medium) -> EventResult<Medium> {
        medium.validate()?;
        let mut tx = self.store.begin()?;
        if tx.find_medium_by_name(&medium.name)?.is_some() {
            return Err(duplicate_name("medium", &medium.name));
        }
        tx.insert_medium(medium.clone())?;
        tx.commit()?;
        info!(
            medium = %medium.name,
            id = %medium.id,
            follow = self.policy_for(&medium).name(),
            "created medium"
        );
        Ok(medium)
    }

    /// Creates a source, resolving its context loader first.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError` if the loader reference is malformed or not
    ///   registered.
    /// - `ConstraintError` on a duplicate name or an unknown group.
    pub fn create_source(&self, source: Source) -> EventResult<Source> {
        source.validate()?;
        let loader = self.resolve_loader(&source)?;
        let mut tx = self.store.begin()?;
        if tx.get_source_group(source.group)?.is_none() {
            return Err(ConstraintError::UnknownSourceGroup { id: source.group }.into());
        }
        if tx.find_source_by_name(&source.name)?.is_some() {
            return Err(duplicate_name("source", &source.name));
        }
        tx.insert_source(source.clone()).map_err(missing_reference)?;
        tx.commit()?;
        self.cache_loader(source.id, loader)?;
        info!(source = %source.name, id = %source.id, group = %source.group, "created source");
        Ok(source)
    }

    /// Updates a medium's `display_name` and `description`.
    ///
    /// # Errors
    ///
    /// Validation errors, or `ConstraintError::UnknownMedium`.
    pub fn update_medium(&self, medium: &Medium) -> EventResult<Medium> {
        medium.validate()?;
        let mut tx = self.store.begin()?;
        let Some(mut stored) = tx.get_medium(medium.id)? else {
            return Err(ConstraintError::UnknownMedium { id: medium.id }.into());
        };
        stored.display_name.clone_from(&medium.display_name);
        stored.description.clone_from(&medium.description);
        tx.update_medium(stored.clone())?;
        tx.commit()?;
        info!(medium = %stored.name, "updated medium");
        Ok(stored)
    }

    /// Updates a source's `display_name`, `description` and context loader.
    ///
    /// # Errors
    ///
    /// As [`create_source`](Self::create_source), or
    /// `ConstraintError::UnknownSource`.
    pub fn update_source(&self, source: &Source) -> EventResult<Source> {
        source.validate()?;
        let mut tx = self.store.begin()?;
        let Some(mut stored) = tx.get_source(source.id)? else {
            return Err(ConstraintError::UnknownSource { id: source.id }.into());
        };
        stored.display_name.clone_from(&source.display_name);
        stored.description.clone_from(&source.description);
        stored.context_loader.clone_from(&source.context_loader);
        let loader = self.resolve_loader(&stored)?;
        tx.update_source(stored.clone()).map_err(missing_reference)?;
        tx.commit()?;
        self.cache_loader(stored.id, loader)?;
        info!(source = %stored.name, "updated source");
        Ok(stored)
    }

    /// Looks up a medium by id.
    pub fn medium(&self, id: MediumId) -> EventResult<Option<Medium>> {
        self.read(|tx| tx.get_medium(id))
    }

    /// Looks up a medium by name.
    pub fn medium_by_name(&self, name: &str) -> EventResult<Option<Medium>> {
        self.read(|tx| tx.find_medium_by_name(name))
    }

    /// Looks up a source by id.
    pub fn source(&self, id: SourceId) -> EventResult<Option<Source>> {
        self.read(|tx| tx.get_source(id))
    }

    /// Looks up a source by name.
    pub fn source_by_name(&self, name: &str) -> EventResult<Option<Source>> {
        self.read(|tx| tx.find_source_by_name(name))
    }

    /// Looks up a source group by id.
    pub fn source_group(&self, id: SourceGroupId) -> EventResult<Option<SourceGroup>> {
        self.read(|tx| tx.get_source_group(id))
    }

    /// Looks up a source group by name.
    pub fn source_group_by_name(&self, name: &str) -> EventResult<Option<SourceGroup>> {
        self.read(|tx| tx.find_source_group_by_name(name))
    }

    // ----- context loaders -----

    fn resolve_loader(
        &self,
        source: &Source,
    ) -> Result<Option<Arc<dyn ContextLoader>>, ConfigurationError> {
        let Some(reference) = &source.context_loader else {
            return Ok(None);
        };
        let loader = self.loaders.resolve(&source.name, reference)?;
        info!(source = %source.name, loader = %reference, "resolved context loader");
        Ok(Some(loader))
    }

    fn cache_loader(
        &self,
        source: SourceId,
        loader: Option<Arc<dyn ContextLoader>>,
    ) -> EventResult<()> {
        let mut cache = self
            .resolved_loaders
            .write()
            .map_err(|_| EventError::internal("context loader cache lock poisoned"))?;
        match loader {
            Some(loader) => cache.insert(source, loader),
            None => cache.remove(&source),
        };
        Ok(())
    }

    fn cached_loader(&self, source: SourceId) -> EventResult<Option<Arc<dyn ContextLoader>>> {
        let cache = self
            .resolved_loaders
            .read()
            .map_err(|_| EventError::internal("context loader cache lock poisoned"))?;
        Ok(cache.get(&source).cloned())
    }

    /// An event's context with its source's loader applied.
    ///
    /// Sources without a loader return the stored context unchanged.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` if the source names a loader that is no longer
    /// registered.
    pub fn event_context(&self, event: &Event) -> EventResult<Context> {
        let loader = match self.cached_loader(event.source)? {
            Some(loader) => Some(loader),
            None => {
                let source = self
                    .read(|tx| tx.get_source(event.source))?
                    .ok_or(ConstraintError::UnknownSource { id: event.source })?;
                let loader = self.resolve_loader(&source)?;
                if loader.is_some() {
                    self.cache_loader(source.id, loader.clone())?;
                }
                loader
            }
        };
        Ok(match loader {
            Some(loader) => loader.load(event.context.clone()),
            None => event.context.clone(),
        })
    }

    // ----- subscriptions -----

    /// Stores a subscription.
    ///
    /// # Errors
    ///
    /// `ConstraintError` if its medium or source does not exist.
    pub fn subscribe(&self, subscription: Subscription) -> EventResult<Subscription> {
        let mut tx = self.store.begin()?;
        tx.insert_subscription(subscription.clone())
            .map_err(missing_reference)?;
        tx.commit()?;
        debug!(subscription = %subscription, group = subscription.is_group(), "subscribed");
        Ok(subscription)
    }

    /// Deletes a subscription. Returns true if it existed.
    pub fn remove_subscription(&self, id: SubscriptionId) -> EventResult<bool> {
        let mut tx = self.store.begin()?;
        let removed = tx.delete_subscription(id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Records that `entity` never receives `source` via `medium`.
    ///
    /// # Errors
    ///
    /// `ConstraintError` if the medium or source does not exist.
    pub fn unsubscribe(
        &self,
        entity: impl Into<EntityId>,
        medium: MediumId,
        source: SourceId,
    ) -> EventResult<Unsubscription> {
        let unsubscription = Unsubscription::new(entity.into(), medium, source);
        let mut tx = self.store.begin()?;
        tx.insert_unsubscription(unsubscription.clone())
            .map_err(missing_reference)?;
        tx.commit()?;
        debug!(unsubscription = %unsubscription, "unsubscribed");
        Ok(unsubscription)
    }

    /// Removes every unsubscription for the triple. Returns how many rows went.
    pub fn resubscribe(
        &self,
        entity: impl Into<EntityId>,
        medium: MediumId,
        source: SourceId,
    ) -> EventResult<usize> {
        let entity = entity.into();
        let mut tx = self.store.begin()?;
        let removed = tx.delete_unsubscriptions(entity, medium, source)?;
        tx.commit()?;
        debug!(entity = %entity, medium = %medium, source = %source, removed, "resubscribed");
        Ok(removed)
    }

    /// True iff `entity` unsubscribed from `source` on `medium`.
    pub fn is_unsubscribed(
        &self,
        entity: impl Into<EntityId>,
        source: SourceId,
        medium: MediumId,
    ) -> EventResult<bool> {
        let entity = entity.into();
        self.read(|tx| tx.is_unsubscribed(entity, source, medium))
    }

    /// Which of `entities` are subscribed to `source` on `medium`.
    ///
    /// An entity counts when one of the medium's subscriptions for `source`
    /// covers it and it has not unsubscribed. Follow state is not consulted.
    ///
    /// # Errors
    ///
    /// `ConstraintError::HeterogeneousEntityKinds` unless all entities share
    /// one kind.
    pub fn is_subscribed_batch(
        &self,
        medium: &Medium,
        source: SourceId,
        entities: &[EntityId],
    ) -> EventResult<EntitySet> {
        let tx = self.store.begin()?;
        let index = SubscriptionIndex::load(&*tx, medium.id)?;
        let relevant: Vec<&Subscription> = index
            .subset_batch(self.graph.as_ref(), entities)?
            .into_iter()
            .filter(|s| s.source == source)
            .collect();

        let mut covered = EntitySet::new();
        for sub in &relevant {
            covered.extend(subscribed_entities(self.graph.as_ref(), sub)?);
        }
        let unsubscriptions = UnsubscriptionCache::load(&*tx, medium.id)?;
        let subscribed: EntitySet = entities
            .iter()
            .copied()
            .filter(|e| covered.contains(e) && !unsubscriptions.is_unsubscribed(*e, source))
            .collect();
        tx.commit()?;

        debug!(
            medium = %medium.name,
            entities = entities.len(),
            subscriptions = relevant.len(),
            subscribed = subscribed.len(),
            "checked batch subscription"
        );
        Ok(subscribed)
    }

    /// Entities followed by `entities` under `medium`'s follow policy.
    pub fn followed_by<I>(&self, medium: &Medium, entities: I) -> EventResult<EntitySet>
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        Ok(self.resolver(medium).followed_by(entities)?)
    }

    /// Entities following `entities` under `medium`'s follow policy.
    pub fn followers_of<I>(&self, medium: &Medium, entities: I) -> EventResult<EntitySet>
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        Ok(self.resolver(medium).followers_of(entities)?)
    }

    // ----- events -----

    /// Creates an event and its actor rows atomically.
    ///
    /// With `ignore_duplicates`, an already used uuid returns `Ok(None)` and
    /// writes nothing.
    ///
    /// # Errors
    ///
    /// - `ConstraintError::DuplicateUuid` for a used uuid without
    ///   `ignore_duplicates`.
    /// - `ConstraintError::UnknownSource` if the source does not exist.
    pub fn create_event(
        &self,
        request: NewEvent,
        ignore_duplicates: bool,
    ) -> EventResult<Option<Event>> {
        request.validate()?;
        let uuid = request.resolved_uuid();
        let mut tx = self.store.begin()?;

        if tx.get_source(request.source)?.is_none() {
            return Err(ConstraintError::UnknownSource { id: request.source }.into());
        }
        if tx.find_event_by_uuid(&uuid)?.is_some() {
            if ignore_duplicates {
                warn!(uuid = %uuid, source = %request.source, "ignoring duplicate event");
                return Ok(None);
            }
            return Err(ConstraintError::DuplicateUuid { uuid }.into());
        }

        let event = Event {
            id: EventId::new(),
            source: request.source,
            context: request.context,
            time: self.clock.now(),
            time_expires: request.time_expires,
            uuid,
        };
        let actors: Vec<EventActor> = request
            .actors
            .iter()
            .map(|&entity| EventActor {
                event: event.id,
                entity,
            })
            .collect();
        let actor_count = actors.len();
        tx.insert_event(event.clone(), actors)
            .map_err(missing_reference)?;
        tx.commit()?;

        debug!(event = %event.id, source = %event.source, actors = actor_count, "created event");
        Ok(Some(event))
    }

    /// Looks up an event by id.
    pub fn event(&self, id: EventId) -> EventResult<Option<Event>> {
        self.read(|tx| tx.get_event(id))
    }

    /// Actor entity ids of an event.
    pub fn event_actors(&self, id: EventId) -> EventResult<Vec<EntityId>> {
        let mut actors = self.read(|tx| tx.actors_for(&[id]))?;
        Ok(actors.remove(&id).unwrap_or_default())
    }

    /// Seen records of an event across all mediums.
    pub fn seen_records(&self, id: EventId) -> EventResult<Vec<EventSeen>> {
        self.read(|tx| tx.seen_records(id))
    }

    /// `"{source} event at {time}"` with the source's display name.
    ///
    /// # Errors
    ///
    /// `ConstraintError::UnknownSource` if the source no longer exists.
    pub fn describe_event(&self, event: &Event) -> EventResult<String> {
        let source = self
            .read(|tx| tx.get_source(event.source))?
            .ok_or(ConstraintError::UnknownSource { id: event.source })?;
        Ok(format!(
            "{} event at {}",
            source.display_name,
            event.time.format(DISPLAY_TIME_FORMAT)
        ))
    }

    /// `"{entity} to {source} by {medium}"` with display names.
    ///
    /// Entities unknown to the graph are printed by id.
    pub fn describe_subscription(&self, sub: &Subscription) -> EventResult<String> {
        let (entity, source, medium) = self.display_names(sub.entity, sub.source, sub.medium)?;
        Ok(format!("{entity} to {source} by {medium}"))
    }

    /// `"{entity} from {source} by {medium}"` with display names.
    pub fn describe_unsubscription(&self, unsub: &Unsubscription) -> EventResult<String> {
        let (entity, source, medium) =
            self.display_names(unsub.entity, unsub.source, unsub.medium)?;
        Ok(format!("{entity} from {source} by {medium}"))
    }

    fn display_names(
        &self,
        entity: EntityId,
        source: SourceId,
        medium: MediumId,
    ) -> EventResult<(String, String, String)> {
        let (found_source, found_medium) =
            self.read(|tx| Ok((tx.get_source(source)?, tx.get_medium(medium)?)))?;
        let source = found_source.ok_or(ConstraintError::UnknownSource { id: source })?;
        let medium = found_medium.ok_or(ConstraintError::UnknownMedium { id: medium })?;
        let entity = self
            .graph
            .entity(entity)?
            .map_or_else(|| entity.to_string(), |e| e.display_name);
        Ok((entity, source.display_name, medium.display_name))
    }

    /// Events passing the query's event-level filters, with no subscription
    /// routing.
    pub fn filtered_events(&self, medium: &Medium, query: &EventQuery) -> EventResult<Vec<Event>> {
        let tx = self.store.begin()?;
        let now = self.clock.now();
        let candidates = tx.filtered_events(&query.filter(medium.id, now))?;
        let ids: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
        let marked = self.finish(tx, medium, query, now, &ids, &ids)?;
        debug!(medium = %medium.name, events = candidates.len(), marked, "filtered events");
        Ok(candidates)
    }

    /// Marks events as seen on `medium`. Already marked events are skipped.
    /// Returns the number of records created.
    ///
    /// # Errors
    ///
    /// Fails without marking anything if an event does not exist, or with
    /// `ConstraintError::UnknownMedium`.
    pub fn mark_seen(&self, medium: &Medium, events: &[EventId]) -> EventResult<usize> {
        let mut tx = self.store.begin()?;
        let marked = tx
            .mark_seen(medium.id, events, self.clock.now())
            .map_err(missing_reference)?;
        tx.commit()?;
        debug!(medium = %medium.name, requested = events.len(), marked, "marked events seen");
        Ok(marked)
    }

    /// Applies the mark-seen side effect, if requested, and commits.
    fn finish(
        &self,
        mut tx: Box<dyn Transaction + '_>,
        medium: &Medium,
        query: &EventQuery,
        now: DateTime<Utc>,
        filtered: &[EventId],
        returned: &[EventId],
    ) -> EventResult<usize> {
        let mut marked = 0;
        if query.mark_seen {
            let ids = match self.config.mark_seen_scope {
                MarkSeenScope::Filtered => filtered,
                MarkSeenScope::Returned => returned,
            };
            if !ids.is_empty() {
                marked = tx.mark_seen(medium.id, ids, now).map_err(missing_reference)?;
            }
        }
        tx.commit()?;
        Ok(marked)
    }

    /// Keeps the candidates matching `predicate`.
    fn route(
        tx: &dyn Transaction,
        predicate: &SubscriptionPredicate,
        candidates: &[Event],
    ) -> Result<Vec<Event>, StorageError> {
        if predicate.is_empty() {
            return Ok(Vec::new());
        }
        let actors = if predicate.needs_actors() {
            let ids: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
            tx.actors_for(&ids)?
        } else {
            HashMap::new()
        };
        Ok(candidates
            .iter()
            .filter(|e| {
                let event_actors = actors.get(&e.id).map_or(&[][..], Vec::as_slice);
                predicate.matches(e, event_actors)
            })
            .cloned()
            .collect())
    }

    /// Events delivered through `medium`, whoever they are for.
    ///
    /// An event passes when one of the medium's subscriptions lets it
    /// through: any event of the subscription's source, or for
    /// `only_following` subscriptions, one with an actor followed by the
    /// subscribed entities. A medium without subscriptions yields nothing.
    pub fn events(&self, medium: &Medium, query: &EventQuery) -> EventResult<Vec<Event>> {
        let tx = self.store.begin()?;
        let now = self.clock.now();
        let candidates = tx.filtered_events(&query.filter(medium.id, now))?;
        let index = SubscriptionIndex::load(&*tx, medium.id)?;
        let follow = self.resolver(medium);

        let mut predicate = SubscriptionPredicate::new();
        for sub in index.subscriptions() {
            let clause = if sub.only_following {
                let subscribed = subscribed_entities(self.graph.as_ref(), sub)?;
                SubscriptionClause::FollowedActor {
                    source: sub.source,
                    followed: follow.followed_by(subscribed)?,
                }
            } else {
                SubscriptionClause::Source(sub.source)
            };
            predicate.push(clause);
        }

        let routed = Self::route(&*tx, &predicate, &candidates)?;
        let filtered: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
        let returned: Vec<EventId> = routed.iter().map(|e| e.id).collect();
        let marked = self.finish(tx, medium, query, now, &filtered, &returned)?;

        debug!(
            medium = %medium.name,
            follow = follow.policy_name(),
            candidates = candidates.len(),
            subscriptions = index.subscriptions().len(),
            events = routed.len(),
            marked,
            "routed medium events"
        );
        Ok(routed)
    }

    /// Events delivered to one entity through `medium`.
    ///
    /// Only subscriptions the entity is part of count, and events from
    /// sources the entity unsubscribed from are dropped.
    pub fn entity_events(
        &self,
        medium: &Medium,
        entity: impl Into<EntityId>,
        query: &EventQuery,
    ) -> EventResult<Vec<Event>> {
        let entity = entity.into();
        let tx = self.store.begin()?;
        let now = self.clock.now();
        let candidates = tx.filtered_events(&query.filter(medium.id, now))?;
        let index = SubscriptionIndex::load(&*tx, medium.id)?;
        let subset = index.subset(self.graph.as_ref(), entity)?;

        let followed = if subset.iter().any(|s| s.only_following) {
            self.resolver(medium).followed_by([entity])?
        } else {
            EntitySet::new()
        };
        let predicate: SubscriptionPredicate = subset
            .iter()
            .map(|sub| {
                if sub.only_following {
                    SubscriptionClause::FollowedActor {
                        source: sub.source,
                        followed: followed.clone(),
                    }
                } else {
                    SubscriptionClause::Source(sub.source)
                }
            })
            .collect();

        let unsubscriptions = UnsubscriptionCache::load(&*tx, medium.id)?;
        let routed: Vec<Event> = Self::route(&*tx, &predicate, &candidates)?
            .into_iter()
            .filter(|e| !unsubscriptions.is_unsubscribed(entity, e.source))
            .collect();
        let filtered: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
        let returned: Vec<EventId> = routed.iter().map(|e| e.id).collect();
        let marked = self.finish(tx, medium, query, now, &filtered, &returned)?;

        debug!(
            medium = %medium.name,
            entity = %entity,
            candidates = candidates.len(),
            subscriptions = subset.len(),
            events = routed.len(),
            marked,
            "routed entity events"
        );
        Ok(routed)
    }

    /// Every routed event with the entities it should reach.
    ///
    /// For each subscription of the event's source the targets are its
    /// subscribed entities, narrowed for `only_following` subscriptions to
    /// followers of the event's actors. Targets are concatenated across
    /// subscriptions, unsubscribed entities removed, then narrowed to
    /// `entity_kind` if given. Events left without targets are dropped.
    pub fn event_targets(
        &self,
        medium: &Medium,
        entity_kind: Option<&EntityKind>,
        query: &EventQuery,
    ) -> EventResult<Vec<EventTargets>> {
        let tx = self.store.begin()?;
        let now = self.clock.now();
        let candidates = tx.filtered_events(&query.filter(medium.id, now))?;
        let index = SubscriptionIndex::load(&*tx, medium.id)?;
        let unsubscriptions = UnsubscriptionCache::load(&*tx, medium.id)?;
        let follow = self.resolver(medium);

        let following: Vec<EventId> = candidates
            .iter()
            .filter(|e| index.for_source(e.source).any(|s| s.only_following))
            .map(|e| e.id)
            .collect();
        let actors = if following.is_empty() {
            HashMap::new()
        } else {
            tx.actors_for(&following)?
        };

        let mut subscribed: HashMap<SubscriptionId, EntitySet> = HashMap::new();
        let mut resolved: HashMap<EntityId, Option<Entity>> = HashMap::new();
        let mut routed = Vec::new();

        for event in &candidates {
            let mut followers: Option<EntitySet> = None;
            let mut targets: Vec<EntityId> = Vec::new();

            for sub in index.for_source(event.source) {
                if !subscribed.contains_key(&sub.id) {
                    subscribed.insert(sub.id, subscribed_entities(self.graph.as_ref(), sub)?);
                }
                let Some(entities) = subscribed.get(&sub.id) else {
                    continue;
                };
                if !sub.only_following {
                    targets.extend(entities.iter().copied());
                    continue;
                }
                if followers.is_none() {
                    let event_actors = actors.get(&event.id).map_or(&[][..], Vec::as_slice);
                    followers = Some(follow.followers_of(event_actors.iter().copied())?);
                }
                if let Some(followers) = &followers {
                    targets.extend(entities.intersection(followers).copied());
                }
            }
            if targets.is_empty() {
                continue;
            }

            let mut targets = unsubscriptions.filter_targets(event.source, targets);
            if self.config.dedupe_targets {
                let mut seen = HashSet::new();
                targets.retain(|t| seen.insert(*t));
            }

            let mut entities = Vec::with_capacity(targets.len());
            for id in targets {
                let entity = match resolved.get(&id) {
                    Some(entity) => entity.clone(),
                    None => {
                        let entity = self.graph.entity(id)?;
                        if entity.is_none() {
                            warn!(entity = %id, event = %event.id, "skipping target unknown to the entity graph");
                        }
                        resolved.insert(id, entity.clone());
                        entity
                    }
                };
                if let Some(entity) = entity {
                    if entity_kind.map_or(true, |kind| entity.is_kind(kind)) {
                        entities.push(entity);
                    }
                }
            }

            if !entities.is_empty() {
                routed.push(EventTargets {
                    event: event.clone(),
                    targets: entities,
                });
            }
        }

        let filtered: Vec<EventId> = candidates.iter().map(|e| e.id).collect();
        let returned: Vec<EventId> = routed.iter().map(|t| t.event.id).collect();
        let marked = self.finish(tx, medium, query, now, &filtered, &returned)?;

        debug!(
            medium = %medium.name,
            follow = follow.policy_name(),
            candidates = candidates.len(),
            subscriptions = index.subscriptions().len(),
            events = routed.len(),
            marked,
            "routed event targets"
        );
        Ok(routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InMemoryEntityGraph;
    use crate::router::follow::ReverseHierarchyFollowPolicy;
    use crate::storage::InMemoryStore;
    use crate::time::ManualClock;
    use chrono::Duration;
    use serde_json::json;

    struct Harness {
        router: EventRouter,
        graph: Arc<InMemoryEntityGraph>,
        clock: Arc<ManualClock>,
        group: SourceGroup,
    }

    fn harness_with(configure: impl FnOnce(EventRouterBuilder) -> EventRouterBuilder) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let graph = Arc::new(InMemoryEntityGraph::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut loaders = ContextLoaderRegistry::new();
        loaders
            .register("tests.loaders.stamp", |mut ctx: Context| {
                ctx.insert("stamped".to_string(), json!(true));
                ctx
            })
            .unwrap();
        let builder = EventRouter::builder(store, graph.clone())
            .clock(clock.clone())
            .context_loaders(loaders);
        let router = configure(builder).build();
        let group = router
            .create_source_group(SourceGroup::new("social", "Social", ""))
            .unwrap();
        Harness {
            router,
            graph,
            clock,
            group,
        }
    }

    fn harness() -> Harness {
        harness_with(|b| b)
    }

    impl Harness {
        fn medium(&self, name: &str) -> Medium {
            self.router.create_medium(Medium::new(name, name, "")).unwrap()
        }

        fn source(&self, name: &str) -> Source {
            self.router
                .create_source(Source::new(name, name, "", self.group.id))
                .unwrap()
        }

        fn entity(&self, name: &str, kind: &str) -> Entity {
            let entity = Entity::new(name, EntityKind::new(kind));
            self.graph.insert(entity.clone()).unwrap();
            entity
        }

        fn emit(&self, source: &Source, actors: &[&Entity]) -> Event {
            self.router
                .create_event(
                    NewEvent::new(source.id, Context::new()).actors(actors.iter().copied()),
                    false,
                )
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn test_describe_resolves_display_names() {
        let h = harness();
        let email = h.router.create_medium(Medium::new("email", "Email", "")).unwrap();
        let comment = h
            .router
            .create_source(Source::new("comment", "Comments", "", h.group.id))
            .unwrap();
        let alice = h.entity("Alice", "user");
        let event = h.emit(&comment, &[]);

        assert_eq!(
            h.router.describe_event(&event).unwrap(),
            format!("Comments event at {}", event.time.format("%Y-%m-%d::%H:%M:%S"))
        );
        let sub = h
            .router
            .subscribe(Subscription::individual(email.id, comment.id, alice.id))
            .unwrap();
        assert_eq!(
            h.router.describe_subscription(&sub).unwrap(),
            "Alice to Comments by Email"
        );
        let unsub = h.router.unsubscribe(&alice, email.id, comment.id).unwrap();
        assert_eq!(
            h.router.describe_unsubscription(&unsub).unwrap(),
            "Alice from Comments by Email"
        );

        let stranger = EntityId::new();
        let sub = Subscription::individual(email.id, comment.id, stranger);
        assert_eq!(
            h.router.describe_subscription(&sub).unwrap(),
            format!("{stranger} to Comments by Email")
        );

        let orphan = Event {
            source: SourceId::new(),
            ..event
        };
        assert!(matches!(
            h.router.describe_event(&orphan).unwrap_err(),
            EventError::Constraint(ConstraintError::UnknownSource { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let h = harness();
        h.medium("email");
        let err = h.router.create_medium(Medium::new("email", "E", "")).unwrap_err();
        assert!(matches!(
            err,
            EventError::Constraint(ConstraintError::DuplicateName { table: "medium", .. })
        ));
        let err = h
            .router
            .create_source_group(SourceGroup::new("social", "Again", ""))
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn test_create_source_requires_registered_loader() {
        let h = harness();
        let err = h
            .router
            .create_source(
                Source::new("comment", "Comments", "", h.group.id)
                    .with_context_loader("tests.loaders.missing"),
            )
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(h.router.source_by_name("comment").unwrap().is_none());

        let err = h
            .router
            .create_source(
                Source::new("comment", "Comments", "", h.group.id).with_context_loader("not a path"),
            )
            .unwrap_err();
        assert!(err.is_configuration());

        let err = h
            .router
            .create_source(Source::new("comment", "Comments", "", SourceGroupId::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Constraint(ConstraintError::UnknownSourceGroup { .. })
        ));
    }

    #[test]
    fn test_event_context_applies_loader_lazily() {
        let h = harness();
        let plain = h.source("plain");
        let stamped = h
            .router
            .create_source(
                Source::new("stamped", "Stamped", "", h.group.id)
                    .with_context_loader("tests.loaders.stamp"),
            )
            .unwrap();

        let mut context = Context::new();
        context.insert("n".to_string(), json!(1));
        let event = h
            .router
            .create_event(NewEvent::new(stamped.id, context.clone()), false)
            .unwrap()
            .unwrap();
        assert_eq!(event.context, context);
        let loaded = h.router.event_context(&event).unwrap();
        assert_eq!(loaded.get("stamped"), Some(&json!(true)));
        assert_eq!(loaded.get("n"), Some(&json!(1)));

        let event = h
            .router
            .create_event(NewEvent::new(plain.id, context.clone()), false)
            .unwrap()
            .unwrap();
        assert_eq!(h.router.event_context(&event).unwrap(), context);
    }

    #[test]
    fn test_update_source_revalidates_loader() {
        let h = harness();
        let source = h.source("comment");
        let err = h
            .router
            .update_source(&source.clone().with_context_loader("tests.loaders.missing"))
            .unwrap_err();
        assert!(err.is_configuration());

        let mut renamed = source.clone().with_context_loader("tests.loaders.stamp");
        renamed.name = "ignored".to_string();
        renamed.display_name = "Fresh comments".to_string();
        let updated = h.router.update_source(&renamed).unwrap();
        assert_eq!(updated.name, "comment");
        assert_eq!(updated.display_name, "Fresh comments");
        assert_eq!(updated.context_loader.as_deref(), Some("tests.loaders.stamp"));
    }

    #[test]
    fn test_update_medium_changes_descriptive_fields_only() {
        let h = harness();
        let medium = h.medium("email");
        let mut changed = medium.clone();
        changed.display_name = "E-mail".to_string();
        changed.description = "Digest".to_string();
        let updated = h.router.update_medium(&changed).unwrap();
        assert_eq!(updated.display_name, "E-mail");
        assert_eq!(h.router.medium(medium.id).unwrap(), Some(updated));

        let err = h.router.update_medium(&Medium::new("x", "X", "")).unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn test_create_event_duplicates() {
        let h = harness();
        let source = h.source("comment");
        let request = NewEvent::new(source.id, Context::new()).uuid("k1");

        assert!(h.router.create_event(request.clone(), true).unwrap().is_some());
        assert!(h.router.create_event(request.clone(), true).unwrap().is_none());
        let err = h.router.create_event(request, false).unwrap_err();
        assert!(matches!(
            err,
            EventError::Constraint(ConstraintError::DuplicateUuid { .. })
        ));

        let err = h
            .router
            .create_event(NewEvent::new(SourceId::new(), Context::new()), false)
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Constraint(ConstraintError::UnknownSource { .. })
        ));
    }

    #[test]
    fn test_create_event_stamps_clock_and_actors() {
        let h = harness();
        let source = h.source("comment");
        let alice = h.entity("alice", "user");
        let event = h.emit(&source, &[&alice]);
        assert_eq!(event.time, h.clock.now());
        assert_eq!(h.router.event_actors(event.id).unwrap(), vec![alice.id]);
    }

    #[test]
    fn test_no_subscriptions_means_no_events() {
        let h = harness();
        let medium = h.medium("email");
        let source = h.source("comment");
        h.emit(&source, &[]);
        assert!(h.router.events(&medium, &EventQuery::new()).unwrap().is_empty());
        assert_eq!(h.router.filtered_events(&medium, &EventQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_seen_scope_returned_only_marks_routed_events() {
        let h = harness_with(|b| {
            b.config(RouterConfig {
                mark_seen_scope: MarkSeenScope::Returned,
                ..RouterConfig::default()
            })
        });
        let medium = h.medium("email");
        let routed = h.source("comment");
        let unrouted = h.source("like");
        let alice = h.entity("alice", "user");
        h.router
            .subscribe(Subscription::individual(medium.id, routed.id, alice.id).only_following(false))
            .unwrap();
        h.emit(&routed, &[]);
        let ignored = h.emit(&unrouted, &[]);

        let query = EventQuery::new().unseen().mark_seen();
        assert_eq!(h.router.events(&medium, &query).unwrap().len(), 1);
        let unseen = h
            .router
            .filtered_events(&medium, &EventQuery::new().unseen())
            .unwrap();
        assert_eq!(unseen.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ignored.id]);
    }

    #[test]
    fn test_mark_seen_scope_filtered_marks_every_candidate() {
        let h = harness();
        let medium = h.medium("email");
        let source = h.source("comment");
        h.emit(&source, &[]);
        let query = EventQuery::new().unseen().mark_seen();
        assert!(h.router.events(&medium, &query).unwrap().is_empty());
        assert!(h
            .router
            .filtered_events(&medium, &EventQuery::new().unseen())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dedupe_targets() {
        let run = |dedupe: bool| {
            let h = harness_with(|b| {
                b.config(RouterConfig {
                    dedupe_targets: dedupe,
                    ..RouterConfig::default()
                })
            });
            let medium = h.medium("email");
            let source = h.source("comment");
            let alice = h.entity("alice", "user");
            for _ in 0..2 {
                h.router
                    .subscribe(
                        Subscription::individual(medium.id, source.id, alice.id).only_following(false),
                    )
                    .unwrap();
            }
            h.emit(&source, &[]);
            let targets = h.router.event_targets(&medium, None, &EventQuery::new()).unwrap();
            targets[0].targets.len()
        };
        assert_eq!(run(false), 2);
        assert_eq!(run(true), 1);
    }

    #[test]
    fn test_unknown_targets_are_skipped() {
        let h = harness();
        let medium = h.medium("email");
        let source = h.source("comment");
        let ghost = EntityId::new();
        h.router
            .subscribe(Subscription::individual(medium.id, source.id, ghost).only_following(false))
            .unwrap();
        h.emit(&source, &[]);
        assert!(h
            .router
            .event_targets(&medium, None, &EventQuery::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_follow_policy_override_per_medium() {
        let h = harness_with(|b| b.follow_policy("digest", ReverseHierarchyFollowPolicy));
        let email = h.medium("email");
        let digest = h.medium("digest");
        let team = h.entity("team", "team");
        let alice = h.entity("alice", "user");
        h.graph.relate(team.id, alice.id).unwrap();

        assert!(h.router.followed_by(&email, [&alice]).unwrap().contains(&team.id));
        assert!(!h.router.followed_by(&digest, [&alice]).unwrap().contains(&team.id));
        assert!(h.router.followers_of(&digest, [&alice]).unwrap().contains(&team.id));
    }

    #[test]
    fn test_is_subscribed_batch() {
        let h = harness();
        let medium = h.medium("email");
        let source = h.source("comment");
        let team = h.entity("team", "team");
        let alice = h.entity("alice", "user");
        let bob = h.entity("bob", "user");
        let carol = h.entity("carol", "user");
        let bot = h.entity("bot", "service");
        for e in [&alice, &bob, &bot] {
            h.graph.relate(team.id, e.id).unwrap();
        }
        h.router
            .subscribe(Subscription::group(medium.id, source.id, team.id, EntityKind::new("user")))
            .unwrap();
        h.router.unsubscribe(&bob, medium.id, source.id).unwrap();

        let subscribed = h
            .router
            .is_subscribed_batch(&medium, source.id, &[alice.id, bob.id, carol.id])
            .unwrap();
        assert_eq!(subscribed, EntitySet::from([alice.id]));

        let err = h
            .router
            .is_subscribed_batch(&medium, source.id, &[alice.id, bot.id])
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Constraint(ConstraintError::HeterogeneousEntityKinds { .. })
        ));
    }

    #[test]
    fn test_resubscribe_removes_every_row() {
        let h = harness();
        let medium = h.medium("email");
        let source = h.source("comment");
        let alice = h.entity("alice", "user");
        h.router.unsubscribe(&alice, medium.id, source.id).unwrap();
        h.router.unsubscribe(&alice, medium.id, source.id).unwrap();
        assert!(h.router.is_unsubscribed(&alice, source.id, medium.id).unwrap());
        assert_eq!(h.router.resubscribe(&alice, medium.id, source.id).unwrap(), 2);
        assert!(!h.router.is_unsubscribed(&alice, source.id, medium.id).unwrap());
    }

    #[test]
    fn test_subscribe_unknown_medium() {
        let h = harness();
        let source = h.source("comment");
        let err = h
            .router
            .subscribe(Subscription::individual(MediumId::new(), source.id, EntityId::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Constraint(ConstraintError::UnknownMedium { .. })
        ));
    }

    #[test]
    fn test_expiry_uses_router_clock() {
        let h = harness();
        let medium = h.medium("email");
        let source = h.source("comment");
        h.router
            .subscribe(Subscription::individual(medium.id, source.id, EntityId::new()).only_following(false))
            .unwrap();
        h.router
            .create_event(
                NewEvent::new(source.id, Context::new()).expires_at(h.clock.now() + Duration::minutes(5)),
                false,
            )
            .unwrap();

        assert_eq!(h.router.events(&medium, &EventQuery::new()).unwrap().len(), 1);
        h.clock.advance(Duration::minutes(10));
        assert!(h.router.events(&medium, &EventQuery::new()).unwrap().is_empty());
        assert_eq!(
            h.router
                .events(&medium, &EventQuery::new().include_expired())
                .unwrap()
                .len(),
            1
        );
    }
}
