//! # entity-event - Subscription-aware event routing
//!
//! entity-event decides which entities should receive which events. Events
//! come from *sources*, are delivered through *mediums*, and reach entities
//! through *subscriptions* that may target a single entity or a kind of
//! sub-entity of a group. Entities can opt out per source and medium, and
//! each medium keeps its own record of which events it has already seen.
//!
//! ## Core Concepts
//!
//! - **Medium**: a delivery channel (email, in-app feed)
//! - **Source**: the origin category of an event, grouped by **SourceGroup**
//! - **Subscription**: routes a source's events via a medium to an entity
//!   or to a kind of its sub-entities
//! - **Unsubscription**: a per-entity override that always wins
//! - **Event**: an immutable record with actors, an optional expiry and a
//!   unique idempotency key
//! - **EntityGraph**: the read-only super/sub entity hierarchy
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use entity_event::context::Context;
//! use entity_event::graph::InMemoryEntityGraph;
//! use entity_event::router::{EventQuery, EventRouter};
//! use entity_event::storage::InMemoryStore;
//! use entity_event::{Entity, EntityKind, Medium, NewEvent, Source, SourceGroup, Subscription};
//!
//! let graph = Arc::new(InMemoryEntityGraph::new());
//! let router = EventRouter::new(Arc::new(InMemoryStore::new()), graph.clone());
//!
//! let alice = Entity::new("alice", EntityKind::new("user"));
//! graph.insert(alice.clone())?;
//!
//! let group = router.create_source_group(SourceGroup::new("social", "Social", ""))?;
//! let email = router.create_medium(Medium::new("email", "Email", ""))?;
//! let comments = router.create_source(Source::new("comment", "Comments", "", group.id))?;
//! router.subscribe(
//!     Subscription::individual(email.id, comments.id, alice.id).only_following(false),
//! )?;
//!
//! router.create_event(NewEvent::new(comments.id, Context::new()), false)?;
//!
//! let pending = router.event_targets(&email, None, &EventQuery::new().unseen().mark_seen())?;
//! assert_eq!(pending[0].targets, vec![alice]);
//! # Ok::<(), entity_event::EventError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod context;
pub mod entity;
pub mod error;
pub mod event;
pub mod id;
pub mod medium;
pub mod source;
pub mod subscription;
pub mod time;

// Collaborators, storage and routing
pub mod config;
pub mod graph;
pub mod router;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use config::{FollowDirection, MarkSeenScope, RouterConfig};
pub use context::{Context, ContextLoader, ContextLoaderRegistry};
pub use entity::{Entity, EntityId, EntityKind, EntitySet};
pub use error::{
    ConfigurationError, ConstraintError, EventError, EventResult, ValidationError,
};
pub use event::{Event, EventActor, EventSeen, NewEvent};
pub use graph::{EntityGraph, InMemoryEntityGraph};
pub use id::{EventId, MediumId, SourceGroupId, SourceId, SubscriptionId, UnsubscriptionId};
pub use medium::Medium;
pub use router::{EventQuery, EventRouter, EventTargets, FollowPolicy};
pub use source::{Source, SourceGroup};
pub use storage::{InMemoryStore, RoutingStore, StorageError};
pub use subscription::{Subscription, Unsubscription};
pub use time::{Clock, ManualClock, SystemClock, TimeBounds};
