//! Events, their actors, and per-medium seen records.
//!
//! Events are immutable once created. Seen records accumulate monotonically
//! and are unique per `(event, medium)`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Context;
use crate::entity::EntityId;
use crate::error::{ValidationError, MAX_UUID_LENGTH};
use crate::id::{EventId, MediumId, SourceId};

/// Namespace for content-derived event keys.
const CONTENT_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_53d0_8c2e_4b7a_9e41_27c3_d5f8_0b19);

/// A routed domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: SourceId,
    #[serde(default)]
    pub context: Context,
    /// Creation time, stamped by the router's clock.
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_expires: Option<DateTime<Utc>>,
    /// Unique idempotency key.
    pub uuid: String,
}

impl Event {
    /// Returns true if the event has an expiry that passed before `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        crate::time::is_expired(self.time_expires, now)
    }
}

/// Timestamp layout used by the `Display` impls.
pub(crate) const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d::%H:%M:%S";

/// Prints the source id. `EventRouter::describe_event` prints its display name.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} event at {}",
            self.source,
            self.time.format(DISPLAY_TIME_FORMAT)
        )
    }
}

/// Join row: `entity` participated in (or originated) `event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventActor {
    pub event: EventId,
    pub entity: EntityId,
}

impl fmt::Display for EventActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event {} - {}", self.event, self.entity)
    }
}

/// Acknowledgement that `event` was delivered through `medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSeen {
    pub event: EventId,
    pub medium: MediumId,
    pub time_seen: DateTime<Utc>,
}

impl fmt::Display for EventSeen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Seen on {} at {}",
            self.medium,
            self.time_seen.format(DISPLAY_TIME_FORMAT)
        )
    }
}

/// Request to create an event.
///
/// Actors may be given as entities or raw ids. When no `uuid` is set a
/// random one is generated.
///
/// # Examples
///
/// ```
/// use entity_event::{Entity, EntityKind, NewEvent, SourceId};
/// use entity_event::context::Context;
///
/// let author = Entity::new("alice", EntityKind::new("user"));
/// let request = NewEvent::new(SourceId::new(), Context::new())
///     .actor(&author)
///     .uuid("comment-42");
/// assert_eq!(request.actors, vec![author.id]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub source: SourceId,
    pub context: Context,
    pub actors: Vec<EntityId>,
    pub time_expires: Option<DateTime<Utc>>,
    pub uuid: Option<String>,
}

impl NewEvent {
    /// Starts a request for an event of `source`.
    #[must_use]
    pub fn new(source: SourceId, context: Context) -> Self {
        Self {
            source,
            context,
            actors: Vec::new(),
            time_expires: None,
            uuid: None,
        }
    }

    /// Adds one actor.
    #[must_use]
    pub fn actor(mut self, actor: impl Into<EntityId>) -> Self {
        self.actors.push(actor.into());
        self
    }

    /// Adds several actors.
    #[must_use]
    pub fn actors<I, A>(mut self, actors: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<EntityId>,
    {
        self.actors.extend(actors.into_iter().map(Into::into));
        self
    }

    /// Sets the expiry time.
    #[must_use]
    pub const fn expires_at(mut self, time_expires: DateTime<Utc>) -> Self {
        self.time_expires = Some(time_expires);
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Derives the idempotency key from the source and the context payload,
    /// so identical payloads collapse under `ignore_duplicates`.
    #[must_use]
    pub fn with_content_key(mut self) -> Self {
        self.uuid = Some(content_key(self.source, &self.context));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        match &self.uuid {
            Some(uuid) => ValidationError::check_required("uuid", uuid, MAX_UUID_LENGTH),
            None => Ok(()),
        }
    }

    /// Returns the requested key, or a fresh random one.
    pub(crate) fn resolved_uuid(&self) -> String {
        self.uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// Stable key for an event's source and payload.
///
/// `serde_json::Map` iterates in key order, so the JSON encoding is
/// canonical for equal contexts.
#[must_use]
pub fn content_key(source: SourceId, context: &Context) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_uuid().as_bytes());
    let payload = serde_json::Value::Object(context.clone()).to_string();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    Uuid::new_v5(&CONTENT_KEY_NAMESPACE, digest.as_bytes()).to_string()
}
