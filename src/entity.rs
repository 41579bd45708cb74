//! Entity identity and kinds.
//!
//! Entities are owned by an external hierarchy component. This crate only
//! needs their identity, their kind, and a readable name for display; the
//! super/sub relationships are consulted through [`crate::graph::EntityGraph`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, stable entity identifier.
///
/// # Examples
///
/// ```
/// use entity_event::EntityId;
///
/// let id = EntityId::new();
/// assert!(!id.is_nil());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates a new random entity ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entity ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if this is a nil (all zeros) UUID.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<&Entity> for EntityId {
    fn from(entity: &Entity) -> Self {
        entity.id
    }
}

impl From<Entity> for EntityId {
    fn from(entity: Entity) -> Self {
        entity.id
    }
}

/// Ordered set of entity ids.
///
/// Ordered so that target lists come out in a stable order across calls.
pub type EntitySet = BTreeSet<EntityId>;

/// Classification of an entity (for example `"user"` or `"team"`).
///
/// Group subscriptions select the sub-entities of one kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(String);

impl EntityKind {
    /// Creates a kind from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the kind name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An entity as seen by the router.
///
/// Equality and hashing are by `id` only.
///
/// # Examples
///
/// ```
/// use entity_event::{Entity, EntityKind};
///
/// let user = Entity::new("alice", EntityKind::new("user"));
/// assert_eq!(user.kind.as_str(), "user");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub display_name: String,
}

impl Entity {
    /// Creates an entity with a fresh id.
    #[must_use]
    pub fn new(display_name: impl Into<String>, kind: EntityKind) -> Self {
        Self::with_id(EntityId::new(), display_name, kind)
    }

    /// Creates an entity with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: EntityId, display_name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id,
            kind,
            display_name: display_name.into(),
        }
    }

    /// Returns true if the entity is of the given kind.
    #[must_use]
    pub fn is_kind(&self, kind: &EntityKind) -> bool {
        &self.kind == kind
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}
