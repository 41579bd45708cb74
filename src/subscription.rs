//! Subscription and unsubscription records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind};
use crate::id::{MediumId, SourceId, SubscriptionId, UnsubscriptionId};

/// Routes a source's events, via a medium, to an entity or to a
/// kind-filtered group of its sub-entities.
///
/// - `sub_entity_kind = None`: individual subscription, the subscribed set
///   is `{entity}`.
/// - `sub_entity_kind = Some(kind)`: group subscription, the subscribed set
///   is every direct sub-entity of `entity` with that kind.
///
/// Duplicate rows are legal; each contributes independently.
///
/// # Examples
///
/// ```
/// use entity_event::{EntityId, EntityKind, MediumId, SourceId, Subscription};
///
/// let team = EntityId::new();
/// let sub = Subscription::group(MediumId::new(), SourceId::new(), team, EntityKind::new("user"))
///     .only_following(false);
/// assert!(sub.is_group());
/// assert!(!sub.only_following);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub medium: MediumId,
    pub source: SourceId,
    pub entity: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_entity_kind: Option<EntityKind>,
    /// When true, delivery also requires the recipient to follow one of the
    /// event's actors.
    #[serde(default = "default_only_following")]
    pub only_following: bool,
}

const fn default_only_following() -> bool {
    true
}

impl Subscription {
    /// Individual subscription for `entity`, following-only by default.
    #[must_use]
    pub fn individual(medium: MediumId, source: SourceId, entity: EntityId) -> Self {
        Self {
            id: SubscriptionId::new(),
            medium,
            source,
            entity,
            sub_entity_kind: None,
            only_following: default_only_following(),
        }
    }

    /// Group subscription for the `kind` sub-entities of `entity`.
    #[must_use]
    pub fn group(medium: MediumId, source: SourceId, entity: EntityId, kind: EntityKind) -> Self {
        Self {
            sub_entity_kind: Some(kind),
            ..Self::individual(medium, source, entity)
        }
    }

    /// Sets the `only_following` flag.
    #[must_use]
    pub const fn only_following(mut self, only_following: bool) -> Self {
        self.only_following = only_following;
        self
    }

    /// Returns true for a group subscription.
    #[must_use]
    pub const fn is_group(&self) -> bool {
        self.sub_entity_kind.is_some()
    }
}

/// Prints raw ids. `EventRouter::describe_subscription` resolves names.
impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {} by {}", self.entity, self.source, self.medium)
    }
}

/// Per-entity override: `entity` never receives `source` via `medium`,
/// whatever its subscriptions say.
///
/// Presence is binary; duplicate rows mean the same thing as one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscription {
    pub id: UnsubscriptionId,
    pub entity: EntityId,
    pub medium: MediumId,
    pub source: SourceId,
}

impl Unsubscription {
    /// Creates an unsubscription with a fresh id.
    #[must_use]
    pub fn new(entity: EntityId, medium: MediumId, source: SourceId) -> Self {
        Self {
            id: UnsubscriptionId::new(),
            entity,
            medium,
            source,
        }
    }

    /// Returns true if this row covers the given triple.
    #[must_use]
    pub fn matches(&self, entity: EntityId, source: SourceId, medium: MediumId) -> bool {
        self.entity == entity && self.source == source && self.medium == medium
    }
}

/// Prints raw ids. `EventRouter::describe_unsubscription` resolves names.
impl fmt::Display for Unsubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} by {}", self.entity, self.source, self.medium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_individual_defaults_to_only_following() {
        let sub = Subscription::individual(MediumId::new(), SourceId::new(), EntityId::new());
        assert!(sub.only_following);
        assert!(!sub.is_group());
    }

    #[test]
    fn test_only_following_defaults_when_deserializing() {
        let sub = Subscription::individual(MediumId::new(), SourceId::new(), EntityId::new());
        let mut json = serde_json::to_value(&sub).unwrap();
        json.as_object_mut().unwrap().remove("only_following");
        let back: Subscription = serde_json::from_value(json).unwrap();
        assert!(back.only_following);
        assert!(back.sub_entity_kind.is_none());
    }

    #[test]
    fn test_unsubscription_matches_exact_triple() {
        let (entity, medium, source) = (EntityId::new(), MediumId::new(), SourceId::new());
        let unsub = Unsubscription::new(entity, medium, source);
        assert!(unsub.matches(entity, source, medium));
        assert!(!unsub.matches(entity, SourceId::new(), medium));
        assert!(!unsub.matches(EntityId::new(), source, medium));
    }

    #[test]
    fn test_display_forms() {
        let sub = Subscription::individual(MediumId::new(), SourceId::new(), EntityId::new());
        assert!(sub.to_string().contains(" to "));
        let unsub = Unsubscription::new(EntityId::new(), MediumId::new(), SourceId::new());
        assert!(unsub.to_string().contains(" from "));
    }
}
