//! Disjunction of per-subscription event predicates.

use crate::entity::{EntityId, EntitySet};
use crate::event::Event;
use crate::id::SourceId;

/// What one subscription lets through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionClause {
    /// Every event of the source.
    Source(SourceId),
    /// Events of the source with at least one actor in `followed`.
    FollowedActor {
        /// Source the subscription is for.
        source: SourceId,
        /// Entities followed by the subscribed entities.
        followed: EntitySet,
    },
}

impl SubscriptionClause {
    /// Returns true if an event of `source` with `actors` passes this clause.
    #[must_use]
    pub fn matches(&self, source: SourceId, actors: &[EntityId]) -> bool {
        match self {
            Self::Source(s) => *s == source,
            Self::FollowedActor {
                source: s,
                followed,
            } => *s == source && actors.iter().any(|a| followed.contains(a)),
        }
    }
}

/// OR of subscription clauses.
///
/// An empty predicate matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPredicate {
    clauses: Vec<SubscriptionClause>,
}

impl SubscriptionPredicate {
    /// Creates an empty predicate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a clause.
    pub fn push(&mut self, clause: SubscriptionClause) {
        self.clauses.push(clause);
    }

    /// Returns true if there are no clauses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Returns true if evaluating the predicate may need event actors.
    #[must_use]
    pub fn needs_actors(&self) -> bool {
        self.clauses
            .iter()
            .any(|c| matches!(c, SubscriptionClause::FollowedActor { .. }))
    }

    /// Returns true if `event` passes any clause.
    #[must_use]
    pub fn matches(&self, event: &Event, actors: &[EntityId]) -> bool {
        self.clauses.iter().any(|c| c.matches(event.source, actors))
    }
}

impl FromIterator<SubscriptionClause> for SubscriptionPredicate {
    fn from_iter<I: IntoIterator<Item = SubscriptionClause>>(iter: I) -> Self {
        Self {
            clauses: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::id::EventId;
    use chrono::Utc;

    fn event_of(source: SourceId) -> Event {
        Event {
            id: EventId::new(),
            source,
            context: Context::new(),
            time: Utc::now(),
            time_expires: None,
            uuid: EventId::new().to_string(),
        }
    }

    #[test]
    fn test_empty_predicate_matches_nothing() {
        let predicate = SubscriptionPredicate::new();
        assert!(predicate.is_empty());
        assert!(!predicate.matches(&event_of(SourceId::new()), &[]));
    }

    #[test]
    fn test_followed_actor_requires_source_and_actor() {
        let source = SourceId::new();
        let (friend, stranger) = (EntityId::new(), EntityId::new());
        let predicate: SubscriptionPredicate = [SubscriptionClause::FollowedActor {
            source,
            followed: EntitySet::from([friend]),
        }]
        .into_iter()
        .collect();
        assert!(predicate.needs_actors());

        let event = event_of(source);
        assert!(predicate.matches(&event, &[stranger, friend]));
        assert!(!predicate.matches(&event, &[stranger]));
        assert!(!predicate.matches(&event, &[]));
        assert!(!predicate.matches(&event_of(SourceId::new()), &[friend]));
    }

    #[test]
    fn test_clauses_are_or_ed() {
        let (a, b) = (SourceId::new(), SourceId::new());
        let mut predicate = SubscriptionPredicate::new();
        predicate.push(SubscriptionClause::Source(a));
        predicate.push(SubscriptionClause::FollowedActor {
            source: b,
            followed: EntitySet::new(),
        });
        assert!(predicate.matches(&event_of(a), &[]));
        assert!(!predicate.matches(&event_of(b), &[EntityId::new()]));
    }
}
