//! Subscription lookup and expansion.

use crate::entity::{EntityId, EntitySet};
use crate::error::{ConstraintError, EventResult};
use crate::graph::EntityGraph;
use crate::id::{MediumId, SourceId};
use crate::storage::{StorageError, SubscriptionStore};
use crate::subscription::Subscription;

/// The subscriptions of one medium, loaded once per router call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionIndex {
    medium: MediumId,
    subscriptions: Vec<Subscription>,
}

impl SubscriptionIndex {
    /// Loads every subscription for `medium`.
    pub fn load<S>(store: &S, medium: MediumId) -> Result<Self, StorageError>
    where
        S: SubscriptionStore + ?Sized,
    {
        Ok(Self::from_subscriptions(
            medium,
            store.subscriptions_for_medium(medium)?,
        ))
    }

    /// Builds an index over already loaded rows. Rows of other mediums are dropped.
    #[must_use]
    pub fn from_subscriptions(medium: MediumId, subscriptions: Vec<Subscription>) -> Self {
        let subscriptions = subscriptions
            .into_iter()
            .filter(|s| s.medium == medium)
            .collect();
        Self {
            medium,
            subscriptions,
        }
    }

    /// The medium this index covers.
    #[must_use]
    pub const fn medium(&self) -> MediumId {
        self.medium
    }

    /// All subscriptions, in insertion order.
    #[must_use]
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Returns true if the medium has no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscriptions for one source.
    pub fn for_source(&self, source: SourceId) -> impl Iterator<Item = &Subscription> + '_ {
        self.subscriptions.iter().filter(move |s| s.source == source)
    }

    /// Subscriptions `entity` is part of.
    ///
    /// That is individual subscriptions for exactly `entity`, plus group
    /// subscriptions owned by one of its direct super-entities whose
    /// `sub_entity_kind` is the entity's kind. An entity the graph does not
    /// know only matches individual subscriptions.
    pub fn subset(
        &self,
        graph: &dyn EntityGraph,
        entity: EntityId,
    ) -> Result<Vec<&Subscription>, StorageError> {
        let kind = graph.kind_of(entity)?;
        let supers = match kind {
            Some(_) => graph.super_entities_of(&[entity])?,
            None => EntitySet::new(),
        };
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| match &s.sub_entity_kind {
                None => s.entity == entity,
                Some(sub_kind) => kind.as_ref() == Some(sub_kind) && supers.contains(&s.entity),
            })
            .collect())
    }

    /// Subscriptions any of `entities` is part of.
    ///
    /// # Errors
    ///
    /// `ConstraintError::HeterogeneousEntityKinds` if the entities do not
    /// all share one kind.
    pub fn subset_batch(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> EventResult<Vec<&Subscription>> {
        let Some((&first, rest)) = entities.split_first() else {
            return Ok(Vec::new());
        };
        let kind = graph.kind_of(first)?;
        for &entity in rest {
            let other = graph.kind_of(entity)?;
            if other != kind {
                return Err(
                    ConstraintError::heterogeneous(kind.as_ref(), other.as_ref(), entity).into(),
                );
            }
        }

        let supers = match kind {
            Some(_) => graph.super_entities_of(entities)?,
            None => EntitySet::new(),
        };
        let members: EntitySet = entities.iter().copied().collect();
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| match &s.sub_entity_kind {
                None => members.contains(&s.entity),
                Some(sub_kind) => kind.as_ref() == Some(sub_kind) && supers.contains(&s.entity),
            })
            .collect())
    }
}

/// Concrete entities a subscription covers.
///
/// `{entity}` for an individual subscription; the direct sub-entities of
/// `entity` with the subscription's kind for a group subscription.
pub fn subscribed_entities(
    graph: &dyn EntityGraph,
    subscription: &Subscription,
) -> Result<EntitySet, StorageError> {
    let Some(kind) = &subscription.sub_entity_kind else {
        return Ok(EntitySet::from([subscription.entity]));
    };
    let candidates: Vec<EntityId> = graph
        .sub_entities_of(&[subscription.entity])?
        .into_iter()
        .collect();
    Ok(graph
        .entities(&candidates)?
        .into_iter()
        .filter(|e| e.is_kind(kind))
        .map(|e| e.id)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKind};
    use crate::graph::InMemoryEntityGraph;

    struct World {
        graph: InMemoryEntityGraph,
        team: Entity,
        alice: Entity,
        bob: Entity,
        bot: Entity,
    }

    fn world() -> World {
        let graph = InMemoryEntityGraph::new();
        let team = Entity::new("team", EntityKind::new("team"));
        let alice = Entity::new("alice", EntityKind::new("user"));
        let bob = Entity::new("bob", EntityKind::new("user"));
        let bot = Entity::new("bot", EntityKind::new("service"));
        for e in [&team, &alice, &bob, &bot] {
            graph.insert(e.clone()).unwrap();
            if e.id != team.id {
                graph.relate(team.id, e.id).unwrap();
            }
        }
        World {
            graph,
            team,
            alice,
            bob,
            bot,
        }
    }

    #[test]
    fn test_subscribed_entities_individual_and_group() {
        let w = world();
        let (medium, source) = (MediumId::new(), SourceId::new());

        let individual = Subscription::individual(medium, source, w.alice.id);
        assert_eq!(
            subscribed_entities(&w.graph, &individual).unwrap(),
            EntitySet::from([w.alice.id])
        );

        let group = Subscription::group(medium, source, w.team.id, EntityKind::new("user"));
        assert_eq!(
            subscribed_entities(&w.graph, &group).unwrap(),
            EntitySet::from([w.alice.id, w.bob.id])
        );
    }

    #[test]
    fn test_subset_matches_individual_and_parent_group_of_same_kind() {
        let w = world();
        let (medium, source) = (MediumId::new(), SourceId::new());
        let mine = Subscription::individual(medium, source, w.alice.id);
        let users = Subscription::group(medium, source, w.team.id, EntityKind::new("user"));
        let services = Subscription::group(medium, source, w.team.id, EntityKind::new("service"));
        let bobs = Subscription::individual(medium, source, w.bob.id);
        let index = SubscriptionIndex::from_subscriptions(
            medium,
            vec![mine.clone(), users.clone(), services.clone(), bobs],
        );

        let subset = index.subset(&w.graph, w.alice.id).unwrap();
        assert_eq!(subset, vec![&mine, &users]);

        let subset = index.subset(&w.graph, w.bot.id).unwrap();
        assert_eq!(subset, vec![&services]);
    }

    #[test]
    fn test_group_subscription_does_not_reach_grandchildren() {
        let graph = InMemoryEntityGraph::new();
        let org = Entity::new("org", EntityKind::new("org"));
        let team = Entity::new("team", EntityKind::new("team"));
        let user = Entity::new("user", EntityKind::new("user"));
        for e in [&org, &team, &user] {
            graph.insert(e.clone()).unwrap();
        }
        graph.relate(org.id, team.id).unwrap();
        graph.relate(team.id, user.id).unwrap();

        let (medium, source) = (MediumId::new(), SourceId::new());
        let users = Subscription::group(medium, source, org.id, EntityKind::new("user"));
        assert!(subscribed_entities(&graph, &users).unwrap().is_empty());

        let index = SubscriptionIndex::from_subscriptions(medium, vec![users]);
        assert!(index.subset(&graph, user.id).unwrap().is_empty());
    }

    #[test]
    fn test_subset_for_unknown_entity_only_matches_individual() {
        let w = world();
        let (medium, source) = (MediumId::new(), SourceId::new());
        let stranger = EntityId::new();
        let direct = Subscription::individual(medium, source, stranger);
        let index = SubscriptionIndex::from_subscriptions(
            medium,
            vec![
                direct.clone(),
                Subscription::group(medium, source, w.team.id, EntityKind::new("user")),
            ],
        );
        assert_eq!(index.subset(&w.graph, stranger).unwrap(), vec![&direct]);
    }

    #[test]
    fn test_subset_batch_requires_one_kind() {
        let w = world();
        let (medium, source) = (MediumId::new(), SourceId::new());
        let users = Subscription::group(medium, source, w.team.id, EntityKind::new("user"));
        let index = SubscriptionIndex::from_subscriptions(medium, vec![users.clone()]);

        let subset = index
            .subset_batch(&w.graph, &[w.alice.id, w.bob.id])
            .unwrap();
        assert_eq!(subset, vec![&users]);

        let err = index
            .subset_batch(&w.graph, &[w.alice.id, w.bot.id])
            .unwrap_err();
        assert!(err.is_constraint());
        assert!(index.subset_batch(&w.graph, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_index_drops_foreign_rows_and_filters_by_source() {
        let medium = MediumId::new();
        let (s1, s2) = (SourceId::new(), SourceId::new());
        let e = EntityId::new();
        let index = SubscriptionIndex::from_subscriptions(
            medium,
            vec![
                Subscription::individual(medium, s1, e),
                Subscription::individual(MediumId::new(), s1, e),
                Subscription::individual(medium, s2, e),
            ],
        );
        assert_eq!(index.subscriptions().len(), 2);
        assert_eq!(index.for_source(s1).count(), 1);
        assert!(!index.is_empty());
    }
}
