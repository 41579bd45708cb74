//! Follow policies.
//!
//! A policy answers two questions over the entity graph: which entities a
//! set of entities follows, and which entities follow them. The two answers
//! must be inverses of each other: `a` is in `followers_of({b})` iff `b` is
//! in `followed_by({a})`. A medium overriding one direction must override
//! both; nothing checks this at runtime.

use std::fmt;
use std::sync::Arc;

use crate::config::FollowDirection;
use crate::entity::{EntityId, EntitySet};
use crate::graph::EntityGraph;
use crate::storage::StorageError;

/// A matched pair of follow closures.
pub trait FollowPolicy: Send + Sync {
    /// Short name, used in logs.
    fn name(&self) -> &'static str;

    /// Entities followed by any of `entities`, always including `entities`.
    fn followed_by(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> Result<EntitySet, StorageError>;

    /// Entities following any of `entities`, always including `entities`.
    fn followers_of(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> Result<EntitySet, StorageError>;
}

fn with_self(entities: &[EntityId], mut related: EntitySet) -> EntitySet {
    related.extend(entities.iter().copied());
    related
}

/// Default policy: an entity follows itself and the groups it belongs to.
///
/// `followed_by(X) = X ∪ supers(X)`, `followers_of(X) = X ∪ subs(X)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchyFollowPolicy;

impl FollowPolicy for HierarchyFollowPolicy {
    fn name(&self) -> &'static str {
        "hierarchy"
    }

    fn followed_by(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> Result<EntitySet, StorageError> {
        Ok(with_self(entities, graph.super_entities_of(entities)?))
    }

    fn followers_of(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> Result<EntitySet, StorageError> {
        Ok(with_self(entities, graph.sub_entities_of(entities)?))
    }
}

/// Opposite policy: an entity follows itself and its own sub-entities.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseHierarchyFollowPolicy;

impl FollowPolicy for ReverseHierarchyFollowPolicy {
    fn name(&self) -> &'static str {
        "reverse_hierarchy"
    }

    fn followed_by(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> Result<EntitySet, StorageError> {
        Ok(with_self(entities, graph.sub_entities_of(entities)?))
    }

    fn followers_of(
        &self,
        graph: &dyn EntityGraph,
        entities: &[EntityId],
    ) -> Result<EntitySet, StorageError> {
        Ok(with_self(entities, graph.super_entities_of(entities)?))
    }
}

impl From<FollowDirection> for Arc<dyn FollowPolicy> {
    fn from(direction: FollowDirection) -> Self {
        match direction {
            FollowDirection::Hierarchy => Arc::new(HierarchyFollowPolicy),
            FollowDirection::ReverseHierarchy => Arc::new(ReverseHierarchyFollowPolicy),
        }
    }
}

/// A policy bound to a graph.
///
/// Accepts a single entity or any collection of entities or ids.
#[derive(Clone, Copy)]
pub struct FollowResolver<'a> {
    graph: &'a dyn EntityGraph,
    policy: &'a dyn FollowPolicy,
}

impl<'a> FollowResolver<'a> {
    /// Binds `policy` to `graph`.
    #[must_use]
    pub fn new(graph: &'a dyn EntityGraph, policy: &'a dyn FollowPolicy) -> Self {
        Self { graph, policy }
    }

    /// Name of the bound policy.
    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// See [`FollowPolicy::followed_by`].
    pub fn followed_by<I>(&self, entities: I) -> Result<EntitySet, StorageError>
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let ids: Vec<EntityId> = entities.into_iter().map(Into::into).collect();
        self.policy.followed_by(self.graph, &ids)
    }

    /// See [`FollowPolicy::followers_of`].
    pub fn followers_of<I>(&self, entities: I) -> Result<EntitySet, StorageError>
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        let ids: Vec<EntityId> = entities.into_iter().map(Into::into).collect();
        self.policy.followers_of(self.graph, &ids)
    }
}

impl fmt::Debug for FollowResolver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowResolver")
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKind};
    use crate::graph::InMemoryEntityGraph;

    /// org -> team -> alice
    fn hierarchy() -> (InMemoryEntityGraph, Entity, Entity, Entity) {
        let graph = InMemoryEntityGraph::new();
        let org = Entity::new("org", EntityKind::new("org"));
        let team = Entity::new("team", EntityKind::new("team"));
        let alice = Entity::new("alice", EntityKind::new("user"));
        for e in [&org, &team, &alice] {
            graph.insert(e.clone()).unwrap();
        }
        graph.relate(org.id, team.id).unwrap();
        graph.relate(team.id, alice.id).unwrap();
        (graph, org, team, alice)
    }

    #[test]
    fn test_default_followed_by_is_self_and_direct_supers() {
        let (graph, org, team, alice) = hierarchy();
        let resolver = FollowResolver::new(&graph, &HierarchyFollowPolicy);
        let followed = resolver.followed_by([&alice]).unwrap();
        assert_eq!(followed, [alice.id, team.id].into_iter().collect());
        assert!(!followed.contains(&org.id));
    }

    #[test]
    fn test_default_followers_of_is_self_and_direct_subs() {
        let (graph, org, team, alice) = hierarchy();
        let resolver = FollowResolver::new(&graph, &HierarchyFollowPolicy);
        let followers = resolver.followers_of([org.id]).unwrap();
        assert_eq!(followers, [org.id, team.id].into_iter().collect());
        assert!(!followers.contains(&alice.id));
    }

    #[test]
    fn test_reverse_policy_swaps_directions() {
        let (graph, _org, team, alice) = hierarchy();
        let resolver = FollowResolver::new(&graph, &ReverseHierarchyFollowPolicy);
        assert_eq!(
            resolver.followed_by([team.id]).unwrap(),
            [team.id, alice.id].into_iter().collect()
        );
        assert!(resolver.followers_of([alice.id]).unwrap().contains(&team.id));
        assert_eq!(resolver.policy_name(), "reverse_hierarchy");
    }

    #[test]
    fn test_unknown_entities_follow_themselves() {
        let graph = InMemoryEntityGraph::new();
        let stranger = EntityId::new();
        let resolver = FollowResolver::new(&graph, &HierarchyFollowPolicy);
        assert_eq!(
            resolver.followed_by(Some(stranger)).unwrap(),
            [stranger].into_iter().collect()
        );
        assert!(resolver.followers_of(Vec::<EntityId>::new()).unwrap().is_empty());
    }

    #[test]
    fn test_direction_into_policy() {
        let policy: Arc<dyn FollowPolicy> = FollowDirection::ReverseHierarchy.into();
        assert_eq!(policy.name(), "reverse_hierarchy");
        let policy: Arc<dyn FollowPolicy> = FollowDirection::default().into();
        assert_eq!(policy.name(), "hierarchy");
    }
}
