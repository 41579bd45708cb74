//! Read-only view of the entity hierarchy.
//!
//! The hierarchy is owned by another component. The router only asks three
//! things of it: an entity's kind, and the direct super- and sub-entities of
//! a set of entities. Relationships are directed and many-to-many; acyclicity
//! is expected but not enforced.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::entity::{Entity, EntityId, EntityKind, EntitySet};
use crate::storage::StorageError;

/// Oracle over the super/sub entity relationship.
///
/// All relationship queries are single-hop: they return direct neighbours
/// only, never the transitive closure.
pub trait EntityGraph: Send + Sync {
    /// Look up an entity.
    fn entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Direct super-entities of any of `ids`.
    fn super_entities_of(&self, ids: &[EntityId]) -> Result<EntitySet, StorageError>;

    /// Direct sub-entities of any of `ids`.
    fn sub_entities_of(&self, ids: &[EntityId]) -> Result<EntitySet, StorageError>;

    /// Kind of an entity, or `None` if the graph does not know it.
    fn kind_of(&self, id: EntityId) -> Result<Option<EntityKind>, StorageError> {
        Ok(self.entity(id)?.map(|e| e.kind))
    }

    /// Look up several entities, preserving input order and skipping unknown ids.
    fn entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(entity) = self.entity(id)? {
                out.push(entity);
            }
        }
        Ok(out)
    }
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct GraphState {
    entities: HashMap<EntityId, Entity>,
    supers: HashMap<EntityId, HashSet<EntityId>>,
    subs: HashMap<EntityId, HashSet<EntityId>>,
}

/// Thread-safe in-memory entity hierarchy.
///
/// # Examples
///
/// ```
/// use entity_event::graph::{EntityGraph, InMemoryEntityGraph};
/// use entity_event::{Entity, EntityKind};
///
/// let graph = InMemoryEntityGraph::new();
/// let team = Entity::new("ops", EntityKind::new("team"));
/// let user = Entity::new("alice", EntityKind::new("user"));
/// graph.insert(team.clone()).unwrap();
/// graph.insert(user.clone()).unwrap();
/// graph.relate(team.id, user.id).unwrap();
///
/// assert!(graph.sub_entities_of(&[team.id]).unwrap().contains(&user.id));
/// assert!(graph.super_entities_of(&[user.id]).unwrap().contains(&team.id));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEntityGraph {
    state: RwLock<GraphState>,
}

impl InMemoryEntityGraph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity.
    pub fn insert(&self, entity: Entity) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph.insert"))?;
        state.entities.insert(entity.id, entity);
        Ok(())
    }

    /// Record that `sub_entity` belongs to `super_entity`.
    ///
    /// Idempotent. Self-relations are rejected.
    pub fn relate(&self, super_entity: EntityId, sub_entity: EntityId) -> Result<(), StorageError> {
        if super_entity == sub_entity {
            return Err(StorageError::BackendError(format!(
                "entity {super_entity} cannot be its own super-entity"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err("graph.relate"))?;
        state.supers.entry(sub_entity).or_default().insert(super_entity);
        state.subs.entry(super_entity).or_default().insert(sub_entity);
        Ok(())
    }

    /// Remove a relationship. Returns true if it existed.
    pub fn unrelate(&self, super_entity: EntityId, sub_entity: EntityId) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph.unrelate"))?;
        let removed = state
            .supers
            .get_mut(&sub_entity)
            .map_or(false, |s| s.remove(&super_entity));
        if let Some(subs) = state.subs.get_mut(&super_entity) {
            subs.remove(&sub_entity);
        }
        Ok(removed)
    }

    fn neighbours(
        &self,
        ids: &[EntityId],
        context: &'static str,
        edges: impl Fn(&GraphState) -> &HashMap<EntityId, HashSet<EntityId>>,
    ) -> Result<EntitySet, StorageError> {
        let state = self.state.read().map_err(|_| lock_err(context))?;
        let edges = edges(&*state);
        Ok(ids
            .iter()
            .filter_map(|id| edges.get(id))
            .flat_map(|set| set.iter().copied())
            .collect())
    }
}

impl EntityGraph for InMemoryEntityGraph {
    fn entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("graph.entity"))?;
        Ok(state.entities.get(&id).cloned())
    }

    fn super_entities_of(&self, ids: &[EntityId]) -> Result<EntitySet, StorageError> {
        self.neighbours(ids, "graph.super_entities_of", |s| &s.supers)
    }

    fn sub_entities_of(&self, ids: &[EntityId]) -> Result<EntitySet, StorageError> {
        self.neighbours(ids, "graph.sub_entities_of", |s| &s.subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(name: &str) -> EntityKind {
        EntityKind::new(name)
    }

    #[test]
    fn test_relationships_are_single_hop() {
        let graph = InMemoryEntityGraph::new();
        let org = Entity::new("org", kind("org"));
        let team = Entity::new("team", kind("team"));
        let user = Entity::new("user", kind("user"));
        for e in [&org, &team, &user] {
            graph.insert(e.clone()).unwrap();
        }
        graph.relate(org.id, team.id).unwrap();
        graph.relate(team.id, user.id).unwrap();

        let supers = graph.super_entities_of(&[user.id]).unwrap();
        assert_eq!(supers.len(), 1);
        assert!(supers.contains(&team.id));

        let subs = graph.sub_entities_of(&[org.id]).unwrap();
        assert!(subs.contains(&team.id));
        assert!(!subs.contains(&user.id));
    }

    #[test]
    fn test_neighbours_of_a_set() {
        let graph = InMemoryEntityGraph::new();
        let (a, b, c, d) = (EntityId::new(), EntityId::new(), EntityId::new(), EntityId::new());
        graph.relate(a, c).unwrap();
        graph.relate(b, d).unwrap();
        let subs = graph.sub_entities_of(&[a, b]).unwrap();
        assert_eq!(subs, [c, d].into_iter().collect());
        assert!(graph.sub_entities_of(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_relate_is_idempotent_and_unrelate() {
        let graph = InMemoryEntityGraph::new();
        let (a, b) = (EntityId::new(), EntityId::new());
        graph.relate(a, b).unwrap();
        graph.relate(a, b).unwrap();
        assert_eq!(graph.sub_entities_of(&[a]).unwrap().len(), 1);
        assert!(graph.unrelate(a, b).unwrap());
        assert!(!graph.unrelate(a, b).unwrap());
        assert!(graph.super_entities_of(&[b]).unwrap().is_empty());
    }

    #[test]
    fn test_self_relation_rejected() {
        let graph = InMemoryEntityGraph::new();
        let a = EntityId::new();
        assert!(graph.relate(a, a).is_err());
    }

    #[test]
    fn test_kind_of_and_entities() {
        let graph = InMemoryEntityGraph::new();
        let user = Entity::new("alice", kind("user"));
        graph.insert(user.clone()).unwrap();
        assert_eq!(graph.kind_of(user.id).unwrap(), Some(kind("user")));
        assert_eq!(graph.kind_of(EntityId::new()).unwrap(), None);

        let found = graph.entities(&[EntityId::new(), user.id]).unwrap();
        assert_eq!(found, vec![user]);
    }
}
