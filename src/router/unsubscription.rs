//! Per-call unsubscription cache.
//!
//! A cache is loaded at the start of one router call and dropped with it.
//! Unsubscriptions created after loading are not seen by that call.

use std::collections::{HashMap, HashSet};

use crate::entity::EntityId;
use crate::id::{MediumId, SourceId};
use crate::storage::{StorageError, SubscriptionStore};

/// Entities unsubscribed from each source, for one medium.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubscriptionCache {
    medium: MediumId,
    by_source: HashMap<SourceId, HashSet<EntityId>>,
}

impl UnsubscriptionCache {
    /// Loads every unsubscription of `medium` in one read.
    pub fn load<S>(store: &S, medium: MediumId) -> Result<Self, StorageError>
    where
        S: SubscriptionStore + ?Sized,
    {
        let mut by_source: HashMap<SourceId, HashSet<EntityId>> = HashMap::new();
        for unsub in store.unsubscriptions_for_medium(medium)? {
            by_source.entry(unsub.source).or_default().insert(unsub.entity);
        }
        Ok(Self { medium, by_source })
    }

    /// The medium this cache covers.
    #[must_use]
    pub const fn medium(&self) -> MediumId {
        self.medium
    }

    /// True iff `entity` unsubscribed from `source` on this medium.
    #[must_use]
    pub fn is_unsubscribed(&self, entity: EntityId, source: SourceId) -> bool {
        self.by_source
            .get(&source)
            .map_or(false, |entities| entities.contains(&entity))
    }

    /// Removes unsubscribed entities from `targets`, keeping order and duplicates.
    #[must_use]
    pub fn filter_targets(&self, source: SourceId, mut targets: Vec<EntityId>) -> Vec<EntityId> {
        if let Some(unsubscribed) = self.by_source.get(&source) {
            targets.retain(|t| !unsubscribed.contains(t));
        }
        targets
    }
}
