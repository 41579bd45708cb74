//! Event routing.
//!
//! [`EventRouter`] combines the pieces in this module: a
//! [`SubscriptionIndex`] per medium, a [`FollowPolicy`] per medium, and a
//! per-call [`UnsubscriptionCache`].

pub mod follow;
pub mod index;
pub mod predicate;
#[allow(clippy::module_inception)]
mod router;
pub mod unsubscription;

pub use follow::{FollowPolicy, FollowResolver, HierarchyFollowPolicy, ReverseHierarchyFollowPolicy};
pub use index::{subscribed_entities, SubscriptionIndex};
pub use predicate::{SubscriptionClause, SubscriptionPredicate};
pub use router::{EventQuery, EventRouter, EventRouterBuilder, EventTargets};
pub use unsubscription::UnsubscriptionCache;
