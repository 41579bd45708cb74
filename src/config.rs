//! Router configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Which events a `mark_seen` query acknowledges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSeenScope {
    /// Every event that passed the time, expiry and seen filters, whether or
    /// not a subscription routed it.
    #[default]
    Filtered,
    /// Only the events present in the returned result.
    Returned,
}

/// Built-in follow policy used for mediums without an override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowDirection {
    /// An entity follows itself and its direct super-entities.
    #[default]
    Hierarchy,
    /// An entity follows itself and its direct sub-entities.
    ReverseHierarchy,
}

/// Configuration for an [`EventRouter`](crate::router::EventRouter).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Collapse repeated targets produced by overlapping subscriptions.
    pub dedupe_targets: bool,
    /// Events acknowledged when a query asks to mark seen.
    pub mark_seen_scope: MarkSeenScope,
    /// Follow policy for mediums without an explicit override.
    pub default_follow: FollowDirection,
}

impl RouterConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidConfig`] if the document is not
    /// valid JSON or has unknown variant values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::InvalidConfig {
            reason: e.to_string(),
        })
    }
}
