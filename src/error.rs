//! Error types for entity-event.
//!
//! Errors are strongly typed using thiserror so callers can match on the
//! precise failure. Lookups never raise "not found": an unknown medium or an
//! entity with no subscriptions yields an empty result instead.

use thiserror::Error;

use crate::entity::{EntityId, EntityKind};
use crate::id::{MediumId, SourceGroupId, SourceId};
use crate::storage::StorageError;

/// Maximum length of a `name` or `display_name` field.
pub const MAX_NAME_LENGTH: usize = 64;

/// Maximum length of a context loader reference.
pub const MAX_CONTEXT_LOADER_LENGTH: usize = 256;

/// Maximum length of an event `uuid`.
pub const MAX_UUID_LENGTH: usize = 128;

/// Input validation errors for reference data and events.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Field '{field}' cannot be empty")]
    EmptyField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },
}

impl ValidationError {
    /// Checks that `value` is non-empty and at most `max_length` characters.
    pub fn check_required(field: &str, value: &str, max_length: usize) -> Result<(), Self> {
        if value.trim().is_empty() {
            return Err(Self::EmptyField {
                field: field.to_string(),
            });
        }
        Self::check_length(field, value, max_length)
    }

    /// Checks that `value` is at most `max_length` characters.
    pub fn check_length(field: &str, value: &str, max_length: usize) -> Result<(), Self> {
        if value.chars().count() > max_length {
            return Err(Self::FieldTooLong {
                field: field.to_string(),
                max_length,
            });
        }
        Ok(())
    }
}

/// Configuration errors: fatal to the save or build that raised them.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Context loader '{reference}' for source '{source_name}' is not registered")]
    UnresolvableContextLoader {
        source_name: String,
        reference: String,
    },

    #[error("Context loader reference '{reference}' is not a valid path")]
    MalformedContextLoader {
        reference: String,
    },

    #[error("Invalid router configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Constraint violations surfaced to the caller and never retried.
#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("An event with uuid '{uuid}' already exists")]
    DuplicateUuid {
        uuid: String,
    },

    #[error("A {table} named '{name}' already exists")]
    DuplicateName {
        table: &'static str,
        name: String,
    },

    #[error("Batch subscription check requires a single entity kind: expected {expected}, found {found} on entity {entity}")]
    HeterogeneousEntityKinds {
        expected: String,
        found: String,
        entity: EntityId,
    },

    #[error("Unknown medium: {id}")]
    UnknownMedium {
        id: MediumId,
    },

    #[error("Unknown source: {id}")]
    UnknownSource {
        id: SourceId,
    },

    #[error("Unknown source group: {id}")]
    UnknownSourceGroup {
        id: SourceGroupId,
    },
}

impl ConstraintError {
    pub(crate) fn heterogeneous(
        expected: Option<&EntityKind>,
        found: Option<&EntityKind>,
        entity: EntityId,
    ) -> Self {
        let name = |kind: Option<&EntityKind>| {
            kind.map_or_else(|| "<unknown>".to_string(), ToString::to_string)
        };
        Self::HeterogeneousEntityKinds {
            expected: name(expected),
            found: name(found),
            entity,
        }
    }
}

/// Top-level error type for entity-event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl EventError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a constraint error.
    #[must_use]
    pub const fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for entity-event operations.
pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_required_rejects_empty() {
        let err = ValidationError::check_required("name", "  ", MAX_NAME_LENGTH).unwrap_err();
        assert!(err.to_string().contains("'name' cannot be empty"));
    }

    #[test]
    fn test_check_length_rejects_long_values() {
        let long = "x".repeat(MAX_NAME_LENGTH + 1);
        let err = ValidationError::check_required("display_name", &long, MAX_NAME_LENGTH).unwrap_err();
        assert!(matches!(err, ValidationError::FieldTooLong { max_length: 64, .. }));
        assert!(ValidationError::check_length("name", &"x".repeat(64), MAX_NAME_LENGTH).is_ok());
    }

    #[test]
    fn test_configuration_error_message() {
        let err = ConfigurationError::UnresolvableContextLoader {
            source_name: "comments".to_string(),
            reference: "app.loaders.missing".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("app.loaders.missing"));
        assert!(msg.contains("comments"));
    }

    #[test]
    fn test_heterogeneous_kinds_message() {
        let entity = EntityId::new();
        let err = ConstraintError::heterogeneous(
            Some(&EntityKind::new("user")),
            None,
            entity,
        );
        let msg = err.to_string();
        assert!(msg.contains("expected user"));
        assert!(msg.contains("<unknown>"));
    }

    #[test]
    fn test_event_error_from_layers() {
        let err: EventError = ConstraintError::DuplicateUuid {
            uuid: "abc".to_string(),
        }
        .into();
        assert!(err.is_constraint());
        assert!(!err.is_configuration());

        let err: EventError = StorageError::BackendError("down".to_string()).into();
        assert!(err.is_storage());

        let err = EventError::internal("unexpected state");
        assert!(err.to_string().contains("unexpected state"));
    }
}
