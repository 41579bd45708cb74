//! Strongly typed row identifiers.
//!
//! Every persisted row is keyed by a UUID newtype so that a `MediumId` can
//! never be passed where a `SourceId` is expected.

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

define_id!(
    /// Identifier of a [`crate::Medium`].
    MediumId
);
define_id!(
    /// Identifier of a [`crate::Source`].
    SourceId
);
define_id!(
    /// Identifier of a [`crate::SourceGroup`].
    SourceGroupId
);
define_id!(
    /// Identifier of a [`crate::Subscription`].
    SubscriptionId
);
define_id!(
    /// Identifier of an [`crate::Unsubscription`].
    UnsubscriptionId
);
define_id!(
    /// Identifier of an [`crate::Event`] row (distinct from its `uuid` idempotency key).
    EventId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(MediumId::new(), MediumId::new());
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn test_id_roundtrips_uuid() {
        let uuid = uuid::Uuid::new_v4();
        let id = SourceId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), &uuid);
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = SubscriptionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
