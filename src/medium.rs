//! Delivery channels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, MAX_NAME_LENGTH};
use crate::id::MediumId;

/// A delivery channel for events: an email digest, an in-app feed, a
/// site-wide notification center.
///
/// Only the descriptive fields (`display_name`, `description`) change after
/// creation; `name` is unique and fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medium {
    pub id: MediumId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl Medium {
    /// Creates a medium with a fresh id.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: MediumId::new(),
            name: name.into(),
            display_name: display_name.into(),
            description: description.into(),
        }
    }

    /// Checks field lengths and required fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ValidationError::check_required("name", &self.name, MAX_NAME_LENGTH)?;
        ValidationError::check_length("display_name", &self.display_name, MAX_NAME_LENGTH)
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}
