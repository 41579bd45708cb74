//! Event sources and source groups.
//!
//! A [`Source`] is a fine-grained category of event origin ("comment
//! posted", "invoice overdue"). Sources roll up into coarse
//! [`SourceGroup`]s, which carry no behavior of their own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::validate_reference;
use crate::error::{EventError, ValidationError, MAX_CONTEXT_LOADER_LENGTH, MAX_NAME_LENGTH};
use crate::id::{SourceGroupId, SourceId};

/// Coarse grouping of sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub id: SourceGroupId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl SourceGroup {
    /// Creates a source group with a fresh id.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: SourceGroupId::new(),
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

impl fmt::Display for SourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Where events come from.
///
/// `context_loader` optionally names a registered
/// [`ContextLoader`](crate::context::ContextLoader) that enriches the
/// context of this source's events when they are read.
///
/// # Examples
///
/// ```
/// use entity_event::{Source, SourceGroupId};
///
/// let source = Source::new("comment", "Comments", "New comments", SourceGroupId::new())
///     .with_context_loader("app.loaders.comment");
/// assert_eq!(source.context_loader.as_deref(), Some("app.loaders.comment"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub group: SourceGroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_loader: Option<String>,
}

impl Source {
    /// Creates a source with a fresh id and no context loader.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
        group: SourceGroupId,
    ) -> Self {
        Self {
            id: SourceId::new(),
            name: name.into(),
            display_name: display_name.into(),
            description: description.into(),
            group,
            context_loader: None,
        }
    }

    /// Sets the context loader reference.
    #[must_use]
    pub fn with_context_loader(mut self, reference: impl Into<String>) -> Self {
        let reference = reference.into();
        self.context_loader = if reference.is_empty() { None } else { Some(reference) };
        self
    }

    /// Checks fields and the shape of the loader reference.
    ///
    /// Whether the loader is actually registered is checked at save time,
    /// against the router's registry.
    pub fn validate(&self) -> Result<(), EventError> {
        ValidationError::check_required("name", &self.name, MAX_NAME_LENGTH)?;
        ValidationError::check_length("display_name", &self.display_name, MAX_NAME_LENGTH)?;
        if let Some(reference) = &self.context_loader {
            ValidationError::check_length("context_loader", reference, MAX_CONTEXT_LOADER_LENGTH)?;
            validate_reference(reference)?;
        }
        Ok(())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}
