//! Event context payloads and context loaders.
//!
//! A source may name a context loader: a pure function that enriches an
//! event's stored context when it is read. Loaders are registered under a
//! dotted reference (`"app.loaders.comment"`) and resolved once, when the
//! source is saved. An unresolvable reference rejects the save.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigurationError;

/// Structured payload carried by an event.
pub type Context = serde_json::Map<String, Value>;

/// Enriches an event context on read.
pub trait ContextLoader: Send + Sync {
    /// Returns the context with any additional fields loaded.
    fn load(&self, context: Context) -> Context;
}

impl<F> ContextLoader for F
where
    F: Fn(Context) -> Context + Send + Sync,
{
    fn load(&self, context: Context) -> Context {
        self(context)
    }
}

fn reference_pattern() -> Result<&'static Regex, ConfigurationError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$"))
        .as_ref()
        .map_err(|e| ConfigurationError::InvalidConfig {
            reason: format!("context loader pattern: {e}"),
        })
}

/// Checks that a loader reference is a dotted identifier path.
pub fn validate_reference(reference: &str) -> Result<(), ConfigurationError> {
    if reference_pattern()?.is_match(reference) {
        Ok(())
    } else {
        Err(ConfigurationError::MalformedContextLoader {
            reference: reference.to_string(),
        })
    }
}

/// Registry of loaders available to sources, keyed by reference.
///
/// # Examples
///
/// ```
/// use entity_event::context::{Context, ContextLoaderRegistry};
///
/// let mut registry = ContextLoaderRegistry::new();
/// registry
///     .register("app.loaders.stamp", |mut ctx: Context| {
///         ctx.insert("stamped".to_string(), true.into());
///         ctx
///     })
///     .unwrap();
/// assert!(registry.contains("app.loaders.stamp"));
/// ```
#[derive(Clone, Default)]
pub struct ContextLoaderRegistry {
    loaders: HashMap<String, Arc<dyn ContextLoader>>,
}

impl ContextLoaderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loader under `reference`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::MalformedContextLoader` if the reference
    /// is not a dotted identifier path.
    pub fn register(
        &mut self,
        reference: impl Into<String>,
        loader: impl ContextLoader + 'static,
    ) -> Result<(), ConfigurationError> {
        let reference = reference.into();
        validate_reference(&reference)?;
        self.loaders.insert(reference, Arc::new(loader));
        Ok(())
    }

    /// Returns true if a loader is registered under `reference`.
    #[must_use]
    pub fn contains(&self, reference: &str) -> bool {
        self.loaders.contains_key(reference)
    }

    /// Resolves the loader a source refers to.
    ///
    /// # Errors
    ///
    /// - `MalformedContextLoader` if the reference is not a valid path.
    /// - `UnresolvableContextLoader` if nothing is registered under it.
    pub fn resolve(
        &self,
        source_name: &str,
        reference: &str,
    ) -> Result<Arc<dyn ContextLoader>, ConfigurationError> {
        validate_reference(reference)?;
        self.loaders.get(reference).cloned().ok_or_else(|| {
            ConfigurationError::UnresolvableContextLoader {
                source_name: source_name.to_string(),
                reference: reference.to_string(),
            }
        })
    }

    /// Number of registered loaders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// Returns true if no loaders are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl fmt::Debug for ContextLoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut references: Vec<&String> = self.loaders.keys().collect();
        references.sort();
        f.debug_struct("ContextLoaderRegistry")
            .field("references", &references)
            .finish()
    }
}
