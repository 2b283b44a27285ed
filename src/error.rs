//! Error types for model resolution.
//!
//! `ResolveError` is the single error type surfaced by the resolver. Using
//! `thiserror`, it names every failure after the component(s) involved so a
//! configuration defect can be located without re-reading the model file.
//!
//! ## Error Hierarchy
//!
//! - **Structural errors** (`MalformedDeclaration`, `DuplicateName`,
//!   `SelfDependency`, `UnresolvedReference`, `CyclicDependency`,
//!   `DuplicateRole`): found while loading, building or validating. These are
//!   collected into [`ValidationErrors`] and reported together through
//!   `ResolveError::Invalid`, so one run surfaces every defect.
//! - **Instantiation errors** (`Factory`): a component constructor failed.
//!   Components created before it have already been torn down when this
//!   error reaches the caller.
//! - **Shutdown errors** (`Teardown`, `ShutdownFailed`): teardown callbacks
//!   that failed while releasing instances.
//! - **Input errors** (`Parse`, `Io`, `Config`): wrapped from the YAML parser,
//!   the filesystem and the configuration layer.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the resolver error type.
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Malformed declaration '{name}': {reason}")]
    MalformedDeclaration { name: String, reason: String },

    #[error("Duplicate component name: '{0}'")]
    DuplicateName(String),

    #[error("Component '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Component '{referrer}' references undeclared component '{missing}'")]
    UnresolvedReference { referrer: String, missing: String },

    #[error("Cyclic dependency between components: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Role '{role}' is used by both '{first}' and '{second}'")]
    DuplicateRole {
        role: String,
        first: String,
        second: String,
    },

    #[error("Failed to create component '{name}': {source}")]
    Factory {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to tear down component '{name}': {source}")]
    Teardown {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<ResolveError>),

    #[error("{0}")]
    Invalid(ValidationErrors),

    #[error("Model parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ResolveError {
    /// Names of the components this error is about, in reporting order.
    pub fn components(&self) -> Vec<&str> {
        match self {
            ResolveError::MalformedDeclaration { name, .. }
            | ResolveError::DuplicateName(name)
            | ResolveError::SelfDependency(name)
            | ResolveError::Factory { name, .. }
            | ResolveError::Teardown { name, .. } => vec![name.as_str()],
            ResolveError::UnresolvedReference { referrer, missing } => {
                vec![referrer.as_str(), missing.as_str()]
            }
            ResolveError::CyclicDependency(names) => names.iter().map(String::as_str).collect(),
            ResolveError::DuplicateRole { first, second, .. } => {
                vec![first.as_str(), second.as_str()]
            }
            ResolveError::ShutdownFailed(errors) => {
                errors.iter().flat_map(ResolveError::components).collect()
            }
            ResolveError::Invalid(errors) => {
                errors.iter().flat_map(ResolveError::components).collect()
            }
            ResolveError::Parse(_) | ResolveError::Io(_) | ResolveError::Config(_) => Vec::new(),
        }
    }
}

/// Every structural defect found in one pass over a model.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    errors: Vec<ResolveError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ResolveError) {
        self.errors.push(error);
    }

    /// Absorb another batch.
    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResolveError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<ResolveError> {
        self.errors
    }

    /// `Ok(value)` when nothing was collected, the whole batch otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T, ValidationErrors> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl From<ValidationErrors> for ResolveError {
    fn from(errors: ValidationErrors) -> Self {
        ResolveError::Invalid(errors)
    }
}

impl<'a> IntoIterator for &'a ValidationErrors {
    type Item = &'a ResolveError;
    type IntoIter = std::slice::Iter<'a, ResolveError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

impl IntoIterator for ValidationErrors {
    type Item = ResolveError;
    type IntoIter = std::vec::IntoIter<ResolveError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
