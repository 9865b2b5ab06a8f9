//! Typed errors for the plugin catalog.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`PluginCatalog`](crate::PluginCatalog) operations.
///
/// Only programmer errors and environment failures reach the caller. Load and
/// unload failures of individual modules are recovered inside the catalog and
/// reported through logging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// An argument was empty, whitespace only, or otherwise unusable.
    #[error("Invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// Name of the offending argument.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The catalog has been disposed and no longer accepts mutations.
    #[error("Catalog is disposed")]
    IllegalState,

    /// The plugin directory could not be prepared.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The directory watcher could not be started.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl CatalogError {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors reported by a [`ModuleLoader`](crate::ModuleLoader).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load library {}: {reason}", .path.display())]
    Library { path: PathBuf, reason: String },

    #[error("Unknown code unit: {0}")]
    UnknownToken(u64),

    #[error("Module rejected: {0}")]
    Rejected(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_message() {
        let err = CatalogError::invalid_argument("path", "must not be empty");
        assert_eq!(err.to_string(), "Invalid argument `path`: must not be empty");
    }

    #[test]
    fn test_loader_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LoaderError = io.into();
        assert!(matches!(err, LoaderError::Io(_)));
    }
}
