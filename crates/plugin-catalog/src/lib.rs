//! Hot-swappable plugin catalog
//!
//! Loads plugin modules from a directory and keeps them in sync with it:
//! - Directory watching with a debounced rescan
//! - Load / reload / unload driven by file timestamps
//! - Ordered change notifications delivered outside the catalog lock
//! - Reference-counted release of unloaded shared libraries
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plugin_catalog::{CatalogConfig, LibraryLoader, PluginCatalog};
//!
//! let catalog = PluginCatalog::new(CatalogConfig::default(), Arc::new(LibraryLoader::new()));
//! catalog.on_reloaded(|current, previous| {
//!     tracing::info!("{} swapped {} -> {}", current.file_name, previous.code_unit_token, current.code_unit_token);
//! });
//! catalog.set_directory("./plugins", false)?;
//! ```

mod catalog;
mod config;
mod error;
mod fs;
mod loader;
mod notifier;
mod snapshot;
mod watcher;

pub use catalog::{CatalogBuilder, PluginCatalog};
pub use config::{CatalogConfig, MIN_WATCHER_DEBOUNCE, RelevancePredicate};
pub use error::{CatalogError, CatalogResult, ConfigError, LoaderError};
pub use fs::{FileSystem, OsFileSystem, normalize_path};
pub use loader::{LibraryLoader, LoadedModule, ModuleLoader, ShadowLibrary};
pub use notifier::SubscriptionId;
pub use snapshot::{
    CatalogEvent, ChangeKind, CodeUnitToken, ModuleHandle, ModuleSnapshot, PendingChange,
    ScanSummary,
};

// Re-exported so `FileSystem` implementors can name the pattern type
pub use glob::Pattern;
