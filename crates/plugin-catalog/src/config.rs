//! Catalog configuration
//!
//! Plain values are deserializable from any format supported by the `config`
//! crate; the relevance predicate can only be set from code.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as Cfg, Environment, File, FileFormat};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lower bound applied to the watcher debounce window.
pub const MIN_WATCHER_DEBOUNCE: Duration = Duration::from_millis(50);

/// Decides whether a raw watcher event path can affect the catalog.
pub type RelevancePredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Catalog configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Glob matched against file names in the plugin directory
    pub search_pattern: String,
    /// Whether directory changes trigger rescans automatically
    pub enable_watcher: bool,
    /// Quiet period after the last relevant event before rescanning
    pub watcher_debounce_ms: u64,
    /// Extension of the debug-symbol side-car read next to each module
    pub debug_symbol_extension: Option<String>,
    /// Custom watcher event filter, replaces the search pattern match
    #[serde(skip)]
    pub is_relevant_path: Option<RelevancePredicate>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            search_pattern: "*.dll".to_string(),
            enable_watcher: true,
            watcher_debounce_ms: 500,
            debug_symbol_extension: Some("pdb".to_string()),
            is_relevant_path: None,
        }
    }
}

impl fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("search_pattern", &self.search_pattern)
            .field("enable_watcher", &self.enable_watcher)
            .field("watcher_debounce_ms", &self.watcher_debounce_ms)
            .field("debug_symbol_extension", &self.debug_symbol_extension)
            .field("is_relevant_path", &self.is_relevant_path.is_some())
            .finish()
    }
}

impl CatalogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the file name glob
    pub fn with_search_pattern(mut self, pattern: &str) -> Self {
        self.search_pattern = pattern.to_string();
        self
    }

    /// Enable/disable the directory watcher
    pub fn with_watcher(mut self, enabled: bool) -> Self {
        self.enable_watcher = enabled;
        self
    }

    /// Set the debounce window
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.watcher_debounce_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set or clear the debug-symbol side-car extension
    pub fn with_debug_symbol_extension(mut self, ext: Option<&str>) -> Self {
        self.debug_symbol_extension = ext.map(|e| e.trim_start_matches('.').to_string());
        self
    }

    /// Replace the default relevance check used by the watcher
    pub fn with_relevance<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.is_relevant_path = Some(Arc::new(predicate));
        self
    }

    /// Debounce window with the floor applied
    pub fn watcher_debounce(&self) -> Duration {
        Duration::from_millis(self.watcher_debounce_ms).max(MIN_WATCHER_DEBOUNCE)
    }

    /// Compile the search pattern, falling back to a match-everything glob
    /// when the configured one is malformed.
    pub(crate) fn compiled_pattern(&self) -> Pattern {
        match Pattern::new(self.search_pattern.trim()) {
            Ok(pattern) => pattern,
            Err(e) => {
                tracing::warn!(
                    pattern = %self.search_pattern,
                    "Invalid search pattern, matching all files: {}",
                    e
                );
                Pattern::new("*").unwrap_or_default()
            }
        }
    }

    /// Check whether a file name matches the search pattern (case-insensitive)
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        pattern_matches(&self.compiled_pattern(), file_name)
    }

    /// Build the watcher filter: the custom predicate if one is set,
    /// otherwise a file-name match against the search pattern.
    pub(crate) fn relevance(&self) -> RelevancePredicate {
        if let Some(predicate) = &self.is_relevant_path {
            return predicate.clone();
        }
        let pattern = self.compiled_pattern();
        Arc::new(move |path: &Path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern_matches(&pattern, name))
        })
    }

    /// Load configuration from a file, detecting the format from its extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;

        Cfg::builder()
            .add_source(File::from_str(&content, format))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))
    }

    /// Load configuration from a file with environment variable overrides
    ///
    /// Variables use the given prefix and `__` as separator, for example
    /// `PLUGINS__WATCHER_DEBOUNCE_MS=250` with prefix `PLUGINS`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;

        Cfg::builder()
            .add_source(File::from_str(&content, format))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))
    }
}

pub(crate) fn pattern_matches(pattern: &Pattern, file_name: &str) -> bool {
    pattern.matches_with(file_name, MATCH_OPTIONS)
}

fn detect_format(path: &Path) -> Result<FileFormat, ConfigError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CatalogConfig::default();
        assert!(config.enable_watcher);
        assert_eq!(config.watcher_debounce(), Duration::from_millis(500));
        assert_eq!(config.search_pattern, "*.dll");
        assert!(config.matches_file_name("Plugin.DLL"));
        assert!(config.is_relevant_path.is_none());
    }

    #[test]
    fn test_debounce_floor() {
        let config = CatalogConfig::new().with_debounce(Duration::from_millis(5));
        assert_eq!(config.watcher_debounce(), MIN_WATCHER_DEBOUNCE);

        let config = CatalogConfig::new().with_debounce(Duration::from_millis(120));
        assert_eq!(config.watcher_debounce(), Duration::from_millis(120));
    }

    #[test]
    fn test_pattern_match_is_case_insensitive() {
        let config = CatalogConfig::new().with_search_pattern("*.dll");
        assert!(config.matches_file_name("a.dll"));
        assert!(config.matches_file_name("B.DLL"));
        assert!(!config.matches_file_name("a.pdb"));
        assert!(!config.matches_file_name("a.dll.tmp"));
    }

    #[test]
    fn test_default_relevance_uses_pattern() {
        let config = CatalogConfig::new().with_search_pattern("*.so");
        let relevant = config.relevance();
        assert!(relevant(Path::new("/plugins/libfoo.so")));
        assert!(!relevant(Path::new("/plugins/notes.txt")));
    }

    #[test]
    fn test_custom_relevance_overrides_pattern() {
        let config = CatalogConfig::new()
            .with_search_pattern("*.so")
            .with_relevance(|path| path.extension().is_some_and(|e| e == "txt"));
        let relevant = config.relevance();
        assert!(relevant(Path::new("/plugins/notes.txt")));
        assert!(!relevant(Path::new("/plugins/libfoo.so")));
    }

    #[test]
    fn test_debug_extension_strips_dot() {
        let config = CatalogConfig::new().with_debug_symbol_extension(Some(".debug"));
        assert_eq!(config.debug_symbol_extension.as_deref(), Some("debug"));
    }

    #[test]
    fn test_from_file_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(
            &path,
            "search_pattern = \"*.so\"\nenable_watcher = false\nwatcher_debounce_ms = 200\n",
        )
        .unwrap();

        let config = CatalogConfig::from_file(&path).unwrap();
        assert_eq!(config.search_pattern, "*.so");
        assert!(!config.enable_watcher);
        assert_eq!(config.watcher_debounce(), Duration::from_millis(200));
        // Unset fields keep their defaults
        assert_eq!(config.debug_symbol_extension.as_deref(), Some("pdb"));
    }

    #[test]
    fn test_from_file_with_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{ "search_pattern": "*.so", "watcher_debounce_ms": 200 }"#)
            .unwrap();

        // Prefix unique to this test
        unsafe { std::env::set_var("PLUGIN_CATALOG_ENV_TEST__WATCHER_DEBOUNCE_MS", "75") };
        let config = CatalogConfig::from_file_with_env(&path, "PLUGIN_CATALOG_ENV_TEST").unwrap();
        unsafe { std::env::remove_var("PLUGIN_CATALOG_ENV_TEST__WATCHER_DEBOUNCE_MS") };

        assert_eq!(config.search_pattern, "*.so");
        assert_eq!(config.watcher_debounce(), Duration::from_millis(75));
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.txt");
        std::fs::write(&path, "").unwrap();

        let result = CatalogConfig::from_file(&path);
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
