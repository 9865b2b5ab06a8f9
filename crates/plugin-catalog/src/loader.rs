//! Module loader contract and the shared-library implementation
//!
//! The catalog never touches plugin binaries directly. It hands the bytes it
//! read from disk to a [`ModuleLoader`] and keeps the returned handle/token
//! pair until the module is unloaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use libloading::{Library, Symbol};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::LoaderError;
use crate::snapshot::{CodeUnitToken, ModuleHandle};

/// Result of a successful [`ModuleLoader::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    pub handle: ModuleHandle,
    pub token: CodeUnitToken,
}

/// Turns in-memory module images into executable units and reclaims them.
pub trait ModuleLoader: Send + Sync {
    /// Load a module from its image. `path` is informational only; the loader
    /// must not rely on the file still existing.
    fn load(
        &self,
        path: &Path,
        image: &[u8],
        debug_symbols: Option<&[u8]>,
    ) -> Result<LoadedModule, LoaderError>;

    /// Begin releasing a code unit. Release may complete later.
    fn request_unload(&self, token: CodeUnitToken) -> Result<(), LoaderError>;

    /// Whether anything still keeps the code unit alive
    fn is_reachable(&self, token: CodeUnitToken) -> bool;

    /// Code unit that owns a module handle, if it has not been unloaded
    fn token_owner_of(&self, handle: ModuleHandle) -> Option<CodeUnitToken>;
}

/// A shared library opened from a private shadow copy.
///
/// The library is closed before its shadow directory is removed.
pub struct ShadowLibrary {
    library: Library,
    source_path: PathBuf,
    shadow_path: PathBuf,
    _shadow_dir: TempDir,
}

impl ShadowLibrary {
    /// Path the module was originally read from
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Path of the copy that is actually mapped
    pub fn shadow_path(&self) -> &Path {
        &self.shadow_path
    }

    /// Look up an exported symbol.
    ///
    /// # Safety
    /// `T` must match the actual type of the exported symbol.
    pub unsafe fn symbol<T>(&self, name: &[u8]) -> Result<Symbol<'_, T>, LoaderError> {
        unsafe {
            self.library.get(name).map_err(|e| LoaderError::Library {
                path: self.source_path.clone(),
                reason: e.to_string(),
            })
        }
    }
}

impl Drop for ShadowLibrary {
    fn drop(&mut self) {
        debug!("Closing plugin library: {:?}", self.source_path);
    }
}

struct LiveUnit {
    handle: ModuleHandle,
    library: Arc<ShadowLibrary>,
}

#[derive(Default)]
struct Units {
    live: HashMap<CodeUnitToken, LiveUnit>,
    by_handle: HashMap<ModuleHandle, CodeUnitToken>,
    retired: HashMap<CodeUnitToken, Weak<ShadowLibrary>>,
}

impl Units {
    fn prune_retired(&mut self) {
        self.retired.retain(|_, weak| weak.strong_count() > 0);
    }
}

/// [`ModuleLoader`] backed by `libloading`.
///
/// Each image is written into its own temporary directory before it is
/// opened, so the original file can be replaced or deleted while the module
/// is loaded. Release is reference counted: the library closes once the
/// loader and every [`Arc`] handed out by [`LibraryLoader::library`] are gone.
pub struct LibraryLoader {
    shadow_root: Option<PathBuf>,
    debug_symbol_extension: String,
    next_id: AtomicU64,
    units: Mutex<Units>,
}

impl LibraryLoader {
    /// Create a loader that places shadow copies under the system temp dir
    pub fn new() -> Self {
        Self {
            shadow_root: None,
            debug_symbol_extension: "pdb".to_string(),
            next_id: AtomicU64::new(1),
            units: Mutex::new(Units::default()),
        }
    }

    /// Place shadow copies under `root` instead of the system temp dir
    pub fn with_shadow_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.shadow_root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Extension used for the debug-symbol copy next to the shadow image
    pub fn with_debug_symbol_extension(mut self, ext: &str) -> Self {
        self.debug_symbol_extension = ext.trim_start_matches('.').to_string();
        self
    }

    /// Get a live library by module handle
    pub fn library(&self, handle: ModuleHandle) -> Option<Arc<ShadowLibrary>> {
        let units = self.units.lock();
        let token = units.by_handle.get(&handle)?;
        units.live.get(token).map(|unit| unit.library.clone())
    }

    /// Number of units that are loaded and not yet released
    pub fn live_count(&self) -> usize {
        self.units.lock().live.len()
    }

    fn shadow_dir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("plugin-shadow-");
        match &self.shadow_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for LibraryLoader {
    fn load(
        &self,
        path: &Path,
        image: &[u8],
        debug_symbols: Option<&[u8]>,
    ) -> Result<LoadedModule, LoaderError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| LoaderError::Rejected(format!("no file name in {:?}", path)))?;

        let shadow_dir = self.shadow_dir()?;
        let shadow_path = shadow_dir.path().join(file_name);
        std::fs::write(&shadow_path, image)?;

        if let Some(symbols) = debug_symbols {
            // Debuggers look for the side-car next to the mapped image.
            let side_car = shadow_path.with_extension(&self.debug_symbol_extension);
            std::fs::write(side_car, symbols)?;
        }

        let library = unsafe {
            Library::new(&shadow_path).map_err(|e| LoaderError::Library {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let loaded = LoadedModule {
            handle: ModuleHandle(id),
            token: CodeUnitToken(id),
        };

        let library = Arc::new(ShadowLibrary {
            library,
            source_path: path.to_path_buf(),
            shadow_path,
            _shadow_dir: shadow_dir,
        });

        let mut units = self.units.lock();
        units.prune_retired();
        units.by_handle.insert(loaded.handle, loaded.token);
        units.live.insert(
            loaded.token,
            LiveUnit {
                handle: loaded.handle,
                library,
            },
        );

        info!("Loaded plugin library {:?} as {}", path, loaded.token);
        Ok(loaded)
    }

    fn request_unload(&self, token: CodeUnitToken) -> Result<(), LoaderError> {
        let unit = {
            let mut units = self.units.lock();
            let unit = units
                .live
                .remove(&token)
                .ok_or(LoaderError::UnknownToken(token.0))?;
            units.by_handle.remove(&unit.handle);
            units.retired.insert(token, Arc::downgrade(&unit.library));
            unit
        };

        // Dropped outside the lock: closing a library runs its destructors.
        drop(unit);
        debug!("Released {}", token);
        Ok(())
    }

    fn is_reachable(&self, token: CodeUnitToken) -> bool {
        let mut units = self.units.lock();
        if units.live.contains_key(&token) {
            return true;
        }
        let reachable = units
            .retired
            .get(&token)
            .is_some_and(|weak| weak.strong_count() > 0);
        if !reachable {
            units.retired.remove(&token);
        }
        reachable
    }

    fn token_owner_of(&self, handle: ModuleHandle) -> Option<CodeUnitToken> {
        self.units.lock().by_handle.get(&handle).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_new() {
        let loader = LibraryLoader::new();
        assert_eq!(loader.live_count(), 0);
        assert!(loader.shadow_root.is_none());
    }

    #[test]
    fn test_load_rejects_garbage_image() {
        let shadow = tempfile::tempdir().unwrap();
        let loader = LibraryLoader::new().with_shadow_root(shadow.path());

        let result = loader.load(Path::new("/plugins/broken.so"), b"not a library", None);
        assert!(matches!(result, Err(LoaderError::Library { .. })));
        assert_eq!(loader.live_count(), 0);
    }

    #[test]
    fn test_load_requires_file_name() {
        let loader = LibraryLoader::new();
        let result = loader.load(Path::new("/"), b"", None);
        assert!(matches!(result, Err(LoaderError::Rejected(_))));
    }

    /// A shared library every glibc system ships, with one exported symbol
    #[cfg(target_os = "linux")]
    fn system_library() -> Option<(PathBuf, &'static [u8])> {
        const DIRS: &[&str] = &[
            "/lib/x86_64-linux-gnu",
            "/usr/lib/x86_64-linux-gnu",
            "/lib/aarch64-linux-gnu",
            "/usr/lib/aarch64-linux-gnu",
            "/lib64",
            "/usr/lib64",
            "/lib",
            "/usr/lib",
        ];
        const LIBS: &[(&str, &[u8])] = &[
            ("libz.so.1", b"zlibVersion\0"),
            ("libm.so.6", b"cos\0"),
        ];
        LIBS.iter().find_map(|(name, symbol)| {
            DIRS.iter()
                .map(|dir| Path::new(dir).join(name))
                .find(|path| path.is_file())
                .map(|path| (path, *symbol))
        })
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unloaded_library_stays_reachable_while_borrowed() {
        let Some((system_path, symbol)) = system_library() else {
            eprintln!("no system shared library found, skipping");
            return;
        };
        let image = std::fs::read(&system_path).unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let loader = LibraryLoader::new().with_shadow_root(shadow.path());

        let loaded = loader
            .load(Path::new("/plugins/libplugin.so"), &image, Some(&b"symbols"[..]))
            .unwrap();
        assert_eq!(loader.live_count(), 1);
        assert_eq!(loader.token_owner_of(loaded.handle), Some(loaded.token));

        let library = loader.library(loaded.handle).unwrap();
        assert_eq!(library.source_path(), Path::new("/plugins/libplugin.so"));
        assert!(library.shadow_path().starts_with(shadow.path()));
        assert!(library.shadow_path().with_extension("pdb").is_file());
        assert!(unsafe { library.symbol::<unsafe extern "C" fn()>(symbol) }.is_ok());

        loader.request_unload(loaded.token).unwrap();
        assert_eq!(loader.live_count(), 0);
        assert!(loader.token_owner_of(loaded.handle).is_none());
        assert!(loader.library(loaded.handle).is_none());

        // Our Arc keeps the library open
        assert!(loader.is_reachable(loaded.token));

        let shadow_path = library.shadow_path().to_path_buf();
        drop(library);
        assert!(!loader.is_reachable(loaded.token));
        assert!(!shadow_path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_released_units_are_pruned_on_next_load() {
        let Some((system_path, _)) = system_library() else {
            eprintln!("no system shared library found, skipping");
            return;
        };
        let image = std::fs::read(&system_path).unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let loader = LibraryLoader::new().with_shadow_root(shadow.path());

        let first = loader.load(Path::new("/plugins/a.so"), &image, None).unwrap();
        loader.request_unload(first.token).unwrap();
        assert_eq!(loader.units.lock().retired.len(), 1);

        let second = loader.load(Path::new("/plugins/b.so"), &image, None).unwrap();
        assert_ne!(first.token, second.token);
        assert!(loader.units.lock().retired.is_empty());
        assert_eq!(loader.live_count(), 1);
    }

    #[test]
    fn test_unknown_token() {
        let loader = LibraryLoader::new();
        let token = CodeUnitToken(42);
        assert!(matches!(
            loader.request_unload(token),
            Err(LoaderError::UnknownToken(42))
        ));
        assert!(!loader.is_reachable(token));
        assert!(loader.token_owner_of(ModuleHandle(42)).is_none());
        assert!(loader.library(ModuleHandle(42)).is_none());
    }
}
