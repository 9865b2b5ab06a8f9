//! Plugin catalog
//!
//! Tracks which plugin modules of one directory are loaded, diffs the
//! directory against that set on every scan, and drives the module loader.
//! All mutations serialize on a single gate; their notifications are queued
//! before the gate is released and delivered after it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use glob::Pattern;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};
use crate::fs::{FileSystem, OsFileSystem, PathKey, file_name_of, normalize_path};
use crate::loader::ModuleLoader;
use crate::notifier::{EventNotifier, SubscriptionId};
use crate::snapshot::{
    CatalogEvent, CodeUnitToken, ModuleHandle, ModuleSnapshot, PendingChange, ScanSummary,
};
use crate::watcher::ChangeWatcher;

/// How many times an unloaded code unit is probed for reachability
const RELEASE_PROBES: usize = 2;

/// Live record of a loaded module. Replaced, never mutated, on reload.
struct ModuleEntry {
    path: PathBuf,
    last_write_time: SystemTime,
    token: CodeUnitToken,
    handle: ModuleHandle,
}

impl ModuleEntry {
    fn snapshot(&self) -> ModuleSnapshot {
        ModuleSnapshot {
            path: self.path.clone(),
            file_name: file_name_of(&self.path),
            last_write_time: self.last_write_time,
            module_handle: self.handle,
            code_unit_token: self.token,
        }
    }
}

/// Everything guarded by the gate
struct CatalogState {
    directory: Option<PathBuf>,
    modules: HashMap<PathKey, ModuleEntry>,
    last_scan_time: Option<SystemTime>,
    watcher: Option<ChangeWatcher>,
    watcher_enabled: bool,
    disposed: bool,
}

impl CatalogState {
    fn ensure_live(&self) -> CatalogResult<()> {
        if self.disposed {
            Err(CatalogError::IllegalState)
        } else {
            Ok(())
        }
    }
}

struct CatalogInner {
    config: CatalogConfig,
    pattern: Pattern,
    loader: Arc<dyn ModuleLoader>,
    fs: Arc<dyn FileSystem>,
    gate: Mutex<CatalogState>,
    notifier: EventNotifier,
}

/// Builder for [`PluginCatalog`]
pub struct CatalogBuilder {
    loader: Arc<dyn ModuleLoader>,
    config: CatalogConfig,
    fs: Arc<dyn FileSystem>,
}

impl CatalogBuilder {
    /// Set the configuration
    pub fn config(mut self, config: CatalogConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the file system wrapper
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn build(self) -> PluginCatalog {
        let pattern = self.config.compiled_pattern();
        let watcher_enabled = self.config.enable_watcher;
        PluginCatalog {
            inner: Arc::new(CatalogInner {
                config: self.config,
                pattern,
                loader: self.loader,
                fs: self.fs,
                gate: Mutex::new(CatalogState {
                    directory: None,
                    modules: HashMap::new(),
                    last_scan_time: None,
                    watcher: None,
                    watcher_enabled,
                    disposed: false,
                }),
                notifier: EventNotifier::new(),
            }),
        }
    }
}

/// Concurrency-safe registry of the plugin modules loaded from a directory.
///
/// Cloning is cheap; clones share the same catalog.
#[derive(Clone)]
pub struct PluginCatalog {
    inner: Arc<CatalogInner>,
}

impl PluginCatalog {
    /// Create a catalog using the OS file system
    pub fn new(config: CatalogConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        Self::builder(loader).config(config).build()
    }

    pub fn builder(loader: Arc<dyn ModuleLoader>) -> CatalogBuilder {
        CatalogBuilder {
            loader,
            config: CatalogConfig::default(),
            fs: Arc::new(OsFileSystem),
        }
    }

    /// Switch to `path`, unloading everything tracked so far and loading
    /// every matching file found there.
    ///
    /// Does nothing when `path` is already the configured directory, unless
    /// `force_reload` is set. The directory is created if it does not exist.
    pub fn set_directory<P: AsRef<Path>>(&self, path: P, force_reload: bool) -> CatalogResult<()> {
        self.inner.set_directory(path.as_ref(), force_reload)
    }

    /// Diff the configured directory against the tracked modules.
    ///
    /// Returns whether anything was loaded, reloaded or unloaded.
    pub fn rescan(&self) -> CatalogResult<bool> {
        self.inner.rescan()
    }

    /// Force a reload of a module given by path or bare file name, even if
    /// its timestamp did not change. Returns `false` if it cannot be found.
    pub fn reload<P: AsRef<Path>>(&self, path_or_file_name: P) -> CatalogResult<bool> {
        self.inner.reload(path_or_file_name.as_ref())
    }

    /// Unload a tracked module given by path or bare file name.
    /// Returns `false` if no such module is tracked.
    pub fn unload<P: AsRef<Path>>(&self, path_or_file_name: P) -> CatalogResult<bool> {
        self.inner.unload(path_or_file_name.as_ref())
    }

    /// Point-in-time copy of the tracked modules, sorted by path
    pub fn list_modules(&self) -> Vec<ModuleSnapshot> {
        let state = self.inner.gate.lock();
        let mut modules: Vec<ModuleSnapshot> =
            state.modules.values().map(ModuleEntry::snapshot).collect();
        modules.sort_by(|a, b| a.path.cmp(&b.path));
        modules
    }

    /// Whether code behind `handle` may still be used.
    ///
    /// True for the host's own handle and for modules the catalog currently
    /// tracks. False as soon as the owning module is unloaded, whether or not
    /// its memory has been reclaimed yet.
    pub fn is_module_live(&self, handle: ModuleHandle) -> bool {
        if handle.is_host() {
            return true;
        }
        let Some(token) = self.inner.loader.token_owner_of(handle) else {
            return false;
        };
        let state = self.inner.gate.lock();
        state
            .modules
            .values()
            .any(|entry| entry.token == token && entry.handle == handle)
    }

    /// Stop watching and unload everything. Later mutating calls fail with
    /// [`CatalogError::IllegalState`]. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Start or stop event-driven rescans
    pub fn set_watcher_enabled(&self, enabled: bool) -> CatalogResult<()> {
        self.inner.set_watcher_enabled(enabled)
    }

    /// Whether a directory watcher is currently running
    pub fn is_watching(&self) -> bool {
        self.inner.gate.lock().watcher.is_some()
    }

    /// Currently configured directory
    pub fn directory(&self) -> Option<PathBuf> {
        self.inner.gate.lock().directory.clone()
    }

    /// Time of the last completed directory scan
    pub fn last_scan_time(&self) -> Option<SystemTime> {
        self.inner.gate.lock().last_scan_time
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.gate.lock().disposed
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.inner.config
    }

    /// Subscribe to every catalog event through a broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.inner.notifier.subscribe()
    }

    /// Called with the new snapshot after a module is loaded
    pub fn on_loaded<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleSnapshot) + Send + Sync + 'static,
    {
        self.inner.notifier.on_loaded(f)
    }

    /// Called with the new and the previous snapshot after a reload
    pub fn on_reloaded<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleSnapshot, &ModuleSnapshot) + Send + Sync + 'static,
    {
        self.inner.notifier.on_reloaded(f)
    }

    /// Called with the final snapshot after a module is unloaded
    pub fn on_unloaded<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleSnapshot) + Send + Sync + 'static,
    {
        self.inner.notifier.on_unloaded(f)
    }

    /// Called once per `set_directory`, `rescan`, `reload` and `unload`
    pub fn on_scan_completed<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(bool, SystemTime) + Send + Sync + 'static,
    {
        self.inner.notifier.on_scan_completed(f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }
}

fn require_non_blank(name: &'static str, path: &Path) -> CatalogResult<()> {
    if path.to_string_lossy().trim().is_empty() {
        return Err(CatalogError::invalid_argument(name, "must not be empty"));
    }
    Ok(())
}

impl CatalogInner {
    fn set_directory(self: &Arc<Self>, path: &Path, force_reload: bool) -> CatalogResult<()> {
        require_non_blank("path", path)?;
        let directory = normalize_path(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut state = self.gate.lock();
        state.ensure_live()?;

        let unchanged = state
            .directory
            .as_deref()
            .is_some_and(|current| PathKey::new(current) == PathKey::new(&directory));
        if unchanged && !force_reload {
            debug!("Plugin directory unchanged: {:?}", directory);
            return Ok(());
        }

        self.fs
            .create_dir_all(&directory)
            .map_err(|source| CatalogError::Io {
                path: directory.clone(),
                source,
            })?;

        info!("Switching plugin directory to {:?}", directory);
        state.watcher = None;

        let mut changes = Vec::new();
        let mut changed = self.unload_all(&mut state, &mut changes);
        state.directory = Some(directory);
        changed |= self.scan(&mut state, &mut changes);

        let scan_time = SystemTime::now();
        state.last_scan_time = Some(scan_time);

        if state.watcher_enabled {
            if let Err(e) = self.start_watcher(&mut state) {
                warn!("Failed to watch plugin directory: {}", e);
            }
        }

        self.commit(state, changes, Some(ScanSummary { changed, scan_time }));
        Ok(())
    }

    fn rescan(&self) -> CatalogResult<bool> {
        let mut state = self.gate.lock();
        state.ensure_live()?;

        let mut changes = Vec::new();
        let changed = self.scan(&mut state, &mut changes);

        let scan_time = SystemTime::now();
        state.last_scan_time = Some(scan_time);

        self.commit(state, changes, Some(ScanSummary { changed, scan_time }));
        Ok(changed)
    }

    fn reload(&self, target: &Path) -> CatalogResult<bool> {
        require_non_blank("path_or_file_name", target)?;
        let mut state = self.gate.lock();
        state.ensure_live()?;

        let mut changes = Vec::new();
        let changed = match self.resolve(&state, target) {
            Some(path) if self.fs.exists(&path) => {
                self.load_or_reload(&mut state, &path, true, &mut changes)
            }
            _ => {
                debug!("Nothing to reload for {:?}", target);
                false
            }
        };

        let scan_time = SystemTime::now();
        self.commit(state, changes, Some(ScanSummary { changed, scan_time }));
        Ok(changed)
    }

    fn unload(&self, target: &Path) -> CatalogResult<bool> {
        require_non_blank("path_or_file_name", target)?;
        let mut state = self.gate.lock();
        state.ensure_live()?;

        let mut changes = Vec::new();
        let changed = match self.resolve(&state, target) {
            Some(path) => self.unload_entry(&mut state, &PathKey::new(&path), &mut changes),
            None => false,
        };
        if !changed {
            debug!("Nothing to unload for {:?}", target);
        }

        let scan_time = SystemTime::now();
        self.commit(state, changes, Some(ScanSummary { changed, scan_time }));
        Ok(changed)
    }

    fn dispose(&self) {
        let mut state = self.gate.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.watcher = None;

        let mut changes = Vec::new();
        self.unload_all(&mut state, &mut changes);
        info!("Plugin catalog disposed, {} module(s) unloaded", changes.len());

        self.commit(state, changes, None);
    }

    fn set_watcher_enabled(self: &Arc<Self>, enabled: bool) -> CatalogResult<()> {
        let mut state = self.gate.lock();
        state.ensure_live()?;
        state.watcher_enabled = enabled;

        if !enabled {
            state.watcher = None;
        } else if state.watcher.is_none() && state.directory.is_some() {
            self.start_watcher(&mut state)?;
        }
        Ok(())
    }

    /// Queue the batch while still holding the gate, then release the gate
    /// and deliver.
    fn commit(
        &self,
        state: MutexGuard<'_, CatalogState>,
        changes: Vec<PendingChange>,
        summary: Option<ScanSummary>,
    ) {
        match summary {
            Some(summary) => self.notifier.enqueue(changes, summary),
            None => self.notifier.enqueue_changes(changes),
        }
        drop(state);
        self.notifier.flush();
    }

    fn start_watcher(self: &Arc<Self>, state: &mut CatalogState) -> CatalogResult<()> {
        let Some(directory) = state.directory.as_deref() else {
            return Ok(());
        };

        let catalog = Arc::downgrade(self);
        let watcher = ChangeWatcher::start(
            directory,
            self.config.watcher_debounce(),
            self.config.relevance(),
            move || match catalog.upgrade() {
                Some(inner) => inner.rescan().map(|changed| {
                    debug!(changed, "Debounced rescan finished");
                }),
                None => Ok(()),
            },
        )?;
        state.watcher = Some(watcher);
        Ok(())
    }

    /// Unload tracked paths missing from disk, then load or reload every
    /// matching file in enumeration order.
    fn scan(&self, state: &mut CatalogState, changes: &mut Vec<PendingChange>) -> bool {
        let Some(directory) = state.directory.clone() else {
            debug!("Rescan requested before a plugin directory was set");
            return false;
        };

        let files = match self.fs.enumerate(&directory, &self.pattern) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to enumerate plugin directory {:?}: {}", directory, e);
                return false;
            }
        };

        let mut seen = HashSet::new();
        let on_disk: Vec<(PathKey, PathBuf)> = files
            .into_iter()
            .map(|path| (PathKey::new(&path), path))
            .filter(|(key, _)| seen.insert(key.clone()))
            .collect();

        let mut removed: Vec<PathKey> = state
            .modules
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        removed.sort();

        let mut changed = false;
        for key in &removed {
            changed |= self.unload_entry(state, key, changes);
        }
        for (_, path) in &on_disk {
            changed |= self.load_or_reload(state, path, false, changes);
        }
        changed
    }

    /// Load `path` if untracked, reload it if its timestamp moved forward
    /// (or unconditionally when `force` is set). Failures leave the current
    /// entry in place and return `false`.
    fn load_or_reload(
        &self,
        state: &mut CatalogState,
        path: &Path,
        force: bool,
        changes: &mut Vec<PendingChange>,
    ) -> bool {
        let key = PathKey::new(path);

        let last_write_time = match self.fs.modified(path) {
            Ok(time) => time,
            Err(e) => {
                debug!("Plugin {:?} vanished before it could be read: {}", path, e);
                return false;
            }
        };

        if !force {
            if let Some(entry) = state.modules.get(&key) {
                if entry.last_write_time >= last_write_time {
                    return false;
                }
            }
        }

        let image = match self.fs.read(path) {
            Ok(image) => image,
            Err(e) => {
                warn!("Failed to read plugin {:?}: {}", path, e);
                return false;
            }
        };
        let debug_symbols = self.read_debug_symbols(path);

        let loaded = match self.loader.load(path, &image, debug_symbols.as_deref()) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Failed to load plugin {:?}: {}", path, e);
                return false;
            }
        };

        let entry = ModuleEntry {
            path: path.to_path_buf(),
            last_write_time,
            token: loaded.token,
            handle: loaded.handle,
        };
        let current = entry.snapshot();

        match state.modules.remove(&key) {
            Some(old) => {
                let previous = old.snapshot();
                self.release(&old);
                state.modules.insert(key, entry);
                info!("Reloaded plugin {:?} ({} -> {})", path, old.token, loaded.token);
                changes.push(PendingChange::Reloaded { current, previous });
            }
            None => {
                state.modules.insert(key, entry);
                info!("Loaded plugin {:?} as {}", path, loaded.token);
                changes.push(PendingChange::Loaded(current));
            }
        }
        true
    }

    fn read_debug_symbols(&self, path: &Path) -> Option<Vec<u8>> {
        let ext = self.config.debug_symbol_extension.as_deref()?;
        let side_car = path.with_extension(ext);
        if side_car == path || !self.fs.exists(&side_car) {
            return None;
        }
        match self.fs.read(&side_car) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("Ignoring unreadable debug symbols {:?}: {}", side_car, e);
                None
            }
        }
    }

    fn unload_entry(
        &self,
        state: &mut CatalogState,
        key: &PathKey,
        changes: &mut Vec<PendingChange>,
    ) -> bool {
        let Some(entry) = state.modules.remove(key) else {
            return false;
        };
        let snapshot = entry.snapshot();
        self.release(&entry);
        info!("Unloaded plugin {:?}", entry.path);
        changes.push(PendingChange::Unloaded(snapshot));
        true
    }

    fn unload_all(&self, state: &mut CatalogState, changes: &mut Vec<PendingChange>) -> bool {
        let mut keys: Vec<PathKey> = state.modules.keys().cloned().collect();
        keys.sort();

        let mut changed = false;
        for key in &keys {
            changed |= self.unload_entry(state, key, changes);
        }
        changed
    }

    /// Hand the code unit back to the loader and give it a fair chance to
    /// report the release. Neither a release error nor a still reachable unit
    /// fails the unload.
    fn release(&self, entry: &ModuleEntry) {
        if let Err(e) = self.loader.request_unload(entry.token) {
            warn!("Loader failed to release {:?} ({}): {}", entry.path, entry.token, e);
        }

        for probe in 0..RELEASE_PROBES {
            if !self.loader.is_reachable(entry.token) {
                debug!("{} released after {} probe(s)", entry.token, probe + 1);
                return;
            }
            thread::yield_now();
        }
        debug!("{} still reachable after unload of {:?}", entry.token, entry.path);
    }

    /// Resolve a path or bare file name to a module path: an existing
    /// absolute path, then a file in the configured directory, then a tracked
    /// module with the same path or file name.
    fn resolve(&self, state: &CatalogState, target: &Path) -> Option<PathBuf> {
        let candidate = if target.is_absolute() {
            normalize_path(target).ok()
        } else {
            state
                .directory
                .as_ref()
                .and_then(|dir| normalize_path(&dir.join(target)).ok())
        };

        if let Some(path) = &candidate {
            if self.fs.exists(path) {
                return Some(path.clone());
            }
            if let Some(entry) = state.modules.get(&PathKey::new(path)) {
                return Some(entry.path.clone());
            }
        }

        let wanted = target.file_name()?.to_string_lossy().to_lowercase();
        state
            .modules
            .values()
            .find(|entry| file_name_of(&entry.path).to_lowercase() == wanted)
            .map(|entry| entry.path.clone())
    }
}

impl Drop for CatalogInner {
    fn drop(&mut self) {
        let state = self.gate.get_mut();
        state.watcher = None;
        for entry in state.modules.values() {
            if let Err(e) = self.loader.request_unload(entry.token) {
                debug!("Failed to release {:?} on drop: {}", entry.path, e);
            }
        }
        state.modules.clear();
    }
}
