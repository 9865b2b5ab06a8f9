//! Immutable values handed to subscribers

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Opaque identity of a loaded module, as issued by the module loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleHandle(pub u64);

impl ModuleHandle {
    /// Handle of the host's own statically linked code. Always live.
    pub const HOST: ModuleHandle = ModuleHandle(0);

    pub fn is_host(&self) -> bool {
        *self == Self::HOST
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Token for the reclaimable code unit backing a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeUnitToken(pub u64);

impl fmt::Display for CodeUnitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// A point-in-time description of one loaded module.
///
/// Snapshots are never mutated after creation and compare by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    /// Absolute, normalized path of the module file
    pub path: PathBuf,
    /// File name component of `path`
    pub file_name: String,
    /// Last-write time observed when the binary was read
    pub last_write_time: SystemTime,
    pub module_handle: ModuleHandle,
    pub code_unit_token: CodeUnitToken,
}

/// Kind of a queued module transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Loaded,
    Reloaded,
    Unloaded,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Loaded => write!(f, "Loaded"),
            ChangeKind::Reloaded => write!(f, "Reloaded"),
            ChangeKind::Unloaded => write!(f, "Unloaded"),
        }
    }
}

/// A module transition recorded while the catalog gate is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingChange {
    Loaded(ModuleSnapshot),
    Reloaded {
        current: ModuleSnapshot,
        previous: ModuleSnapshot,
    },
    Unloaded(ModuleSnapshot),
}

impl PendingChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            PendingChange::Loaded(_) => ChangeKind::Loaded,
            PendingChange::Reloaded { .. } => ChangeKind::Reloaded,
            PendingChange::Unloaded(_) => ChangeKind::Unloaded,
        }
    }

    /// Snapshot of the module after the change, if it is still loaded
    pub fn current(&self) -> Option<&ModuleSnapshot> {
        match self {
            PendingChange::Loaded(current) | PendingChange::Reloaded { current, .. } => {
                Some(current)
            }
            PendingChange::Unloaded(_) => None,
        }
    }

    /// Snapshot of the module before the change, if it was loaded
    pub fn previous(&self) -> Option<&ModuleSnapshot> {
        match self {
            PendingChange::Reloaded { previous, .. } | PendingChange::Unloaded(previous) => {
                Some(previous)
            }
            PendingChange::Loaded(_) => None,
        }
    }
}

/// Summary carried by the scan-completed signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Whether the operation loaded, reloaded or unloaded anything
    pub changed: bool,
    pub scan_time: SystemTime,
}

/// Everything the catalog tells its subscribers about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogEvent {
    Change(PendingChange),
    ScanCompleted(ScanSummary),
}

impl From<PendingChange> for CatalogEvent {
    fn from(change: PendingChange) -> Self {
        CatalogEvent::Change(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, unit: u64) -> ModuleSnapshot {
        ModuleSnapshot {
            path: PathBuf::from("/plugins").join(name),
            file_name: name.to_string(),
            last_write_time: SystemTime::UNIX_EPOCH,
            module_handle: ModuleHandle(unit),
            code_unit_token: CodeUnitToken(unit),
        }
    }

    #[test]
    fn test_host_handle() {
        assert!(ModuleHandle::HOST.is_host());
        assert!(!ModuleHandle(7).is_host());
    }

    #[test]
    fn test_snapshot_value_equality() {
        assert_eq!(snapshot("a.dll", 1), snapshot("a.dll", 1));
        assert_ne!(snapshot("a.dll", 1), snapshot("a.dll", 2));
    }

    #[test]
    fn test_pending_change_accessors() {
        let reloaded = PendingChange::Reloaded {
            current: snapshot("a.dll", 2),
            previous: snapshot("a.dll", 1),
        };
        assert_eq!(reloaded.kind(), ChangeKind::Reloaded);
        assert_eq!(reloaded.current().map(|s| s.code_unit_token), Some(CodeUnitToken(2)));
        assert_eq!(reloaded.previous().map(|s| s.code_unit_token), Some(CodeUnitToken(1)));

        let unloaded = PendingChange::Unloaded(snapshot("b.dll", 3));
        assert!(unloaded.current().is_none());
        assert_eq!(unloaded.kind().to_string(), "Unloaded");
    }

    #[test]
    fn test_event_json_shape() {
        let event = CatalogEvent::from(PendingChange::Loaded(snapshot("a.dll", 4)));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["change"]["kind"], "loaded");
        assert_eq!(value["change"]["file_name"], "a.dll");
        assert_eq!(value["change"]["code_unit_token"], 4);

        let back: CatalogEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
