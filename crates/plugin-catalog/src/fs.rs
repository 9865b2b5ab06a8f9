//! Thin file system wrapper used by the catalog

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use glob::Pattern;

use crate::config::pattern_matches;

/// Directory and file access consumed by the catalog.
pub trait FileSystem: Send + Sync {
    /// List regular files in `dir` (non-recursive) whose file name matches
    /// `pattern`, sorted by file name.
    fn enumerate(&self, dir: &Path, pattern: &Pattern) -> io::Result<Vec<PathBuf>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    fn exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn enumerate(&self, dir: &Path, pattern: &Pattern) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern_matches(pattern, name));
            if matches {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        std::fs::metadata(path)?.modified()
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

/// Make `path` absolute and lexically remove `.` and `..` components.
pub fn normalize_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Case-insensitive identity of a normalized path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PathKey(String);

impl PathKey {
    pub(crate) fn new(path: &Path) -> Self {
        Self(path.to_string_lossy().to_lowercase())
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_removes_dots() {
        let base = std::env::temp_dir();
        let messy = base.join("a").join(".").join("b").join("..").join("c.dll");
        assert_eq!(normalize_path(&messy).unwrap(), base.join("a").join("c.dll"));
    }

    #[test]
    fn test_normalize_makes_absolute() {
        let normalized = normalize_path(Path::new("plugins")).unwrap();
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("plugins"));
    }

    #[test]
    fn test_path_key_case_insensitive() {
        assert_eq!(
            PathKey::new(Path::new("/Plugins/A.DLL")),
            PathKey::new(Path::new("/plugins/a.dll"))
        );
    }

    #[test]
    fn test_enumerate_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.dll"), b"b").unwrap();
        std::fs::write(dir.path().join("a.DLL"), b"a").unwrap();
        std::fs::write(dir.path().join("a.pdb"), b"sym").unwrap();
        std::fs::create_dir(dir.path().join("sub.dll")).unwrap();

        let pattern = Pattern::new("*.dll").unwrap();
        let files = OsFileSystem.enumerate(dir.path(), &pattern).unwrap();
        let names: Vec<String> = files.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(names, vec!["a.DLL".to_string(), "b.dll".to_string()]);
    }

    #[test]
    fn test_enumerate_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = Pattern::new("*").unwrap();
        assert!(OsFileSystem.enumerate(&dir.path().join("nope"), &pattern).is_err());
    }
}
