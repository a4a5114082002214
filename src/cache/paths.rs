//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which manages all filesystem paths
//! for the cache directory layout:
//!
//! ```text
//! ~/.cache/treeport/
//! ├── index.db                      # SQLite index of mirrors and loads
//! ├── mirrors/
//! │   └── <domain>/
//! │       └── <owner>%2F<repo>.git/ # Bare mirror clone
//! │           └── treeport-fetched  # mtime = last successful fetch
//! ├── checkouts/
//! │   └── <domain>/
//! │       └── <owner>%2F<repo>/     # work tree used for publishing
//! ├── locks/
//! │   └── <domain>/
//! │       ├── <owner>%2F<repo>.lock # flock-based locking
//! │       └── <owner>%2F<repo>.checkout.lock
//! └── tmp/                          # scratch archives during export
//! ```
//!
//! Repository paths are flattened into one directory name by percent-escaping
//! `%` and `/`, so `a/b` and `a/b.git/c` can never nest inside each other.

use std::path::{Path, PathBuf};

use crate::types::RepoKey;

/// Marker file touched after every successful clone or fetch.
const FETCH_STAMP: &str = "treeport-fetched";

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

/// Flatten a repository path into a single, reversible directory name.
fn escape_repo_path(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`escape_repo_path`].
pub(crate) fn unescape_repo_path(name: &str) -> String {
    name.replace("%2F", "/").replace("%25", "%")
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the state database path: `{root}/index.db`
    pub fn state_db(&self) -> PathBuf {
        self.root.join("index.db")
    }

    /// Returns the mirrors directory path: `{root}/mirrors`
    pub fn mirrors_dir(&self) -> PathBuf {
        self.root.join("mirrors")
    }

    /// Returns the locks directory path: `{root}/locks`
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Returns the checkouts directory path: `{root}/checkouts`
    pub fn checkouts_dir(&self) -> PathBuf {
        self.root.join("checkouts")
    }

    /// Returns the scratch directory path: `{root}/tmp`
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Returns the mirror directory for a repository:
    /// `{root}/mirrors/{domain}/{escaped path}.git`
    pub fn mirror_dir(&self, key: &RepoKey) -> PathBuf {
        self.mirrors_dir()
            .join(key.domain.dir_name())
            .join(format!("{}.git", escape_repo_path(key.path.as_str())))
    }

    /// Returns the fetch stamp inside a mirror directory.
    pub fn fetch_stamp(&self, key: &RepoKey) -> PathBuf {
        self.mirror_dir(key).join(FETCH_STAMP)
    }

    /// Returns the publishing work tree for a repository:
    /// `{root}/checkouts/{domain}/{escaped path}`
    pub fn checkout_dir(&self, key: &RepoKey) -> PathBuf {
        self.checkouts_dir()
            .join(key.domain.dir_name())
            .join(escape_repo_path(key.path.as_str()))
    }

    /// Returns the lock file guarding a publishing work tree.
    pub fn checkout_lock_path(&self, key: &RepoKey) -> PathBuf {
        self.locks_dir()
            .join(key.domain.dir_name())
            .join(format!("{}.checkout.lock", escape_repo_path(key.path.as_str())))
    }

    /// Returns the lock file path: `{root}/locks/{domain}/{escaped path}.lock`
    pub fn lock_path(&self, key: &RepoKey) -> PathBuf {
        self.locks_dir()
            .join(key.domain.dir_name())
            .join(format!("{}.lock", escape_repo_path(key.path.as_str())))
    }
}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "treeport"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("treeport"))
    }
}
