//! Backfill the index from mirrors already on disk.
//!
//! A cache root can outlive its `index.db` (deleted by hand, or written by an
//! older version). Scanning `mirrors/` recovers every identity from its
//! directory name.

use std::path::{Path, PathBuf};

use super::git::{self, GitCli};
use super::paths::{CachePaths, unescape_repo_path};
use crate::state::State;
use crate::types::{Domain, RepoKey, RepoPath};

/// A mirror found on disk.
#[derive(Debug, Clone)]
pub(crate) struct DiscoveredMirror {
    pub key: RepoKey,
    pub path: PathBuf,
}

/// Reverse of [`Domain::dir_name`].
fn domain_from_dir(name: &str) -> Option<Domain> {
    name.replace('_', ":").parse().ok()
}

/// Every mirror directory under the cache root, skipping staging leftovers
/// and anything that is not a bare repository.
pub(crate) fn scan_mirrors(paths: &CachePaths) -> Vec<DiscoveredMirror> {
    let domains = match std::fs::read_dir(paths.mirrors_dir()) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut found = Vec::new();
    for domain_entry in domains.flatten() {
        if !domain_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let domain = match domain_entry
            .file_name()
            .to_str()
            .and_then(domain_from_dir)
        {
            Some(domain) => domain,
            None => continue,
        };

        let repos = match std::fs::read_dir(domain_entry.path()) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for repo_entry in repos.flatten() {
            let name = match repo_entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }
            let escaped = match name.strip_suffix(".git") {
                Some(escaped) => escaped,
                None => continue,
            };
            let path: RepoPath = match unescape_repo_path(escaped).parse() {
                Ok(path) => path,
                Err(_) => continue,
            };
            let dir = repo_entry.path();
            if !git::is_mirror(&dir) {
                continue;
            }
            found.push(DiscoveredMirror {
                key: RepoKey::new(domain.clone(), path),
                path: dir,
            });
        }
    }

    found.sort_by(|a, b| a.key.cmp(&b.key));
    found
}

/// Insert index rows for mirrors that exist on disk but are not indexed.
/// Returns how many rows were added.
pub(crate) fn backfill_mirrors(state: &State, paths: &CachePaths, git: &GitCli) -> usize {
    let mut added = 0;
    for mirror in scan_mirrors(paths) {
        match state.mirror(&mirror.key) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                log::warn!("Backfill: failed to read {}: {}", mirror.key, err);
                continue;
            }
        }
        let url = git
            .remote_url(&mirror.path, "origin")
            .ok()
            .flatten()
            .unwrap_or_else(|| mirror.key.default_url());
        match state.record_mirror(&mirror.key, &url) {
            Ok(()) => {
                log::info!("Backfilled index entry for {}", mirror.key);
                added += 1;
            }
            Err(err) => log::warn!("Backfill: failed to record {}: {}", mirror.key, err),
        }
    }
    added
}

/// Total size in bytes of the files below `path`.
pub fn dir_size(path: impl AsRef<Path>) -> u64 {
    let path = path.as_ref();
    let mut total = 0u64;
    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.is_file() {
            return meta.len();
        }
    }
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if let Ok(meta) = std::fs::symlink_metadata(&path) {
                if meta.is_file() {
                    total = total.saturating_add(meta.len());
                } else if meta.is_dir() {
                    total = total.saturating_add(dir_size(path));
                }
            }
        }
    }
    total
}
