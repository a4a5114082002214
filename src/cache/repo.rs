//! Repository cache manager
//!
//! This module provides the `RepoCache` struct which is the main cache manager
//! that ties together all cache operations: cloning mirrors, fetching refs,
//! exporting sub-trees, and maintaining the index.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use super::backfill::{self, dir_size};
use super::export;
use super::git::{self, DEFAULT_GIT_TIMEOUT, GitCli, GitError};
use super::lock::{DEFAULT_LOCK_TIMEOUT, KeyedLocks, MirrorGuard};
use super::negative::{self, NegativeCache};
use super::paths::CachePaths;
use super::staleness::{is_stale, last_fetch, touch_stamp};
use super::swap;
use crate::resolve::{KnownRefs, RefSelector};
use crate::state::State;
use crate::types::{Remote, RepoKey, SubPath};

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A git operation failed.
    #[error("git error: {0}")]
    Git(#[from] GitError),
    /// An underlying IO operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to acquire the repository lock within the timeout.
    #[error("lock acquisition failed")]
    LockFailed,
    /// The remote could not be cloned.
    #[error("failed to fetch {key}: {message}")]
    Fetch { key: RepoKey, message: String },
    /// The tree could not be written out of the mirror.
    #[error("failed to export from {key}: {message}")]
    Export { key: RepoKey, message: String },
    /// The requested path does not exist at the commit.
    #[error("path '{path}' does not exist at {commit}")]
    PathNotFound { path: String, commit: String },
    /// The index database failed.
    #[error("index error: {0}")]
    State(#[from] rusqlite::Error),
}

/// Tunables for a [`RepoCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Limit for each git invocation; `None` waits forever.
    pub git_timeout: Option<Duration>,
    /// How long to wait for another holder of a mirror lock.
    pub lock_timeout: Duration,
    /// Branch selectors fetch when the last fetch is older than this.
    pub branch_max_age: Duration,
    /// How long a failed clone is remembered.
    pub negative_ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            git_timeout: Some(DEFAULT_GIT_TIMEOUT),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            branch_max_age: Duration::from_secs(5 * 60),
            negative_ttl: negative::DEFAULT_TTL,
        }
    }
}

/// One cached remote as of its last read.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: RepoKey,
    pub url: String,
    pub mirror_path: PathBuf,
    pub last_fetch: Option<SystemTime>,
    pub known_refs: KnownRefs,
    /// True when the call that produced this entry created the mirror.
    pub cloned: bool,
}

impl CacheEntry {
    /// Size of the mirror on disk.
    pub fn size_bytes(&self) -> u64 {
        dir_size(&self.mirror_path)
    }
}

/// Outcome of [`RepoCache::ensure_fresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freshness {
    /// A fetch ran and succeeded.
    pub fetched: bool,
    /// A fetch ran and failed; the previous refs were kept.
    pub fetch_error: Option<String>,
}

/// Files written by [`RepoCache::export_subtree`].
#[derive(Debug, Clone)]
pub struct ExportedTree {
    pub dest: PathBuf,
    /// Relative to `dest`, sorted.
    pub files: Vec<PathBuf>,
    /// The sub-path named a single file rather than a directory.
    pub is_file: bool,
}

/// Cache of bare mirrors, one per repository identity.
pub struct RepoCache {
    paths: CachePaths,
    git: GitCli,
    options: CacheOptions,
    locks: KeyedLocks,
    negative: NegativeCache,
    state: State,
}

impl RepoCache {
    /// Open (creating if needed) the cache rooted at `paths`.
    pub fn open(paths: CachePaths, options: CacheOptions) -> Result<Self, CacheError> {
        std::fs::create_dir_all(paths.mirrors_dir())?;
        std::fs::create_dir_all(paths.locks_dir())?;
        std::fs::create_dir_all(paths.tmp_dir())?;
        let state = State::open(&paths.state_db())?;
        state.init()?;

        Ok(Self {
            git: GitCli::new().with_timeout(options.git_timeout),
            negative: NegativeCache::with_ttl(options.negative_ttl),
            locks: KeyedLocks::new(),
            paths,
            options,
            state,
        })
    }

    /// Return the cache paths used by this cache manager.
    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    /// The index shared by every user of this cache root.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    fn lock(&self, key: &RepoKey) -> Result<MirrorGuard<'_>, CacheError> {
        match MirrorGuard::acquire(
            &self.locks,
            key,
            &self.paths.lock_path(key),
            self.options.lock_timeout,
        ) {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                log::warn!("timed out waiting for the lock on {}", key);
                Err(CacheError::LockFailed)
            }
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn read_entry(&self, key: &RepoKey, url: &str, cloned: bool) -> Result<CacheEntry, CacheError> {
        let mirror_path = self.paths.mirror_dir(key);
        let known_refs = self.git.list_refs(&mirror_path)?;
        Ok(CacheEntry {
            key: key.clone(),
            url: url.to_string(),
            last_fetch: last_fetch(&self.paths.fetch_stamp(key)),
            mirror_path,
            known_refs,
            cloned,
        })
    }

    /// Return the mirror for `remote`, cloning it on first use.
    ///
    /// This will:
    /// 1. Re-read refs of an existing, healthy mirror
    /// 2. Discard a directory that is not a usable repository
    /// 3. Clone into a staging directory and rename it into place
    pub fn get_or_create_mirror(&self, remote: &Remote) -> Result<CacheEntry, CacheError> {
        let key = &remote.key;
        let _lock = self.lock(key)?;
        let mirror_path = self.paths.mirror_dir(key);

        if mirror_path.exists() {
            if git::is_mirror(&mirror_path) {
                return self.read_entry(key, &remote.url, false);
            }
            log::warn!(
                "Discarding unusable mirror at {}",
                mirror_path.display()
            );
            swap::remove_path(&mirror_path)?;
        }

        if let Some(message) = self.negative.failure(key) {
            return Err(CacheError::Fetch {
                key: key.clone(),
                message,
            });
        }

        self.clone_into_place(remote, &mirror_path)?;
        self.negative.forget(key);
        self.state.record_mirror(key, &remote.url)?;
        self.state.record_fetch(key)?;
        self.read_entry(key, &remote.url, true)
    }

    fn clone_into_place(&self, remote: &Remote, mirror_path: &Path) -> Result<(), CacheError> {
        let key = &remote.key;
        log::info!("Cloning {} from {}", key, remote.url);

        if let Some(parent) = mirror_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = swap::create_staging_dir(mirror_path)?;
        if let Err(err) = self.git.clone_mirror(&remote.url, &staging) {
            let _ = swap::remove_path(&staging);
            let message = err.to_string();
            self.negative.record_failure(key, &message);
            return Err(CacheError::Fetch {
                key: key.clone(),
                message,
            });
        }

        if let Err(err) = std::fs::rename(&staging, mirror_path) {
            let _ = swap::remove_path(&staging);
            return Err(err.into());
        }
        touch_stamp(&self.paths.fetch_stamp(key))?;
        Ok(())
    }

    fn needs_fetch(&self, entry: &CacheEntry, selector: &RefSelector, tag_prefix: Option<&str>) -> bool {
        match selector {
            RefSelector::Latest | RefSelector::Range(_) => true,
            RefSelector::Commit(rev) => !matches!(self.find_commit(entry, rev), Ok(Some(_))),
            _ if !entry.known_refs.contains(selector, tag_prefix) => true,
            RefSelector::Branch(_) | RefSelector::DefaultBranch => is_stale(
                &self.paths.fetch_stamp(&entry.key),
                self.options.branch_max_age,
            ),
            RefSelector::Tag(_) => false,
        }
    }

    /// Make sure `entry` knows the refs needed to resolve `selector`,
    /// fetching from the remote when they may be missing or outdated.
    ///
    /// Version tags are looked up within `tag_prefix`. A failed fetch is not
    /// an error: the previous refs stay in place and the failure is reported
    /// in [`Freshness::fetch_error`].
    pub fn ensure_fresh(
        &self,
        entry: &mut CacheEntry,
        selector: &RefSelector,
        tag_prefix: Option<&str>,
    ) -> Result<Freshness, CacheError> {
        if entry.cloned || !self.needs_fetch(entry, selector, tag_prefix) {
            return Ok(Freshness::default());
        }

        let _lock = self.lock(&entry.key)?;
        let stamp = self.paths.fetch_stamp(&entry.key);

        // Someone else fetched while we waited for the lock.
        let current = last_fetch(&stamp);
        if current.is_some() && current != entry.last_fetch {
            *entry = self.read_entry(&entry.key, &entry.url, false)?;
            let satisfied = match selector {
                RefSelector::Latest | RefSelector::Range(_) => true,
                RefSelector::Commit(rev) => matches!(self.find_commit(entry, rev), Ok(Some(_))),
                _ => entry.known_refs.contains(selector, tag_prefix),
            };
            if satisfied {
                return Ok(Freshness::default());
            }
        }

        log::info!("Fetching {} ({})", entry.key, selector);
        match self.git.fetch_all(&entry.mirror_path) {
            Ok(()) => {
                touch_stamp(&stamp)?;
                if let Err(err) = self.state.record_fetch(&entry.key) {
                    log::warn!("failed to record fetch of {}: {}", entry.key, err);
                }
                *entry = self.read_entry(&entry.key, &entry.url, false)?;
                Ok(Freshness {
                    fetched: true,
                    fetch_error: None,
                })
            }
            Err(err) => {
                log::warn!(
                    "Fetch of {} failed, using cached refs: {}",
                    entry.key,
                    err
                );
                Ok(Freshness {
                    fetched: false,
                    fetch_error: Some(err.to_string()),
                })
            }
        }
    }

    /// Full id of the commit `rev` names in the mirror, reachable from a ref
    /// or not. `None` if the mirror does not have it.
    pub fn find_commit(&self, entry: &CacheEntry, rev: &str) -> Result<Option<String>, CacheError> {
        Ok(self.git.rev_parse_commit(&entry.mirror_path, rev)?)
    }

    /// Write the tree at `sub_path` in `commit` into `dest`, which is created
    /// if needed. Only `git archive` runs under the mirror lock.
    pub fn export_subtree(
        &self,
        entry: &CacheEntry,
        commit: &str,
        sub_path: &SubPath,
        dest: &Path,
    ) -> Result<ExportedTree, CacheError> {
        let export_err = |err: GitError| CacheError::Export {
            key: entry.key.clone(),
            message: err.to_string(),
        };

        std::fs::create_dir_all(self.paths.tmp_dir())?;
        let scratch = tempfile::Builder::new()
            .prefix("export-")
            .suffix(".tar")
            .tempfile_in(self.paths.tmp_dir())?;

        let is_file = {
            let _lock = self.lock(&entry.key)?;
            let mirror = &entry.mirror_path;

            if self.git.rev_parse_commit(mirror, commit).map_err(export_err)?.is_none() {
                return Err(CacheError::Export {
                    key: entry.key.clone(),
                    message: format!("commit {} is not in the mirror", commit),
                });
            }

            let is_file = if sub_path.is_root() {
                false
            } else {
                let kind = self
                    .git
                    .object_type(mirror, commit, sub_path.as_str())
                    .map_err(export_err)?
                    .ok_or_else(|| CacheError::PathNotFound {
                        path: sub_path.to_string(),
                        commit: commit.to_string(),
                    })?;
                match kind.as_str() {
                    "tree" => false,
                    "blob" => true,
                    other => {
                        return Err(CacheError::Export {
                            key: entry.key.clone(),
                            message: format!("'{}' is a {}, not a file or directory", sub_path, other),
                        });
                    }
                }
            };

            self.git
                .archive(mirror, commit, sub_path.as_str(), scratch.path())
                .map_err(export_err)?;
            is_file
        };

        let files = export::unpack_subtree(scratch.path(), sub_path, is_file, dest).map_err(|e| {
            CacheError::Export {
                key: entry.key.clone(),
                message: e.to_string(),
            }
        })?;
        log::debug!(
            "Exported {} files of {}:{} into {}",
            files.len(),
            entry.key,
            sub_path,
            dest.display()
        );

        Ok(ExportedTree {
            dest: dest.to_path_buf(),
            files,
            is_file,
        })
    }

    /// Every cached mirror, sorted by identity.
    ///
    /// Mirrors found on disk but missing from the index are added; index rows
    /// whose mirror directory is gone are pruned.
    pub fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        backfill::backfill_mirrors(&self.state, &self.paths, &self.git);

        let mut entries = Vec::new();
        for row in self.state.mirrors()? {
            let mirror_path = self.paths.mirror_dir(&row.key);
            if !mirror_path.exists() {
                log::info!("Pruning index entry for vanished mirror {}", row.key);
                self.state.remove_mirror(&row.key)?;
                continue;
            }
            let known_refs = match self.git.list_refs(&mirror_path) {
                Ok(refs) => refs,
                Err(err) => {
                    log::warn!("Cannot read refs of {}: {}", row.key, err);
                    KnownRefs::default()
                }
            };
            entries.push(CacheEntry {
                last_fetch: last_fetch(&self.paths.fetch_stamp(&row.key)),
                key: row.key,
                url: row.url,
                mirror_path,
                known_refs,
                cloned: false,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Delete one mirror. Returns whether anything was on disk.
    pub fn remove(&self, key: &RepoKey) -> Result<bool, CacheError> {
        let _lock = self.lock(key)?;
        let mirror_path = self.paths.mirror_dir(key);
        let existed = mirror_path.exists();
        swap::remove_path(&mirror_path)?;
        self.state.remove_mirror(key)?;
        self.negative.forget(key);
        if existed {
            log::info!("Removed mirror {}", key);
        }
        Ok(existed)
    }

    /// Delete every mirror and scratch file. Returns how many mirrors went.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = self.list()?;
        let mut removed = 0;
        for entry in &entries {
            if self.remove(&entry.key)? {
                removed += 1;
            }
        }
        self.negative.clear();

        let tmp = self.paths.tmp_dir();
        swap::remove_path(&tmp)?;
        std::fs::create_dir_all(&tmp)?;
        Ok(removed)
    }
}
