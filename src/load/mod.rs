//! Dependency loading: resolve a descriptor against its mirror and materialize
//! the requested sub-tree into the project.

pub mod batch;
pub mod hooks;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::cache::{CacheError, RepoCache, swap};
use crate::descriptor::Descriptor;
use crate::resolve::{LatestPolicy, RefSelector, ResolveError, ResolvedCommit, resolve};
use crate::state::{LoadRecord, now_unix};
use crate::version::{pick_tag_scope, semver_tags};

pub use batch::{BatchLoader, BatchReport, CancelToken, default_jobs};
pub use hooks::{HookOutcome, PostLoadHooks};

/// Errors for one package. Every variant names the package.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{package}: {source}")]
    Cache {
        package: String,
        #[source]
        source: CacheError,
    },
    #[error("{package}: {source}")]
    Resolve {
        package: String,
        #[source]
        source: ResolveError,
    },
    #[error("{package}: path '{path}' does not exist at {commit}")]
    PathNotFound {
        package: String,
        path: String,
        commit: String,
    },
    #[error("{package}: failed to write {}: {message}", target.display())]
    Export {
        package: String,
        target: PathBuf,
        message: String,
    },
    #[error("{package}: post-load command failed: {message}")]
    Hook { package: String, message: String },
    #[error("{package}: cancelled before it started")]
    Cancelled { package: String },
    #[error("unknown package '{0}'")]
    UnknownPackage(String),
}

impl LoadError {
    pub fn package(&self) -> &str {
        match self {
            LoadError::Cache { package, .. }
            | LoadError::Resolve { package, .. }
            | LoadError::PathNotFound { package, .. }
            | LoadError::Export { package, .. }
            | LoadError::Hook { package, .. }
            | LoadError::Cancelled { package } => package,
            LoadError::UnknownPackage(name) => name,
        }
    }
}

/// A package that was written to disk.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    pub target: PathBuf,
    pub resolved: ResolvedCommit,
    /// Files written, relative to `target`.
    pub files: Vec<PathBuf>,
    pub hook: Option<HookOutcome>,
}

/// Outcome of loading one package.
#[derive(Debug)]
pub struct LoadResult {
    pub package_name: String,
    pub outcome: Result<LoadedPackage, LoadError>,
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_message(&self) -> Option<String> {
        self.outcome.as_ref().err().map(|e| e.to_string())
    }

    pub fn commit(&self) -> Option<&str> {
        self.outcome
            .as_ref()
            .ok()
            .map(|loaded| loaded.resolved.commit.as_str())
    }
}

/// Settings shared by every load.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub latest_policy: LatestPolicy,
    /// Domain -> base URL, applied before cloning.
    pub url_rewrites: BTreeMap<String, String>,
    /// Where dependencies without a local target go, relative to the root.
    pub dependency_dir: PathBuf,
    pub project_root: PathBuf,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            latest_policy: LatestPolicy::default(),
            url_rewrites: BTreeMap::new(),
            dependency_dir: PathBuf::from("."),
            project_root: PathBuf::from("."),
        }
    }
}

/// Loads single descriptors through a shared cache.
pub struct Loader {
    cache: Arc<RepoCache>,
    options: LoaderOptions,
    hooks: PostLoadHooks,
}

impl Loader {
    pub fn new(cache: Arc<RepoCache>, options: LoaderOptions) -> Self {
        Self {
            cache,
            options,
            hooks: PostLoadHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: PostLoadHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn cache(&self) -> &RepoCache {
        &self.cache
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Directory `descriptor` loads into.
    pub fn target_for(&self, descriptor: &Descriptor) -> PathBuf {
        descriptor.target_dir(&self.options.project_root, &self.options.dependency_dir)
    }

    /// Delete whatever is at the descriptor's target.
    pub fn clean_target(&self, descriptor: &Descriptor) -> Result<(), LoadError> {
        let target = self.target_for(descriptor);
        swap::remove_path(&target).map_err(|e| LoadError::Export {
            package: descriptor.package_name.clone(),
            target: target.clone(),
            message: e.to_string(),
        })?;
        if let Err(e) = self.cache.state().forget_load(&target) {
            log::warn!("Failed to forget load record for {}: {}", target.display(), e);
        }
        Ok(())
    }

    /// Resolve `descriptor` to a commit, fetching if needed. Nothing is
    /// written to the project.
    pub fn resolve(&self, descriptor: &Descriptor) -> Result<ResolvedCommit, LoadError> {
        self.resolve_entry(descriptor).map(|(_, resolved)| resolved)
    }

    fn resolve_entry(
        &self,
        descriptor: &Descriptor,
    ) -> Result<(crate::cache::CacheEntry, ResolvedCommit), LoadError> {
        let package = &descriptor.package_name;
        let cache_err = |source| LoadError::Cache {
            package: package.clone(),
            source,
        };

        let remote = descriptor.remote.rewritten(&self.options.url_rewrites);
        let mut entry = self.cache.get_or_create_mirror(&remote).map_err(cache_err)?;
        let scopes = descriptor.tag_scopes();
        let cached_scope = pick_tag_scope(&entry.known_refs.tags, &scopes).map(str::to_string);
        let freshness = self
            .cache
            .ensure_fresh(&mut entry, &descriptor.selector, cached_scope.as_deref())
            .map_err(cache_err)?;

        let tag_prefix = pick_tag_scope(&entry.known_refs.tags, &scopes);
        log::debug!(
            "Resolving {} within tag scope '{}'",
            package,
            tag_prefix.unwrap_or("")
        );
        let ordered = semver_tags(&entry.known_refs.tags, tag_prefix);
        let outcome = match &descriptor.selector {
            RefSelector::Commit(rev) => match self.cache.find_commit(&entry, rev).map_err(cache_err)? {
                Some(commit) => Ok(ResolvedCommit {
                    commit,
                    ref_name: rev.clone(),
                }),
                None => Err(ResolveError::NotFound {
                    kind: "commit",
                    name: rev.clone(),
                }),
            },
            selector => resolve(
                selector,
                &entry.known_refs,
                &ordered,
                self.options.latest_policy,
            ),
        };
        match outcome {
            Ok(resolved) => Ok((entry, resolved)),
            Err(source) => match freshness.fetch_error {
                Some(message) => Err(LoadError::Cache {
                    package: package.clone(),
                    source: CacheError::Fetch {
                        key: entry.key.clone(),
                        message,
                    },
                }),
                None => Err(LoadError::Resolve {
                    package: package.clone(),
                    source,
                }),
            },
        }
    }

    /// Materialize one descriptor into its target directory.
    ///
    /// The target is replaced as a whole: readers see either the previous
    /// tree or the new one.
    pub fn load(&self, descriptor: &Descriptor) -> Result<LoadedPackage, LoadError> {
        let package = &descriptor.package_name;
        let (entry, resolved) = self.resolve_entry(descriptor)?;
        let target = self.target_for(descriptor);
        let export_err = |message: String| LoadError::Export {
            package: package.clone(),
            target: target.clone(),
            message,
        };

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| export_err(e.to_string()))?;
        }
        let staging = swap::create_staging_dir(&target).map_err(|e| export_err(e.to_string()))?;

        let exported = match self.cache.export_subtree(
            &entry,
            &resolved.commit,
            &descriptor.sub_path,
            &staging,
        ) {
            Ok(exported) => exported,
            Err(err) => {
                let _ = swap::remove_path(&staging);
                return Err(match err {
                    CacheError::PathNotFound { path, commit } => LoadError::PathNotFound {
                        package: package.clone(),
                        path,
                        commit,
                    },
                    CacheError::Export { message, .. } => export_err(message),
                    source => LoadError::Cache {
                        package: package.clone(),
                        source,
                    },
                });
            }
        };

        if let Err(e) = swap::replace_dir(&staging, &target) {
            let _ = swap::remove_path(&staging);
            return Err(export_err(e.to_string()));
        }

        self.record(descriptor, &entry.key, &target, &resolved);
        log::info!(
            "Loaded {} {} ({}) into {}",
            package,
            resolved.ref_name,
            resolved.short(),
            target.display()
        );

        let hook = self
            .hooks
            .run(descriptor, &target)
            .map_err(|message| LoadError::Hook {
                package: package.clone(),
                message,
            })?;

        Ok(LoadedPackage {
            target,
            resolved,
            files: exported.files,
            hook,
        })
    }

    /// [`Loader::load`] wrapped with the package name.
    pub fn load_result(&self, descriptor: &Descriptor) -> LoadResult {
        LoadResult {
            package_name: descriptor.package_name.clone(),
            outcome: self.load(descriptor),
        }
    }

    fn record(
        &self,
        descriptor: &Descriptor,
        key: &crate::types::RepoKey,
        target: &Path,
        resolved: &ResolvedCommit,
    ) {
        let record = LoadRecord {
            target: target.to_path_buf(),
            package_name: descriptor.package_name.clone(),
            key: key.clone(),
            sub_path: descriptor.sub_path.as_str().to_string(),
            commit: resolved.commit.clone(),
            ref_name: resolved.ref_name.clone(),
            selector: descriptor.selector.to_string(),
            loaded_at: now_unix(),
        };
        if let Err(err) = self.cache.state().record_load(&record) {
            log::warn!("Failed to record load of {}: {}", descriptor.package_name, err);
        }
    }
}
