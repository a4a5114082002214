//! Publishing a package from the user's work tree: commit, tag, push.

pub mod db_repo;
pub mod tag;

use semver::Version;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::{DEFAULT_LOCK_TIMEOUT, GitCli, GitError};
use crate::manifest::{ManifestError, ProjectMeta};
use crate::types::ParseError;
use crate::version::{self, BumpKind};

pub use db_repo::{DbRepoTarget, PublishResult};
pub use tag::{TagError, TagScheme, VersionTag, create_tag, delete_tag, list_version_tags};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("{} is not inside a git work tree", .0.display())]
    NotARepository(PathBuf),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error(transparent)]
    Metadata(#[from] ManifestError),
    #[error("no version to tag: pass one explicitly or set 'version' in pkg.json")]
    NoVersion,
    #[error("no pkg.json in {}", .0.display())]
    NoMetadata(PathBuf),
    #[error("pkg.json in {} has no 'db-repo'", .0.display())]
    NoDbRepo(PathBuf),
    #[error("invalid db-repo '{value}': {source}")]
    BadDbRepo {
        value: String,
        #[source]
        source: ParseError,
    },
    #[error("invalid root-dir '{value}': {source}")]
    BadRootDir {
        value: String,
        #[source]
        source: ParseError,
    },
    #[error("package '{0}' has no localDir to publish from")]
    NoLocalDir(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Local commit and tag exist; only the push has to be repeated.
    #[error(
        "push failed{}: {} (local state is ahead; retry the push)",
        .tag.as_deref().map(|t| format!(" for {}", t)).unwrap_or_default(),
        .source
    )]
    Push {
        tag: Option<String>,
        #[source]
        source: GitError,
    },
}

/// Where the release version comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionChoice {
    /// Bump the highest existing tag under the scheme.
    Bump(BumpKind),
    Exact(Version),
    /// The `version` field of the package's `pkg.json`.
    FromMetadata,
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Commit message; defaults to `Update {name} v{version}`.
    pub message: Option<String>,
    /// Commit pending changes under the package directory first.
    pub commit: bool,
    pub version: VersionChoice,
    pub tag: bool,
    pub tag_message: Option<String>,
    pub push: bool,
    pub force_tag: bool,
    pub marker: String,
    /// Overrides the prefix derived from `pkg.json`.
    pub tag_prefix: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            message: None,
            commit: true,
            version: VersionChoice::Bump(BumpKind::Patch),
            tag: true,
            tag_message: None,
            push: true,
            force_tag: false,
            marker: String::new(),
            tag_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// New commit, if there were changes to commit.
    pub commit: Option<String>,
    pub head: String,
    pub tag: Option<VersionTag>,
    pub pushed: bool,
}

/// Commits, tags and pushes packages living in a git work tree.
#[derive(Debug, Clone)]
pub struct Publisher {
    git: GitCli,
    remote: String,
    initial_version: Version,
    default_branch: String,
    lock_timeout: Duration,
    url_rewrites: BTreeMap<String, String>,
}

impl Publisher {
    pub fn new(
        remote: impl Into<String>,
        initial_version: Version,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            git: GitCli::for_worktree(),
            remote: remote.into(),
            initial_version,
            default_branch: default_branch.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            url_rewrites: BTreeMap::new(),
        }
    }

    pub fn with_git(mut self, git: GitCli) -> Self {
        self.git = git;
        self
    }

    /// How long to wait for a `db-repo` work tree held by another process.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// `domain -> base url` rewrites applied to `db-repo` URLs.
    pub fn with_url_rewrites(mut self, rewrites: BTreeMap<String, String>) -> Self {
        self.url_rewrites = rewrites;
        self
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn toplevel(&self, pkg_dir: &Path) -> Result<PathBuf, PublishError> {
        self.git.toplevel(pkg_dir).map_err(|e| match e {
            GitError::NotFound(_) => PublishError::NotARepository(pkg_dir.to_path_buf()),
            other => PublishError::Git(other),
        })
    }

    /// Tag scheme from an explicit prefix, else from package metadata.
    pub fn scheme(&self, meta: Option<&ProjectMeta>, options: &PublishOptions) -> TagScheme {
        match (&options.tag_prefix, meta) {
            (Some(prefix), _) => TagScheme::new(prefix.clone(), options.marker.clone()),
            (None, Some(meta)) => TagScheme::from_meta(meta, &self.default_branch, &options.marker),
            (None, None) => TagScheme::new("", options.marker.clone()),
        }
    }

    /// The version a release of `pkg_dir` would get.
    pub fn next_version(
        &self,
        pkg_dir: &Path,
        options: &PublishOptions,
    ) -> Result<Version, PublishError> {
        let root = self.toplevel(pkg_dir)?;
        let meta = ProjectMeta::read(pkg_dir)?;
        let scheme = self.scheme(meta.as_ref(), options);
        self.pick_version(&root, meta.as_ref(), &scheme, &options.version)
    }

    fn pick_version(
        &self,
        root: &Path,
        meta: Option<&ProjectMeta>,
        scheme: &TagScheme,
        choice: &VersionChoice,
    ) -> Result<Version, PublishError> {
        match choice {
            VersionChoice::Exact(v) => Ok(v.clone()),
            VersionChoice::Bump(kind) => {
                let existing = list_version_tags(&self.git, root, scheme)?;
                let versions: Vec<Version> =
                    existing.into_iter().filter_map(|t| t.version).collect();
                Ok(version::next_version(&versions, *kind, &self.initial_version))
            }
            VersionChoice::FromMetadata => meta
                .and_then(|m| m.version.as_deref())
                .and_then(version::parse_version_loose)
                .ok_or(PublishError::NoVersion),
        }
    }

    fn push_refs(&self, root: &Path, tag: Option<&str>, force_tag: bool) -> Result<(), PublishError> {
        let fail = |source| PublishError::Push {
            tag: tag.map(str::to_string),
            source,
        };
        self.git
            .push(root, &self.remote, &["HEAD"], false)
            .map_err(fail)?;
        if let Some(tag) = tag {
            let refspec = format!("refs/tags/{}", tag);
            self.git
                .push(root, &self.remote, &[refspec.as_str()], force_tag)
                .map_err(fail)?;
        }
        log::info!("Pushed to {}", self.remote);
        Ok(())
    }

    /// Commit pending changes under `pkg_dir`, tag the result and push.
    pub fn publish(
        &self,
        pkg_dir: &Path,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let root = self.toplevel(pkg_dir)?;
        let meta = ProjectMeta::read(pkg_dir)?;
        let scheme = self.scheme(meta.as_ref(), options);

        let release = if options.tag {
            Some(self.pick_version(&root, meta.as_ref(), &scheme, &options.version)?)
        } else {
            None
        };

        let mut commit = None;
        if options.commit {
            let pending = self.git.pending_changes(pkg_dir)?;
            if pending.is_empty() {
                log::info!("No changes to commit in {}", pkg_dir.display());
            } else {
                let message = match &options.message {
                    Some(message) => message.clone(),
                    None => default_commit_message(pkg_dir, meta.as_ref(), release.as_ref()),
                };
                let sha = self.git.commit_all(pkg_dir, &message)?;
                log::info!("Committed {} change(s) as {}", pending.len(), sha);
                commit = Some(sha);
            }
        }

        let tag = match &release {
            Some(version) => {
                let name = scheme.format(version);
                let message = options
                    .tag_message
                    .clone()
                    .unwrap_or_else(|| format!("Release {}", name));
                Some(create_tag(&self.git, &root, &name, &message, options.force_tag)?)
            }
            None => None,
        };

        let head = self
            .git
            .rev_parse_commit(&root, "HEAD")?
            .ok_or_else(|| GitError::ParseError("HEAD does not name a commit".to_string()))?;

        let pushed = if options.push {
            self.push_refs(&root, tag.as_ref().map(|t| t.name.as_str()), options.force_tag)?;
            true
        } else {
            false
        };

        Ok(PublishOutcome {
            commit,
            head,
            tag,
            pushed,
        })
    }

    /// Repeat only the push step of a publish that failed there.
    pub fn retry_push(&self, pkg_dir: &Path, tag: &str, force: bool) -> Result<(), PublishError> {
        let root = self.toplevel(pkg_dir)?;
        if !self.git.list_tags(&root)?.contains_key(tag) {
            return Err(TagError::Missing(tag.to_string()).into());
        }
        self.push_refs(&root, Some(tag), force)
    }

    /// Delete a tag locally and, with `on_remote`, on the configured remote.
    pub fn delete_tag(&self, pkg_dir: &Path, name: &str, on_remote: bool) -> Result<(), PublishError> {
        let root = self.toplevel(pkg_dir)?;
        let remote = on_remote.then_some(self.remote.as_str());
        delete_tag(&self.git, &root, name, remote)?;
        Ok(())
    }
}

fn default_commit_message(
    pkg_dir: &Path,
    meta: Option<&ProjectMeta>,
    release: Option<&Version>,
) -> String {
    let name = meta
        .and_then(|m| m.name.clone())
        .or_else(|| {
            pkg_dir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_else(|| "package".to_string());
    let version = release
        .map(Version::to_string)
        .or_else(|| meta.and_then(|m| m.version.clone()));
    match version {
        Some(version) => format!("Update {} v{}", name, version.trim_start_matches('v')),
        None => format!("Update {}", name),
    }
}
