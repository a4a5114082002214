//! Publishing into the repository a package's `pkg.json` names as `db-repo`.
//!
//! The package directory is copied into a cached work tree of that repository
//! at `root-dir`, then committed, tagged and pushed from there.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{PublishError, PublishOptions, PublishOutcome, Publisher, VersionChoice};
use crate::cache::{CachePaths, RepoLock, swap};
use crate::manifest::{Manifest, PACKAGE_MANIFEST, ProjectMeta};
use crate::types::{Remote, SubPath, resolve_against};

/// Where a package lands inside its `db-repo` work tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRepoTarget {
    pub remote: Remote,
    pub branch: String,
    /// Cached work tree of the repository.
    pub checkout: PathBuf,
    /// `checkout` joined with `root-dir`.
    pub package_dir: PathBuf,
}

/// Outcome of publishing one package of a manifest.
#[derive(Debug)]
pub struct PublishResult {
    pub package_name: String,
    pub outcome: Result<PublishOutcome, PublishError>,
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl Publisher {
    /// Work tree and package directory `pkg_dir` publishes into.
    pub fn db_repo_target(
        &self,
        pkg_dir: &Path,
        paths: &CachePaths,
    ) -> Result<DbRepoTarget, PublishError> {
        let meta = ProjectMeta::read(pkg_dir)?
            .ok_or_else(|| PublishError::NoMetadata(pkg_dir.to_path_buf()))?;
        let url = meta
            .db_repo
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| PublishError::NoDbRepo(pkg_dir.to_path_buf()))?;
        let remote: Remote = url.parse().map_err(|source| PublishError::BadDbRepo {
            value: url.to_string(),
            source,
        })?;
        let root_dir = meta.root_dir.as_deref().unwrap_or("");
        let sub_path: SubPath = root_dir.parse().map_err(|source| PublishError::BadRootDir {
            value: root_dir.to_string(),
            source,
        })?;

        let branch = meta
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.default_branch)
            .to_string();
        let remote = remote.rewritten(&self.url_rewrites);
        let checkout = paths.checkout_dir(&remote.key);
        let package_dir = if sub_path.is_root() {
            checkout.clone()
        } else {
            checkout.join(sub_path.as_path())
        };
        Ok(DbRepoTarget {
            remote,
            branch,
            checkout,
            package_dir,
        })
    }

    /// Copy `pkg_dir` into its `db-repo` at `root-dir`, then commit, tag and
    /// push from the cached work tree.
    pub fn publish_to_db_repo(
        &self,
        pkg_dir: &Path,
        paths: &CachePaths,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let target = self.db_repo_target(pkg_dir, paths)?;
        let _lock = RepoLock::acquire_with_timeout(
            &paths.checkout_lock_path(&target.remote.key),
            self.lock_timeout,
        )?;

        self.sync_checkout(&target)?;
        let copied = replace_package_dir(pkg_dir, &target.package_dir)?;
        log::info!(
            "Copied {} files from {} into {}",
            copied,
            pkg_dir.display(),
            target.package_dir.display()
        );

        self.in_checkout().publish(&target.package_dir, options)
    }

    /// Repeat the push of a `db-repo` publish that failed there.
    pub fn retry_push_in_db_repo(
        &self,
        target: &DbRepoTarget,
        tag: &str,
        force: bool,
    ) -> Result<(), PublishError> {
        self.in_checkout().retry_push(&target.package_dir, tag, force)
    }

    fn in_checkout(&self) -> Publisher {
        Publisher {
            remote: "origin".to_string(),
            ..self.clone()
        }
    }

    /// Clone or fetch the work tree, then check out the package's branch at
    /// its remote tip.
    fn sync_checkout(&self, target: &DbRepoTarget) -> Result<(), PublishError> {
        let checkout = &target.checkout;
        if checkout.join(".git").is_dir() {
            log::info!("Fetching {} into {}", target.remote.key, checkout.display());
            self.git.fetch_worktree(checkout)?;
        } else {
            swap::remove_path(checkout)?;
            log::info!("Cloning {} into {}", target.remote.url, checkout.display());
            self.git.clone_worktree(&target.remote.url, checkout)?;
        }

        let upstream = format!("refs/remotes/origin/{}", target.branch);
        if self.git.rev_parse_commit(checkout, &upstream)?.is_some() {
            self.git
                .checkout_branch(checkout, &target.branch, Some(&upstream))?;
        } else if self.git.rev_parse_commit(checkout, "HEAD")?.is_some() {
            log::info!("Creating branch {} in {}", target.branch, target.remote.key);
            self.git.checkout_branch(checkout, &target.branch, None)?;
        } else {
            self.git.set_unborn_branch(checkout, &target.branch)?;
        }
        Ok(())
    }

    /// Publish every package of `manifest` that has a local directory, in
    /// manifest order. With `only`, packages not named there are skipped.
    ///
    /// When the version comes from metadata, packages without a `version`
    /// are committed and pushed but not tagged.
    pub fn publish_manifest(
        &self,
        manifest: &Manifest,
        project_root: &Path,
        only: Option<&[String]>,
        paths: &CachePaths,
        options: &PublishOptions,
    ) -> Vec<PublishResult> {
        manifest
            .dependencies
            .iter()
            .filter(|d| only.is_none_or(|names| names.iter().any(|n| *n == d.package_name)))
            .map(|descriptor| {
                let outcome = match &descriptor.local_target {
                    None => Err(PublishError::NoLocalDir(descriptor.package_name.clone())),
                    Some(dir) => {
                        let dir = resolve_against(project_root, dir);
                        self.publish_local_dir(&dir, paths, options)
                    }
                };
                match &outcome {
                    Ok(_) => log::info!("Published {}", descriptor.package_name),
                    Err(err) => log::warn!("Publishing {} failed: {}", descriptor.package_name, err),
                }
                PublishResult {
                    package_name: descriptor.package_name.clone(),
                    outcome,
                }
            })
            .collect()
    }

    fn publish_local_dir(
        &self,
        dir: &Path,
        paths: &CachePaths,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        if !dir.join(PACKAGE_MANIFEST).is_file() {
            return Err(PublishError::NoMetadata(dir.to_path_buf()));
        }
        let versioned = ProjectMeta::read(dir)?
            .and_then(|meta| meta.version)
            .is_some_and(|v| !v.trim().is_empty());
        let mut options = options.clone();
        if options.version == VersionChoice::FromMetadata && !versioned {
            options.tag = false;
        }
        self.publish_to_db_repo(dir, paths, &options)
    }
}

/// Replace `dest` with a copy of `src`. `.git` entries on either side are
/// left alone. Returns the number of files copied.
fn replace_package_dir(src: &Path, dest: &Path) -> io::Result<usize> {
    if dest.exists() {
        for entry in std::fs::read_dir(dest)? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            swap::remove_path(&entry.path())?;
        }
    }
    std::fs::create_dir_all(dest)?;

    let mut copied = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let to = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&to)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::copy(from, to).map(|_| ())
}
