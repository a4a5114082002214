//! Version tags: naming, creation and deletion.

use semver::Version;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::cache::{GitCli, GitError, TagDetails};
use crate::manifest::ProjectMeta;
use crate::version;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("tag '{0}' already exists (use force to replace it)")]
    Exists(String),
    #[error("tag '{0}' does not exist")]
    Missing(String),
    #[error(transparent)]
    Git(#[from] GitError),
}

/// How a package's version tags are spelled: `{prefix}{marker}{version}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagScheme {
    pub prefix: String,
    /// `""` or `"v"`.
    pub marker: String,
}

impl TagScheme {
    pub fn new(prefix: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            marker: marker.into(),
        }
    }

    /// Scheme for a package described by `meta`.
    pub fn from_meta(meta: &ProjectMeta, default_branch: &str, marker: &str) -> Self {
        Self::new(meta.tag_prefix(default_branch), marker)
    }

    pub fn format(&self, version: &Version) -> String {
        format!("{}{}{}", self.prefix, self.marker, version)
    }

    /// Version a tag name carries under this scheme. The marker is optional
    /// when parsing.
    pub fn parse(&self, name: &str) -> Option<Version> {
        version::parse_tag_version(name, Some(&self.prefix))
    }
}

/// A tag and the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTag {
    pub name: String,
    pub commit: String,
    /// Annotation subject.
    pub message: String,
    /// Unix seconds.
    pub created_at: Option<i64>,
    pub version: Option<Version>,
}

impl VersionTag {
    fn from_details(details: TagDetails, version: Option<Version>) -> Self {
        Self {
            name: details.name,
            commit: details.commit,
            message: details.subject,
            created_at: details.created_at,
            version,
        }
    }
}

/// Create an annotated tag at `HEAD` of the work tree containing `repo_dir`.
///
/// An existing tag of the same name is an error unless `force` is set, in
/// which case it is moved.
pub fn create_tag(
    git: &GitCli,
    repo_dir: &Path,
    name: &str,
    message: &str,
    force: bool,
) -> Result<VersionTag, TagError> {
    let existing = git.list_tags(repo_dir)?;
    if existing.contains_key(name) {
        if !force {
            return Err(TagError::Exists(name.to_string()));
        }
        log::info!("Replacing existing tag {}", name);
    }

    git.create_tag(repo_dir, name, message, force)?;
    let details = git
        .tag_details(repo_dir)?
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| GitError::ParseError(format!("tag {} does not name a commit", name)))?;
    log::info!("Created tag {} at {}", name, details.commit);

    let version = name.rsplit('/').next().and_then(version::parse_version_loose);
    Ok(VersionTag::from_details(details, version))
}

/// Delete a tag locally and, with `remote`, on that remote as well.
pub fn delete_tag(
    git: &GitCli,
    repo_dir: &Path,
    name: &str,
    remote: Option<&str>,
) -> Result<(), TagError> {
    let local = git.list_tags(repo_dir)?.contains_key(name);
    if !local && remote.is_none() {
        return Err(TagError::Missing(name.to_string()));
    }
    if local {
        git.delete_tag(repo_dir, name)?;
        log::info!("Deleted local tag {}", name);
    }
    if let Some(remote) = remote {
        let refspec = format!(":refs/tags/{}", name);
        git.push(repo_dir, remote, &[refspec.as_str()], false)?;
        log::info!("Deleted tag {} on {}", name, remote);
    }
    Ok(())
}

/// Tags that parse as versions under `scheme`, ascending.
pub fn list_version_tags(
    git: &GitCli,
    repo_dir: &Path,
    scheme: &TagScheme,
) -> Result<Vec<VersionTag>, TagError> {
    let mut details: BTreeMap<String, TagDetails> = git
        .tag_details(repo_dir)?
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect();
    let tags: BTreeMap<String, String> = details
        .values()
        .map(|t| (t.name.clone(), t.commit.clone()))
        .collect();
    Ok(version::semver_tags(&tags, Some(&scheme.prefix))
        .into_iter()
        .filter_map(|t| {
            details
                .remove(&t.name)
                .map(|d| VersionTag::from_details(d, Some(t.version)))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FixtureRepo, require_git};
    use tempfile::tempdir;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn scheme_formats_and_parses() {
        let scheme = TagScheme::new("packages/widgets/", "v");
        assert_eq!(scheme.format(&v("1.2.0")), "packages/widgets/v1.2.0");
        assert_eq!(scheme.parse("packages/widgets/v1.2.0"), Some(v("1.2.0")));
        assert_eq!(scheme.parse("packages/widgets/1.2.0"), Some(v("1.2.0")));
        assert_eq!(scheme.parse("packages/other/1.2.0"), None);
        assert_eq!(scheme.parse("packages/widgets/beta/1.2.0"), None);

        let plain = TagScheme::default();
        assert_eq!(plain.format(&v("0.1.0")), "0.1.0");
        assert_eq!(plain.parse("v0.1.0"), Some(v("0.1.0")));
    }

    #[test]
    fn scheme_from_meta_adds_branch_off_default() {
        let meta = ProjectMeta {
            root_dir: Some("packages/widgets".into()),
            branch: Some("beta".into()),
            ..ProjectMeta::default()
        };
        let scheme = TagScheme::from_meta(&meta, "main", "");
        assert_eq!(scheme.format(&v("2.0.0")), "packages/widgets/beta/2.0.0");
    }

    fn work_tree() -> (tempfile::TempDir, FixtureRepo) {
        let dir = tempdir().unwrap();
        let repo = FixtureRepo::init(&dir.path().join("work"));
        repo.write("README", "one");
        repo.commit("initial");
        (dir, repo)
    }

    #[test]
    fn create_tag_without_force_refuses_existing() {
        if !require_git() {
            return;
        }
        let (_dir, repo) = work_tree();
        let git = GitCli::for_worktree();

        let before = crate::state::now_unix();
        let first = create_tag(&git, &repo.dir, "1.0.0", "Release 1.0.0", false).unwrap();
        assert_eq!(first.commit, repo.head());
        assert_eq!(first.version, Some(v("1.0.0")));
        assert_eq!(first.message, "Release 1.0.0");
        let created = first.created_at.unwrap();
        assert!(created >= before - 5 && created <= crate::state::now_unix() + 5);

        repo.write("README", "two");
        repo.commit("second");
        let err = create_tag(&git, &repo.dir, "1.0.0", "again", false).unwrap_err();
        assert!(matches!(err, TagError::Exists(ref name) if name == "1.0.0"));
        assert_eq!(git.list_tags(&repo.dir).unwrap()["1.0.0"], first.commit);
    }

    #[test]
    fn create_tag_with_force_moves_it() {
        if !require_git() {
            return;
        }
        let (_dir, repo) = work_tree();
        let git = GitCli::for_worktree();
        let first = create_tag(&git, &repo.dir, "1.0.0", "Release 1.0.0", false).unwrap();

        repo.write("README", "two");
        let second_commit = repo.commit("second");
        let moved = create_tag(&git, &repo.dir, "1.0.0", "Release 1.0.0", true).unwrap();
        assert_ne!(moved.commit, first.commit);
        assert_eq!(moved.commit, second_commit);
    }

    #[test]
    fn list_and_delete_tags() {
        if !require_git() {
            return;
        }
        let (_dir, repo) = work_tree();
        let git = GitCli::for_worktree();
        let scheme = TagScheme::new("pkg/", "");
        for name in ["pkg/1.1.0", "pkg/0.9.0", "other/5.0.0", "nightly"] {
            create_tag(&git, &repo.dir, name, &format!("Release {name}"), false).unwrap();
        }

        let listed = list_version_tags(&git, &repo.dir, &scheme).unwrap();
        let names: Vec<_> = listed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["pkg/0.9.0", "pkg/1.1.0"]);
        assert_eq!(listed[0].message, "Release pkg/0.9.0");
        assert_eq!(listed[1].version, Some(v("1.1.0")));
        assert_eq!(listed[1].commit, repo.head());
        assert!(listed.iter().all(|t| t.created_at.is_some()));

        delete_tag(&git, &repo.dir, "pkg/1.1.0", None).unwrap();
        assert!(!git.list_tags(&repo.dir).unwrap().contains_key("pkg/1.1.0"));
        assert!(matches!(
            delete_tag(&git, &repo.dir, "pkg/1.1.0", None),
            Err(TagError::Missing(_))
        ));
    }
}
