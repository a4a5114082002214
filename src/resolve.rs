//! Version resolution: turn a ref selector into one concrete commit.
//!
//! Resolution is pure. It only looks at the refs a mirror already knows
//! about; refreshing those refs is the cache's job.

use semver::VersionReq;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::version::{self, SemverTag};

/// Errors returned by resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A named tag or branch is not known to the mirror.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    /// "latest" was requested but the repository has no version tags and no
    /// default branch.
    #[error("repository has no version tags and no default branch")]
    NoVersions,
    /// No version tag satisfies the requirement.
    #[error("no version tag satisfies '{requirement}'")]
    NoMatch { requirement: String },
    /// The version text could not be understood.
    #[error("invalid version selector '{text}': {reason}")]
    InvalidSelector { text: String, reason: String },
}

/// What a dependency asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSelector {
    /// An exact tag; `1.2.3` and `v1.2.3` match each other.
    Tag(String),
    /// The tip of a branch.
    Branch(String),
    /// The newest release (see [`LatestPolicy`]).
    Latest,
    /// The highest version tag satisfying a requirement.
    Range(VersionReq),
    /// The tip of the remote's default branch.
    DefaultBranch,
    /// A commit id, full or abbreviated (6 to 40 hex digits).
    Commit(String),
}

/// Whether `text` reads as an abbreviated or full commit id.
pub fn is_commit_id(text: &str) -> bool {
    (6..=40).contains(&text.len()) && text.chars().all(|c| c.is_ascii_hexdigit())
}

impl RefSelector {
    /// Interpret free-form version text from a manifest or the command line.
    ///
    /// `latest` selects [`RefSelector::Latest`]; text that starts with a
    /// comparison operator (or lists several comparators) is a range; 6 to 40
    /// hex digits pin a commit; anything else names a tag.
    pub fn from_version_text(text: &str) -> Result<Self, ResolveError> {
        let t = text.trim();
        if t.is_empty() {
            return Err(ResolveError::InvalidSelector {
                text: text.to_string(),
                reason: "empty".to_string(),
            });
        }
        if t.eq_ignore_ascii_case("latest") {
            return Ok(RefSelector::Latest);
        }
        if version::looks_like_requirement(t) {
            return version::parse_requirement(t)
                .map(RefSelector::Range)
                .map_err(|e| ResolveError::InvalidSelector {
                    text: t.to_string(),
                    reason: e.to_string(),
                });
        }
        if is_commit_id(t) {
            return Ok(RefSelector::Commit(t.to_ascii_lowercase()));
        }
        Ok(RefSelector::Tag(t.to_string()))
    }

    /// Selector for explicit `version`/`tag`/`branch` choices, in that order
    /// of precedence. With none of them, the default branch is used, the same
    /// as a manifest entry without a ref.
    pub fn from_flags(
        version: Option<&str>,
        tag: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Self, ResolveError> {
        fn given(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }
        match (given(version), given(tag), given(branch)) {
            (Some(version), _, _) => Self::from_version_text(version),
            (None, Some(tag), _) => Ok(RefSelector::Tag(tag.to_string())),
            (None, None, Some(branch)) => Ok(RefSelector::Branch(branch.to_string())),
            (None, None, None) => Ok(RefSelector::DefaultBranch),
        }
    }

    /// Whether the selector names a ref that can move without its name
    /// changing.
    pub fn is_moving(&self) -> bool {
        matches!(self, RefSelector::Branch(_) | RefSelector::DefaultBranch)
    }
}

impl fmt::Display for RefSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefSelector::Tag(tag) => write!(f, "tag {}", tag),
            RefSelector::Branch(branch) => write!(f, "branch {}", branch),
            RefSelector::Latest => write!(f, "latest"),
            RefSelector::Range(req) => write!(f, "{}", req),
            RefSelector::DefaultBranch => write!(f, "default branch"),
            RefSelector::Commit(commit) => write!(f, "commit {}", commit),
        }
    }
}

/// What "latest" means when a repository has both version tags and a default
/// branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LatestPolicy {
    /// Highest version tag; the default branch only when there are no tags.
    #[default]
    HighestTag,
    /// Default-branch tip; the highest tag only when there is no default branch.
    DefaultBranch,
}

/// Refs a mirror knows about, as of its last fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownRefs {
    /// Tag name -> peeled commit.
    pub tags: BTreeMap<String, String>,
    /// Branch name -> commit.
    pub branches: BTreeMap<String, String>,
    /// Branch `HEAD` points at, if any.
    pub default_branch: Option<String>,
}

impl KnownRefs {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.branches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len() + self.branches.len()
    }

    /// Whether resolving `selector` can succeed without new refs. Version tags
    /// are matched within `tag_prefix`.
    pub fn contains(&self, selector: &RefSelector, tag_prefix: Option<&str>) -> bool {
        match selector {
            RefSelector::Tag(tag) => {
                self.find_tag(tag, &[]).is_some() || self.has_version(tag, tag_prefix)
            }
            RefSelector::Branch(branch) => self.branches.contains_key(branch),
            RefSelector::DefaultBranch => self.default_tip().is_some(),
            RefSelector::Commit(commit) => self.find_tip(commit).is_some(),
            RefSelector::Latest | RefSelector::Range(_) => false,
        }
    }

    fn has_version(&self, tag: &str, prefix: Option<&str>) -> bool {
        match version::parse_version_loose(tag) {
            Some(wanted) => self
                .tags
                .keys()
                .filter_map(|name| version::parse_tag_version(name, prefix))
                .any(|v| v == wanted),
            None => false,
        }
    }

    fn default_tip(&self) -> Option<(&str, &str)> {
        let name = self.default_branch.as_deref()?;
        self.branches
            .get(name)
            .map(|commit| (name, commit.as_str()))
    }

    /// A branch or tag tip whose id starts with `commit`.
    fn find_tip(&self, commit: &str) -> Option<&str> {
        let commit = commit.to_ascii_lowercase();
        self.branches
            .values()
            .chain(self.tags.values())
            .find(|tip| tip.starts_with(&commit))
            .map(String::as_str)
    }

    fn find_tag<'a>(&'a self, tag: &str, ordered: &'a [SemverTag]) -> Option<(&'a str, &'a str)> {
        if let Some((name, commit)) = self.tags.get_key_value(tag) {
            return Some((name.as_str(), commit.as_str()));
        }
        let wanted = version::parse_version_loose(tag)?;
        ordered
            .iter()
            .rev()
            .find(|t| t.version == wanted)
            .map(|t| (t.name.as_str(), t.commit.as_str()))
    }
}

/// Output of resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommit {
    /// Full commit id.
    pub commit: String,
    /// The tag or branch the commit was reached through.
    pub ref_name: String,
}

impl ResolvedCommit {
    fn new(ref_name: &str, commit: &str) -> Self {
        Self {
            commit: commit.to_string(),
            ref_name: ref_name.to_string(),
        }
    }

    /// Abbreviated commit id for display.
    pub fn short(&self) -> &str {
        if self.commit.len() > 12 {
            &self.commit[..12]
        } else {
            &self.commit
        }
    }
}

/// Resolve `selector` against `refs`.
///
/// `ordered` must be the version tags of `refs` in ascending precedence, as
/// returned by [`version::semver_tags`].
pub fn resolve(
    selector: &RefSelector,
    refs: &KnownRefs,
    ordered: &[SemverTag],
    policy: LatestPolicy,
) -> Result<ResolvedCommit, ResolveError> {
    match selector {
        RefSelector::Tag(tag) => refs
            .find_tag(tag, ordered)
            .map(|(name, commit)| ResolvedCommit::new(name, commit))
            .ok_or_else(|| ResolveError::NotFound {
                kind: "tag",
                name: tag.clone(),
            }),
        RefSelector::Branch(branch) => refs
            .branches
            .get(branch)
            .map(|commit| ResolvedCommit::new(branch, commit))
            .ok_or_else(|| ResolveError::NotFound {
                kind: "branch",
                name: branch.clone(),
            }),
        RefSelector::DefaultBranch => refs
            .default_tip()
            .map(|(name, commit)| ResolvedCommit::new(name, commit))
            .ok_or_else(|| ResolveError::NotFound {
                kind: "branch",
                name: refs
                    .default_branch
                    .clone()
                    .unwrap_or_else(|| "HEAD".to_string()),
            }),
        RefSelector::Latest => {
            let highest = ordered
                .last()
                .map(|t| ResolvedCommit::new(&t.name, &t.commit));
            let tip = refs
                .default_tip()
                .map(|(name, commit)| ResolvedCommit::new(name, commit));
            let picked = match policy {
                LatestPolicy::HighestTag => highest.or(tip),
                LatestPolicy::DefaultBranch => tip.or(highest),
            };
            picked.ok_or(ResolveError::NoVersions)
        }
        RefSelector::Commit(commit) => refs
            .find_tip(commit)
            .map(|tip| ResolvedCommit::new(commit, tip))
            .ok_or_else(|| ResolveError::NotFound {
                kind: "commit",
                name: commit.clone(),
            }),
        RefSelector::Range(req) => ordered
            .iter()
            .rev()
            .find(|t| req.matches(&t.version))
            .map(|t| ResolvedCommit::new(&t.name, &t.commit))
            .ok_or_else(|| ResolveError::NoMatch {
                requirement: req.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::semver_tags;

    fn sha(n: u8) -> String {
        format!("{:02x}", n).repeat(20)
    }

    fn known(tags: &[(&str, u8)], branches: &[(&str, u8)], default: Option<&str>) -> KnownRefs {
        KnownRefs {
            tags: tags.iter().map(|(n, c)| (n.to_string(), sha(*c))).collect(),
            branches: branches
                .iter()
                .map(|(n, c)| (n.to_string(), sha(*c)))
                .collect(),
            default_branch: default.map(str::to_string),
        }
    }

    fn run(selector: &RefSelector, refs: &KnownRefs, policy: LatestPolicy) -> Result<ResolvedCommit, ResolveError> {
        let ordered = semver_tags(&refs.tags, None);
        resolve(selector, refs, &ordered, policy)
    }

    #[test]
    fn exact_tag() {
        let refs = known(&[("v1.0.0", 1), ("v1.1.0", 2)], &[], None);
        let resolved = run(&RefSelector::Tag("v1.1.0".into()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.commit, sha(2));
        assert_eq!(resolved.ref_name, "v1.1.0");
    }

    #[test]
    fn exact_tag_is_deterministic() {
        let refs = known(&[("1.0.0", 1), ("2.0.0", 2)], &[("main", 3)], Some("main"));
        let selector = RefSelector::Tag("1.0.0".into());
        let first = run(&selector, &refs, LatestPolicy::HighestTag).unwrap();
        let second = run(&selector, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exact_tag_normalizes_marker() {
        let refs = known(&[("v1.2.3", 7)], &[], None);
        let resolved = run(&RefSelector::Tag("1.2.3".into()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.commit, sha(7));
        assert_eq!(resolved.ref_name, "v1.2.3");

        let refs = known(&[("1.2.3", 8)], &[], None);
        let resolved = run(&RefSelector::Tag("v1.2.3".into()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.commit, sha(8));
    }

    #[test]
    fn non_semver_tag_is_exact_target() {
        let refs = known(&[("nightly", 4), ("1.0.0", 1)], &[], None);
        let resolved = run(&RefSelector::Tag("nightly".into()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.commit, sha(4));
        let latest = run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(latest.ref_name, "1.0.0");
    }

    #[test]
    fn missing_tag() {
        let refs = known(&[("1.0.0", 1)], &[], None);
        let err = run(&RefSelector::Tag("9.9.9".into()), &refs, LatestPolicy::HighestTag).unwrap_err();
        assert_eq!(
            err,
            ResolveError::NotFound {
                kind: "tag",
                name: "9.9.9".into()
            }
        );
    }

    #[test]
    fn branch() {
        let refs = known(&[], &[("main", 1), ("dev", 2)], Some("main"));
        let resolved = run(&RefSelector::Branch("dev".into()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.commit, sha(2));
        assert!(matches!(
            run(&RefSelector::Branch("gone".into()), &refs, LatestPolicy::HighestTag),
            Err(ResolveError::NotFound { kind: "branch", .. })
        ));
    }

    #[test]
    fn latest_ignores_creation_order() {
        // BTreeMap order is irrelevant; precedence decides.
        let refs = known(&[("1.0.0", 1), ("2.0.0", 2), ("1.5.0", 3)], &[("main", 9)], Some("main"));
        let resolved = run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "2.0.0");
        assert_eq!(resolved.commit, sha(2));
    }

    #[test]
    fn latest_prefers_release_over_prerelease() {
        let refs = known(&[("2.0.0-rc.1", 1), ("1.9.0", 2)], &[], None);
        let resolved = run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "2.0.0-rc.1");

        let refs = known(&[("2.0.0-rc.1", 1), ("2.0.0", 3)], &[], None);
        let resolved = run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "2.0.0");
    }

    #[test]
    fn latest_falls_back_to_default_branch() {
        let refs = known(&[("nightly", 1)], &[("main", 5)], Some("main"));
        let resolved = run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "main");
        assert_eq!(resolved.commit, sha(5));
    }

    #[test]
    fn latest_without_anything() {
        let refs = known(&[], &[("feature", 1)], None);
        assert_eq!(
            run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag),
            Err(ResolveError::NoVersions)
        );
        assert_eq!(
            run(&RefSelector::Latest, &refs, LatestPolicy::DefaultBranch),
            Err(ResolveError::NoVersions)
        );
    }

    #[test]
    fn latest_policy_decides_when_tag_and_branch_disagree() {
        let refs = known(&[("1.0.0", 1)], &[("main", 2)], Some("main"));
        let by_tag = run(&RefSelector::Latest, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(by_tag.commit, sha(1));
        let by_branch = run(&RefSelector::Latest, &refs, LatestPolicy::DefaultBranch).unwrap();
        assert_eq!(by_branch.commit, sha(2));
        assert_eq!(by_branch.ref_name, "main");
    }

    #[test]
    fn default_branch_policy_falls_back_to_tags() {
        let refs = known(&[("1.0.0", 1), ("1.1.0", 2)], &[], None);
        let resolved = run(&RefSelector::Latest, &refs, LatestPolicy::DefaultBranch).unwrap();
        assert_eq!(resolved.ref_name, "1.1.0");
    }

    #[test]
    fn range_picks_highest_match() {
        let refs = known(&[("0.9.0", 1), ("1.0.0", 2), ("1.4.2", 3), ("2.0.0", 4)], &[], None);
        let selector = RefSelector::from_version_text(">=1.0.0, <2.0.0").unwrap();
        let resolved = run(&selector, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "1.4.2");

        let selector = RefSelector::from_version_text(">=1.0.0").unwrap();
        let resolved = run(&selector, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "2.0.0");
    }

    #[test]
    fn range_without_match() {
        let refs = known(&[("1.0.0", 1)], &[], None);
        let selector = RefSelector::from_version_text(">=3").unwrap();
        assert!(matches!(
            run(&selector, &refs, LatestPolicy::HighestTag),
            Err(ResolveError::NoMatch { .. })
        ));
    }

    #[test]
    fn equal_commits_resolve_identically() {
        let refs = known(&[("v1.0.0", 1), ("stable", 1)], &[], None);
        let a = run(&RefSelector::Tag("v1.0.0".into()), &refs, LatestPolicy::HighestTag).unwrap();
        let b = run(&RefSelector::Tag("stable".into()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(a.commit, b.commit);
    }

    #[test]
    fn default_branch_selector() {
        let refs = known(&[], &[("trunk", 6)], Some("trunk"));
        let resolved = run(&RefSelector::DefaultBranch, &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.ref_name, "trunk");
        let empty = KnownRefs::default();
        assert!(run(&RefSelector::DefaultBranch, &empty, LatestPolicy::HighestTag).is_err());
    }

    #[test]
    fn version_text() {
        assert_eq!(RefSelector::from_version_text("latest").unwrap(), RefSelector::Latest);
        assert_eq!(RefSelector::from_version_text("LATEST").unwrap(), RefSelector::Latest);
        assert_eq!(
            RefSelector::from_version_text("v1.2.0").unwrap(),
            RefSelector::Tag("v1.2.0".into())
        );
        assert!(matches!(
            RefSelector::from_version_text("^1.2").unwrap(),
            RefSelector::Range(_)
        ));
        assert!(RefSelector::from_version_text(">=banana").is_err());
        assert!(RefSelector::from_version_text("  ").is_err());
    }

    #[test]
    fn flags_default_to_the_default_branch() {
        assert_eq!(
            RefSelector::from_flags(None, None, None).unwrap(),
            RefSelector::DefaultBranch
        );
        assert_eq!(
            RefSelector::from_flags(Some(" "), None, Some("dev")).unwrap(),
            RefSelector::Branch("dev".into())
        );
        assert_eq!(
            RefSelector::from_flags(None, Some("v1.0.0"), Some("dev")).unwrap(),
            RefSelector::Tag("v1.0.0".into())
        );
        assert_eq!(
            RefSelector::from_flags(Some("latest"), Some("v1.0.0"), None).unwrap(),
            RefSelector::Latest
        );
        assert!(matches!(
            RefSelector::from_flags(Some("^1.2"), None, None).unwrap(),
            RefSelector::Range(_)
        ));
    }

    #[test]
    fn commit_ids_pin_a_commit() {
        assert_eq!(
            RefSelector::from_version_text("A1B2C3D").unwrap(),
            RefSelector::Commit("a1b2c3d".into())
        );
        assert_eq!(
            RefSelector::from_version_text(&sha(3)).unwrap(),
            RefSelector::Commit(sha(3))
        );
        // Too short, too long, or not hex: a tag name.
        assert_eq!(
            RefSelector::from_version_text("abc12").unwrap(),
            RefSelector::Tag("abc12".into())
        );
        assert!(matches!(
            RefSelector::from_version_text(&"a".repeat(41)).unwrap(),
            RefSelector::Tag(_)
        ));
        assert!(matches!(
            RefSelector::from_version_text("release").unwrap(),
            RefSelector::Tag(_)
        ));
        assert!(!RefSelector::Commit(sha(1)).is_moving());
    }

    #[test]
    fn commit_resolves_against_known_tips() {
        let refs = known(&[("1.0.0", 1)], &[("main", 2)], Some("main"));
        let resolved = run(&RefSelector::Commit(sha(2)[..8].to_string()), &refs, LatestPolicy::HighestTag).unwrap();
        assert_eq!(resolved.commit, sha(2));
        assert_eq!(resolved.ref_name, sha(2)[..8]);
        assert!(refs.contains(&RefSelector::Commit(sha(1)), None));
        assert!(matches!(
            run(&RefSelector::Commit("abcdef".into()), &refs, LatestPolicy::HighestTag),
            Err(ResolveError::NotFound { kind: "commit", .. })
        ));
    }

    #[test]
    fn contains_drives_freshness() {
        let refs = known(&[("v1.0.0", 1)], &[("main", 2)], Some("main"));
        assert!(refs.contains(&RefSelector::Tag("v1.0.0".into()), None));
        assert!(refs.contains(&RefSelector::Tag("1.0.0".into()), None));
        assert!(!refs.contains(&RefSelector::Tag("1.1.0".into()), None));
        assert!(refs.contains(&RefSelector::Branch("main".into()), None));
        assert!(refs.contains(&RefSelector::DefaultBranch, None));
        assert!(!refs.contains(&RefSelector::Latest, None));
        assert!(!refs.contains(&RefSelector::Range(VersionReq::STAR), None));

        let scoped = known(&[("core/1.0.0", 1)], &[], None);
        assert!(scoped.contains(&RefSelector::Tag("1.0.0".into()), Some("core/")));
        assert!(!scoped.contains(&RefSelector::Tag("1.0.0".into()), None));
    }
}
