//! Semantic-version handling for tag names.
//!
//! Tags are compared after stripping an optional scope prefix (`pkg/` or
//! `pkg/branch/`) and one leading `v`. Tags that do not parse are left out of
//! every ordering but can still be targeted by exact name.

use semver::{BuildMetadata, Prerelease, Version, VersionReq};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Parse `1.2.3` or `v1.2.3`.
pub fn parse_version_loose(raw: &str) -> Option<Version> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    let t = t
        .strip_prefix('v')
        .or_else(|| t.strip_prefix('V'))
        .unwrap_or(t);
    Version::parse(t).ok()
}

/// Version encoded in a tag name, if the tag belongs to `prefix`.
pub fn parse_tag_version(name: &str, prefix: Option<&str>) -> Option<Version> {
    let rest = match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => name.strip_prefix(prefix)?,
        None => name,
    };
    if rest.contains('/') {
        return None;
    }
    parse_version_loose(rest)
}

/// First scope in `scopes` under which `tags` hold a version tag, else the
/// last scope. `None` is the unscoped namespace.
pub fn pick_tag_scope<'a>(
    tags: &BTreeMap<String, String>,
    scopes: &'a [Option<String>],
) -> Option<&'a str> {
    scopes
        .iter()
        .find(|scope| {
            tags.keys()
                .any(|name| parse_tag_version(name, scope.as_deref()).is_some())
        })
        .or(scopes.last())
        .and_then(|scope| scope.as_deref())
}

fn is_semver_boundary(ch: char) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, ',' | '<' | '>' | '=' | '^' | '~')
}

/// Rewrite common requirement spellings into the form `semver` parses:
/// `v` before a version is dropped, `==` becomes `=` and `~=` becomes `~`.
fn normalize_requirement(raw: &str) -> String {
    let raw = raw.trim().replace("==", "=").replace("~=", "~");
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(chars.len());
    for (i, &ch) in chars.iter().enumerate() {
        if (ch == 'v' || ch == 'V')
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && (i == 0 || is_semver_boundary(chars[i - 1]))
        {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Parse a version requirement such as `>=1.0.0, <2`, `^1.4` or `v2.0.0`.
/// A bare version means exactly that version.
pub fn parse_requirement(raw: &str) -> Result<VersionReq, semver::Error> {
    if let Some(version) = parse_version_loose(raw) {
        return VersionReq::parse(&format!("={}", version));
    }
    VersionReq::parse(&normalize_requirement(raw))
}

/// True if the text reads as a requirement rather than a tag name.
pub fn looks_like_requirement(raw: &str) -> bool {
    let t = raw.trim();
    t.starts_with(['<', '>', '=', '^', '~', '*']) || t.contains(',')
}

/// A tag whose name parsed as a semantic version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemverTag {
    pub version: Version,
    pub name: String,
    pub commit: String,
}

/// Tags (name -> commit) that parse as versions under `prefix`, sorted
/// ascending by precedence, then by name.
pub fn semver_tags(tags: &BTreeMap<String, String>, prefix: Option<&str>) -> Vec<SemverTag> {
    let mut out: Vec<SemverTag> = tags
        .iter()
        .filter_map(|(name, commit)| {
            parse_tag_version(name, prefix).map(|version| SemverTag {
                version,
                name: name.clone(),
                commit: commit.clone(),
            })
        })
        .collect();
    out.sort_by(|a, b| {
        a.version
            .cmp_precedence(&b.version)
            .then_with(|| a.name.cmp(&b.name))
    });
    out
}

/// Which component of the version to increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
}

impl BumpKind {
    pub fn apply(self, version: &Version) -> Version {
        let mut next = match self {
            BumpKind::Major => Version::new(version.major + 1, 0, 0),
            BumpKind::Minor => Version::new(version.major, version.minor + 1, 0),
            BumpKind::Patch => Version::new(version.major, version.minor, version.patch + 1),
        };
        next.pre = Prerelease::EMPTY;
        next.build = BuildMetadata::EMPTY;
        next
    }
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BumpKind::Major => "major",
            BumpKind::Minor => "minor",
            BumpKind::Patch => "patch",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BumpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" => Ok(BumpKind::Major),
            "minor" => Ok(BumpKind::Minor),
            "patch" => Ok(BumpKind::Patch),
            other => Err(format!("unknown bump kind '{}'", other)),
        }
    }
}

/// Next version after the highest of `existing`, or `initial` when there is
/// none.
pub fn next_version<'a>(
    existing: impl IntoIterator<Item = &'a Version>,
    bump: BumpKind,
    initial: &Version,
) -> Version {
    match existing.into_iter().max_by(|a, b| a.cmp_precedence(b)) {
        Some(highest) => bump.apply(highest),
        None => initial.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn tag_map(names: &[&str]) -> BTreeMap<String, String> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), format!("{:040x}", i)))
            .collect()
    }

    #[test]
    fn parse_version_loose_strips_marker() {
        assert_eq!(parse_version_loose("v1.2.3"), Some(v("1.2.3")));
        assert_eq!(parse_version_loose("V1.2.3"), Some(v("1.2.3")));
        assert_eq!(parse_version_loose("1.2.3-rc.1"), Some(v("1.2.3-rc.1")));
        assert_eq!(parse_version_loose("release"), None);
        assert_eq!(parse_version_loose("1.2"), None);
        assert_eq!(parse_version_loose(""), None);
    }

    #[test]
    fn parse_tag_version_with_prefix() {
        assert_eq!(
            parse_tag_version("pkgs/widgets/1.4.0", Some("pkgs/widgets/")),
            Some(v("1.4.0"))
        );
        assert_eq!(
            parse_tag_version("pkgs/other/1.4.0", Some("pkgs/widgets/")),
            None
        );
        // Unscoped ordering ignores scoped tags.
        assert_eq!(parse_tag_version("pkgs/widgets/1.4.0", None), None);
        assert_eq!(parse_tag_version("v2.0.0", Some("")), Some(v("2.0.0")));
    }

    #[test]
    fn tag_scope_prefers_first_populated() {
        let scopes = vec![Some("packages/widgets/".to_string()), None];
        let scoped = tag_map(&["packages/widgets/1.0.0", "packages/other/2.0.0"]);
        assert_eq!(pick_tag_scope(&scoped, &scopes), Some("packages/widgets/"));

        let plain = tag_map(&["v1.0.0", "packages/other/2.0.0"]);
        assert_eq!(pick_tag_scope(&plain, &scopes), None);

        let explicit = vec![Some("core/".to_string())];
        assert_eq!(pick_tag_scope(&plain, &explicit), Some("core/"));
        assert_eq!(pick_tag_scope(&plain, &[]), None);
    }

    #[test]
    fn requirement_spellings() {
        let req = parse_requirement(">=1.0.0").unwrap();
        assert!(req.matches(&v("1.5.0")));
        assert!(!req.matches(&v("0.9.0")));

        let req = parse_requirement(">=v1.0.0, <v2.0.0").unwrap();
        assert!(req.matches(&v("1.9.9")));
        assert!(!req.matches(&v("2.0.0")));

        let req = parse_requirement("==1.2.0").unwrap();
        assert!(req.matches(&v("1.2.0")));
        assert!(!req.matches(&v("1.2.1")));

        let req = parse_requirement("v1.2.0").unwrap();
        assert!(req.matches(&v("1.2.0")));
        assert!(!req.matches(&v("1.3.0")));

        assert!(parse_requirement("not a version").is_err());
    }

    #[test]
    fn requirement_detection() {
        assert!(looks_like_requirement(">=1.0.0"));
        assert!(looks_like_requirement("^1.2"));
        assert!(looks_like_requirement("~1.2.0"));
        assert!(looks_like_requirement("*"));
        assert!(looks_like_requirement("1.0, 2.0"));
        assert!(!looks_like_requirement("1.0.0"));
        assert!(!looks_like_requirement("v1.0.0"));
        assert!(!looks_like_requirement("release-2024"));
    }

    #[test]
    fn semver_tags_are_ordered_by_precedence() {
        let tags = tag_map(&["1.0.0", "2.0.0", "1.5.0", "nightly", "v1.10.0", "2.0.0-rc.1"]);
        let ordered: Vec<String> = semver_tags(&tags, None)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            ordered,
            vec!["1.0.0", "1.5.0", "v1.10.0", "2.0.0-rc.1", "2.0.0"]
        );
    }

    #[test]
    fn semver_tags_respect_prefix() {
        let tags = tag_map(&["core/1.0.0", "core/1.1.0", "cli/3.0.0", "9.9.9"]);
        let ordered: Vec<String> = semver_tags(&tags, Some("core/"))
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(ordered, vec!["core/1.0.0", "core/1.1.0"]);
    }

    #[test]
    fn next_version_bumps() {
        let existing = [v("1.3.2"), v("1.0.0"), v("0.9.0")];
        let initial = v("0.1.0");
        assert_eq!(next_version(&existing, BumpKind::Minor, &initial), v("1.4.0"));
        assert_eq!(next_version(&existing, BumpKind::Patch, &initial), v("1.3.3"));
        assert_eq!(next_version(&existing, BumpKind::Major, &initial), v("2.0.0"));
    }

    #[test]
    fn next_version_without_tags_is_initial() {
        let initial = v("0.1.0");
        assert_eq!(next_version(&[] as &[Version], BumpKind::Minor, &initial), v("0.1.0"));
    }

    #[test]
    fn next_version_clears_prerelease() {
        let existing = [v("2.0.0-rc.1")];
        assert_eq!(
            next_version(&existing, BumpKind::Patch, &v("0.1.0")),
            v("2.0.1")
        );
    }

    #[test]
    fn bump_kind_from_str() {
        assert_eq!("Minor".parse::<BumpKind>(), Ok(BumpKind::Minor));
        assert!("huge".parse::<BumpKind>().is_err());
    }
}
