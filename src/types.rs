//! Repository identity, remotes and sub-paths.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0:?}")]
    InvalidCharacter(char),
    #[error("value cannot start with '{0}'")]
    InvalidStart(char),
    #[error("invalid path segment '{0}'")]
    InvalidSegment(String),
    #[error("missing repository path after the domain")]
    MissingPath,
    #[error("unsupported repository url: {0}")]
    UnsupportedUrl(String),
    #[error("invalid domain: {0}")]
    InvalidDomain(#[source] Box<ParseError>),
    #[error("invalid repository path: {0}")]
    InvalidPath(#[source] Box<ParseError>),
}

/// Host part of a repository identity, lower-cased, optionally with a port.
///
/// Validation rules:
/// - Non-empty
/// - ASCII alphanumerics, `.`, `-` and a single `:port` suffix
/// - Cannot start with `.` or `-`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    /// Domain used for `file://` remotes.
    pub const LOCAL: &'static str = "file";

    /// Returns the domain as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name for this domain; `:` is not portable in file names.
    pub fn dir_name(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl FromStr for Domain {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let lower = s.to_ascii_lowercase();
        let (host, port) = match lower.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (lower.as_str(), None),
        };

        if host.is_empty() {
            return Err(ParseError::Empty);
        }
        if let Some(c) = host.chars().next().filter(|c| *c == '.' || *c == '-') {
            return Err(ParseError::InvalidStart(c));
        }
        for c in host.chars() {
            if !c.is_ascii_alphanumeric() && c != '.' && c != '-' {
                return Err(ParseError::InvalidCharacter(c));
            }
        }
        if let Some(port) = port {
            if port.is_empty() {
                return Err(ParseError::Empty);
            }
            if let Some(c) = port.chars().find(|c| !c.is_ascii_digit()) {
                return Err(ParseError::InvalidCharacter(c));
            }
        }

        Ok(Domain(lower))
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check a single `/`-separated component shared by repository paths,
/// sub-paths and package names.
fn validate_segment(segment: &str) -> Result<(), ParseError> {
    if segment.is_empty() {
        return Err(ParseError::Empty);
    }
    if segment == "." || segment == ".." {
        return Err(ParseError::InvalidSegment(segment.to_string()));
    }
    if segment.starts_with('-') {
        return Err(ParseError::InvalidStart('-'));
    }
    if let Some(c) = segment
        .chars()
        .find(|c| *c == '\\' || *c == '/' || c.is_control())
    {
        return Err(ParseError::InvalidCharacter(c));
    }
    Ok(())
}

/// Repository path on its host, e.g. `owner/repo` or `group/sub/repo`.
///
/// A trailing `.git` is dropped so `owner/repo` and `owner/repo.git` name the
/// same repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPath(String);

impl RepoPath {
    /// Returns the path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Last segment, usually the repository name.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl FromStr for RepoPath {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches('/');
        let trimmed = match trimmed.strip_suffix(".git") {
            Some(stripped) if !stripped.is_empty() && !stripped.ends_with('/') => stripped,
            _ => trimmed,
        };
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }
        for segment in trimmed.split('/') {
            validate_segment(segment)?;
        }
        Ok(RepoPath(trimmed.to_string()))
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a remote repository (domain + repository path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoKey {
    pub domain: Domain,
    pub path: RepoPath,
}

impl RepoKey {
    /// Creates a new RepoKey from domain and path
    pub fn new(domain: Domain, path: RepoPath) -> Self {
        Self { domain, path }
    }

    fn from_parts(domain: &str, path: &str) -> Result<Self, ParseError> {
        let domain = domain
            .parse::<Domain>()
            .map_err(|e| ParseError::InvalidDomain(Box::new(e)))?;
        if path.trim_matches('/').is_empty() {
            return Err(ParseError::MissingPath);
        }
        let path = path
            .parse::<RepoPath>()
            .map_err(|e| ParseError::InvalidPath(Box::new(e)))?;
        Ok(Self { domain, path })
    }

    /// Parse the identity out of a clone URL.
    ///
    /// Accepts `http(s)://`, `ssh://`, `git://`, `file://` and scp-style
    /// `user@host:path` forms.
    pub fn from_url(url: &str) -> Result<Self, ParseError> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix("file://") {
            return Self::from_parts(Domain::LOCAL, rest);
        }
        if let Some((scheme, rest)) = url.split_once("://") {
            if !matches!(scheme, "https" | "http" | "ssh" | "git") {
                return Err(ParseError::UnsupportedUrl(url.to_string()));
            }
            let (authority, path) = rest.split_once('/').ok_or(ParseError::MissingPath)?;
            let host = authority.rsplit('@').next().unwrap_or(authority);
            return Self::from_parts(host, path);
        }
        if let Some((authority, path)) = scp_parts(url) {
            let host = authority.rsplit('@').next().unwrap_or(authority);
            return Self::from_parts(host, path);
        }
        Err(ParseError::UnsupportedUrl(url.to_string()))
    }

    /// Default clone URL for this identity.
    pub fn default_url(&self) -> String {
        if self.domain.as_str() == Domain::LOCAL {
            format!("file:///{}", self.path)
        } else {
            format!("https://{}/{}.git", self.domain, self.path)
        }
    }
}

/// Split `user@host:path` into (`user@host`, `path`). Windows drive letters,
/// plain `domain/path` strings and `host:port/path` are not scp-style.
fn scp_parts(s: &str) -> Option<(&str, &str)> {
    let (authority, path) = s.split_once(':')?;
    if authority.is_empty() || authority.contains('/') || path.starts_with("//") {
        return None;
    }
    if authority.len() == 1 {
        return None;
    }
    if let Some((port, _)) = path.split_once('/') {
        if !authority.contains('@') && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    Some((authority, path))
}

impl FromStr for RepoKey {
    type Err = ParseError;

    /// Parses `domain/owner/repo`, or any URL accepted by [`RepoKey::from_url`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.contains("://") || scp_parts(s).is_some() {
            return Self::from_url(s);
        }
        let (domain, path) = s.split_once('/').ok_or(ParseError::MissingPath)?;
        Self::from_parts(domain, path)
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)
    }
}

/// A repository identity plus the URL it is cloned from.
///
/// Identity never depends on the URL: two remotes with the same key share a
/// mirror even if their URLs are spelled differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub key: RepoKey,
    pub url: String,
}

impl Remote {
    /// Remote using the key's default URL.
    pub fn from_key(key: RepoKey) -> Self {
        let url = key.default_url();
        Self { key, url }
    }

    /// Remote for an explicit URL; the key is derived from it.
    pub fn from_url(url: &str) -> Result<Self, ParseError> {
        let key = RepoKey::from_url(url)?;
        Ok(Self {
            key,
            url: url.trim().to_string(),
        })
    }

    /// Remote for a split `domain` + `repository name` pair. The domain may
    /// carry a scheme (`https://github.com/`).
    pub fn from_domain_and_name(domain: &str, name: &str) -> Result<Self, ParseError> {
        let domain = domain.trim().trim_end_matches('/');
        let name = name.trim().trim_matches('/');
        if domain.contains("://") {
            Self::from_url(&format!("{}/{}", domain, name))
        } else {
            let key = RepoKey::from_parts(domain, name)?;
            Ok(Self::from_key(key))
        }
    }

    /// Apply `domain -> base url` rewrites, like git's `url.<base>.insteadOf`.
    pub fn rewritten(&self, rewrites: &BTreeMap<String, String>) -> Remote {
        match rewrites.get(self.key.domain.as_str()) {
            Some(base) => Remote {
                key: self.key.clone(),
                url: format!("{}/{}", base.trim_end_matches('/'), self.key.path),
            },
            None => self.clone(),
        }
    }
}

impl FromStr for Remote {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains("://") || scp_parts(s).is_some() {
            Self::from_url(s)
        } else {
            Ok(Self::from_key(s.parse()?))
        }
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Normalized path inside a repository. The empty path is the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SubPath(String);

impl SubPath {
    /// The repository root.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Slash-separated form as understood by git (`dir/sub`).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Last component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.0.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

impl FromStr for SubPath {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for segment in s.trim().split(['/', '\\']) {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(ParseError::InvalidSegment(segment.to_string()));
            }
            if let Some(c) = segment.chars().find(|c| c.is_control()) {
                return Err(ParseError::InvalidCharacter(c));
            }
            segments.push(segment);
        }
        Ok(SubPath(segments.join("/")))
    }
}

impl fmt::Display for SubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Check that a package name can be used as a single directory name.
pub fn validate_package_name(name: &str) -> Result<(), ParseError> {
    validate_segment(name.trim())?;
    if name.trim() != name {
        return Err(ParseError::InvalidCharacter(' '));
    }
    Ok(())
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
