//! Manifest files: the JSON shapes that declare dependencies, normalized into
//! [`Descriptor`]s.
//!
//! Accepted shapes:
//! - `pkg.json` with a `dependencies` array, or a project tree file with a
//!   `miniatures` array. Entries split the repository into `domain` and
//!   `repoName`.
//! - legacy `repos` arrays whose entries carry one flat `repo` URL.
//! - legacy `packages` maps of name to `{db-repo, root-dir, branch,
//!   target-dir, version}`.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::descriptor::Descriptor;
use crate::resolve::{RefSelector, ResolveError};
use crate::types::{ParseError, Remote, SubPath, validate_package_name};

/// File name of a package manifest.
pub const PACKAGE_MANIFEST: &str = "pkg.json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest has no 'dependencies', 'miniatures', 'repos' or 'packages'")]
    NoEntries,
    #[error("entry {entry}: no repository given")]
    MissingRepository { entry: String },
    #[error("entry {entry}: bad repository: {source}")]
    BadIdentity {
        entry: String,
        #[source]
        source: ParseError,
    },
    #[error("entry {entry}: bad path: {source}")]
    BadSubPath {
        entry: String,
        #[source]
        source: ParseError,
    },
    #[error("entry {entry}: {source}")]
    BadSelector {
        entry: String,
        #[source]
        source: ResolveError,
    },
    #[error("invalid package name '{name}': {source}")]
    InvalidPackageName {
        name: String,
        #[source]
        source: ParseError,
    },
    #[error("package '{0}' is declared more than once")]
    DuplicatePackage(String),
}

/// Project-level fields of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProjectMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "db-repo")]
    pub db_repo: Option<String>,
    #[serde(default, rename = "root-dir")]
    pub root_dir: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl ProjectMeta {
    /// Read `pkg.json` in `dir`; `None` if there is none.
    pub fn read(dir: &Path) -> Result<Option<Self>, ManifestError> {
        let path = dir.join(PACKAGE_MANIFEST);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ManifestError::Io { path, source }),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Tag prefix for this package: `{root-dir}/` and, off the default
    /// branch, `{branch}/`.
    pub fn tag_prefix(&self, default_branch: &str) -> String {
        let mut prefix = String::new();
        if let Some(root) = self.root_dir.as_deref().map(|r| r.trim_matches('/')) {
            if !root.is_empty() && root != "." {
                prefix.push_str(root);
                prefix.push('/');
            }
        }
        if let Some(branch) = self.branch.as_deref().filter(|b| !b.is_empty()) {
            if branch != default_branch {
                prefix.push_str(branch);
                prefix.push('/');
            }
        }
        prefix
    }
}

/// A normalized manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub project: ProjectMeta,
    pub dependencies: Vec<Descriptor>,
}

impl Manifest {
    pub fn get(&self, name: &str) -> Option<&Descriptor> {
        self.dependencies.iter().find(|d| d.package_name == name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AsPkg {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CustomConfig {
    #[serde(default)]
    install: Option<String>,
}

fn default_loaded() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    #[serde(default, alias = "pkg_name")]
    pkg_name: Option<String>,
    #[serde(default, alias = "pkg_type")]
    pkg_type: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default, alias = "repo_name")]
    repo_name: Option<String>,
    /// Legacy flat URL.
    #[serde(default)]
    repo: Option<String>,
    #[serde(default, alias = "path_name")]
    path_name: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, alias = "local_dir")]
    local_dir: Option<String>,
    #[serde(default = "default_loaded")]
    loaded: bool,
    #[serde(default, rename = "as_pkg", alias = "asPkg")]
    as_pkg: Option<AsPkg>,
    #[serde(default, alias = "custom_config")]
    custom_config: Option<CustomConfig>,
    #[serde(default, alias = "tag_prefix")]
    tag_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    #[serde(default, rename = "db-repo")]
    db_repo: Option<String>,
    #[serde(default, rename = "root-dir")]
    root_dir: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default, rename = "target-dir")]
    target_dir: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(flatten)]
    project: ProjectMeta,
    #[serde(default)]
    dependencies: Option<Vec<RawEntry>>,
    #[serde(default)]
    miniatures: Option<Vec<RawEntry>>,
    #[serde(default)]
    repos: Option<Vec<RawEntry>>,
    #[serde(default)]
    packages: Option<BTreeMap<String, RawPackage>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Version wins over tag, tag over branch; none of them means the default
/// branch.
fn selector_from(
    entry: &str,
    version: Option<String>,
    tag: Option<String>,
    branch: Option<String>,
) -> Result<RefSelector, ManifestError> {
    if let Some(version) = non_empty(version) {
        return RefSelector::from_version_text(&version).map_err(|source| {
            ManifestError::BadSelector {
                entry: entry.to_string(),
                source,
            }
        });
    }
    if let Some(tag) = non_empty(tag) {
        return Ok(RefSelector::Tag(tag));
    }
    if let Some(branch) = non_empty(branch) {
        return Ok(RefSelector::Branch(branch));
    }
    Ok(RefSelector::DefaultBranch)
}

fn remote_from(entry: &str, raw: &RawEntry) -> Result<Remote, ManifestError> {
    let bad = |source| ManifestError::BadIdentity {
        entry: entry.to_string(),
        source,
    };
    let domain = non_empty(raw.domain.clone());
    let repo_name = non_empty(raw.repo_name.clone());
    match (non_empty(raw.repo.clone()), domain, repo_name) {
        (Some(repo), _, _) => repo.parse().map_err(bad),
        (None, Some(domain), Some(name)) => {
            Remote::from_domain_and_name(&domain, &name).map_err(bad)
        }
        (None, Some(domain), None) => domain.parse().map_err(bad),
        (None, None, _) => Err(ManifestError::MissingRepository {
            entry: entry.to_string(),
        }),
    }
}

fn sub_path_from(entry: &str, path: Option<&str>) -> Result<SubPath, ManifestError> {
    let path = path.unwrap_or("");
    if path.starts_with('/') {
        return Err(ManifestError::BadSubPath {
            entry: entry.to_string(),
            source: ParseError::InvalidStart('/'),
        });
    }
    path.parse().map_err(|source| ManifestError::BadSubPath {
        entry: entry.to_string(),
        source,
    })
}

fn descriptor_from_entry(index: usize, raw: RawEntry) -> Result<Descriptor, ManifestError> {
    let label = raw
        .pkg_name
        .clone()
        .unwrap_or_else(|| format!("#{}", index + 1));
    let remote = remote_from(&label, &raw)?;
    let sub_path = sub_path_from(&label, raw.path_name.as_deref())?;

    let package_name = match non_empty(raw.pkg_name) {
        Some(name) => name,
        None => sub_path
            .file_name()
            .unwrap_or_else(|| remote.key.path.name())
            .to_string(),
    };

    let version = non_empty(raw.version).or_else(|| raw.as_pkg.and_then(|p| p.version));
    let selector = selector_from(&package_name, version, raw.tag, raw.branch)?;

    let mut descriptor = Descriptor::new(package_name.clone(), remote, selector)
        .map_err(|source| ManifestError::InvalidPackageName {
            name: package_name,
            source,
        })?
        .with_sub_path(sub_path);
    descriptor.local_target = non_empty(raw.local_dir).map(PathBuf::from);
    descriptor.package_type = non_empty(raw.pkg_type);
    descriptor.install_command = raw.custom_config.and_then(|c| non_empty(c.install));
    descriptor.tag_prefix = non_empty(raw.tag_prefix);
    Ok(descriptor)
}

fn descriptor_from_package(name: String, raw: RawPackage) -> Result<Descriptor, ManifestError> {
    validate_package_name(&name).map_err(|source| ManifestError::InvalidPackageName {
        name: name.clone(),
        source,
    })?;
    let url = non_empty(raw.db_repo).ok_or_else(|| ManifestError::MissingRepository {
        entry: name.clone(),
    })?;
    let remote: Remote = url.parse().map_err(|source| ManifestError::BadIdentity {
        entry: name.clone(),
        source,
    })?;
    let sub_path = sub_path_from(&name, raw.root_dir.as_deref())?;
    let selector = selector_from(&name, raw.version, None, raw.branch)?;

    let mut descriptor = Descriptor::new(name.clone(), remote, selector)
        .map_err(|source| ManifestError::InvalidPackageName { name, source })?
        .with_sub_path(sub_path);
    descriptor.local_target = non_empty(raw.target_dir).map(PathBuf::from);
    Ok(descriptor)
}

/// Parse manifest text into descriptors.
pub fn parse_manifest(text: &str) -> Result<Manifest, ManifestError> {
    let raw: RawManifest = serde_json::from_str(text)?;

    let mut dependencies = Vec::new();
    let entries = raw.dependencies.or(raw.miniatures).or(raw.repos);
    match (entries, raw.packages) {
        (Some(entries), _) => {
            for (index, entry) in entries.into_iter().enumerate() {
                if !entry.loaded {
                    continue;
                }
                dependencies.push(descriptor_from_entry(index, entry)?);
            }
        }
        (None, Some(packages)) => {
            for (name, package) in packages {
                dependencies.push(descriptor_from_package(name, package)?);
            }
        }
        (None, None) => return Err(ManifestError::NoEntries),
    }

    let mut seen = HashSet::new();
    for d in &dependencies {
        if !seen.insert(d.package_name.as_str()) {
            return Err(ManifestError::DuplicatePackage(d.package_name.clone()));
        }
    }

    Ok(Manifest {
        project: raw.project,
        dependencies,
    })
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkg_json_dependencies() {
        let manifest = parse_manifest(
            r#"{
                "name": "app",
                "version": "0.3.0",
                "dependencies": [
                    {
                        "pkgName": "widgets",
                        "pkgType": "node",
                        "domain": "https://github.com",
                        "repoName": "acme/widgets",
                        "pathName": "packages/widgets",
                        "version": "^1.2",
                        "customConfig": {"install": "npm ci"}
                    },
                    {
                        "domain": "gitlab.com",
                        "repoName": "group/tools",
                        "pathName": "lib/helpers",
                        "tag": "v2.0.0",
                        "branch": "ignored"
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.project.name.as_deref(), Some("app"));
        assert_eq!(manifest.dependencies.len(), 2);

        let widgets = manifest.get("widgets").unwrap();
        assert_eq!(widgets.remote.key.to_string(), "github.com/acme/widgets");
        assert_eq!(widgets.remote.url, "https://github.com/acme/widgets");
        assert_eq!(widgets.sub_path.as_str(), "packages/widgets");
        assert!(matches!(widgets.selector, RefSelector::Range(_)));
        assert_eq!(widgets.install_command.as_deref(), Some("npm ci"));
        assert_eq!(widgets.package_type.as_deref(), Some("node"));

        let helpers = manifest.get("helpers").unwrap();
        assert_eq!(helpers.selector, RefSelector::Tag("v2.0.0".into()));
        assert_eq!(helpers.remote.url, "https://gitlab.com/group/tools.git");
    }

    #[test]
    fn miniatures_drop_unloaded_and_keep_local_dir() {
        let manifest = parse_manifest(
            r#"{
                "miniatures": [
                    {"pkgName": "a", "domain": "github.com", "repoName": "o/a", "localDir": "src/a", "loaded": true, "as_pkg": {"version": "1.0.0"}},
                    {"pkgName": "b", "domain": "github.com", "repoName": "o/b", "loaded": false},
                    {"pkgName": "c", "domain": "github.com", "repoName": "o/c", "branch": "dev"}
                ]
            }"#,
        )
        .unwrap();

        let names: Vec<_> = manifest.dependencies.iter().map(|d| d.package_name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        let a = manifest.get("a").unwrap();
        assert_eq!(a.local_target, Some(PathBuf::from("src/a")));
        assert_eq!(a.selector, RefSelector::Tag("1.0.0".into()));
        assert_eq!(manifest.get("c").unwrap().selector, RefSelector::Branch("dev".into()));
    }

    #[test]
    fn legacy_repos_use_flat_url_and_default_name() {
        let manifest = parse_manifest(
            r#"{"repos": [{"repo": "git@github.com:acme/tooling.git"}]}"#,
        )
        .unwrap();
        let d = &manifest.dependencies[0];
        assert_eq!(d.package_name, "tooling");
        assert_eq!(d.remote.url, "git@github.com:acme/tooling.git");
        assert_eq!(d.selector, RefSelector::DefaultBranch);
    }

    #[test]
    fn legacy_packages_map() {
        let manifest = parse_manifest(
            r#"{
                "packages": {
                    "pkg-v1": {
                        "db-repo": "file:///srv/git/packages",
                        "root-dir": "packages/test-package",
                        "version": "1.0.0",
                        "target-dir": "out/pkg-v1"
                    },
                    "pkg-latest": {
                        "db-repo": "file:///srv/git/packages",
                        "root-dir": "packages/test-package",
                        "version": "latest"
                    },
                    "pkg-dev": {
                        "db-repo": "file:///srv/git/packages",
                        "branch": "dev"
                    }
                }
            }"#,
        )
        .unwrap();

        let v1 = manifest.get("pkg-v1").unwrap();
        assert_eq!(v1.remote.key.to_string(), "file/srv/git/packages");
        assert_eq!(v1.sub_path.as_str(), "packages/test-package");
        assert_eq!(v1.local_target, Some(PathBuf::from("out/pkg-v1")));
        assert_eq!(manifest.get("pkg-latest").unwrap().selector, RefSelector::Latest);
        let dev = manifest.get("pkg-dev").unwrap();
        assert_eq!(dev.selector, RefSelector::Branch("dev".into()));
        assert!(dev.sub_path.is_root());
    }

    #[test]
    fn rejects_bad_manifests() {
        assert!(matches!(parse_manifest("{"), Err(ManifestError::Json(_))));
        assert!(matches!(parse_manifest(r#"{"name": "x"}"#), Err(ManifestError::NoEntries)));
        assert!(matches!(
            parse_manifest(r#"{"dependencies": [{"pkgName": "x"}]}"#),
            Err(ManifestError::MissingRepository { .. })
        ));
        assert!(matches!(
            parse_manifest(r#"{"dependencies": [{"pkgName": "x", "repo": "ftp://h/a/b"}]}"#),
            Err(ManifestError::BadIdentity { .. })
        ));
        assert!(matches!(
            parse_manifest(
                r#"{"dependencies": [{"pkgName": "x", "repo": "github.com/a/b", "pathName": "../up"}]}"#
            ),
            Err(ManifestError::BadSubPath { .. })
        ));
        assert!(matches!(
            parse_manifest(
                r#"{"dependencies": [{"pkgName": "x", "repo": "github.com/a/b", "version": ">=banana"}]}"#
            ),
            Err(ManifestError::BadSelector { .. })
        ));
        assert!(matches!(
            parse_manifest(r#"{"dependencies": [{"pkgName": "a/b", "repo": "github.com/a/b"}]}"#),
            Err(ManifestError::InvalidPackageName { .. })
        ));
        assert!(matches!(
            parse_manifest(
                r#"{"dependencies": [
                    {"pkgName": "dup", "repo": "github.com/a/b"},
                    {"pkgName": "dup", "repo": "github.com/a/c"}
                ]}"#
            ),
            Err(ManifestError::DuplicatePackage(ref name)) if name == "dup"
        ));
    }

    #[test]
    fn tag_prefix_from_metadata() {
        let mut meta = ProjectMeta {
            root_dir: Some("/packages/widgets/".to_string()),
            ..ProjectMeta::default()
        };
        assert_eq!(meta.tag_prefix("main"), "packages/widgets/");
        meta.branch = Some("main".to_string());
        assert_eq!(meta.tag_prefix("main"), "packages/widgets/");
        meta.branch = Some("beta".to_string());
        assert_eq!(meta.tag_prefix("main"), "packages/widgets/beta/");
        meta.root_dir = Some(".".to_string());
        assert_eq!(meta.tag_prefix("main"), "beta/");
    }

    #[test]
    fn project_meta_read() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectMeta::read(dir.path()).unwrap().is_none());
        std::fs::write(
            dir.path().join(PACKAGE_MANIFEST),
            r#"{"name": "w", "version": "1.4.0", "db-repo": "https://github.com/a/b", "extra": 1}"#,
        )
        .unwrap();
        let meta = ProjectMeta::read(dir.path()).unwrap().unwrap();
        assert_eq!(meta.version.as_deref(), Some("1.4.0"));
        assert_eq!(meta.db_repo.as_deref(), Some("https://github.com/a/b"));
    }
}
