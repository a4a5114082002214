//! Dependency descriptors: what to load, from where, and into which directory.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::resolve::RefSelector;
use crate::types::{ParseError, Remote, SubPath, resolve_against, validate_package_name};

/// Lifecycle of a loaded package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    /// Read-only copy under the dependency directory.
    Dependency,
    /// Editable copy at a path the project chose.
    Miniature,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Dependency => write!(f, "dependency"),
            PackageKind::Miniature => write!(f, "miniature"),
        }
    }
}

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub package_name: String,
    pub remote: Remote,
    pub sub_path: SubPath,
    pub selector: RefSelector,
    pub local_target: Option<PathBuf>,
    pub package_type: Option<String>,
    pub install_command: Option<String>,
    pub tag_prefix: Option<String>,
}

impl Descriptor {
    /// A dependency on the repository root at `selector`. Fails if the
    /// package name cannot be used as a directory name.
    pub fn new(
        package_name: impl Into<String>,
        remote: Remote,
        selector: RefSelector,
    ) -> Result<Self, ParseError> {
        let package_name = package_name.into();
        validate_package_name(&package_name)?;
        Ok(Self {
            package_name,
            remote,
            sub_path: SubPath::root(),
            selector,
            local_target: None,
            package_type: None,
            install_command: None,
            tag_prefix: None,
        })
    }

    pub fn with_sub_path(mut self, sub_path: SubPath) -> Self {
        self.sub_path = sub_path;
        self
    }

    pub fn with_local_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.local_target = Some(target.into());
        self
    }

    pub fn with_package_type(mut self, package_type: impl Into<String>) -> Self {
        self.package_type = Some(package_type.into());
        self
    }

    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = Some(prefix.into()).filter(|p: &String| !p.is_empty());
        self
    }

    /// Tag prefixes to try, most specific first. Without an explicit prefix,
    /// a package below the repository root also answers to tags scoped to
    /// its path (`packages/widgets/1.2.0`), then to unscoped tags.
    pub fn tag_scopes(&self) -> Vec<Option<String>> {
        match (&self.tag_prefix, self.sub_path.is_root()) {
            (Some(prefix), _) => vec![Some(prefix.clone())],
            (None, true) => vec![None],
            (None, false) => vec![Some(format!("{}/", self.sub_path.as_str())), None],
        }
    }

    pub fn kind(&self) -> PackageKind {
        if self.local_target.is_some() {
            PackageKind::Miniature
        } else {
            PackageKind::Dependency
        }
    }

    /// Directory this descriptor materializes into.
    pub fn target_dir(&self, project_root: &Path, dependency_dir: &Path) -> PathBuf {
        match &self.local_target {
            Some(target) => resolve_against(project_root, target),
            None => resolve_against(project_root, dependency_dir).join(&self.package_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Remote {
        "github.com/acme/widgets".parse().unwrap()
    }

    #[test]
    fn kind_follows_local_target() {
        let d = Descriptor::new("widgets", remote(), RefSelector::Latest).unwrap();
        assert_eq!(d.kind(), PackageKind::Dependency);
        let d = d.with_local_target("src/widgets");
        assert_eq!(d.kind(), PackageKind::Miniature);
    }

    #[test]
    fn rejects_bad_package_names() {
        for bad in ["", "a/b", "..", ".", "-x"] {
            assert!(
                Descriptor::new(bad, remote(), RefSelector::Latest).is_err(),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn target_dir_defaults_under_dependency_dir() {
        let d = Descriptor::new("widgets", remote(), RefSelector::Latest).unwrap();
        let root = Path::new("/project");
        assert_eq!(
            d.target_dir(root, Path::new(".")),
            PathBuf::from("/project/./widgets")
        );
        assert_eq!(
            d.target_dir(root, Path::new("vendor")),
            PathBuf::from("/project/vendor/widgets")
        );
    }

    #[test]
    fn target_dir_uses_local_target() {
        let root = Path::new("/project");
        let d = Descriptor::new("widgets", remote(), RefSelector::Latest)
            .unwrap()
            .with_local_target("lib/w");
        assert_eq!(d.target_dir(root, Path::new("vendor")), PathBuf::from("/project/lib/w"));
        let d = d.with_local_target("/abs/w");
        assert_eq!(d.target_dir(root, Path::new("vendor")), PathBuf::from("/abs/w"));
    }

    #[test]
    fn tag_scopes_follow_sub_path() {
        let d = Descriptor::new("w", remote(), RefSelector::Latest).unwrap();
        assert_eq!(d.tag_scopes(), vec![None]);

        let d = d.with_sub_path("packages/widgets".parse().unwrap());
        assert_eq!(
            d.tag_scopes(),
            vec![Some("packages/widgets/".to_string()), None]
        );

        let d = d.with_tag_prefix("rel/");
        assert_eq!(d.tag_scopes(), vec![Some("rel/".to_string())]);
    }

    #[test]
    fn empty_tag_prefix_is_none() {
        let d = Descriptor::new("w", remote(), RefSelector::Latest)
            .unwrap()
            .with_tag_prefix("");
        assert_eq!(d.tag_prefix, None);
    }
}
