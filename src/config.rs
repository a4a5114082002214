//! Tool configuration: a JSON file, then environment overrides, then flags.

use semver::Version;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheOptions;
use crate::load::{LoaderOptions, PostLoadHooks, default_jobs};
use crate::resolve::LatestPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    #[error("no cache directory available; set TREEPORT_CACHE_DIR or --cache-dir")]
    NoCacheDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub cache_dir: Option<PathBuf>,
    /// Zero disables the limit.
    pub git_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub branch_max_age_secs: u64,
    pub negative_ttl_secs: u64,
    pub jobs: Option<usize>,
    pub latest: LatestPolicy,
    pub initial_version: Version,
    pub remote: String,
    pub default_branch: String,
    pub dependency_dir: PathBuf,
    pub url_rewrites: BTreeMap<String, String>,
    pub post_load: BTreeMap<String, String>,
    pub run_hooks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            git_timeout_secs: 300,
            lock_timeout_secs: 300,
            branch_max_age_secs: 300,
            negative_ttl_secs: 600,
            jobs: None,
            latest: LatestPolicy::HighestTag,
            initial_version: Version::new(0, 1, 0),
            remote: "origin".to_string(),
            default_branch: "main".to_string(),
            dependency_dir: PathBuf::from("."),
            url_rewrites: BTreeMap::new(),
            post_load: BTreeMap::new(),
            run_hooks: false,
        }
    }
}

/// `{config_dir}/treeport/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("treeport").join("config.json"))
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `explicit`, or else the default config file if there is one.
    /// An explicit path must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => {
                log::debug!("Reading config from {}", path.display());
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Apply `TREEPORT_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("TREEPORT_CACHE_DIR").filter(|d| !d.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(jobs) = lookup("TREEPORT_JOBS") {
            self.jobs = Some(parse_env("TREEPORT_JOBS", jobs)?);
        }
        if let Some(secs) = lookup("TREEPORT_GIT_TIMEOUT_SECS") {
            self.git_timeout_secs = parse_env("TREEPORT_GIT_TIMEOUT_SECS", secs)?;
        }
        if let Some(latest) = lookup("TREEPORT_LATEST") {
            self.latest = <LatestPolicy as clap::ValueEnum>::from_str(latest.trim(), true)
                .map_err(|_| ConfigError::InvalidEnv {
                    name: "TREEPORT_LATEST",
                    value: latest,
                })?;
        }
        Ok(())
    }

    /// File config plus the process environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(explicit)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn cache_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|d| d.join("treeport"))
                .ok_or(ConfigError::NoCacheDir),
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            git_timeout: (self.git_timeout_secs > 0)
                .then(|| Duration::from_secs(self.git_timeout_secs)),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            branch_max_age: Duration::from_secs(self.branch_max_age_secs),
            negative_ttl: Duration::from_secs(self.negative_ttl_secs),
        }
    }

    pub fn loader_options(&self, project_root: &Path) -> LoaderOptions {
        LoaderOptions {
            latest_policy: self.latest,
            url_rewrites: self.url_rewrites.clone(),
            dependency_dir: self.dependency_dir.clone(),
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn hooks(&self) -> PostLoadHooks {
        PostLoadHooks::new(self.post_load.clone(), self.run_hooks)
            .with_timeout(self.cache_options().git_timeout)
    }

    pub fn jobs(&self) -> usize {
        self.jobs.filter(|j| *j > 0).unwrap_or_else(default_jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.latest, LatestPolicy::HighestTag);
        assert_eq!(config.initial_version, Version::new(0, 1, 0));
        assert_eq!(config.cache_options().git_timeout, Some(Duration::from_secs(300)));
        assert!(!config.hooks().is_enabled());
        assert_eq!(config.hooks().timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn parses_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "cache-dir": "/var/cache/tp",
                "git-timeout-secs": 0,
                "jobs": 3,
                "latest": "default-branch",
                "initial-version": "1.0.0",
                "dependency-dir": "vendor",
                "url-rewrites": {"github.com": "https://mirror.example/github"},
                "post-load": {"node": "npm ci"},
                "run-hooks": true
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cache_root().unwrap(), PathBuf::from("/var/cache/tp"));
        assert_eq!(config.cache_options().git_timeout, None);
        assert_eq!(config.jobs(), 3);
        assert_eq!(config.latest, LatestPolicy::DefaultBranch);
        assert_eq!(config.initial_version, Version::new(1, 0, 0));
        let options = config.loader_options(Path::new("/project"));
        assert_eq!(options.dependency_dir, PathBuf::from("vendor"));
        assert_eq!(options.latest_policy, LatestPolicy::DefaultBranch);
        assert!(config.hooks().is_enabled());
        assert_eq!(config.hooks().timeout(), None);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"latest": "newest"}"#).unwrap();
        assert!(matches!(Config::load(Some(&bad)), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("TREEPORT_CACHE_DIR", "/tmp/tp-cache"),
                ("TREEPORT_JOBS", "7"),
                ("TREEPORT_GIT_TIMEOUT_SECS", "12"),
                ("TREEPORT_LATEST", "default-branch"),
            ]))
            .unwrap();
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/tp-cache")));
        assert_eq!(config.jobs(), 7);
        assert_eq!(config.git_timeout_secs, 12);
        assert_eq!(config.latest, LatestPolicy::DefaultBranch);
    }

    #[test]
    fn bad_env_values() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_env(env(&[("TREEPORT_JOBS", "many")])),
            Err(ConfigError::InvalidEnv { name: "TREEPORT_JOBS", .. })
        ));
        assert!(matches!(
            config.apply_env(env(&[("TREEPORT_LATEST", "newest")])),
            Err(ConfigError::InvalidEnv { name: "TREEPORT_LATEST", .. })
        ));
    }
}
