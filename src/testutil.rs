//! Fixture repositories for tests, built with libgit2.

use git2::{IndexAddOption, ObjectType, Repository, RepositoryInitOptions};
use std::path::{Path, PathBuf};

use crate::cache::GitCli;

/// Whether a `git` binary is on `PATH`.
pub fn git_available() -> bool {
    GitCli::new().is_available()
}

/// Gate for tests that shell out to git.
pub fn require_git() -> bool {
    if git_available() {
        true
    } else {
        eprintln!("skipping test: git binary not found");
        false
    }
}

/// A non-bare repository with `main` as its initial branch.
pub struct FixtureRepo {
    pub repo: Repository,
    pub dir: PathBuf,
}

impl FixtureRepo {
    pub fn init(dir: &Path) -> Self {
        std::fs::create_dir_all(dir).unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir, &opts).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "Fixture Author").unwrap();
            config.set_str("user.email", "fixture@example.com").unwrap();
            config.set_bool("commit.gpgsign", false).unwrap();
            config.set_bool("tag.gpgsign", false).unwrap();
        }
        Self {
            repo,
            dir: dir.to_path_buf(),
        }
    }

    /// `file://` URL of this repository.
    pub fn url(&self) -> String {
        format!("file://{}", self.dir.display())
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.dir.join(rel)).unwrap();
    }

    /// Commit the whole working tree on the current branch; returns the id.
    pub fn commit(&self, message: &str) -> String {
        let mut index = self.repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.update_all(["*"].iter(), None).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = self.repo.find_tree(tree_id).unwrap();
        let sig = self.repo.signature().unwrap();
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
            .to_string()
    }

    pub fn head(&self) -> String {
        self.repo
            .head()
            .unwrap()
            .peel_to_commit()
            .unwrap()
            .id()
            .to_string()
    }

    /// Annotated tag at `HEAD`; returns the tagged commit.
    pub fn tag(&self, name: &str) -> String {
        let target = self.repo.head().unwrap().peel(ObjectType::Commit).unwrap();
        let sig = self.repo.signature().unwrap();
        self.repo
            .tag(name, &target, &sig, &format!("Release {name}"), false)
            .unwrap();
        target.id().to_string()
    }

    /// Lightweight tag at `HEAD`; returns the tagged commit.
    pub fn lightweight_tag(&self, name: &str) -> String {
        let target = self.repo.head().unwrap().peel(ObjectType::Commit).unwrap();
        self.repo.tag_lightweight(name, &target, false).unwrap();
        target.id().to_string()
    }

    /// Branch at `HEAD`; returns its commit.
    pub fn branch(&self, name: &str) -> String {
        let commit = self.repo.head().unwrap().peel_to_commit().unwrap();
        self.repo.branch(name, &commit, false).unwrap();
        commit.id().to_string()
    }

    /// Point `HEAD` at another branch without touching the working tree.
    pub fn switch(&self, name: &str) {
        self.repo.set_head(&format!("refs/heads/{name}")).unwrap();
    }

    pub fn add_remote(&self, name: &str, url: &str) {
        self.repo.remote(name, url).unwrap();
    }
}

/// An empty bare repository to push to.
pub fn bare_remote(dir: &Path) -> Repository {
    Repository::init_bare(dir).unwrap()
}

/// Tags of a repository as `name -> peeled commit`.
pub fn tag_targets(repo: &Repository) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let names = repo.tag_names(None).unwrap();
    for name in names.iter().flatten() {
        let obj = repo
            .revparse_single(&format!("refs/tags/{name}"))
            .unwrap()
            .peel(ObjectType::Commit)
            .unwrap();
        out.push((name.to_string(), obj.id().to_string()));
    }
    out.sort();
    out
}
