//! Git operations through the git CLI.
//!
//! Every operation that touches a real repository is one or more `git`
//! subprocesses. Only the exit status and documented, stable output formats
//! (`for-each-ref --format`, `symbolic-ref`, `rev-parse --verify`, `cat-file
//! -t`, `status --porcelain`) are relied on.
//!
//! **CLI (with hardening and a timeout) for everything that reads or writes
//! refs and objects:**
//! - `clone_mirror` / `fetch_all` - maintain bare mirrors
//! - `list_refs` / `object_type` / `archive` - resolution and export
//! - `commit_all` / `create_tag` / `push` - publishing from a work tree
//!
//! **libgit2 only for:**
//! - `open_repository` / `is_mirror` - cheap validation of a cache directory

use git2::Repository;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::resolve::KnownRefs;

/// Default limit for a single git invocation (5 minutes).
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// Clone failed.
    #[error("clone failed: {0}")]
    CloneError(String),
    /// Fetch failed.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// Archive creation failed.
    #[error("archive failed: {0}")]
    ArchiveError(String),
    /// Push failed.
    #[error("push failed: {0}")]
    PushError(String),
    /// Any other git command exited non-zero.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    /// A git command did not finish in time and was killed.
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Validate that a git ref, tag name, commit SHA or remote name does not
/// contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal / range syntax)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub(crate) fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate a clone URL before handing it to git.
fn validate_url(url: &str) -> Result<(), GitError> {
    if url.trim().is_empty() {
        return Err(GitError::InvalidInput("url cannot be empty".to_string()));
    }
    if url.starts_with('-') {
        return Err(GitError::InvalidInput(
            "url cannot start with '-'".to_string(),
        ));
    }
    if url.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(
            "url cannot contain null or control characters".to_string(),
        ));
    }
    Ok(())
}

fn path_str<'a>(path: &'a Path, what: &str) -> Result<&'a str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::ParseError(format!("{} is not valid UTF-8", what)))
}

/// Captured result of one git invocation.
#[derive(Debug)]
struct GitOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn stderr_trimmed(&self) -> String {
        self.stderr.trim().to_string()
    }
}

pub(crate) fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

pub(crate) fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Parse `for-each-ref --format=%(refname)%09%(objectname)%09%(*objectname)`
/// output into tag and branch maps. Annotated tags are peeled to their commit.
pub fn parse_ref_listing(text: &str) -> Result<KnownRefs, GitError> {
    let mut tags = BTreeMap::new();
    let mut branches = BTreeMap::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(refname), Some(object)) = (fields.next(), fields.next()) else {
            return Err(GitError::ParseError(format!("unexpected ref line: {}", line)));
        };
        let peeled = fields.next().unwrap_or("").trim();
        let commit = if peeled.is_empty() { object } else { peeled };

        if let Some(tag) = refname.strip_prefix("refs/tags/") {
            tags.insert(tag.to_string(), commit.to_string());
        } else if let Some(branch) = refname.strip_prefix("refs/heads/") {
            branches.insert(branch.to_string(), commit.to_string());
        }
    }

    Ok(KnownRefs {
        tags,
        branches,
        default_branch: None,
    })
}

/// A tag with its annotation subject and creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDetails {
    pub name: String,
    /// Peeled commit.
    pub commit: String,
    /// First line of the annotation; the commit subject for lightweight tags.
    pub subject: String,
    /// Unix seconds; the committer date for lightweight tags.
    pub created_at: Option<i64>,
}

const TAG_DETAILS_FORMAT: &str = "--format=%(refname)%09%(objectname)%09%(*objectname)%09%(creatordate:unix)%09%(contents:subject)";

/// Parse `for-each-ref` output written with the tag details format.
pub fn parse_tag_details(text: &str) -> Result<Vec<TagDetails>, GitError> {
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(5, '\t').collect();
        let &[refname, object, peeled, created, subject] = fields.as_slice() else {
            return Err(GitError::ParseError(format!("unexpected tag line: {}", line)));
        };
        let Some(name) = refname.strip_prefix("refs/tags/") else {
            continue;
        };
        let peeled = peeled.trim();
        out.push(TagDetails {
            name: name.to_string(),
            commit: if peeled.is_empty() { object } else { peeled }.to_string(),
            subject: subject.trim().to_string(),
            created_at: created.trim().parse().ok(),
        });
    }
    Ok(out)
}

/// Git CLI wrapper with security hardening and a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: String,
    timeout: Option<Duration>,
    disable_hooks: bool,
    /// Extra `-c key=value` pairs for every invocation.
    config: Vec<(String, String)>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git, for cache use.
    pub fn new() -> Self {
        Self {
            git_path: "git".into(),
            timeout: Some(DEFAULT_GIT_TIMEOUT),
            disable_hooks: true,
            config: Vec::new(),
        }
    }

    /// A GitCli for the user's own work tree: their hooks stay enabled.
    pub fn for_worktree() -> Self {
        Self {
            disable_hooks: false,
            ..Self::new()
        }
    }

    /// Set the per-invocation timeout; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pass `-c key=value` to every invocation.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }

    /// Whether the git binary can be run at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.git_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution (cache use only)
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if self.disable_hooks {
            cmd.args(["-c", "core.hooksPath="]);
        }
        for (key, value) in &self.config {
            cmd.arg("-c").arg(format!("{}={}", key, value));
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run `git [-C dir] args...`, killing it if it outlives the timeout.
    fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut cmd = self.command();
        if let Some(dir) = dir {
            cmd.arg("-C").arg(path_str(dir, "repository path")?);
        }
        cmd.args(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let description = format!("git {}", args.join(" "));
        log::debug!("running {}", description);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = match self.timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    log::warn!("{} timed out after {:?}", description, limit);
                    return Err(GitError::Timeout {
                        command: description,
                        after: limit,
                    });
                }
            },
            None => child.wait()?,
        };

        Ok(GitOutput {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    /// Run and require exit status 0, mapping failures through `on_error`.
    fn checked(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        on_error: impl FnOnce(String) -> GitError,
    ) -> Result<String, GitError> {
        let output = self.run(dir, args)?;
        if !output.status.success() {
            return Err(on_error(output.stderr_trimmed()));
        }
        Ok(output.stdout)
    }

    fn failed<'a>(args: &'a [&'a str]) -> impl FnOnce(String) -> GitError + 'a {
        move |stderr| GitError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr,
        }
    }

    // ========================================================================
    // Mirror maintenance
    // ========================================================================

    /// Clone `url` as a bare mirror (all refs) into `dest`.
    ///
    /// A failed clone leaves nothing behind at `dest`.
    pub fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), GitError> {
        validate_url(url)?;

        let dest_existed = dest.exists();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = path_str(dest, "destination path")?;

        let result = self.checked(
            None,
            &["clone", "--mirror", "--quiet", "--", url, dest_str],
            GitError::CloneError,
        );
        if result.is_err() && !dest_existed {
            let _ = std::fs::remove_dir_all(dest);
        }
        result.map(|_| ())
    }

    /// Fetch every ref from origin into a mirror, pruning deleted ones.
    pub fn fetch_all(&self, mirror_path: &Path) -> Result<(), GitError> {
        self.checked(
            Some(mirror_path),
            &["fetch", "--prune", "--quiet", "origin"],
            GitError::FetchError,
        )
        .map(|_| ())
    }

    /// Read all branches and tags, plus the branch `HEAD` points at.
    pub fn list_refs(&self, repo_path: &Path) -> Result<KnownRefs, GitError> {
        let args = [
            "for-each-ref",
            "--format=%(refname)%09%(objectname)%09%(*objectname)",
            "refs/heads",
            "refs/tags",
        ];
        let listing = self.checked(Some(repo_path), &args, Self::failed(&args))?;
        let mut refs = parse_ref_listing(&listing)?;
        refs.default_branch = self.head_branch(repo_path)?;
        Ok(refs)
    }

    /// Branch name `HEAD` refers to, or `None` for a detached `HEAD`.
    pub fn head_branch(&self, repo_path: &Path) -> Result<Option<String>, GitError> {
        let output = self.run(Some(repo_path), &["symbolic-ref", "-q", "HEAD"])?;
        match output.status.code() {
            Some(0) => Ok(output
                .stdout
                .trim()
                .strip_prefix("refs/heads/")
                .map(str::to_string)),
            Some(1) => Ok(None),
            _ => Err(GitError::CommandFailed {
                command: "git symbolic-ref -q HEAD".to_string(),
                stderr: output.stderr_trimmed(),
            }),
        }
    }

    /// URL of a configured remote, if set.
    pub fn remote_url(&self, repo_path: &Path, remote: &str) -> Result<Option<String>, GitError> {
        validate_git_ref(remote, "remote")?;
        let key = format!("remote.{}.url", remote);
        let output = self.run(Some(repo_path), &["config", "--get", &key])?;
        if output.status.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    // ========================================================================
    // Reading objects
    // ========================================================================

    /// Full commit id for `rev`, or `None` if it does not name a commit.
    pub fn rev_parse_commit(&self, repo_path: &Path, rev: &str) -> Result<Option<String>, GitError> {
        validate_git_ref(rev, "revision")?;
        let spec = format!("{}^{{commit}}", rev);
        let output = self.run(Some(repo_path), &["rev-parse", "-q", "--verify", &spec])?;
        if output.status.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Object type (`tree`, `blob`, ...) at `path` in `commit`, or `None` if
    /// the path does not exist there.
    pub fn object_type(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
    ) -> Result<Option<String>, GitError> {
        validate_git_ref(commit, "commit")?;
        let spec = format!("{}:{}", commit, path);
        let output = self.run(Some(repo_path), &["cat-file", "-t", &spec])?;
        if output.status.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Write a tar archive of `path` (or the whole tree when empty) at
    /// `commit` to `out`. The repository is not modified.
    pub fn archive(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
        out: &Path,
    ) -> Result<(), GitError> {
        validate_git_ref(commit, "commit")?;
        if path.starts_with('-') {
            return Err(GitError::InvalidInput(
                "path cannot start with '-'".to_string(),
            ));
        }
        let output_arg = format!("--output={}", path_str(out, "archive path")?);
        let mut args = vec!["archive", "--format=tar", output_arg.as_str(), commit];
        if !path.is_empty() {
            args.push(path);
        }
        self.checked(Some(repo_path), &args, GitError::ArchiveError)
            .map(|_| ())
    }

    // ========================================================================
    // Work tree operations (publishing)
    // ========================================================================

    /// Top-level directory of the work tree containing `dir`.
    pub fn toplevel(&self, dir: &Path) -> Result<PathBuf, GitError> {
        let output = self.run(Some(dir), &["rev-parse", "--show-toplevel"])?;
        if !output.status.success() {
            return Err(GitError::NotFound(dir.display().to_string()));
        }
        Ok(PathBuf::from(output.stdout.trim()))
    }

    /// `git status --porcelain` restricted to `dir`.
    pub fn pending_changes(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let args = ["status", "--porcelain", "--", "."];
        let out = self.checked(Some(dir), &args, Self::failed(&args))?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stage and commit every change under `dir`; other paths are untouched.
    /// Returns the new `HEAD` commit.
    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<String, GitError> {
        let add = ["add", "-A", "--", "."];
        self.checked(Some(dir), &add, Self::failed(&add))?;
        let commit = ["commit", "--quiet", "-m", message, "--", "."];
        self.checked(Some(dir), &commit, |stderr| GitError::CommandFailed {
            command: "git commit".to_string(),
            stderr,
        })?;
        self.rev_parse_commit(dir, "HEAD")?
            .ok_or_else(|| GitError::ParseError("HEAD does not name a commit".to_string()))
    }

    /// Clone `url` as a regular work tree into `dest`.
    pub fn clone_worktree(&self, url: &str, dest: &Path) -> Result<(), GitError> {
        validate_url(url)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = path_str(dest, "destination path")?;
        self.checked(
            None,
            &["clone", "--quiet", "--", url, dest_str],
            GitError::CloneError,
        )
        .map(|_| ())
    }

    /// Fetch branches and tags from origin into a work tree.
    pub fn fetch_worktree(&self, dir: &Path) -> Result<(), GitError> {
        self.checked(
            Some(dir),
            &["fetch", "--prune", "--tags", "--quiet", "origin"],
            GitError::FetchError,
        )
        .map(|_| ())
    }

    /// Check out `branch`, created or reset at `start` when given. Local
    /// modifications are discarded.
    pub fn checkout_branch(
        &self,
        dir: &Path,
        branch: &str,
        start: Option<&str>,
    ) -> Result<(), GitError> {
        validate_git_ref(branch, "branch")?;
        let mut args = vec!["checkout", "--quiet", "--force", "-B", branch];
        if let Some(start) = start {
            validate_git_ref(start, "start point")?;
            args.push(start);
        }
        self.checked(Some(dir), &args, Self::failed(&args))
            .map(|_| ())
    }

    /// Point an empty repository's `HEAD` at `branch`.
    pub fn set_unborn_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        validate_git_ref(branch, "branch")?;
        let target = format!("refs/heads/{}", branch);
        let args = ["symbolic-ref", "HEAD", target.as_str()];
        self.checked(Some(dir), &args, Self::failed(&args))
            .map(|_| ())
    }

    /// All tags (name -> peeled commit) of a repository.
    pub fn list_tags(&self, repo_path: &Path) -> Result<BTreeMap<String, String>, GitError> {
        let args = [
            "for-each-ref",
            "--format=%(refname)%09%(objectname)%09%(*objectname)",
            "refs/tags",
        ];
        let listing = self.checked(Some(repo_path), &args, Self::failed(&args))?;
        Ok(parse_ref_listing(&listing)?.tags)
    }

    /// Tags with their annotation subject and creation time, by name.
    pub fn tag_details(&self, repo_path: &Path) -> Result<Vec<TagDetails>, GitError> {
        let args = ["for-each-ref", TAG_DETAILS_FORMAT, "refs/tags"];
        let listing = self.checked(Some(repo_path), &args, Self::failed(&args))?;
        parse_tag_details(&listing)
    }

    /// Create an annotated tag at `HEAD`, replacing an existing one if `force`.
    pub fn create_tag(
        &self,
        repo_path: &Path,
        name: &str,
        message: &str,
        force: bool,
    ) -> Result<(), GitError> {
        validate_git_ref(name, "tag name")?;
        let mut args = vec!["tag", "-a"];
        if force {
            args.push("-f");
        }
        args.extend(["-m", message, name]);
        self.checked(Some(repo_path), &args, |stderr| GitError::CommandFailed {
            command: format!("git tag {}", name),
            stderr,
        })
        .map(|_| ())
    }

    /// Delete a local tag.
    pub fn delete_tag(&self, repo_path: &Path, name: &str) -> Result<(), GitError> {
        validate_git_ref(name, "tag name")?;
        let args = ["tag", "-d", name];
        self.checked(Some(repo_path), &args, Self::failed(&args))
            .map(|_| ())
    }

    /// Push refspecs to `remote`.
    pub fn push(
        &self,
        repo_path: &Path,
        remote: &str,
        refspecs: &[&str],
        force: bool,
    ) -> Result<(), GitError> {
        validate_git_ref(remote, "remote")?;
        let mut args = vec!["push", "--quiet"];
        if force {
            args.push("--force");
        }
        args.push(remote);
        for spec in refspecs {
            if spec.starts_with('-') {
                return Err(GitError::InvalidInput(format!("bad refspec '{}'", spec)));
            }
            args.push(spec);
        }
        self.checked(Some(repo_path), &args, GitError::PushError)
            .map(|_| ())
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Check if a path holds a usable bare repository.
pub fn is_mirror(path: &Path) -> bool {
    open_repository(path).map(|r| r.is_bare()).unwrap_or(false)
}
