//! Post-load commands.
//!
//! A package type may map to a shell command (`post-load` in the config), and
//! an entry may carry its own `install_command`, which wins. Commands run with
//! `sh -c` inside the target directory, and only when hooks are enabled;
//! otherwise they are logged and skipped. A command still running after the
//! configured timeout is killed and reported as failed.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::cache::git::{collect, spawn_reader};
use crate::descriptor::Descriptor;

/// What happened to a package's post-load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub command: String,
    /// False when hooks were disabled and the command was only logged.
    pub ran: bool,
}

/// Package-type commands plus the switch that allows running them.
#[derive(Debug, Clone, Default)]
pub struct PostLoadHooks {
    commands: BTreeMap<String, String>,
    enabled: bool,
    timeout: Option<Duration>,
}

impl PostLoadHooks {
    pub fn new(commands: BTreeMap<String, String>, enabled: bool) -> Self {
        Self {
            commands,
            enabled,
            timeout: None,
        }
    }

    /// Kill commands that run longer than `timeout`. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The command that applies to `descriptor`, if any.
    pub fn command_for<'a>(&'a self, descriptor: &'a Descriptor) -> Option<&'a str> {
        if let Some(cmd) = descriptor.install_command.as_deref() {
            return Some(cmd).filter(|c| !c.trim().is_empty());
        }
        descriptor
            .package_type
            .as_deref()
            .and_then(|t| self.commands.get(t))
            .map(String::as_str)
            .filter(|c| !c.trim().is_empty())
    }

    /// Run (or log) the command for `descriptor` in `target`.
    ///
    /// Returns the command's stderr as the error when it exits non-zero.
    pub fn run(&self, descriptor: &Descriptor, target: &Path) -> Result<Option<HookOutcome>, String> {
        let Some(command) = self.command_for(descriptor) else {
            return Ok(None);
        };

        if !self.enabled {
            log::warn!(
                "Not running post-load command for {} (hooks disabled): {}",
                descriptor.package_name,
                command
            );
            return Ok(Some(HookOutcome {
                command: command.to_string(),
                ran: false,
            }));
        }

        log::info!("Running post-load command for {}: {}", descriptor.package_name, command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to start `{}`: {}", command, e))?;
        let stderr = child.stderr.take().map(spawn_reader);

        let waited = match self.timeout {
            Some(limit) => child.wait_timeout(limit),
            None => child.wait().map(Some),
        };
        let status = match waited {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                log::warn!("Post-load command for {} timed out", descriptor.package_name);
                return Err(format!(
                    "`{}` timed out after {:?}",
                    command,
                    self.timeout.unwrap_or_default()
                ));
            }
            Err(e) => return Err(format!("failed to wait for `{}`: {}", command, e)),
        };

        if !status.success() {
            let stderr = collect(stderr).trim().to_string();
            return Err(format!("`{}` failed ({}): {}", command, status, stderr));
        }

        Ok(Some(HookOutcome {
            command: command.to_string(),
            ran: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::RefSelector;
    use tempfile::tempdir;

    fn descriptor() -> Descriptor {
        Descriptor::new(
            "widgets",
            "github.com/acme/widgets".parse().unwrap(),
            RefSelector::Latest,
        )
        .unwrap()
    }

    fn hooks(enabled: bool) -> PostLoadHooks {
        let mut commands = BTreeMap::new();
        commands.insert("node".to_string(), "touch installed".to_string());
        PostLoadHooks::new(commands, enabled)
    }

    #[test]
    fn install_command_overrides_package_type() {
        let mut d = descriptor().with_package_type("node");
        assert_eq!(hooks(false).command_for(&d), Some("touch installed"));
        d.install_command = Some("make".to_string());
        assert_eq!(hooks(false).command_for(&d), Some("make"));
        assert_eq!(hooks(false).command_for(&descriptor()), None);
    }

    #[test]
    fn disabled_hooks_only_log() {
        let dir = tempdir().unwrap();
        let d = descriptor().with_package_type("node");
        let outcome = hooks(false).run(&d, dir.path()).unwrap().unwrap();
        assert!(!outcome.ran);
        assert!(!dir.path().join("installed").exists());
    }

    #[test]
    fn enabled_hooks_run_in_target() {
        let dir = tempdir().unwrap();
        let d = descriptor().with_package_type("node");
        let outcome = hooks(true).run(&d, dir.path()).unwrap().unwrap();
        assert!(outcome.ran);
        assert!(dir.path().join("installed").exists());
    }

    #[test]
    fn slow_hook_is_killed_after_timeout() {
        let dir = tempdir().unwrap();
        let mut d = descriptor();
        d.install_command = Some("sleep 5; touch finished".to_string());
        let started = std::time::Instant::now();
        let err = hooks(true)
            .with_timeout(Some(Duration::from_millis(200)))
            .run(&d, dir.path())
            .unwrap_err();
        assert!(err.contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!dir.path().join("finished").exists());
    }

    #[test]
    fn fast_hook_finishes_within_timeout() {
        let dir = tempdir().unwrap();
        let d = descriptor().with_package_type("node");
        let outcome = hooks(true)
            .with_timeout(Some(Duration::from_secs(30)))
            .run(&d, dir.path())
            .unwrap()
            .unwrap();
        assert!(outcome.ran);
        assert!(dir.path().join("installed").exists());
    }

    #[test]
    fn failing_hook_reports_stderr() {
        let dir = tempdir().unwrap();
        let mut d = descriptor();
        d.install_command = Some("echo broken >&2; exit 3".to_string());
        let err = hooks(true).run(&d, dir.path()).unwrap_err();
        assert!(err.contains("broken"), "{err}");
    }
}
