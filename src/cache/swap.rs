//! Atomic replacement of materialized directories.
//!
//! An export is written into a hidden staging directory next to its target
//! and then renamed into place, so a reader (or a crash) never observes a
//! half-populated target.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique sibling names within a process
static SWAP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a fresh, empty sibling directory of `target` to stage into.
///
/// Named `.{name}.treeport-{pid}-{counter}`; retries if a stale directory from
/// a prior crash already uses the name.
pub fn create_staging_dir(target: &Path) -> io::Result<PathBuf> {
    loop {
        let path = unique_sibling(target, "treeport")?;
        match std::fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

fn unique_sibling(target: &Path, tag: &str) -> io::Result<PathBuf> {
    let parent = target.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", target.display()),
        )
    })?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    let counter = SWAP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(
        ".{}.{}-{}-{}",
        name,
        tag,
        std::process::id(),
        counter
    )))
}

/// Remove a file, symlink or directory tree; missing paths are fine.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move `staging` into `target`, replacing whatever was there.
///
/// The previous target is first renamed aside, then `staging` is renamed in,
/// then the old tree is deleted. If the second rename fails the old target is
/// put back. Both paths must be on the same filesystem.
pub fn replace_dir(staging: &Path, target: &Path) -> io::Result<()> {
    let existing = match std::fs::symlink_metadata(target) {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };

    if !existing {
        return std::fs::rename(staging, target);
    }

    let backup = loop {
        let candidate = unique_sibling(target, "old")?;
        if std::fs::symlink_metadata(&candidate).is_err() {
            break candidate;
        }
    };
    std::fs::rename(target, &backup)?;

    if let Err(e) = std::fs::rename(staging, target) {
        let _ = std::fs::rename(&backup, target);
        return Err(e);
    }

    if let Err(e) = remove_path(&backup) {
        log::warn!("failed to remove {}: {}", backup.display(), e);
    }
    Ok(())
}
