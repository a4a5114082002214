//! Unpacking `git archive` output into a destination directory.

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use tar::{Archive, EntryType};

use crate::types::SubPath;

/// Map an archive entry path to its place under the destination.
///
/// Entries outside `sub_path` and the `sub_path` directory itself map to
/// `None`. When `sub_path` names a file, that file maps to its own name.
fn relative_path(entry: &Path, sub_path: &SubPath, is_file: bool) -> Option<PathBuf> {
    let rel = if sub_path.is_root() {
        entry.to_path_buf()
    } else if is_file {
        if entry != sub_path.as_path() {
            return None;
        }
        PathBuf::from(sub_path.file_name()?)
    } else {
        entry.strip_prefix(sub_path.as_path()).ok()?.to_path_buf()
    };

    if rel.as_os_str().is_empty() {
        return None;
    }
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(rel)
}

/// Unpack the entries of `archive` that live under `sub_path` into `dest`,
/// with the `sub_path` prefix removed.
///
/// Returns the files and symlinks written, relative to `dest`, sorted.
pub(crate) fn unpack_subtree(
    archive: &Path,
    sub_path: &SubPath,
    is_file: bool,
    dest: &Path,
) -> io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;

    let mut archive = Archive::new(File::open(archive)?);
    archive.set_preserve_mtime(true);

    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if matches!(kind, EntryType::XGlobalHeader | EntryType::XHeader) {
            continue;
        }

        let path = entry.path()?.into_owned();
        let Some(rel) = relative_path(&path, sub_path, is_file) else {
            continue;
        };

        let out = dest.join(&rel);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&out)?;
        if !kind.is_dir() {
            files.push(rel);
        }
    }

    files.sort();
    Ok(files)
}
