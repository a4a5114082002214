//! Fetch-age tracking for mirrors.
//!
//! Each mirror carries a stamp file whose mtime is the time of the last
//! successful clone or fetch. Using the filesystem keeps the clock shared
//! between processes that use the same cache root.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Time of the last successful fetch, or `None` if the stamp is missing.
pub fn last_fetch(stamp: &Path) -> Option<SystemTime> {
    fs::metadata(stamp).and_then(|m| m.modified()).ok()
}

/// Check if a mirror is stale based on its fetch stamp.
///
/// Returns true if:
/// - The stamp doesn't exist
/// - The stamp is older than `max_age`
/// - We can't read the stamp's metadata
pub fn is_stale(stamp: &Path, max_age: Duration) -> bool {
    let modified = match last_fetch(stamp) {
        Some(t) => t,
        None => return true,
    };

    let threshold = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    modified < threshold
}

/// Reset the stamp's mtime to now, creating it if needed.
pub fn touch_stamp(stamp: &Path) -> io::Result<()> {
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(stamp)?;
    file.set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::tempdir;

    #[test]
    fn test_is_stale_nonexistent_path() {
        let path = Path::new("/nonexistent/path/to/stamp");
        assert!(is_stale(path, Duration::from_secs(60)));
        assert!(last_fetch(path).is_none());
    }

    #[test]
    fn test_fresh_stamp() {
        let dir = tempdir().unwrap();
        let stamp = dir.path().join("treeport-fetched");
        touch_stamp(&stamp).unwrap();
        assert!(!is_stale(&stamp, Duration::from_secs(3600)));
        assert!(last_fetch(&stamp).is_some());
    }

    #[test]
    fn test_old_stamp() {
        let dir = tempdir().unwrap();
        let stamp = dir.path().join("treeport-fetched");
        touch_stamp(&stamp).unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        set_file_mtime(&stamp, FileTime::from_system_time(two_hours_ago)).unwrap();

        assert!(is_stale(&stamp, Duration::from_secs(3600)));
        assert!(!is_stale(&stamp, Duration::from_secs(10800)));
    }

    #[test]
    fn test_touch_refreshes_old_stamp() {
        let dir = tempdir().unwrap();
        let stamp = dir.path().join("treeport-fetched");
        touch_stamp(&stamp).unwrap();
        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        set_file_mtime(&stamp, FileTime::from_system_time(two_hours_ago)).unwrap();
        assert!(is_stale(&stamp, Duration::from_secs(3600)));

        touch_stamp(&stamp).unwrap();
        assert!(!is_stale(&stamp, Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_max_age_is_always_stale_after_a_tick() {
        let dir = tempdir().unwrap();
        let stamp = dir.path().join("treeport-fetched");
        touch_stamp(&stamp).unwrap();
        let past = SystemTime::now() - Duration::from_secs(2);
        set_file_mtime(&stamp, FileTime::from_system_time(past)).unwrap();
        assert!(is_stale(&stamp, Duration::ZERO));
    }
}
