//! SQLite-based index of cached mirrors and loaded packages.
//!
//! The index lives at `{cache}/index.db` and is shared between processes that
//! use the same cache root; a busy timeout lets concurrent writers queue.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::types::{Domain, RepoKey, RepoPath};

/// Returns the current Unix timestamp in seconds.
pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parse_key(domain: &str, path: &str) -> Option<RepoKey> {
    let domain: Domain = domain.parse().ok()?;
    let path: RepoPath = path.parse().ok()?;
    Some(RepoKey::new(domain, path))
}

/// Persistent index for one cache root.
pub struct State {
    conn: Mutex<Connection>,
}

/// A mirror row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRecord {
    pub key: RepoKey,
    pub url: String,
    pub created_at: i64,
    pub last_fetch_at: Option<i64>,
}

/// What was last materialized into a target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRecord {
    pub target: PathBuf,
    pub package_name: String,
    pub key: RepoKey,
    pub sub_path: String,
    pub commit: String,
    pub ref_name: String,
    /// The selector as the user wrote it (`latest`, `^1.2`, `tag v1.0.0`).
    pub selector: String,
    pub loaded_at: i64,
}

impl State {
    /// Open or create the index database at the given path.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A private in-memory index.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database schema. This is idempotent.
    pub fn init(&self) -> Result<(), rusqlite::Error> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mirrors (
                id INTEGER PRIMARY KEY,
                domain TEXT NOT NULL,
                path TEXT NOT NULL,
                url TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_fetch_at INTEGER,
                UNIQUE(domain, path)
            );

            CREATE TABLE IF NOT EXISTS loads (
                id INTEGER PRIMARY KEY,
                target TEXT NOT NULL UNIQUE,
                package_name TEXT NOT NULL,
                domain TEXT NOT NULL,
                path TEXT NOT NULL,
                sub_path TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                ref_name TEXT NOT NULL,
                selector TEXT NOT NULL,
                loaded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_loads_repo ON loads(domain, path);
            ",
        )
    }

    /// Insert a mirror row, or update its URL if it already exists.
    pub fn record_mirror(&self, key: &RepoKey, url: &str) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO mirrors (domain, path, url, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(domain, path) DO UPDATE SET url = excluded.url",
            params![key.domain.as_str(), key.path.as_str(), url, now_unix()],
        )?;
        Ok(())
    }

    /// Stamp a successful fetch.
    pub fn record_fetch(&self, key: &RepoKey) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "UPDATE mirrors SET last_fetch_at = ?1 WHERE domain = ?2 AND path = ?3",
            params![now_unix(), key.domain.as_str(), key.path.as_str()],
        )?;
        Ok(())
    }

    /// Get a mirror row.
    pub fn mirror(&self, key: &RepoKey) -> Result<Option<MirrorRecord>, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT url, created_at, last_fetch_at FROM mirrors WHERE domain = ?1 AND path = ?2",
                params![key.domain.as_str(), key.path.as_str()],
                |row| {
                    Ok(MirrorRecord {
                        key: key.clone(),
                        url: row.get(0)?,
                        created_at: row.get(1)?,
                        last_fetch_at: row.get(2)?,
                    })
                },
            )
            .optional()
    }

    /// All mirror rows, sorted by identity. Rows whose identity no longer
    /// parses are skipped.
    pub fn mirrors(&self) -> Result<Vec<MirrorRecord>, rusqlite::Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT domain, path, url, created_at, last_fetch_at FROM mirrors ORDER BY domain, path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (domain, path, url, created_at, last_fetch_at) = row?;
            match parse_key(&domain, &path) {
                Some(key) => out.push(MirrorRecord {
                    key,
                    url,
                    created_at,
                    last_fetch_at,
                }),
                None => log::warn!("ignoring index row with bad identity {}/{}", domain, path),
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    /// Delete a mirror row. Load rows are history and stay.
    pub fn remove_mirror(&self, key: &RepoKey) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "DELETE FROM mirrors WHERE domain = ?1 AND path = ?2",
            params![key.domain.as_str(), key.path.as_str()],
        )?;
        Ok(())
    }

    /// Record (or replace) what was loaded into a target.
    pub fn record_load(&self, record: &LoadRecord) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO loads (target, package_name, domain, path, sub_path, commit_sha, ref_name, selector, loaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(target) DO UPDATE SET
                package_name = excluded.package_name,
                domain = excluded.domain,
                path = excluded.path,
                sub_path = excluded.sub_path,
                commit_sha = excluded.commit_sha,
                ref_name = excluded.ref_name,
                selector = excluded.selector,
                loaded_at = excluded.loaded_at",
            params![
                record.target.to_string_lossy(),
                record.package_name,
                record.key.domain.as_str(),
                record.key.path.as_str(),
                record.sub_path,
                record.commit,
                record.ref_name,
                record.selector,
                record.loaded_at,
            ],
        )?;
        Ok(())
    }

    /// All load rows, sorted by target.
    pub fn loads(&self) -> Result<Vec<LoadRecord>, rusqlite::Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target, package_name, domain, path, sub_path, commit_sha, ref_name, selector, loaded_at
             FROM loads ORDER BY target",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (target, package_name, domain, path, sub_path, commit, ref_name, selector, loaded_at) =
                row?;
            let Some(key) = parse_key(&domain, &path) else {
                continue;
            };
            out.push(LoadRecord {
                target: PathBuf::from(target),
                package_name,
                key,
                sub_path,
                commit,
                ref_name,
                selector,
                loaded_at,
            });
        }
        Ok(out)
    }

    /// The load row for one target.
    pub fn load_for(&self, target: &Path) -> Result<Option<LoadRecord>, rusqlite::Error> {
        Ok(self
            .loads()?
            .into_iter()
            .find(|record| record.target == target))
    }

    /// Forget a target (after it was removed by hand).
    pub fn forget_load(&self, target: &Path) -> Result<bool, rusqlite::Error> {
        let removed = self.conn().execute(
            "DELETE FROM loads WHERE target = ?1",
            params![target.to_string_lossy()],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_state() -> (State, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let state = State::open(&dir.path().join("index.db")).unwrap();
        state.init().unwrap();
        (state, dir)
    }

    fn key(s: &str) -> RepoKey {
        s.parse().unwrap()
    }

    fn load(target: &str, commit: &str) -> LoadRecord {
        LoadRecord {
            target: PathBuf::from(target),
            package_name: "widgets".to_string(),
            key: key("github.com/acme/widgets"),
            sub_path: "pkg".to_string(),
            commit: commit.to_string(),
            ref_name: "v1.0.0".to_string(),
            selector: "latest".to_string(),
            loaded_at: 42,
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let (state, _dir) = create_test_state();
        state.init().unwrap();
        assert!(state.mirrors().unwrap().is_empty());
    }

    #[test]
    fn test_record_and_list_mirrors() {
        let (state, _dir) = create_test_state();
        state
            .record_mirror(&key("gitlab.com/z/last"), "https://gitlab.com/z/last.git")
            .unwrap();
        state
            .record_mirror(&key("github.com/a/first"), "https://github.com/a/first.git")
            .unwrap();

        let mirrors = state.mirrors().unwrap();
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[0].key, key("github.com/a/first"));
        assert_eq!(mirrors[0].last_fetch_at, None);
    }

    #[test]
    fn test_record_mirror_updates_url() {
        let (state, _dir) = create_test_state();
        let k = key("github.com/a/b");
        state.record_mirror(&k, "https://old/a/b").unwrap();
        state.record_mirror(&k, "https://new/a/b").unwrap();
        let row = state.mirror(&k).unwrap().unwrap();
        assert_eq!(row.url, "https://new/a/b");
        assert_eq!(state.mirrors().unwrap().len(), 1);
    }

    #[test]
    fn test_record_fetch_and_remove() {
        let (state, _dir) = create_test_state();
        let k = key("github.com/a/b");
        state.record_mirror(&k, "u").unwrap();
        state.record_fetch(&k).unwrap();
        assert!(state.mirror(&k).unwrap().unwrap().last_fetch_at.is_some());

        state.remove_mirror(&k).unwrap();
        assert!(state.mirror(&k).unwrap().is_none());
    }

    #[test]
    fn test_load_round_trip_and_replace() {
        let (state, _dir) = create_test_state();
        state.record_load(&load("/p/widgets", "aaa")).unwrap();
        state.record_load(&load("/p/widgets", "bbb")).unwrap();
        state.record_load(&load("/p/other", "ccc")).unwrap();

        let loads = state.loads().unwrap();
        assert_eq!(loads.len(), 2);
        let widgets = state.load_for(Path::new("/p/widgets")).unwrap().unwrap();
        assert_eq!(widgets.commit, "bbb");
        assert_eq!(widgets.key, key("github.com/acme/widgets"));

        assert!(state.forget_load(Path::new("/p/widgets")).unwrap());
        assert!(!state.forget_load(Path::new("/p/widgets")).unwrap());
        assert_eq!(state.loads().unwrap().len(), 1);
    }

    #[test]
    fn test_state_shared_between_handles() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("index.db");
        let first = State::open(&db).unwrap();
        first.init().unwrap();
        first.record_mirror(&key("github.com/a/b"), "u").unwrap();

        let second = State::open(&db).unwrap();
        second.init().unwrap();
        assert_eq!(second.mirrors().unwrap().len(), 1);
    }
}
