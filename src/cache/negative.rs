//! Negative cache for remotes that recently failed to clone.
//!
//! A batch may name the same unreachable repository many times; remembering
//! the failure for a while means the remote is contacted once, and every
//! other descriptor gets the same error immediately.

use crate::types::RepoKey;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Default TTL for negative cache entries (10 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Entry in the negative cache.
struct NegativeCacheEntry {
    /// When this entry was created.
    cached_at: Instant,
    /// Error text of the failed clone.
    message: String,
}

/// Cache of repositories whose last clone attempt failed.
///
/// Entries expire after `ttl` to allow retrying in case:
/// - A repo was created after we first tried
/// - Credentials were fixed
/// - Transient network issues caused a false negative
pub struct NegativeCache {
    entries: DashMap<RepoKey, NegativeCacheEntry>,
    ttl: Duration,
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NegativeCache {
    /// Create a new negative cache with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create a new negative cache with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Error text of a recent failure for `key`, if any (and not expired).
    pub fn failure(&self, key: &RepoKey) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if entry.cached_at.elapsed() < self.ttl {
                return Some(entry.message.clone());
            }
            // Entry expired, remove it
            drop(entry);
            self.entries.remove(key);
        }
        None
    }

    /// Remember that cloning `key` failed with `message`.
    pub fn record_failure(&self, key: &RepoKey, message: &str) {
        if self.ttl.is_zero() {
            return;
        }
        log::info!("Remembering clone failure for {} for {:?}", key, self.ttl);
        self.entries.insert(
            key.clone(),
            NegativeCacheEntry {
                cached_at: Instant::now(),
                message: message.to_string(),
            },
        );
    }

    /// Forget any failure recorded for `key`.
    pub fn forget(&self, key: &RepoKey) {
        if self.entries.remove(key).is_some() {
            log::debug!("Cleared negative cache entry for {}", key);
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
