//! Git mirror cache

mod backfill;
mod export;
pub mod git;
mod lock;
mod negative;
mod paths;
mod repo;
mod staleness;
pub mod swap;

pub use backfill::dir_size;
pub use git::{GitCli, GitError, TagDetails};
pub use lock::{DEFAULT_LOCK_TIMEOUT, RepoLock};
pub use negative::NegativeCache;
pub use paths::CachePaths;
pub use repo::{CacheEntry, CacheError, CacheOptions, ExportedTree, Freshness, RepoCache};
