//! treeport: load versioned sub-trees of git repositories into a project, and
//! publish tagged releases of a package.
//!
//! - [`resolve`] / [`version`]: selector to commit, semver ordering of tags
//! - [`cache`]: one bare mirror per remote, fetch and subtree export
//! - [`load`]: materialize one descriptor, or a whole manifest on a pool
//! - [`publish`]: commit, tag and push from a work tree
//! - [`manifest`] / [`config`]: the JSON surfaces

pub mod cache;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod load;
pub mod manifest;
pub mod publish;
pub mod resolve;
pub mod state;
pub mod types;
pub mod version;

#[cfg(test)]
mod testutil;
