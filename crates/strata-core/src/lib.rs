#![forbid(unsafe_code)]
//! Layered version store and live node graph for StrataFS.
//!
//! A backing store directory holds an ordered chain of snapshot *versions*
//! (`ver_<16-hex unix seconds>/`), each a partial mirror of the logical
//! namespace plus a tombstone metadata file. [`Database`] loads and orders
//! the chain; [`Version`] composes the union of itself and its ancestors;
//! [`LiveDir`]/[`LiveFile`] expose the composed namespace to a mount
//! transport and materialize mutations into the newest version (the *head*)
//! by copy-up, leaving ancestor layers untouched.

mod db;
mod dir;
mod file;
mod meta;
mod node;
mod version;

pub use db::Database;
pub use dir::LiveDir;
pub use file::LiveFile;
pub use meta::VersionMeta;
pub use node::{LayerNode, NodeAttr, NodeKind, SetAttrRequest};
pub use version::Version;

use std::sync::Arc;
use strata_error::Result;
use strata_types::InodeNumber;

/// A namespace entry as seen by the transport: directory or file.
#[derive(Clone, Debug)]
pub enum LiveNode {
    Dir(Arc<LiveDir>),
    File(Arc<LiveFile>),
}

impl LiveNode {
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        match self {
            Self::Dir(dir) => dir.ino(),
            Self::File(file) => file.ino(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Dir(_) => NodeKind::Directory,
            Self::File(_) => NodeKind::File,
        }
    }

    pub fn attr(&self) -> Result<NodeAttr> {
        match self {
            Self::Dir(dir) => dir.attr(),
            Self::File(file) => file.attr(),
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub ino: InodeNumber,
    pub name: String,
    pub kind: NodeKind,
}

// ── Logical path helpers ────────────────────────────────────────────────────
//
// Logical paths are absolute within the union namespace: `/`, `/a`, `/a/b`.
// They are plain strings, not host paths; rebasing onto a version's backing
// directory happens in `Version::rebase_path`.

/// Join a child name onto a logical directory path.
#[must_use]
pub fn join_logical(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Logical parent of a path; `None` for the root.
#[must_use]
pub fn logical_parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Whether `ancestor` equals `path` or names one of its ancestors, with the
/// comparison anchored at path boundaries (`/d` covers `/d/a` but not `/da`).
#[must_use]
pub fn is_ancestor_or_equal(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return true;
    }
    if ancestor == "/" {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_root_and_nested_parents() {
        assert_eq!(join_logical("/", "a"), "/a");
        assert_eq!(join_logical("/a", "b"), "/a/b");
    }

    #[test]
    fn logical_parent_walks_to_root() {
        assert_eq!(logical_parent("/a/b/c"), Some("/a/b"));
        assert_eq!(logical_parent("/a"), Some("/"));
        assert_eq!(logical_parent("/"), None);
    }

    #[test]
    fn ancestor_check_is_path_boundary_aware() {
        assert!(is_ancestor_or_equal("/d", "/d"));
        assert!(is_ancestor_or_equal("/d", "/d/a"));
        assert!(is_ancestor_or_equal("/d", "/d/a/b"));
        assert!(is_ancestor_or_equal("/", "/anything"));
        assert!(!is_ancestor_or_equal("/d", "/da"));
        assert!(!is_ancestor_or_equal("/d/a", "/d"));
    }
}
