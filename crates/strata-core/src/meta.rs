//! Per-version tombstone metadata, persisted as `meta.json`.
//!
//! A tombstone is a logical path deleted in this layer; it suppresses the
//! path and everything under it in every *older* layer when the union is
//! composed. The set is held in memory with a dirty bit and written back
//! atomically on save.

use crate::is_ancestor_or_equal;
use crate::node::LayerNode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use strata_error::{Result, StrataError};
use tracing::debug;

/// Wire format of `meta.json`. Unknown fields are ignored on read and a
/// missing `deleted` field means an empty set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaFile {
    #[serde(default)]
    deleted: Vec<String>,
}

/// In-memory view of one version's `meta.json`.
#[derive(Debug)]
pub struct VersionMeta {
    path: PathBuf,
    deleted: BTreeSet<String>,
    dirty: bool,
}

impl VersionMeta {
    /// Load metadata from `path`. A missing file is an empty, clean set;
    /// an unreadable or unparseable file is `MetadataCorrupt`.
    pub fn load(path: PathBuf) -> Result<Self> {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    deleted: BTreeSet::new(),
                    dirty: false,
                });
            }
            Err(err) => {
                return Err(StrataError::MetadataCorrupt {
                    path,
                    detail: err.to_string(),
                });
            }
        };

        let parsed: MetaFile =
            serde_json::from_slice(&bytes).map_err(|err| StrataError::MetadataCorrupt {
                path: path.clone(),
                detail: err.to_string(),
            })?;

        Ok(Self {
            path,
            deleted: parsed.deleted.into_iter().collect(),
            dirty: false,
        })
    }

    /// Record a deletion in this layer. Marks the set dirty.
    pub fn mark_removed(&mut self, path: &str) {
        self.deleted.insert(path.to_owned());
        self.dirty = true;
    }

    /// Record a creation. Only the dirty bit changes, so the next save
    /// persists the set even when pruning is what altered it.
    pub fn mark_created(&mut self, _path: &str) {
        self.dirty = true;
    }

    /// Record a content modification. Same persistence rule as creation.
    pub fn mark_modified(&mut self, _path: &str) {
        self.dirty = true;
    }

    #[must_use]
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }

    #[must_use]
    pub fn deleted_paths(&self) -> Vec<String> {
        self.deleted.iter().cloned().collect()
    }

    /// Whether a tombstone in this layer covers `path` (exactly or as an
    /// ancestor).
    #[must_use]
    pub fn suppresses(&self, path: &str) -> bool {
        self.deleted
            .iter()
            .any(|tomb| is_ancestor_or_equal(tomb, path))
    }

    /// Erase from `nodes` every entry whose logical path is covered by a
    /// tombstone in this layer.
    pub fn filter(&self, nodes: &mut BTreeMap<String, LayerNode>) {
        if self.deleted.is_empty() {
            return;
        }
        nodes.retain(|_, node| !self.suppresses(node.path()));
    }

    /// Persist the set. No-op while clean. Tombstones whose strict ancestor
    /// is also tombstoned are redundant and dropped from the written form;
    /// the write goes through a temp file and rename.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let deleted: Vec<String> = self
            .deleted
            .iter()
            .filter(|tomb| !self.has_tombstoned_ancestor(tomb.as_str()))
            .cloned()
            .collect();
        let body = serde_json::to_vec(&MetaFile { deleted })
            .map_err(|err| StrataError::MetadataCorrupt {
                path: self.path.clone(),
                detail: err.to_string(),
            })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "saved version metadata");

        self.dirty = false;
        Ok(())
    }

    fn has_tombstoned_ancestor(&self, path: &str) -> bool {
        let mut current = path;
        while let Some(parent) = crate::logical_parent(current) {
            if parent != "/" && self.deleted.contains(parent) {
                return true;
            }
            current = parent;
        }
        false
    }
}

/// Convenience for tests and callers that only need the metadata path.
pub(crate) fn meta_path(version_base: &Path) -> PathBuf {
    version_base.join("meta.json")
}
