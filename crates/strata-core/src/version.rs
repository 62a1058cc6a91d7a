//! A single snapshot layer and the chain resolver that composes layers.
//!
//! Each version owns a backing directory (`<store>/ver_<hex>`) whose `root/`
//! subtree mirrors only the entries created or modified in that layer, plus
//! the layer's tombstone metadata. `scan_dir` composes this layer over its
//! ancestors into one name→node map per logical directory; `resolve` turns
//! the composed maps into the live tree served to the mount.

use crate::dir::LiveDir;
use crate::meta::{meta_path, VersionMeta};
use crate::node::{LayerNode, NodeKind};
use crate::{join_logical, LiveNode};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use strata_error::{Result, StrataError};
use strata_types::{Counters, VersionStamp};
use tracing::{debug, info, warn};

/// One snapshot layer of the store.
#[derive(Debug)]
pub struct Version {
    base: PathBuf,
    stamp: VersionStamp,
    parent: Option<Arc<Version>>,
    meta: Mutex<VersionMeta>,
    /// Newest version of the chain this layer belongs to; promotions copy
    /// into it. Back-reference only, set once the chain is linked.
    head: RwLock<Weak<Version>>,
    /// Whether this process created the layer's directory at open time.
    /// Only such a head may be collected again by `finalize`.
    created_this_run: bool,
}

impl Version {
    /// Open a version rooted at `base`, loading its metadata.
    pub fn open(
        base: PathBuf,
        stamp: VersionStamp,
        parent: Option<Arc<Version>>,
        created_this_run: bool,
    ) -> Result<Arc<Self>> {
        let meta = VersionMeta::load(meta_path(&base))?;
        Ok(Arc::new(Self {
            base,
            stamp,
            parent,
            meta: Mutex::new(meta),
            head: RwLock::new(Weak::new()),
            created_this_run,
        }))
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    #[must_use]
    pub fn stamp(&self) -> VersionStamp {
        self.stamp
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Version>> {
        self.parent.as_ref()
    }

    /// Rebase a logical path onto this layer's backing tree.
    #[must_use]
    pub fn rebase_path(&self, logical: &str) -> PathBuf {
        let trimmed = logical.trim_start_matches('/');
        if trimmed.is_empty() {
            self.base.join("root")
        } else {
            self.base.join("root").join(trimmed)
        }
    }

    pub(crate) fn set_head(self: &Arc<Self>, head: &Arc<Version>) {
        *self.head.write() = Arc::downgrade(head);
    }

    /// The newest version of the owning chain.
    pub fn head(&self) -> Result<Arc<Version>> {
        self.head
            .read()
            .upgrade()
            .ok_or(StrataError::ChainUnavailable)
    }

    /// Serialized access to this layer's tombstone metadata.
    pub fn meta(&self) -> MutexGuard<'_, VersionMeta> {
        self.meta.lock()
    }

    pub fn mark_removed(&self, path: &str) {
        self.meta.lock().mark_removed(path);
    }

    pub fn mark_created(&self, path: &str) {
        self.meta.lock().mark_created(path);
    }

    pub fn mark_modified(&self, path: &str) {
        self.meta.lock().mark_modified(path);
    }

    /// Compose the union of this layer and all ancestors at logical
    /// directory `path`.
    ///
    /// The inherited map is filtered by this layer's tombstones before this
    /// layer's own entries overlay it; an own entry keeps a link to the
    /// inherited node it shadows. Tombstones never filter the layer's own
    /// `root/` content, so an entry recreated after deletion shadows its own
    /// tombstone.
    pub fn scan_dir(self: &Arc<Self>, path: &str) -> Result<BTreeMap<String, LayerNode>> {
        let base = match &self.parent {
            Some(parent) => {
                let mut inherited = parent.scan_dir(path)?;
                self.meta.lock().filter(&mut inherited);
                Some(inherited)
            }
            None => None,
        };

        let mut own = BTreeMap::new();
        match fs::read_dir(self.rebase_path(path)) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let Ok(name) = entry.file_name().into_string() else {
                        warn!(
                            layer = %self.base.display(),
                            "skipping non-UTF-8 entry name in backing tree"
                        );
                        continue;
                    };
                    let kind = if entry.file_type()?.is_dir() {
                        NodeKind::Directory
                    } else {
                        NodeKind::File
                    };
                    let child_path = join_logical(path, &name);
                    own.insert(
                        name,
                        LayerNode::new(child_path, Arc::clone(self), kind, false, None),
                    );
                }
            }
            // A layer need not carry every directory; absent means "nothing
            // added here".
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        match base {
            None => Ok(own),
            Some(mut merged) => {
                for (name, mut node) in own {
                    if let Some(shadowed) = merged.remove(&name) {
                        node.set_older(shadowed);
                    }
                    merged.insert(name, node);
                }
                Ok(merged)
            }
        }
    }

    /// Materialize this version's live tree: a root directory at `/` with
    /// the full union built beneath it.
    pub fn resolve(self: &Arc<Self>, counters: &Arc<Counters>) -> Result<Arc<LiveDir>> {
        let node = LayerNode::new("/".into(), Arc::clone(self), NodeKind::Directory, false, None);
        let root = LiveDir::new(node, Arc::clone(counters), Weak::new());
        self.build_dir(&root)?;
        Ok(root)
    }

    fn build_dir(self: &Arc<Self>, dir: &Arc<LiveDir>) -> Result<()> {
        let entries = self.scan_dir(&dir.logical_path())?;
        for (name, node) in entries {
            match node.kind() {
                NodeKind::Directory => {
                    let child = LiveDir::new(node, dir.counters(), Arc::downgrade(dir));
                    self.build_dir(&child)?;
                    dir.attach(&name, LiveNode::Dir(child));
                }
                NodeKind::File => {
                    let child = crate::file::LiveFile::new(node, dir.counters(), Arc::downgrade(dir));
                    dir.attach(&name, LiveNode::File(child));
                }
            }
        }
        debug!(layer = %self.base.display(), dir = %dir.logical_path(), "built live directory");
        Ok(())
    }

    /// Persist or collect this layer at shutdown.
    ///
    /// Dirty metadata is saved. A clean metadata set on a head created by
    /// this process means nothing was ever written into the layer, so its
    /// directory is removed rather than left as an empty snapshot.
    pub fn finalize(&self, is_head: bool) -> Result<()> {
        let mut meta = self.meta.lock();
        if meta.dirty() {
            return meta.save();
        }
        if is_head && self.created_this_run && meta.is_empty() {
            drop(meta);
            fs::remove_dir_all(&self.base)?;
            info!(layer = %self.base.display(), "collected empty head version");
        }
        Ok(())
    }
}
