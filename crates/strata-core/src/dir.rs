//! Live directories: the in-memory namespace objects servicing directory
//! requests from the mount transport.
//!
//! A live directory holds its composed children by name and the layered
//! node backing its own entry. Mutations promote the directory into the
//! head version first, then apply the change to the head's backing tree
//! and metadata.

use crate::file::LiveFile;
use crate::node::{LayerNode, NodeAttr, NodeKind, SetAttrRequest};
use crate::version::Version;
use crate::{join_logical, ChildEntry, LiveNode};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::sync::{Arc, Weak};
use strata_error::{Result, StrataError};
use strata_types::{Counters, HandleId, InodeNumber};
use tracing::debug;

#[derive(Debug)]
struct DirInner {
    node: LayerNode,
    children: BTreeMap<String, LiveNode>,
}

/// A directory in the live tree.
#[derive(Debug)]
pub struct LiveDir {
    ino: InodeNumber,
    counters: Arc<Counters>,
    parent: Weak<LiveDir>,
    inner: RwLock<DirInner>,
}

impl LiveDir {
    #[must_use]
    pub fn new(node: LayerNode, counters: Arc<Counters>, parent: Weak<LiveDir>) -> Arc<Self> {
        let ino = counters.allocate_inode();
        Arc::new(Self {
            ino,
            counters,
            parent,
            inner: RwLock::new(DirInner {
                node,
                children: BTreeMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub(crate) fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    #[must_use]
    pub fn logical_path(&self) -> String {
        self.inner.read().node.path().to_owned()
    }

    /// Attributes of the backing entry, with this directory's inode number.
    pub fn attr(&self) -> Result<NodeAttr> {
        let inner = self.inner.read();
        let mut attr = inner.node.attr()?;
        attr.ino = self.ino;
        Ok(attr)
    }

    /// Promote, then apply the request to the (now head-bound) backing path.
    pub fn set_attr(&self, req: &SetAttrRequest) -> Result<NodeAttr> {
        let mut inner = self.inner.write();
        promote_dir(&mut inner)?;
        let mut attr = inner.node.set_attr(req)?;
        attr.ino = self.ino;
        Ok(attr)
    }

    /// Find a child by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<LiveNode> {
        self.inner.read().children.get(name).cloned()
    }

    /// Full listing: `.`, `..` when this directory has a parent, then every
    /// child. Order across children is not part of the contract.
    #[must_use]
    pub fn read_dir_all(&self) -> Vec<ChildEntry> {
        let inner = self.inner.read();
        let mut entries = vec![ChildEntry {
            ino: self.ino,
            name: ".".to_owned(),
            kind: NodeKind::Directory,
        }];
        if let Some(parent) = self.parent.upgrade() {
            entries.push(ChildEntry {
                ino: parent.ino(),
                name: "..".to_owned(),
                kind: NodeKind::Directory,
            });
        }
        for (name, child) in &inner.children {
            entries.push(ChildEntry {
                ino: child.ino(),
                name: name.clone(),
                kind: child.kind(),
            });
        }
        entries
    }

    /// Create a subdirectory in the head version.
    pub fn create_dir(self: &Arc<Self>, name: &str) -> Result<Arc<LiveDir>> {
        let mut inner = self.inner.write();
        if inner.children.contains_key(name) {
            return Err(StrataError::AlreadyExists {
                path: join_logical(inner.node.path(), name).into(),
            });
        }
        promote_dir(&mut inner)?;

        let head = Arc::clone(inner.node.version());
        let child_path = join_logical(inner.node.path(), name);
        let rebased = head.rebase_path(&child_path);
        match fs::create_dir(&rebased) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StrataError::AlreadyExists { path: rebased });
            }
            Err(err) => return Err(err.into()),
        }

        let node = LayerNode::new(
            child_path.clone(),
            Arc::clone(&head),
            NodeKind::Directory,
            true,
            None,
        );
        let child = LiveDir::new(node, self.counters(), Arc::downgrade(self));
        head.mark_created(&child_path);
        inner.children.insert(name.to_owned(), LiveNode::Dir(Arc::clone(&child)));
        debug!(path = %child_path, "created directory");
        Ok(child)
    }

    /// Create a regular file in the head version and open a handle on it.
    pub fn create_file(
        self: &Arc<Self>,
        name: &str,
        flags: i32,
        mode: u32,
    ) -> Result<(Arc<LiveFile>, HandleId)> {
        let mut inner = self.inner.write();
        if inner.children.contains_key(name) {
            return Err(StrataError::AlreadyExists {
                path: join_logical(inner.node.path(), name).into(),
            });
        }
        promote_dir(&mut inner)?;

        let head = Arc::clone(inner.node.version());
        let child_path = join_logical(inner.node.path(), name);
        let node = LayerNode::new(
            child_path.clone(),
            Arc::clone(&head),
            NodeKind::File,
            true,
            None,
        );
        let file = LiveFile::new(node, self.counters(), Arc::downgrade(self));
        let handle = file.open(flags | libc::O_CREAT, mode)?;
        head.mark_created(&child_path);
        inner
            .children
            .insert(name.to_owned(), LiveNode::File(Arc::clone(&file)));
        debug!(path = %child_path, "created file");
        Ok((file, handle))
    }

    /// Remove a named child.
    ///
    /// Bytes are unlinked from the head layer when the child lives there;
    /// a tombstone goes into the head metadata whenever an older layer
    /// still carries the path. Historical layers are never touched.
    pub fn remove(&self, name: &str, want_dir: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let child = inner
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(name.to_owned()))?;

        let (path, version, is_new, has_older) = match (&child, want_dir) {
            (LiveNode::Dir(dir), true) => {
                if !dir.has_no_children() {
                    return Err(StrataError::NotEmpty);
                }
                dir.layer_facts()
            }
            (LiveNode::File(file), false) => file.layer_facts(),
            (LiveNode::Dir(_), false) => return Err(StrataError::IsDirectory),
            (LiveNode::File(_), true) => return Err(StrataError::NotDirectory),
        };

        if is_new {
            let rebased = version.rebase_path(&path);
            if want_dir {
                fs::remove_dir_all(&rebased)?;
            } else {
                fs::remove_file(&rebased)?;
            }
        }
        if !is_new || has_older {
            version.head()?.mark_removed(&path);
        }

        inner.children.remove(name);
        debug!(path = %path, tombstoned = !is_new || has_older, "removed entry");
        Ok(())
    }

    /// Attach a pre-built child; used while resolving the tree.
    pub(crate) fn attach(&self, name: &str, child: LiveNode) {
        self.inner.write().children.insert(name.to_owned(), child);
    }

    pub(crate) fn has_no_children(&self) -> bool {
        self.inner.read().children.is_empty()
    }

    pub(crate) fn layer_facts(&self) -> (String, Arc<Version>, bool, bool) {
        let inner = self.inner.read();
        (
            inner.node.path().to_owned(),
            Arc::clone(inner.node.version()),
            inner.node.is_new(),
            inner.node.older().is_some(),
        )
    }

    /// Number of live children; listing order aside, this is what a reader
    /// of the union sees.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.read().children.len()
    }
}

/// Rebind a directory to the head version if it is not already there.
///
/// Creates the rebased path (and any missing parents) in the head layer and
/// marks the head metadata modified. Idempotent: a node already new in head
/// is left alone, so repeated promotion does no extra work.
fn promote_dir(inner: &mut DirInner) -> Result<()> {
    if inner.node.is_new() {
        return Ok(());
    }
    let head = inner.node.version().head()?;
    let node = LayerNode::new(
        inner.node.path().to_owned(),
        Arc::clone(&head),
        NodeKind::Directory,
        true,
        None,
    );
    fs::create_dir_all(node.rebased_path())?;
    head.mark_modified(node.path());
    debug!(path = %node.path(), "promoted directory into head");

    let shadowed = std::mem::replace(&mut inner.node, node);
    inner.node.set_older(shadowed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{encode_version_name, VersionStamp};

    fn mk_version(
        store: &std::path::Path,
        secs: i64,
        parent: Option<Arc<Version>>,
    ) -> Arc<Version> {
        let base = store.join(encode_version_name(VersionStamp(secs)));
        fs::create_dir_all(base.join("root")).expect("mk version dirs");
        Version::open(base, VersionStamp(secs), parent, false).expect("open version")
    }

    /// Two-layer chain with the head resolved into a live tree.
    fn two_layer_tree(
        store: &std::path::Path,
    ) -> (Arc<Version>, Arc<Version>, Arc<LiveDir>) {
        let v1 = mk_version(store, 1, None);
        fs::create_dir(v1.rebase_path("/old_dir")).expect("mkdir");
        fs::write(v1.rebase_path("/old_dir/f"), b"v1 bytes").expect("write");

        let v2 = mk_version(store, 2, Some(Arc::clone(&v1)));
        v1.set_head(&v2);
        v2.set_head(&v2);

        let counters = Arc::new(Counters::new());
        let root = v2.resolve(&counters).expect("resolve");
        (v1, v2, root)
    }

    fn child_dir(root: &Arc<LiveDir>, name: &str) -> Arc<LiveDir> {
        match root.lookup(name) {
            Some(LiveNode::Dir(dir)) => dir,
            _ => panic!("expected directory child {name}"),
        }
    }

    #[test]
    fn mkdir_lands_in_head_and_is_visible() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, v2, root) = two_layer_tree(store.path());

        let sub = root.create_dir("fresh").expect("mkdir");
        assert!(v2.rebase_path("/fresh").is_dir());
        assert_eq!(sub.logical_path(), "/fresh");
        assert!(matches!(root.lookup("fresh"), Some(LiveNode::Dir(_))));
    }

    #[test]
    fn mkdir_collision_is_already_exists() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, _v2, root) = two_layer_tree(store.path());
        root.create_dir("dup").expect("first mkdir");
        let err = root.create_dir("dup").expect_err("second mkdir");
        assert!(matches!(err, StrataError::AlreadyExists { .. }));
    }

    #[test]
    fn creating_inside_ancestor_dir_promotes_it() {
        let store = tempfile::tempdir().expect("tempdir");
        let (v1, v2, root) = two_layer_tree(store.path());
        let old_dir = child_dir(&root, "old_dir");

        // The directory lives in v1 until something inside it changes.
        assert!(!v2.rebase_path("/old_dir").exists());
        old_dir.create_dir("nested").expect("mkdir in ancestor dir");

        assert!(v2.rebase_path("/old_dir/nested").is_dir());
        // v1's copy is untouched.
        assert!(v1.rebase_path("/old_dir").is_dir());
        assert!(!v1.rebase_path("/old_dir/nested").exists());
    }

    #[test]
    fn repeated_promotion_is_idempotent() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, v2, root) = two_layer_tree(store.path());
        let old_dir = child_dir(&root, "old_dir");

        old_dir.create_dir("a").expect("first mutation");
        let (_, version, is_new, has_older) = old_dir.layer_facts();
        assert!(is_new);
        assert!(has_older);
        assert_eq!(version.stamp(), v2.stamp());

        // A second mutation finds the directory already head-bound.
        old_dir.create_dir("b").expect("second mutation");
        let (_, version_again, still_new, _) = old_dir.layer_facts();
        assert!(still_new);
        assert_eq!(version_again.stamp(), v2.stamp());
    }

    #[test]
    fn remove_of_ancestor_file_records_head_tombstone_only() {
        let store = tempfile::tempdir().expect("tempdir");
        let (v1, v2, root) = two_layer_tree(store.path());
        let old_dir = child_dir(&root, "old_dir");

        old_dir.remove("f", false).expect("remove");
        assert!(root.lookup("old_dir").is_some());
        assert!(old_dir.lookup("f").is_none());
        // Ancestor bytes survive; the deletion is a head tombstone.
        assert!(v1.rebase_path("/old_dir/f").exists());
        assert!(v2.meta().suppresses("/old_dir/f"));
    }

    #[test]
    fn remove_of_fresh_entry_unlinks_without_tombstone() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, v2, root) = two_layer_tree(store.path());

        root.create_dir("scratch").expect("mkdir");
        root.remove("scratch", true).expect("rmdir");
        assert!(!v2.rebase_path("/scratch").exists());
        assert!(v2.meta().is_empty());
        assert!(root.lookup("scratch").is_none());
    }

    #[test]
    fn remove_nonempty_dir_is_rejected() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, _v2, root) = two_layer_tree(store.path());
        let err = root.remove("old_dir", true).expect_err("non-empty");
        assert!(matches!(err, StrataError::NotEmpty));
    }

    #[test]
    fn remove_checks_entry_kind() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, _v2, root) = two_layer_tree(store.path());
        assert!(matches!(
            root.remove("old_dir", false).expect_err("dir as file"),
            StrataError::IsDirectory
        ));
        assert!(matches!(
            root.remove("missing", true).expect_err("missing"),
            StrataError::NotFound(_)
        ));
    }

    #[test]
    fn readdir_lists_dot_entries_and_children() {
        let store = tempfile::tempdir().expect("tempdir");
        let (_v1, _v2, root) = two_layer_tree(store.path());
        let old_dir = child_dir(&root, "old_dir");

        let root_names: Vec<String> =
            root.read_dir_all().into_iter().map(|e| e.name).collect();
        assert!(root_names.contains(&".".to_owned()));
        assert!(!root_names.contains(&"..".to_owned()));
        assert!(root_names.contains(&"old_dir".to_owned()));

        let sub_entries = old_dir.read_dir_all();
        let dotdot = sub_entries
            .iter()
            .find(|e| e.name == "..")
            .expect("subdir has ..");
        assert_eq!(dotdot.ino, root.ino());
    }
}
