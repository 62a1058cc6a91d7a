#![forbid(unsafe_code)]
//! FUSE adapter for StrataFS.
//!
//! A thin translation layer: kernel requests arrive via the `fuser` crate,
//! get forwarded to the live tree (from `strata-core`), and errors are
//! mapped through [`StrataError::to_errno()`]. The adapter keeps a table
//! from kernel-visible inode numbers to live nodes; entries are registered
//! on lookup/readdir/create and kept for the life of the session.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strata_core::{ChildEntry, LiveDir, LiveNode, NodeAttr, NodeKind, SetAttrRequest};
use strata_error::StrataError;
use strata_types::HandleId;
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. The tree mutates underneath the
/// kernel, so keep it short.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
    }
}

fn to_file_attr(attr: &NodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_or_now(value: TimeOrNow) -> SystemTime {
    match value {
        TimeOrNow::SpecificTime(when) => when,
        TimeOrNow::Now => SystemTime::now(),
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter serving a resolved live tree.
///
/// `root` is `None` only for an empty read-only store; in that case the
/// adapter synthesizes an empty root directory and rejects every lookup.
pub struct StrataFuse {
    root: Option<Arc<LiveDir>>,
    nodes: RwLock<HashMap<u64, LiveNode>>,
}

impl StrataFuse {
    #[must_use]
    pub fn new(root: Option<Arc<LiveDir>>) -> Self {
        let mut nodes = HashMap::new();
        if let Some(dir) = &root {
            nodes.insert(dir.ino().0, LiveNode::Dir(Arc::clone(dir)));
        }
        Self {
            root,
            nodes: RwLock::new(nodes),
        }
    }

    fn node(&self, ino: u64) -> Option<LiveNode> {
        if ino == FUSE_ROOT_ID {
            return self.root.as_ref().map(|dir| LiveNode::Dir(Arc::clone(dir)));
        }
        self.nodes.read().get(&ino).cloned()
    }

    fn dir(&self, ino: u64) -> Result<Arc<LiveDir>, c_int> {
        match self.node(ino) {
            Some(LiveNode::Dir(dir)) => Ok(dir),
            Some(LiveNode::File(_)) => Err(libc::ENOTDIR),
            None => Err(libc::ENOENT),
        }
    }

    fn file(&self, ino: u64) -> Result<Arc<strata_core::LiveFile>, c_int> {
        match self.node(ino) {
            Some(LiveNode::File(file)) => Ok(file),
            Some(LiveNode::Dir(_)) => Err(libc::EISDIR),
            None => Err(libc::ENOENT),
        }
    }

    fn register(&self, node: &LiveNode) {
        self.nodes.write().insert(node.ino().0, node.clone());
    }

    /// Attribute block for a node, with the kernel's root id substituted
    /// when the kernel addressed the node as the mount root.
    fn attr_for(&self, kernel_ino: u64, node: &LiveNode) -> Result<FileAttr, StrataError> {
        let mut out = to_file_attr(&node.attr()?);
        if kernel_ino == FUSE_ROOT_ID {
            out.ino = FUSE_ROOT_ID;
        }
        Ok(out)
    }

    /// Synthesized attributes for the root of an empty read-only store.
    fn empty_root_attr(req: &Request<'_>) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: FUSE_ROOT_ID,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for StrataFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == FUSE_ROOT_ID && self.root.is_none() {
            reply.attr(&ATTR_TTL, &Self::empty_root_attr(req));
            return;
        }
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for(ino, &node) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => {
                warn!(ino, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let request = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        let outcome = match self.node(ino) {
            Some(LiveNode::Dir(dir)) => dir.set_attr(&request),
            Some(LiveNode::File(file)) => file.set_attr(&request),
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match outcome {
            Ok(attr) => {
                let mut out = to_file_attr(&attr);
                if ino == FUSE_ROOT_ID {
                    out.ino = FUSE_ROOT_ID;
                }
                reply.attr(&ATTR_TTL, &out);
            }
            Err(e) => {
                warn!(ino, error = %e, "setattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_dir = match self.dir(parent) {
            Ok(dir) => dir,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child) = parent_dir.lookup(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.register(&child);
        match self.attr_for(child.ino().0, &child) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                warn!(parent, name, error = %e, "lookup failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let skip = usize::try_from(offset).unwrap_or(0);
        if ino == FUSE_ROOT_ID && self.root.is_none() {
            let entries = [(FUSE_ROOT_ID, "."), (FUSE_ROOT_ID, "..")];
            for (index, (entry_ino, name)) in entries.iter().enumerate().skip(skip) {
                if reply.add(*entry_ino, index as i64 + 1, FileType::Directory, name) {
                    break;
                }
            }
            reply.ok();
            return;
        }

        let dir = match self.dir(ino) {
            Ok(dir) => dir,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let entries: Vec<ChildEntry> = dir.read_dir_all();
        for (index, entry) in entries.iter().enumerate().skip(skip) {
            // Make child inodes resolvable before the kernel comes back
            // with a getattr on them.
            if entry.name != "." && entry.name != ".." {
                if let Some(child) = dir.lookup(&entry.name) {
                    self.register(&child);
                }
            }
            let full = reply.add(
                entry.ino.0,
                index as i64 + 1,
                to_fuser_file_type(entry.kind),
                OsStr::new(&entry.name),
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_dir = match self.dir(parent) {
            Ok(dir) => dir,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match parent_dir.create_dir(name) {
            Ok(child) => {
                let node = LiveNode::Dir(child);
                self.register(&node);
                match self.attr_for(node.ino().0, &node) {
                    Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Err(e) => {
                warn!(parent, name, error = %e, "mkdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let format = mode & u32::from(libc::S_IFMT);
        if format != 0 && format != u32::from(libc::S_IFREG) {
            reply.error(StrataError::UnsupportedType.to_errno());
            return;
        }
        let parent_dir = match self.dir(parent) {
            Ok(dir) => dir,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match parent_dir.create_file(name, flags, mode & 0o7777) {
            Ok((file, handle)) => {
                let node = LiveNode::File(file);
                self.register(&node);
                match self.attr_for(node.ino().0, &node) {
                    Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, handle.0, 0),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Err(e) => {
                warn!(parent, name, error = %e, "create failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, true, reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let file = match self.file(ino) {
            Ok(file) => file,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match file.open(flags, 0o644) {
            Ok(handle) => reply.opened(handle.0, 0),
            Err(e) => {
                warn!(ino, flags, error = %e, "open failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let file = match self.file(ino) {
            Ok(file) => file,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match file.read(HandleId(fh), offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, fh, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file = match self.file(ino) {
            Ok(file) => file,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match file.write(HandleId(fh), offset, data) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => {
                warn!(ino, fh, offset, error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let file = match self.file(ino) {
            Ok(file) => file,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match file.fsync(HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(ino, fh, error = %e, "fsync failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let file = match self.file(ino) {
            Ok(file) => file,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match file.release(HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(ino, fh, error = %e, "release failed");
                reply.error(e.to_errno());
            }
        }
    }
}

impl StrataFuse {
    fn remove_entry(&mut self, parent: u64, name: &OsStr, want_dir: bool, reply: ReplyEmpty) {
        let parent_dir = match self.dir(parent) {
            Ok(dir) => dir,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match parent_dir.remove(name, want_dir) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(parent, name, want_dir, error = %e, "remove failed");
                reply.error(e.to_errno());
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("stratafs".to_owned()),
        MountOption::Subtype("strata".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// Mount the live tree at `mountpoint`, blocking until unmounted.
pub fn mount(
    root: Option<Arc<LiveDir>>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = StrataFuse::new(root);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background; unmounts when the returned session drops.
pub fn mount_background(
    root: Option<Arc<LiveDir>>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = StrataFuse::new(root);
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;
    use strata_types::InodeNumber;

    #[test]
    fn file_type_conversion_covers_both_kinds() {
        assert_eq!(to_fuser_file_type(NodeKind::File), FileType::RegularFile);
        assert_eq!(to_fuser_file_type(NodeKind::Directory), FileType::Directory);
    }

    #[test]
    fn node_attr_to_file_attr_conversion() {
        let attr = NodeAttr {
            ino: InodeNumber(42),
            size: 1024,
            blocks: 2,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: NodeKind::File,
            perm: 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
        };
        let out = to_file_attr(&attr);
        assert_eq!(out.ino, 42);
        assert_eq!(out.size, 1024);
        assert_eq!(out.kind, FileType::RegularFile);
        assert_eq!(out.perm, 0o644);
        assert_eq!(out.uid, 1000);
        assert_eq!(out.flags, 0);
    }

    #[test]
    fn mount_options_build_includes_ro_only_when_asked() {
        let writable = build_mount_options(&MountOptions::default());
        assert!(!writable.iter().any(|o| matches!(o, MountOption::RO)));

        let ro = build_mount_options(&MountOptions {
            read_only: true,
            ..MountOptions::default()
        });
        assert!(ro.iter().any(|o| matches!(o, MountOption::RO)));
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let err = mount(None, "", &MountOptions::default()).expect_err("empty mountpoint");
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn adapter_with_no_root_resolves_nothing_but_the_root_ino() {
        let fs = StrataFuse::new(None);
        assert!(fs.node(FUSE_ROOT_ID).is_none());
        assert!(fs.node(2).is_none());
    }
}
