//! Layered nodes: a single namespace entry bound to a specific version.
//!
//! The same logical path can have one node per layer that carries it; the
//! `older` link chains a node to the entry it shadows one layer down. The
//! *rebased path* is where the entry's bytes actually live on the host.

use crate::version::Version;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strata_error::{Result, StrataError};
use strata_types::InodeNumber;

/// Entry kind. Only regular files and directories exist in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Kernel-facing attribute block produced from a stat of a rebased path.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: NodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

/// The subset of attributes a setattr request may carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// One logical entry inside one specific version.
#[derive(Debug)]
pub struct LayerNode {
    path: String,
    version: Arc<Version>,
    older: Option<Box<LayerNode>>,
    kind: NodeKind,
    is_new: bool,
}

impl LayerNode {
    #[must_use]
    pub fn new(
        path: String,
        version: Arc<Version>,
        kind: NodeKind,
        is_new: bool,
        older: Option<Box<LayerNode>>,
    ) -> Self {
        Self {
            path,
            version,
            older,
            kind,
            is_new,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Whether this entry first appears in its owning version (created or
    /// promoted there, as opposed to inherited from an ancestor scan).
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    #[must_use]
    pub fn older(&self) -> Option<&LayerNode> {
        self.older.as_deref()
    }

    /// Chain this node over the entry it shadows one layer down.
    pub fn set_older(&mut self, older: LayerNode) {
        self.older = Some(Box::new(older));
    }

    /// Host path where this entry's bytes live:
    /// `<version base>/root/<logical path>`.
    #[must_use]
    pub fn rebased_path(&self) -> PathBuf {
        self.version.rebase_path(&self.path)
    }

    /// Stat the rebased path into an attribute block. The inode number is
    /// left at zero for the owning live node to override.
    pub fn attr(&self) -> Result<NodeAttr> {
        let rebased = self.rebased_path();
        let meta = fs::metadata(&rebased).map_err(|source| StrataError::NoBackingFile {
            path: rebased.clone(),
            source,
        })?;

        let atime = unix_time(meta.atime(), meta.atime_nsec());
        let mtime = unix_time(meta.mtime(), meta.mtime_nsec());
        let ctime = unix_time(meta.ctime(), meta.ctime_nsec());

        Ok(NodeAttr {
            ino: InodeNumber(0),
            size: meta.size(),
            blocks: meta.blocks(),
            atime,
            mtime,
            ctime,
            crtime: meta.created().unwrap_or(mtime),
            kind: if meta.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        })
    }

    /// Apply the populated fields of `req` to the rebased path, then re-stat
    /// and return the resulting attributes.
    pub fn set_attr(&self, req: &SetAttrRequest) -> Result<NodeAttr> {
        let rebased = self.rebased_path();
        let fail = |source: std::io::Error| StrataError::AttrUpdateFailed {
            path: rebased.clone(),
            source,
        };

        if let Some(mode) = req.mode {
            fs::set_permissions(&rebased, fs::Permissions::from_mode(mode)).map_err(fail)?;
        }

        if req.uid.is_some() || req.gid.is_some() {
            std::os::unix::fs::chown(&rebased, req.uid, req.gid).map_err(fail)?;
        }

        if let Some(size) = req.size {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&rebased)
                .map_err(fail)?;
            file.set_len(size).map_err(fail)?;
        }

        if req.atime.is_some() || req.mtime.is_some() {
            let mut times = fs::FileTimes::new();
            if let Some(atime) = req.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = req.mtime {
                times = times.set_modified(mtime);
            }
            let file = fs::File::open(&rebased).map_err(fail)?;
            file.set_times(times).map_err(fail)?;
        }

        self.attr()
    }
}

/// Build a `SystemTime` from stat's split seconds/nanoseconds, tolerating
/// pre-epoch timestamps.
fn unix_time(secs: i64, nanos: i64) -> SystemTime {
    let base = if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    };
    base + Duration::from_nanos(nanos.max(0) as u64)
}
