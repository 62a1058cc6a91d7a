//! Live files: open-handle lifecycle and read/write dispatch.
//!
//! A live file guards its layered node and handle table with one mutex, so
//! two concurrent opens that both need a copy-up observe exactly one. The
//! actual I/O runs outside the lock on a per-handle descriptor; per-handle
//! ordering is the caller's (the kernel's) business.

use crate::node::{LayerNode, NodeAttr, NodeKind, SetAttrRequest};
use crate::version::Version;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use strata_error::{Result, StrataError};
use strata_types::{Counters, HandleId, InodeNumber};
use tracing::debug;

/// One open descriptor on a live file.
#[derive(Debug)]
struct OpenHandle {
    /// Rebased host path the descriptor was opened at.
    path: PathBuf,
    file: Arc<fs::File>,
}

#[derive(Debug)]
struct FileInner {
    node: LayerNode,
    handles: HashMap<HandleId, OpenHandle>,
}

/// A regular file in the live tree.
#[derive(Debug)]
pub struct LiveFile {
    ino: InodeNumber,
    counters: Arc<Counters>,
    #[allow(dead_code)]
    parent: Weak<crate::dir::LiveDir>,
    inner: Mutex<FileInner>,
}

impl LiveFile {
    #[must_use]
    pub fn new(
        node: LayerNode,
        counters: Arc<Counters>,
        parent: Weak<crate::dir::LiveDir>,
    ) -> Arc<Self> {
        let ino = counters.allocate_inode();
        Arc::new(Self {
            ino,
            counters,
            parent,
            inner: Mutex::new(FileInner {
                node,
                handles: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Attributes of the backing entry, with this file's inode number.
    pub fn attr(&self) -> Result<NodeAttr> {
        let inner = self.inner.lock();
        let mut attr = inner.node.attr()?;
        attr.ino = self.ino;
        Ok(attr)
    }

    /// Promote, then apply the request to the (now head-bound) backing path.
    pub fn set_attr(&self, req: &SetAttrRequest) -> Result<NodeAttr> {
        let mut inner = self.inner.lock();
        promote_file(&mut inner)?;
        let mut attr = inner.node.set_attr(req)?;
        attr.ino = self.ino;
        Ok(attr)
    }

    /// Open a descriptor on this file.
    ///
    /// Anything but a read-only open copies the file up into the head
    /// version first, before the handle becomes visible. Multiple handles
    /// may be open at once; each gets its own descriptor and id.
    pub fn open(&self, flags: i32, mode: u32) -> Result<HandleId> {
        let mut inner = self.inner.lock();
        if (flags & libc::O_ACCMODE) != libc::O_RDONLY {
            promote_file(&mut inner)?;
        }

        let path = inner.node.rebased_path();
        let file = open_options(flags, mode)
            .open(&path)
            .map_err(|source| {
                if flags & libc::O_CREAT != 0 {
                    StrataError::Io(source)
                } else {
                    StrataError::NoBackingFile {
                        path: path.clone(),
                        source,
                    }
                }
            })?;

        let id = self.counters.allocate_handle();
        inner.handles.insert(
            id,
            OpenHandle {
                path,
                file: Arc::new(file),
            },
        );
        debug!(path = %inner.node.path(), handle = %id, "opened file");
        Ok(id)
    }

    /// Positional read. EOF may shorten the returned data.
    pub fn read(&self, handle: HandleId, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = self.descriptor(handle)?;
        read_up_to(&file, offset, size as usize)
    }

    /// Read the whole file, sized by a fresh stat of the handle's path.
    pub fn read_all(&self, handle: HandleId) -> Result<Vec<u8>> {
        let (file, path) = {
            let inner = self.inner.lock();
            let h = inner
                .handles
                .get(&handle)
                .ok_or(StrataError::StaleHandle(handle.0))?;
            (Arc::clone(&h.file), h.path.clone())
        };
        let len = fs::metadata(&path)?.len();
        read_up_to(&file, 0, usize::try_from(len).unwrap_or(usize::MAX))
    }

    /// Positional write; returns the number of bytes written.
    pub fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let file = self.descriptor(handle)?;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Flush one handle's descriptor to stable storage.
    pub fn fsync(&self, handle: HandleId) -> Result<()> {
        let file = self.descriptor(handle)?;
        file.sync_all()?;
        Ok(())
    }

    /// Flush every open handle.
    pub fn fsync_all(&self) -> Result<()> {
        let files: Vec<Arc<fs::File>> = {
            let inner = self.inner.lock();
            inner.handles.values().map(|h| Arc::clone(&h.file)).collect()
        };
        for file in files {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Close a handle and drop it from the table.
    pub fn release(&self, handle: HandleId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .handles
            .remove(&handle)
            .ok_or(StrataError::StaleHandle(handle.0))?;
        debug!(path = %inner.node.path(), handle = %handle, "released file handle");
        Ok(())
    }

    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub(crate) fn layer_facts(&self) -> (String, Arc<Version>, bool, bool) {
        let inner = self.inner.lock();
        (
            inner.node.path().to_owned(),
            Arc::clone(inner.node.version()),
            inner.node.is_new(),
            inner.node.older().is_some(),
        )
    }

    fn descriptor(&self, handle: HandleId) -> Result<Arc<fs::File>> {
        let inner = self.inner.lock();
        inner
            .handles
            .get(&handle)
            .map(|h| Arc::clone(&h.file))
            .ok_or(StrataError::StaleHandle(handle.0))
    }
}

/// Copy a file up into the head version if it is not already there.
///
/// The bytes move before any handle on the new path becomes visible, and
/// the check-then-copy runs under the file mutex, so a file is copied up at
/// most once in its lifetime no matter how many writers race.
fn promote_file(inner: &mut FileInner) -> Result<()> {
    if inner.node.is_new() {
        return Ok(());
    }
    let head = inner.node.version().head()?;
    let node = LayerNode::new(
        inner.node.path().to_owned(),
        Arc::clone(&head),
        NodeKind::File,
        true,
        None,
    );

    let src = inner.node.rebased_path();
    let dst = node.rebased_path();
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&src, &dst)?;
    head.mark_modified(node.path());
    debug!(path = %node.path(), "copied file up into head");

    let shadowed = std::mem::replace(&mut inner.node, node);
    inner.node.set_older(shadowed);
    Ok(())
}

/// Translate open(2)-style flags and a creation mode into `OpenOptions`.
fn open_options(flags: i32, mode: u32) -> fs::OpenOptions {
    let access = flags & libc::O_ACCMODE;
    let mut options = fs::OpenOptions::new();
    options
        .read(access == libc::O_RDONLY || access == libc::O_RDWR)
        .write(access == libc::O_WRONLY || access == libc::O_RDWR)
        .append(flags & libc::O_APPEND != 0)
        .truncate(flags & libc::O_TRUNC != 0)
        .create(flags & libc::O_CREAT != 0)
        .mode(mode);
    options
}

/// Positional read of up to `size` bytes, retrying short reads until EOF.
fn read_up_to(file: &fs::File, offset: u64, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; size];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
