#![forbid(unsafe_code)]
//! Shared identifiers for StrataFS.
//!
//! Defines the version-stamp codec (`ver_<16-hex unix seconds>` directory
//! names), the inode/handle allocators, and the id newtypes used across the
//! workspace.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

/// Kernel-visible inode number. Process-unique, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Open-handle id handed back to the kernel as `fh`. Process-unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Allocators ──────────────────────────────────────────────────────────────

/// Monotonic id allocators shared by everything hanging off one database.
///
/// Passed around as `Arc<Counters>` rather than living in module statics so
/// that independent databases opened in the same process (tests, mostly)
/// hand out independent id spaces.
#[derive(Debug, Default)]
pub struct Counters {
    next_inode: AtomicU64,
    next_handle: AtomicU64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next inode number. Safe under concurrent calls.
    pub fn allocate_inode(&self) -> InodeNumber {
        InodeNumber(self.next_inode.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Allocate the next open-handle id. Safe under concurrent calls.
    pub fn allocate_handle(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ── Version stamp codec ─────────────────────────────────────────────────────

/// Creation timestamp of a version, in whole unix seconds.
///
/// Doubles as the sort key of the version chain: directory names encode the
/// stamp, and stamps must strictly increase parent→child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionStamp(pub i64);

impl VersionStamp {
    #[must_use]
    pub fn unix_seconds(self) -> i64 {
        self.0
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A directory basename that does not name a version.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid version identifier: {name:?}")]
pub struct VersionNameError {
    pub name: String,
}

fn version_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ver_([0-9a-f]+)$").expect("version name regex"))
}

/// Format a stamp as a version directory name: `ver_` + 16-wide zero-padded
/// lowercase hex unix seconds.
#[must_use]
pub fn encode_version_name(stamp: VersionStamp) -> String {
    format!("ver_{:016x}", stamp.0)
}

/// Parse a version directory basename back into its stamp.
///
/// Entries that do not match are reported via [`VersionNameError`]; store
/// scans treat that as "skip", not as a failure.
pub fn parse_version_name(name: &str) -> Result<VersionStamp, VersionNameError> {
    let captures = version_name_re()
        .captures(name)
        .ok_or_else(|| VersionNameError {
            name: name.to_owned(),
        })?;
    let hex = captures.get(1).map_or("", |m| m.as_str());
    i64::from_str_radix(hex, 16)
        .map(VersionStamp)
        .map_err(|_| VersionNameError {
            name: name.to_owned(),
        })
}
