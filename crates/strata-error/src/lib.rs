#![forbid(unsafe_code)]
//! Error types for StrataFS.
//!
//! Defines `StrataError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use std::path::PathBuf;
use strata_types::VersionNameError;
use thiserror::Error;

/// Unified error type for all StrataFS operations.
#[derive(Debug, Error)]
pub enum StrataError {
    /// A store entry that was selected as a version does not name one.
    #[error(transparent)]
    InvalidVersionName(#[from] VersionNameError),

    /// `meta.json` exists but cannot be read or parsed.
    #[error("corrupt version metadata at {path}: {detail}")]
    MetadataCorrupt { path: PathBuf, detail: String },

    /// A rebased path that the union says should exist failed to stat/open.
    #[error("no backing file at {path}: {source}")]
    NoBackingFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Name lookup miss in a live directory.
    #[error("not found: {0}")]
    NotFound(String),

    /// mkdir/create collided with an existing entry.
    #[error("already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// `create` was asked for something other than a regular file or directory.
    #[error("unsupported file type")]
    UnsupportedType,

    /// `--version N` beyond the end of the chain.
    #[error("version index {index} out of range (chain has {len} versions)")]
    InvalidIndex { index: usize, len: usize },

    /// chmod/chown/utimes failed while applying a setattr request.
    #[error("attribute update failed on {path}: {source}")]
    AttrUpdateFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An operation referenced a handle id that is not open.
    #[error("unknown file handle {0}")]
    StaleHandle(u64),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    /// The head version was torn down while live nodes still referenced it.
    #[error("version chain no longer available")]
    ChainUnavailable,

    /// Any other syscall failure (read, write, copy, remove, fsync, scan).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrataError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidVersionName(_) | Self::InvalidIndex { .. } => libc::EINVAL,
            Self::MetadataCorrupt { .. } | Self::ChainUnavailable => libc::EIO,
            Self::NoBackingFile { source, .. } => source.raw_os_error().unwrap_or(libc::ENOENT),
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists { .. } => libc::EEXIST,
            Self::UnsupportedType => libc::ENOTSUP,
            Self::AttrUpdateFailed { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::StaleHandle(_) => libc::EBADF,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias using `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::parse_version_name;

    #[test]
    fn errno_mappings_match_taxonomy() {
        let name_err = parse_version_name("junk").expect_err("junk is not a version");
        assert_eq!(StrataError::from(name_err).to_errno(), libc::EINVAL);
        assert_eq!(
            StrataError::NotFound("x".into()).to_errno(),
            libc::ENOENT
        );
        assert_eq!(
            StrataError::AlreadyExists { path: "/d".into() }.to_errno(),
            libc::EEXIST
        );
        assert_eq!(StrataError::UnsupportedType.to_errno(), libc::ENOTSUP);
        assert_eq!(StrataError::StaleHandle(9).to_errno(), libc::EBADF);
        assert_eq!(StrataError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(
            StrataError::InvalidIndex { index: 9, len: 2 }.to_errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn io_errors_surface_raw_os_errno() {
        let err = StrataError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn missing_backing_file_maps_to_enoent() {
        let err = StrataError::NoBackingFile {
            path: "/store/ver_0/root/x".into(),
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert_eq!(err.to_errno(), libc::ENOENT);
    }
}
