//! Errors surfaced by the filesystem driver and their POSIX errno mapping.

use std::fmt;

use libc::c_int;
use thiserror::Error;

use crate::cadapter::client::StorageError;
use crate::meta::cache::CacheError;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found{path}")]
    NotFound { path: PathHint },

    #[error("already exists{path}")]
    AlreadyExists { path: PathHint },

    #[error("permission denied{path}")]
    PermissionDenied { path: PathHint },

    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("temporary storage failure: {0}")]
    Transient(String),

    #[error("is a directory{path}")]
    IsADirectory { path: PathHint },

    #[error("not a directory{path}")]
    NotADirectory { path: PathHint },

    #[error("bad file handle {0}")]
    BadHandle(u64),

    /// The copy reached `new` but `old` could not be removed; both exist.
    #[error("rename {old} -> {new} copied the data but left the source behind: {source}")]
    RenameIncomplete {
        old: String,
        new: String,
        source: Box<FsError>,
    },
}

impl FsError {
    pub fn not_found(path: impl Into<PathHint>) -> Self {
        FsError::NotFound { path: path.into() }
    }

    pub fn is_a_directory(path: impl Into<PathHint>) -> Self {
        FsError::IsADirectory { path: path.into() }
    }

    pub fn not_a_directory(path: impl Into<PathHint>) -> Self {
        FsError::NotADirectory { path: path.into() }
    }

    pub fn permission_denied(path: impl Into<PathHint>) -> Self {
        FsError::PermissionDenied { path: path.into() }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        FsError::Unsupported(what.into())
    }

    /// Default translation of a storage failure on `path`.
    pub fn from_storage(err: StorageError, path: &str) -> Self {
        match err {
            StorageError::NotFound => FsError::not_found(path),
            StorageError::AlreadyExists => FsError::AlreadyExists { path: path.into() },
            StorageError::Denied => FsError::permission_denied(path),
            StorageError::TooLarge { size, limit } => FsError::FileTooLarge { size, limit },
            StorageError::Transient(msg) => FsError::Transient(msg),
        }
    }

    pub fn from_cache(err: CacheError, path: &str) -> Self {
        match err {
            CacheError::NoSuchContainer(_) => FsError::not_found(path),
            CacheError::Storage(e) => FsError::from_storage(e, path),
        }
    }

    pub fn errno(&self) -> c_int {
        match self {
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotFound { .. } => libc::ENOENT,
            FsError::AlreadyExists { .. } => libc::EEXIST,
            FsError::PermissionDenied { .. } => libc::EACCES,
            FsError::FileTooLarge { .. } => libc::EFBIG,
            FsError::Unsupported(_) => libc::ENOSYS,
            FsError::Transient(_) => libc::EAGAIN,
            FsError::IsADirectory { .. } => libc::EISDIR,
            FsError::NotADirectory { .. } => libc::ENOTDIR,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::RenameIncomplete { source, .. } => source.errno(),
        }
    }
}
