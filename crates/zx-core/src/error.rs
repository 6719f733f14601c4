//! ZX error types.
//!
//! Errors travel between processes as text, so every sentinel renders with a
//! canonical message. [`ZxError::from_wire`] maps such text back to the
//! variant, which keeps `is_not_exist()` and friends working across the wire.

use std::io;
use thiserror::Error;

pub const NOT_EXIST: &str = "no such file or directory";
pub const EXISTS: &str = "file already exists";
pub const IS_DIR: &str = "file is a directory";
pub const NOT_DIR: &str = "not a directory";
pub const NOT_EMPTY: &str = "directory not empty";
pub const PERM: &str = "permission denied";
pub const READ_ONLY: &str = "resource is read-only";
pub const BAD_CTL: &str = "bad ctl request";
pub const BAD_TYPE: &str = "bad file type";
pub const NOT_SUFFIX: &str = "not an inner path";
pub const BUG: &str = "buggered or not implemented";

/// Sentinels in the order used to decode wire errors.
const SENTINELS: [&str; 11] = [
    NOT_EXIST, EXISTS, IS_DIR, NOT_DIR, NOT_EMPTY, PERM, READ_ONLY, BAD_CTL, BAD_TYPE,
    NOT_SUFFIX, BUG,
];

fn ctx(what: &str, sentinel: &str) -> String {
    if what.is_empty() {
        sentinel.to_string()
    } else {
        format!("{what}: {sentinel}")
    }
}

/// ZX error type.
///
/// Sentinel variants carry the path (or other context) they refer to.
#[derive(Debug, Error)]
pub enum ZxError {
    #[error("{}", ctx(.0, NOT_EXIST))]
    NotExist(String),

    #[error("{}", ctx(.0, EXISTS))]
    Exists(String),

    #[error("{}", ctx(.0, IS_DIR))]
    IsDir(String),

    #[error("{}", ctx(.0, NOT_DIR))]
    NotDir(String),

    #[error("{}", ctx(.0, NOT_EMPTY))]
    NotEmpty(String),

    #[error("{}", ctx(.0, PERM))]
    Perm(String),

    #[error("{}", ctx(.0, READ_ONLY))]
    ReadOnly(String),

    #[error("{}", ctx(.0, BAD_CTL))]
    BadCtl(String),

    #[error("{}", ctx(.0, BAD_TYPE))]
    BadType(String),

    #[error("{}", ctx(.0, NOT_SUFFIX))]
    NotSuffix(String),

    /// Not implemented, or an internal inconsistency.
    #[error("{}", ctx(.0, BUG))]
    Bug(String),

    /// Malformed message on the wire.
    #[error("{0}")]
    Proto(String),

    /// Authentication failure.
    #[error("{0}")]
    Auth(String),

    /// An operation did not complete in time.
    #[error("{0}")]
    Timeout(String),

    /// The stream or transport went away.
    #[error("{0}")]
    Closed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl ZxError {
    pub fn not_exist(path: impl Into<String>) -> Self {
        Self::NotExist(path.into())
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists(path.into())
    }

    pub fn is_dir(path: impl Into<String>) -> Self {
        Self::IsDir(path.into())
    }

    pub fn not_dir(path: impl Into<String>) -> Self {
        Self::NotDir(path.into())
    }

    pub fn not_empty(path: impl Into<String>) -> Self {
        Self::NotEmpty(path.into())
    }

    pub fn perm(what: impl Into<String>) -> Self {
        Self::Perm(what.into())
    }

    pub fn read_only(what: impl Into<String>) -> Self {
        Self::ReadOnly(what.into())
    }

    pub fn bad_ctl(what: impl Into<String>) -> Self {
        Self::BadCtl(what.into())
    }

    pub fn bad_type(what: impl Into<String>) -> Self {
        Self::BadType(what.into())
    }

    pub fn not_suffix(what: impl Into<String>) -> Self {
        Self::NotSuffix(what.into())
    }

    pub fn bug(what: impl Into<String>) -> Self {
        Self::Bug(what.into())
    }

    pub fn proto(msg: impl Into<String>) -> Self {
        Self::Proto(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Classify a host I/O error for `path` into a sentinel.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_exist(path),
            io::ErrorKind::AlreadyExists => Self::exists(path),
            io::ErrorKind::PermissionDenied => Self::perm(path),
            io::ErrorKind::NotADirectory => Self::not_dir(path),
            io::ErrorKind::IsADirectory => Self::is_dir(path),
            io::ErrorKind::DirectoryNotEmpty => Self::not_empty(path),
            io::ErrorKind::ReadOnlyFilesystem => Self::read_only(path),
            _ => Self::Other(format!("{path}: {err}")),
        }
    }

    /// Rebuild an error from its wire text.
    ///
    /// Messages ending in a sentinel become that variant with the prefix as
    /// context; anything else is kept verbatim.
    pub fn from_wire(msg: &str) -> Self {
        for s in SENTINELS {
            let what = if msg == s {
                Some("")
            } else {
                msg.strip_suffix(s).and_then(|p| p.strip_suffix(": "))
            };
            if let Some(what) = what {
                let what = what.to_string();
                return match s {
                    NOT_EXIST => Self::NotExist(what),
                    EXISTS => Self::Exists(what),
                    IS_DIR => Self::IsDir(what),
                    NOT_DIR => Self::NotDir(what),
                    NOT_EMPTY => Self::NotEmpty(what),
                    PERM => Self::Perm(what),
                    READ_ONLY => Self::ReadOnly(what),
                    BAD_CTL => Self::BadCtl(what),
                    BAD_TYPE => Self::BadType(what),
                    NOT_SUFFIX => Self::NotSuffix(what),
                    _ => Self::Bug(what),
                };
            }
        }
        Self::Other(msg.to_string())
    }

    /// Text sent to the peer for this error.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }

    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::NotExist(_) => true,
            Self::Io(e) if e.kind() == io::ErrorKind::NotFound => true,
            _ => {
                let s = self.to_string();
                s.contains("does not exist") || s.contains("no such file") || s.contains("not found")
            }
        }
    }

    pub fn is_exists(&self) -> bool {
        match self {
            Self::Exists(_) => true,
            _ => {
                let s = self.to_string();
                s.contains("already exists") || s.contains("file exists")
            }
        }
    }

    pub fn is_perm(&self) -> bool {
        matches!(self, Self::Perm(_)) || self.to_string().contains(PERM)
    }

    pub fn is_not_empty(&self) -> bool {
        matches!(self, Self::NotEmpty(_)) || self.to_string().contains("not empty")
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_)) || self.to_string().contains(READ_ONLY)
    }
}

impl Clone for ZxError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Proto(s) => Self::Proto(s.clone()),
            Self::Auth(s) => Self::Auth(s.clone()),
            Self::Timeout(s) => Self::Timeout(s.clone()),
            Self::Closed(s) => Self::Closed(s.clone()),
            Self::Other(s) => Self::Other(s.clone()),
            e => Self::from_wire(&e.to_string()),
        }
    }
}

/// Convert ZxError to std::io::Error for compatibility.
impl From<ZxError> for io::Error {
    fn from(e: ZxError) -> Self {
        match e {
            ZxError::NotExist(_) => io::Error::new(io::ErrorKind::NotFound, e.to_string()),
            ZxError::Exists(_) => io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()),
            ZxError::Perm(_) => io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()),
            ZxError::ReadOnly(_) => {
                io::Error::new(io::ErrorKind::ReadOnlyFilesystem, e.to_string())
            }
            ZxError::NotDir(_) => io::Error::new(io::ErrorKind::NotADirectory, e.to_string()),
            ZxError::IsDir(_) => io::Error::new(io::ErrorKind::IsADirectory, e.to_string()),
            ZxError::NotEmpty(_) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, e.to_string())
            }
            ZxError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            ZxError::Io(e) => e,
            e => io::Error::other(e.to_string()),
        }
    }
}

/// ZX result type.
pub type ZxResult<T> = Result<T, ZxError>;
