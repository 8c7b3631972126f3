//! Crate-wide error type.
//!
//! Every fallible operation in the synchronization core returns `MfResult`.
//! The variants map one-to-one onto the error kinds the filesystem boundary
//! has to distinguish; `errno()` performs the POSIX translation and is the
//! only place that knows about `libc` error codes.

use std::io;

use thiserror::Error;

pub type MfResult<T> = Result<T, MfError>;

#[derive(Debug, Error)]
pub enum MfError {
    /// A name or key did not resolve.
    #[error("no such file or directory")]
    NotFound,

    /// The open-file registry denied the requested access mode.
    #[error("{0} is already open in a conflicting mode")]
    Busy(String),

    /// A non-terminal path component resolved to a file.
    #[error("{0}: not a directory")]
    NotADirectory(String),

    /// An integrity check failed: hash, size or revision chain.
    #[error("integrity check failed: {0}")]
    Corrupt(String),

    /// The remote reported a failure; carries the numeric API code.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// A timeout or signature desync; retried a bounded number of times
    /// inside the transport adapter before it surfaces here.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Local disk failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Operation deliberately not implemented.
    #[error("operation not supported")]
    Unsupported,
}

impl MfError {
    /// Translate into the closest POSIX errno for the FUSE boundary.
    pub fn errno(&self) -> libc::c_int {
        match self {
            MfError::NotFound => libc::ENOENT,
            MfError::Busy(_) => libc::EACCES,
            MfError::NotADirectory(_) => libc::ENOTDIR,
            MfError::Corrupt(_) => libc::EIO,
            MfError::Remote { .. } => libc::EAGAIN,
            MfError::Transient(_) => libc::EAGAIN,
            MfError::Io(_) => libc::EIO,
            MfError::Unsupported => libc::ENOSYS,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        MfError::Corrupt(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(MfError::NotFound.errno(), libc::ENOENT);
        assert_eq!(MfError::Busy("/a".into()).errno(), libc::EACCES);
        assert_eq!(MfError::NotADirectory("/a/b".into()).errno(), libc::ENOTDIR);
        assert_eq!(MfError::corrupt("bad hash").errno(), libc::EIO);
        assert_eq!(
            MfError::Remote { code: 110, message: "unknown key".into() }.errno(),
            libc::EAGAIN
        );
        assert_eq!(MfError::Unsupported.errno(), libc::ENOSYS);
    }
}
