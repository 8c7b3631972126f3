//! Re-exports shared by the `fs` submodules (`read.rs`, `write.rs`, …),
//! so the per-operation files don't repeat the same import block.

pub use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};

pub use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOSYS, ENOTEMPTY};

pub use std::collections::HashMap;
pub use std::ffi::OsStr;
pub use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use crate::api_client::Remote;
pub use crate::error::{MfError, MfResult};
pub use crate::openfile::{FrozenBody, OpenHandle, OpenMode};

pub use super::{MediaFs, TTL, full_path};
