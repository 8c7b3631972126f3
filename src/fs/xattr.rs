use tracing::debug;

use super::prelude::*;

/// Extended attributes are reported unsupported across the board; the
/// remote has nowhere to store them.

pub fn setxattr<R: Remote>(
    _fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    ino: u64,
    name: &OsStr,
    _value: &[u8],
    _flags: i32,
    _position: u32,
    reply: ReplyEmpty,
) {
    debug!(ino, name = %name.to_string_lossy(), "setxattr is not supported");
    reply.error(ENOSYS);
}

pub fn getxattr<R: Remote>(
    _fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    ino: u64,
    name: &OsStr,
    _size: u32,
    reply: ReplyXattr,
) {
    debug!(ino, name = %name.to_string_lossy(), "getxattr is not supported");
    reply.error(ENOSYS);
}

pub fn listxattr<R: Remote>(
    _fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    ino: u64,
    _size: u32,
    reply: ReplyXattr,
) {
    debug!(ino, "listxattr is not supported");
    reply.error(ENOSYS);
}

pub fn removexattr<R: Remote>(
    _fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    ino: u64,
    name: &OsStr,
    reply: ReplyEmpty,
) {
    debug!(ino, name = %name.to_string_lossy(), "removexattr is not supported");
    reply.error(ENOSYS);
}
