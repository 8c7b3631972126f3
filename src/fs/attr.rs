use tracing::debug;

use super::prelude::*;

/// Attributes for an absolute path.
///
/// A path the tree does not know but the registry holds a write claim for
/// is a freshly created file that has not been uploaded yet; it gets
/// synthesized attributes sized after its staging file.
pub(super) fn attr_for_path<R: Remote>(
    fs: &mut MediaFs<R>,
    path: &str,
    uid: u32,
    gid: u32,
) -> MfResult<FileAttr> {
    match fs.tree.lookup_path(path) {
        Ok(entry) => {
            let entry = entry.clone();
            let ino = fs.inode_for(path);
            Ok(fs.entry_attr(ino, &entry, uid, gid))
        }
        Err(MfError::NotFound) if fs.registry.write_locked(path) => {
            let size = fs
                .handles
                .values()
                .find(|h| h.path == path)
                .and_then(|h| h.file.metadata().ok())
                .map_or(0, |m| m.len());
            let ino = fs.inode_for(path);
            Ok(fs.local_attr(ino, size, uid, gid))
        }
        Err(e) => Err(e),
    }
}

pub(super) fn do_getattr<R: Remote>(
    fs: &mut MediaFs<R>,
    ino: u64,
    uid: u32,
    gid: u32,
) -> MfResult<FileAttr> {
    // getattr precedes almost every other call, so this is the one place
    // the reconciler is consulted on kernel traffic
    fs.maybe_refresh();
    let path = fs.resolve(ino)?;
    attr_for_path(fs, &path, uid, gid)
}

pub fn getattr<R: Remote>(fs: &mut MediaFs<R>, req: &Request, ino: u64, reply: ReplyAttr) {
    match do_getattr(fs, ino, req.uid(), req.gid()) {
        Ok(attr) => reply.attr(&TTL, &attr),
        Err(e) => reply.error(e.errno()),
    }
}

/// chmod, chown, truncate and timestamp updates are not supported.
#[allow(clippy::too_many_arguments)]
pub fn setattr<R: Remote>(
    _fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    ino: u64,
    _mode: Option<u32>,
    _uid: Option<u32>,
    _gid: Option<u32>,
    _size: Option<u64>,
    _atime: Option<TimeOrNow>,
    _mtime: Option<TimeOrNow>,
    _ctime: Option<SystemTime>,
    _fh: Option<u64>,
    _crtime: Option<SystemTime>,
    _chgtime: Option<SystemTime>,
    _bkuptime: Option<SystemTime>,
    _flags: Option<u32>,
    reply: ReplyAttr,
) {
    debug!(ino, "setattr is not supported");
    reply.error(ENOSYS);
}
