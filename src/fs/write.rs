use std::os::unix::fs::FileExt;

use super::prelude::*;
use crate::openfile;

/// Positional write into the handle's staging file. Read-only handles are
/// rejected.
pub(super) fn do_write<R: Remote>(
    fs: &mut MediaFs<R>,
    fh: u64,
    offset: i64,
    data: &[u8],
) -> MfResult<u32> {
    if offset < 0 {
        return Err(MfError::NotFound);
    }
    let handle = fs.handles.get(&fh).ok_or(MfError::NotFound)?;
    if handle.mode == OpenMode::ReadOnly {
        return Err(MfError::Busy(handle.path.clone()));
    }
    handle.file.write_all_at(data, offset as u64)?;
    Ok(data.len() as u32)
}

#[allow(clippy::too_many_arguments)]
pub fn write<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    _ino: u64,
    fh: u64,
    offset: i64,
    data: &[u8],
    _write_flags: u32,
    _flags: i32,
    _lock_owner: Option<u64>,
    reply: ReplyWrite,
) {
    match do_write(fs, fh, offset, data) {
        Ok(written) => reply.written(written),
        Err(MfError::NotFound) => reply.error(EBADF),
        Err(e) => reply.error(e.errno()),
    }
}

/// Close a handle. This is where local edits reach the remote:
///
/// - read-only: drop the reader count, nothing else;
/// - local-only: upload the staging file as a new file into its parent
///   folder and poll until the remote assembled it;
/// - writable: diff the staging file against the cached source body and
///   upload the patch as an edit of the existing quickkey.
///
/// The write claim is released before the upload starts, as the kernel
/// considers the descriptor closed either way; a failed upload keeps the
/// staging file on disk for recovery. After a successful upload the next
/// refresh observes the revision the upload produced.
pub(super) fn do_release<R: Remote>(fs: &mut MediaFs<R>, fh: u64) -> MfResult<()> {
    let handle = fs.handles.remove(&fh).ok_or(MfError::NotFound)?;
    match handle.mode {
        OpenMode::ReadOnly => fs.registry.release_readonly(&handle.path),
        OpenMode::LocalOnly => {
            fs.registry.release_write(&handle.path)?;
            fs.runtime
                .block_on(openfile::release_local(&handle, &fs.tree, &fs.remote))?;
            if let Some(staging) = &handle.staging {
                fs.cache.discard_staging(staging);
            }
            fs.refresh_expecting_changes();
            Ok(())
        }
        OpenMode::Writable => {
            fs.registry.release_write(&handle.path)?;
            fs.runtime
                .block_on(openfile::release_writable(&handle, &mut fs.cache, &fs.remote))?;
            if let Some(staging) = &handle.staging {
                fs.cache.discard_staging(staging);
            }
            fs.refresh_expecting_changes();
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn release<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    _ino: u64,
    fh: u64,
    _flags: i32,
    _lock_owner: Option<u64>,
    _flush: bool,
    reply: ReplyEmpty,
) {
    match do_release(fs, fh) {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e.errno()),
    }
}
