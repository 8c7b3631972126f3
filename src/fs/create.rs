use tracing::debug;

use super::prelude::*;

/// Create a local-only file: allocate a staging file, claim the path for
/// writing and hand out a handle. No remote call happens here — the remote
/// rejects zero-byte files, so the upload waits until `release`.
pub(super) fn do_create<R: Remote>(
    fs: &mut MediaFs<R>,
    parent: u64,
    name: &str,
) -> MfResult<(u64, u64)> {
    let parent_path = fs.resolve(parent)?;
    let path = full_path(&parent_path, name);

    fs.registry.open_write(&path)?;
    let (staging_path, file) = match fs.cache.stage_new() {
        Ok(staged) => staged,
        Err(e) => {
            let _ = fs.registry.release_write(&path);
            return Err(e);
        }
    };

    debug!(%path, staging = %staging_path.display(), "created local-only file");
    let ino = fs.inode_for(&path);
    let fh = fs.alloc_fh(OpenHandle {
        file,
        path,
        mode: OpenMode::LocalOnly,
        staging: Some(staging_path),
        source: None,
    });
    Ok((fh, ino))
}

pub fn create<R: Remote>(
    fs: &mut MediaFs<R>,
    req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    _mode: u32,
    _umask: u32,
    _flags: i32,
    reply: ReplyCreate,
) {
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    match do_create(fs, parent, name) {
        Ok((fh, ino)) => {
            let attr = fs.local_attr(ino, 0, req.uid(), req.gid());
            reply.created(&TTL, &attr, 0, fh, 0);
        }
        Err(e) => reply.error(e.errno()),
    }
}

/// Create a folder on the remote and pick up the acknowledged entry via
/// the change log; the tree is never mutated ahead of the remote.
pub(super) fn do_mkdir<R: Remote>(
    fs: &mut MediaFs<R>,
    parent: u64,
    name: &str,
    uid: u32,
    gid: u32,
) -> MfResult<FileAttr> {
    let parent_path = fs.resolve(parent)?;
    let parent_key = {
        let entry = fs.tree.lookup_path(&parent_path)?;
        if entry.is_file() {
            return Err(MfError::NotADirectory(parent_path));
        }
        (!entry.key.is_empty()).then(|| entry.key.clone())
    };

    fs.runtime
        .block_on(fs.remote.folder_create(parent_key.as_deref(), name))?;
    fs.refresh_expecting_changes();

    let path = full_path(&parent_path, name);
    let entry = fs.tree.lookup_path(&path)?.clone();
    let ino = fs.inode_for(&path);
    Ok(fs.entry_attr(ino, &entry, uid, gid))
}

pub fn mkdir<R: Remote>(
    fs: &mut MediaFs<R>,
    req: &Request<'_>,
    parent: u64,
    name: &OsStr,
    _mode: u32,
    _umask: u32,
    reply: ReplyEntry,
) {
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    match do_mkdir(fs, parent, name, req.uid(), req.gid()) {
        Ok(attr) => reply.entry(&TTL, &attr, 0),
        Err(e) => reply.error(e.errno()),
    }
}
