use std::os::unix::fs::FileExt;

use tracing::debug;

use super::prelude::*;

/// Handles the FUSE `lookup` operation: resolve `name` within the parent
/// directory and reply with its attributes.
pub fn lookup<R: Remote>(
    fs: &mut MediaFs<R>,
    req: &Request,
    parent: u64,
    name: &OsStr,
    reply: ReplyEntry,
) {
    let Some(name) = name.to_str() else {
        reply.error(ENOENT);
        return;
    };
    fs.maybe_refresh();

    let parent_path = match fs.resolve(parent) {
        Ok(p) => p,
        Err(e) => {
            reply.error(e.errno());
            return;
        }
    };
    let path = full_path(&parent_path, name);
    match super::attr::attr_for_path(fs, &path, req.uid(), req.gid()) {
        Ok(attr) => reply.entry(&TTL, &attr, 0),
        Err(e) => reply.error(e.errno()),
    }
}

/// Children of a directory as `(inode, kind, name)` triples, in the order
/// the tree holds them. Dangling child keys are skipped.
pub(super) fn do_readdir<R: Remote>(
    fs: &mut MediaFs<R>,
    ino: u64,
) -> MfResult<Vec<(u64, FileType, String)>> {
    let path = fs.resolve(ino)?;
    let entry = fs.tree.lookup_path(&path)?;
    if entry.is_file() {
        return Err(MfError::NotADirectory(path));
    }

    let children: Vec<(String, bool)> = entry
        .children()
        .iter()
        .filter_map(|key| fs.tree.lookup_key(Some(key)))
        .map(|child| (child.name.clone(), child.is_file()))
        .collect();

    let mut out = Vec::with_capacity(children.len());
    for (name, is_file) in children {
        let child_path = full_path(&path, &name);
        let child_ino = fs.inode_for(&child_path);
        let kind = if is_file { FileType::RegularFile } else { FileType::Directory };
        out.push((child_ino, kind, name));
    }
    Ok(out)
}

/// Handles the FUSE `readdir` operation (e.g. `ls`).
pub fn readdir<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request,
    ino: u64,
    _fh: u64,
    offset: i64,
    mut reply: ReplyDirectory,
) {
    let parent_ino = match fs.resolve(ino) {
        Ok(path) => {
            let parent = path.rsplit_once('/').map_or("/", |(p, _)| if p.is_empty() { "/" } else { p });
            fs.path_to_inode.get(parent).copied().unwrap_or(1)
        }
        Err(e) => {
            reply.error(e.errno());
            return;
        }
    };

    let mut entries = vec![
        (ino, FileType::Directory, ".".to_string()),
        (parent_ino, FileType::Directory, "..".to_string()),
    ];
    match do_readdir(fs, ino) {
        Ok(children) => entries.extend(children),
        Err(e) => {
            reply.error(e.errno());
            return;
        }
    }

    for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
        // a true return means the reply buffer is full
        if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
            break;
        }
    }
    reply.ok();
}

/// Open a path, enforcing the access rules:
///
/// - a path open for writing cannot be opened again in any mode;
/// - later readers of a read-only path share the first opener's frozen
///   body and trigger no refresh;
/// - the first opener materializes the body through the content cache
///   (incrementally if an older revision is cached) and, for writers,
///   receives a mutable staging copy of it.
pub(super) fn do_open<R: Remote>(fs: &mut MediaFs<R>, ino: u64, flags: i32) -> MfResult<u64> {
    let path = fs.resolve(ino)?;
    let write = flags & libc::O_ACCMODE != libc::O_RDONLY;

    if fs.registry.write_locked(&path) {
        debug!(%path, "already open for writing");
        return Err(MfError::Busy(path));
    }

    if !write {
        if let Some(body) = fs.registry.frozen_body(&path) {
            // the body file is on disk already; no transport calls happen
            let file = fs.runtime.block_on(fs.cache.open_body(
                &fs.remote,
                &body.quickkey,
                None,
                body.revision,
                body.size,
                &body.hash,
            ))?;
            let _ = fs.registry.reopen_readonly(&path);
            let handle =
                OpenHandle { file, path, mode: OpenMode::ReadOnly, staging: None, source: None };
            return Ok(fs.alloc_fh(handle));
        }
    }

    // first opener of this path: look at a current revision
    fs.maybe_refresh();

    let entry = fs.tree.lookup_path(&path)?;
    if entry.is_folder() {
        return Err(MfError::NotFound);
    }
    let hash = *entry.file_hash().ok_or(MfError::NotFound)?;
    let body = FrozenBody {
        quickkey: entry.key.clone(),
        revision: entry.revision,
        hash,
        size: entry.file_size(),
    };

    let local = fs.cache.newest_local_revision(&body.quickkey, body.revision);
    let file = fs.runtime.block_on(fs.cache.open_body(
        &fs.remote,
        &body.quickkey,
        local,
        body.revision,
        body.size,
        &body.hash,
    ))?;

    if write {
        fs.registry.open_write(&path)?;
        let (staging_path, staging_file) = match fs.cache.stage_copy(&body.quickkey, body.revision)
        {
            Ok(staged) => staged,
            Err(e) => {
                let _ = fs.registry.release_write(&path);
                return Err(e);
            }
        };
        if flags & libc::O_TRUNC != 0 {
            if let Err(e) = staging_file.set_len(0) {
                let _ = fs.registry.release_write(&path);
                return Err(e.into());
            }
        }
        drop(file); // the verified body stays in the cache as the diff source
        let handle = OpenHandle {
            file: staging_file,
            path,
            mode: OpenMode::Writable,
            staging: Some(staging_path),
            source: Some(body),
        };
        Ok(fs.alloc_fh(handle))
    } else {
        fs.registry.open_readonly(&path, body)?;
        let handle =
            OpenHandle { file, path, mode: OpenMode::ReadOnly, staging: None, source: None };
        Ok(fs.alloc_fh(handle))
    }
}

pub fn open<R: Remote>(fs: &mut MediaFs<R>, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
    match do_open(fs, ino, flags) {
        Ok(fh) => reply.opened(fh, 0),
        Err(e) => reply.error(e.errno()),
    }
}

/// Positional read from the handle's descriptor.
pub(super) fn do_read<R: Remote>(
    fs: &MediaFs<R>,
    fh: u64,
    offset: i64,
    size: u32,
) -> MfResult<Vec<u8>> {
    if offset < 0 {
        return Err(MfError::NotFound);
    }
    let handle = fs.handles.get(&fh).ok_or(MfError::NotFound)?;

    let mut buf = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = handle.file.read_at(&mut buf[filled..], offset as u64 + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[allow(clippy::too_many_arguments)]
pub fn read<R: Remote>(
    fs: &mut MediaFs<R>,
    _req: &Request<'_>,
    _ino: u64,
    fh: u64,
    offset: i64,
    size: u32,
    _flags: i32,
    _lock_owner: Option<u64>,
    reply: ReplyData,
) {
    match do_read(fs, fh, offset, size) {
        Ok(data) => reply.data(&data),
        Err(MfError::NotFound) => reply.error(EBADF),
        Err(e) => reply.error(e.errno()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ChangeKind;
    use crate::fs::testfs;
    use crate::testutil::MockRemote;

    fn remote_with_root() -> MockRemote {
        let remote = MockRemote::new();
        remote.set_revision(10);
        remote.add_folder("abcdefghijklm", "docs", "", 10);
        remote.add_file("aaaaaaaaaaaaaaa", "readme.txt", "", 10, b"hello world");
        remote
    }

    #[test]
    fn listing_a_fresh_root() {
        let (_dir, mut fs) = testfs::mount(remote_with_root());
        let mut names: Vec<String> =
            do_readdir(&mut fs, 1).unwrap().into_iter().map(|(_, _, n)| n).collect();
        names.sort();
        assert_eq!(names, vec!["docs", "readme.txt"]);
    }

    #[test]
    fn readdir_of_a_file_fails() {
        let (_dir, mut fs) = testfs::mount(remote_with_root());
        let ino = fs.inode_for("/readme.txt");
        assert!(matches!(do_readdir(&mut fs, ino), Err(MfError::NotADirectory(_))));
    }

    #[test]
    fn open_and_read_a_remote_file() {
        let (_dir, mut fs) = testfs::mount(remote_with_root());
        let ino = fs.inode_for("/readme.txt");
        let fh = do_open(&mut fs, ino, libc::O_RDONLY).unwrap();
        assert_eq!(do_read(&fs, fh, 0, 1024).unwrap(), b"hello world");
        assert_eq!(do_read(&fs, fh, 6, 5).unwrap(), b"world");
        assert_eq!(do_read(&fs, fh, 100, 10).unwrap(), b"");
    }

    #[test]
    fn denied_double_writer() {
        let (_dir, mut fs) = testfs::mount(remote_with_root());
        let ino = fs.inode_for("/readme.txt");
        do_open(&mut fs, ino, libc::O_WRONLY).unwrap();
        assert!(matches!(do_open(&mut fs, ino, libc::O_WRONLY), Err(MfError::Busy(_))));
        assert!(matches!(do_open(&mut fs, ino, libc::O_RDONLY), Err(MfError::Busy(_))));
    }

    #[test]
    fn no_writer_while_readers_hold_the_path() {
        let (_dir, mut fs) = testfs::mount(remote_with_root());
        let ino = fs.inode_for("/readme.txt");
        do_open(&mut fs, ino, libc::O_RDONLY).unwrap();
        assert!(matches!(do_open(&mut fs, ino, libc::O_RDWR), Err(MfError::Busy(_))));
    }

    #[test]
    fn later_readers_see_the_frozen_revision() {
        let remote = remote_with_root();
        let (_dir, mut fs) = testfs::mount(remote);
        let ino = fs.inode_for("/readme.txt");

        let first = do_open(&mut fs, ino, libc::O_RDONLY).unwrap();

        // the remote moves on while the file is open
        {
            let remote = &fs.remote;
            remote.update_file("aaaaaaaaaaaaaaa", 11, b"a newer body");
            remote.set_revision(11);
            remote.push_change(ChangeKind::UpdatedFile, "aaaaaaaaaaaaaaa", "", 11);
        }

        let second = do_open(&mut fs, ino, libc::O_RDONLY).unwrap();
        // both handles read the revision frozen at first open
        assert_eq!(do_read(&fs, first, 0, 64).unwrap(), b"hello world");
        assert_eq!(do_read(&fs, second, 0, 64).unwrap(), b"hello world");
    }

    #[test]
    fn read_on_a_stale_handle_is_rejected() {
        let (_dir, fs) = testfs::mount(remote_with_root());
        assert!(matches!(do_read(&fs, 42, 0, 16), Err(MfError::NotFound)));
    }
}
