//! The FUSE surface of the filesystem.
//!
//! `MediaFs` bundles the synchronization core — directory tree, content
//! cache, open-file registry and the transport — together with the Tokio
//! runtime used to execute transport calls and the inode/path maps the
//! kernel protocol needs.
//!
//! The `impl Filesystem` block on `FsWrapper` is a plain dispatcher: every
//! kernel call locks the single coarse mutex and forwards to the matching
//! function in one of the sub-modules (`attr`, `read`, `write`, `create`,
//! `delete`, `rename`, `xattr`). All invariants of the core are stated
//! against that serialization.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, error, warn};

use crate::api_client::Remote;
use crate::cache::FileCache;
use crate::config::Config;
use crate::error::MfResult;
use crate::openfile::{OpenFileRegistry, OpenHandle};
use crate::reconciler;
use crate::tree::{Entry, FolderTree};

pub mod prelude;

mod attr;
mod create;
mod delete;
mod read;
mod rename;
mod write;
mod xattr;

/// Time-to-live for attributes and entries handed to the kernel cache.
pub const TTL: Duration = Duration::from_secs(1);

const ROOT_INODE: u64 = 1;

/// Join a parent path and a name into an absolute path. The root is "/".
pub fn full_path(parent: &str, name: &str) -> String {
    if parent == "/" { format!("/{name}") } else { format!("{parent}/{name}") }
}

/// The mounted filesystem state, guarded as a whole by one mutex.
pub struct MediaFs<R: Remote> {
    pub(crate) remote: R,
    pub(crate) runtime: tokio::runtime::Runtime,
    pub(crate) config: Config,
    pub(crate) tree: FolderTree,
    pub(crate) cache: FileCache,
    pub(crate) registry: OpenFileRegistry,
    pub(crate) handles: HashMap<u64, OpenHandle>,
    pub(crate) next_fh: u64,
    /// The kernel speaks inodes, the tree speaks paths; these two maps
    /// translate. Inode 1 is "/".
    pub(crate) inode_to_path: HashMap<u64, String>,
    pub(crate) path_to_inode: HashMap<String, u64>,
    pub(crate) next_inode: u64,
    last_refresh: Option<Instant>,
    /// Where `destroy` stores the tree snapshot.
    dircache: PathBuf,
}

impl<R: Remote> MediaFs<R> {
    pub fn new(
        config: Config,
        runtime: tokio::runtime::Runtime,
        remote: R,
        tree: FolderTree,
        cache: FileCache,
        dircache: PathBuf,
    ) -> Self {
        let mut fs = MediaFs {
            remote,
            runtime,
            config,
            tree,
            cache,
            registry: OpenFileRegistry::new(),
            handles: HashMap::new(),
            next_fh: 1,
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: ROOT_INODE + 1,
            last_refresh: None,
            dircache,
        };
        fs.inode_to_path.insert(ROOT_INODE, "/".to_string());
        fs.path_to_inode.insert("/".to_string(), ROOT_INODE);
        fs
    }

    pub(crate) fn resolve(&self, ino: u64) -> MfResult<String> {
        self.inode_to_path
            .get(&ino)
            .cloned()
            .ok_or(crate::error::MfError::NotFound)
    }

    /// Get or allocate the inode for a path.
    pub(crate) fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(ino, path.to_string());
        self.path_to_inode.insert(path.to_string(), ino);
        ino
    }

    pub(crate) fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&ino);
        }
    }

    pub(crate) fn remap_path(&mut self, old: &str, new: &str) {
        if let Some(ino) = self.path_to_inode.remove(old) {
            self.path_to_inode.insert(new.to_string(), ino);
            self.inode_to_path.insert(ino, new.to_string());
        }
        self.registry.rename(old, new);
        for handle in self.handles.values_mut() {
            if handle.path == old {
                handle.path = new.to_string();
            }
        }
    }

    /// Rate-limited reconciliation: consult the remote at most once per
    /// configured interval, no matter how chatty the kernel is.
    pub(crate) fn maybe_refresh(&mut self) {
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        if let Some(last) = self.last_refresh {
            if last.elapsed() < interval {
                return;
            }
        }
        self.last_refresh = Some(Instant::now());

        let moved = self
            .runtime
            .block_on(reconciler::refresh(&mut self.tree, &self.remote, false));
        match moved {
            Ok(true) => reconciler::housekeep(&mut self.tree, &self.cache),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "background refresh failed"),
        }
    }

    /// Reconcile right after a mutation we issued ourselves; the remote
    /// revision must have moved.
    pub(crate) fn refresh_expecting_changes(&mut self) {
        self.last_refresh = Some(Instant::now());
        let moved = self
            .runtime
            .block_on(reconciler::refresh(&mut self.tree, &self.remote, true));
        match moved {
            Ok(true) => reconciler::housekeep(&mut self.tree, &self.cache),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "refresh after mutation failed"),
        }
    }

    /// Attributes for a tree entry as the kernel wants them.
    pub(crate) fn entry_attr(&self, ino: u64, entry: &Entry, uid: u32, gid: u32) -> FileAttr {
        let created = UNIX_EPOCH + Duration::from_secs(entry.created);
        let (kind, perm, nlink, size) = if entry.is_file() {
            (FileType::RegularFile, 0o644, 1, entry.file_size())
        } else {
            (FileType::Directory, 0o755, 2, 0)
        };
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: created,
            mtime: created,
            ctime: created,
            crtime: created,
            kind,
            perm,
            nlink,
            uid,
            gid,
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    /// Attributes for a file that exists only locally: created but not yet
    /// uploaded, so the tree does not know it.
    pub(crate) fn local_attr(&self, ino: u64, size: u64, uid: u32, gid: u32) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    pub(crate) fn alloc_fh(&mut self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    /// Store the tree snapshot so the next mount starts warm.
    pub(crate) fn store_snapshot(&self) {
        let result: MfResult<()> = (|| {
            let mut file = File::create(&self.dircache)?;
            self.tree.store(&mut file)
        })();
        match result {
            Ok(()) => debug!(path = %self.dircache.display(), "tree snapshot stored"),
            Err(e) => error!(path = %self.dircache.display(), error = %e, "cannot store tree snapshot"),
        }
    }
}

pub struct FsWrapper<R: Remote>(pub Arc<Mutex<MediaFs<R>>>);

/// Main FUSE trait implementation: lock, dispatch, reply.
impl<R: Remote> Filesystem for FsWrapper<R> {
    // --- Attribute operations (attr.rs) ---

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        let mut fs = self.0.lock().unwrap();
        attr::getattr(&mut fs, req, ino, reply);
    }

    fn setattr(&mut self, req: &Request<'_>, ino: u64, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>, size: Option<u64>, atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>, ctime: Option<SystemTime>, fh: Option<u64>, crtime: Option<SystemTime>, chgtime: Option<SystemTime>, bkuptime: Option<SystemTime>, flags: Option<u32>, reply: ReplyAttr) {
        let mut fs = self.0.lock().unwrap();
        attr::setattr(&mut fs, req, ino, mode, uid, gid, size, atime, mtime, ctime, fh, crtime, chgtime, bkuptime, flags, reply);
    }

    // --- Read operations (read.rs) ---

    fn lookup(&mut self, req: &Request, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let mut fs = self.0.lock().unwrap();
        read::lookup(&mut fs, req, parent, name, reply);
    }

    fn readdir(&mut self, req: &Request, ino: u64, fh: u64, offset: i64, reply: ReplyDirectory) {
        let mut fs = self.0.lock().unwrap();
        read::readdir(&mut fs, req, ino, fh, offset, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let mut fs = self.0.lock().unwrap();
        read::open(&mut fs, req, ino, flags, reply);
    }

    fn read(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, size: u32, flags: i32, lock_owner: Option<u64>, reply: ReplyData) {
        let mut fs = self.0.lock().unwrap();
        read::read(&mut fs, req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    // --- Write operations (write.rs) ---

    fn write(&mut self, req: &Request<'_>, ino: u64, fh: u64, offset: i64, data: &[u8], write_flags: u32, flags: i32, lock_owner: Option<u64>, reply: ReplyWrite) {
        let mut fs = self.0.lock().unwrap();
        write::write(&mut fs, req, ino, fh, offset, data, write_flags, flags, lock_owner, reply);
    }

    fn release(&mut self, req: &Request<'_>, ino: u64, fh: u64, flags: i32, lock_owner: Option<u64>, flush: bool, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        write::release(&mut fs, req, ino, fh, flags, lock_owner, flush, reply);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    // --- Create operations (create.rs) ---

    fn create(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, mode: u32, umask: u32, flags: i32, reply: ReplyCreate) {
        let mut fs = self.0.lock().unwrap();
        create::create(&mut fs, req, parent, name, mode, umask, flags, reply);
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let mut fs = self.0.lock().unwrap();
        create::mkdir(&mut fs, req, parent, name, mode, umask, reply);
    }

    // --- Delete operations (delete.rs) ---

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        delete::unlink(&mut fs, req, parent, name, reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        delete::rmdir(&mut fs, req, parent, name, reply);
    }

    // --- Rename operations (rename.rs) ---

    fn rename(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, newparent: u64, newname: &std::ffi::OsStr, flags: u32, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        rename::rename(&mut fs, req, parent, name, newparent, newname, flags, reply);
    }

    // --- Extended attributes (xattr.rs), all unsupported ---

    fn setxattr(&mut self, req: &Request<'_>, ino: u64, name: &std::ffi::OsStr, value: &[u8], flags: i32, position: u32, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        xattr::setxattr(&mut fs, req, ino, name, value, flags, position, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &std::ffi::OsStr, size: u32, reply: ReplyXattr) {
        let mut fs = self.0.lock().unwrap();
        xattr::getxattr(&mut fs, req, ino, name, size, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let mut fs = self.0.lock().unwrap();
        xattr::listxattr(&mut fs, req, ino, size, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let mut fs = self.0.lock().unwrap();
        xattr::removexattr(&mut fs, req, ino, name, reply);
    }

    // --- Deliberately unsupported ---

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!(ino, "readlink is not supported");
        reply.error(libc::ENOSYS);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs is not supported");
        reply.error(libc::ENOSYS);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!(ino, "fsync is not supported");
        reply.error(libc::ENOSYS);
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!(ino, "fsyncdir is not supported");
        reply.error(libc::ENOSYS);
    }

    // --- Successful no-ops ---

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    // --- Shutdown ---

    fn destroy(&mut self) {
        let fs = self.0.lock().unwrap();
        fs.store_snapshot();
    }
}
