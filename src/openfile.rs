//! Open-file coordination: who may open what, and what happens on close.
//!
//! The registry tracks currently open paths in two containers: a multiset
//! of read-only opens and a set of paths open for writing. A path is in at
//! most one of the two, and at most once in the write set:
//!
//!  1. a file open for writing cannot be opened again in any mode;
//!  2. a file open read-only can gain more readers but no writer;
//!  3. the body revision observed at the first open stays frozen for every
//!     later reader until the last handle closes.
//!
//! Closing a handle is where edits leave the machine: a local-only handle
//! uploads a brand-new file (instantly, if the remote already knows the
//! content hash), a writable handle uploads a binary patch against the
//! cached body it was cloned from.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::api_client::{Remote, UPLOAD_STATUS_DONE};
use crate::cache::{self, FileCache};
use crate::error::{MfError, MfResult};
use crate::patch;
use crate::tree::FolderTree;

const POLL_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    Writable,
    /// Created locally, not uploaded yet.
    LocalOnly,
}

/// The cached body a set of handles is pinned to.
#[derive(Debug, Clone)]
pub struct FrozenBody {
    pub quickkey: String,
    pub revision: u64,
    pub hash: [u8; 32],
    pub size: u64,
}

/// One open descriptor handed to the kernel.
pub struct OpenHandle {
    pub file: File,
    pub path: String,
    pub mode: OpenMode,
    /// Mutable staging copy backing writable and local-only handles.
    pub staging: Option<PathBuf>,
    /// The body the staging copy was cloned from; writable handles only.
    pub source: Option<FrozenBody>,
}

#[derive(Debug)]
struct ReadOnlyOpen {
    count: u32,
    body: FrozenBody,
}

#[derive(Default)]
pub struct OpenFileRegistry {
    readonly: HashMap<String, ReadOnlyOpen>,
    write: HashSet<String>,
}

impl OpenFileRegistry {
    pub fn new() -> OpenFileRegistry {
        OpenFileRegistry::default()
    }

    pub fn write_locked(&self, path: &str) -> bool {
        self.write.contains(path)
    }

    #[cfg(test)]
    fn readonly_count(&self, path: &str) -> u32 {
        self.readonly.get(path).map_or(0, |o| o.count)
    }

    /// Record the first read-only opener of a path together with the body
    /// it observed.
    pub fn open_readonly(&mut self, path: &str, body: FrozenBody) -> MfResult<()> {
        if self.write.contains(path) {
            return Err(MfError::Busy(path.to_string()));
        }
        if self.readonly.contains_key(path) {
            // the first opener freezes the body; later openers must go
            // through reopen_readonly
            return Err(MfError::Busy(path.to_string()));
        }
        self.readonly.insert(path.to_string(), ReadOnlyOpen { count: 1, body });
        Ok(())
    }

    /// Peek at the body frozen by the first reader, without touching the
    /// multiplicity.
    pub fn frozen_body(&self, path: &str) -> Option<FrozenBody> {
        self.readonly.get(path).map(|open| open.body.clone())
    }

    /// Another reader for an already-open path: bump the multiplicity and
    /// hand back the frozen body, without refreshing anything.
    pub fn reopen_readonly(&mut self, path: &str) -> Option<FrozenBody> {
        self.readonly.get_mut(path).map(|open| {
            open.count += 1;
            open.body.clone()
        })
    }

    /// Claim a path for writing. Denied while the path is open in any mode.
    pub fn open_write(&mut self, path: &str) -> MfResult<()> {
        if self.write.contains(path) || self.readonly.contains_key(path) {
            return Err(MfError::Busy(path.to_string()));
        }
        self.write.insert(path.to_string());
        Ok(())
    }

    pub fn release_readonly(&mut self, path: &str) -> MfResult<()> {
        let open = self.readonly.get_mut(path).ok_or(MfError::NotFound)?;
        open.count -= 1;
        if open.count == 0 {
            self.readonly.remove(path);
        }
        Ok(())
    }

    pub fn release_write(&mut self, path: &str) -> MfResult<()> {
        if !self.write.remove(path) {
            return Err(MfError::NotFound);
        }
        Ok(())
    }

    /// A write-locked path moves under a new name without closing; used by
    /// rename while a handle is open.
    pub fn rename(&mut self, old: &str, new: &str) {
        if self.write.remove(old) {
            self.write.insert(new.to_string());
        }
        if let Some(open) = self.readonly.remove(old) {
            self.readonly.insert(new.to_string(), open);
        }
    }
}

/// Split an absolute path into its parent directory and basename.
pub fn split_path(path: &str) -> MfResult<(String, String)> {
    let (dir, name) = path.rsplit_once('/').ok_or(MfError::NotFound)?;
    if name.is_empty() {
        return Err(MfError::NotFound);
    }
    let dir = if dir.is_empty() { "/".to_string() } else { dir.to_string() };
    Ok((dir, name.to_string()))
}

fn registry_desync(what: &str) -> MfError {
    MfError::Io(std::io::Error::other(format!("open handle without {what}")))
}

/// Upload a freshly created file into its parent folder and wait for the
/// remote to finish assembling it. The caller drops the path from the
/// write set and refreshes afterwards.
pub async fn release_local<R: Remote + ?Sized>(
    handle: &OpenHandle,
    tree: &FolderTree,
    remote: &R,
) -> MfResult<()> {
    let staging = handle.staging.as_deref().ok_or_else(|| registry_desync("staging file"))?;
    let (dir, filename) = split_path(&handle.path)?;
    let parent = tree.lookup_path(&dir)?;
    let folderkey = (!parent.key.is_empty()).then_some(parent.key.as_str());

    let (hash, size) = cache::sha256_file(staging)?;
    let hash_hex = hex::encode(hash);

    // skip the transfer entirely when the remote already stores a file
    // with this content
    let check = remote.check_hash(folderkey, &filename, &hash_hex, size).await?;
    if check.hash_exists {
        info!(path = %handle.path, "content known remotely, instant upload");
        remote.upload_instant(folderkey, &filename, &hash_hex, size).await?;
    } else {
        let upload_key = remote.upload_file(folderkey, staging, &filename).await?;
        poll_until_done(remote, &upload_key).await?;
    }

    info!(path = %handle.path, size, "initial upload complete");
    Ok(())
}

/// Diff the staging copy against the cached body it was cloned from and
/// upload the patch as an edit of the existing quickkey. When nothing
/// changed, no call is made.
pub async fn release_writable<R: Remote + ?Sized>(
    handle: &OpenHandle,
    cache: &mut FileCache,
    remote: &R,
) -> MfResult<()> {
    let staging = handle.staging.as_deref().ok_or_else(|| registry_desync("staging file"))?;
    let source = handle.source.as_ref().ok_or_else(|| registry_desync("source body"))?;

    let (target_hash, target_size) = cache::sha256_file(staging)?;
    if target_hash == source.hash {
        debug!(path = %handle.path, "body unchanged, nothing to upload");
        return Ok(());
    }

    let source_path = cache.body_path(&source.quickkey, source.revision);
    let patch_path = cache.stage_scratch();
    let diffed = (|| -> MfResult<()> {
        let mut src = File::open(&source_path)?;
        let mut tgt = File::open(staging)?;
        let mut out = File::create(&patch_path)?;
        patch::diff(&mut src, &mut tgt, &mut out)
    })();
    if let Err(e) = diffed {
        cache.discard_staging(&patch_path);
        return Err(e);
    }

    let uploaded = remote
        .upload_patch(
            &source.quickkey,
            &hex::encode(source.hash),
            &hex::encode(target_hash),
            target_size,
            &patch_path,
        )
        .await;
    cache.discard_staging(&patch_path);
    let upload_key = uploaded?;

    poll_until_done(remote, &upload_key).await?;
    info!(path = %handle.path, quickkey = %source.quickkey, "patch upload complete");
    Ok(())
}

/// The upload endpoints return immediately; a separate poll endpoint
/// reports server-side assembly progress until status 99.
async fn poll_until_done<R: Remote + ?Sized>(remote: &R, upload_key: &str) -> MfResult<()> {
    for attempt in 0..POLL_ATTEMPTS {
        let status = remote.poll_upload(upload_key).await?;
        if status.file_error != 0 {
            return Err(MfError::Remote {
                code: status.file_error as i64,
                message: format!("upload rejected with file error {}", status.file_error),
            });
        }
        if status.status == UPLOAD_STATUS_DONE {
            return Ok(());
        }
        debug!(upload_key, attempt, status = status.status, "upload still assembling");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(MfError::Transient(format!("upload {upload_key} did not complete")))
}
