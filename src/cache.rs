//! Content-addressed on-disk cache of file bodies and patch blobs.
//!
//! Bodies are flat files named `{quickkey}_{revision}`, patch blobs
//! `{quickkey}_patch_{src}_{tgt}`. A body is written under a temporary
//! name and renamed into place only after it passed verification; once a
//! verified body exists under its final name it is never rewritten.
//!
//! `open_body` materializes a requested `(quickkey, revision)`:
//!
//! 1. already cached — open and return;
//! 2. an older revision is cached — walk the remote's patch chain from
//!    there, verifying the chain order, every patch blob, every source
//!    body and every patched result;
//! 3. otherwise — download the full body through a direct link.
//!
//! The result is verified against the expected size and SHA-256 in every
//! case. A corrupt patch chain falls back to the full download.
//!
//! A `staging` subdirectory holds the mutable files behind writable and
//! freshly created handles; staging files survive a failed upload so the
//! data can be recovered.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api_client::{PatchInfo, Remote};
use crate::error::{MfError, MfResult};
use crate::patch;
use crate::tree::FolderTree;

pub struct FileCache {
    dir: PathBuf,
    staging: PathBuf,
    next_staging: u64,
}

impl FileCache {
    pub fn open(dir: &Path) -> MfResult<FileCache> {
        fs::create_dir_all(dir)?;
        let staging = dir.join("staging");
        fs::create_dir_all(&staging)?;
        Ok(FileCache { dir: dir.to_path_buf(), staging, next_staging: 0 })
    }

    pub fn body_path(&self, quickkey: &str, revision: u64) -> PathBuf {
        self.dir.join(format!("{quickkey}_{revision}"))
    }

    fn patch_path(&self, quickkey: &str, source: u64, target: u64) -> PathBuf {
        self.dir.join(format!("{quickkey}_patch_{source}_{target}"))
    }

    pub fn has_body(&self, quickkey: &str, revision: u64) -> bool {
        self.body_path(quickkey, revision).exists()
    }

    /// Newest cached revision of `quickkey` strictly below `below`, used as
    /// the starting point for an incremental update.
    pub fn newest_local_revision(&self, quickkey: &str, below: u64) -> Option<u64> {
        let prefix = format!("{quickkey}_");
        let mut newest = None;
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return None,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else { continue };
            // skip patch blobs, they share the key prefix
            let Ok(revision) = rest.parse::<u64>() else { continue };
            if revision < below && newest.map_or(true, |n| revision > n) {
                newest = Some(revision);
            }
        }
        newest
    }

    /// Materialize the body for `(quickkey, target_revision)` and open it.
    /// On success the descriptor is positioned at offset 0 and the file
    /// content matches `expected_size` and `expected_hash`.
    pub async fn open_body<R: Remote + ?Sized>(
        &self,
        remote: &R,
        quickkey: &str,
        local_revision: Option<u64>,
        target_revision: u64,
        expected_size: u64,
        expected_hash: &[u8; 32],
    ) -> MfResult<File> {
        let path = self.body_path(quickkey, target_revision);

        if !path.exists() {
            let patched = match local_revision {
                Some(local) if self.has_body(quickkey, local) => {
                    match self.update_via_patches(remote, quickkey, local, target_revision).await {
                        Ok(patched) => patched,
                        Err(MfError::Corrupt(msg)) => {
                            warn!(quickkey, %msg, "incremental update failed, falling back to full download");
                            false
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => false,
            };
            if !patched {
                self.download_full(remote, quickkey, target_revision).await?;
            }

            if let Err(e) = verify_file(&path, Some(expected_size), expected_hash) {
                // never leave an unverifiable body under its final name
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(file)
    }

    /// Walk the patch chain from `local` to `target`. Returns false when
    /// the remote offers no patches (the caller downloads in full).
    async fn update_via_patches<R: Remote + ?Sized>(
        &self,
        remote: &R,
        quickkey: &str,
        local: u64,
        target: u64,
    ) -> MfResult<bool> {
        let patches = remote.get_updates(quickkey, local, target).await?;
        if patches.is_empty() {
            return Ok(false);
        }

        let mut last_target = local;
        for p in &patches {
            if p.source_revision != last_target {
                return Err(MfError::corrupt(format!(
                    "patch chain broken: expected source {last_target}, got {}",
                    p.source_revision
                )));
            }
            last_target = p.target_revision;

            self.fetch_patch(remote, quickkey, p).await?;

            let src_path = self.body_path(quickkey, p.source_revision);
            verify_file(&src_path, None, &decode_digest(&p.source_hash)?)?;

            self.apply_patch(quickkey, p)?;

            let tgt_path = self.body_path(quickkey, p.target_revision);
            if let Err(e) = verify_file(&tgt_path, None, &decode_digest(&p.target_hash)?) {
                let _ = fs::remove_file(&tgt_path);
                return Err(e);
            }
            debug!(quickkey, source = p.source_revision, target = p.target_revision, "patch applied");
        }

        if last_target != target {
            return Err(MfError::corrupt(format!(
                "patch chain ends at {last_target}, requested {target}"
            )));
        }
        Ok(true)
    }

    /// Download one patch blob, unless a verified copy is already present.
    async fn fetch_patch<R: Remote + ?Sized>(
        &self,
        remote: &R,
        quickkey: &str,
        p: &PatchInfo,
    ) -> MfResult<()> {
        let expected = decode_digest(&p.patch_hash)?;
        let path = self.patch_path(quickkey, p.source_revision, p.target_revision);
        if path.exists() && verify_file(&path, None, &expected).is_ok() {
            return Ok(());
        }

        let link = remote
            .get_patch(quickkey, p.source_revision, p.target_revision)
            .await?;
        if link.hash != p.patch_hash {
            return Err(MfError::corrupt(
                "patch hash from get_patch disagrees with the update list",
            ));
        }

        let tmp = self.tmp_path();
        remote.download(&link.url, &tmp).await?;
        if let Err(e) = verify_file(&tmp, None, &expected) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Apply one downloaded patch, writing the target body next to the
    /// source. A body that already exists is left untouched.
    fn apply_patch(&self, quickkey: &str, p: &PatchInfo) -> MfResult<()> {
        let target = self.body_path(quickkey, p.target_revision);
        if target.exists() {
            return Ok(());
        }

        let mut source = File::open(self.body_path(quickkey, p.source_revision))?;
        let mut blob =
            File::open(self.patch_path(quickkey, p.source_revision, p.target_revision))?;

        let tmp = self.tmp_path();
        let result = (|| {
            let mut out = File::create(&tmp)?;
            patch::apply(&mut source, &mut blob, &mut out)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                fs::rename(&tmp, &target)?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    async fn download_full<R: Remote + ?Sized>(
        &self,
        remote: &R,
        quickkey: &str,
        revision: u64,
    ) -> MfResult<()> {
        let path = self.body_path(quickkey, revision);
        if path.exists() {
            return Ok(());
        }

        let links = remote.get_file_links(quickkey).await?;
        let url = links
            .direct_download
            .or(links.normal_download)
            .ok_or_else(|| MfError::Remote {
                code: 0,
                message: format!("no download link for {quickkey}"),
            })?;

        let tmp = self.tmp_path();
        match remote.download(&url, &tmp).await {
            Ok(()) => {
                fs::rename(&tmp, &path)?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn tmp_path(&self) -> PathBuf {
        self.staging.join(format!("download_{}", std::process::id()))
    }

    /// A fresh, empty staging file for a `create` handle.
    pub fn stage_new(&mut self) -> MfResult<(PathBuf, File)> {
        let path = self.next_staging_path();
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        Ok((path, file))
    }

    /// A mutable staging copy of a cached body for a writable handle.
    pub fn stage_copy(&mut self, quickkey: &str, revision: u64) -> MfResult<(PathBuf, File)> {
        let path = self.next_staging_path();
        fs::copy(self.body_path(quickkey, revision), &path)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok((path, file))
    }

    /// A scratch path in the staging directory for an outgoing patch.
    pub fn stage_scratch(&mut self) -> PathBuf {
        self.next_staging_path()
    }

    fn next_staging_path(&mut self) -> PathBuf {
        self.next_staging += 1;
        self.staging
            .join(format!("staging_{}_{}", std::process::id(), self.next_staging))
    }

    pub fn discard_staging(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "cannot remove staging file");
        }
    }

    /// Best-effort sweep of the cache directory: bodies and patch blobs
    /// whose quickkey no longer has a live entry are removed. Entries that
    /// survived the tree sweep keep their bodies, including the
    /// mid-move ones whose revision equals the tree revision.
    pub fn sweep(&self, tree: &FolderTree) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list cache directory");
                return;
            }
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((quickkey, _)) = name.split_once('_') else { continue };
            if tree.lookup_key(Some(quickkey)).is_none() {
                debug!(name, "sweeping cache file without a live entry");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(name, error = %e, "cannot remove cache file");
                }
            }
        }
    }
}

/// Streaming SHA-256 plus size of a file on disk.
pub fn sha256_file(path: &Path) -> MfResult<([u8; 32], u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().into(), size))
}

/// Check a file against an expected size and SHA-256.
fn verify_file(path: &Path, expected_size: Option<u64>, expected_hash: &[u8; 32]) -> MfResult<()> {
    let (hash, size) = sha256_file(path)?;
    if let Some(expected) = expected_size {
        if size != expected {
            return Err(MfError::corrupt(format!(
                "{}: size {size}, expected {expected}",
                path.display()
            )));
        }
    }
    if &hash != expected_hash {
        return Err(MfError::corrupt(format!("{}: hash mismatch", path.display())));
    }
    Ok(())
}

/// Decode a hex-encoded SHA-256 digest from the wire.
pub fn decode_digest(hash: &str) -> MfResult<[u8; 32]> {
    let raw =
        hex::decode(hash).map_err(|e| MfError::corrupt(format!("bad hash encoding: {e}")))?;
    raw.try_into()
        .map_err(|_| MfError::corrupt(format!("hash has wrong length: {hash}")))
}
