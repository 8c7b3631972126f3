//! In-memory fake of the remote API, shared by the unit tests.
//!
//! Holds a flat account: folder and file records with parent keys, a
//! change log, downloadable blobs addressed by fake URLs, and recorded
//! uploads. Every trait method counts its invocations so tests can assert
//! which paths were (not) taken.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::api_client::{
    ChangeKind, DeviceChange, FileLinks, HashCheck, PatchInfo, PatchLink, Remote, RemoteFile,
    RemoteFolder, UploadStatus,
};
use crate::error::{MfError, MfResult};
use crate::patch;

#[derive(Debug, Clone)]
pub struct Upload {
    pub folderkey: Option<String>,
    pub filename: String,
    pub data: Vec<u8>,
    pub quickkey: Option<String>,
}

#[derive(Default)]
struct State {
    revision: u64,
    folders: HashMap<String, RemoteFolder>,
    files: HashMap<String, RemoteFile>,
    changes: Vec<DeviceChange>,
    links: HashMap<String, String>,
    blobs: HashMap<String, Vec<u8>>,
    updates: HashMap<String, Vec<PatchInfo>>,
    patch_links: HashMap<(String, u64, u64), PatchLink>,
    uploads: Vec<Upload>,
    poll_queue: VecDeque<UploadStatus>,
    check: HashCheck,
    folder_info_failures: HashMap<String, i64>,
    counts: HashMap<&'static str, u32>,
}

pub struct MockRemote {
    state: Mutex<State>,
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl MockRemote {
    pub fn new() -> MockRemote {
        MockRemote { state: Mutex::new(State::default()) }
    }

    pub fn set_revision(&self, revision: u64) {
        self.state.lock().unwrap().revision = revision;
    }

    pub fn add_folder(&self, key: &str, name: &str, parent: &str, revision: u64) {
        self.state.lock().unwrap().folders.insert(
            key.to_string(),
            RemoteFolder {
                folderkey: key.to_string(),
                name: name.to_string(),
                parent: parent.to_string(),
                revision,
                created: 1_400_000_000,
            },
        );
    }

    pub fn add_file(&self, key: &str, name: &str, parent: &str, revision: u64, body: &[u8]) {
        self.state.lock().unwrap().files.insert(
            key.to_string(),
            RemoteFile {
                quickkey: key.to_string(),
                name: name.to_string(),
                hash: hex_digest(body),
                size: body.len() as u64,
                revision,
                parent: parent.to_string(),
                created: 1_400_000_000,
            },
        );
        self.serve_body(key, revision, body);
    }

    pub fn update_file(&self, key: &str, revision: u64, body: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            let file = state.files.get_mut(key).expect("unknown file in mock");
            file.revision = revision;
            file.hash = hex_digest(body);
            file.size = body.len() as u64;
        }
        self.serve_body(key, revision, body);
    }

    pub fn update_folder_revision(&self, key: &str, revision: u64) {
        let mut state = self.state.lock().unwrap();
        state.folders.get_mut(key).expect("unknown folder in mock").revision = revision;
    }

    pub fn set_folder_parent(&self, key: &str, parent: &str) {
        let mut state = self.state.lock().unwrap();
        state.folders.get_mut(key).expect("unknown folder in mock").parent = parent.to_string();
    }

    pub fn remove_entry(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.folders.remove(key);
        state.files.remove(key);
    }

    pub fn push_change(&self, kind: ChangeKind, key: &str, parent: &str, revision: u64) {
        self.state.lock().unwrap().changes.push(DeviceChange {
            kind,
            key: key.to_string(),
            parent: parent.to_string(),
            revision,
        });
    }

    /// Make a body downloadable and point the file's direct link at it.
    pub fn serve_body(&self, quickkey: &str, revision: u64, body: &[u8]) {
        let url = format!("mock://body/{quickkey}/{revision}");
        let mut state = self.state.lock().unwrap();
        state.links.insert(quickkey.to_string(), url.clone());
        state.blobs.insert(url, body.to_vec());
    }

    /// Publish a real patch between two bodies on the update chain.
    pub fn serve_patch(&self, quickkey: &str, source: u64, target: u64, from: &[u8], to: &[u8]) {
        let mut blob = Vec::new();
        patch::diff(&mut std::io::Cursor::new(from), &mut std::io::Cursor::new(to), &mut blob)
            .expect("diff in mock");
        self.serve_patch_blob(quickkey, source, target, from, to, blob);
    }

    /// Publish a patch whose blob verifies but does not decode, to force
    /// the corrupt-chain fallback.
    pub fn serve_corrupt_patch(
        &self,
        quickkey: &str,
        source: u64,
        target: u64,
        from: &[u8],
        to: &[u8],
    ) {
        self.serve_patch_blob(quickkey, source, target, from, to, b"not a patch".to_vec());
    }

    fn serve_patch_blob(
        &self,
        quickkey: &str,
        source: u64,
        target: u64,
        from: &[u8],
        to: &[u8],
        blob: Vec<u8>,
    ) {
        let url = format!("mock://patch/{quickkey}/{source}/{target}");
        let patch_hash = hex_digest(&blob);
        let mut state = self.state.lock().unwrap();
        state.updates.entry(quickkey.to_string()).or_default().push(PatchInfo {
            source_revision: source,
            target_revision: target,
            source_hash: hex_digest(from),
            target_hash: hex_digest(to),
            patch_hash: patch_hash.clone(),
        });
        state
            .patch_links
            .insert((quickkey.to_string(), source, target), PatchLink { url: url.clone(), hash: patch_hash });
        state.blobs.insert(url, blob);
    }

    pub fn fail_folder_info(&self, key: &str, code: i64) {
        self.state.lock().unwrap().folder_info_failures.insert(key.to_string(), code);
    }

    pub fn set_check_hash_exists(&self) {
        self.state.lock().unwrap().check =
            HashCheck { hash_exists: true, in_account: true, file_exists: false, different_hash: false };
    }

    pub fn push_poll(&self, status: UploadStatus) {
        self.state.lock().unwrap().poll_queue.push_back(status);
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn call_count(&self, name: &str) -> u32 {
        *self.state.lock().unwrap().counts.get(name).unwrap_or(&0)
    }

    fn count(&self, name: &'static str) {
        *self.state.lock().unwrap().counts.entry(name).or_insert(0) += 1;
    }

    fn not_found(key: &str) -> MfError {
        MfError::Remote { code: 110, message: format!("unknown key {key}") }
    }
}

#[async_trait]
impl Remote for MockRemote {
    async fn get_status(&self) -> MfResult<u64> {
        self.count("get_status");
        Ok(self.state.lock().unwrap().revision)
    }

    async fn get_changes(&self, since: u64) -> MfResult<Vec<DeviceChange>> {
        self.count("get_changes");
        let mut changes: Vec<DeviceChange> = self
            .state
            .lock()
            .unwrap()
            .changes
            .iter()
            .filter(|c| c.revision > since)
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.revision);
        Ok(changes)
    }

    async fn get_folder_info(&self, folderkey: Option<&str>) -> MfResult<RemoteFolder> {
        self.count("get_folder_info");
        let state = self.state.lock().unwrap();
        match folderkey {
            None => Ok(RemoteFolder::default()),
            Some(key) => {
                if let Some(&code) = state.folder_info_failures.get(key) {
                    return Err(MfError::Remote { code, message: "injected failure".into() });
                }
                state.folders.get(key).cloned().ok_or_else(|| Self::not_found(key))
            }
        }
    }

    async fn get_content_folders(&self, folderkey: Option<&str>) -> MfResult<Vec<RemoteFolder>> {
        self.count("get_content_folders");
        let parent = folderkey.unwrap_or("");
        let state = self.state.lock().unwrap();
        Ok(state
            .folders
            .values()
            .filter(|f| f.parent == parent && !f.folderkey.is_empty())
            .cloned()
            .collect())
    }

    async fn get_content_files(&self, folderkey: Option<&str>) -> MfResult<Vec<RemoteFile>> {
        self.count("get_content_files");
        let parent = folderkey.unwrap_or("");
        let state = self.state.lock().unwrap();
        Ok(state.files.values().filter(|f| f.parent == parent).cloned().collect())
    }

    async fn get_file_info(&self, quickkey: &str) -> MfResult<RemoteFile> {
        self.count("get_file_info");
        self.state
            .lock()
            .unwrap()
            .files
            .get(quickkey)
            .cloned()
            .ok_or_else(|| Self::not_found(quickkey))
    }

    async fn get_file_links(&self, quickkey: &str) -> MfResult<FileLinks> {
        self.count("get_file_links");
        let state = self.state.lock().unwrap();
        let url = state.links.get(quickkey).cloned().ok_or_else(|| Self::not_found(quickkey))?;
        Ok(FileLinks { direct_download: Some(url), normal_download: None, one_time_download: None })
    }

    async fn get_updates(
        &self,
        quickkey: &str,
        source: u64,
        target: u64,
    ) -> MfResult<Vec<PatchInfo>> {
        self.count("get_updates");
        let state = self.state.lock().unwrap();
        let mut chain: Vec<PatchInfo> = state
            .updates
            .get(quickkey)
            .map(|v| {
                v.iter()
                    .filter(|p| p.source_revision >= source && p.target_revision <= target)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chain.sort_by_key(|p| p.source_revision);
        Ok(chain)
    }

    async fn get_patch(&self, quickkey: &str, source: u64, target: u64) -> MfResult<PatchLink> {
        self.count("get_patch");
        self.state
            .lock()
            .unwrap()
            .patch_links
            .get(&(quickkey.to_string(), source, target))
            .cloned()
            .ok_or_else(|| Self::not_found(quickkey))
    }

    async fn download(&self, url: &str, dest: &Path) -> MfResult<()> {
        self.count("download");
        let blob = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| MfError::Remote { code: 404, message: format!("no blob at {url}") })?;
        std::fs::write(dest, blob)?;
        Ok(())
    }

    async fn upload_file(
        &self,
        folderkey: Option<&str>,
        src: &Path,
        filename: &str,
    ) -> MfResult<String> {
        self.count("upload_file");
        let data = std::fs::read(src)?;
        let mut state = self.state.lock().unwrap();
        state.uploads.push(Upload {
            folderkey: folderkey.map(str::to_string),
            filename: filename.to_string(),
            data,
            quickkey: None,
        });
        Ok(format!("upload-{}", state.uploads.len()))
    }

    async fn upload_instant(
        &self,
        _folderkey: Option<&str>,
        _filename: &str,
        _hash: &str,
        _size: u64,
    ) -> MfResult<()> {
        self.count("upload_instant");
        Ok(())
    }

    async fn upload_patch(
        &self,
        quickkey: &str,
        _source_hash: &str,
        _target_hash: &str,
        _target_size: u64,
        patch: &Path,
    ) -> MfResult<String> {
        self.count("upload_patch");
        let data = std::fs::read(patch)?;
        let mut state = self.state.lock().unwrap();
        state.uploads.push(Upload {
            folderkey: None,
            filename: String::new(),
            data,
            quickkey: Some(quickkey.to_string()),
        });
        Ok(format!("upload-{}", state.uploads.len()))
    }

    async fn poll_upload(&self, _upload_key: &str) -> MfResult<UploadStatus> {
        self.count("poll_upload");
        Ok(self
            .state
            .lock()
            .unwrap()
            .poll_queue
            .pop_front()
            .unwrap_or(UploadStatus { status: 99, file_error: 0, quickkey: None }))
    }

    async fn check_hash(
        &self,
        _folderkey: Option<&str>,
        _filename: &str,
        _hash: &str,
        _size: u64,
    ) -> MfResult<HashCheck> {
        self.count("check_hash");
        Ok(self.state.lock().unwrap().check.clone())
    }

    async fn file_delete(&self, _quickkey: &str) -> MfResult<()> {
        self.count("file_delete");
        Ok(())
    }

    async fn folder_delete(&self, _folderkey: &str) -> MfResult<()> {
        self.count("folder_delete");
        Ok(())
    }

    async fn file_move(&self, _quickkey: &str, _folderkey: Option<&str>) -> MfResult<()> {
        self.count("file_move");
        Ok(())
    }

    async fn folder_move(&self, _folderkey: &str, _dest: Option<&str>) -> MfResult<()> {
        self.count("folder_move");
        Ok(())
    }

    async fn file_rename(&self, _quickkey: &str, _name: &str) -> MfResult<()> {
        self.count("file_rename");
        Ok(())
    }

    async fn folder_rename(&self, _folderkey: &str, _name: &str) -> MfResult<()> {
        self.count("folder_rename");
        Ok(())
    }

    async fn folder_create(&self, _parent: Option<&str>, _name: &str) -> MfResult<()> {
        self.count("folder_create");
        Ok(())
    }
}
