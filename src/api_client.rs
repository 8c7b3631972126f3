//! Asynchronous client for the remote REST API.
//!
//! All functions here use `reqwest` to perform HTTP requests and are intended
//! to be called from within the Tokio runtime (e.g. using `runtime.block_on`
//! in the synchronous FUSE implementation).
//!
//! Every call is signed: the session carries a secret key that both ends
//! advance after each signed request, so a lost response leaves client and
//! server out of sync. The remote then answers with the invalid-signature
//! error code and the client renews its session token between retries.
//!
//! The `Remote` trait is the seam the synchronization core is written
//! against; production code uses `ApiClient`, the tests an in-memory mock.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use crate::error::{MfError, MfResult};

/// Bounded retry for transient timeouts and signature desync.
const MAX_ATTEMPTS: u32 = 3;

/// Remote error code for a call whose signature did not match.
pub const ERR_INVALID_SIGNATURE: i64 = 127;

/// `poll_upload` reports this status once the remote finished assembling
/// the uploaded file.
pub const UPLOAD_STATUS_DONE: u32 = 99;

/// Remote error codes meaning "this key does not (or no longer does) exist".
pub fn is_not_found_code(code: i64) -> bool {
    matches!(code, 110 | 112)
}

/// The remote encodes most integers as JSON strings; accept both.
fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// A folder record as returned by `folder/get_info` and
/// `folder/get_content`. The root folder has an empty `folderkey`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RemoteFolder {
    #[serde(default)]
    pub folderkey: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "parent_folderkey")]
    pub parent: String,
    #[serde(default, deserialize_with = "de_u64")]
    pub revision: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub created: u64,
}

/// A file record as returned by `file/get_info` and `folder/get_content`.
/// `hash` is the hex-encoded SHA-256 of the file body at `revision`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RemoteFile {
    pub quickkey: String,
    #[serde(default, alias = "filename")]
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default, deserialize_with = "de_u64")]
    pub size: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub revision: u64,
    #[serde(default, alias = "parent_folderkey")]
    pub parent: String,
    #[serde(default, deserialize_with = "de_u64")]
    pub created: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    UpdatedFile,
    UpdatedFolder,
    DeletedFile,
    DeletedFolder,
}

/// One entry of the device change log, ordered by `revision`.
#[derive(Debug, Clone)]
pub struct DeviceChange {
    pub kind: ChangeKind,
    pub key: String,
    pub parent: String,
    pub revision: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FileLinks {
    #[serde(default)]
    pub direct_download: Option<String>,
    #[serde(default)]
    pub normal_download: Option<String>,
    #[serde(default)]
    pub one_time_download: Option<String>,
}

/// One step of a revision chain as returned by `device/get_updates`.
#[derive(Deserialize, Debug, Clone)]
pub struct PatchInfo {
    #[serde(deserialize_with = "de_u64")]
    pub source_revision: u64,
    #[serde(deserialize_with = "de_u64")]
    pub target_revision: u64,
    pub source_hash: String,
    pub target_hash: String,
    pub patch_hash: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PatchLink {
    #[serde(alias = "link")]
    pub url: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadStatus {
    pub status: u32,
    pub file_error: u32,
    pub quickkey: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HashCheck {
    pub hash_exists: bool,
    pub in_account: bool,
    pub file_exists: bool,
    pub different_hash: bool,
}

/// The remote operations the synchronization core is built on.
///
/// Folder keys are passed as `Option<&str>`: `None` addresses the account
/// root, which has no key of its own.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn get_status(&self) -> MfResult<u64>;
    async fn get_changes(&self, since: u64) -> MfResult<Vec<DeviceChange>>;
    async fn get_folder_info(&self, folderkey: Option<&str>) -> MfResult<RemoteFolder>;
    async fn get_content_folders(&self, folderkey: Option<&str>) -> MfResult<Vec<RemoteFolder>>;
    async fn get_content_files(&self, folderkey: Option<&str>) -> MfResult<Vec<RemoteFile>>;
    async fn get_file_info(&self, quickkey: &str) -> MfResult<RemoteFile>;
    async fn get_file_links(&self, quickkey: &str) -> MfResult<FileLinks>;
    async fn get_updates(&self, quickkey: &str, source: u64, target: u64)
    -> MfResult<Vec<PatchInfo>>;
    async fn get_patch(&self, quickkey: &str, source: u64, target: u64) -> MfResult<PatchLink>;
    async fn download(&self, url: &str, dest: &Path) -> MfResult<()>;
    async fn upload_file(
        &self,
        folderkey: Option<&str>,
        src: &Path,
        filename: &str,
    ) -> MfResult<String>;
    async fn upload_instant(
        &self,
        folderkey: Option<&str>,
        filename: &str,
        hash: &str,
        size: u64,
    ) -> MfResult<()>;
    async fn upload_patch(
        &self,
        quickkey: &str,
        source_hash: &str,
        target_hash: &str,
        target_size: u64,
        patch: &Path,
    ) -> MfResult<String>;
    async fn poll_upload(&self, upload_key: &str) -> MfResult<UploadStatus>;
    async fn check_hash(
        &self,
        folderkey: Option<&str>,
        filename: &str,
        hash: &str,
        size: u64,
    ) -> MfResult<HashCheck>;
    async fn file_delete(&self, quickkey: &str) -> MfResult<()>;
    async fn folder_delete(&self, folderkey: &str) -> MfResult<()>;
    async fn file_move(&self, quickkey: &str, folderkey: Option<&str>) -> MfResult<()>;
    async fn folder_move(&self, folderkey: &str, dest: Option<&str>) -> MfResult<()>;
    async fn file_rename(&self, quickkey: &str, name: &str) -> MfResult<()>;
    async fn folder_rename(&self, folderkey: &str, name: &str) -> MfResult<()>;
    async fn folder_create(&self, parent: Option<&str>, name: &str) -> MfResult<()>;
}

struct Session {
    token: String,
    secret_key: u64,
    secret_time: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    server: String,
    username: String,
    password: String,
    app_id: u32,
    api_key: Option<String>,
    session: Mutex<Session>,
}

/// Advance the shared secret the way the remote does after every signed
/// call: a Lehmer generator over the Mersenne prime 2^31 - 1.
fn next_secret_key(key: u64) -> u64 {
    (key * 16807) % 0x7FFF_FFFF
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Per-call signature over the rotating secret, the session time stamp and
/// the full request URI.
fn sign_call(secret_key: u64, secret_time: &str, uri: &str) -> String {
    sha256_hex(format!("{}{}{}", secret_key % 256, secret_time, uri).as_bytes())
}

fn map_reqwest_err(e: reqwest::Error) -> MfError {
    if e.is_decode() {
        MfError::corrupt(format!("invalid response body: {e}"))
    } else {
        // Timeouts, connection failures and request errors are all worth a
        // bounded retry; everything the remote consciously answers comes
        // back as a decoded envelope instead.
        MfError::Transient(e.to_string())
    }
}

fn value_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_yes(v: &Value) -> bool {
    v.as_str() == Some("yes")
}

/// Unwrap the `{"response": {...}}` envelope and turn `result = "Error"`
/// into a typed remote error.
fn check_envelope(body: Value) -> MfResult<Value> {
    let response = body
        .get("response")
        .cloned()
        .ok_or_else(|| MfError::corrupt("response envelope missing"))?;
    let result = response.get("result").and_then(Value::as_str).unwrap_or("");
    if result != "Success" {
        let code = response
            .get("error")
            .and_then(|v| value_u64(v).map(|n| n as i64))
            .unwrap_or(0);
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error")
            .to_string();
        return Err(MfError::Remote { code, message });
    }
    Ok(response)
}

impl ApiClient {
    /// Obtain a session token and return a ready-to-use client.
    pub async fn login(
        server: &str,
        username: &str,
        password: &str,
        app_id: u32,
        api_key: Option<&str>,
    ) -> MfResult<ApiClient> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(map_reqwest_err)?;

        let session =
            Self::fetch_session(&http, server, username, password, app_id, api_key).await?;

        Ok(ApiClient {
            http,
            server: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            app_id,
            api_key: api_key.map(str::to_string),
            session: Mutex::new(session),
        })
    }

    async fn fetch_session(
        http: &reqwest::Client,
        server: &str,
        username: &str,
        password: &str,
        app_id: u32,
        api_key: Option<&str>,
    ) -> MfResult<Session> {
        let signature = sha256_hex(
            format!("{}{}{}{}", username, password, app_id, api_key.unwrap_or("")).as_bytes(),
        );

        let query = {
            let mut ser = form_urlencoded::Serializer::new(String::new());
            ser.append_pair("email", username);
            ser.append_pair("password", password);
            ser.append_pair("application_id", &app_id.to_string());
            ser.append_pair("signature", &signature);
            ser.append_pair("token_version", "2");
            ser.append_pair("response_format", "json");
            ser.finish().to_string()
        };

        let url = format!("https://{server}/api/1.5/user/get_session_token.php?{query}");
        let body: Value = http
            .get(&url)
            .send()
            .await
            .map_err(map_reqwest_err)?
            .json()
            .await
            .map_err(map_reqwest_err)?;
        let response = check_envelope(body)?;

        let token = response
            .get("session_token")
            .and_then(Value::as_str)
            .ok_or_else(|| MfError::corrupt("session_token missing"))?
            .to_string();
        let secret_key = response
            .get("secret_key")
            .and_then(value_u64)
            .ok_or_else(|| MfError::corrupt("secret_key missing"))?;
        let secret_time = response
            .get("time")
            .and_then(Value::as_str)
            .ok_or_else(|| MfError::corrupt("time missing"))?
            .to_string();

        Ok(Session { token, secret_key, secret_time })
    }

    async fn renew_session(&self) -> MfResult<()> {
        let session = Self::fetch_session(
            &self.http,
            &self.server,
            &self.username,
            &self.password,
            self.app_id,
            self.api_key.as_deref(),
        )
        .await?;
        *self.session.lock().unwrap() = session;
        Ok(())
    }

    fn rotate_secret(&self) {
        let mut session = self.session.lock().unwrap();
        session.secret_key = next_secret_key(session.secret_key);
    }

    /// Build the signed URL for `endpoint` with the current session state.
    fn signed_url(&self, endpoint: &str, params: &[(&str, String)]) -> MfResult<Url> {
        let (token, secret_key, secret_time) = {
            let session = self.session.lock().unwrap();
            (session.token.clone(), session.secret_key, session.secret_time.clone())
        };

        let uri = format!("/api/1.5/{endpoint}.php");
        let mut ser = form_urlencoded::Serializer::new(String::new());
        for (k, v) in params {
            ser.append_pair(k, v);
        }
        ser.append_pair("session_token", &token);
        ser.append_pair("response_format", "json");
        let query = ser.finish();

        let signature = sign_call(secret_key, &secret_time, &format!("{uri}?{query}"));
        let full = format!("https://{}{}?{}&signature={}", self.server, uri, query, signature);
        Url::parse(&full)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e).into())
    }

    async fn call_once(&self, endpoint: &str, params: &[(&str, String)]) -> MfResult<Value> {
        let url = self.signed_url(endpoint, params)?;
        let body: Value = self
            .http
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_err)?
            .json()
            .await
            .map_err(map_reqwest_err)?;
        self.rotate_secret();
        check_envelope(body)
    }

    /// Signed GET with the bounded retry policy: transient timeouts are
    /// retried as-is, signature desync triggers a session renewal between
    /// attempts, everything else propagates immediately.
    async fn call(&self, endpoint: &str, params: Vec<(&str, String)>) -> MfResult<Value> {
        let mut last = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.call_once(endpoint, &params).await {
                Ok(v) => return Ok(v),
                Err(MfError::Transient(msg)) => {
                    warn!(endpoint, attempt, error = %msg, "transient transport failure");
                    last = Some(MfError::Transient(msg));
                }
                Err(MfError::Remote { code, message }) if code == ERR_INVALID_SIGNATURE => {
                    warn!(endpoint, attempt, "signature desync, renewing session token");
                    self.renew_session().await?;
                    last = Some(MfError::Remote { code, message });
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| MfError::Transient("retries exhausted".into())))
    }

    /// Signed POST carrying an opaque body. Uploads are not idempotent, so
    /// this path never retries.
    async fn call_upload(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
        filename: &str,
        body: Bytes,
    ) -> MfResult<Value> {
        let url = self.signed_url(endpoint, &params)?;
        let response: Value = self
            .http
            .post(url)
            .header("x-filename", filename)
            .header("content-type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_err)?
            .json()
            .await
            .map_err(map_reqwest_err)?;
        self.rotate_secret();
        check_envelope(response)
    }

    fn folder_param(folderkey: Option<&str>) -> (&'static str, String) {
        ("folder_key", folderkey.unwrap_or("").to_string())
    }

    /// `folder/get_content` is chunked on the wire: loop until the remote
    /// reports no more chunks.
    async fn content_chunks(
        &self,
        folderkey: Option<&str>,
        content_type: &str,
    ) -> MfResult<Vec<Value>> {
        let mut out = Vec::new();
        for chunk in 1u32.. {
            let response = self
                .call(
                    "folder/get_content",
                    vec![
                        Self::folder_param(folderkey),
                        ("content_type", content_type.to_string()),
                        ("chunk", chunk.to_string()),
                    ],
                )
                .await?;
            let content = &response["folder_content"];
            if let Some(arr) = content[content_type].as_array() {
                out.extend(arr.iter().cloned());
            }
            if !value_yes(&content["more_chunks"]) {
                break;
            }
        }
        Ok(out)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(v: Value) -> MfResult<T> {
    serde_json::from_value(v).map_err(|e| MfError::corrupt(format!("malformed record: {e}")))
}

#[async_trait]
impl Remote for ApiClient {
    async fn get_status(&self) -> MfResult<u64> {
        let response = self.call("device/get_status", vec![]).await?;
        response
            .get("device_revision")
            .and_then(value_u64)
            .ok_or_else(|| MfError::corrupt("device_revision missing"))
    }

    async fn get_changes(&self, since: u64) -> MfResult<Vec<DeviceChange>> {
        let response = self
            .call("device/get_changes", vec![("revision", since.to_string())])
            .await?;

        let mut changes = Vec::new();
        let mut collect = |node: &Value, key_field: &str, kind: ChangeKind| {
            if let Some(arr) = node.as_array() {
                for item in arr {
                    let key = item.get(key_field).and_then(Value::as_str);
                    let revision = item.get("revision").and_then(value_u64);
                    let parent = item
                        .get("parent_folderkey")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let (Some(key), Some(revision)) = (key, revision) else {
                        warn!("change record without key or revision, skipping");
                        continue;
                    };
                    changes.push(DeviceChange {
                        kind,
                        key: key.to_string(),
                        parent: parent.to_string(),
                        revision,
                    });
                }
            }
        };

        collect(&response["updated"]["files"], "quickkey", ChangeKind::UpdatedFile);
        collect(&response["updated"]["folders"], "folderkey", ChangeKind::UpdatedFolder);
        collect(&response["deleted"]["files"], "quickkey", ChangeKind::DeletedFile);
        collect(&response["deleted"]["folders"], "folderkey", ChangeKind::DeletedFolder);

        // the core applies changes strictly in revision order
        changes.sort_by_key(|c| c.revision);
        Ok(changes)
    }

    async fn get_folder_info(&self, folderkey: Option<&str>) -> MfResult<RemoteFolder> {
        let response = self
            .call("folder/get_info", vec![Self::folder_param(folderkey)])
            .await?;
        from_value(response["folder_info"].clone())
    }

    async fn get_content_folders(&self, folderkey: Option<&str>) -> MfResult<Vec<RemoteFolder>> {
        let raw = self.content_chunks(folderkey, "folders").await?;
        raw.into_iter().map(from_value).collect()
    }

    async fn get_content_files(&self, folderkey: Option<&str>) -> MfResult<Vec<RemoteFile>> {
        let raw = self.content_chunks(folderkey, "files").await?;
        raw.into_iter().map(from_value).collect()
    }

    async fn get_file_info(&self, quickkey: &str) -> MfResult<RemoteFile> {
        let response = self
            .call("file/get_info", vec![("quick_key", quickkey.to_string())])
            .await?;
        from_value(response["file_info"].clone())
    }

    async fn get_file_links(&self, quickkey: &str) -> MfResult<FileLinks> {
        let response = self
            .call("file/get_links", vec![("quick_key", quickkey.to_string())])
            .await?;
        let first = response["links"]
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| MfError::corrupt("links array empty"))?;
        from_value(first)
    }

    async fn get_updates(
        &self,
        quickkey: &str,
        source: u64,
        target: u64,
    ) -> MfResult<Vec<PatchInfo>> {
        let response = self
            .call(
                "device/get_updates",
                vec![
                    ("quick_key", quickkey.to_string()),
                    ("revision", source.to_string()),
                    ("target_revision", target.to_string()),
                ],
            )
            .await?;
        let mut patches: Vec<PatchInfo> = response["updates"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(from_value)
            .collect::<MfResult<_>>()?;
        patches.sort_by_key(|p| p.source_revision);
        Ok(patches)
    }

    async fn get_patch(&self, quickkey: &str, source: u64, target: u64) -> MfResult<PatchLink> {
        let response = self
            .call(
                "device/get_patch",
                vec![
                    ("quick_key", quickkey.to_string()),
                    ("source_revision", source.to_string()),
                    ("target_revision", target.to_string()),
                ],
            )
            .await?;
        from_value(response["patch"].clone())
    }

    async fn download(&self, url: &str, dest: &Path) -> MfResult<()> {
        let url = Url::parse(url)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        debug!(url = %url, dest = %dest.display(), "downloading");

        let response = self.http.get(url).send().await.map_err(map_reqwest_err)?;
        if !response.status().is_success() {
            return Err(MfError::Remote {
                code: response.status().as_u16() as i64,
                message: format!("download failed with HTTP {}", response.status()),
            });
        }

        let mut out = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_err)?;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        folderkey: Option<&str>,
        src: &Path,
        filename: &str,
    ) -> MfResult<String> {
        let body = Bytes::from(tokio::fs::read(src).await?);
        let hash = sha256_hex(&body);
        let size = body.len() as u64;
        let response = self
            .call_upload(
                "upload/simple",
                vec![
                    Self::folder_param(folderkey),
                    ("filehash", hash),
                    ("filesize", size.to_string()),
                ],
                filename,
                body,
            )
            .await?;
        response["doupload"]["key"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MfError::corrupt("upload key missing"))
    }

    async fn upload_instant(
        &self,
        folderkey: Option<&str>,
        filename: &str,
        hash: &str,
        size: u64,
    ) -> MfResult<()> {
        self.call(
            "upload/instant",
            vec![
                Self::folder_param(folderkey),
                ("filename", filename.to_string()),
                ("hash", hash.to_string()),
                ("size", size.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn upload_patch(
        &self,
        quickkey: &str,
        source_hash: &str,
        target_hash: &str,
        target_size: u64,
        patch: &Path,
    ) -> MfResult<String> {
        let body = Bytes::from(tokio::fs::read(patch).await?);
        let response = self
            .call_upload(
                "upload/patch",
                vec![
                    ("quick_key", quickkey.to_string()),
                    ("source_hash", source_hash.to_string()),
                    ("target_hash", target_hash.to_string()),
                    ("target_size", target_size.to_string()),
                ],
                quickkey,
                body,
            )
            .await?;
        response["doupload"]["key"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MfError::corrupt("upload key missing"))
    }

    async fn poll_upload(&self, upload_key: &str) -> MfResult<UploadStatus> {
        let response = self
            .call("upload/poll_upload", vec![("key", upload_key.to_string())])
            .await?;
        let doupload = &response["doupload"];
        Ok(UploadStatus {
            status: doupload.get("status").and_then(value_u64).unwrap_or(0) as u32,
            file_error: doupload.get("fileerror").and_then(value_u64).unwrap_or(0) as u32,
            quickkey: doupload
                .get("quickkey")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn check_hash(
        &self,
        folderkey: Option<&str>,
        filename: &str,
        hash: &str,
        size: u64,
    ) -> MfResult<HashCheck> {
        let response = self
            .call(
                "upload/check",
                vec![
                    Self::folder_param(folderkey),
                    ("filename", filename.to_string()),
                    ("hash", hash.to_string()),
                    ("size", size.to_string()),
                ],
            )
            .await?;
        Ok(HashCheck {
            hash_exists: value_yes(&response["hash_exists"]),
            in_account: value_yes(&response["in_account"]),
            file_exists: value_yes(&response["file_exists"]),
            different_hash: value_yes(&response["different_hash"]),
        })
    }

    async fn file_delete(&self, quickkey: &str) -> MfResult<()> {
        self.call("file/delete", vec![("quick_key", quickkey.to_string())])
            .await?;
        Ok(())
    }

    async fn folder_delete(&self, folderkey: &str) -> MfResult<()> {
        self.call("folder/delete", vec![("folder_key", folderkey.to_string())])
            .await?;
        Ok(())
    }

    async fn file_move(&self, quickkey: &str, folderkey: Option<&str>) -> MfResult<()> {
        self.call(
            "file/move",
            vec![
                ("quick_key", quickkey.to_string()),
                Self::folder_param(folderkey),
            ],
        )
        .await?;
        Ok(())
    }

    async fn folder_move(&self, folderkey: &str, dest: Option<&str>) -> MfResult<()> {
        self.call(
            "folder/move",
            vec![
                ("folder_key_src", folderkey.to_string()),
                ("folder_key_dst", dest.unwrap_or("").to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn file_rename(&self, quickkey: &str, name: &str) -> MfResult<()> {
        self.call(
            "file/update",
            vec![
                ("quick_key", quickkey.to_string()),
                ("filename", name.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn folder_rename(&self, folderkey: &str, name: &str) -> MfResult<()> {
        self.call(
            "folder/update",
            vec![
                ("folder_key", folderkey.to_string()),
                ("foldername", name.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn folder_create(&self, parent: Option<&str>, name: &str) -> MfResult<()> {
        self.call(
            "folder/create",
            vec![
                ("parent_key", parent.unwrap_or("").to_string()),
                ("foldername", name.to_string()),
            ],
        )
        .await?;
        Ok(())
    }
}
