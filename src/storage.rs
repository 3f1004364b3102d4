// ===============================
// src/storage.rs
// ===============================
//
// Durable object store collaborators for promoted artifacts:
// - LocalDirStore  : copies into an archive directory (mounted volume).
// - HttpObjectStore: `PUT <base>/<key>` with an optional bearer token.
// Keys are `<account>/<market>/<file name>`.
//
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StoreError;
use crate::layout::sanitize;

pub fn object_key(account: &str, market: &str, file: &Path) -> String {
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("artifact");
    format!("{}/{}/{}", account, sanitize(market), name)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, file: &Path) -> Result<(), StoreError>;

    fn backend_type(&self) -> &'static str;
}

pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> Self { Self { root } }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn put(&self, key: &str, file: &Path) -> Result<(), StoreError> {
        let target = self.root.join(key);
        let upload_err = |e: std::io::Error| StoreError::Upload { key: key.to_string(), reason: e.to_string() };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        let mut tmp = target.as_os_str().to_owned();
        tmp.push(".part");
        tokio::fs::copy(file, &tmp).await.map_err(upload_err)?;
        tokio::fs::rename(&tmp, &target).await.map_err(upload_err)?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str { "local-dir" }
}

pub struct HttpObjectStore {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(http: reqwest::Client, base: String, token: Option<String>) -> Self {
        Self { http, base: base.trim_end_matches('/').to_string(), token }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, file: &Path) -> Result<(), StoreError> {
        let body = tokio::fs::read(file).await?;
        let mut req = self
            .http
            .put(format!("{}/{}", self.base, key))
            .timeout(Duration::from_secs(60))
            .header("Content-Type", content_type(file))
            .body(body);
        if let Some(t) = &self.token {
            req = req.bearer_auth(t);
        }
        let rsp = req
            .send()
            .await
            .map_err(|e| StoreError::Upload { key: key.to_string(), reason: e.to_string() })?;
        if !rsp.status().is_success() {
            return Err(StoreError::Upload { key: key.to_string(), reason: format!("status {}", rsp.status()) });
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str { "http" }
}

fn content_type(file: &Path) -> &'static str {
    match file.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => "application/x-ndjson",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
