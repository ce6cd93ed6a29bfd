//! remoteStorage client over HTTP.
//!
//! Addresses of the form `user@host` are resolved through WebFinger; anything
//! starting with `http://` or `https://` is used as the storage root directly.
//! Every request carries the OAuth bearer token. Documents are tracked by
//! ETag so writes can be made conditional, and a background task polls the
//! `saves/` tree to notice changes made by other devices.

use super::{
    ChangeEvent, ChangeOrigin, RemoteArticleClient, RemoteError, RemoteEvent, RemoteFile,
    RemoteResult,
};
use crate::article::{MANIFEST_FILE, SAVES_PREFIX};
use crate::config::SyncConfig;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const REMOTESTORAGE_RELS: &[&str] = &[
    "http://tools.ietf.org/id/draft-dejong-remotestorage",
    "remotestorage",
];
const EVENT_CAPACITY: usize = 512;

#[derive(Clone, Debug)]
pub struct HttpRemoteConfig {
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpRemoteConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for HttpRemoteConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[derive(Clone)]
struct Connection {
    storage_root: String,
    token: String,
}

#[derive(Deserialize)]
struct WebFinger {
    #[serde(default)]
    links: Vec<WebFingerLink>,
}

#[derive(Deserialize)]
struct WebFingerLink {
    rel: String,
    href: Option<String>,
}

#[derive(Deserialize, Default)]
struct FolderListing {
    #[serde(default)]
    items: HashMap<String, ListingItem>,
}

#[derive(Deserialize)]
struct ListingItem {
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

struct Shared {
    http: reqwest::Client,
    config: HttpRemoteConfig,
    connection: RwLock<Option<Connection>>,
    /// Last known ETag per document path.
    etags: Mutex<HashMap<String, String>>,
    /// Last known ETag per article folder (`saves/<slug>/`).
    folder_etags: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<RemoteEvent>,
}

pub struct RemoteStorageClient {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStorageClient {
    pub fn new(config: HttpRemoteConfig) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                http,
                config,
                connection: RwLock::new(None),
                etags: Mutex::new(HashMap::new()),
                folder_etags: Mutex::new(HashMap::new()),
                events,
            }),
            poller: Mutex::new(None),
        })
    }

    /// Run one poll pass immediately instead of waiting for the poller.
    pub async fn poll_now(&self) -> RemoteResult<usize> {
        self.shared.poll().await
    }

    /// Resolve `user@host` through WebFinger to a storage root URL.
    async fn discover(&self, address: &str) -> RemoteResult<String> {
        if address.starts_with("http://") || address.starts_with("https://") {
            return Ok(address.trim_end_matches('/').to_string());
        }
        let (_, host) = address
            .split_once('@')
            .ok_or_else(|| RemoteError::Discovery(address.to_string()))?;
        let url = format!("https://{host}/.well-known/webfinger");
        let resource = format!("acct:{address}");
        let response = self
            .shared
            .http
            .get(&url)
            .query(&[("resource", resource.as_str())])
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RemoteError::Discovery(address.to_string()));
        }
        let finger: WebFinger = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        finger
            .links
            .into_iter()
            .find(|l| REMOTESTORAGE_RELS.contains(&l.rel.as_str()))
            .and_then(|l| l.href)
            .map(|href| href.trim_end_matches('/').to_string())
            .ok_or_else(|| RemoteError::Discovery(address.to_string()))
    }

    fn emit_error(&self, error: &RemoteError) {
        let _ = self.shared.events.send(RemoteEvent::Error(error.clone()));
    }
}

impl Shared {
    fn connection(&self) -> RemoteResult<Connection> {
        self.connection
            .read()
            .clone()
            .ok_or(RemoteError::NotConnected)
    }

    fn emit(&self, path: &str, origin: ChangeOrigin, new_value: Option<Bytes>) {
        let _ = self.events.send(RemoteEvent::Change(ChangeEvent {
            path: path.to_string(),
            origin,
            new_value,
        }));
    }

    /// Send a request, retrying transport failures and 5xx responses with
    /// exponential backoff. Auth and quota responses are mapped to errors.
    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: header::HeaderMap,
        body: Option<Bytes>,
    ) -> RemoteResult<reqwest::Response> {
        let conn = self.connection()?;
        let url = format!("{}/{}", conn.storage_root, path);
        let mut attempt = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&conn.token)
                .headers(headers.clone());
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            let outcome = match request.send().await {
                Ok(response) => match response.status() {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        return Err(RemoteError::Unauthorized)
                    }
                    StatusCode::INSUFFICIENT_STORAGE => return Err(RemoteError::QuotaExceeded),
                    s if s.is_server_error() => {
                        Err(RemoteError::Transport(format!("{method} {path}: {s}")))
                    }
                    _ => Ok(response),
                },
                Err(e) => Err(RemoteError::Transport(e.to_string())),
            };
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::debug!("Retrying {} {} in {:?}: {}", method, path, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get(&self, path: &str) -> RemoteResult<Option<RemoteFile>> {
        let response = self
            .send(Method::GET, path, header::HeaderMap::new(), None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            self.etags.lock().remove(path);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RemoteError::Protocol(format!(
                "GET {path} returned {}",
                response.status()
            )));
        }
        let content_type = header_string(&response, header::CONTENT_TYPE)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let etag = header_string(&response, header::ETAG);
        let data = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if let Some(etag) = &etag {
            self.etags.lock().insert(path.to_string(), etag.clone());
        }
        Ok(Some(RemoteFile {
            content_type,
            data,
            etag,
        }))
    }

    async fn list(&self, folder: &str) -> RemoteResult<FolderListing> {
        let response = self
            .send(Method::GET, folder, header::HeaderMap::new(), None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(FolderListing::default());
        }
        if !response.status().is_success() {
            return Err(RemoteError::Protocol(format!(
                "GET {folder} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(format!("bad listing for {folder}: {e}")))
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        let response = self
            .send(Method::DELETE, path, header::HeaderMap::new(), None)
            .await?;
        self.etags.lock().remove(path);
        if let Some(folder) = article_folder(path) {
            self.folder_etags.lock().remove(folder);
        }
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(RemoteError::Protocol(format!("DELETE {path} returned {s}"))),
        }
    }

    async fn poll(&self) -> RemoteResult<usize> {
        self.scan(true).await
    }

    /// Walk `saves/` and find manifests that changed or vanished since the
    /// last pass. With `report` unset only the ETags are recorded.
    async fn scan(&self, report: bool) -> RemoteResult<usize> {
        let listing = self.list(SAVES_PREFIX).await?;
        let mut events = 0;
        let mut seen_folders = Vec::with_capacity(listing.items.len());

        for (name, item) in listing.items {
            let Some(slug) = name.strip_suffix('/') else {
                continue;
            };
            let folder = format!("{SAVES_PREFIX}{slug}/");
            seen_folders.push(folder.clone());
            let unchanged = matches!(
                (&item.etag, self.folder_etags.lock().get(&folder)),
                (Some(new), Some(old)) if new == old
            );
            if unchanged {
                continue;
            }

            let manifest = format!("{folder}{MANIFEST_FILE}");
            let known = self.etags.lock().get(&manifest).cloned();
            match self.get(&manifest).await {
                Ok(Some(file)) => {
                    if report && (file.etag.is_none() || file.etag != known) {
                        self.emit(&manifest, ChangeOrigin::Remote, Some(file.data));
                        events += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Polling {} failed: {}", manifest, e);
                    continue;
                }
            }
            if let Some(etag) = item.etag {
                self.folder_etags.lock().insert(folder, etag);
            }
        }

        let vanished: Vec<String> = self
            .folder_etags
            .lock()
            .keys()
            .filter(|f| !seen_folders.contains(f))
            .cloned()
            .collect();
        for folder in vanished {
            self.folder_etags.lock().remove(&folder);
            let manifest = format!("{folder}{MANIFEST_FILE}");
            if self.etags.lock().remove(&manifest).is_some() && report {
                self.emit(&manifest, ChangeOrigin::Remote, None);
                events += 1;
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl RemoteArticleClient for RemoteStorageClient {
    async fn connect(&self, address: &str, token: &str) -> RemoteResult<()> {
        let storage_root = match self.discover(address).await {
            Ok(root) => root,
            Err(e) => {
                self.emit_error(&e);
                return Err(e);
            }
        };
        *self.shared.connection.write() = Some(Connection {
            storage_root,
            token: token.to_string(),
        });

        // the first listing doubles as a credential check and seeds the
        // poller's view so only later changes are reported
        if let Err(e) = self.shared.scan(false).await {
            *self.shared.connection.write() = None;
            self.emit_error(&e);
            return Err(e);
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.poll_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if shared.connection.read().is_none() {
                    break;
                }
                match shared.poll().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Poll found {} remote changes", n),
                    Err(RemoteError::NotConnected) => break,
                    Err(e) => {
                        tracing::warn!("Remote poll failed: {}", e);
                        let _ = shared.events.send(RemoteEvent::Error(e));
                    }
                }
            }
        });
        if let Some(previous) = self.poller.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!("Connected to remote storage for {}", address);
        let _ = self.shared.events.send(RemoteEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        let was_connected = self.shared.connection.write().take().is_some();
        self.shared.etags.lock().clear();
        self.shared.folder_etags.lock().clear();
        if was_connected {
            let _ = self.shared.events.send(RemoteEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connection.read().is_some()
    }

    async fn read_file(&self, path: &str) -> RemoteResult<Option<RemoteFile>> {
        self.shared.get(path).await
    }

    async fn write_file(&self, path: &str, content_type: &str, data: Bytes) -> RemoteResult<()> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_str(content_type)
                .map_err(|e| RemoteError::Protocol(e.to_string()))?,
        );
        if let Some(etag) = self.shared.etags.lock().get(path) {
            if let Ok(value) = header::HeaderValue::from_str(etag) {
                headers.insert(header::IF_MATCH, value);
            }
        }

        let response = self
            .shared
            .send(Method::PUT, path, headers, Some(data.clone()))
            .await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED => {
                tracing::info!("Write to {} lost against a concurrent change", path);
                let current = self.shared.get(path).await?;
                self.shared
                    .emit(path, ChangeOrigin::Conflict, current.map(|f| f.data));
                Err(RemoteError::Conflict(path.to_string()))
            }
            s if s.is_success() => {
                if let Some(etag) = header_string(&response, header::ETAG) {
                    self.shared.etags.lock().insert(path.to_string(), etag);
                }
                if let Some(folder) = article_folder(path) {
                    self.shared.folder_etags.lock().remove(folder);
                }
                self.shared.emit(path, ChangeOrigin::Window, Some(data));
                Ok(())
            }
            s => Err(RemoteError::Protocol(format!("PUT {path} returned {s}"))),
        }
    }

    async fn remove_file(&self, path: &str) -> RemoteResult<()> {
        self.shared.delete(path).await?;
        self.shared.emit(path, ChangeOrigin::Window, None);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> RemoteResult<()> {
        // remoteStorage has no recursive delete; walk the tree instead
        let mut folders = vec![prefix.to_string()];
        while let Some(folder) = folders.pop() {
            for child in self.list_prefix(&folder).await? {
                if child.ends_with('/') {
                    folders.push(child);
                } else {
                    self.remove_file(&child).await?;
                }
            }
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> RemoteResult<Vec<String>> {
        let listing = self.shared.list(prefix).await?;
        let mut children: Vec<String> = listing
            .items
            .into_keys()
            .map(|name| format!("{prefix}{name}"))
            .collect();
        children.sort();
        Ok(children)
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for RemoteStorageClient {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

fn header_string(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `saves/<slug>/...` -> `saves/<slug>/`
fn article_folder(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(SAVES_PREFIX)?;
    let idx = rest.find('/')?;
    Some(&path[..SAVES_PREFIX.len() + idx + 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_folder_of_paths() {
        assert_eq!(article_folder("saves/abc/article.json"), Some("saves/abc/"));
        assert_eq!(article_folder("saves/abc/"), Some("saves/abc/"));
        assert_eq!(article_folder("other/abc"), None);
        assert_eq!(article_folder("saves/abc"), None);
    }

    #[test]
    fn listing_parses_items() {
        let listing: FolderListing = serde_json::from_str(
            r#"{
                "@context": "http://remotestorage.io/spec/folder-description",
                "items": {
                    "a/": { "ETag": "1" },
                    "article.json": { "ETag": "2", "Content-Type": "application/json", "Content-Length": 10 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(listing.items.len(), 2);
        assert_eq!(listing.items["a/"].etag.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn direct_url_skips_webfinger() {
        let client = RemoteStorageClient::new(HttpRemoteConfig::default()).unwrap();
        assert_eq!(
            client.discover("https://storage.example.com/alice/").await.unwrap(),
            "https://storage.example.com/alice"
        );
        assert!(matches!(
            client.discover("no-at-sign").await,
            Err(RemoteError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let client = RemoteStorageClient::new(HttpRemoteConfig::default()).unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.read_file("saves/a/article.json").await,
            Err(RemoteError::NotConnected)
        ));
    }
}
