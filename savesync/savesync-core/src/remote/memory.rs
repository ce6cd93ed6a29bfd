//! In-process remote store.
//!
//! A [`MemoryBackend`] plays the part of one user's remote storage; every
//! [`MemoryRemote`] connected to it plays the part of one device. Devices only
//! learn about each other's writes when they [`poll`](MemoryRemote::poll), the
//! same way a remoteStorage client only learns about them from its poller.

use super::{
    split_parent, ChangeEvent, ChangeOrigin, RemoteArticleClient, RemoteError, RemoteEvent,
    RemoteFile, RemoteResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 512;

#[derive(Clone, Debug)]
struct StoredFile {
    content_type: String,
    data: Bytes,
    version: u64,
}

#[derive(Default)]
struct BackendState {
    files: BTreeMap<String, StoredFile>,
    next_version: u64,
    accepted_token: Option<String>,
    quota_bytes: Option<usize>,
    failing: HashSet<String>,
    writes: usize,
}

impl BackendState {
    fn used_bytes(&self) -> usize {
        self.files.values().map(|f| f.data.len()).sum()
    }
}

/// Shared storage behind one or more [`MemoryRemote`] clients.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections presenting `token`.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.inner.lock().accepted_token = Some(token.into());
        self
    }

    /// Change the accepted token. Clients holding another token get
    /// `Unauthorized` from then on, as they would once a grant is revoked.
    pub fn set_token(&self, token: Option<String>) {
        self.inner.lock().accepted_token = token;
    }

    pub fn set_quota(&self, bytes: Option<usize>) {
        self.inner.lock().quota_bytes = bytes;
    }

    /// Make every read and write of `path` fail with a transport error.
    pub fn fail_path(&self, path: impl Into<String>) {
        self.inner.lock().failing.insert(path.into());
    }

    pub fn heal_path(&self, path: &str) {
        self.inner.lock().failing.remove(path);
    }

    /// Number of successful writes and removals, across all clients.
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().files.keys().cloned().collect()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.inner.lock().files.get(path).map(|f| f.data.clone())
    }

    /// Write directly, as another device would, without notifying anyone.
    pub fn put_external(&self, path: &str, content_type: &str, data: impl Into<Bytes>) {
        let mut state = self.inner.lock();
        state.next_version += 1;
        let version = state.next_version;
        state.files.insert(
            path.to_string(),
            StoredFile {
                content_type: content_type.to_string(),
                data: data.into(),
                version,
            },
        );
    }

    pub fn remove_external(&self, path: &str) {
        self.inner.lock().files.remove(path);
    }

    fn versions(&self) -> HashMap<String, u64> {
        self.inner
            .lock()
            .files
            .iter()
            .map(|(p, f)| (p.clone(), f.version))
            .collect()
    }
}

/// One device's connection to a [`MemoryBackend`].
pub struct MemoryRemote {
    backend: MemoryBackend,
    connected: Mutex<bool>,
    token: Mutex<Option<String>>,
    /// Version of each path as last seen by this client.
    seen: Mutex<HashMap<String, u64>>,
    events: broadcast::Sender<RemoteEvent>,
}

impl MemoryRemote {
    pub fn new(backend: MemoryBackend) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            connected: Mutex::new(false),
            token: Mutex::new(None),
            seen: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn ensure_connected(&self) -> RemoteResult<()> {
        if !*self.connected.lock() {
            return Err(RemoteError::NotConnected);
        }
        if !self.authorized() {
            return Err(RemoteError::Unauthorized);
        }
        Ok(())
    }

    fn authorized(&self) -> bool {
        let accepted = self.backend.inner.lock().accepted_token.clone();
        match accepted {
            Some(accepted) => self.token.lock().as_deref() == Some(accepted.as_str()),
            None => true,
        }
    }

    fn emit(&self, path: &str, origin: ChangeOrigin, new_value: Option<Bytes>) {
        let _ = self.events.send(RemoteEvent::Change(ChangeEvent {
            path: path.to_string(),
            origin,
            new_value,
        }));
    }

    /// Compare the backend with what this client last saw and emit a
    /// `Remote` change for every divergence. Returns the number of events.
    pub fn poll(&self) -> usize {
        if !*self.connected.lock() {
            return 0;
        }
        if !self.authorized() {
            let _ = self.events.send(RemoteEvent::Error(RemoteError::Unauthorized));
            return 0;
        }
        let current = {
            let state = self.backend.inner.lock();
            state
                .files
                .iter()
                .map(|(p, f)| (p.clone(), (f.version, f.data.clone())))
                .collect::<BTreeMap<_, _>>()
        };
        let mut changes = Vec::new();
        {
            let mut seen = self.seen.lock();
            for (path, (version, data)) in &current {
                if seen.get(path) != Some(version) {
                    seen.insert(path.clone(), *version);
                    changes.push((path.clone(), Some(data.clone())));
                }
            }
            let vanished: Vec<String> = seen
                .keys()
                .filter(|p| !current.contains_key(*p))
                .cloned()
                .collect();
            for path in vanished {
                seen.remove(&path);
                changes.push((path, None));
            }
        }
        let count = changes.len();
        for (path, value) in changes {
            self.emit(&path, ChangeOrigin::Remote, value);
        }
        count
    }

    /// Detect a concurrent remote change to `path` since this client last saw
    /// it. On conflict, adopts the remote version and emits a conflict event.
    fn check_conflict(&self, path: &str) -> RemoteResult<()> {
        let remote = self
            .backend
            .inner
            .lock()
            .files
            .get(path)
            .map(|f| (f.version, f.data.clone()));
        let mut seen = self.seen.lock();
        let Some(seen_version) = seen.get(path).copied() else {
            return Ok(());
        };
        match remote {
            Some((version, _)) if version == seen_version => Ok(()),
            Some((version, data)) => {
                seen.insert(path.to_string(), version);
                drop(seen);
                self.emit(path, ChangeOrigin::Conflict, Some(data));
                Err(RemoteError::Conflict(path.to_string()))
            }
            None => {
                seen.remove(path);
                drop(seen);
                self.emit(path, ChangeOrigin::Conflict, None);
                Err(RemoteError::Conflict(path.to_string()))
            }
        }
    }
}

#[async_trait]
impl RemoteArticleClient for MemoryRemote {
    async fn connect(&self, _address: &str, token: &str) -> RemoteResult<()> {
        let accepted = self.backend.inner.lock().accepted_token.clone();
        if accepted.is_some_and(|t| t != token) {
            let _ = self
                .events
                .send(RemoteEvent::Error(RemoteError::Unauthorized));
            return Err(RemoteError::Unauthorized);
        }
        *self.token.lock() = Some(token.to_string());
        *self.seen.lock() = self.backend.versions();
        *self.connected.lock() = true;
        let _ = self.events.send(RemoteEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let was_connected = std::mem::replace(&mut *self.connected.lock(), false);
        self.seen.lock().clear();
        if was_connected {
            let _ = self.events.send(RemoteEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn read_file(&self, path: &str) -> RemoteResult<Option<RemoteFile>> {
        self.ensure_connected()?;
        let state = self.backend.inner.lock();
        if state.failing.contains(path) {
            return Err(RemoteError::Transport(format!("read of {path} failed")));
        }
        let file = state.files.get(path).cloned();
        drop(state);
        Ok(file.map(|f| {
            self.seen.lock().insert(path.to_string(), f.version);
            RemoteFile {
                content_type: f.content_type,
                data: f.data,
                etag: Some(f.version.to_string()),
            }
        }))
    }

    async fn write_file(&self, path: &str, content_type: &str, data: Bytes) -> RemoteResult<()> {
        self.ensure_connected()?;
        self.check_conflict(path)?;
        let version = {
            let mut state = self.backend.inner.lock();
            if state.failing.contains(path) {
                return Err(RemoteError::Transport(format!("write of {path} failed")));
            }
            if let Some(quota) = state.quota_bytes {
                let existing = state.files.get(path).map(|f| f.data.len()).unwrap_or(0);
                if state.used_bytes() - existing + data.len() > quota {
                    return Err(RemoteError::QuotaExceeded);
                }
            }
            state.next_version += 1;
            let version = state.next_version;
            state.files.insert(
                path.to_string(),
                StoredFile {
                    content_type: content_type.to_string(),
                    data: data.clone(),
                    version,
                },
            );
            state.writes += 1;
            version
        };
        self.seen.lock().insert(path.to_string(), version);
        self.emit(path, ChangeOrigin::Window, Some(data));
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> RemoteResult<()> {
        self.ensure_connected()?;
        let removed = {
            let mut state = self.backend.inner.lock();
            if state.failing.contains(path) {
                return Err(RemoteError::Transport(format!("delete of {path} failed")));
            }
            let removed = state.files.remove(path).is_some();
            if removed {
                state.writes += 1;
            }
            removed
        };
        self.seen.lock().remove(path);
        if removed {
            self.emit(path, ChangeOrigin::Window, None);
        }
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> RemoteResult<()> {
        self.ensure_connected()?;
        let paths: Vec<String> = self
            .backend
            .inner
            .lock()
            .files
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        for path in paths {
            self.remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> RemoteResult<Vec<String>> {
        self.ensure_connected()?;
        let state = self.backend.inner.lock();
        let mut children = BTreeSet::new();
        for path in state.files.keys() {
            let Some(rest) = path.strip_prefix(prefix) else {
                continue;
            };
            match rest.find('/') {
                Some(idx) => children.insert(format!("{prefix}{}", &rest[..=idx])),
                None => children.insert(path.clone()),
            };
        }
        debug_assert!(children.iter().all(|c| split_parent(c).0 == prefix));
        Ok(children.into_iter().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(backend: &MemoryBackend) -> MemoryRemote {
        let remote = MemoryRemote::new(backend.clone());
        remote.connect("user@example.com", "token").await.unwrap();
        remote
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let remote = MemoryRemote::new(MemoryBackend::new());
        assert!(matches!(
            remote.read_file("saves/a/article.json").await,
            Err(RemoteError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_token() {
        let backend = MemoryBackend::new().with_token("right");
        let remote = MemoryRemote::new(backend);
        let mut rx = remote.subscribe();
        assert!(matches!(
            remote.connect("me@example.com", "wrong").await,
            Err(RemoteError::Unauthorized)
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            RemoteEvent::Error(RemoteError::Unauthorized)
        );
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn lists_direct_children() {
        let backend = MemoryBackend::new();
        let remote = connected(&backend).await;
        for path in ["saves/a/article.json", "saves/a/index.html", "saves/b/article.json"] {
            remote
                .write_file(path, "text/plain", Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        assert_eq!(
            remote.list_prefix("saves/").await.unwrap(),
            vec!["saves/a/".to_string(), "saves/b/".to_string()]
        );
        assert_eq!(
            remote.list_prefix("saves/a/").await.unwrap(),
            vec!["saves/a/article.json".to_string(), "saves/a/index.html".to_string()]
        );

        remote.remove_prefix("saves/a/").await.unwrap();
        assert_eq!(backend.paths(), vec!["saves/b/article.json".to_string()]);
    }

    #[tokio::test]
    async fn own_writes_echo_as_window_and_poll_sees_others() {
        let backend = MemoryBackend::new();
        let device_a = connected(&backend).await;
        let device_b = connected(&backend).await;
        let mut rx_a = device_a.subscribe();
        let mut rx_b = device_b.subscribe();

        device_a
            .write_file("saves/x/article.json", "application/json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        match rx_a.recv().await.unwrap() {
            RemoteEvent::Change(c) => assert_eq!(c.origin, ChangeOrigin::Window),
            other => panic!("unexpected event {other:?}"),
        }

        assert_eq!(device_a.poll(), 0);
        assert_eq!(device_b.poll(), 1);
        match rx_b.recv().await.unwrap() {
            RemoteEvent::Change(c) => {
                assert_eq!(c.origin, ChangeOrigin::Remote);
                assert_eq!(c.path, "saves/x/article.json");
                assert!(c.new_value.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }

        device_a.remove_file("saves/x/article.json").await.unwrap();
        assert_eq!(device_b.poll(), 1);
        match rx_b.recv().await.unwrap() {
            RemoteEvent::Change(c) => assert!(c.new_value.is_none()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_write_conflicts() {
        let backend = MemoryBackend::new();
        let device_a = connected(&backend).await;
        let device_b = connected(&backend).await;
        let path = "saves/x/article.json";
        device_a
            .write_file(path, "application/json", Bytes::from_static(b"1"))
            .await
            .unwrap();
        device_b.poll();
        device_a
            .write_file(path, "application/json", Bytes::from_static(b"2"))
            .await
            .unwrap();

        let mut rx_b = device_b.subscribe();
        assert!(matches!(
            device_b
                .write_file(path, "application/json", Bytes::from_static(b"3"))
                .await,
            Err(RemoteError::Conflict(_))
        ));
        match rx_b.recv().await.unwrap() {
            RemoteEvent::Change(c) => {
                assert_eq!(c.origin, ChangeOrigin::Conflict);
                assert_eq!(c.new_value.as_deref(), Some(&b"2"[..]));
            }
            other => panic!("unexpected event {other:?}"),
        }
        // having adopted the remote version, a retry goes through
        device_b
            .write_file(path, "application/json", Bytes::from_static(b"3"))
            .await
            .unwrap();
        assert_eq!(backend.get(path).as_deref(), Some(&b"3"[..]));
    }

    #[tokio::test]
    async fn quota_and_injected_failures() {
        let backend = MemoryBackend::new();
        let remote = connected(&backend).await;
        backend.set_quota(Some(4));
        assert!(matches!(
            remote
                .write_file("saves/a/raw.html", "text/html", Bytes::from_static(b"too big"))
                .await,
            Err(RemoteError::QuotaExceeded)
        ));

        backend.set_quota(None);
        backend.fail_path("saves/a/article.json");
        assert!(matches!(
            remote.read_file("saves/a/article.json").await,
            Err(RemoteError::Transport(_))
        ));
        backend.heal_path("saves/a/article.json");
        assert!(remote.read_file("saves/a/article.json").await.unwrap().is_none());
    }
}
