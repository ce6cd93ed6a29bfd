//! Remote per-user file storage.
//!
//! The sync core talks to the remote through [`RemoteArticleClient`]. Which
//! implementation backs it is decided once at startup: [`memory::MemoryRemote`]
//! for tests and offline use, [`http::RemoteStorageClient`] for a real
//! remoteStorage server.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

#[cfg(feature = "http")]
pub mod http;
pub mod memory;

/// Which side produced a change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Echo of a write this client performed itself.
    Window,
    /// Detected by polling the remote.
    Remote,
    /// A conditional write lost against a concurrent remote change.
    Conflict,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
    pub origin: ChangeOrigin,
    /// The file's new contents, or `None` if it was removed.
    pub new_value: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteEvent {
    Connected,
    Disconnected,
    Error(RemoteError),
    Change(ChangeEvent),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub content_type: String,
    pub data: Bytes,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote is not connected")]
    NotConnected,
    #[error("remote rejected the credentials")]
    Unauthorized,
    #[error("remote storage quota exceeded")]
    QuotaExceeded,
    #[error("remote copy of {0} changed concurrently")]
    Conflict(String),
    #[error("could not discover storage for {0}")]
    Discovery(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Fatal errors are not worth retrying.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RemoteError::Transport(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[async_trait]
pub trait RemoteArticleClient: Send + Sync {
    /// Authenticate against `address` with an OAuth bearer `token`. Emits
    /// [`RemoteEvent::Connected`] or [`RemoteEvent::Error`].
    async fn connect(&self, address: &str, token: &str) -> RemoteResult<()>;

    /// Drop the credential and stop background polling. Emits
    /// [`RemoteEvent::Disconnected`].
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn read_file(&self, path: &str) -> RemoteResult<Option<RemoteFile>>;

    async fn write_file(&self, path: &str, content_type: &str, data: Bytes) -> RemoteResult<()>;

    async fn remove_file(&self, path: &str) -> RemoteResult<()>;

    /// Remove every file below `prefix` (which ends in `/`).
    async fn remove_prefix(&self, prefix: &str) -> RemoteResult<()>;

    /// Direct children of `prefix` as full paths; folders end in `/`.
    async fn list_prefix(&self, prefix: &str) -> RemoteResult<Vec<String>>;

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent>;
}

/// Split a path into its parent folder and name, keeping the trailing `/` on
/// folder names: `a/b/c` -> (`a/b/`, `c`), `a/b/` -> (`a/`, `b/`).
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_keeps_folder_suffix() {
        assert_eq!(split_parent("saves/a/article.json"), ("saves/a/", "article.json"));
        assert_eq!(split_parent("saves/a/"), ("saves/", "a/"));
        assert_eq!(split_parent("saves/"), ("", "saves/"));
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(!RemoteError::Transport("reset".into()).is_fatal());
        assert!(RemoteError::QuotaExceeded.is_fatal());
        assert!(RemoteError::Unauthorized.is_fatal());
    }
}
