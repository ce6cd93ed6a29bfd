//! Per-device article cache.
//!
//! Records are kept in memory and, for stores opened on a directory, written
//! through to one JSON file per article under `articles/`. Store-wide metadata
//! (schema version, full-sync watermark, removals not yet pushed) lives in
//! `store.json`. All writes go through a single async lock so that the file
//! on disk and the in-memory map never disagree about ordering.

use crate::article::{validate_slug, Article, ArticleState, ArticleStats, SlugError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex};
use walkdir::WalkDir;

pub const SCHEMA_VERSION: u32 = 2;
const META_FILE: &str = "store.json";
const ARTICLES_DIR: &str = "articles";
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store record is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid slug: {0}")]
    InvalidSlug(#[from] SlugError),
    #[error("store schema version {found} is newer than this build supports")]
    UnsupportedSchema { found: u32 },
}

/// Who caused a store mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeSource {
    /// User action or the ingestion pipeline.
    Local,
    /// Applied by the sync coordinator from remote data.
    Sync,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Put { slug: String, source: ChangeSource },
    Removed { slug: String, source: ChangeSource },
    Cleared,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSync {
    /// The stored article has local changes the remote has not seen.
    pub pending_push: bool,
    /// Set once the article has been confirmed present on the remote.
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalRecord {
    pub article: Article,
    #[serde(default)]
    pub sync: RecordSync,
    #[serde(default)]
    pub stats: Option<ArticleStats>,
}

impl LocalRecord {
    /// True for articles that originated here and never reached the remote.
    pub fn is_unsynced(&self) -> bool {
        self.sync.last_synced_at.is_none()
    }
}

/// Persisted record of the last completed full sync.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Watermark {
    pub has_completed_initial_sync: bool,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoreMeta {
    schema_version: u32,
    #[serde(default)]
    watermark: Watermark,
    #[serde(default)]
    pending_removals: BTreeSet<String>,
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            watermark: Watermark::default(),
            pending_removals: BTreeSet::new(),
        }
    }
}

struct State {
    records: BTreeMap<String, LocalRecord>,
    meta: StoreMeta,
}

pub struct ArticleStore {
    dir: Option<PathBuf>,
    state: RwLock<State>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl ArticleStore {
    /// Open (or create) a store rooted at `dir`, migrating older schemas.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let articles_dir = dir.join(ARTICLES_DIR);
        tokio::fs::create_dir_all(&articles_dir).await?;

        let meta_path = dir.join(META_FILE);
        let (mut meta, fresh) = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => (serde_json::from_slice::<StoreMeta>(&bytes)?, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (StoreMeta::default(), true),
            Err(e) => return Err(e.into()),
        };
        if meta.schema_version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: meta.schema_version,
            });
        }

        let legacy = !fresh && meta.schema_version < SCHEMA_VERSION;
        let mut records = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&articles_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let record = if legacy {
                // v1 stored bare manifests with no sync bookkeeping
                let article: Article = serde_json::from_slice(&bytes)?;
                LocalRecord {
                    article,
                    sync: RecordSync {
                        pending_push: true,
                        last_synced_at: None,
                    },
                    stats: None,
                }
            } else {
                match serde_json::from_slice::<LocalRecord>(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable record {}: {}", path.display(), e);
                        continue;
                    }
                }
            };
            if validate_slug(record.article.slug()).is_err() {
                tracing::warn!("Skipping record with invalid slug at {}", path.display());
                continue;
            }
            records.insert(record.article.slug().to_string(), record);
        }

        if legacy {
            tracing::info!(
                "Migrating article store from schema {} to {} ({} records)",
                meta.schema_version,
                SCHEMA_VERSION,
                records.len()
            );
            for record in records.values() {
                write_json(&record_path(&dir, record.article.slug()), record).await?;
            }
            meta.schema_version = SCHEMA_VERSION;
        }
        if legacy || fresh {
            write_json(&meta_path, &meta).await?;
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            dir: Some(dir),
            state: RwLock::new(State { records, meta }),
            write_lock: Mutex::new(()),
            events,
        })
    }

    /// A store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            dir: None,
            state: RwLock::new(State {
                records: BTreeMap::new(),
                meta: StoreMeta::default(),
            }),
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, slug: &str) -> Option<Article> {
        self.state.read().records.get(slug).map(|r| r.article.clone())
    }

    pub fn record(&self, slug: &str) -> Option<LocalRecord> {
        self.state.read().records.get(slug).cloned()
    }

    pub fn list(&self) -> Vec<Article> {
        self.state
            .read()
            .records
            .values()
            .map(|r| r.article.clone())
            .collect()
    }

    pub fn list_by_state(&self, state: ArticleState) -> Vec<Article> {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.article.state() == state)
            .map(|r| r.article.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    pub fn unsynced_count(&self) -> usize {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.is_unsynced())
            .count()
    }

    pub fn watermark(&self) -> Watermark {
        self.state.read().meta.watermark.clone()
    }

    /// Articles with local changes the remote has not seen.
    pub fn pending_pushes(&self) -> Vec<Article> {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.sync.pending_push)
            .map(|r| r.article.clone())
            .collect()
    }

    /// Slugs removed locally whose remote files still need deleting.
    pub fn pending_removals(&self) -> Vec<String> {
        self.state
            .read()
            .meta
            .pending_removals
            .iter()
            .cloned()
            .collect()
    }

    /// Insert or replace an article as a local mutation.
    pub async fn put(&self, article: Article) -> Result<(), StoreError> {
        self.put_inner(article, None, ChangeSource::Local).await
    }

    pub async fn put_with_stats(
        &self,
        article: Article,
        stats: ArticleStats,
    ) -> Result<(), StoreError> {
        self.put_inner(article, Some(stats), ChangeSource::Local)
            .await
    }

    /// Insert or replace an article with the remote's copy.
    pub async fn apply_remote(&self, article: Article) -> Result<(), StoreError> {
        self.put_inner(article, None, ChangeSource::Sync).await
    }

    async fn put_inner(
        &self,
        article: Article,
        stats: Option<ArticleStats>,
        source: ChangeSource,
    ) -> Result<(), StoreError> {
        validate_slug(article.slug())?;
        let _guard = self.write_lock.lock().await;
        let slug = article.slug().to_string();

        let previous = self.state.read().records.get(&slug).cloned();
        let sync = match source {
            ChangeSource::Local => RecordSync {
                pending_push: true,
                last_synced_at: previous.as_ref().and_then(|p| p.sync.last_synced_at),
            },
            ChangeSource::Sync => RecordSync {
                pending_push: false,
                last_synced_at: Some(Utc::now()),
            },
        };
        let record = LocalRecord {
            article,
            sync,
            stats: stats.or_else(|| previous.and_then(|p| p.stats)),
        };

        let mut meta = self.state.read().meta.clone();
        let had_removal = meta.pending_removals.remove(&slug);
        if let Some(dir) = &self.dir {
            write_json(&record_path(dir, &slug), &record).await?;
            if had_removal {
                write_json(&dir.join(META_FILE), &meta).await?;
            }
        }
        {
            let mut state = self.state.write();
            state.records.insert(slug.clone(), record);
            state.meta = meta;
        }
        let _ = self.events.send(StoreEvent::Put { slug, source });
        Ok(())
    }

    /// Remove an article as a local mutation. A removal of an article the
    /// remote already knows is remembered until it has been pushed.
    pub async fn remove(&self, slug: &str) -> Result<Option<Article>, StoreError> {
        self.remove_inner(slug, ChangeSource::Local).await
    }

    /// Remove an article because the remote no longer has it.
    pub async fn remove_synced(&self, slug: &str) -> Result<Option<Article>, StoreError> {
        self.remove_inner(slug, ChangeSource::Sync).await
    }

    async fn remove_inner(
        &self,
        slug: &str,
        source: ChangeSource,
    ) -> Result<Option<Article>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.state.read().records.get(slug).cloned() else {
            return Ok(None);
        };

        let mut meta = self.state.read().meta.clone();
        let meta_changed = match source {
            ChangeSource::Local if !previous.is_unsynced() => {
                meta.pending_removals.insert(slug.to_string())
            }
            _ => meta.pending_removals.remove(slug),
        };
        if let Some(dir) = &self.dir {
            remove_if_exists(&record_path(dir, slug)).await?;
            if meta_changed {
                write_json(&dir.join(META_FILE), &meta).await?;
            }
        }
        {
            let mut state = self.state.write();
            state.records.remove(slug);
            state.meta = meta;
        }
        let _ = self.events.send(StoreEvent::Removed {
            slug: slug.to_string(),
            source,
        });
        Ok(Some(previous.article))
    }

    /// Drop every record and every pending removal.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut meta = self.state.read().meta.clone();
        meta.pending_removals.clear();
        if let Some(dir) = &self.dir {
            let articles_dir = dir.join(ARTICLES_DIR);
            match tokio::fs::remove_dir_all(&articles_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tokio::fs::create_dir_all(&articles_dir).await?;
            write_json(&dir.join(META_FILE), &meta).await?;
        }
        {
            let mut state = self.state.write();
            state.records.clear();
            state.meta = meta;
        }
        let _ = self.events.send(StoreEvent::Cleared);
        Ok(())
    }

    /// Clear the pending flag, unless the article changed again since `pushed`
    /// was read.
    pub async fn mark_pushed(&self, pushed: &Article) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.state.read().records.get(pushed.slug()).cloned() else {
            return Ok(false);
        };
        if record.article != *pushed {
            return Ok(false);
        }
        record.sync = RecordSync {
            pending_push: false,
            last_synced_at: Some(Utc::now()),
        };
        if let Some(dir) = &self.dir {
            write_json(&record_path(dir, pushed.slug()), &record).await?;
        }
        self.state
            .write()
            .records
            .insert(pushed.slug().to_string(), record);
        Ok(true)
    }

    pub async fn mark_removal_pushed(&self, slug: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut meta = self.state.read().meta.clone();
        if !meta.pending_removals.remove(slug) {
            return Ok(());
        }
        self.persist_meta(&meta).await?;
        self.state.write().meta = meta;
        Ok(())
    }

    pub async fn record_full_sync(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_watermark(Watermark {
            has_completed_initial_sync: true,
            last_full_sync_at: Some(at),
        })
        .await
    }

    pub async fn reset_watermark(&self) -> Result<(), StoreError> {
        self.set_watermark(Watermark::default()).await
    }

    async fn set_watermark(&self, watermark: Watermark) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut meta = self.state.read().meta.clone();
        meta.watermark = watermark;
        self.persist_meta(&meta).await?;
        self.state.write().meta = meta;
        Ok(())
    }

    async fn persist_meta(&self, meta: &StoreMeta) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            write_json(&dir.join(META_FILE), meta).await?;
        }
        Ok(())
    }

    /// Bytes used on disk by this store, zero for in-memory stores.
    pub fn disk_usage(&self) -> u64 {
        let Some(dir) = &self.dir else {
            return 0;
        };
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

fn record_path(dir: &Path, slug: &str) -> PathBuf {
    dir.join(ARTICLES_DIR).join(format!("{slug}.json"))
}

/// Write through a temporary file so a crash never leaves half a record.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::IngestSource;
    use tempfile::TempDir;

    fn article(slug: &str) -> Article {
        Article::new(slug, slug.to_uppercase(), format!("https://example.com/{slug}"), IngestSource::Manual)
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_list_by_state() {
        let store = ArticleStore::in_memory();
        store.put(article("a")).await.unwrap();
        let mut b = article("b");
        b.set_state(ArticleState::Archived);
        store.put(b).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").unwrap().title, "A");
        assert_eq!(store.list_by_state(ArticleState::Archived).len(), 1);
        assert_eq!(store.list_by_state(ArticleState::Unread)[0].slug(), "a");
        assert_eq!(store.unsynced_count(), 2);
        assert_eq!(store.pending_pushes().len(), 2);
    }

    #[tokio::test]
    async fn events_carry_source() {
        let store = ArticleStore::in_memory();
        let mut rx = store.subscribe();
        store.put(article("a")).await.unwrap();
        store.apply_remote(article("b")).await.unwrap();
        store.remove("a").await.unwrap();
        store.clear().await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::Put { slug: "a".into(), source: ChangeSource::Local }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::Put { slug: "b".into(), source: ChangeSource::Sync }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::Removed { slug: "a".into(), source: ChangeSource::Local }
        );
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::Cleared);
    }

    #[tokio::test]
    async fn removing_unknown_slug_is_noop() {
        let store = ArticleStore::in_memory();
        let mut rx = store.subscribe();
        assert!(store.remove("missing").await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removal_of_synced_article_is_remembered() {
        let store = ArticleStore::in_memory();
        store.apply_remote(article("synced")).await.unwrap();
        store.put(article("local")).await.unwrap();

        store.remove("synced").await.unwrap();
        store.remove("local").await.unwrap();
        assert_eq!(store.pending_removals(), vec!["synced".to_string()]);

        store.mark_removal_pushed("synced").await.unwrap();
        assert!(store.pending_removals().is_empty());
    }

    #[tokio::test]
    async fn mark_pushed_ignores_stale_copy() {
        let store = ArticleStore::in_memory();
        let original = article("a");
        store.put(original.clone()).await.unwrap();

        let mut changed = original.clone();
        changed.set_state(ArticleState::Archived);
        store.put(changed.clone()).await.unwrap();

        assert!(!store.mark_pushed(&original).await.unwrap());
        assert!(store.record("a").unwrap().sync.pending_push);
        assert!(store.mark_pushed(&changed).await.unwrap());
        let record = store.record("a").unwrap();
        assert!(!record.sync.pending_push);
        assert!(!record.is_unsynced());
    }

    #[tokio::test]
    async fn local_edit_of_synced_article_stays_synced_origin() {
        let store = ArticleStore::in_memory();
        store.apply_remote(article("a")).await.unwrap();
        let mut a = store.get("a").unwrap();
        a.set_state(ArticleState::Archived);
        store.put(a).await.unwrap();
        let record = store.record("a").unwrap();
        assert!(record.sync.pending_push);
        assert!(!record.is_unsynced());
        assert_eq!(store.unsynced_count(), 0);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = ArticleStore::open(tmp.path()).await.unwrap();
            store
                .put_with_stats(article("a"), ArticleStats::estimate("some words here"))
                .await
                .unwrap();
            store.apply_remote(article("b")).await.unwrap();
            store.remove("b").await.unwrap();
            store.record_full_sync(Utc::now()).await.unwrap();
        }
        let store = ArticleStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.record("a").unwrap().stats.unwrap().read_time_minutes, 1);
        assert_eq!(store.pending_removals(), vec!["b".to_string()]);
        assert!(store.watermark().has_completed_initial_sync);
        assert!(store.disk_usage() > 0);
    }

    #[tokio::test]
    async fn clear_empties_disk_and_memory() {
        let tmp = TempDir::new().unwrap();
        let store = ArticleStore::open(tmp.path()).await.unwrap();
        store.put(article("a")).await.unwrap();
        store.put(article("b")).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty());
        drop(store);
        let store = ArticleStore::open(tmp.path()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn migrates_v1_layout() {
        let tmp = TempDir::new().unwrap();
        let articles = tmp.path().join(ARTICLES_DIR);
        std::fs::create_dir_all(&articles).unwrap();
        std::fs::write(
            tmp.path().join(META_FILE),
            serde_json::json!({ "schema_version": 1 }).to_string(),
        )
        .unwrap();
        std::fs::write(
            articles.join("old.json"),
            article("old").manifest_bytes().unwrap(),
        )
        .unwrap();

        let store = ArticleStore::open(tmp.path()).await.unwrap();
        let record = store.record("old").unwrap();
        assert!(record.sync.pending_push);
        assert!(record.is_unsynced());

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join(META_FILE)).unwrap()).unwrap();
        assert_eq!(meta["schema_version"], SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn rejects_newer_schema() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(META_FILE),
            serde_json::json!({ "schema_version": SCHEMA_VERSION + 1 }).to_string(),
        )
        .unwrap();
        assert!(matches!(
            ArticleStore::open(tmp.path()).await,
            Err(StoreError::UnsupportedSchema { .. })
        ));
    }
}
