//! The sync state machine.
//!
//! A [`SyncCoordinator`] owns one remote session at a time. Connecting walks
//! `connecting -> deciding -> (awaiting-confirmation) -> full-rebuild |
//! incremental -> synced`; once synced a background event loop routes remote
//! change events into the local store and local store events out to the
//! remote. Every mutation of one slug, whichever side it comes from, runs
//! under that slug's lock.

mod locks;
mod session;

pub use session::SyncPhase;

use crate::article::{
    article_prefix, manifest_path, slug_from_manifest_path, slug_from_prefix_entry, Article,
    ArticleState, ArticleStats, MANIFEST_CONTENT_TYPE, SAVES_PREFIX,
};
use crate::confirm::{ConfirmationAction, ConfirmationGate, ConfirmationKind};
use crate::network::{NetworkPolicyGate, SyncPolicy};
use crate::progress::{ProgressPhase, ProgressPublisher, SyncProgress};
use crate::remote::{ChangeEvent, ChangeOrigin, RemoteArticleClient, RemoteError, RemoteEvent};
use crate::store::{ArticleStore, ChangeSource, StoreError, StoreEvent};
use bytes::Bytes;
use chrono::Utc;
use locks::SlugLocks;
use parking_lot::Mutex;
use session::Session;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("local store failed: {0}")]
    Store(Arc<StoreError>),
    #[error("not connected to remote storage")]
    NotConnected,
    #[error("cancelled")]
    Cancelled,
    #[error("cannot go from {from} to {to}")]
    InvalidTransition { from: SyncPhase, to: SyncPhase },
    #[error("no article with slug {0}")]
    UnknownArticle(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(Arc::new(e))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Store(Arc::new(StoreError::Serde(e)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildMode {
    /// Mirror the remote exactly, dropping synced local records it lacks.
    Full,
    /// Merge the remote into the local store, keeping local-only records.
    Incremental,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub remote_articles: usize,
    pub applied: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub pushed: usize,
    pub removed: usize,
    pub failed: usize,
    /// Left pending because the network policy is not active.
    pub deferred: usize,
}

struct Inner {
    store: Arc<ArticleStore>,
    remote: Arc<dyn RemoteArticleClient>,
    network: Arc<NetworkPolicyGate>,
    confirmations: ConfirmationGate,
    progress: ProgressPublisher,
    phase: watch::Sender<SyncPhase>,
    last_error: Mutex<Option<SyncError>>,
    session: Mutex<Session>,
    locks: SlugLocks,
    rebuild_lock: AsyncMutex<()>,
    cancel_rebuild: AtomicBool,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<ArticleStore>,
        remote: Arc<dyn RemoteArticleClient>,
        network: Arc<NetworkPolicyGate>,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Disconnected);
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                network,
                confirmations: ConfirmationGate::new(),
                progress: ProgressPublisher::new(),
                phase,
                last_error: Mutex::new(None),
                session: Mutex::new(Session::default()),
                locks: SlugLocks::new(),
                rebuild_lock: AsyncMutex::new(()),
                cancel_rebuild: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ArticleStore> {
        &self.inner.store
    }

    pub fn network(&self) -> &Arc<NetworkPolicyGate> {
        &self.inner.network
    }

    pub fn confirmations(&self) -> &ConfirmationGate {
        &self.inner.confirmations
    }

    pub fn progress(&self) -> &ProgressPublisher {
        &self.inner.progress
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.last_error.lock().clone()
    }

    pub fn address(&self) -> Option<String> {
        self.inner.session.lock().address.clone()
    }

    /// Connect to `address` and bring the local store in line with the
    /// remote. Returns once the coordinator is synced.
    pub async fn connect(&self, address: &str, token: &str) -> Result<(), SyncError> {
        let inner = &self.inner;
        inner.claim_connect()?;
        inner.cancel_rebuild.store(false, Ordering::SeqCst);
        *inner.last_error.lock() = None;

        // subscribed before connecting so nothing emitted in between is lost
        let remote_events = inner.remote.subscribe();
        if let Err(e) = inner.remote.connect(address, token).await {
            tracing::warn!("Connecting to {} failed: {}", address, e);
            return Err(inner.fail(e.into()).await);
        }
        inner.session.lock().address = Some(address.to_string());

        inner.set_phase(SyncPhase::Deciding);
        let mode = match inner.decide().await {
            Ok(mode) => mode,
            Err(_) if inner.cancel_rebuild.load(Ordering::SeqCst) => {
                return Err(SyncError::Cancelled)
            }
            Err(SyncError::Cancelled) => {
                inner.remote.disconnect().await;
                inner.session.lock().address = None;
                inner.set_phase(SyncPhase::Disconnected);
                return Err(SyncError::Cancelled);
            }
            Err(e) => return Err(inner.fail(e).await),
        };

        let report = match inner.rebuild(mode).await {
            Ok(report) => report,
            Err(_) if inner.cancel_rebuild.load(Ordering::SeqCst) => {
                return Err(SyncError::Cancelled)
            }
            Err(e) => return Err(inner.fail(e).await),
        };
        if inner.cancel_rebuild.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        let store_events = inner.store.subscribe();
        inner.finish_pass(&report).await;
        self.start_event_loop(remote_events, store_events);
        Ok(())
    }

    /// Leave the remote. When the local store mirrors the remote this wipes
    /// the mirror and therefore asks for confirmation first.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        let phase = self.phase();
        if phase.is_mirroring() && !inner.store.is_empty() {
            let action = inner
                .confirmations
                .request(ConfirmationKind::Disconnect, inner.store.len())
                .await;
            if action != ConfirmationAction::Confirm {
                tracing::info!("Disconnect cancelled");
                return Err(SyncError::Cancelled);
            }
            inner.teardown(true).await
        } else {
            inner.teardown(false).await
        }
    }

    /// Run an incremental pass over the whole remote while synced.
    pub async fn resync(&self) -> Result<RebuildReport, SyncError> {
        let from = self.phase();
        if from != SyncPhase::Synced {
            return Err(SyncError::InvalidTransition {
                from,
                to: SyncPhase::Incremental,
            });
        }
        let report = self.inner.rebuild(RebuildMode::Incremental).await?;
        self.inner.finish_pass(&report).await;
        Ok(report)
    }

    /// Push every pending local change now.
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        if !self.inner.remote.is_connected() {
            return Err(SyncError::NotConnected);
        }
        Ok(self.inner.flush().await)
    }

    pub async fn save_article(&self, article: Article) -> Result<(), SyncError> {
        self.save(article, None).await
    }

    pub async fn save_article_with_stats(
        &self,
        article: Article,
        stats: ArticleStats,
    ) -> Result<(), SyncError> {
        self.save(article, Some(stats)).await
    }

    pub async fn archive(&self, slug: &str) -> Result<Article, SyncError> {
        self.set_state(slug, ArticleState::Archived).await
    }

    pub async fn unarchive(&self, slug: &str) -> Result<Article, SyncError> {
        self.set_state(slug, ArticleState::Unread).await
    }

    /// Remove an article here and, once pushed, on every device.
    pub async fn delete(&self, slug: &str) -> Result<(), SyncError> {
        let inner = &self.inner;
        let _guard = inner.locks.lock(slug).await;
        if inner.store.remove(slug).await?.is_none() {
            return Err(SyncError::UnknownArticle(slug.to_string()));
        }
        if inner.pushes_allowed() && inner.store.pending_removals().iter().any(|s| s == slug) {
            inner.push_removal(slug).await?;
        }
        Ok(())
    }

    async fn save(&self, article: Article, stats: Option<ArticleStats>) -> Result<(), SyncError> {
        let inner = &self.inner;
        let _guard = inner.locks.lock(article.slug()).await;
        match stats {
            Some(stats) => inner.store.put_with_stats(article.clone(), stats).await?,
            None => inner.store.put(article.clone()).await?,
        }
        if inner.pushes_allowed() {
            inner.push_article(&article).await?;
        }
        Ok(())
    }

    async fn set_state(&self, slug: &str, state: ArticleState) -> Result<Article, SyncError> {
        let inner = &self.inner;
        let _guard = inner.locks.lock(slug).await;
        let mut article = inner
            .store
            .get(slug)
            .ok_or_else(|| SyncError::UnknownArticle(slug.to_string()))?;
        if !article.set_state(state) {
            return Ok(article);
        }
        inner.store.put(article.clone()).await?;
        if inner.pushes_allowed() {
            inner.push_article(&article).await?;
        }
        Ok(article)
    }

    fn start_event_loop(
        &self,
        remote_events: broadcast::Receiver<RemoteEvent>,
        store_events: broadcast::Receiver<StoreEvent>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = self.inner.network.subscribe();
        let handle = tokio::spawn(run_event_loop(
            Arc::downgrade(&self.inner),
            remote_events,
            store_events,
            policy,
            shutdown_rx,
        ));
        let mut session = self.inner.session.lock();
        session.shutdown = Some(shutdown_tx);
        if let Some(previous) = session.event_loop.replace(handle) {
            previous.abort();
        }
    }
}

impl Inner {
    fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, next: SyncPhase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            tracing::info!("Sync phase {} -> {}", previous, next);
        }
    }

    /// Move to `connecting` if the current phase allows it, in one step so
    /// concurrent callers cannot both get through.
    fn claim_connect(&self) -> Result<(), SyncError> {
        let mut from = SyncPhase::Disconnected;
        let claimed = self.phase.send_if_modified(|phase| {
            from = *phase;
            if !phase.can_connect() {
                return false;
            }
            *phase = SyncPhase::Connecting;
            true
        });
        if !claimed {
            return Err(SyncError::InvalidTransition {
                from,
                to: SyncPhase::Connecting,
            });
        }
        tracing::info!("Sync phase {} -> {}", from, SyncPhase::Connecting);
        Ok(())
    }

    fn pushes_allowed(&self) -> bool {
        self.phase() == SyncPhase::Synced && self.network.is_active()
    }

    /// Stop the session after an error and keep the error for `last_error`.
    async fn fail(&self, error: SyncError) -> SyncError {
        tracing::error!("Sync failed: {}", error);
        self.stop_event_loop().await;
        self.remote.disconnect().await;
        *self.last_error.lock() = Some(error.clone());
        self.progress
            .publish(SyncProgress::idle().with_message(error.to_string()));
        self.set_phase(SyncPhase::Error);
        error
    }

    async fn decide(&self) -> Result<RebuildMode, SyncError> {
        if self.store.is_empty() {
            return Ok(RebuildMode::Full);
        }
        if self.store.unsynced_count() > 0 {
            self.set_phase(SyncPhase::AwaitingConfirmation);
            let action = self
                .confirmations
                .request(ConfirmationKind::ConnectWithLocalArticles, self.store.len())
                .await;
            // teardown raises the flag before taking this lock
            let _rebuild = self.rebuild_lock.lock().await;
            if self.cancel_rebuild.load(Ordering::SeqCst) {
                tracing::info!("Session ended while awaiting confirmation, ignoring {:?}", action);
                return Err(SyncError::Cancelled);
            }
            return match action {
                ConfirmationAction::KeepLocal => Ok(RebuildMode::Incremental),
                ConfirmationAction::ReplaceWithServer => {
                    self.store.clear().await?;
                    self.store.reset_watermark().await?;
                    Ok(RebuildMode::Full)
                }
                _ => Err(SyncError::Cancelled),
            };
        }
        if self.store.watermark().has_completed_initial_sync {
            Ok(RebuildMode::Incremental)
        } else {
            Ok(RebuildMode::Full)
        }
    }

    async fn rebuild(&self, mode: RebuildMode) -> Result<RebuildReport, SyncError> {
        let _running = self.rebuild_lock.lock().await;
        let (phase, progress_phase) = match mode {
            RebuildMode::Full => (SyncPhase::FullRebuild, ProgressPhase::InitialSync),
            RebuildMode::Incremental => (SyncPhase::Incremental, ProgressPhase::Syncing),
        };
        self.set_phase(phase);

        let entries = self.remote.list_prefix(SAVES_PREFIX).await?;
        let slugs: Vec<String> = entries
            .iter()
            .filter_map(|e| slug_from_prefix_entry(e))
            .map(|s| s.to_string())
            .collect();
        let mut report = RebuildReport {
            remote_articles: slugs.len(),
            ..RebuildReport::default()
        };
        let mut progress = SyncProgress::started(progress_phase, slugs.len());
        self.progress.publish(progress.clone());
        tracing::info!("{:?} rebuild over {} remote articles", mode, slugs.len());

        let mut remote_slugs = HashSet::with_capacity(slugs.len());
        for slug in slugs {
            if self.cancel_rebuild.load(Ordering::SeqCst) {
                tracing::info!("Rebuild cancelled");
                return Err(SyncError::Cancelled);
            }
            remote_slugs.insert(slug.clone());
            match self.fetch_manifest(&slug).await {
                Ok(Some(article)) => {
                    let _guard = self.locks.lock(&slug).await;
                    if self.merge_remote(article, mode).await? {
                        report.applied += 1;
                    }
                }
                Ok(None) => {}
                Err(e @ (SyncError::Remote(RemoteError::Unauthorized)
                | SyncError::Remote(RemoteError::NotConnected))) => return Err(e),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", slug, e);
                    report.failed += 1;
                    progress.failed_articles += 1;
                }
            }
            progress.processed_articles += 1;
            self.progress.publish(progress.clone());
        }
        if self.cancel_rebuild.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        if mode == RebuildMode::Full {
            let stale: Vec<String> = self
                .store
                .list()
                .into_iter()
                .map(|a| a.slug().to_string())
                .filter(|s| !remote_slugs.contains(s))
                .collect();
            for slug in stale {
                let _guard = self.locks.lock(&slug).await;
                let Some(record) = self.store.record(&slug) else {
                    continue;
                };
                if !record.sync.pending_push && !record.is_unsynced() {
                    self.store.remove_synced(&slug).await?;
                    report.removed += 1;
                }
            }
            self.store.record_full_sync(Utc::now()).await?;
        }
        tracing::info!(
            "Rebuild finished: {} applied, {} removed, {} failed",
            report.applied,
            report.removed,
            report.failed
        );
        Ok(report)
    }

    /// Flush what accumulated during a pass and settle in `synced`.
    async fn finish_pass(&self, report: &RebuildReport) {
        self.set_phase(SyncPhase::Synced);
        if self.network.is_active() {
            let flushed = self.flush().await;
            if flushed.failed > 0 {
                tracing::warn!("{} pending changes could not be pushed", flushed.failed);
            }
        }
        self.progress
            .publish(SyncProgress::ready(report.remote_articles, report.failed));
    }

    async fn fetch_manifest(&self, slug: &str) -> Result<Option<Article>, SyncError> {
        let Some(file) = self.remote.read_file(&manifest_path(slug)).await? else {
            return Ok(None);
        };
        let article = Article::from_manifest(&file.data)
            .map_err(|e| RemoteError::Protocol(format!("bad manifest for {slug}: {e}")))?;
        if article.slug() != slug {
            return Err(RemoteError::Protocol(format!(
                "manifest under {slug} names {}",
                article.slug()
            ))
            .into());
        }
        Ok(Some(article))
    }

    /// Merge a remote manifest into the store. The caller holds the slug
    /// lock. Returns whether the store changed.
    async fn merge_remote(&self, article: Article, mode: RebuildMode) -> Result<bool, SyncError> {
        let slug = article.slug().to_string();
        if article.state() == ArticleState::Deleted {
            return self.remove_from_remote(&slug).await;
        }
        let Some(local) = self.store.record(&slug) else {
            self.store.apply_remote(article).await?;
            return Ok(true);
        };
        if local.article == article {
            if local.sync.pending_push {
                self.store.mark_pushed(&local.article).await?;
            }
            return Ok(false);
        }
        if local.sync.pending_push {
            tracing::debug!("Keeping pending local copy of {}", slug);
            return Ok(false);
        }
        let take_remote = match mode {
            RebuildMode::Full => true,
            RebuildMode::Incremental => article.updated_at > local.article.updated_at,
        };
        if take_remote {
            self.store.apply_remote(article).await?;
        }
        Ok(take_remote)
    }

    async fn remove_from_remote(&self, slug: &str) -> Result<bool, SyncError> {
        match self.store.record(slug) {
            Some(record) if !record.sync.pending_push => {
                self.store.remove_synced(slug).await?;
                Ok(true)
            }
            Some(_) => {
                tracing::debug!("Remote removed {} but a local change is pending", slug);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Write a manifest and clear its pending flag. The caller holds the
    /// slug lock.
    async fn push_article(&self, article: &Article) -> Result<(), SyncError> {
        let bytes = Bytes::from(article.manifest_bytes()?);
        self.remote
            .write_file(&article.manifest_path(), MANIFEST_CONTENT_TYPE, bytes)
            .await?;
        self.store.mark_pushed(article).await?;
        tracing::debug!("Pushed {}", article.slug());
        Ok(())
    }

    async fn push_removal(&self, slug: &str) -> Result<(), SyncError> {
        self.remote.remove_prefix(&article_prefix(slug)).await?;
        self.store.mark_removal_pushed(slug).await?;
        tracing::debug!("Removed {} remotely", slug);
        Ok(())
    }

    async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        if !self.network.is_active() {
            report.deferred =
                self.store.pending_pushes().len() + self.store.pending_removals().len();
            return report;
        }
        for article in self.store.pending_pushes() {
            let slug = article.slug().to_string();
            let _guard = self.locks.lock(&slug).await;
            let Some(record) = self.store.record(&slug) else {
                continue;
            };
            if !record.sync.pending_push {
                continue;
            }
            match self.push_article(&record.article).await {
                Ok(()) => report.pushed += 1,
                Err(e) => {
                    tracing::warn!("Pushing {} failed: {}", slug, e);
                    report.failed += 1;
                }
            }
        }
        for slug in self.store.pending_removals() {
            let _guard = self.locks.lock(&slug).await;
            if self.store.get(&slug).is_some() {
                continue;
            }
            match self.push_removal(&slug).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    tracing::warn!("Removing {} failed: {}", slug, e);
                    report.failed += 1;
                }
            }
        }
        if report.pushed + report.removed > 0 {
            tracing::info!("Flushed {} writes and {} removals", report.pushed, report.removed);
        }
        report
    }

    async fn stop_event_loop(&self) {
        let (shutdown, handle) = self.session.lock().take_loop();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn teardown(&self, clear: bool) -> Result<(), SyncError> {
        self.cancel_rebuild.store(true, Ordering::SeqCst);
        self.stop_event_loop().await;
        {
            // a running rebuild notices the flag before its next article
            let _rebuild = self.rebuild_lock.lock().await;
            if clear {
                self.store.clear().await?;
                self.store.reset_watermark().await?;
            }
        }
        self.remote.disconnect().await;
        self.session.lock().address = None;
        self.progress.publish(SyncProgress::idle());
        self.set_phase(SyncPhase::Disconnected);
        tracing::info!("Disconnected{}", if clear { ", local mirror cleared" } else { "" });
        Ok(())
    }

    async fn handle_remote_change(&self, change: ChangeEvent) -> Result<(), SyncError> {
        if change.origin == ChangeOrigin::Window {
            return Ok(());
        }
        let Some(slug) = slug_from_manifest_path(&change.path) else {
            return Ok(());
        };
        let _guard = self.locks.lock(slug).await;
        let Some(data) = change.new_value else {
            self.remove_from_remote(slug).await?;
            return Ok(());
        };
        let article = match Article::from_manifest(&data) {
            Ok(article) if article.slug() == slug => article,
            Ok(article) => {
                tracing::warn!("Ignoring manifest at {} naming {}", change.path, article.slug());
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable manifest at {}: {}", change.path, e);
                return Ok(());
            }
        };

        if change.origin == ChangeOrigin::Conflict {
            let local = self.store.get(slug);
            match local {
                Some(local) if local.updated_at > article.updated_at => {
                    tracing::info!("Conflict on {}: local copy is newer, pushing again", slug);
                    if self.network.is_active() {
                        self.push_article(&local).await?;
                    }
                }
                Some(local) if local == article => {
                    self.store.mark_pushed(&local).await?;
                }
                _ => {
                    tracing::info!("Conflict on {}: taking remote copy", slug);
                    self.store.apply_remote(article).await?;
                }
            }
            return Ok(());
        }
        self.merge_remote(article, RebuildMode::Incremental).await?;
        Ok(())
    }

    async fn handle_store_event(&self, event: StoreEvent) -> Result<(), SyncError> {
        if !self.pushes_allowed() {
            return Ok(());
        }
        match event {
            StoreEvent::Put {
                slug,
                source: ChangeSource::Local,
            } => {
                let _guard = self.locks.lock(&slug).await;
                if let Some(record) = self.store.record(&slug) {
                    if record.sync.pending_push {
                        self.push_article(&record.article).await?;
                    }
                }
            }
            StoreEvent::Removed {
                slug,
                source: ChangeSource::Local,
            } => {
                let _guard = self.locks.lock(&slug).await;
                let pending = self.store.pending_removals().iter().any(|s| *s == slug);
                if pending && self.store.get(&slug).is_none() {
                    self.push_removal(&slug).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Errors inside the event loop are logged; credentials being rejected
    /// ends the session.
    async fn report(&self, result: Result<(), SyncError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e @ SyncError::Remote(RemoteError::Unauthorized)) => {
                tracing::error!("Remote rejected the session: {}", e);
                *self.last_error.lock() = Some(e);
                self.remote.disconnect().await;
                self.set_phase(SyncPhase::Error);
                false
            }
            Err(e) => {
                tracing::warn!("Sync event failed: {}", e);
                true
            }
        }
    }
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut remote_events: broadcast::Receiver<RemoteEvent>,
    mut store_events: broadcast::Receiver<StoreEvent>,
    mut policy: watch::Receiver<SyncPolicy>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut policy_open = true;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = remote_events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                let keep_going = match event {
                    Ok(RemoteEvent::Change(change)) => {
                        let result = inner.handle_remote_change(change).await;
                        inner.report(result).await
                    }
                    Ok(RemoteEvent::Error(error)) => {
                        tracing::warn!("Remote reported an error: {}", error);
                        inner.report(Err(error.into())).await
                    }
                    Ok(RemoteEvent::Disconnected) => {
                        tracing::info!("Remote session ended");
                        inner.session.lock().address = None;
                        inner.set_phase(SyncPhase::Disconnected);
                        false
                    }
                    Ok(RemoteEvent::Connected) => true,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} remote events, resyncing", missed);
                        let result = match inner.rebuild(RebuildMode::Incremental).await {
                            Ok(report) => {
                                inner.finish_pass(&report).await;
                                Ok(())
                            }
                            Err(e) => Err(e),
                        };
                        inner.report(result).await
                    }
                    Err(broadcast::error::RecvError::Closed) => false,
                };
                if !keep_going {
                    break;
                }
            }
            event = store_events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                let keep_going = match event {
                    Ok(event) => {
                        let result = inner.handle_store_event(event).await;
                        inner.report(result).await
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Missed {} store events, flushing", missed);
                        inner.flush().await;
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => false,
                };
                if !keep_going {
                    break;
                }
            }
            changed = policy.changed(), if policy_open => {
                if changed.is_err() {
                    policy_open = false;
                    continue;
                }
                let active = *policy.borrow_and_update() == SyncPolicy::Active;
                let Some(inner) = inner.upgrade() else { break };
                if active && inner.phase() == SyncPhase::Synced {
                    tracing::info!("Sync policy active again, flushing pending changes");
                    inner.flush().await;
                }
            }
        }
    }
    tracing::debug!("Sync event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::IngestSource;
    use crate::confirm::StaticConfirmations;
    use crate::remote::memory::{MemoryBackend, MemoryRemote};

    fn article(slug: &str) -> Article {
        Article::new(slug, slug, format!("https://example.com/{slug}"), IngestSource::Manual)
            .unwrap()
    }

    fn coordinator(backend: &MemoryBackend) -> SyncCoordinator {
        SyncCoordinator::new(
            Arc::new(ArticleStore::in_memory()),
            Arc::new(MemoryRemote::new(backend.clone())),
            Arc::new(NetworkPolicyGate::default()),
        )
    }

    #[tokio::test]
    async fn connect_to_empty_remote_is_synced() {
        let backend = MemoryBackend::new();
        let sync = coordinator(&backend);
        sync.connect("user@example.com", "token").await.unwrap();
        assert_eq!(sync.phase(), SyncPhase::Synced);
        assert!(sync.store().watermark().has_completed_initial_sync);
        assert_eq!(sync.progress().current().phase, ProgressPhase::Ready);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let backend = MemoryBackend::new();
        let sync = coordinator(&backend);
        sync.connect("user@example.com", "token").await.unwrap();
        let err = sync.connect("user@example.com", "token").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { from: SyncPhase::Synced, .. }));
    }

    #[tokio::test]
    async fn rejected_credentials_end_in_error() {
        let backend = MemoryBackend::new().with_token("right");
        let sync = coordinator(&backend);
        let err = sync.connect("user@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Unauthorized)));
        assert_eq!(sync.phase(), SyncPhase::Error);
        assert!(sync.last_error().is_some());

        sync.connect("user@example.com", "right").await.unwrap();
        assert_eq!(sync.phase(), SyncPhase::Synced);
        assert!(sync.last_error().is_none());
    }

    #[tokio::test]
    async fn unsynced_local_articles_need_confirmation() {
        let backend = MemoryBackend::new();
        let sync = coordinator(&backend);
        sync.store().put(article("local")).await.unwrap();

        let err = sync.connect("user@example.com", "token").await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(sync.phase(), SyncPhase::Disconnected);
        assert_eq!(sync.store().len(), 1);

        sync.confirmations()
            .register_handler(Arc::new(StaticConfirmations(ConfirmationAction::KeepLocal)));
        sync.connect("user@example.com", "token").await.unwrap();
        assert!(backend.get(&manifest_path("local")).is_some());
        assert_eq!(sync.store().unsynced_count(), 0);
    }

    #[tokio::test]
    async fn redelivered_remote_change_changes_nothing() {
        let backend = MemoryBackend::new();
        let sync = coordinator(&backend);
        sync.connect("user@example.com", "token").await.unwrap();

        let change = ChangeEvent {
            path: manifest_path("incoming"),
            origin: ChangeOrigin::Remote,
            new_value: Some(Bytes::from(article("incoming").manifest_bytes().unwrap())),
        };
        sync.inner.handle_remote_change(change.clone()).await.unwrap();
        let first = sync.store().record("incoming").unwrap();
        let writes = backend.write_count();
        let mut store_events = sync.store().subscribe();

        sync.inner.handle_remote_change(change).await.unwrap();
        assert_eq!(sync.store().record("incoming").unwrap(), first);
        assert_eq!(backend.write_count(), writes);
        assert!(store_events.try_recv().is_err());
        assert!(sync.store().pending_pushes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_concurrent_connect_gets_through() {
        let backend = MemoryBackend::new();
        let sync = coordinator(&backend);
        let attempts = (0..8).map(|_| {
            let sync = sync.clone();
            tokio::spawn(async move { sync.connect("user@example.com", "token").await })
        });
        let mut succeeded = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            match attempt.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(SyncError::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(sync.phase(), SyncPhase::Synced);
    }

    #[tokio::test]
    async fn auth_error_event_ends_the_session() {
        let backend = MemoryBackend::new().with_token("token");
        let remote = Arc::new(MemoryRemote::new(backend.clone()));
        let sync = SyncCoordinator::new(
            Arc::new(ArticleStore::in_memory()),
            remote.clone(),
            Arc::new(NetworkPolicyGate::default()),
        );
        sync.connect("user@example.com", "token").await.unwrap();
        let mut phase = sync.watch_phase();

        backend.set_token(Some("rotated".to_string()));
        assert_eq!(remote.poll(), 0);
        phase.wait_for(|p| *p == SyncPhase::Error).await.unwrap();
        assert!(matches!(
            sync.last_error(),
            Some(SyncError::Remote(RemoteError::Unauthorized))
        ));
        assert!(!remote.is_connected());
    }

    #[tokio::test]
    async fn edits_are_pushed_while_synced() {
        let backend = MemoryBackend::new();
        let sync = coordinator(&backend);
        sync.connect("user@example.com", "token").await.unwrap();

        sync.save_article(article("a")).await.unwrap();
        sync.archive("a").await.unwrap();
        let remote = Article::from_manifest(&backend.get(&manifest_path("a")).unwrap()).unwrap();
        assert_eq!(remote.state(), ArticleState::Archived);

        sync.delete("a").await.unwrap();
        assert!(backend.get(&manifest_path("a")).is_none());
        assert!(sync.store().pending_removals().is_empty());
        assert!(matches!(
            sync.archive("a").await,
            Err(SyncError::UnknownArticle(_))
        ));
    }
}
