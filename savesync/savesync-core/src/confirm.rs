//! Gate for operations that need the user's explicit consent.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationKind {
    /// Disconnecting wipes the local mirror.
    Disconnect,
    /// Connecting while the device holds articles never synced anywhere.
    ConnectWithLocalArticles,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationAction {
    Confirm,
    Cancel,
    KeepLocal,
    ReplaceWithServer,
}

impl ConfirmationAction {
    pub fn is_valid_for(self, kind: ConfirmationKind) -> bool {
        match kind {
            ConfirmationKind::Disconnect => {
                matches!(self, ConfirmationAction::Confirm | ConfirmationAction::Cancel)
            }
            ConfirmationKind::ConnectWithLocalArticles => matches!(
                self,
                ConfirmationAction::KeepLocal
                    | ConfirmationAction::ReplaceWithServer
                    | ConfirmationAction::Cancel
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub kind: ConfirmationKind,
    pub article_count: usize,
}

#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationAction;
}

/// Holds at most one handler. Without one, every request is cancelled.
#[derive(Clone, Default)]
pub struct ConfirmationGate {
    handler: Arc<RwLock<Option<Arc<dyn ConfirmationHandler>>>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered handler.
    pub fn register_handler(&self, handler: Arc<dyn ConfirmationHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn unregister_handler(&self) {
        *self.handler.write() = None;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    pub async fn request(&self, kind: ConfirmationKind, article_count: usize) -> ConfirmationAction {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            tracing::warn!("No confirmation handler registered, cancelling {:?}", kind);
            return ConfirmationAction::Cancel;
        };
        let action = handler
            .confirm(ConfirmationRequest {
                kind,
                article_count,
            })
            .await;
        if action.is_valid_for(kind) {
            action
        } else {
            tracing::warn!("Handler answered {:?} to {:?}, treating as cancel", action, kind);
            ConfirmationAction::Cancel
        }
    }
}

/// Answers every request the same way.
pub struct StaticConfirmations(pub ConfirmationAction);

#[async_trait]
impl ConfirmationHandler for StaticConfirmations {
    async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationAction {
        self.0
    }
}

pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    pub responder: oneshot::Sender<ConfirmationAction>,
}

impl PendingConfirmation {
    pub fn respond(self, action: ConfirmationAction) {
        let _ = self.responder.send(action);
    }
}

/// Forwards requests to whoever drains the paired receiver, typically a UI
/// task. Dropping the responder or the receiver resolves to cancel.
pub struct ChannelConfirmations {
    tx: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmations {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConfirmationHandler for ChannelConfirmations {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationAction {
        let (responder, rx) = oneshot::channel();
        if self
            .tx
            .send(PendingConfirmation { request, responder })
            .await
            .is_err()
        {
            return ConfirmationAction::Cancel;
        }
        rx.await.unwrap_or(ConfirmationAction::Cancel)
    }
}
