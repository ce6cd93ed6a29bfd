pub mod article;
pub mod config;
pub mod confirm;
pub mod coordinator;
pub mod network;
pub mod progress;
pub mod remote;
pub mod store;

pub use article::{Article, ArticleState, ArticleStats, IngestSource};
pub use config::SyncConfig;
pub use confirm::{
    ChannelConfirmations, ConfirmationAction, ConfirmationGate, ConfirmationHandler,
    ConfirmationKind, ConfirmationRequest, StaticConfirmations,
};
pub use coordinator::{FlushReport, RebuildReport, SyncCoordinator, SyncError, SyncPhase};
pub use network::{Connectivity, NetworkPolicyGate, Preferences, SyncPolicy};
pub use progress::{ProgressPhase, ProgressPublisher, SyncProgress};
pub use remote::{RemoteArticleClient, RemoteError};
pub use store::{ArticleStore, StoreError};
