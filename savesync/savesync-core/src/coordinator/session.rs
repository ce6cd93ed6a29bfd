use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Disconnected,
    Connecting,
    Deciding,
    AwaitingConfirmation,
    FullRebuild,
    Incremental,
    Synced,
    Error,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Disconnected => "disconnected",
            SyncPhase::Connecting => "connecting",
            SyncPhase::Deciding => "deciding",
            SyncPhase::AwaitingConfirmation => "awaiting-confirmation",
            SyncPhase::FullRebuild => "full-rebuild",
            SyncPhase::Incremental => "incremental",
            SyncPhase::Synced => "synced",
            SyncPhase::Error => "error",
        }
    }

    /// Phases in which the remote holds a live session and the local store
    /// mirrors it.
    pub fn is_mirroring(&self) -> bool {
        matches!(
            self,
            SyncPhase::FullRebuild | SyncPhase::Incremental | SyncPhase::Synced
        )
    }

    pub fn can_connect(&self) -> bool {
        matches!(self, SyncPhase::Disconnected | SyncPhase::Error)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles owned by one connected session.
#[derive(Default)]
pub(crate) struct Session {
    pub address: Option<String>,
    pub shutdown: Option<watch::Sender<bool>>,
    pub event_loop: Option<JoinHandle<()>>,
}

impl Session {
    /// Take the event loop handles, leaving the session empty.
    pub fn take_loop(&mut self) -> (Option<watch::Sender<bool>>, Option<JoinHandle<()>>) {
        (self.shutdown.take(), self.event_loop.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirroring_phases() {
        assert!(SyncPhase::Synced.is_mirroring());
        assert!(SyncPhase::FullRebuild.is_mirroring());
        assert!(!SyncPhase::AwaitingConfirmation.is_mirroring());
        assert!(SyncPhase::Error.can_connect());
        assert!(!SyncPhase::Synced.can_connect());
        assert_eq!(SyncPhase::AwaitingConfirmation.to_string(), "awaiting-confirmation");
    }
}
