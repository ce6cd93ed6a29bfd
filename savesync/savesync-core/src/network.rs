//! Whether outbound sync traffic is allowed right now.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    Active,
    Paused,
    Disabled,
}

/// Wi-Fi-only applies only to installed (PWA) clients; a browser tab cannot
/// tell the connection type reliably.
pub fn evaluate(
    sync_enabled: bool,
    wifi_only: bool,
    is_pwa: bool,
    connection_is_wifi: bool,
) -> SyncPolicy {
    if !sync_enabled {
        SyncPolicy::Disabled
    } else if !is_pwa || !wifi_only || connection_is_wifi {
        SyncPolicy::Active
    } else {
        SyncPolicy::Paused
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub sync_enabled: bool,
    pub wifi_only: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            wifi_only: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    pub is_pwa: bool,
    pub is_wifi: bool,
}

struct Inputs {
    preferences: Preferences,
    connectivity: Connectivity,
}

pub struct NetworkPolicyGate {
    inputs: Mutex<Inputs>,
    tx: watch::Sender<SyncPolicy>,
}

impl NetworkPolicyGate {
    pub fn new(preferences: Preferences, connectivity: Connectivity) -> Self {
        let (tx, _) = watch::channel(policy_for(&preferences, &connectivity));
        Self {
            inputs: Mutex::new(Inputs {
                preferences,
                connectivity,
            }),
            tx,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        *self.tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.policy() == SyncPolicy::Active
    }

    pub fn preferences(&self) -> Preferences {
        self.inputs.lock().preferences
    }

    pub fn set_preferences(&self, preferences: Preferences) {
        let mut inputs = self.inputs.lock();
        inputs.preferences = preferences;
        self.recompute(&inputs);
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        let mut inputs = self.inputs.lock();
        inputs.connectivity = connectivity;
        self.recompute(&inputs);
    }

    /// Receivers observe only actual policy changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncPolicy> {
        self.tx.subscribe()
    }

    fn recompute(&self, inputs: &Inputs) {
        let next = policy_for(&inputs.preferences, &inputs.connectivity);
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!("Sync policy {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }
}

impl Default for NetworkPolicyGate {
    fn default() -> Self {
        Self::new(Preferences::default(), Connectivity::default())
    }
}

fn policy_for(preferences: &Preferences, connectivity: &Connectivity) -> SyncPolicy {
    evaluate(
        preferences.sync_enabled,
        preferences.wifi_only,
        connectivity.is_pwa,
        connectivity.is_wifi,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_truth_table() {
        assert_eq!(evaluate(false, true, true, true), SyncPolicy::Disabled);
        assert_eq!(evaluate(true, true, false, false), SyncPolicy::Active);
        assert_eq!(evaluate(true, false, true, false), SyncPolicy::Active);
        assert_eq!(evaluate(true, true, true, true), SyncPolicy::Active);
        assert_eq!(evaluate(true, true, true, false), SyncPolicy::Paused);
    }

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let gate = NetworkPolicyGate::new(
            Preferences {
                sync_enabled: true,
                wifi_only: true,
            },
            Connectivity {
                is_pwa: true,
                is_wifi: true,
            },
        );
        let mut rx = gate.subscribe();
        assert_eq!(*rx.borrow_and_update(), SyncPolicy::Active);

        gate.set_connectivity(Connectivity {
            is_pwa: true,
            is_wifi: true,
        });
        assert!(!rx.has_changed().unwrap());

        gate.set_connectivity(Connectivity {
            is_pwa: true,
            is_wifi: false,
        });
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SyncPolicy::Paused);

        gate.set_preferences(Preferences {
            sync_enabled: false,
            wifi_only: true,
        });
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SyncPolicy::Disabled);
        assert!(!gate.is_active());
    }
}
