use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::PinState;

/// What caused a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UpdateSource {
    /// The sweep run when the engine starts.
    Initial,
    Timer,
    Edge { pin: u8 },
    Command { pin: u8 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StateUpdate {
    pub source: UpdateSource,
    pub states: BTreeMap<u8, PinState>,
    pub timestamp_ms: u64,
}

impl StateUpdate {
    pub fn new(source: UpdateSource, states: BTreeMap<u8, PinState>) -> Self {
        Self {
            source,
            states,
            timestamp_ms: epoch_millis(),
        }
    }
}

/// Invoked once after every sweep or confirmed write.
pub trait NotifyHook: Send + Sync {
    fn notify(&self, update: &StateUpdate);
}

impl<F> NotifyHook for F
where
    F: Fn(&StateUpdate) + Send + Sync,
{
    fn notify(&self, update: &StateUpdate) {
        self(update)
    }
}

/// Fans updates out to any number of subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<StateUpdate>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.tx.subscribe()
    }
}

impl NotifyHook for BroadcastNotifier {
    fn notify(&self, update: &StateUpdate) {
        // no subscribers is fine
        let _ = self.tx.send(update.clone());
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(4);
        let mut rx = notifier.subscribe();

        notifier.notify(&StateUpdate::new(UpdateSource::Timer, BTreeMap::new()));

        let update = rx.try_recv().unwrap();
        assert_eq!(update.source, UpdateSource::Timer);
    }

    #[test]
    fn notify_without_subscribers() {
        let notifier = BroadcastNotifier::new(0);
        notifier.notify(&StateUpdate::new(UpdateSource::Initial, BTreeMap::new()));
    }

    #[test]
    fn source_serializes_with_kind_tag() {
        let json = serde_json::to_value(UpdateSource::Edge { pin: 27 }).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "edge", "pin": 27 }));
    }
}
