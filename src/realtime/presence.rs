use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Best-effort online status, rebuilt from live connections after a restart.
///
/// The hub calls `set_online` when a participant's first connection registers
/// and `set_offline` when the last one closes; this type only remembers the
/// transitions.
#[derive(Default)]
pub struct PresenceTracker {
    online: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the participant was previously offline.
    pub async fn set_online(&self, participant_id: &str) -> bool {
        let mut online = self.online.write().await;
        if online.contains_key(participant_id) {
            return false;
        }
        online.insert(participant_id.to_string(), Utc::now());
        true
    }

    /// Returns true if the participant was previously online.
    pub async fn set_offline(&self, participant_id: &str) -> bool {
        self.online.write().await.remove(participant_id).is_some()
    }

    pub async fn is_online(&self, participant_id: &str) -> bool {
        self.online.read().await.contains_key(participant_id)
    }

    pub async fn online_count(&self) -> usize {
        self.online.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_reported_once() {
        let presence = PresenceTracker::new();
        assert!(presence.set_online("u1").await);
        assert!(!presence.set_online("u1").await);
        assert!(presence.is_online("u1").await);

        assert!(presence.set_offline("u1").await);
        assert!(!presence.set_offline("u1").await);
        assert!(!presence.is_online("u1").await);
        assert_eq!(presence.online_count().await, 0);
    }
}
