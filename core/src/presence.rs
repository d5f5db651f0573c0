/// Presence tracking: last-seen heartbeat, typing flags, derived status
use crate::clock::Clock;
use crate::types::ChatEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Status as reported by the transport's own presence API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeStatus {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// The one status rule. Native online wins, then a fresh heartbeat, else offline.
pub fn derive_status(
    native: NativeStatus,
    last_seen_at_millis: Option<u64>,
    now_millis: u64,
    online_window: Duration,
) -> PresenceStatus {
    if native == NativeStatus::Online {
        return PresenceStatus::Online;
    }
    let window = u64::try_from(online_window.as_millis()).unwrap_or(u64::MAX);
    match last_seen_at_millis {
        Some(seen) if now_millis.saturating_sub(seen) < window => PresenceStatus::Online,
        _ => PresenceStatus::Offline,
    }
}

/// Read-only view of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub peer_id: String,
    pub last_seen_at_millis: Option<u64>,
    pub is_typing: bool,
    pub status: Option<PresenceStatus>,
}

#[derive(Debug, Clone, Default)]
struct PeerState {
    last_seen_at_millis: Option<u64>,
    /// Time of the latest typing signal still in effect
    typing_since: Option<u64>,
    /// One reset deadline per typing signal, each independent
    typing_resets: Vec<u64>,
    /// Latest native report, `None` until the first evaluation
    native: Option<NativeStatus>,
    /// Last status announced to subscribers
    reported: Option<PresenceStatus>,
}

impl PeerState {
    fn status(&self, now: u64, online_window: Duration) -> Option<PresenceStatus> {
        self.native
            .map(|native| derive_status(native, self.last_seen_at_millis, now, online_window))
    }

    fn is_typing(&self, now: u64) -> bool {
        self.typing_since.is_some() && self.typing_resets.iter().all(|&d| d > now)
    }

    /// Fire every reset whose deadline has passed
    fn settle(&mut self, now: u64) {
        if self.typing_resets.iter().any(|&d| d <= now) {
            self.typing_since = None;
            self.typing_resets.retain(|&d| d > now);
        }
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    peers: Arc<RwLock<HashMap<String, PeerState>>>,
    clock: Arc<dyn Clock>,
    typing_window: Duration,
    online_window: Duration,
    events: broadcast::Sender<ChatEvent>,
}

impl PresenceTracker {
    pub fn new(
        clock: Arc<dyn Clock>,
        typing_window: Duration,
        online_window: Duration,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            clock,
            typing_window,
            online_window,
            events,
        }
    }

    fn changed(&self, peer_id: &str) {
        let _ = self.events.send(ChatEvent::PresenceChanged {
            peer_id: peer_id.to_string(),
        });
    }

    /// Any sign of life from the peer
    pub async fn touch(&self, peer_id: &str) {
        let now = self.clock.now_millis();
        self.peers
            .write()
            .await
            .entry(peer_id.to_string())
            .or_default()
            .last_seen_at_millis = Some(now);
        self.changed(peer_id);
    }

    /// Mark the peer typing. Returns when this signal's reset is due.
    pub async fn set_typing(&self, peer_id: &str) -> Duration {
        let now = self.clock.now_millis();
        let window = u64::try_from(self.typing_window.as_millis()).unwrap_or(u64::MAX);
        {
            let mut peers = self.peers.write().await;
            let state = peers.entry(peer_id.to_string()).or_default();
            state.settle(now);
            state.typing_since = Some(now);
            state.typing_resets.push(now.saturating_add(window));
        }
        self.changed(peer_id);
        self.typing_window
    }

    /// Apply due typing resets. Returns true when the flag flipped to false.
    pub async fn expire_typing(&self, peer_id: &str) -> bool {
        let now = self.clock.now_millis();
        let flipped = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(peer_id) {
                Some(state) => {
                    let was = state.typing_since.is_some();
                    state.settle(now);
                    was && state.typing_since.is_none()
                }
                None => false,
            }
        };
        if flipped {
            self.changed(peer_id);
        }
        flipped
    }

    pub async fn is_typing(&self, peer_id: &str) -> bool {
        let now = self.clock.now_millis();
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|s| s.is_typing(now))
            .unwrap_or(false)
    }

    pub async fn last_seen(&self, peer_id: &str) -> Option<u64> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .and_then(|s| s.last_seen_at_millis)
    }

    /// Record a native report and combine it with the heartbeat fallback.
    /// Every status call site goes through here.
    pub async fn evaluate(&self, peer_id: &str, native: NativeStatus) -> PresenceStatus {
        let now = self.clock.now_millis();
        let (status, changed) = {
            let mut peers = self.peers.write().await;
            let state = peers.entry(peer_id.to_string()).or_default();
            state.native = Some(native);
            let status = derive_status(native, state.last_seen_at_millis, now, self.online_window);
            let changed = state.reported != Some(status);
            state.reported = Some(status);
            (status, changed)
        };
        if changed {
            self.changed(peer_id);
        }
        status
    }

    /// Status now, from the latest native report and the heartbeat.
    /// `None` before the first evaluation.
    pub async fn status(&self, peer_id: &str) -> Option<PresenceStatus> {
        let now = self.clock.now_millis();
        self.peers
            .read()
            .await
            .get(peer_id)
            .and_then(|s| s.status(now, self.online_window))
    }

    pub async fn entry(&self, peer_id: &str) -> PresenceEntry {
        let now = self.clock.now_millis();
        let peers = self.peers.read().await;
        let state = peers.get(peer_id).cloned().unwrap_or_default();
        PresenceEntry {
            peer_id: peer_id.to_string(),
            last_seen_at_millis: state.last_seen_at_millis,
            is_typing: state.is_typing(now),
            status: state.status(now, self.online_window),
        }
    }

    pub async fn reset(&self) {
        self.peers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T: u64 = 1_700_000_000_000;

    fn tracker(clock: &ManualClock) -> PresenceTracker {
        let (tx, _) = broadcast::channel(16);
        PresenceTracker::new(
            Arc::new(clock.clone()),
            Duration::from_millis(3_000),
            Duration::from_millis(120_000),
            tx,
        )
    }

    #[test]
    fn test_derive_status_window_edges() {
        let w = Duration::from_millis(120_000);
        assert_eq!(derive_status(NativeStatus::Offline, Some(T), T + 119_999, w), PresenceStatus::Online);
        assert_eq!(derive_status(NativeStatus::Offline, Some(T), T + 120_000, w), PresenceStatus::Offline);
        assert_eq!(derive_status(NativeStatus::Unknown, Some(T), T + 120_001, w), PresenceStatus::Offline);
        assert_eq!(derive_status(NativeStatus::Online, None, T, w), PresenceStatus::Online);
        assert_eq!(derive_status(NativeStatus::Unknown, None, T, w), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_typing_resets_at_window_not_before() {
        let clock = ManualClock::new(T);
        let presence = tracker(&clock);

        presence.set_typing("bob").await;
        assert!(presence.is_typing("bob").await);

        clock.set(T + 2_999);
        assert!(presence.is_typing("bob").await);
        assert!(!presence.expire_typing("bob").await);

        clock.set(T + 3_000);
        assert!(!presence.is_typing("bob").await);
        assert!(presence.expire_typing("bob").await);
        assert!(!presence.expire_typing("bob").await);
    }

    #[tokio::test]
    async fn test_each_typing_signal_has_its_own_reset() {
        let clock = ManualClock::new(T);
        let presence = tracker(&clock);

        presence.set_typing("bob").await;
        clock.set(T + 2_000);
        presence.set_typing("bob").await;

        // first signal's reset still fires at +3000
        clock.set(T + 3_000);
        assert!(!presence.is_typing("bob").await);

        // a signal after that lasts until the second reset at +5000
        clock.set(T + 4_000);
        presence.set_typing("bob").await;
        assert!(presence.is_typing("bob").await);
        clock.set(T + 5_000);
        assert!(!presence.is_typing("bob").await);
    }

    #[tokio::test]
    async fn test_evaluate_records_status() {
        let clock = ManualClock::new(T);
        let presence = tracker(&clock);
        presence.touch("bob").await;

        clock.set(T + 119_999);
        assert_eq!(presence.evaluate("bob", NativeStatus::Offline).await, PresenceStatus::Online);
        clock.set(T + 120_001);
        assert_eq!(presence.evaluate("bob", NativeStatus::Offline).await, PresenceStatus::Offline);
        assert_eq!(presence.status("bob").await, Some(PresenceStatus::Offline));
        assert_eq!(presence.entry("bob").await.last_seen_at_millis, Some(T));
    }

    #[tokio::test]
    async fn test_status_decays_without_new_report() {
        let clock = ManualClock::new(T);
        let presence = tracker(&clock);
        assert_eq!(presence.status("bob").await, None);

        presence.touch("bob").await;
        clock.set(T + 1_000);
        assert_eq!(presence.evaluate("bob", NativeStatus::Offline).await, PresenceStatus::Online);

        clock.set(T + 119_999);
        assert_eq!(presence.status("bob").await, Some(PresenceStatus::Online));
        clock.set(T + 120_000);
        assert_eq!(presence.status("bob").await, Some(PresenceStatus::Offline));
        assert_eq!(presence.entry("bob").await.status, Some(PresenceStatus::Offline));

        // a fresh heartbeat brings it back without another native report
        presence.touch("bob").await;
        assert_eq!(presence.status("bob").await, Some(PresenceStatus::Online));
    }
}
