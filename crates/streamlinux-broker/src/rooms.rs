//! Room and peer registry.
//!
//! Rooms group one host with its viewers. Peers are addressed by the id
//! the broker assigned at registration; each holds the sender half of its
//! write pump. Rooms are created on first registration and swept after
//! the idle timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

use stream_transport::signal::{PeerRole, PeerSummary, SignalMessage};

/// A connected peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: String,
    pub role: PeerRole,
    pub name: Option<String>,
    pub tx: mpsc::UnboundedSender<SignalMessage>,
    pub connected_at: Instant,
}

impl PeerHandle {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.id.clone(),
            role: self.role,
            name: self.name.clone(),
        }
    }
}

/// One signaling room.
struct Room {
    host: Option<PeerHandle>,
    viewers: HashMap<String, PeerHandle>,
    created_at_unix: i64,
    last_active: Instant,
}

impl Room {
    fn new() -> Self {
        Self {
            host: None,
            viewers: HashMap::new(),
            created_at_unix: now_unix(),
            last_active: Instant::now(),
        }
    }

    fn peers(&self) -> impl Iterator<Item = &PeerHandle> {
        self.host.iter().chain(self.viewers.values())
    }

    fn is_empty(&self) -> bool {
        self.host.is_none() && self.viewers.is_empty()
    }
}

/// Room summary for the REST surface.
#[derive(Debug, serde::Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub has_host: bool,
    pub num_clients: usize,
    pub created_at: i64,
    /// Seconds since the room last saw traffic.
    pub last_active: u64,
}

/// Host summary for the REST surface.
#[derive(Debug, serde::Serialize)]
pub struct HostSummary {
    pub peer_id: String,
    pub name: Option<String>,
    pub role: PeerRole,
    pub room: String,
    pub active_time_seconds: u64,
    pub has_clients: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("room already has a host")]
    RoomHasHost,
}

/// Thread-safe registry of rooms.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<RwLock<HashMap<String, Room>>>,
}

impl Rooms {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a peer, creating the room on first use.
    ///
    /// Assigns the peer id, announces the join to the other members and
    /// returns the handle plus the room snapshot for the `room_info`
    /// reply.
    pub async fn register(
        &self,
        room_id: &str,
        role: PeerRole,
        name: Option<String>,
        tx: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<(PeerHandle, SignalMessage), RegisterError> {
        let mut rooms = self.inner.write().await;
        let room = rooms.entry(room_id.to_owned()).or_insert_with(Room::new);

        if role == PeerRole::Host && room.host.is_some() {
            return Err(RegisterError::RoomHasHost);
        }

        let peer = PeerHandle {
            id: Uuid::new_v4().to_string(),
            role,
            name,
            tx,
            connected_at: Instant::now(),
        };

        let joined = SignalMessage::PeerJoined {
            peer_id: peer.id.clone(),
            role,
            name: peer.name.clone(),
        };
        for other in room.peers() {
            let _ = other.tx.send(joined.clone());
        }

        match role {
            PeerRole::Host => room.host = Some(peer.clone()),
            PeerRole::Viewer => {
                room.viewers.insert(peer.id.clone(), peer.clone());
            }
        }
        room.last_active = Instant::now();

        let info = SignalMessage::RoomInfo {
            room: room_id.to_owned(),
            has_host: room.host.is_some(),
            peers: room.peers().map(PeerHandle::summary).collect(),
        };

        Ok((peer, info))
    }

    /// Insert an already-registered peer into another room, keeping its
    /// id (the `join` message). The caller removes it from the old room.
    pub async fn adopt(
        &self,
        room_id: &str,
        peer: PeerHandle,
    ) -> Result<SignalMessage, RegisterError> {
        let mut rooms = self.inner.write().await;
        let room = rooms.entry(room_id.to_owned()).or_insert_with(Room::new);

        if peer.role == PeerRole::Host && room.host.is_some() {
            return Err(RegisterError::RoomHasHost);
        }

        let joined = SignalMessage::PeerJoined {
            peer_id: peer.id.clone(),
            role: peer.role,
            name: peer.name.clone(),
        };
        for other in room.peers() {
            let _ = other.tx.send(joined.clone());
        }

        match peer.role {
            PeerRole::Host => room.host = Some(peer),
            PeerRole::Viewer => {
                room.viewers.insert(peer.id.clone(), peer);
            }
        }
        room.last_active = Instant::now();

        Ok(SignalMessage::RoomInfo {
            room: room_id.to_owned(),
            has_host: room.host.is_some(),
            peers: room.peers().map(PeerHandle::summary).collect(),
        })
    }

    /// Remove a peer and notify the remaining members. Empty rooms stay
    /// until the idle sweep so a reconnecting host can reuse its token.
    pub async fn remove(&self, room_id: &str, peer_id: &str) {
        let mut rooms = self.inner.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };

        let removed = if room.host.as_ref().is_some_and(|h| h.id == peer_id) {
            room.host.take().is_some()
        } else {
            room.viewers.remove(peer_id).is_some()
        };

        if removed {
            let left = SignalMessage::PeerLeft {
                peer_id: peer_id.to_owned(),
            };
            for other in room.peers() {
                let _ = other.tx.send(left.clone());
            }
            room.last_active = Instant::now();
        }
    }

    /// Route a forwardable message.
    ///
    /// With a `to` field the message goes only to that peer in the same
    /// room; without one it is broadcast to all peers of the opposite
    /// role. The sender id is stamped into `from` either way.
    pub async fn route(&self, room_id: &str, sender: &PeerHandle, message: SignalMessage) {
        let mut rooms = self.inner.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        room.last_active = Instant::now();

        let message = message.with_from(&sender.id);

        if let Some(to) = message.to().map(str::to_owned) {
            let target = room.peers().find(|p| p.id == to);
            match target {
                Some(peer) => {
                    let _ = peer.tx.send(message);
                }
                None => tracing::debug!(%to, room = %room_id, "Routing target not in room"),
            }
            return;
        }

        let opposite = sender.role.opposite();
        for peer in room.peers().filter(|p| p.role == opposite) {
            let _ = peer.tx.send(message.clone());
        }
    }

    /// Mark activity on a room (heartbeats).
    pub async fn touch(&self, room_id: &str) {
        if let Some(room) = self.inner.write().await.get_mut(room_id) {
            room.last_active = Instant::now();
        }
    }

    /// Destroy rooms idle beyond `timeout`. Returns how many died.
    pub async fn sweep_idle(&self, timeout: std::time::Duration) -> usize {
        let mut rooms = self.inner.write().await;
        let before = rooms.len();
        rooms.retain(|id, room| {
            let keep = !room.is_empty() || room.last_active.elapsed() <= timeout;
            if !keep {
                tracing::info!(room = %id, "Destroying idle room");
            }
            keep
        });
        before - rooms.len()
    }

    /// REST: summaries of all rooms.
    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let rooms = self.inner.read().await;
        rooms
            .iter()
            .map(|(id, room)| RoomSummary {
                id: id.clone(),
                has_host: room.host.is_some(),
                num_clients: room.viewers.len(),
                created_at: room.created_at_unix,
                last_active: room.last_active.elapsed().as_secs(),
            })
            .collect()
    }

    /// REST: summaries of all connected hosts.
    pub async fn host_summaries(&self) -> Vec<HostSummary> {
        let rooms = self.inner.read().await;
        rooms
            .iter()
            .filter_map(|(id, room)| {
                room.host.as_ref().map(|host| HostSummary {
                    peer_id: host.id.clone(),
                    name: host.name.clone(),
                    role: host.role,
                    room: id.clone(),
                    active_time_seconds: host.connected_at.elapsed().as_secs(),
                    has_clients: !room.viewers.is_empty(),
                })
            })
            .collect()
    }

    /// Number of rooms (tests and diagnostics).
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}

/// Current Unix timestamp in seconds.
#[allow(clippy::cast_possible_wrap)]
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn channel() -> (
        mpsc::UnboundedSender<SignalMessage>,
        mpsc::UnboundedReceiver<SignalMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn second_host_rejected() {
        let rooms = Rooms::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        rooms
            .register("r", PeerRole::Host, None, tx1)
            .await
            .expect("first host");
        let err = rooms.register("r", PeerRole::Host, None, tx2).await;
        assert!(matches!(err, Err(RegisterError::RoomHasHost)));
    }

    #[tokio::test]
    async fn join_announced_to_existing_peers() {
        let rooms = Rooms::new();
        let (host_tx, mut host_rx) = channel();
        rooms
            .register("r", PeerRole::Host, Some("desk".into()), host_tx)
            .await
            .expect("host");

        let (viewer_tx, _viewer_rx) = channel();
        let (viewer, info) = rooms
            .register("r", PeerRole::Viewer, None, viewer_tx)
            .await
            .expect("viewer");

        match host_rx.recv().await.expect("join notice") {
            SignalMessage::PeerJoined { peer_id, role, .. } => {
                assert_eq!(peer_id, viewer.id);
                assert_eq!(role, PeerRole::Viewer);
            }
            other => panic!("unexpected message {other:?}"),
        }
        match info {
            SignalMessage::RoomInfo { has_host, peers, .. } => {
                assert!(has_host);
                assert_eq!(peers.len(), 2);
            }
            other => panic!("unexpected info {other:?}"),
        }
    }

    #[tokio::test]
    async fn directed_route_reaches_only_target() {
        let rooms = Rooms::new();
        let (host_tx, mut host_rx) = channel();
        let (host, _) = rooms
            .register("r", PeerRole::Host, None, host_tx)
            .await
            .expect("host");
        let (v1_tx, mut v1_rx) = channel();
        let (v1, _) = rooms
            .register("r", PeerRole::Viewer, None, v1_tx)
            .await
            .expect("viewer1");
        let (v2_tx, mut v2_rx) = channel();
        let (_v2, _) = rooms
            .register("r", PeerRole::Viewer, None, v2_tx)
            .await
            .expect("viewer2");

        // Drain the join notifications.
        while host_rx.try_recv().is_ok() {}
        while v1_rx.try_recv().is_ok() {}

        let offer = SignalMessage::Offer {
            from: None,
            to: Some(v1.id.clone()),
            sdp: "v=0".into(),
        };
        rooms.route("r", &host, offer).await;

        match v1_rx.try_recv().expect("directed offer") {
            SignalMessage::Offer { from, .. } => assert_eq!(from, Some(host.id.clone())),
            other => panic!("unexpected {other:?}"),
        }
        assert!(v2_rx.try_recv().is_err(), "other viewer must not receive");
    }

    #[tokio::test]
    async fn broadcast_goes_to_opposite_role() {
        let rooms = Rooms::new();
        let (host_tx, mut host_rx) = channel();
        let (_host, _) = rooms
            .register("r", PeerRole::Host, None, host_tx)
            .await
            .expect("host");
        let (viewer_tx, mut viewer_rx) = channel();
        let (viewer, _) = rooms
            .register("r", PeerRole::Viewer, None, viewer_tx)
            .await
            .expect("viewer");

        while host_rx.try_recv().is_ok() {}
        while viewer_rx.try_recv().is_ok() {}

        let answer = SignalMessage::Answer {
            from: None,
            to: None,
            sdp: "v=0".into(),
        };
        rooms.route("r", &viewer, answer).await;

        assert!(matches!(
            host_rx.try_recv().expect("broadcast answer"),
            SignalMessage::Answer { .. }
        ));
        assert!(viewer_rx.try_recv().is_err(), "sender must not receive");
    }

    #[tokio::test]
    async fn idle_rooms_swept_after_timeout() {
        let rooms = Rooms::new();
        let (tx, _rx) = channel();
        let (peer, _) = rooms
            .register("r", PeerRole::Host, None, tx)
            .await
            .expect("host");

        // Occupied rooms survive the sweep.
        assert_eq!(rooms.sweep_idle(Duration::from_secs(0)).await, 0);

        rooms.remove("r", &peer.id).await;
        assert_eq!(rooms.len().await, 1);
        assert_eq!(rooms.sweep_idle(Duration::from_secs(0)).await, 1);
        assert_eq!(rooms.len().await, 0);
    }
}
