//! Registry of connected clients and their announced presence.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use meshrelay_protocol::Presence;

use crate::connection::Sender;

/// Hub-local handle for one accepted socket.
pub type SessionId = u64;

/// Bookkeeping for one connected client.
///
/// Identity fields start empty and are filled from whatever the client
/// sends; there is no separate handshake.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub announced_id: Option<String>,
    pub announced_agents: Vec<String>,
    pub last_seen: DateTime<Utc>,
    sender: Sender,
}

/// One announced peer in a [`HubStatus`] report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: String,
    pub agents: usize,
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    /// All open sessions, announced or not.
    pub session_count: usize,
    /// Sessions that have announced an id.
    pub peers: Vec<PeerStatus>,
}

/// Mapping of session handle to client session.
///
/// Not synchronized itself; the hub wraps it in a single mutex so that
/// inserts, presence updates, removals, fan-out and status scans are
/// mutually exclusive.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<SessionId, ClientSession>,
    next_id: SessionId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection and returns its handle.
    pub fn insert(&mut self, remote_addr: SocketAddr, sender: Sender) -> SessionId {
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.insert(
            id,
            ClientSession {
                id,
                remote_addr,
                announced_id: None,
                announced_agents: Vec::new(),
                last_seen: Utc::now(),
                sender,
            },
        );
        id
    }

    /// Removes a session. Peers are not notified.
    pub fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Applies the identity fields a message carried.
    ///
    /// Returns `false` (and changes nothing) if the message announced
    /// nothing or the session is unknown.
    pub fn observe(&mut self, id: SessionId, presence: &Presence) -> bool {
        if presence.is_empty() {
            return false;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if let Some(announced) = &presence.id {
            session.announced_id = Some(announced.clone());
        }
        if let Some(agents) = &presence.agents {
            session.announced_agents = agents.clone();
        }
        session.last_seen = Utc::now();
        true
    }

    /// Queues `frame` on every open session except `from`.
    ///
    /// Fire-and-forget: closed sessions are skipped and a full buffer drops
    /// the frame for that receiver only. Returns the number of sessions the
    /// frame was queued on.
    pub fn fan_out(&self, from: SessionId, frame: &Utf8Bytes) -> usize {
        let mut delivered = 0;
        for (id, session) in &self.sessions {
            if *id == from || !session.sender.is_connected() {
                continue;
            }
            match session.sender.send_text(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(session = id, "dropping relayed frame: {e}"),
            }
        }
        delivered
    }

    /// Snapshot of announced peers, ordered by session handle.
    pub fn status(&self) -> HubStatus {
        let mut announced: Vec<&ClientSession> = self
            .sessions
            .values()
            .filter(|s| s.announced_id.is_some())
            .collect();
        announced.sort_by_key(|s| s.id);

        HubStatus {
            session_count: self.sessions.len(),
            peers: announced
                .into_iter()
                .filter_map(|s| {
                    s.announced_id.clone().map(|id| PeerStatus {
                        id,
                        agents: s.announced_agents.len(),
                    })
                })
                .collect(),
        }
    }
}
