use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use guardian_types::events::{ObserverRole, PresenceEvent};

/// Default outbound buffer per observer. A session whose buffer fills up is
/// dropped rather than allowed to slow the publisher.
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

struct Session {
    role: ObserverRole,
    /// Set for DeviceAgent sessions only
    device_id: Option<String>,
    tx: mpsc::Sender<PresenceEvent>,
}

impl Session {
    /// Dashboards subscribe to everything; device agents only to events
    /// scoped to their own device.
    fn wants(&self, event: &PresenceEvent) -> bool {
        match self.role {
            ObserverRole::Dashboard => true,
            ObserverRole::DeviceAgent => match (event.device_id(), &self.device_id) {
                (Some(target), Some(own)) => target == own,
                _ => false,
            },
        }
    }
}

/// Manages all connected observers and fans out state-change events.
///
/// Delivery is best-effort to currently-connected observers only: there is
/// no durable per-observer queue, so an observer that is offline at publish
/// time relies on the snapshot/pending replay it receives on reconnect.
#[derive(Clone)]
pub struct PresenceChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    sessions: RwLock<HashMap<Uuid, Session>>,
    buffer: usize,
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceChannel {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_OUTBOUND_BUFFER)
    }

    /// Channel with a custom per-observer buffer size.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                sessions: RwLock::new(HashMap::new()),
                buffer,
            }),
        }
    }

    /// Register a new observer. The returned receiver carries every event
    /// the session subscribes to, starting with a `Welcome`.
    pub async fn connect(
        &self,
        role: ObserverRole,
        device_id: Option<String>,
    ) -> (Uuid, mpsc::Receiver<PresenceEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        // Welcome goes out before the session is visible to publishers, so
        // it is always the first event a connection sees.
        let _ = tx.try_send(PresenceEvent::Welcome { session_id, role });

        self.inner.sessions.write().await.insert(
            session_id,
            Session {
                role,
                device_id,
                tx,
            },
        );

        info!("observer {} connected as {:?}", session_id, role);
        (session_id, rx)
    }

    /// Remove an observer. Deliberately does not touch device connectivity:
    /// a reconnecting agent would flap if disconnect implied offline, so
    /// staleness is left to the registry's heartbeat sweep.
    pub async fn disconnect(&self, session_id: Uuid) {
        if self.inner.sessions.write().await.remove(&session_id).is_some() {
            info!("observer {} disconnected", session_id);
        }
    }

    /// Deliver an event to every connected observer whose subscription
    /// matches. A full or closed buffer never blocks the publisher; the
    /// offending observer is dropped instead. Returns the delivery count.
    pub async fn publish(&self, event: &PresenceEvent) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;

        {
            let sessions = self.inner.sessions.read().await;
            for (&session_id, session) in sessions.iter() {
                if !session.wants(event) {
                    continue;
                }
                match session.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("observer {} send failed ({}), dropping", session_id, e);
                        dead.push(session_id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.inner.sessions.write().await;
            for session_id in dead {
                sessions.remove(&session_id);
            }
        }

        delivered
    }

    /// Targeted send to one session (snapshot on connect, pending-command
    /// replay). Failure drops the session like a failed broadcast send.
    pub async fn send_to_session(&self, session_id: Uuid, event: PresenceEvent) {
        let failed = {
            let sessions = self.inner.sessions.read().await;
            match sessions.get(&session_id) {
                Some(session) => session.tx.try_send(event).is_err(),
                None => false,
            }
        };

        if failed {
            warn!("observer {} send failed, dropping", session_id);
            self.inner.sessions.write().await.remove(&session_id);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}
