//! Tracks connected devices and operators; deduplicates device sessions by
//! serial; owns fan-out to operators.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::ws::Message;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use uuid::Uuid;

pub type SessionId = Uuid;

struct Registry {
    devices: HashMap<String, SessionId>,
    outboxes: HashMap<SessionId, UnboundedSender<Message>>,
    operators: std::collections::HashSet<SessionId>,
    device_serial_of: HashMap<SessionId, String>,
    closers: HashMap<SessionId, oneshot::Sender<()>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            devices: HashMap::new(),
            outboxes: HashMap::new(),
            operators: std::collections::HashSet::new(),
            device_serial_of: HashMap::new(),
            closers: HashMap::new(),
        }
    }
}

/// Owns only `Sender` handles, never the socket itself — `broadcast_to_operators`
/// is a synchronous, non-blocking iteration over these senders.
pub struct SessionRegistry {
    inner: Mutex<Registry>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::new()),
        }
    }

    /// Register a device session by serial. If a previous session exists
    /// for this serial, its close signal is fired (terminating its
    /// `handle_socket` loop so the stale connection actually closes) and its
    /// bookkeeping is replaced. Returns the superseded session id, if any,
    /// so the caller can run enrollment-cancellation hooks.
    ///
    /// `closer` fires `handle_socket`'s `close_rx` when this session is
    /// itself later superseded. Pass `None` when re-registering an already
    /// up device session (the `reg` frame was sent twice) — the existing
    /// closer is left in place.
    pub fn register_device(
        &self,
        serial: &str,
        session_id: SessionId,
        outbox: UnboundedSender<Message>,
        closer: Option<oneshot::Sender<()>>,
    ) -> Option<SessionId> {
        let mut guard = self.inner.lock().expect("session registry lock poisoned");
        let prior = guard.devices.insert(serial.to_string(), session_id);
        if let Some(prior_id) = prior {
            guard.outboxes.remove(&prior_id);
            guard.device_serial_of.remove(&prior_id);
            if let Some(prior_closer) = guard.closers.remove(&prior_id) {
                let _ = prior_closer.send(());
            }
        }
        guard.outboxes.insert(session_id, outbox);
        guard.device_serial_of.insert(session_id, serial.to_string());
        if let Some(closer) = closer {
            guard.closers.insert(session_id, closer);
        }
        prior
    }

    pub fn register_operator(&self, session_id: SessionId, outbox: UnboundedSender<Message>) {
        let mut guard = self.inner.lock().expect("session registry lock poisoned");
        guard.operators.insert(session_id);
        guard.outboxes.insert(session_id, outbox);
    }

    /// Remove a session entirely. Returns the device serial it was bound
    /// to, if it was a device session, so the enrollment controller can
    /// cancel any pending enrollment for it.
    pub fn unregister(&self, session_id: SessionId) -> Option<String> {
        let mut guard = self.inner.lock().expect("session registry lock poisoned");
        guard.outboxes.remove(&session_id);
        guard.operators.remove(&session_id);
        guard.closers.remove(&session_id);
        let serial = guard.device_serial_of.remove(&session_id);
        if let Some(serial) = &serial {
            if guard.devices.get(serial) == Some(&session_id) {
                guard.devices.remove(serial);
            }
        }
        serial
    }

    pub fn is_device_connected(&self, serial: &str) -> bool {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .devices
            .contains_key(serial)
    }

    pub fn list_device_serials(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .devices
            .keys()
            .cloned()
            .collect()
    }

    /// Send a frame to a single session by id, if it is still connected.
    pub fn send_to(&self, session_id: SessionId, frame: &serde_json::Value) {
        let guard = self.inner.lock().expect("session registry lock poisoned");
        if let Some(tx) = guard.outboxes.get(&session_id) {
            let _ = tx.send(Message::Text(frame.to_string().into()));
        }
    }

    /// Send a frame to the device session registered for `serial`, if any.
    pub fn send_to_device(&self, serial: &str, frame: &serde_json::Value) {
        let guard = self.inner.lock().expect("session registry lock poisoned");
        if let Some(session_id) = guard.devices.get(serial) {
            if let Some(tx) = guard.outboxes.get(session_id) {
                let _ = tx.send(Message::Text(frame.to_string().into()));
            }
        }
    }

    /// Send to every operator session. A send failure for one session (a
    /// closed channel) must not block the others.
    pub fn broadcast_to_operators(&self, frame: &serde_json::Value) {
        let guard = self.inner.lock().expect("session registry lock poisoned");
        let text = frame.to_string();
        for session_id in &guard.operators {
            if let Some(tx) = guard.outboxes.get(session_id) {
                let _ = tx.send(Message::Text(text.clone().into()));
            }
        }
    }

    /// Send to every connected device session, for shutdown broadcasts.
    pub fn broadcast_to_devices(&self, frame: &serde_json::Value) {
        let guard = self.inner.lock().expect("session registry lock poisoned");
        let text = frame.to_string();
        for session_id in guard.devices.values() {
            if let Some(tx) = guard.outboxes.get(session_id) {
                let _ = tx.send(Message::Text(text.clone().into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn register_device_twice_supersedes_prior_session() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();

        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        assert!(registry.register_device("SN-A", id1, tx1, None).is_none());
        let superseded = registry.register_device("SN-A", id2, tx2, None);
        assert_eq!(superseded, Some(id1));

        assert!(registry.is_device_connected("SN-A"));
        assert_eq!(registry.list_device_serials(), vec!["SN-A".to_string()]);
    }

    #[test]
    fn register_device_twice_fires_prior_sessions_closer() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let (closer1, mut close_rx1) = oneshot::channel();

        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        registry.register_device("SN-A", id1, tx1, Some(closer1));
        assert!(close_rx1.try_recv().is_err());

        registry.register_device("SN-A", id2, tx2, None);
        assert!(close_rx1.try_recv().is_ok());
    }

    #[test]
    fn unregister_returns_bound_serial() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let id = Uuid::new_v4();
        registry.register_device("SN-A", id, tx, None);

        let serial = registry.unregister(id);
        assert_eq!(serial, Some("SN-A".to_string()));
        assert!(!registry.is_device_connected("SN-A"));
    }

    #[test]
    fn unregister_stale_superseded_session_does_not_evict_new_one() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        registry.register_device("SN-A", id1, tx1, None);
        registry.register_device("SN-A", id2, tx2, None);
        registry.unregister(id1);

        assert!(registry.is_device_connected("SN-A"));
    }
}
