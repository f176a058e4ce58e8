use tokio::sync::broadcast;

/// Connection-level events published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// The entry for this address entered quarantine.
    Disconnected(String),
    /// A reconnection probe restored the entry for this address.
    Reconnected(String),
}

/// Fire-and-forget fan-out of [`ConnectionEvent`]s.
///
/// Observers subscribe through a broadcast channel; events published while
/// nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventHub {
    const CAPACITY: usize = 32;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn fire_disconnected(&self, addr: &str) {
        let _ = self
            .sender
            .send(ConnectionEvent::Disconnected(addr.to_string()));
    }

    pub fn fire_reconnected(&self, addr: &str) {
        let _ = self
            .sender
            .send(ConnectionEvent::Reconnected(addr.to_string()));
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
