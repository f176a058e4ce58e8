use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use crate::connection::NodeConnection;

/// The role an endpoint plays in its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Master,
    Replica,
}

/// Why an entry is excluded from acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeReason {
    /// The client is shutting down.
    System,
    /// The entry is quarantined and a reconnection probe owns it.
    Reconnect,
    /// Administrative exclusion.
    Manual,
}

#[derive(Debug, Default)]
struct FreezeState {
    frozen: bool,
    reason: Option<FreezeReason>,
}

/// Tracks one remote endpoint: its idle connections, in-use slot count,
/// failure counter, and freeze state.
///
/// Counter mutations are atomic; freeze transitions take the entry's own
/// mutex, never a pool-wide lock.
pub struct ConnectionEntry<C> {
    address: String,
    node_type: NodeType,
    max_connections: usize,
    in_use: AtomicUsize,
    failed_attempts: AtomicUsize,
    freeze: Mutex<FreezeState>,
    available: Mutex<Vec<C>>,
    probe_active: AtomicBool,
}

impl<C: NodeConnection> ConnectionEntry<C> {
    pub fn new(address: impl Into<String>, node_type: NodeType, max_connections: usize) -> Self {
        Self {
            address: address.into(),
            node_type,
            max_connections,
            in_use: AtomicUsize::new(0),
            failed_attempts: AtomicUsize::new(0),
            freeze: Mutex::new(FreezeState::default()),
            available: Mutex::new(Vec::new()),
            probe_active: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Reserves a connection slot if the entry has not crossed the failure
    /// threshold and has headroom. No state changes on refusal.
    pub fn try_acquire(&self, failed_threshold: usize) -> bool {
        if self.failed_attempts.load(Ordering::Acquire) >= failed_threshold {
            return false;
        }
        let max = self.max_connections;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                (in_use < max).then_some(in_use + 1)
            })
            .is_ok()
    }

    /// Takes an idle connection. The slot was already reserved by
    /// [`ConnectionEntry::try_acquire`], so the in-use count is unchanged.
    pub fn poll(&self) -> Option<C> {
        self.available.lock().unwrap().pop()
    }

    /// Returns a connection to the idle set if it is still healthy,
    /// otherwise discards it.
    pub fn release(&self, conn: C) {
        if conn.is_active() {
            self.available.lock().unwrap().push(conn);
        } else {
            conn.close();
        }
    }

    /// Frees a reserved connection slot.
    pub fn release_slot(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Returns a checked-out connection and frees its slot. Connections
    /// returned to a frozen entry are closed instead of pooled.
    pub fn return_connection(&self, conn: C) {
        if self.is_frozen() {
            conn.close();
        } else {
            self.release(conn);
        }
        self.release_slot();
    }

    pub fn inc_failed(&self) -> usize {
        self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_failed(&self) {
        self.failed_attempts.store(0, Ordering::Release);
    }

    pub fn failed_attempts(&self) -> usize {
        self.failed_attempts.load(Ordering::Acquire)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    /// Freezes the entry. Returns false when it was already frozen.
    pub fn freeze(&self, reason: FreezeReason) -> bool {
        let mut state = self.freeze.lock().unwrap();
        if state.frozen {
            return false;
        }
        state.frozen = true;
        state.reason = Some(reason);
        true
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.lock().unwrap().frozen
    }

    pub fn freeze_reason(&self) -> Option<FreezeReason> {
        self.freeze.lock().unwrap().reason
    }

    /// Clears the freeze only while the stored reason matches. Used by the
    /// probe so it cannot undo a concurrent administrative freeze.
    pub fn unfreeze_if(&self, reason: FreezeReason) -> bool {
        let mut state = self.freeze.lock().unwrap();
        if state.frozen && state.reason == Some(reason) {
            state.frozen = false;
            state.reason = None;
            return true;
        }
        false
    }

    /// Clears the freeze unconditionally. Also makes a running probe exit
    /// at its next checkpoint.
    pub fn force_unfreeze(&self) -> bool {
        let mut state = self.freeze.lock().unwrap();
        let was_frozen = state.frozen;
        state.frozen = false;
        state.reason = None;
        was_frozen
    }

    /// Closes and drops every idle connection.
    pub fn close_idle(&self) {
        let drained: Vec<C> = self.available.lock().unwrap().drain(..).collect();
        for conn in drained {
            conn.close();
        }
    }

    /// Claims the entry's single probe slot.
    pub(crate) fn try_begin_probe(&self) -> bool {
        self.probe_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_probe(&self) {
        self.probe_active.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn probe_running(&self) -> bool {
        self.probe_active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Cmd;
    use crate::types::{KvFuture, Value};
    use futures::FutureExt;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::sync::Arc;

    struct FakeConn {
        active: Arc<StdAtomicBool>,
    }

    impl FakeConn {
        fn healthy() -> Self {
            Self {
                active: Arc::new(StdAtomicBool::new(true)),
            }
        }

        fn dead() -> Self {
            Self {
                active: Arc::new(StdAtomicBool::new(false)),
            }
        }
    }

    impl NodeConnection for FakeConn {
        fn send_frame(&self, _frame: crate::connection::CommandFrame) -> KvFuture<'static, ()> {
            async { Ok(()) }.boxed()
        }

        fn req_command(&self, _command: Cmd) -> KvFuture<'_, Value> {
            async { Ok(Value::Okay) }.boxed()
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::Acquire)
        }

        fn close(&self) {
            self.active.store(false, Ordering::Release);
        }
    }

    fn entry(max: usize) -> ConnectionEntry<FakeConn> {
        ConnectionEntry::new("node:6379", NodeType::Master, max)
    }

    #[test]
    fn try_acquire_respects_headroom() {
        let entry = entry(2);
        assert!(entry.try_acquire(3));
        assert!(entry.try_acquire(3));
        assert!(!entry.try_acquire(3));
        entry.release_slot();
        assert!(entry.try_acquire(3));
        assert_eq!(entry.in_use(), 2);
    }

    #[test]
    fn try_acquire_blocks_past_failure_threshold() {
        let entry = entry(4);
        entry.inc_failed();
        entry.inc_failed();
        assert!(!entry.try_acquire(2));
        assert_eq!(entry.in_use(), 0);

        entry.reset_failed();
        assert!(entry.try_acquire(2));
    }

    #[test]
    fn release_discards_dead_connections() {
        let entry = entry(4);
        entry.release(FakeConn::healthy());
        entry.release(FakeConn::dead());
        assert_eq!(entry.idle_count(), 1);
    }

    #[test]
    fn return_connection_closes_when_frozen() {
        let entry = entry(4);
        assert!(entry.try_acquire(3));
        entry.freeze(FreezeReason::Reconnect);

        entry.return_connection(FakeConn::healthy());
        assert_eq!(entry.idle_count(), 0);
        assert_eq!(entry.in_use(), 0);
    }

    #[test]
    fn freeze_transitions_once_and_keeps_reason() {
        let entry = entry(4);
        assert!(entry.freeze(FreezeReason::Reconnect));
        assert!(!entry.freeze(FreezeReason::System));
        assert_eq!(entry.freeze_reason(), Some(FreezeReason::Reconnect));

        assert!(!entry.unfreeze_if(FreezeReason::System));
        assert!(entry.unfreeze_if(FreezeReason::Reconnect));
        assert!(!entry.is_frozen());
        assert_eq!(entry.freeze_reason(), None);
    }

    #[test]
    fn slot_accounting_stays_within_bounds() {
        // in_use + idle never exceeds max_connections at quiescent points.
        let entry = entry(3);
        for _ in 0..3 {
            assert!(entry.try_acquire(10));
        }
        for _ in 0..3 {
            entry.release(FakeConn::healthy());
            entry.release_slot();
        }
        assert!(entry.in_use() + entry.idle_count() <= entry.max_connections());
        assert_eq!(entry.idle_count(), 3);
    }

    #[test]
    fn probe_slot_is_exclusive() {
        let entry = entry(1);
        assert!(entry.try_begin_probe());
        assert!(!entry.try_begin_probe());
        entry.end_probe();
        assert!(entry.try_begin_probe());
    }
}
