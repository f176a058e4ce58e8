//! Per-node connection pooling with failure detection and reconnection.
//!
//! A pool owns a set of [`ConnectionEntry`]s for one role (masters or
//! replicas of a shard). Acquisition walks the entries through a
//! [`LoadBalancer`], skipping frozen and saturated ones. Entries whose
//! consecutive connection failures reach the configured threshold are
//! quarantined: they freeze, a `Disconnected` event fires, and a
//! self-rearming probe reconnects, authenticates, and pings the endpoint
//! until it answers `PONG`, after which the entry is warmed back up and
//! unfrozen.

use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock, Weak,
    },
    time::Duration,
};

use futures::{future, stream, StreamExt, TryStreamExt};
use log::{info, trace, warn};
use rand::Rng;
use tokio::time::sleep;

use crate::{
    cmd::cmd,
    config::ClientParams,
    connection::{Connect, NodeConnection},
    errors::{ErrorKind, KvError},
    events::EventHub,
    routing::TopologyFeedback,
    types::KvResult,
};

pub mod balancer;
pub mod entry;

use balancer::{LoadBalancer, RoundRobinBalancer};
use entry::{ConnectionEntry, FreezeReason, NodeType};

/// Warm-up opens at most this many connections at once.
const WARMUP_CONCURRENCY: usize = 50;

/// A connection checked out of a pool.
///
/// Dropping the guard returns the connection to its entry: pooled again if
/// the entry is live and the connection healthy, closed otherwise. The
/// slot is freed either way, on every exit path.
pub struct PooledConnection<C: NodeConnection> {
    conn: Option<C>,
    entry: Arc<ConnectionEntry<C>>,
}

impl<C: NodeConnection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<C: NodeConnection> PooledConnection<C> {
    fn new(conn: C, entry: Arc<ConnectionEntry<C>>) -> Self {
        Self {
            conn: Some(conn),
            entry,
        }
    }

    pub fn entry(&self) -> &Arc<ConnectionEntry<C>> {
        &self.entry
    }

    /// Returns the connection to the pool immediately.
    pub fn release(self) {}
}

impl<C: NodeConnection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
            .as_ref()
            .expect("pooled connection accessed after release")
    }
}

impl<C: NodeConnection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.entry.return_connection(conn);
        }
    }
}

/// Releases a reserved slot when a warm-up task exits on any path.
struct SlotReservation<'a, C: NodeConnection> {
    entry: &'a ConnectionEntry<C>,
}

impl<C: NodeConnection> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        self.entry.release_slot();
    }
}

struct PoolShared<F: Connect> {
    connector: F,
    params: Arc<ClientParams>,
    balancer: Box<dyn LoadBalancer>,
    events: EventHub,
    topology: Arc<dyn TopologyFeedback>,
    entries: RwLock<Vec<Arc<ConnectionEntry<F::Connection>>>>,
}

/// Per-role collection of connection entries.
///
/// Cheap to clone; clones share the same entries, balancer, and event hub.
pub struct ConnectionPool<F: Connect> {
    shared: Arc<PoolShared<F>>,
}

impl<F: Connect> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: Connect> ConnectionPool<F> {
    /// Creates an empty pool with round-robin balancing.
    pub fn new(connector: F, params: Arc<ClientParams>, topology: Arc<dyn TopologyFeedback>) -> Self {
        Self::with_balancer(connector, params, topology, Box::new(RoundRobinBalancer::new()))
    }

    pub fn with_balancer(
        connector: F,
        params: Arc<ClientParams>,
        topology: Arc<dyn TopologyFeedback>,
        balancer: Box<dyn LoadBalancer>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                connector,
                params,
                balancer,
                events: EventHub::new(),
                topology,
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    pub fn params(&self) -> &ClientParams {
        &self.shared.params
    }

    /// Snapshot of the current entries.
    pub fn entries(&self) -> Vec<Arc<ConnectionEntry<F::Connection>>> {
        self.shared.entries.read().unwrap().clone()
    }

    /// Looks an entry up by address.
    pub fn entry(&self, addr: &str) -> Option<Arc<ConnectionEntry<F::Connection>>> {
        self.shared
            .entries
            .read()
            .unwrap()
            .iter()
            .find(|entry| entry.address() == addr)
            .cloned()
    }

    /// Warms a new entry up and publishes it to the pool. The entry is
    /// published even when warm-up fails, so that the failure counters and
    /// quarantine machinery take over from there.
    pub async fn add_entry(&self, entry: Arc<ConnectionEntry<F::Connection>>) -> KvResult<()> {
        let result = self.init_connections(&entry, true).await;
        self.shared.entries.write().unwrap().push(entry);
        result
    }

    /// Drops the entry for `addr` and closes its idle connections.
    pub fn remove_entry(&self, addr: &str) -> bool {
        let removed: Vec<_> = {
            let mut entries = self.shared.entries.write().unwrap();
            let (gone, kept): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|entry| entry.address() == addr);
            *entries = kept;
            gone
        };
        for entry in &removed {
            entry.close_idle();
        }
        !removed.is_empty()
    }

    /// Acquires a connection from any eligible entry.
    ///
    /// Walks up to one balancer pick per entry; frozen entries and entries
    /// without headroom are skipped. The first accepted entry serves the
    /// request: an idle healthy connection if one is pooled, a freshly
    /// opened one otherwise.
    pub async fn acquire(&self) -> KvResult<PooledConnection<F::Connection>> {
        let entries = self.entries();
        for _ in 0..entries.len() {
            let entry = entries[self.shared.balancer.next(entries.len())].clone();
            if entry.is_frozen() || !entry.try_acquire(self.shared.params.failed_attempts) {
                continue;
            }
            return self.connect_to(entry).await;
        }
        Err(self.exhausted_error(&entries))
    }

    /// Acquires a connection from a specific entry.
    ///
    /// A frozen master with the `System` reason still accepts acquisition:
    /// an administratively frozen master keeps taking routed writes until
    /// the topology change completes.
    pub async fn acquire_entry(
        &self,
        entry: &Arc<ConnectionEntry<F::Connection>>,
    ) -> KvResult<PooledConnection<F::Connection>> {
        let system_frozen_master = entry.node_type() == NodeType::Master
            && entry.freeze_reason() == Some(FreezeReason::System);
        if (system_frozen_master || !entry.is_frozen())
            && entry.try_acquire(self.shared.params.failed_attempts)
        {
            return self.connect_to(entry.clone()).await;
        }
        Err((
            ErrorKind::ConnectionFailed,
            "can't acquire connection to host",
            entry.address().to_string(),
        )
            .into())
    }

    /// Clears a freeze whose reason matches. Called by the topology
    /// manager when it processes `replica_up`.
    pub fn unfreeze(&self, addr: &str, reason: FreezeReason) -> bool {
        self.entry(addr)
            .map(|entry| entry.unfreeze_if(reason))
            .unwrap_or(false)
    }

    /// Clears a freeze unconditionally; a running probe for the entry
    /// exits at its next checkpoint.
    pub fn force_unfreeze(&self, addr: &str) -> bool {
        self.entry(addr)
            .map(|entry| entry.force_unfreeze())
            .unwrap_or(false)
    }

    /// Freezes every entry for shutdown and closes idle connections.
    /// Checked-out connections are closed as their guards return them.
    pub fn shutdown(&self) {
        for entry in self.entries() {
            entry.freeze(FreezeReason::System);
            entry.close_idle();
        }
    }

    /// Opens `min_idle` connections for the entry, at most
    /// [`WARMUP_CONCURRENCY`] in flight at once. A single failure aborts
    /// the warm-up with a structured error; success is reported only once
    /// every requested connection has completed.
    pub async fn init_connections(
        &self,
        entry: &Arc<ConnectionEntry<F::Connection>>,
        check_frozen: bool,
    ) -> KvResult<()> {
        let min_idle = self.shared.params.min_idle;
        if min_idle == 0 || (check_frozen && entry.is_frozen()) {
            return Ok(());
        }
        let established = AtomicUsize::new(0);
        stream::iter(
            (0..min_idle).map(|_| self.create_idle_connection(entry, check_frozen, &established)),
        )
        .buffer_unordered(WARMUP_CONCURRENCY)
        .try_for_each(|()| future::ready(Ok(())))
        .await?;
        info!(
            "{} connections initialized for {}",
            min_idle,
            entry.address()
        );
        Ok(())
    }

    async fn create_idle_connection(
        &self,
        entry: &Arc<ConnectionEntry<F::Connection>>,
        check_frozen: bool,
        established: &AtomicUsize,
    ) -> KvResult<()> {
        if (check_frozen && entry.is_frozen())
            || !entry.try_acquire(self.shared.params.failed_attempts)
        {
            return Err(self.warmup_error(entry, established, None));
        }
        let reservation = SlotReservation { entry };
        match self.shared.connector.connect(entry.address()).await {
            Ok(conn) => {
                entry.release(conn);
                drop(reservation);
                established.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(err) => {
                drop(reservation);
                Err(self.warmup_error(entry, established, Some(err)))
            }
        }
    }

    fn warmup_error(
        &self,
        entry: &ConnectionEntry<F::Connection>,
        established: &AtomicUsize,
        cause: Option<KvError>,
    ) -> KvError {
        let min_idle = self.shared.params.min_idle;
        let mut detail = format!(
            "only {} of {} connections were initialized for {}",
            established.load(Ordering::Acquire),
            min_idle,
            entry.address()
        );
        if let Some(cause) = cause {
            detail.push_str(": ");
            detail.push_str(&cause.to_string());
        }
        (
            ErrorKind::ConnectionFailed,
            "unable to establish the minimum idle connections",
            detail,
        )
            .into()
    }

    async fn connect_to(
        &self,
        entry: Arc<ConnectionEntry<F::Connection>>,
    ) -> KvResult<PooledConnection<F::Connection>> {
        // Drain dead idle connections until a healthy one turns up.
        while let Some(conn) = entry.poll() {
            if conn.is_active() {
                entry.reset_failed();
                return Ok(PooledConnection::new(conn, entry));
            }
            conn.close();
        }
        self.open_connection(entry).await
    }

    async fn open_connection(
        &self,
        entry: Arc<ConnectionEntry<F::Connection>>,
    ) -> KvResult<PooledConnection<F::Connection>> {
        match self.shared.connector.connect(entry.address()).await {
            Ok(conn) if conn.is_active() => {
                entry.reset_failed();
                Ok(PooledConnection::new(conn, entry))
            }
            Ok(conn) => {
                conn.close();
                let addr = entry.address().to_string();
                self.connection_failed(&entry);
                Err((
                    ErrorKind::ConnectionFailed,
                    "freshly opened connection is not active",
                    addr,
                )
                    .into())
            }
            Err(err) => {
                self.connection_failed(&entry);
                Err(err)
            }
        }
    }

    fn connection_failed(&self, entry: &Arc<ConnectionEntry<F::Connection>>) {
        entry.release_slot();
        if entry.inc_failed() == self.shared.params.failed_attempts {
            self.quarantine(entry.clone());
        }
    }

    fn quarantine(&self, entry: Arc<ConnectionEntry<F::Connection>>) {
        if !entry.freeze(FreezeReason::Reconnect) {
            return;
        }
        warn!(
            "host {} disconnected after {} failed connection attempts",
            entry.address(),
            self.shared.params.failed_attempts
        );
        if entry.node_type() == NodeType::Replica {
            self.shared.topology.replica_down(entry.address());
        }
        self.shared.events.fire_disconnected(entry.address());
        self.schedule_probe(entry);
    }

    /// Spawns the reconnection probe for a quarantined entry. The probe is
    /// self-rearming: it runs every `reconnect_timeout` (with a little
    /// jitter) until the entry is unfrozen by a successful handshake or by
    /// an external force-unfreeze. At most one probe exists per entry.
    fn schedule_probe(&self, entry: Arc<ConnectionEntry<F::Connection>>) {
        if !entry.try_begin_probe() {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                probe_loop(weak.clone(), &entry).await;
                entry.end_probe();
                // A quarantine racing with this exit found the probe slot
                // taken; pick its work up instead of stranding the entry.
                let refrozen = entry.is_frozen()
                    && entry.freeze_reason() == Some(FreezeReason::Reconnect);
                if !refrozen || !entry.try_begin_probe() {
                    return;
                }
            }
        });
    }

    fn awaiting_reconnect(&self, entry: &ConnectionEntry<F::Connection>) -> bool {
        entry.is_frozen() && entry.freeze_reason() == Some(FreezeReason::Reconnect)
    }

    async fn probe_once(&self, entry: &Arc<ConnectionEntry<F::Connection>>) -> KvResult<()> {
        let conn = self.shared.connector.connect(entry.address()).await?;
        let result = self.probe_handshake(entry, &conn).await;
        conn.close();
        result
    }

    /// One probe pass on a fresh connection: optional `AUTH`, then `PING`
    /// expecting the literal `PONG`, then warm-up and unfreeze. The frozen
    /// state is re-checked before every step so a concurrent unfreeze or
    /// shutdown ends the probe instead of fighting it.
    async fn probe_handshake(
        &self,
        entry: &Arc<ConnectionEntry<F::Connection>>,
        conn: &F::Connection,
    ) -> KvResult<()> {
        if !self.awaiting_reconnect(entry) {
            return Ok(());
        }
        if let Some(password) = &self.shared.params.password {
            let mut auth = cmd("AUTH");
            auth.arg(password);
            conn.req_command(auth).await?;
        }
        if !self.awaiting_reconnect(entry) {
            return Ok(());
        }
        let reply = conn.req_command(cmd("PING")).await?;
        if !reply.is_pong() {
            return Err((
                ErrorKind::ConnectionFailed,
                "unexpected reply to reconnect probe ping",
                format!("{reply:?}"),
            )
                .into());
        }
        if !self.awaiting_reconnect(entry) {
            return Ok(());
        }
        entry.reset_failed();
        self.init_connections(entry, false).await?;
        if entry.node_type() == NodeType::Replica {
            self.shared.topology.replica_up(entry.address());
        } else {
            entry.unfreeze_if(FreezeReason::Reconnect);
        }
        self.shared.events.fire_reconnected(entry.address());
        info!("host {} successfully reconnected", entry.address());
        Ok(())
    }

    fn exhausted_error(&self, entries: &[Arc<ConnectionEntry<F::Connection>>]) -> KvError {
        let mut frozen = Vec::new();
        let mut busy = Vec::new();
        for entry in entries {
            if entry.is_frozen() {
                frozen.push(entry.address().to_string());
            } else {
                busy.push(entry.address().to_string());
            }
        }
        KvError::pool_exhausted(frozen, busy)
    }
}

async fn probe_loop<F: Connect>(weak: Weak<PoolShared<F>>, entry: &Arc<ConnectionEntry<F::Connection>>) {
    loop {
        let delay = match weak.upgrade() {
            Some(shared) => jittered(shared.params.reconnect_timeout),
            None => return,
        };
        sleep(delay).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let pool = ConnectionPool { shared };
        if !pool.awaiting_reconnect(entry) {
            return;
        }
        match pool.probe_once(entry).await {
            Ok(()) => return,
            Err(err) => {
                trace!("reconnect probe for {} failed: {}", entry.address(), err);
            }
        }
    }
}

fn jittered(timeout: Duration) -> Duration {
    let max_jitter = timeout.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return timeout;
    }
    timeout + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}
