//! Routing inputs consumed from, and contracts offered to, the topology
//! manager. The slot map itself lives outside this crate.

use crate::{connection::NodeConnection, pool::PooledConnection, types::KvFuture};

/// A redirect hint returned by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// The slot has permanently moved; the address supersedes the slot
    /// owner until the topology catches up.
    Moved(String),
    /// One-shot hint during live resharding. Valid for the next dispatch
    /// only and forces an `ASKING` prefix on the wire.
    Ask(String),
}

impl Redirect {
    pub fn address(&self) -> &str {
        match self {
            Redirect::Moved(addr) | Redirect::Ask(addr) => addr,
        }
    }
}

/// Where a slot pipeline should be sent: the slot plus an optional
/// redirect that overrides the slot owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSource {
    slot: u16,
    redirect: Option<Redirect>,
}

impl NodeSource {
    /// Routes by slot ownership.
    pub fn new(slot: u16) -> Self {
        Self {
            slot,
            redirect: None,
        }
    }

    /// Routes to the address named by a redirect.
    pub fn redirected(slot: u16, redirect: Redirect) -> Self {
        Self {
            slot,
            redirect: Some(redirect),
        }
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn redirect(&self) -> Option<&Redirect> {
        self.redirect.as_ref()
    }

    /// The explicit address a redirect points at, if any.
    pub fn address(&self) -> Option<&str> {
        self.redirect.as_ref().map(Redirect::address)
    }

    pub fn is_ask(&self) -> bool {
        matches!(self.redirect, Some(Redirect::Ask(_)))
    }
}

/// Resolves a [`NodeSource`] to a pooled connection.
///
/// Implemented by the topology manager. Implementations must honor the
/// explicit address carried by MOVED and ASK redirects.
pub trait Router: Send + Sync + 'static {
    type Connection: NodeConnection;

    /// Acquire a connection suitable for a read-only pipeline. May target
    /// a replica of the slot owner.
    fn acquire_read<'a>(
        &'a self,
        source: &'a NodeSource,
    ) -> KvFuture<'a, PooledConnection<Self::Connection>>;

    /// Acquire a connection to the slot owner for a writing pipeline.
    fn acquire_write<'a>(
        &'a self,
        source: &'a NodeSource,
    ) -> KvFuture<'a, PooledConnection<Self::Connection>>;
}

/// Health signals the pool sends back to the topology manager.
///
/// `replica_down` fires when a replica entry enters quarantine;
/// `replica_up` fires after a successful reconnection probe. The topology
/// manager is expected to unfreeze the entry (via
/// [`crate::ConnectionPool::unfreeze`]) while handling `replica_up`.
pub trait TopologyFeedback: Send + Sync + 'static {
    fn replica_down(&self, addr: &str);
    fn replica_up(&self, addr: &str);
}

/// Feedback sink for deployments without replicas.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTopology;

impl TopologyFeedback for NoopTopology {
    fn replica_down(&self, _addr: &str) {}
    fn replica_up(&self, _addr: &str) {}
}
