//! kvbatch implements the correctness-critical core of a clustered
//! key-value-store client: the slot-partitioned command-batch executor and
//! the per-node connection pool with failure detection and reconnection.
//!
//! # Scope
//!
//! The crate deliberately stops at trait seams on both sides. The wire
//! protocol lives behind [`NodeConnection`] and [`Connect`]; the topology
//! manager (slot map, master/replica election) lives behind [`Router`] and
//! [`TopologyFeedback`]. What this crate owns is everything in between:
//!
//! - [`CommandBatch`] accumulates commands from any number of producers,
//!   partitioned by destination slot, and executes them as one
//!   scatter-gather batch whose results come back in enqueue order.
//! - The per-slot executor handles cluster redirects (`MOVED` re-routes,
//!   one-shot `ASK` probes), at-least-once retries under per-attempt
//!   deadlines, and loading servers — redirects never consume retry
//!   budget, timeouts always do.
//! - [`ConnectionPool`] reuses connections under bounded per-node
//!   concurrency, quarantines nodes after repeated connection failures,
//!   and brings them back through a self-rearming `AUTH`/`PING` probe.
//!
//! # Configuration
//!
//! All tunables live on [`ClientParams`]:
//!
//! ```rust
//! use std::time::Duration;
//!
//! let params = kvbatch::ClientParams::new()
//!     .set_retry_attempts(3)
//!     .set_response_timeout(Duration::from_secs(1))
//!     .set_min_idle(4);
//! assert_eq!(params.retry_window(), Duration::from_secs(1));
//! ```
//!
//! # Ordering guarantees
//!
//! Within one slot, commands are pipelined on a single connection in
//! enqueue order. Across slots there is no ordering; the result list of
//! [`CommandBatch::execute`] is sorted by enqueue sequence number to
//! restore user-visible ordering. The batch is a scatter-gather of
//! independent per-node pipelines, not a cross-node transaction.

#![deny(non_camel_case_types)]

pub mod batch;
mod cmd;
mod config;
mod connection;
pub mod errors;
mod events;
pub mod pool;
mod routing;
mod shutdown;
mod types;

pub use crate::batch::{BatchContext, CommandBatch, SlotBucket};
pub use crate::cmd::{cmd, Cmd};
pub use crate::config::ClientParams;
pub use crate::connection::{CommandFrame, Connect, NodeConnection, PendingCommand, ResponseSlot};
pub use crate::errors::{ErrorKind, KvError};
pub use crate::events::{ConnectionEvent, EventHub};
pub use crate::pool::{
    balancer::{LoadBalancer, RandomBalancer, RoundRobinBalancer},
    entry::{ConnectionEntry, FreezeReason, NodeType},
    ConnectionPool, PooledConnection,
};
pub use crate::routing::{NodeSource, NoopTopology, Redirect, Router, TopologyFeedback};
pub use crate::shutdown::{LatchPermit, ShutdownLatch};
pub use crate::types::{Codec, KvFuture, KvResult, Value};
