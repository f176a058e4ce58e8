//! The seam between this crate and the wire transport.
//!
//! Connections are driven through the [`NodeConnection`] trait and opened
//! through [`Connect`]. The transport owns the wire protocol; this crate
//! hands it complete [`CommandFrame`]s and receives parsed [`Value`]s back
//! through per-command [`ResponseSlot`]s.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::{
    cmd::Cmd,
    types::{Codec, KvFuture, KvResult, Value},
};

/// Per-command promise.
///
/// A success latches: once a slot holds `Ok`, later completions are
/// ignored. Errors can be cleared so a redirected or retried pipeline
/// re-sends only unfinished commands.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    cell: Mutex<Option<KvResult<Value>>>,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the outcome for this command. A present success wins over
    /// any later completion.
    pub fn complete(&self, result: KvResult<Value>) {
        let mut cell = self.cell.lock().unwrap();
        if matches!(*cell, Some(Ok(_))) {
            return;
        }
        *cell = Some(result);
    }

    /// True once the slot holds a successful response.
    pub fn is_success(&self) -> bool {
        matches!(*self.cell.lock().unwrap(), Some(Ok(_)))
    }

    /// Drops a stored error so the command can be re-sent.
    pub fn clear_error(&self) {
        let mut cell = self.cell.lock().unwrap();
        if matches!(*cell, Some(Err(_))) {
            *cell = None;
        }
    }

    /// The successful response value, if any.
    pub fn value(&self) -> Option<Value> {
        match &*self.cell.lock().unwrap() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

/// A command queued in a batch: the payload plus its sequence number and
/// response promise.
#[derive(Debug)]
pub struct PendingCommand {
    codec: Codec,
    command: Cmd,
    seq: u64,
    response: ResponseSlot,
}

impl PendingCommand {
    pub fn new(codec: Codec, command: Cmd, seq: u64) -> Self {
        Self {
            codec,
            command,
            seq,
            response: ResponseSlot::new(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn command(&self) -> &Cmd {
        &self.command
    }

    /// Enqueue-time sequence number; drives final result ordering.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn response(&self) -> &ResponseSlot {
        &self.response
    }
}

/// One pipelined write handed to a connection.
///
/// The transport must deliver each command's reply into its
/// [`ResponseSlot`] and then fire `completion` — with `Ok` once every
/// command in the frame has a response, or with the first redirect,
/// loading, or server error it encounters. Dropping the sender without
/// firing it is treated as a failed write by the executor.
pub struct CommandFrame {
    /// The commands to send, in pipeline order.
    pub commands: Vec<std::sync::Arc<PendingCommand>>,
    /// When true the transport prefixes the pipeline with the one-shot
    /// `ASKING` probe on the wire.
    pub asking: bool,
    /// Completion signal for the whole frame.
    pub completion: oneshot::Sender<KvResult<()>>,
}

/// Handle for command execution over one remote connection.
///
/// Implementations are expected to be internally synchronized: frames can
/// be written while earlier responses are still in flight.
pub trait NodeConnection: Send + Sync + Sized + 'static {
    /// Writes a command frame. The returned future resolves when the frame
    /// was flushed to the socket; responses arrive later through the
    /// frame's slots and completion signal.
    fn send_frame(&self, frame: CommandFrame) -> KvFuture<'static, ()>;

    /// Sends a single command and reads its reply. Used by the
    /// reconnection probe for `AUTH` and `PING`.
    fn req_command(&self, command: Cmd) -> KvFuture<'_, Value>;

    /// Whether the underlying channel is still usable.
    fn is_active(&self) -> bool;

    /// Closes the connection. Idempotent.
    fn close(&self);
}

/// Connection factory used by the pool to open endpoints.
pub trait Connect: Send + Sync + 'static {
    type Connection: NodeConnection;

    /// Connect to a node, returning a handle for command execution.
    fn connect<'a>(&'a self, addr: &'a str) -> KvFuture<'a, Self::Connection>;
}
