//! Command-batch accumulation and execution.
//!
//! A [`CommandBatch`] collects commands from any number of producers,
//! partitioned by destination slot. Executing the batch fans every slot
//! bucket out to its own pipeline, handles cluster redirects and retries
//! per slot, and finally restores user-visible ordering by sorting the
//! collected responses by enqueue sequence number.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    cmd::Cmd,
    config::ClientParams,
    connection::PendingCommand,
    errors::ErrorKind,
    routing::{NodeSource, Router},
    shutdown::ShutdownLatch,
    types::{Codec, KvResult, Value},
};

mod executor;

use executor::Joined;

/// Shared collaborators batch execution runs against: the router that
/// resolves slots to pools, the tunables, and the client-wide shutdown
/// latch.
pub struct BatchContext<R: Router> {
    router: Arc<R>,
    params: Arc<ClientParams>,
    latch: Arc<ShutdownLatch>,
}

impl<R: Router> BatchContext<R> {
    pub fn new(router: Arc<R>, params: Arc<ClientParams>) -> Self {
        Self {
            router,
            params,
            latch: Arc::new(ShutdownLatch::new()),
        }
    }

    pub fn router(&self) -> &Arc<R> {
        &self.router
    }

    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.latch
    }

    /// Starts an empty batch against this context.
    pub fn new_batch(self: &Arc<Self>) -> CommandBatch<R> {
        CommandBatch::new(self.clone())
    }
}

/// The per-slot queue of commands accumulated during a batch.
///
/// The read-only flag starts true and latches false the first time a
/// write command lands in the bucket; it decides whether the executor may
/// target a replica.
pub struct SlotBucket {
    read_only: AtomicBool,
    commands: Mutex<Vec<Arc<PendingCommand>>>,
}

impl SlotBucket {
    fn new() -> Self {
        Self {
            read_only: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn mark_write(&self) {
        self.read_only.store(false, Ordering::Release);
    }

    fn push(&self, command: Arc<PendingCommand>) {
        self.commands.lock().unwrap().push(command);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<PendingCommand>> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands that still need a response. Already-succeeded commands are
    /// filtered so a retried pipeline never re-sends them.
    pub(crate) fn unfinished(&self) -> Vec<Arc<PendingCommand>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| !command.response().is_success())
            .cloned()
            .collect()
    }

    /// Drops stored per-command errors before a redirected or repeated
    /// dispatch.
    pub(crate) fn clear_errors(&self) {
        for command in self.commands.lock().unwrap().iter() {
            command.response().clear_error();
        }
    }

    pub fn len(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().unwrap().is_empty()
    }
}

/// Accumulates commands by slot and executes them as one scatter-gather
/// batch.
///
/// Enqueueing is allowed from multiple producers until execution starts;
/// a batch executes exactly once.
pub struct CommandBatch<R: Router> {
    ctx: Arc<BatchContext<R>>,
    seq: AtomicU64,
    executed: AtomicBool,
    buckets: Mutex<HashMap<u16, Arc<SlotBucket>>>,
}

impl<R: Router> CommandBatch<R> {
    pub fn new(ctx: Arc<BatchContext<R>>) -> Self {
        Self {
            ctx,
            seq: AtomicU64::new(0),
            executed: AtomicBool::new(false),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a command to the bucket for `slot`.
    ///
    /// `read_only` describes the command; a single write command latches
    /// the whole bucket to master routing. Fails once the batch has been
    /// executed.
    pub fn enqueue(&self, read_only: bool, slot: u16, codec: Codec, command: Cmd) -> KvResult<()> {
        if self.executed.load(Ordering::Acquire) {
            return Err((ErrorKind::AlreadyExecuted, "batch already executed").into());
        }
        let bucket = {
            let mut buckets = self.buckets.lock().unwrap();
            buckets
                .entry(slot)
                .or_insert_with(|| Arc::new(SlotBucket::new()))
                .clone()
        };
        if !read_only {
            bucket.mark_write();
        }
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        bucket.push(Arc::new(PendingCommand::new(codec, command, seq)));
        Ok(())
    }

    /// Total number of queued commands.
    pub fn command_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap()
            .values()
            .map(|bucket| bucket.len())
            .sum()
    }

    pub fn is_executed(&self) -> bool {
        self.executed.load(Ordering::Acquire)
    }

    /// Executes the batch and returns all responses ordered by enqueue
    /// sequence, independent of slot execution order.
    pub async fn execute(&self) -> KvResult<Vec<Value>> {
        let Some((joined_rx, _cancel_on_drop)) = self.dispatch()? else {
            return Ok(Vec::new());
        };
        match joined_rx.await {
            Ok(Ok(())) => Ok(self.collect_results()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err((ErrorKind::Client, "batch execution aborted").into()),
        }
    }

    /// Executes the batch without collecting responses.
    pub async fn execute_skip_result(&self) -> KvResult<()> {
        let Some((joined_rx, _cancel_on_drop)) = self.dispatch()? else {
            return Ok(());
        };
        match joined_rx.await {
            Ok(result) => result,
            Err(_) => Err((ErrorKind::Client, "batch execution aborted").into()),
        }
    }

    /// Transitions to the executed state and spawns one executor task per
    /// slot bucket. Returns `None` for an empty batch.
    ///
    /// The returned guard cancels all slot tasks when the caller drops the
    /// execution future.
    fn dispatch(
        &self,
    ) -> KvResult<Option<(oneshot::Receiver<KvResult<()>>, tokio_util::sync::DropGuard)>> {
        if self
            .executed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err((ErrorKind::AlreadyExecuted, "batch already executed").into());
        }

        let buckets: Vec<(u16, Arc<SlotBucket>)> = self
            .buckets
            .lock()
            .unwrap()
            .iter()
            .map(|(slot, bucket)| (*slot, bucket.clone()))
            .collect();
        if buckets.is_empty() {
            return Ok(None);
        }

        let token = CancellationToken::new();
        let (joined, joined_rx) = Joined::new(token.clone());
        let remaining = Arc::new(AtomicUsize::new(buckets.len()));
        for (slot, bucket) in buckets {
            tokio::spawn(executor::run_slot(
                self.ctx.clone(),
                bucket,
                NodeSource::new(slot),
                joined.clone(),
                remaining.clone(),
            ));
        }
        Ok(Some((joined_rx, token.drop_guard())))
    }

    fn collect_results(&self) -> Vec<Value> {
        let mut commands: Vec<Arc<PendingCommand>> = self
            .buckets
            .lock()
            .unwrap()
            .values()
            .flat_map(|bucket| bucket.snapshot())
            .collect();
        commands.sort_by_key(|command| command.seq());
        commands
            .into_iter()
            .map(|command| command.response().value().unwrap_or(Value::Nil))
            .collect()
    }
}
