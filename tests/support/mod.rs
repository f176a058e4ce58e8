#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use futures::FutureExt;
use tokio::sync::oneshot;

use kvbatch::{
    BatchContext, ClientParams, Cmd, CommandFrame, Connect, ConnectionEntry, ConnectionPool,
    ErrorKind, FreezeReason, KvError, KvFuture, KvResult, NodeConnection, NodeSource, NodeType,
    PooledConnection, Router, TopologyFeedback, Value,
};

/// What a mock node does with one command frame.
pub enum FrameAction {
    /// Complete each command with the paired result; the frame completion
    /// carries the first error, if any.
    Respond(Vec<KvResult<Value>>),
    /// Fail the whole frame without touching the command slots.
    Error(KvError),
    /// Acknowledge the write but never deliver responses.
    Silence,
    /// Fail the write itself.
    WriteError(KvError),
}

/// A frame as a mock node saw it.
#[derive(Clone, Debug)]
pub struct FrameRecord {
    pub addr: String,
    pub asking: bool,
    pub ops: Vec<String>,
    pub seqs: Vec<u64>,
}

/// Called with the observed frame and the number of frames this address
/// saw before it.
pub type FrameHandler = Arc<dyn Fn(&FrameRecord, usize) -> FrameAction + Send + Sync>;

pub type CmdHandler = Arc<dyn Fn(&Cmd) -> KvResult<Value> + Send + Sync>;

/// Shared scripting surface and observation log for a mock cluster.
#[derive(Default)]
pub struct MockState {
    frame_handlers: Mutex<HashMap<String, FrameHandler>>,
    cmd_handlers: Mutex<HashMap<String, CmdHandler>>,
    frames: Mutex<Vec<FrameRecord>>,
    frame_counts: Mutex<HashMap<String, usize>>,
    connect_failures: Mutex<HashMap<String, usize>>,
    connects: Mutex<Vec<String>>,
    commands: Mutex<Vec<(String, String)>>,
    // Keeps completion senders of silenced frames alive so the executor
    // observes a timeout instead of a dropped channel.
    parked: Mutex<Vec<oneshot::Sender<KvResult<()>>>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_frame_handler(&self, addr: &str, handler: FrameHandler) {
        self.frame_handlers
            .lock()
            .unwrap()
            .insert(addr.to_string(), handler);
    }

    pub fn set_cmd_handler(&self, addr: &str, handler: CmdHandler) {
        self.cmd_handlers
            .lock()
            .unwrap()
            .insert(addr.to_string(), handler);
    }

    /// Makes the next `count` connection attempts to `addr` fail.
    pub fn fail_connects(&self, addr: &str, count: usize) {
        self.connect_failures
            .lock()
            .unwrap()
            .insert(addr.to_string(), count);
    }

    pub fn frames(&self) -> Vec<FrameRecord> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frames_for(&self, addr: &str) -> Vec<FrameRecord> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.addr == addr)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self, addr: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .filter(|a| *a == addr)
            .count()
    }

    /// Single-command requests (probe traffic) seen by `addr`, in order.
    pub fn commands_for(&self, addr: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == addr)
            .map(|(_, op)| op.clone())
            .collect()
    }
}

pub struct MockConnection {
    addr: String,
    state: Arc<MockState>,
    active: Arc<AtomicBool>,
}

impl NodeConnection for MockConnection {
    fn send_frame(&self, frame: CommandFrame) -> KvFuture<'static, ()> {
        let state = self.state.clone();
        let addr = self.addr.clone();
        async move {
            let record = FrameRecord {
                addr: addr.clone(),
                asking: frame.asking,
                ops: frame
                    .commands
                    .iter()
                    .map(|command| command.command().op().to_string())
                    .collect(),
                seqs: frame.commands.iter().map(|command| command.seq()).collect(),
            };
            let index = {
                let mut counts = state.frame_counts.lock().unwrap();
                let count = counts.entry(addr.clone()).or_insert(0);
                let index = *count;
                *count += 1;
                index
            };
            state.frames.lock().unwrap().push(record.clone());

            let handler = state.frame_handlers.lock().unwrap().get(&addr).cloned();
            let action = match handler {
                Some(handler) => handler(&record, index),
                // Default behavior: echo each command's sequence number.
                None => FrameAction::Respond(
                    frame
                        .commands
                        .iter()
                        .map(|command| Ok(Value::Int(command.seq() as i64)))
                        .collect(),
                ),
            };
            match action {
                FrameAction::WriteError(err) => return Err(err),
                FrameAction::Silence => {
                    state.parked.lock().unwrap().push(frame.completion);
                }
                FrameAction::Error(err) => {
                    let _ = frame.completion.send(Err(err));
                }
                FrameAction::Respond(results) => {
                    let mut first_err: Option<KvError> = None;
                    for (command, result) in frame.commands.iter().zip(results) {
                        if first_err.is_none() {
                            if let Err(err) = &result {
                                first_err = Some(err.clone());
                            }
                        }
                        command.response().complete(result);
                    }
                    let _ = frame.completion.send(match first_err {
                        Some(err) => Err(err),
                        None => Ok(()),
                    });
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn req_command(&self, command: Cmd) -> KvFuture<'_, Value> {
        async move {
            self.state
                .commands
                .lock()
                .unwrap()
                .push((self.addr.clone(), command.op().to_string()));
            let handler = self
                .state
                .cmd_handlers
                .lock()
                .unwrap()
                .get(&self.addr)
                .cloned();
            match handler {
                Some(handler) => handler(&command),
                None => match command.op() {
                    "PING" => Ok(Value::Status("PONG".into())),
                    _ => Ok(Value::Okay),
                },
            }
        }
        .boxed()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl Connect for MockConnector {
    type Connection = MockConnection;

    fn connect<'a>(&'a self, addr: &'a str) -> KvFuture<'a, MockConnection> {
        async move {
            self.state.connects.lock().unwrap().push(addr.to_string());
            {
                let mut failures = self.state.connect_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(addr) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err((
                            ErrorKind::ConnectionFailed,
                            "mock connect refused",
                            addr.to_string(),
                        )
                            .into());
                    }
                }
            }
            Ok(MockConnection {
                addr: addr.to_string(),
                state: self.state.clone(),
                active: Arc::new(AtomicBool::new(true)),
            })
        }
        .boxed()
    }
}

/// Records replica health signals and plays the topology manager's part in
/// the reconnect handshake: `replica_up` unfreezes the entry.
#[derive(Default)]
pub struct MockTopology {
    pub downs: Mutex<Vec<String>>,
    pub ups: Mutex<Vec<String>>,
    pools: Mutex<HashMap<String, ConnectionPool<MockConnector>>>,
}

impl MockTopology {
    pub fn bind(&self, addr: &str, pool: ConnectionPool<MockConnector>) {
        self.pools.lock().unwrap().insert(addr.to_string(), pool);
    }
}

impl TopologyFeedback for MockTopology {
    fn replica_down(&self, addr: &str) {
        self.downs.lock().unwrap().push(addr.to_string());
    }

    fn replica_up(&self, addr: &str) {
        self.ups.lock().unwrap().push(addr.to_string());
        if let Some(pool) = self.pools.lock().unwrap().get(addr) {
            pool.unfreeze(addr, FreezeReason::Reconnect);
        }
    }
}

/// Static-slot router over one single-entry pool per address.
pub struct MockRouter {
    pub state: Arc<MockState>,
    pools: HashMap<String, ConnectionPool<MockConnector>>,
    masters: HashMap<u16, String>,
    replicas: HashMap<u16, String>,
}

impl MockRouter {
    pub fn pool(&self, addr: &str) -> &ConnectionPool<MockConnector> {
        self.pools
            .get(addr)
            .unwrap_or_else(|| panic!("no pool for {addr}"))
    }

    fn resolve(&self, source: &NodeSource, prefer_replica: bool) -> KvResult<&ConnectionPool<MockConnector>> {
        let addr = match source.address() {
            Some(addr) => addr.to_string(),
            None => {
                let owner = if prefer_replica {
                    self.replicas
                        .get(&source.slot())
                        .or_else(|| self.masters.get(&source.slot()))
                } else {
                    self.masters.get(&source.slot())
                };
                owner
                    .cloned()
                    .ok_or_else(|| -> KvError {
                        (
                            ErrorKind::ConnectionFailed,
                            "no node serves the slot",
                            source.slot().to_string(),
                        )
                            .into()
                    })?
            }
        };
        self.pools.get(&addr).ok_or_else(|| {
            (
                ErrorKind::ConnectionFailed,
                "no pool for address",
                addr.clone(),
            )
                .into()
        })
    }
}

impl Router for MockRouter {
    type Connection = MockConnection;

    fn acquire_read<'a>(
        &'a self,
        source: &'a NodeSource,
    ) -> KvFuture<'a, PooledConnection<MockConnection>> {
        async move { self.resolve(source, true)?.acquire().await }.boxed()
    }

    fn acquire_write<'a>(
        &'a self,
        source: &'a NodeSource,
    ) -> KvFuture<'a, PooledConnection<MockConnection>> {
        async move { self.resolve(source, false)?.acquire().await }.boxed()
    }
}

/// Builds a mock cluster: one pool per address, slots assigned statically.
pub async fn build_router(
    state: &Arc<MockState>,
    params: &Arc<ClientParams>,
    masters: &[(&str, &[u16])],
    replicas: &[(&str, &[u16])],
) -> (Arc<MockRouter>, Arc<MockTopology>) {
    let topology = Arc::new(MockTopology::default());
    let mut pools = HashMap::new();
    let mut master_map = HashMap::new();
    let mut replica_map = HashMap::new();

    for (addr, slots, node_type) in masters
        .iter()
        .map(|&(addr, slots)| (addr, slots, NodeType::Master))
        .chain(
            replicas
                .iter()
                .map(|&(addr, slots)| (addr, slots, NodeType::Replica)),
        )
    {
        let pool = ConnectionPool::new(
            MockConnector {
                state: state.clone(),
            },
            params.clone(),
            topology.clone(),
        );
        let entry = Arc::new(ConnectionEntry::new(
            addr,
            node_type,
            params.max_connections,
        ));
        let _ = pool.add_entry(entry).await;
        topology.bind(addr, pool.clone());
        pools.insert(addr.to_string(), pool);
        for slot in slots {
            match node_type {
                NodeType::Master => master_map.insert(*slot, addr.to_string()),
                NodeType::Replica => replica_map.insert(*slot, addr.to_string()),
            };
        }
    }

    let router = Arc::new(MockRouter {
        state: state.clone(),
        pools,
        masters: master_map,
        replicas: replica_map,
    });
    (router, topology)
}

pub fn context(
    router: Arc<MockRouter>,
    params: Arc<ClientParams>,
) -> Arc<BatchContext<MockRouter>> {
    Arc::new(BatchContext::new(router, params))
}
