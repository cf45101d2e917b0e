//! Region discovery, sealing, and the two run loops (spec §4.7).
//!
//! A region is the maximal set of nodes that execute on one scheduler: a
//! caller thread for synchronous regions (direct method calls, no
//! locking), or a single-threaded mailbox atop a `tokio` executor for
//! asynchronous regions. Discovery partitions the reachable graph by
//! union-find over each node's `neighbors()`, refusing to union a node
//! with `ExecutionAffinity::Async` into anyone else's component — such a
//! node always becomes (or joins, if adjacent to another async node) its
//! own asynchronously scheduled region.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StreamError};
use crate::node::{link, AnyNode, ExecutionAffinity, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

impl RegionId {
    fn next() -> Self {
        RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Synchronous,
    Asynchronous,
}

/// A unit of work queued on an asynchronous region's mailbox: "deliver
/// this already-captured signal to that node." Boxing the delivery
/// (rather than the raw `(node, port, signal)` triple) is what lets one
/// mailbox carry signals of differing element types without the region
/// engine itself being generic over them.
pub type Job = Box<dyn FnOnce() + Send>;

/// The owning scheduler for a set of nodes.
pub struct RegionHandle {
    pub id: RegionId,
    mode: ExecutionMode,
    members: Mutex<Vec<Arc<dyn AnyNode>>>,
    started: AtomicBool,
    mailbox_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl RegionHandle {
    fn new(mode: ExecutionMode) -> Arc<Self> {
        Arc::new(RegionHandle {
            id: RegionId::next(),
            mode,
            members: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            mailbox_tx: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Route a signal delivery. Synchronous regions deliver inline
    /// (direct method invocation, per spec §5); asynchronous regions
    /// enqueue on the mailbox so delivery happens FIFO on the region's own
    /// dispatcher, preserving per-region observation order even when the
    /// job originates from a foreign thread or region.
    pub fn enqueue(&self, job: Job) {
        match self.mode {
            ExecutionMode::Synchronous => self.run_sync_guarded(job),
            ExecutionMode::Asynchronous => {
                let tx = self.mailbox_tx.lock();
                match tx.as_ref() {
                    Some(tx) => {
                        let _ = tx.send(job);
                    }
                    None => job(),
                }
            }
        }
    }

    /// Run `job` on the caller thread, catching a panic at this region's
    /// boundary (spec §4.7: "a panic during sync dispatch is caught at
    /// the region boundary, which cancels all still-live external ports
    /// and marks every still-running node terminal with the observed
    /// error"). A member that itself panicked is typically already
    /// terminal by the time its own dispatch loop unwinds (a discarded
    /// behavior reads as terminal); this additionally forces every other
    /// still-running member of the region terminal, since only the
    /// panicking node's own state reflects the failure otherwise.
    fn run_sync_guarded(&self, job: Job) {
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            let message = panic_message(&payload);
            error!(region_id = self.id.0, panic = %message, "panic during synchronous dispatch; region torn down");
            for member in self.members.lock().iter() {
                member.force_terminal();
            }
        }
    }

    fn all_terminal(&self) -> bool {
        self.members.lock().iter().all(|m| m.is_terminal())
    }
}

/// Best-effort extraction of a human-readable message from a panic
/// payload, for the region-boundary log line.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Deliver `job` to `target_node`'s scheduler: inline if its region is not
/// yet sealed, caught at the region boundary if synchronous, enqueued on
/// the mailbox if asynchronous (spec §4.7 "Cross-region signals always go
/// through the destination region's mailbox").
pub fn route_via(target_node: &Arc<dyn AnyNode>, job: Job) {
    match target_node.region() {
        Some(region) if region.mode() == ExecutionMode::Asynchronous => {
            debug!(region_id = region.id.0, "enqueuing job crossing into asynchronous region");
            region.enqueue(job)
        }
        Some(region) => region.run_sync_guarded(job),
        None => job(),
    }
}

/// A reference to a peer positioned downstream of one of this node's
/// `T`-typed ports: it receives `onNext`/`onComplete`/`onError`. The port
/// id is the peer's own inbound port — baked in at connect time, since a
/// peer with several inbound ports (a fan-in) needs to know which one a
/// delivery targets without every caller re-deriving it.
pub struct DownstreamPeer<T> {
    sink: Arc<dyn crate::signal::DownstreamSink<T>>,
    node: Arc<dyn AnyNode>,
    port: crate::port::PortId,
}

impl<T: Send + 'static> DownstreamPeer<T> {
    pub fn new(
        sink: Arc<dyn crate::signal::DownstreamSink<T>>,
        node: Arc<dyn AnyNode>,
        port: crate::port::PortId,
    ) -> Self {
        DownstreamPeer { sink, node, port }
    }

    pub fn send(&self, signal: crate::signal::DownstreamSignal<T>) {
        let sink = Arc::clone(&self.sink);
        let port = self.port;
        route_via(&self.node, Box::new(move || sink.handle_downstream(port, signal)));
    }

    pub fn node(&self) -> &Arc<dyn AnyNode> {
        &self.node
    }
}

impl<T> Clone for DownstreamPeer<T> {
    fn clone(&self) -> Self {
        DownstreamPeer {
            sink: Arc::clone(&self.sink),
            node: Arc::clone(&self.node),
            port: self.port,
        }
    }
}

/// A reference to a peer positioned upstream of one of this node's ports:
/// it receives `request`/`cancel`. The port id is the peer's own outbound
/// port.
pub struct UpstreamPeer {
    sink: Arc<dyn crate::signal::UpstreamSink>,
    node: Arc<dyn AnyNode>,
    port: crate::port::PortId,
}

impl UpstreamPeer {
    pub fn new(sink: Arc<dyn crate::signal::UpstreamSink>, node: Arc<dyn AnyNode>, port: crate::port::PortId) -> Self {
        UpstreamPeer { sink, node, port }
    }

    pub fn send(&self, signal: crate::signal::UpstreamSignal) {
        let sink = Arc::clone(&self.sink);
        let port = self.port;
        route_via(&self.node, Box::new(move || sink.handle_upstream(port, signal)));
    }

    pub fn node(&self) -> &Arc<dyn AnyNode> {
        &self.node
    }
}

impl Clone for UpstreamPeer {
    fn clone(&self) -> Self {
        UpstreamPeer {
            sink: Arc::clone(&self.sink),
            node: Arc::clone(&self.node),
            port: self.port,
        }
    }
}

/// Bind an upstream node's outbound port to a downstream node's inbound
/// port, recording the region-discovery edge, and return each side's peer
/// handle to store locally. Stands in for the surface builder API's
/// attach/connect step, which this crate does not implement (spec §1).
pub fn connect<T: Send + 'static>(
    up_node: Arc<dyn AnyNode>,
    up_sink: Arc<dyn crate::signal::UpstreamSink>,
    up_port: &mut crate::port::OutboundPort,
    down_node: Arc<dyn AnyNode>,
    down_sink: Arc<dyn crate::signal::DownstreamSink<T>>,
    down_port: &mut crate::port::InboundPort,
) -> Result<(UpstreamPeer, DownstreamPeer<T>)> {
    crate::port::bind(up_port, down_port)?;
    link(&up_node, &down_node);
    let up_peer = UpstreamPeer::new(up_sink, up_node, up_port.id);
    let down_peer = DownstreamPeer::new(down_sink, down_node, down_port.id);
    Ok((up_peer, down_peer))
}

/// Outcome of sealing and running a graph from a set of roots.
pub struct RunHandle {
    async_dispatchers: Vec<tokio::task::JoinHandle<()>>,
}

impl RunHandle {
    /// True if no asynchronous region was discovered — the synchronous
    /// run loop has already driven everything to completion by the time
    /// `seal_and_run` returns.
    pub fn is_purely_synchronous(&self) -> bool {
        self.async_dispatchers.is_empty()
    }

    /// Wait for every asynchronous region's dispatcher to observe all its
    /// members terminal. A no-op (resolves immediately) for a purely
    /// synchronous run.
    pub async fn join(self) {
        let _ = futures::future::join_all(self.async_dispatchers).await;
    }
}

/// Discovers connected components among the nodes reachable from `roots`,
/// seals each into a `Region`, and starts them: synchronous regions run to
/// completion (of their currently pending work) inline; asynchronous
/// regions get a dispatcher task spawned on `executor`.
pub fn seal_and_run(roots: Vec<Arc<dyn AnyNode>>, executor: Option<tokio::runtime::Handle>) -> Result<RunHandle> {
    let all = discover_reachable(roots);
    let groups = partition_into_regions(&all);

    let mut async_dispatchers = Vec::new();

    for group in groups {
        let mode = if group[0].affinity() == ExecutionAffinity::Async {
            ExecutionMode::Asynchronous
        } else {
            ExecutionMode::Synchronous
        };
        let region = RegionHandle::new(mode);
        *region.members.lock() = group.clone();

        for node in &group {
            node.seal(Arc::clone(&region));
        }
        debug!(region_id = region.id.0, mode = ?mode, members = group.len(), "region sealed");

        let xstart_members: Vec<Arc<dyn AnyNode>> =
            group.iter().filter(|n| n.needs_xstart()).cloned().collect();

        match mode {
            ExecutionMode::Synchronous => {
                region.started.store(true, Ordering::SeqCst);
                info!(region_id = region.id.0, "starting synchronous region");
                for node in &xstart_members {
                    let node = Arc::clone(node);
                    region.run_sync_guarded(Box::new(move || node.fire_xstart()));
                }
            }
            ExecutionMode::Asynchronous => {
                let Some(handle) = executor.clone() else {
                    warn!(region_id = region.id.0, "asynchronous region discovered but no executor handle was supplied");
                    return Err(StreamError::Validation(
                        "asynchronous region discovered but no executor handle was supplied".to_string(),
                    ));
                };
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                *region.mailbox_tx.lock() = Some(tx.clone());
                region.started.store(true, Ordering::SeqCst);
                info!(region_id = region.id.0, "starting asynchronous region");

                for node in &xstart_members {
                    let node = Arc::clone(node);
                    let _ = tx.send(Box::new(move || node.fire_xstart()));
                }

                let region_for_task = Arc::clone(&region);
                let region_id = region.id.0;
                let task = handle.spawn(async move {
                    while let Some(job) = rx.recv().await {
                        job();
                        if region_for_task.all_terminal() {
                            debug!(region_id, "asynchronous region dispatcher observed all members terminal");
                            break;
                        }
                    }
                });
                async_dispatchers.push(task);
            }
        }
    }

    Ok(RunHandle { async_dispatchers })
}

fn discover_reachable(roots: Vec<Arc<dyn AnyNode>>) -> Vec<Arc<dyn AnyNode>> {
    let mut seen: HashMap<NodeId, Arc<dyn AnyNode>> = HashMap::new();
    let mut queue: VecDeque<Arc<dyn AnyNode>> = roots.into_iter().collect();
    while let Some(node) = queue.pop_front() {
        if seen.contains_key(&node.id()) {
            continue;
        }
        seen.insert(node.id(), Arc::clone(&node));
        for neighbor in node.neighbors() {
            if !seen.contains_key(&neighbor.id()) {
                queue.push_back(neighbor);
            }
        }
    }
    seen.into_values().collect()
}

/// Plain union-find (no path-halving; graphs here are small) over the
/// discovered node set. Async-affinity nodes never union with anyone, so
/// each ends up alone in its component.
fn partition_into_regions(nodes: &[Arc<dyn AnyNode>]) -> Vec<Vec<Arc<dyn AnyNode>>> {
    let index: HashMap<NodeId, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id(), i)).collect();
    let mut parent: Vec<usize> = (0..nodes.len()).collect();

    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }

    fn union(parent: &mut [usize], a: usize, b: usize) {
        let (ra, rb) = (find(parent, a), find(parent, b));
        if ra != rb {
            parent[ra] = rb;
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        if node.affinity() != ExecutionAffinity::Sync {
            continue;
        }
        for neighbor in node.neighbors() {
            if neighbor.affinity() != ExecutionAffinity::Sync {
                continue;
            }
            if let Some(&j) = index.get(&neighbor.id()) {
                union(&mut parent, i, j);
            }
        }
    }

    let mut groups: HashMap<usize, Vec<Arc<dyn AnyNode>>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(Arc::clone(node));
    }
    groups.into_values().collect()
}
