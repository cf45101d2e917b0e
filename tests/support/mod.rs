//! Shared test-only plumbing for the end-to-end scenario and property
//! suites: a terminal sink node that just records what it saw.
//!
//! Not part of the crate's public surface — spec §1 excludes a node
//! catalog beyond the five representative kinds, and a recording sink is
//! exactly the kind of testkit-harness concern that exclusion covers.

use std::sync::{Arc, Mutex as StdMutex};

use streamrt::{
    AnyNode, DownstreamSignal, DownstreamSink, ElemError, ExecutionAffinity, NodeId, NodeKind, PortId, RegionHandle,
};

pub struct Collector<T> {
    id: NodeId,
    pub items: StdMutex<Vec<T>>,
    pub completed: StdMutex<bool>,
    pub error: StdMutex<Option<ElemError>>,
}

impl<T> Collector<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Collector {
            id: NodeId::next(),
            items: StdMutex::new(Vec::new()),
            completed: StdMutex::new(false),
            error: StdMutex::new(None),
        })
    }

    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.lock().unwrap().clone()
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.lock().unwrap()
    }

    /// Access the collected items without requiring `T: Clone` — for
    /// payloads like `PrefixTailPair` that intentionally aren't cloneable.
    pub fn with_items<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.items.lock().unwrap())
    }
}

impl<T: Send + 'static> DownstreamSink<T> for Collector<T> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
        match signal {
            DownstreamSignal::OnNext(v) => self.items.lock().unwrap().push(v),
            DownstreamSignal::OnComplete => *self.completed.lock().unwrap() = true,
            DownstreamSignal::OnError(e) => *self.error.lock().unwrap() = Some(e),
        }
    }
}

/// Minimal `AnyNode`: a terminal sink is never itself a region-discovery
/// hop source (it adds no further neighbors), so `neighbors`/`add_neighbor`
/// are no-ops, matching the pattern the crate's own colocated unit tests
/// use for their collectors.
impl<T: Send + Sync + 'static> AnyNode for Collector<T> {
    fn id(&self) -> NodeId {
        self.id
    }
    fn kind(&self) -> NodeKind {
        NodeKind::SubSource
    }
    fn affinity(&self) -> ExecutionAffinity {
        ExecutionAffinity::Sync
    }
    fn seal(&self, _region: Arc<RegionHandle>) {}
    fn region(&self) -> Option<Arc<RegionHandle>> {
        None
    }
    fn needs_xstart(&self) -> bool {
        false
    }
    fn fire_xstart(&self) {}
    fn is_terminal(&self) -> bool {
        false
    }
    fn neighbors(&self) -> Vec<Arc<dyn AnyNode>> {
        Vec::new()
    }
    fn add_neighbor(&self, _other: Arc<dyn AnyNode>) {}
}
