//! Node scaffolding: identity, the intercept-buffering dispatch loop, and
//! the type-erased membership interface the region engine walks.
//!
//! Every stateful node in this crate (`PrefixAndTail`, `FanOutRoundRobin`,
//! `FlattenConcat`, `PushSource`, `Coupling`) wraps its behavior in
//! [`NodeCore`], which owns the intercept buffer and the
//! take/execute/replace dispatch loop described in spec §4.0: an event
//! that arrives while the node is already mid-transition is appended to an
//! internal FIFO and returns immediately, rather than recursing into the
//! behavior's own mutable state.
//!
//! `Map` (spec §4.1) is the one state in the representative set marked
//! non-intercepting: it is provably pass-through and holds no accumulator
//! a reentrant call could corrupt, so it bypasses `NodeCore` entirely and
//! dispatches with a plain recursive call — see `nodes::map` for the
//! rationale recorded at the call site.
//!
//! Each concrete node defines its own `NodeBehavior::Event` type naming
//! exactly the signals it can receive (e.g. `FlattenConcat` distinguishes
//! an event from its primary upstream from one raised by a subscribed
//! sub-source); `NodeCore`'s dispatch loop is generic over that shape and
//! never inspects it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::region::RegionHandle;

/// A process-wide unique node identifier, assigned at construction (spec §9
/// "node identification for diagnostics").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Structural tag used by the region engine and by diagnostics. Carries no
/// runtime behavior of its own (spec §4.0 "kind() — structural tag ... no
/// runtime effect").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Map,
    PrefixAndTail,
    FanOutRoundRobin,
    FlattenConcat,
    CouplingInlet,
    CouplingOutlet,
    PushSource,
    /// A sub-source spawned at runtime (the tail of a `PrefixAndTail`, or a
    /// per-element stream materialized by `FlattenConcat`'s adapter).
    SubSource,
    /// A finite in-memory source used to seed scenarios and tests. Not one
    /// of the specification's representative node kinds.
    VecSource,
}

/// Whether a node participates in its neighbors' synchronous region or
/// forms its own asynchronous one with a mailbox (spec §4.7 "Async
/// boundaries are nodes that opt into async").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionAffinity {
    Sync,
    Async,
}

/// Behavior implemented by every node wrapped in [`NodeCore`].
///
/// `on_event` is invoked with exclusive, non-reentrant access to `self`:
/// `NodeCore` guarantees no second call is in flight while this one runs,
/// even if, deep inside this call, a peer synchronously calls back into
/// this node (spec §4.0's reentrancy guarantee).
pub trait NodeBehavior: Send + 'static {
    type Event: Send + 'static;

    fn on_event(&mut self, event: Self::Event);

    /// Once true, `NodeCore` ignores further inbound events and stops
    /// invoking this behavior (spec §3 "once terminal, no further signals
    /// may be produced by the node; inbound signals are ignored").
    fn is_terminal(&self) -> bool;

    /// The event representing region-fired `xStart`, for behaviors that
    /// register for it (`NodeCore::new`'s `wants_xstart` flag). Behaviors
    /// that never register for `xStart` need not provide a meaningful
    /// implementation.
    fn xstart_event() -> Self::Event
    where
        Self: Sized,
    {
        unreachable!("this behavior never registers for xStart")
    }
}

/// Shared scaffolding for a node whose current state is a Rust value (not
/// a bare function pointer — see spec §9's "explicit state enum" guidance)
/// and which requires intercept buffering for safe reentrancy.
pub struct NodeCore<B: NodeBehavior> {
    pub id: NodeId,
    pub kind: NodeKind,
    pub affinity: ExecutionAffinity,
    wants_xstart: bool,
    region: Mutex<Option<Arc<RegionHandle>>>,
    neighbors: Mutex<Vec<Arc<dyn AnyNode>>>,
    behavior: Mutex<BehaviorSlot<B>>,
}

struct BehaviorSlot<B: NodeBehavior> {
    behavior: Option<B>,
    dispatching: bool,
    intercept: VecDeque<B::Event>,
}

impl<B: NodeBehavior> NodeCore<B> {
    pub fn new(kind: NodeKind, affinity: ExecutionAffinity, wants_xstart: bool, behavior: B) -> Arc<Self> {
        Arc::new(NodeCore {
            id: NodeId::next(),
            kind,
            affinity,
            wants_xstart,
            region: Mutex::new(None),
            neighbors: Mutex::new(Vec::new()),
            behavior: Mutex::new(BehaviorSlot {
                behavior: Some(behavior),
                dispatching: false,
                intercept: VecDeque::new(),
            }),
        })
    }

    /// Deliver one event, honoring the intercept protocol (spec §4.0).
    pub fn dispatch(&self, event: B::Event) {
        let mut guard = self.behavior.lock();
        let terminal_already = guard
            .behavior
            .as_ref()
            .map(|b| b.is_terminal())
            .unwrap_or(true);
        if terminal_already {
            return;
        }
        if guard.dispatching {
            guard.intercept.push_back(event);
            return;
        }
        guard.dispatching = true;
        let mut behavior = guard.behavior.take().expect("behavior present while not dispatching");
        drop(guard);

        let mut current = event;
        loop {
            behavior.on_event(current);
            let mut guard = self.behavior.lock();
            if behavior.is_terminal() {
                guard.intercept.clear();
                guard.behavior = Some(behavior);
                guard.dispatching = false;
                return;
            }
            match guard.intercept.pop_front() {
                Some(next) => {
                    drop(guard);
                    current = next;
                }
                None => {
                    guard.behavior = Some(behavior);
                    guard.dispatching = false;
                    return;
                }
            }
        }
    }

    /// Drop the behavior value outright, the same state a panic unwinding
    /// through `dispatch` already leaves the node in: `behavior` becomes
    /// `None`, so `is_terminal_now`/`dispatch` read the node as terminal
    /// from here on (both fall back to `unwrap_or(true)` on a missing
    /// behavior).
    fn discard_behavior(&self) {
        let mut guard = self.behavior.lock();
        guard.behavior = None;
        guard.intercept.clear();
        guard.dispatching = false;
    }

    pub fn is_terminal_now(&self) -> bool {
        self.behavior
            .lock()
            .behavior
            .as_ref()
            .map(|b| b.is_terminal())
            .unwrap_or(true)
    }

    /// Direct, non-dispatching access to the behavior for build-time
    /// wiring (setting peer handles before the region starts). Must not be
    /// called once the node may be concurrently dispatching — the usual
    /// case is "called once, synchronously, right after construction and
    /// before `seal`".
    pub fn with_behavior_mut<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut guard = self.behavior.lock();
        let behavior = guard.behavior.as_mut().expect("behavior present before first dispatch");
        f(behavior)
    }
}

/// Delegates the [`AnyNode`] impl for a facade type to its inner
/// `NodeCore`-holding field, so each concrete node built atop `NodeCore`
/// does not repeat this boilerplate.
#[macro_export]
macro_rules! delegate_any_node_to_core {
    ($ty:ident < $($generic:ident),+ >, $field:ident) => {
        impl<$($generic: Send + 'static),+> $crate::node::AnyNode for $ty<$($generic),+> {
            fn id(&self) -> $crate::node::NodeId {
                $crate::node::AnyNode::id(&*self.$field)
            }
            fn kind(&self) -> $crate::node::NodeKind {
                $crate::node::AnyNode::kind(&*self.$field)
            }
            fn affinity(&self) -> $crate::node::ExecutionAffinity {
                $crate::node::AnyNode::affinity(&*self.$field)
            }
            fn seal(&self, region: std::sync::Arc<$crate::region::RegionHandle>) {
                $crate::node::AnyNode::seal(&*self.$field, region)
            }
            fn region(&self) -> Option<std::sync::Arc<$crate::region::RegionHandle>> {
                $crate::node::AnyNode::region(&*self.$field)
            }
            fn needs_xstart(&self) -> bool {
                $crate::node::AnyNode::needs_xstart(&*self.$field)
            }
            fn fire_xstart(&self) {
                $crate::node::AnyNode::fire_xstart(&*self.$field)
            }
            fn is_terminal(&self) -> bool {
                $crate::node::AnyNode::is_terminal(&*self.$field)
            }
            fn force_terminal(&self) {
                $crate::node::AnyNode::force_terminal(&*self.$field)
            }
            fn neighbors(&self) -> Vec<std::sync::Arc<dyn $crate::node::AnyNode>> {
                $crate::node::AnyNode::neighbors(&*self.$field)
            }
            fn add_neighbor(&self, other: std::sync::Arc<dyn $crate::node::AnyNode>) {
                $crate::node::AnyNode::add_neighbor(&*self.$field, other)
            }
        }
    };
}

/// Type-erased view of a node, used by the region engine (which cannot be
/// generic over every node's element type) for sealing, `xStart` dispatch,
/// and connected-component discovery.
pub trait AnyNode: Send + Sync {
    fn id(&self) -> NodeId;
    fn kind(&self) -> NodeKind;
    fn affinity(&self) -> ExecutionAffinity;

    /// Idempotent: installs the region pointer on first call, no-ops after
    /// (spec §4.0 "seal(region) — idempotent").
    fn seal(&self, region: Arc<RegionHandle>);
    fn region(&self) -> Option<Arc<RegionHandle>>;

    fn needs_xstart(&self) -> bool;
    fn fire_xstart(&self);

    fn is_terminal(&self) -> bool;

    /// Forcibly mark this node terminal, best-effort propagating
    /// cancellation to whatever live peers it holds. Called at a region
    /// boundary after a panic unwound through synchronous dispatch (spec
    /// §4.7): every still-running member of the torn-down region is
    /// forced terminal even though it never itself panicked. Default
    /// no-op — leaf test doubles and similar sinks have no peers to
    /// cancel and no further dispatch to suppress.
    fn force_terminal(&self) {}

    /// Nodes this one is wired to, for region discovery only. Not part of
    /// the signal-routing fast path (that goes through each node's typed
    /// peer handles).
    fn neighbors(&self) -> Vec<Arc<dyn AnyNode>>;
    fn add_neighbor(&self, other: Arc<dyn AnyNode>);
}

impl<B: NodeBehavior> AnyNode for NodeCore<B> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn affinity(&self) -> ExecutionAffinity {
        self.affinity
    }

    fn seal(&self, region: Arc<RegionHandle>) {
        let mut guard = self.region.lock();
        if guard.is_none() {
            *guard = Some(region);
        }
    }

    fn region(&self) -> Option<Arc<RegionHandle>> {
        self.region.lock().clone()
    }

    fn needs_xstart(&self) -> bool {
        self.wants_xstart
    }

    fn fire_xstart(&self) {
        self.dispatch(B::xstart_event());
    }

    fn is_terminal(&self) -> bool {
        self.is_terminal_now()
    }

    fn force_terminal(&self) {
        self.discard_behavior();
    }

    fn neighbors(&self) -> Vec<Arc<dyn AnyNode>> {
        self.neighbors.lock().clone()
    }

    fn add_neighbor(&self, other: Arc<dyn AnyNode>) {
        self.neighbors.lock().push(other);
    }
}

/// Record a bidirectional region-discovery edge between two freshly wired
/// nodes. Called once per port binding by each node's connect-style
/// constructor.
pub fn link(a: &Arc<dyn AnyNode>, b: &Arc<dyn AnyNode>) {
    a.add_neighbor(Arc::clone(b));
    b.add_neighbor(Arc::clone(a));
}
