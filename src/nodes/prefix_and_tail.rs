//! Buffering gate: splits the first `prefix_size` elements from the rest
//! of the stream into a single `(prefix, tail)` pair, where the tail is a
//! real graph node inheriting whatever upstream demand remains (spec
//! §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::delegate_any_node_to_core;
use crate::error::ElemError;
use crate::node::{AnyNode, ExecutionAffinity, NodeBehavior, NodeCore, NodeId, NodeKind};
use crate::port::{InboundPort, OutboundPort, PortId};
use crate::region::{connect, DownstreamPeer, RegionHandle, UpstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};

/// Pushed downstream as the single element `PrefixAndTail` ever emits on
/// its main output port.
pub struct PrefixTailPair<T> {
    pub prefix: Vec<T>,
    pub tail: Arc<TailSubSource<T>>,
}

/// The tail's stand-in node: forwards every further upstream signal to its
/// own downstream, and relays `request`/`cancel` from that downstream back
/// up through the owning `PrefixAndTail`. Provably pass-through, so it
/// bypasses `NodeCore` like `Map` does (spec §4.0's `intercept = false`
/// escape hatch).
pub struct TailSubSource<T> {
    id: NodeId,
    region: Mutex<Option<Arc<RegionHandle>>>,
    neighbors: Mutex<Vec<Arc<dyn AnyNode>>>,
    terminal: AtomicBool,
    outbound: Mutex<OutboundPort>,
    downstream: Mutex<Option<DownstreamPeer<T>>>,
    relay_upstream: Box<dyn Fn(UpstreamSignal) + Send + Sync>,
}

impl<T: Send + 'static> TailSubSource<T> {
    fn new(relay_upstream: impl Fn(UpstreamSignal) + Send + Sync + 'static) -> Arc<Self> {
        let id = NodeId::next();
        Arc::new(TailSubSource {
            id,
            region: Mutex::new(None),
            neighbors: Mutex::new(Vec::new()),
            terminal: AtomicBool::new(false),
            outbound: Mutex::new(OutboundPort::unbound(id)),
            downstream: Mutex::new(None),
            relay_upstream: Box::new(relay_upstream),
        })
    }

    pub fn connect_downstream(
        self: &Arc<Self>,
        downstream_node: Arc<dyn AnyNode>,
        downstream_sink: Arc<dyn DownstreamSink<T>>,
        downstream_port: &mut InboundPort,
    ) -> crate::error::Result<()> {
        let mut outbound = self.outbound.lock();
        let (_, peer) = connect::<T>(
            Arc::clone(self) as Arc<dyn AnyNode>,
            Arc::clone(self) as Arc<dyn UpstreamSink>,
            &mut outbound,
            downstream_node,
            downstream_sink,
            downstream_port,
        )?;
        *self.downstream.lock() = Some(peer);
        Ok(())
    }

    /// Called by the owning `PrefixAndTail`'s draining state to forward a
    /// signal observed from the true upstream.
    pub(crate) fn forward(&self, signal: DownstreamSignal<T>) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        if matches!(signal, DownstreamSignal::OnComplete | DownstreamSignal::OnError(_)) {
            self.terminal.store(true, Ordering::Release);
        }
        if let Some(peer) = self.downstream.lock().as_ref() {
            peer.send(signal);
        }
    }
}

impl<T: Send + 'static> UpstreamSink for TailSubSource<T> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        if matches!(signal, UpstreamSignal::Cancel) {
            self.terminal.store(true, Ordering::Release);
        }
        (self.relay_upstream)(signal);
    }
}

impl<T: Send + 'static> AnyNode for TailSubSource<T> {
    fn id(&self) -> NodeId {
        self.id
    }
    fn kind(&self) -> NodeKind {
        NodeKind::SubSource
    }
    fn affinity(&self) -> ExecutionAffinity {
        ExecutionAffinity::Sync
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
        false
    }
    fn fire_xstart(&self) {}
    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }
    fn force_terminal(&self) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return;
        }
        (self.relay_upstream)(UpstreamSignal::Cancel);
        if let Some(peer) = self.downstream.lock().as_ref() {
            peer.send(DownstreamSignal::OnError(ElemError::from_message("region terminated after a panic")));
        }
    }
    fn neighbors(&self) -> Vec<Arc<dyn AnyNode>> {
        self.neighbors.lock().clone()
    }
    fn add_neighbor(&self, other: Arc<dyn AnyNode>) {
        self.neighbors.lock().push(other);
    }
}

enum State<T> {
    AwaitingXStart,
    Assembling { pending: u32, main_requested: bool, prefix: Vec<T> },
    AwaitingDemand { prefix: Vec<T> },
    Draining,
    Done,
}

pub enum PrefixAndTailEvent<T> {
    XStart,
    UpstreamNext(T),
    UpstreamComplete,
    UpstreamError(ElemError),
    MainRequest(u64),
    MainCancel,
    TailRequest(u64),
    TailCancel,
}

pub struct PrefixAndTailBehavior<T> {
    prefix_size: u32,
    state: State<T>,
    terminal: bool,
    upstream: Option<UpstreamPeer>,
    downstream: Option<DownstreamPeer<PrefixTailPair<T>>>,
    tail: Option<Arc<TailSubSource<T>>>,
    self_ref: Option<std::sync::Weak<NodeCore<PrefixAndTailBehavior<T>>>>,
}

impl<T: Send + 'static> PrefixAndTailBehavior<T> {
    fn send_upstream(&self, signal: UpstreamSignal) {
        if let Some(peer) = &self.upstream {
            peer.send(signal);
        }
    }

    fn emit(&mut self, prefix: Vec<T>) {
        let relay = self.self_ref.clone();
        let tail = TailSubSource::new(move |signal| {
            if let Some(core) = relay.as_ref().and_then(|w| w.upgrade()) {
                let event = match signal {
                    UpstreamSignal::Request(n) => PrefixAndTailEvent::TailRequest(n),
                    UpstreamSignal::Cancel => PrefixAndTailEvent::TailCancel,
                };
                core.dispatch(event);
            }
        });
        self.tail = Some(Arc::clone(&tail));
        if let Some(peer) = &self.downstream {
            peer.send(DownstreamSignal::OnNext(PrefixTailPair { prefix, tail }));
            peer.send(DownstreamSignal::OnComplete);
        }
        self.state = State::Draining;
    }
}

impl<T: Send + 'static> NodeBehavior for PrefixAndTailBehavior<T> {
    type Event = PrefixAndTailEvent<T>;

    fn on_event(&mut self, event: Self::Event) {
        match (std::mem::replace(&mut self.state, State::Done), event) {
            (State::AwaitingXStart, PrefixAndTailEvent::XStart) => {
                self.send_upstream(UpstreamSignal::Request(self.prefix_size as u64));
                self.state = State::Assembling {
                    pending: self.prefix_size,
                    main_requested: false,
                    prefix: Vec::with_capacity(self.prefix_size as usize),
                };
            }
            (State::Assembling { pending, main_requested, mut prefix }, PrefixAndTailEvent::UpstreamNext(elem)) => {
                prefix.push(elem);
                if pending == 1 {
                    if main_requested {
                        self.emit(prefix);
                    } else {
                        self.state = State::AwaitingDemand { prefix };
                    }
                } else {
                    self.state = State::Assembling { pending: pending - 1, main_requested, prefix };
                }
            }
            (State::Assembling { prefix, .. }, PrefixAndTailEvent::UpstreamComplete) => {
                let tail = TailSubSource::new(|_| {});
                if let Some(peer) = &self.downstream {
                    peer.send(DownstreamSignal::OnNext(PrefixTailPair { prefix, tail: Arc::clone(&tail) }));
                    peer.send(DownstreamSignal::OnComplete);
                }
                tail.forward(DownstreamSignal::OnComplete);
                self.terminal = true;
                self.state = State::Done;
            }
            (State::Assembling { prefix, .. }, PrefixAndTailEvent::UpstreamError(e)) => {
                let _ = prefix;
                if let Some(peer) = &self.downstream {
                    peer.send(DownstreamSignal::OnError(e));
                }
                self.terminal = true;
                self.state = State::Done;
            }
            (State::Assembling { pending, prefix, .. }, PrefixAndTailEvent::MainRequest(_)) => {
                self.state = State::Assembling { pending, main_requested: true, prefix };
            }
            (State::Assembling { .. }, PrefixAndTailEvent::MainCancel) => {
                self.send_upstream(UpstreamSignal::Cancel);
                self.terminal = true;
                self.state = State::Done;
            }
            (State::AwaitingDemand { prefix }, PrefixAndTailEvent::MainRequest(_)) => {
                self.emit(prefix);
            }
            (State::AwaitingDemand { .. }, PrefixAndTailEvent::MainCancel) => {
                self.send_upstream(UpstreamSignal::Cancel);
                self.terminal = true;
                self.state = State::Done;
            }
            (State::Draining, PrefixAndTailEvent::UpstreamNext(elem)) => {
                if let Some(tail) = &self.tail {
                    tail.forward(DownstreamSignal::OnNext(elem));
                }
                self.state = State::Draining;
            }
            (State::Draining, PrefixAndTailEvent::UpstreamComplete) => {
                if let Some(tail) = &self.tail {
                    tail.forward(DownstreamSignal::OnComplete);
                }
                self.terminal = true;
                self.state = State::Done;
            }
            (State::Draining, PrefixAndTailEvent::UpstreamError(e)) => {
                if let Some(tail) = &self.tail {
                    tail.forward(DownstreamSignal::OnError(e));
                }
                self.terminal = true;
                self.state = State::Done;
            }
            (State::Draining, PrefixAndTailEvent::TailRequest(n)) => {
                self.send_upstream(UpstreamSignal::Request(n));
                self.state = State::Draining;
            }
            (State::Draining, PrefixAndTailEvent::TailCancel) => {
                self.send_upstream(UpstreamSignal::Cancel);
                self.terminal = true;
                self.state = State::Done;
            }
            (other, _) => {
                // Any other combination (e.g. a late main request while
                // draining) is a no-op once the main output is already
                // complete.
                self.state = other;
            }
        }
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn xstart_event() -> Self::Event {
        PrefixAndTailEvent::XStart
    }
}

pub struct PrefixAndTail<T: Send + 'static> {
    core: Arc<NodeCore<PrefixAndTailBehavior<T>>>,
    inbound: Mutex<InboundPort>,
    outbound: Mutex<OutboundPort>,
}

impl<T: Send + 'static> PrefixAndTail<T> {
    pub fn new(prefix_size: u32) -> Arc<Self> {
        assert!(prefix_size > 0, "prefix_size must be > 0");
        let node_id = NodeId::next();
        let core = NodeCore::new(
            NodeKind::PrefixAndTail,
            ExecutionAffinity::Sync,
            true,
            PrefixAndTailBehavior {
                prefix_size,
                state: State::AwaitingXStart,
                terminal: false,
                upstream: None,
                downstream: None,
                tail: None,
                self_ref: None,
            },
        );
        core.with_behavior_mut(|b| b.self_ref = Some(Arc::downgrade(&core)));
        Arc::new(PrefixAndTail {
            core,
            inbound: Mutex::new(InboundPort::unbound(node_id)),
            outbound: Mutex::new(OutboundPort::unbound(node_id)),
        })
    }

    pub fn connect_upstream(
        self: &Arc<Self>,
        upstream_node: Arc<dyn AnyNode>,
        upstream_sink: Arc<dyn UpstreamSink>,
        upstream_port: &mut OutboundPort,
    ) -> crate::error::Result<()> {
        let mut inbound = self.inbound.lock();
        let (peer, _) = connect::<T>(
            upstream_node,
            upstream_sink,
            upstream_port,
            Arc::clone(self) as Arc<dyn AnyNode>,
            Arc::clone(self) as Arc<dyn DownstreamSink<T>>,
            &mut inbound,
        )?;
        self.core.with_behavior_mut(|b| b.upstream = Some(peer));
        Ok(())
    }

    pub fn connect_downstream(
        self: &Arc<Self>,
        downstream_node: Arc<dyn AnyNode>,
        downstream_sink: Arc<dyn DownstreamSink<PrefixTailPair<T>>>,
        downstream_port: &mut InboundPort,
    ) -> crate::error::Result<()> {
        let mut outbound = self.outbound.lock();
        let (_, peer) = connect::<PrefixTailPair<T>>(
            Arc::clone(self) as Arc<dyn AnyNode>,
            Arc::clone(self) as Arc<dyn UpstreamSink>,
            &mut outbound,
            downstream_node,
            downstream_sink,
            downstream_port,
        )?;
        self.core.with_behavior_mut(|b| b.downstream = Some(peer));
        Ok(())
    }
}

impl<T: Send + 'static> DownstreamSink<T> for PrefixAndTail<T> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
        let event = match signal {
            DownstreamSignal::OnNext(elem) => PrefixAndTailEvent::UpstreamNext(elem),
            DownstreamSignal::OnComplete => PrefixAndTailEvent::UpstreamComplete,
            DownstreamSignal::OnError(e) => PrefixAndTailEvent::UpstreamError(e),
        };
        self.core.dispatch(event);
    }
}

impl<T: Send + 'static> UpstreamSink for PrefixAndTail<T> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        let event = match signal {
            UpstreamSignal::Request(n) => PrefixAndTailEvent::MainRequest(n),
            UpstreamSignal::Cancel => PrefixAndTailEvent::MainCancel,
        };
        self.core.dispatch(event);
    }
}

delegate_any_node_to_core!(PrefixAndTail<T>, core);
