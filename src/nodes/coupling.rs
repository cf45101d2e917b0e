//! Coupling inlet/outlet pair (spec §4.5): lets the graph builder close a
//! cycle. The inlet exposes the inbound port a user wires to whatever sits
//! upstream of the cycle; the outlet exposes the outbound port a user
//! wires to whatever sits downstream of it. Internally the inlet forwards
//! everything it receives to the outlet and vice versa — the pair behaves,
//! from the outside, like a single pass-through edge stretched across the
//! cycle's seam.
//!
//! A pure cycle of coupling nodes with no buffer on it can never issue its
//! first `request`, since neither side manufactures demand on its own
//! (spec §7's deadlock note); this module does not attempt to detect that
//! at seal time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ElemError;
use crate::node::{AnyNode, ExecutionAffinity, NodeId, NodeKind};
use crate::port::{InboundPort, OutboundPort, PortId};
use crate::region::{connect, DownstreamPeer, RegionHandle, UpstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};

pub struct CouplingInlet<T> {
    id: NodeId,
    region: Mutex<Option<Arc<RegionHandle>>>,
    neighbors: Mutex<Vec<Arc<dyn AnyNode>>>,
    terminal: AtomicBool,
    inbound: Mutex<InboundPort>,
    upstream: Mutex<Option<UpstreamPeer>>,
    to_outlet: Mutex<Option<DownstreamPeer<T>>>,
}

pub struct CouplingOutlet<T> {
    id: NodeId,
    region: Mutex<Option<Arc<RegionHandle>>>,
    neighbors: Mutex<Vec<Arc<dyn AnyNode>>>,
    terminal: AtomicBool,
    outbound: Mutex<OutboundPort>,
    downstream: Mutex<Option<DownstreamPeer<T>>>,
    to_inlet: Mutex<Option<UpstreamPeer>>,
}

/// Build a freshly linked inlet/outlet pair. Neither side is connected to
/// a user-facing peer yet — call `connect_upstream` on the inlet and
/// `connect_downstream` on the outlet to close the cycle.
pub fn coupling<T: Send + 'static>() -> (Arc<CouplingInlet<T>>, Arc<CouplingOutlet<T>>) {
    let inlet_id = NodeId::next();
    let outlet_id = NodeId::next();

    let inlet = Arc::new(CouplingInlet {
        id: inlet_id,
        region: Mutex::new(None),
        neighbors: Mutex::new(Vec::new()),
        terminal: AtomicBool::new(false),
        inbound: Mutex::new(InboundPort::unbound(inlet_id)),
        upstream: Mutex::new(None),
        to_outlet: Mutex::new(None),
    });
    let outlet = Arc::new(CouplingOutlet {
        id: outlet_id,
        region: Mutex::new(None),
        neighbors: Mutex::new(Vec::new()),
        terminal: AtomicBool::new(false),
        outbound: Mutex::new(OutboundPort::unbound(outlet_id)),
        downstream: Mutex::new(None),
        to_inlet: Mutex::new(None),
    });

    crate::node::link(&(Arc::clone(&inlet) as Arc<dyn AnyNode>), &(Arc::clone(&outlet) as Arc<dyn AnyNode>));

    let internal_port = PortId::next();
    *inlet.to_outlet.lock() = Some(DownstreamPeer::new(
        Arc::clone(&outlet) as Arc<dyn DownstreamSink<T>>,
        Arc::clone(&outlet) as Arc<dyn AnyNode>,
        internal_port,
    ));
    *outlet.to_inlet.lock() = Some(UpstreamPeer::new(
        Arc::clone(&inlet) as Arc<dyn UpstreamSink>,
        Arc::clone(&inlet) as Arc<dyn AnyNode>,
        internal_port,
    ));

    (inlet, outlet)
}

impl<T: Send + 'static> CouplingInlet<T> {
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
        *self.upstream.lock() = Some(peer);
        Ok(())
    }
}

impl<T: Send + 'static> CouplingOutlet<T> {
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
}

impl<T: Send + 'static> DownstreamSink<T> for CouplingInlet<T> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        let is_terminal_signal = matches!(signal, DownstreamSignal::OnComplete | DownstreamSignal::OnError(_));
        if is_terminal_signal {
            self.terminal.store(true, Ordering::Release);
        }
        if let Some(peer) = self.to_outlet.lock().as_ref() {
            peer.send(signal);
        }
    }
}

impl<T: Send + 'static> UpstreamSink for CouplingInlet<T> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        if matches!(signal, UpstreamSignal::Cancel) {
            self.terminal.store(true, Ordering::Release);
        }
        if let Some(peer) = self.upstream.lock().as_ref() {
            peer.send(signal);
        }
    }
}

impl<T: Send + 'static> DownstreamSink<T> for CouplingOutlet<T> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        let is_terminal_signal = matches!(signal, DownstreamSignal::OnComplete | DownstreamSignal::OnError(_));
        if is_terminal_signal {
            self.terminal.store(true, Ordering::Release);
        }
        if let Some(peer) = self.downstream.lock().as_ref() {
            peer.send(signal);
        }
    }
}

impl<T: Send + 'static> UpstreamSink for CouplingOutlet<T> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        if matches!(signal, UpstreamSignal::Cancel) {
            self.terminal.store(true, Ordering::Release);
        }
        if let Some(peer) = self.to_inlet.lock().as_ref() {
            peer.send(signal);
        }
    }
}

macro_rules! impl_any_node {
    ($ty:ident, $kind:expr, |$self_:ident| $force_terminal:block) => {
        impl<T: Send + 'static> AnyNode for $ty<T> {
            fn id(&self) -> NodeId {
                self.id
            }
            fn kind(&self) -> NodeKind {
                $kind
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
            fn force_terminal(&$self_) $force_terminal
            fn neighbors(&self) -> Vec<Arc<dyn AnyNode>> {
                self.neighbors.lock().clone()
            }
            fn add_neighbor(&self, other: Arc<dyn AnyNode>) {
                self.neighbors.lock().push(other);
            }
        }
    };
}

impl_any_node!(CouplingInlet, NodeKind::CouplingInlet, |self| {
    if self.terminal.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Some(peer) = self.upstream.lock().as_ref() {
        peer.send(UpstreamSignal::Cancel);
    }
    if let Some(peer) = self.to_outlet.lock().as_ref() {
        peer.send(DownstreamSignal::OnError(ElemError::from_message("region terminated after a panic")));
    }
});
impl_any_node!(CouplingOutlet, NodeKind::CouplingOutlet, |self| {
    if self.terminal.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Some(peer) = self.to_inlet.lock().as_ref() {
        peer.send(UpstreamSignal::Cancel);
    }
    if let Some(peer) = self.downstream.lock().as_ref() {
        peer.send(DownstreamSignal::OnError(ElemError::from_message("region terminated after a panic")));
    }
});
