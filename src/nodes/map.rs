//! Linear transformer: one state, pass-through, intercept disabled (spec
//! §4.1).
//!
//! `Map` is the one node in the representative set that bypasses
//! [`NodeCore`]: it is provably stateless across calls (the only mutable
//! bit is the terminal flag, which is idempotent to set twice) and holds
//! no accumulator a reentrant call could corrupt. Dispatch is a direct,
//! possibly-recursive method call straight through — exactly the
//! `intercept = false` escape hatch spec §4.0 describes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ElemError;
use crate::node::{AnyNode, ExecutionAffinity, NodeId, NodeKind};
use crate::port::{InboundPort, OutboundPort, PortId};
use crate::region::{connect, DownstreamPeer, RegionHandle, UpstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};
use tracing::warn;

/// `f: T -> Result<U, ElemError>`. A `Result` return (rather than a
/// panicking closure) is how a user transform reports the "user exception"
/// branch of spec §4.1 without relying on unwinding.
pub struct Map<T, U> {
    id: NodeId,
    region: Mutex<Option<Arc<RegionHandle>>>,
    neighbors: Mutex<Vec<Arc<dyn AnyNode>>>,
    terminal: AtomicBool,
    inbound: Mutex<InboundPort>,
    outbound: Mutex<OutboundPort>,
    upstream: Mutex<Option<UpstreamPeer>>,
    downstream: Mutex<Option<DownstreamPeer<U>>>,
    transform: Box<dyn Fn(T) -> Result<U, ElemError> + Send + Sync>,
}

impl<T: Send + 'static, U: Send + 'static> Map<T, U> {
    pub fn new<F>(transform: F) -> Arc<Self>
    where
        F: Fn(T) -> Result<U, ElemError> + Send + Sync + 'static,
    {
        let id = NodeId::next();
        Arc::new(Map {
            id,
            region: Mutex::new(None),
            neighbors: Mutex::new(Vec::new()),
            terminal: AtomicBool::new(false),
            inbound: Mutex::new(InboundPort::unbound(id)),
            outbound: Mutex::new(OutboundPort::unbound(id)),
            upstream: Mutex::new(None),
            downstream: Mutex::new(None),
            transform: Box::new(transform),
        })
    }

    /// Bind `self`'s inbound port to `upstream`'s outbound port.
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

    /// Bind `self`'s outbound port to `downstream`'s inbound port.
    pub fn connect_downstream(
        self: &Arc<Self>,
        downstream_node: Arc<dyn AnyNode>,
        downstream_sink: Arc<dyn DownstreamSink<U>>,
        downstream_port: &mut InboundPort,
    ) -> crate::error::Result<()> {
        let mut outbound = self.outbound.lock();
        let (_, peer) = connect::<U>(
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

    fn fail(&self, e: ElemError) {
        if self.terminal.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(node_id = self.id.raw(), error = %e, "map transform raised, cancelling upstream");
        if let Some(peer) = self.upstream.lock().as_ref() {
            peer.send(UpstreamSignal::Cancel);
        }
        if let Some(peer) = self.downstream.lock().as_ref() {
            peer.send(DownstreamSignal::OnError(e));
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> DownstreamSink<T> for Map<T, U> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        match signal {
            DownstreamSignal::OnNext(elem) => match (self.transform)(elem) {
                Ok(out) => {
                    if let Some(peer) = self.downstream.lock().as_ref() {
                        peer.send(DownstreamSignal::OnNext(out));
                    }
                }
                Err(e) => self.fail(e),
            },
            DownstreamSignal::OnComplete => {
                if !self.terminal.swap(true, Ordering::AcqRel) {
                    if let Some(peer) = self.downstream.lock().as_ref() {
                        peer.send(DownstreamSignal::OnComplete);
                    }
                }
            }
            DownstreamSignal::OnError(e) => {
                if !self.terminal.swap(true, Ordering::AcqRel) {
                    if let Some(peer) = self.downstream.lock().as_ref() {
                        peer.send(DownstreamSignal::OnError(e));
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> UpstreamSink for Map<T, U> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        if self.terminal.load(Ordering::Acquire) {
            return;
        }
        match signal {
            UpstreamSignal::Request(n) => {
                if let Some(peer) = self.upstream.lock().as_ref() {
                    peer.send(UpstreamSignal::Request(n));
                }
            }
            UpstreamSignal::Cancel => {
                if !self.terminal.swap(true, Ordering::AcqRel) {
                    if let Some(peer) = self.upstream.lock().as_ref() {
                        peer.send(UpstreamSignal::Cancel);
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> AnyNode for Map<T, U> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Map
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
        self.fail(ElemError::from_message("region terminated after a panic"));
    }

    fn neighbors(&self) -> Vec<Arc<dyn AnyNode>> {
        self.neighbors.lock().clone()
    }

    fn add_neighbor(&self, other: Arc<dyn AnyNode>) {
        self.neighbors.lock().push(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_user_error_terminates_and_ignores_further_signals() {
        let map: Arc<Map<i32, i32>> = Map::new(|x| {
            if x == 2 {
                Err(ElemError::from_message("boom"))
            } else {
                Ok(x + 1)
            }
        });
        let p = PortId::next();
        map.handle_downstream(p, DownstreamSignal::OnNext(1));
        assert!(!map.is_terminal());
        map.handle_downstream(p, DownstreamSignal::OnNext(2));
        assert!(map.is_terminal());
        // Further signals are silently ignored once terminal (no downstream
        // peer wired here, so a panic would mean this branch wasn't guarded).
        map.handle_downstream(p, DownstreamSignal::OnNext(3));
    }

    #[test]
    fn passes_through_values_unchanged_for_identity() {
        use std::sync::Mutex as StdMutex;

        struct Collector(StdMutex<Vec<i32>>);
        impl DownstreamSink<i32> for Collector {
            fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<i32>) {
                if let DownstreamSignal::OnNext(v) = signal {
                    self.0.lock().unwrap().push(v);
                }
            }
        }
        impl AnyNode for Collector {
            fn id(&self) -> NodeId {
                NodeId::next()
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

        let map: Arc<Map<i32, i32>> = Map::new(|x| Ok(x));
        let collector = Arc::new(Collector(StdMutex::new(Vec::new())));
        let mut downstream_port = InboundPort::unbound(NodeId::next());
        map.connect_downstream(
            Arc::clone(&collector) as Arc<dyn AnyNode>,
            Arc::clone(&collector) as Arc<dyn DownstreamSink<i32>>,
            &mut downstream_port,
        )
        .unwrap();

        let p = PortId::next();
        for v in [1, 2, 3] {
            map.handle_downstream(p, DownstreamSignal::OnNext(v));
        }
        assert_eq!(*collector.0.lock().unwrap(), vec![1, 2, 3]);
    }

    /// A cancel injected at the downstream end of a chain of `Map` nodes
    /// reaches the original source, each link going terminal exactly once
    /// along the way (spec P7).
    #[test]
    fn cancel_travels_through_a_chain_to_the_source() {
        use crate::nodes::vec_source::VecSource;

        let source = VecSource::new(0..100);
        let m1: Arc<Map<i32, i32>> = Map::new(|x| Ok(x));
        let m2: Arc<Map<i32, i32>> = Map::new(|x| Ok(x));
        let m3: Arc<Map<i32, i32>> = Map::new(|x| Ok(x));

        source
            .connect_downstream(
                Arc::clone(&m1) as Arc<dyn AnyNode>,
                Arc::clone(&m1) as Arc<dyn DownstreamSink<i32>>,
                &mut InboundPort::unbound(NodeId::next()),
            )
            .unwrap();
        m1.connect_upstream(
            Arc::clone(&source) as Arc<dyn AnyNode>,
            Arc::clone(&source) as Arc<dyn UpstreamSink>,
            &mut OutboundPort::unbound(NodeId::next()),
        )
        .unwrap();
        m1.connect_downstream(
            Arc::clone(&m2) as Arc<dyn AnyNode>,
            Arc::clone(&m2) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();
        m2.connect_upstream(Arc::clone(&m1) as Arc<dyn AnyNode>, Arc::clone(&m1) as Arc<dyn UpstreamSink>, &mut OutboundPort::unbound(NodeId::next()))
            .unwrap();
        m2.connect_downstream(
            Arc::clone(&m3) as Arc<dyn AnyNode>,
            Arc::clone(&m3) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();
        m3.connect_upstream(Arc::clone(&m2) as Arc<dyn AnyNode>, Arc::clone(&m2) as Arc<dyn UpstreamSink>, &mut OutboundPort::unbound(NodeId::next()))
            .unwrap();

        assert!(!source.is_terminal());
        // Simulates the chain's final consumer cancelling; nothing else in
        // this test ever calls `handle_upstream` on `m1`/`m2` directly, so
        // reaching `source.is_terminal()` can only happen via propagation.
        m3.handle_upstream(PortId::next(), UpstreamSignal::Cancel);

        assert!(m3.is_terminal());
        assert!(m2.is_terminal());
        assert!(m1.is_terminal());
        assert!(source.is_terminal());

        // A second cancel on the now-terminal head of the chain must not
        // panic or re-propagate.
        m3.handle_upstream(PortId::next(), UpstreamSignal::Cancel);
    }
}
