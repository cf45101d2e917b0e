//! Round-robin fan-out: ties broken by insertion order, a dead outbound is
//! skipped, upstream is asked for one element at a time only once every
//! alive outbound has demand (spec §4.3).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::delegate_any_node_to_core;
use crate::error::ElemError;
use crate::node::{ExecutionAffinity, NodeBehavior, NodeCore, NodeId, NodeKind};
use crate::port::{InboundPort, OutboundPort, PortId};
use crate::region::{connect, DownstreamPeer, UpstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};

struct OutboundSlot<T> {
    demand: u64,
    alive: bool,
    peer: Option<DownstreamPeer<T>>,
}

pub enum FanOutEvent<T> {
    UpstreamNext(T),
    UpstreamComplete,
    UpstreamError(ElemError),
    Request(usize, u64),
    Cancel(usize),
}

pub struct FanOutBehavior<T> {
    eager_cancel: bool,
    outbounds: Vec<OutboundSlot<T>>,
    cursor: usize,
    in_flight: bool,
    upstream: Option<UpstreamPeer>,
    terminal: bool,
}

impl<T: Send + 'static> FanOutBehavior<T> {
    fn alive_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.outbounds.iter().enumerate().filter(|(_, s)| s.alive).map(|(i, _)| i)
    }

    fn maybe_request_upstream(&mut self) {
        if self.in_flight || self.terminal {
            return;
        }
        let mut any_alive = false;
        let min_demand = self
            .alive_indices()
            .map(|i| {
                any_alive = true;
                self.outbounds[i].demand
            })
            .min();
        if any_alive && min_demand.unwrap_or(0) > 0 {
            if let Some(peer) = &self.upstream {
                peer.send(UpstreamSignal::Request(1));
            }
            self.in_flight = true;
        }
    }

    fn shut_down_remaining(&mut self, via: impl Fn() -> DownstreamSignal<T>) {
        for slot in &mut self.outbounds {
            if slot.alive {
                slot.alive = false;
                if let Some(peer) = &slot.peer {
                    peer.send(via());
                }
            }
        }
        self.terminal = true;
    }

    fn next_alive_after_cursor(&self) -> Option<usize> {
        let n = self.outbounds.len();
        if n == 0 {
            return None;
        }
        (1..=n).map(|offset| (self.cursor + offset) % n).find(|&i| self.outbounds[i].alive)
    }
}

impl<T: Send + 'static> NodeBehavior for FanOutBehavior<T> {
    type Event = FanOutEvent<T>;

    fn on_event(&mut self, event: Self::Event) {
        if self.terminal {
            return;
        }
        match event {
            FanOutEvent::Request(idx, n) => {
                if let Some(slot) = self.outbounds.get_mut(idx) {
                    slot.demand += n;
                }
                self.maybe_request_upstream();
            }
            FanOutEvent::Cancel(idx) => {
                if let Some(slot) = self.outbounds.get_mut(idx) {
                    slot.alive = false;
                }
                let alive_left = self.alive_indices().next().is_some();
                if !alive_left {
                    if let Some(peer) = &self.upstream {
                        peer.send(UpstreamSignal::Cancel);
                    }
                    self.terminal = true;
                } else if self.eager_cancel {
                    if let Some(peer) = &self.upstream {
                        peer.send(UpstreamSignal::Cancel);
                    }
                    self.shut_down_remaining(|| DownstreamSignal::OnComplete);
                } else {
                    // One fewer alive outbound changes the min-demand
                    // calculation; re-evaluate whether upstream can be
                    // asked for the next element.
                    self.maybe_request_upstream();
                }
            }
            FanOutEvent::UpstreamNext(elem) => {
                self.in_flight = false;
                if let Some(idx) = self.next_alive_after_cursor() {
                    self.cursor = idx;
                    let slot = &mut self.outbounds[idx];
                    slot.demand = slot.demand.saturating_sub(1);
                    if let Some(peer) = &slot.peer {
                        peer.send(DownstreamSignal::OnNext(elem));
                    }
                }
                self.maybe_request_upstream();
            }
            FanOutEvent::UpstreamComplete => {
                self.shut_down_remaining(|| DownstreamSignal::OnComplete);
            }
            FanOutEvent::UpstreamError(e) => {
                self.shut_down_remaining(move || DownstreamSignal::OnError(e.clone()));
            }
        }
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }
}

pub struct FanOutRoundRobin<T: Send + 'static> {
    core: Arc<NodeCore<FanOutBehavior<T>>>,
    inbound: Mutex<InboundPort>,
    outbound_ports: Vec<Mutex<OutboundPort>>,
}

impl<T: Send + 'static> FanOutRoundRobin<T> {
    pub fn new(eager_cancel: bool, arity: usize) -> Arc<Self> {
        assert!(arity > 0, "fan-out must have at least one outbound");
        let node_id = NodeId::next();
        let outbounds = (0..arity).map(|_| OutboundSlot { demand: 0, alive: true, peer: None }).collect();
        let core = NodeCore::new(
            NodeKind::FanOutRoundRobin,
            ExecutionAffinity::Sync,
            false,
            FanOutBehavior {
                eager_cancel,
                outbounds,
                cursor: arity - 1,
                in_flight: false,
                upstream: None,
                terminal: false,
            },
        );
        Arc::new(FanOutRoundRobin {
            core,
            inbound: Mutex::new(InboundPort::unbound(node_id)),
            outbound_ports: (0..arity).map(|_| Mutex::new(OutboundPort::unbound(node_id))).collect(),
        })
    }

    pub fn connect_upstream(
        self: &Arc<Self>,
        upstream_node: Arc<dyn crate::node::AnyNode>,
        upstream_sink: Arc<dyn UpstreamSink>,
        upstream_port: &mut OutboundPort,
    ) -> crate::error::Result<()> {
        let mut inbound = self.inbound.lock();
        let (peer, _) = connect::<T>(
            upstream_node,
            upstream_sink,
            upstream_port,
            Arc::clone(self) as Arc<dyn crate::node::AnyNode>,
            Arc::clone(self) as Arc<dyn DownstreamSink<T>>,
            &mut inbound,
        )?;
        self.core.with_behavior_mut(|b| b.upstream = Some(peer));
        Ok(())
    }

    pub fn connect_outbound(
        self: &Arc<Self>,
        index: usize,
        downstream_node: Arc<dyn crate::node::AnyNode>,
        downstream_sink: Arc<dyn DownstreamSink<T>>,
        downstream_port: &mut InboundPort,
    ) -> crate::error::Result<()> {
        let mut outbound = self.outbound_ports[index].lock();
        let (_, peer) = connect::<T>(
            Arc::clone(self) as Arc<dyn crate::node::AnyNode>,
            Arc::clone(self) as Arc<dyn UpstreamSink>,
            &mut outbound,
            downstream_node,
            downstream_sink,
            downstream_port,
        )?;
        self.core.with_behavior_mut(|b| b.outbounds[index].peer = Some(peer));
        Ok(())
    }

    /// The port id `connect_outbound` assigned to a given index, so a
    /// caller driving demand from outside (rather than through a real
    /// downstream `UpstreamSink`) can address a specific outbound on
    /// `handle_upstream`.
    pub fn outbound_port_id(&self, index: usize) -> PortId {
        self.outbound_ports[index].lock().id
    }
}

impl<T: Send + 'static> DownstreamSink<T> for FanOutRoundRobin<T> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
        let event = match signal {
            DownstreamSignal::OnNext(elem) => FanOutEvent::UpstreamNext(elem),
            DownstreamSignal::OnComplete => FanOutEvent::UpstreamComplete,
            DownstreamSignal::OnError(e) => FanOutEvent::UpstreamError(e),
        };
        self.core.dispatch(event);
    }
}

/// A single `UpstreamSink` impl serves every outbound port; the `PortId`
/// argument disambiguates which one, matching the port ids handed out by
/// `connect_outbound` in construction order.
impl<T: Send + 'static> UpstreamSink for FanOutRoundRobin<T> {
    fn handle_upstream(&self, port: PortId, signal: UpstreamSignal) {
        let index = self
            .outbound_ports
            .iter()
            .position(|p| p.lock().id == port)
            .expect("signal arrived on an unknown outbound port");
        let event = match signal {
            UpstreamSignal::Request(n) => FanOutEvent::Request(index, n),
            UpstreamSignal::Cancel => FanOutEvent::Cancel(index),
        };
        self.core.dispatch(event);
    }
}

delegate_any_node_to_core!(FanOutRoundRobin<T>, core);
