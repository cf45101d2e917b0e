//! A finite, in-memory, demand-driven source over a `Vec<T>`.
//!
//! Not one of the specification's five representative node kinds — it
//! exists to seed the end-to-end scenarios (spec §8's S1–S6) and
//! `FlattenConcat`'s adapter in tests with something concrete to pull
//! from, the way a reactive-streams test suite typically ships a
//! `fromIterable` source alongside its real stages.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::delegate_any_node_to_core;
use crate::node::{ExecutionAffinity, NodeBehavior, NodeCore, NodeId, NodeKind};
use crate::port::{InboundPort, PortId};
use crate::region::{connect, DownstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};

pub enum VecSourceEvent {
    Request(u64),
    Cancel,
}

pub struct VecSourceBehavior<T> {
    items: VecDeque<T>,
    demand: u64,
    downstream: Option<DownstreamPeer<T>>,
    terminal: bool,
}

impl<T: Send + 'static> VecSourceBehavior<T> {
    fn drain(&mut self) {
        while self.demand > 0 {
            match self.items.pop_front() {
                Some(item) => {
                    self.demand -= 1;
                    if let Some(peer) = &self.downstream {
                        peer.send(DownstreamSignal::OnNext(item));
                    }
                }
                None => break,
            }
        }
        if self.items.is_empty() && !self.terminal {
            if let Some(peer) = &self.downstream {
                peer.send(DownstreamSignal::OnComplete);
            }
            self.terminal = true;
        }
    }
}

impl<T: Send + 'static> NodeBehavior for VecSourceBehavior<T> {
    type Event = VecSourceEvent;

    fn on_event(&mut self, event: Self::Event) {
        if self.terminal {
            return;
        }
        match event {
            VecSourceEvent::Request(n) => {
                self.demand += n;
                self.drain();
            }
            VecSourceEvent::Cancel => {
                self.terminal = true;
            }
        }
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }
}

pub struct VecSource<T: Send + 'static> {
    core: Arc<NodeCore<VecSourceBehavior<T>>>,
    outbound: Mutex<crate::port::OutboundPort>,
}

impl<T: Send + 'static> VecSource<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Arc<Self> {
        let node_id = NodeId::next();
        let core = NodeCore::new(
            NodeKind::VecSource,
            ExecutionAffinity::Sync,
            false,
            VecSourceBehavior {
                items: items.into_iter().collect(),
                demand: 0,
                downstream: None,
                terminal: false,
            },
        );
        Arc::new(VecSource { core, outbound: Mutex::new(crate::port::OutboundPort::unbound(node_id)) })
    }

    pub fn connect_downstream(
        self: &Arc<Self>,
        downstream_node: Arc<dyn crate::node::AnyNode>,
        downstream_sink: Arc<dyn DownstreamSink<T>>,
        downstream_port: &mut InboundPort,
    ) -> crate::error::Result<()> {
        let mut outbound = self.outbound.lock();
        let (_, peer) = connect::<T>(
            Arc::clone(self) as Arc<dyn crate::node::AnyNode>,
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

impl<T: Send + 'static> UpstreamSink for VecSource<T> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        let event = match signal {
            UpstreamSignal::Request(n) => VecSourceEvent::Request(n),
            UpstreamSignal::Cancel => VecSourceEvent::Cancel,
        };
        self.core.dispatch(event);
    }
}

delegate_any_node_to_core!(VecSource<T>, core);
