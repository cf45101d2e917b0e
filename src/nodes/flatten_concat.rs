//! Stream-of-streams flatten with bounded parallelism (spec §4.4).
//!
//! Upstream delivers values that the adapter turns into sub-sources;
//! `parallelism` bounds how many sub-sources are pre-subscribed ahead of
//! the one actually being drained, never how output is ordered — output
//! is always the strict concatenation of each sub's elements in the order
//! the subs were opened.
//!
//! Receiving from the true upstream (`In`-typed) and receiving from a sub
//! (`Out`-typed) are kept as two different concrete receiver types
//! (`FlattenConcat<In, Out>` itself, and a per-sub [`SubFacade`]) rather
//! than one node implementing `DownstreamSink` twice, because Rust's
//! coherence rules reject two impls of `DownstreamSink<X>` for the same
//! type — which this node would otherwise need whenever a caller picks
//! `In == Out` (flattening a stream of streams of the same element type).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::delegate_any_node_to_core;
use crate::error::ElemError;
use crate::node::{AnyNode, ExecutionAffinity, NodeBehavior, NodeCore, NodeId, NodeKind};
use crate::port::{InboundPort, OutboundPort, PortId};
use crate::region::{connect, DownstreamPeer, UpstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};
use tracing::warn;

/// What the adapter hands back for each upstream element: a live sub-node
/// plus the means to drive and bind it. Implemented by whatever concrete
/// node type the adapter wraps (a `VecSource`, a chain of `Map`s, ...).
pub trait SubSource<Out>: Send + Sync {
    fn any_node(&self) -> Arc<dyn AnyNode>;
    fn upstream_sink(&self) -> Arc<dyn UpstreamSink>;
    /// Bind this sub's outbound port to `down_node`/`down_sink`.
    fn bind_downstream(
        &self,
        down_node: Arc<dyn AnyNode>,
        down_sink: Arc<dyn DownstreamSink<Out>>,
    ) -> crate::error::Result<()>;
}

struct SubEntry {
    id: u64,
    upstream_sink: Arc<dyn UpstreamSink>,
}

pub enum FlattenEvent<In, Out> {
    XStart,
    UpstreamNext(In),
    UpstreamComplete,
    UpstreamError(ElemError),
    SubNext(u64, Out),
    SubComplete(u64),
    SubError(u64, ElemError),
    DownstreamRequest(u64),
    DownstreamCancel,
}

pub struct FlattenBehavior<In, Out> {
    parallelism: u32,
    adapter: Box<dyn Fn(In) -> Arc<dyn SubSource<Out>> + Send + Sync>,
    subs: VecDeque<SubEntry>,
    remaining: u64,
    head_request_in_flight: bool,
    upstream_completed: bool,
    upstream: Option<UpstreamPeer>,
    downstream: Option<DownstreamPeer<Out>>,
    terminal: bool,
    next_sub_id: Arc<AtomicU64>,
    self_ref: Option<std::sync::Weak<NodeCore<FlattenBehavior<In, Out>>>>,
}

impl<In: Send + 'static, Out: Send + 'static> FlattenBehavior<In, Out> {
    fn cancel_all_subs(&self) {
        for sub in &self.subs {
            sub.upstream_sink.handle_upstream(PortId::next(), UpstreamSignal::Cancel);
        }
    }

    fn fail(&mut self, e: ElemError) {
        if self.terminal {
            return;
        }
        warn!(error = %e, "flatten_concat entering terminal error state");
        if let Some(peer) = &self.upstream {
            peer.send(UpstreamSignal::Cancel);
        }
        self.cancel_all_subs();
        if let Some(peer) = &self.downstream {
            peer.send(DownstreamSignal::OnError(e));
        }
        self.terminal = true;
    }

    fn materialize(&mut self, input: In) {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub_source = (self.adapter)(input);
        let core = match self.self_ref.as_ref().and_then(|w| w.upgrade()) {
            Some(c) => c,
            None => return,
        };
        let down_node = Arc::clone(&core) as Arc<dyn AnyNode>;
        let facade = Arc::new(SubFacade { core, sub_id });
        if let Err(_e) = sub_source.bind_downstream(down_node, facade as Arc<dyn DownstreamSink<Out>>) {
            return;
        }
        let is_new_head = self.subs.is_empty();
        self.subs.push_back(SubEntry {
            id: sub_id,
            upstream_sink: sub_source.upstream_sink(),
        });
        if is_new_head {
            self.head_request_in_flight = false;
        }
        self.forward_demand_to_head();
    }

    /// Requests exactly one element at a time from the head sub, mirroring
    /// how demand is pulled from the primary upstream — never re-announces
    /// the full outstanding `remaining` count, which would over-request a
    /// sub that already has a pending request in flight.
    fn forward_demand_to_head(&mut self) {
        if self.head_request_in_flight || self.remaining == 0 {
            return;
        }
        if let Some(head) = self.subs.front() {
            head.upstream_sink.handle_upstream(PortId::next(), UpstreamSignal::Request(1));
            self.head_request_in_flight = true;
        }
    }

    fn request_upstream_one(&self) {
        if let Some(peer) = &self.upstream {
            peer.send(UpstreamSignal::Request(1));
        }
    }
}

impl<In: Send + 'static, Out: Send + 'static> NodeBehavior for FlattenBehavior<In, Out> {
    type Event = FlattenEvent<In, Out>;

    fn on_event(&mut self, event: Self::Event) {
        if self.terminal {
            return;
        }
        match event {
            FlattenEvent::XStart => {
                for _ in 0..self.parallelism {
                    self.request_upstream_one();
                }
            }
            FlattenEvent::DownstreamRequest(n) => {
                self.remaining += n;
                self.forward_demand_to_head();
            }
            FlattenEvent::DownstreamCancel => {
                if let Some(peer) = &self.upstream {
                    peer.send(UpstreamSignal::Cancel);
                }
                self.cancel_all_subs();
                self.terminal = true;
            }
            FlattenEvent::UpstreamNext(elem) => {
                self.materialize(elem);
            }
            FlattenEvent::UpstreamComplete => {
                self.upstream_completed = true;
                if self.subs.is_empty() {
                    self.terminal = true;
                    if let Some(peer) = &self.downstream {
                        peer.send(DownstreamSignal::OnComplete);
                    }
                }
            }
            FlattenEvent::UpstreamError(e) => {
                self.fail(e);
            }
            FlattenEvent::SubNext(id, elem) => {
                if self.subs.front().map(|h| h.id) == Some(id) {
                    self.head_request_in_flight = false;
                    self.remaining = self.remaining.saturating_sub(1);
                    if let Some(peer) = &self.downstream {
                        peer.send(DownstreamSignal::OnNext(elem));
                    }
                    self.forward_demand_to_head();
                }
            }
            FlattenEvent::SubComplete(id) => {
                let is_head = self.subs.front().map(|h| h.id) == Some(id);
                self.subs.retain(|s| s.id != id);
                if is_head {
                    self.head_request_in_flight = false;
                    self.forward_demand_to_head();
                    if !self.upstream_completed {
                        self.request_upstream_one();
                    }
                }
                if self.upstream_completed && self.subs.is_empty() {
                    self.terminal = true;
                    if let Some(peer) = &self.downstream {
                        peer.send(DownstreamSignal::OnComplete);
                    }
                }
            }
            FlattenEvent::SubError(_id, e) => {
                self.fail(e);
            }
        }
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn xstart_event() -> Self::Event {
        FlattenEvent::XStart
    }
}

/// Per-sub receiver, constructed once per materialized sub-source, so it
/// can implement `DownstreamSink<Out>` without colliding with
/// `FlattenConcat<In, Out>`'s own `DownstreamSink<In>` impl.
pub struct SubFacade<In, Out> {
    core: Arc<NodeCore<FlattenBehavior<In, Out>>>,
    sub_id: u64,
}

impl<In: Send + 'static, Out: Send + 'static> DownstreamSink<Out> for SubFacade<In, Out> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<Out>) {
        let event = match signal {
            DownstreamSignal::OnNext(v) => FlattenEvent::SubNext(self.sub_id, v),
            DownstreamSignal::OnComplete => FlattenEvent::SubComplete(self.sub_id),
            DownstreamSignal::OnError(e) => FlattenEvent::SubError(self.sub_id, e),
        };
        self.core.dispatch(event);
    }
}

pub struct FlattenConcat<In: Send + 'static, Out: Send + 'static> {
    core: Arc<NodeCore<FlattenBehavior<In, Out>>>,
    inbound: Mutex<InboundPort>,
    outbound: Mutex<OutboundPort>,
}

impl<In: Send + 'static, Out: Send + 'static> FlattenConcat<In, Out> {
    pub fn new<F>(parallelism: u32, adapter: F) -> Arc<Self>
    where
        F: Fn(In) -> Arc<dyn SubSource<Out>> + Send + Sync + 'static,
    {
        assert!(parallelism > 0, "parallelism must be > 0");
        let node_id = NodeId::next();
        let core = NodeCore::new(
            NodeKind::FlattenConcat,
            ExecutionAffinity::Sync,
            true,
            FlattenBehavior {
                parallelism,
                adapter: Box::new(adapter),
                subs: VecDeque::new(),
                remaining: 0,
                head_request_in_flight: false,
                upstream_completed: false,
                upstream: None,
                downstream: None,
                terminal: false,
                next_sub_id: Arc::new(AtomicU64::new(1)),
                self_ref: None,
            },
        );
        core.with_behavior_mut(|b| b.self_ref = Some(Arc::downgrade(&core)));
        Arc::new(FlattenConcat {
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
        let (peer, _) = connect::<In>(
            upstream_node,
            upstream_sink,
            upstream_port,
            Arc::clone(self) as Arc<dyn AnyNode>,
            Arc::clone(self) as Arc<dyn DownstreamSink<In>>,
            &mut inbound,
        )?;
        self.core.with_behavior_mut(|b| b.upstream = Some(peer));
        Ok(())
    }

    pub fn connect_downstream(
        self: &Arc<Self>,
        downstream_node: Arc<dyn AnyNode>,
        downstream_sink: Arc<dyn DownstreamSink<Out>>,
        downstream_port: &mut InboundPort,
    ) -> crate::error::Result<()> {
        let mut outbound = self.outbound.lock();
        let (_, peer) = connect::<Out>(
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

impl<In: Send + 'static, Out: Send + 'static> DownstreamSink<In> for FlattenConcat<In, Out> {
    fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<In>) {
        let event = match signal {
            DownstreamSignal::OnNext(elem) => FlattenEvent::UpstreamNext(elem),
            DownstreamSignal::OnComplete => FlattenEvent::UpstreamComplete,
            DownstreamSignal::OnError(e) => FlattenEvent::UpstreamError(e),
        };
        self.core.dispatch(event);
    }
}

impl<In: Send + 'static, Out: Send + 'static> UpstreamSink for FlattenConcat<In, Out> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        let event = match signal {
            UpstreamSignal::Request(n) => FlattenEvent::DownstreamRequest(n),
            UpstreamSignal::Cancel => FlattenEvent::DownstreamCancel,
        };
        self.core.dispatch(event);
    }
}

delegate_any_node_to_core!(FlattenConcat<In, Out>, core);
