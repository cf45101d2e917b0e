//! Externally-pushed producer backed by a lock-free bounded queue (spec
//! §4.6). `offer`/`complete`/`error_complete` may be called from any
//! thread; the node itself only ever runs on its region.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::delegate_any_node_to_core;
use crate::error::ElemError;
use crate::node::{ExecutionAffinity, NodeBehavior, NodeCore, NodeId, NodeKind};
use crate::port::{InboundPort, OutboundPort, PortId};
use crate::queue::GrowableQueue;
use crate::region::{connect, route_via, DownstreamPeer};
use crate::signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};

pub enum PushSourceEvent {
    Request(u64),
    Cancel,
    NewAvailable,
    Complete,
    ErrorComplete(ElemError),
}

pub struct PushSourceBehavior<T> {
    queue: Arc<GrowableQueue<T>>,
    downstream: Option<DownstreamPeer<T>>,
    downstream_demand: u64,
    completed: bool,
    terminal: bool,
    notify_on_dequeued: Arc<dyn Fn(u32) + Send + Sync>,
}

impl<T: Send + 'static> PushSourceBehavior<T> {
    fn drain(&mut self) {
        let mut dequeued: u32 = 0;
        while self.downstream_demand > 0 {
            match self.queue.pop() {
                Some(item) => {
                    self.downstream_demand -= 1;
                    dequeued += 1;
                    if let Some(peer) = &self.downstream {
                        peer.send(DownstreamSignal::OnNext(item));
                    }
                }
                None => break,
            }
        }
        if dequeued > 0 {
            (self.notify_on_dequeued)(dequeued);
        }
        if self.completed && self.queue.is_empty() && !self.terminal {
            if let Some(peer) = &self.downstream {
                peer.send(DownstreamSignal::OnComplete);
            }
            self.terminal = true;
        }
    }
}

impl<T: Send + 'static> NodeBehavior for PushSourceBehavior<T> {
    type Event = PushSourceEvent;

    fn on_event(&mut self, event: Self::Event) {
        if self.terminal {
            return;
        }
        match event {
            PushSourceEvent::Request(n) => {
                self.downstream_demand += n;
                self.drain();
            }
            PushSourceEvent::Cancel => {
                self.terminal = true;
            }
            PushSourceEvent::NewAvailable => {
                self.drain();
            }
            PushSourceEvent::Complete => {
                self.completed = true;
                self.drain();
            }
            PushSourceEvent::ErrorComplete(e) => {
                warn!(error = %e, "push_source error_complete, emitting onError downstream");
                self.drain();
                if let Some(peer) = &self.downstream {
                    peer.send(DownstreamSignal::OnError(e));
                }
                self.terminal = true;
            }
        }
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }
}

/// The graph node. Implements `UpstreamSink` (receiving `request`/`cancel`
/// from its sole downstream) and nothing else of the signal protocol — it
/// has no inbound port at all, being a pure source.
pub struct PushSource<T: Send + 'static> {
    core: Arc<NodeCore<PushSourceBehavior<T>>>,
    outbound: Mutex<OutboundPort>,
    cancel_notified: Arc<AtomicBool>,
    notify_on_cancel: Arc<dyn Fn() + Send + Sync>,
}

impl<T: Send + 'static> PushSource<T> {
    fn new_with_queue(
        queue: Arc<GrowableQueue<T>>,
        notify_on_dequeued: Arc<dyn Fn(u32) + Send + Sync>,
        cancel_notified: Arc<AtomicBool>,
        notify_on_cancel: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        let node_id = NodeId::next();
        let core = NodeCore::new(
            NodeKind::PushSource,
            ExecutionAffinity::Sync,
            false,
            PushSourceBehavior {
                queue,
                downstream: None,
                downstream_demand: 0,
                completed: false,
                terminal: false,
                notify_on_dequeued,
            },
        );
        Arc::new(PushSource {
            core,
            outbound: Mutex::new(OutboundPort::unbound(node_id)),
            cancel_notified,
            notify_on_cancel,
        })
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

impl<T: Send + 'static> UpstreamSink for PushSource<T> {
    fn handle_upstream(&self, _port: PortId, signal: UpstreamSignal) {
        match signal {
            UpstreamSignal::Request(n) => self.core.dispatch(PushSourceEvent::Request(n)),
            UpstreamSignal::Cancel => {
                // Reported unconditionally, ahead of NodeCore's terminal
                // gate: a cancel arriving after the node already went
                // terminal (e.g. raced with `complete()`) must still be
                // observed exactly once (spec §4.6).
                if !self.cancel_notified.swap(true, Ordering::AcqRel) {
                    debug!(node_id = self.core.id.raw(), "push_source observed downstream cancel");
                    (self.notify_on_cancel)();
                }
                self.core.dispatch(PushSourceEvent::Cancel);
            }
        }
    }
}

delegate_any_node_to_core!(PushSource<T>, core);

/// The public surface handed to producer threads: `offer`, `offer_many`,
/// `complete`, `error_complete`, `queue_size`, `accepts_next` (spec §6
/// point 4). Cloning is cheap — every clone shares the same queue and
/// node.
pub struct PushSourceHandle<T: Send + 'static> {
    node: Arc<PushSource<T>>,
    queue: Arc<GrowableQueue<T>>,
    notify_pending: Arc<AtomicBool>,
}

impl<T: Send + 'static> Clone for PushSourceHandle<T> {
    fn clone(&self) -> Self {
        PushSourceHandle {
            node: Arc::clone(&self.node),
            queue: Arc::clone(&self.queue),
            notify_pending: Arc::clone(&self.notify_pending),
        }
    }
}

/// Construct a `PushSource` node plus its handle. `notify_on_dequeued` may
/// be invoked from whichever thread happens to run the drain (the node's
/// own region thread, or a producer thread when `offer` triggers an
/// inline synchronous drain); `notify_on_cancel` fires at most once,
/// across any thread, even if the cancel races with `complete()`.
pub fn push_source<T: Send + 'static>(
    initial_capacity: usize,
    max_capacity: usize,
    notify_on_dequeued: impl Fn(u32) + Send + Sync + 'static,
    notify_on_cancel: impl Fn() + Send + Sync + 'static,
) -> (Arc<PushSource<T>>, PushSourceHandle<T>) {
    let queue = Arc::new(GrowableQueue::new(initial_capacity, max_capacity));
    let node = PushSource::new_with_queue(
        Arc::clone(&queue),
        Arc::new(notify_on_dequeued),
        Arc::new(AtomicBool::new(false)),
        Arc::new(notify_on_cancel),
    );
    let handle = PushSourceHandle {
        node: Arc::clone(&node),
        queue,
        notify_pending: Arc::new(AtomicBool::new(false)),
    };
    (node, handle)
}

impl<T: Send + 'static> PushSourceHandle<T> {
    /// Attempt to enqueue. Returns `false` iff the queue is at
    /// `max_capacity` (spec P6) — the element is handed back, not dropped.
    pub fn offer(&self, elem: T) -> Result<(), T> {
        self.queue.push(elem)?;
        self.signal_available();
        Ok(())
    }

    /// Enqueue greedily up to the first rejection; returns how many were
    /// accepted. Posts at most one `NewAvailable` xEvent overall.
    pub fn offer_many(&self, items: impl IntoIterator<Item = T>) -> u32 {
        let mut accepted = 0u32;
        for item in items {
            if self.queue.push(item).is_err() {
                break;
            }
            accepted += 1;
        }
        if accepted > 0 {
            self.signal_available();
        }
        accepted
    }

    pub fn complete(&self) {
        route_via(
            &(Arc::clone(&self.node) as Arc<dyn crate::node::AnyNode>),
            Box::new({
                let core = Arc::clone(&self.node.core);
                move || core.dispatch(PushSourceEvent::Complete)
            }),
        );
    }

    pub fn error_complete(&self, err: ElemError) {
        route_via(
            &(Arc::clone(&self.node) as Arc<dyn crate::node::AnyNode>),
            Box::new({
                let core = Arc::clone(&self.node.core);
                move || core.dispatch(PushSourceEvent::ErrorComplete(err))
            }),
        );
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn accepts_next(&self) -> bool {
        self.queue.accepts_next()
    }

    /// Conservative coalescing (spec §9's open question): at most one
    /// outstanding `NewAvailable` xEvent is posted at a time; the flag is
    /// cleared at the start of `drain`, so a concurrent `offer` racing
    /// with an in-progress drain always schedules exactly one follow-up.
    fn signal_available(&self) {
        if !self.notify_pending.swap(true, Ordering::AcqRel) {
            let pending = Arc::clone(&self.notify_pending);
            route_via(
                &(Arc::clone(&self.node) as Arc<dyn crate::node::AnyNode>),
                Box::new({
                    let core = Arc::clone(&self.node.core);
                    move || {
                        pending.store(false, Ordering::Release);
                        core.dispatch(PushSourceEvent::NewAvailable);
                    }
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Collector<T> {
        items: StdMutex<Vec<T>>,
    }
    impl<T: Send + 'static> DownstreamSink<T> for Collector<T> {
        fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<T>) {
            if let DownstreamSignal::OnNext(v) = signal {
                self.items.lock().unwrap().push(v);
            }
        }
    }
    impl<T: Send + 'static> crate::node::AnyNode for Collector<T> {
        fn id(&self) -> NodeId {
            NodeId::next()
        }
        fn kind(&self) -> NodeKind {
            NodeKind::SubSource
        }
        fn affinity(&self) -> ExecutionAffinity {
            ExecutionAffinity::Sync
        }
        fn seal(&self, _region: Arc<crate::region::RegionHandle>) {}
        fn region(&self) -> Option<Arc<crate::region::RegionHandle>> {
            None
        }
        fn needs_xstart(&self) -> bool {
            false
        }
        fn fire_xstart(&self) {}
        fn is_terminal(&self) -> bool {
            false
        }
        fn neighbors(&self) -> Vec<Arc<dyn crate::node::AnyNode>> {
            Vec::new()
        }
        fn add_neighbor(&self, _other: Arc<dyn crate::node::AnyNode>) {}
    }

    /// `offer` rejects exactly once the queue has grown to `max_capacity`
    /// and is full; every offer below that line is accepted (spec P6).
    #[test]
    fn offer_rejects_only_once_queue_is_genuinely_full() {
        let (node, handle) = push_source::<i32>(2, 4, |_| {}, || {});
        // No downstream demand at all, so nothing drains: every offer
        // lands straight in the queue until it tops out at max_capacity.
        assert!(handle.offer(1).is_ok());
        assert!(handle.offer(2).is_ok());
        assert!(handle.offer(3).is_ok());
        assert!(handle.offer(4).is_ok());
        assert_eq!(handle.offer(5), Err(5));
        assert_eq!(handle.queue_size(), 4);
        drop(node);
    }

    /// `notify_on_dequeued` reports exactly the number of elements a given
    /// drain actually removed, never a stale or zero count (spec P6).
    #[test]
    fn notify_on_dequeued_reports_the_actual_drained_count() {
        let dequeued_calls: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let (node, handle) = push_source::<i32>(
            2,
            4,
            {
                let dequeued_calls = Arc::clone(&dequeued_calls);
                move |n| dequeued_calls.lock().unwrap().push(n)
            },
            || {},
        );
        let collector = Arc::new(Collector { items: StdMutex::new(Vec::new()) });
        node.connect_downstream(
            Arc::clone(&collector) as Arc<dyn crate::node::AnyNode>,
            Arc::clone(&collector) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();

        // No demand yet: an offer queues the element but drains nothing.
        assert!(handle.offer(1).is_ok());
        assert!(dequeued_calls.lock().unwrap().is_empty());

        // Demand for 2, only 1 queued: drains exactly 1.
        node.handle_upstream(PortId::next(), UpstreamSignal::Request(2));
        assert_eq!(*dequeued_calls.lock().unwrap(), vec![1]);

        // Offering into standing demand drains immediately and reports 1.
        assert!(handle.offer(2).is_ok());
        assert_eq!(*dequeued_calls.lock().unwrap(), vec![1, 1]);
        assert_eq!(*collector.items.lock().unwrap(), vec![1, 2]);
    }

    /// `notify_on_cancel` fires exactly once across the node's lifetime,
    /// even if downstream signals `Cancel` more than once (spec P6/§4.6).
    #[test]
    fn notify_on_cancel_fires_exactly_once() {
        let cancels: Arc<std::sync::atomic::AtomicUsize> = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (node, _handle) = push_source::<i32>(2, 4, |_| {}, {
            let cancels = Arc::clone(&cancels);
            move || {
                cancels.fetch_add(1, Ordering::SeqCst);
            }
        });

        node.handle_upstream(PortId::next(), UpstreamSignal::Cancel);
        node.handle_upstream(PortId::next(), UpstreamSignal::Cancel);
        node.handle_upstream(PortId::next(), UpstreamSignal::Cancel);

        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
