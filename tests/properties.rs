//! Property-based coverage (P1-P4) over the scenarios in `scenarios.rs`,
//! driven by `proptest` rather than fixed examples. P5 collapses into
//! the fixed S2/S3 scenarios (splitting always yields exactly one pair,
//! regardless of input length) and isn't re-derived here; P6/P7 are
//! colocated unit tests in `push_source.rs`/`map.rs` since they exercise
//! a single node's internal bookkeeping rather than an end-to-end graph.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use streamrt::{
    seal_and_run, AnyNode, DownstreamSink, ElemError, FanOutRoundRobin, InboundPort, Map, NodeId, OutboundPort,
    UpstreamSignal, UpstreamSink, VecSource,
};

use support::Collector;

proptest! {
    /// P1: mapping with the identity function preserves the sequence,
    /// in order, regardless of how many elements or what they are.
    #[test]
    fn p1_identity_map_preserves_sequence(xs in proptest::collection::vec(any::<i32>(), 0..64)) {
        let vs = VecSource::new(xs.clone());
        let map = Map::<i32, i32>::new(|x| Ok(x));
        let collector = Collector::<i32>::new();

        vs.connect_downstream(
            Arc::clone(&map) as Arc<dyn AnyNode>,
            Arc::clone(&map) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();
        map.connect_upstream(Arc::clone(&vs) as Arc<dyn AnyNode>, Arc::clone(&vs) as Arc<dyn UpstreamSink>, &mut OutboundPort::unbound(NodeId::next()))
            .unwrap();
        map.connect_downstream(
            Arc::clone(&collector) as Arc<dyn AnyNode>,
            Arc::clone(&collector) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();

        seal_and_run(vec![Arc::clone(&vs) as Arc<dyn AnyNode>], None).unwrap();
        map.handle_upstream(streamrt::PortId::next(), UpstreamSignal::Request(xs.len() as u64 + 1));

        prop_assert_eq!(collector.snapshot(), xs);
        prop_assert!(collector.is_completed());
    }

    /// P2: once the transform raises on one element, nothing after it is
    /// ever observed downstream, and upstream is cancelled exactly once
    /// (idempotent against any further signal).
    #[test]
    fn p2_map_user_error_truncates_and_cancels_once(
        xs in proptest::collection::vec(1i32..1000, 1..32),
        fail_at in 0usize..32,
    ) {
        let fail_at = fail_at % xs.len();
        let fail_value = xs[fail_at];

        let vs = VecSource::new(xs.clone());
        let map = Map::<i32, i32>::new(move |x| {
            if x == fail_value {
                Err(ElemError::from_message("boom"))
            } else {
                Ok(x)
            }
        });
        let collector = Collector::<i32>::new();

        vs.connect_downstream(
            Arc::clone(&map) as Arc<dyn AnyNode>,
            Arc::clone(&map) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();
        map.connect_upstream(Arc::clone(&vs) as Arc<dyn AnyNode>, Arc::clone(&vs) as Arc<dyn UpstreamSink>, &mut OutboundPort::unbound(NodeId::next()))
            .unwrap();
        map.connect_downstream(
            Arc::clone(&collector) as Arc<dyn AnyNode>,
            Arc::clone(&collector) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();

        seal_and_run(vec![Arc::clone(&vs) as Arc<dyn AnyNode>], None).unwrap();
        // VecSource drains synchronously once requested, so a single large
        // request is enough to run the whole thing to completion or failure.
        map.handle_upstream(streamrt::PortId::next(), UpstreamSignal::Request(xs.len() as u64 + 1));

        let seen = collector.snapshot();
        prop_assert!(seen.len() <= fail_at);
        prop_assert_eq!(&seen[..], &xs[..seen.len()]);
        prop_assert!(map.is_terminal());
        prop_assert!(!collector.is_completed());

        // Further signals on an already-terminal node must be no-ops, not
        // panics, and must not re-deliver the error.
        map.handle_upstream(streamrt::PortId::next(), UpstreamSignal::Cancel);
        map.handle_downstream(streamrt::PortId::next(), streamrt::DownstreamSignal::OnNext(fail_value));
        prop_assert_eq!(collector.snapshot().len(), seen.len());
    }
}

/// P3: round-robin fan-out delivers every element to exactly one
/// outbound, in insertion order, conserving the total count — checked
/// across a range of source sizes and outbound arities rather than a
/// single fixed shape (the `s4_*` scenario in `scenarios.rs` covers one
/// concrete instance of this end-to-end).
#[test]
fn p3_fanout_conserves_and_round_robins_for_several_shapes() {
    for (len, arity) in [(1usize, 1usize), (2, 3), (7, 2), (9, 3), (10, 4), (20, 5)] {
        let vs = VecSource::new(1..=(len as i32));
        let fanout = FanOutRoundRobin::<i32>::new(false, arity);
        let collectors: Vec<Arc<Collector<i32>>> = (0..arity).map(|_| Collector::<i32>::new()).collect();

        vs.connect_downstream(
            Arc::clone(&fanout) as Arc<dyn AnyNode>,
            Arc::clone(&fanout) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();
        fanout
            .connect_upstream(Arc::clone(&vs) as Arc<dyn AnyNode>, Arc::clone(&vs) as Arc<dyn UpstreamSink>, &mut OutboundPort::unbound(NodeId::next()))
            .unwrap();
        for (i, c) in collectors.iter().enumerate() {
            fanout
                .connect_outbound(
                    i,
                    Arc::clone(c) as Arc<dyn AnyNode>,
                    Arc::clone(c) as Arc<dyn DownstreamSink<i32>>,
                    &mut InboundPort::unbound(NodeId::next()),
                )
                .unwrap();
        }

        seal_and_run(vec![Arc::clone(&vs) as Arc<dyn AnyNode>], None).unwrap();
        for i in 0..arity {
            let port_id = fanout.outbound_port_id(i);
            fanout.handle_upstream(port_id, UpstreamSignal::Request(len as u64));
        }

        let mut all: Vec<i32> = Vec::new();
        for c in &collectors {
            all.extend(c.snapshot());
        }
        all.sort_unstable();
        let expected: Vec<i32> = (1..=(len as i32)).collect();
        assert_eq!(all, expected, "len={len} arity={arity}: every element delivered exactly once");

        // Insertion order, round-robin: outbound i gets elements at
        // positions i, i+arity, i+2*arity, ... (1-indexed source values).
        for (i, c) in collectors.iter().enumerate() {
            let expected_i: Vec<i32> = (1..=(len as i32)).filter(|v| (*v as usize - 1) % arity == i).collect();
            assert_eq!(c.snapshot(), expected_i, "len={len} arity={arity} outbound={i}");
        }
    }
}

/// P4: `FlattenConcat` concatenates sub-sources strictly in the order
/// they were materialized, and never holds more than `parallelism`
/// subs open (bound-subscribed) at once.
#[test]
fn p4_flatten_concat_orders_output_and_bounds_open_subs() {
    use std::sync::Mutex as StdMutex;

    use streamrt::{DownstreamSignal, FlattenConcat, PortId, SubSource};

    // Wraps the sink a sub-source is actually bound to: forwards every
    // signal unchanged, but decrements `open_count` the moment that one
    // sub reports its own completion/error — independent of when (or
    // whether) the aggregated output downstream of `FlattenConcat` itself
    // completes.
    struct CountingSink {
        inner: Arc<dyn DownstreamSink<i32>>,
        open_count: Arc<AtomicUsize>,
    }
    impl DownstreamSink<i32> for CountingSink {
        fn handle_downstream(&self, port: PortId, signal: DownstreamSignal<i32>) {
            let closes = matches!(&signal, DownstreamSignal::OnComplete | DownstreamSignal::OnError(_));
            self.inner.handle_downstream(port, signal);
            if closes {
                self.open_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    struct TrackedVecSource {
        inner: Arc<VecSource<i32>>,
        open_count: Arc<AtomicUsize>,
        max_open: Arc<AtomicUsize>,
    }

    impl SubSource<i32> for TrackedVecSource {
        fn any_node(&self) -> Arc<dyn AnyNode> {
            Arc::clone(&self.inner) as Arc<dyn AnyNode>
        }
        fn upstream_sink(&self) -> Arc<dyn UpstreamSink> {
            Arc::clone(&self.inner) as Arc<dyn UpstreamSink>
        }
        fn bind_downstream(&self, down_node: Arc<dyn AnyNode>, down_sink: Arc<dyn DownstreamSink<i32>>) -> streamrt::Result<()> {
            self.open_count.fetch_add(1, Ordering::SeqCst);
            let current = self.open_count.load(Ordering::SeqCst);
            self.max_open.fetch_max(current, Ordering::SeqCst);
            let wrapped = Arc::new(CountingSink {
                inner: down_sink,
                open_count: Arc::clone(&self.open_count),
            }) as Arc<dyn DownstreamSink<i32>>;
            let mut port = InboundPort::unbound(NodeId::next());
            self.inner.connect_downstream(down_node, wrapped, &mut port)
        }
    }

    struct PlainCollector {
        items: StdMutex<Vec<i32>>,
    }
    impl DownstreamSink<i32> for PlainCollector {
        fn handle_downstream(&self, _port: PortId, signal: DownstreamSignal<i32>) {
            if let DownstreamSignal::OnNext(v) = signal {
                self.items.lock().unwrap().push(v);
            }
        }
    }
    impl AnyNode for PlainCollector {
        fn id(&self) -> NodeId {
            NodeId::next()
        }
        fn kind(&self) -> streamrt::NodeKind {
            streamrt::NodeKind::SubSource
        }
        fn affinity(&self) -> streamrt::ExecutionAffinity {
            streamrt::ExecutionAffinity::Sync
        }
        fn seal(&self, _region: Arc<streamrt::RegionHandle>) {}
        fn region(&self) -> Option<Arc<streamrt::RegionHandle>> {
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

    let open_count = Arc::new(AtomicUsize::new(0));
    let max_open = Arc::new(AtomicUsize::new(0));
    let groups = vec![vec![1, 2], vec![3], vec![4, 5, 6], vec![7, 8]];
    let parallelism = 2;

    let flatten: Arc<FlattenConcat<Vec<i32>, i32>> = {
        let open_count = Arc::clone(&open_count);
        let max_open = Arc::clone(&max_open);
        FlattenConcat::new(parallelism, move |v: Vec<i32>| {
            Arc::new(TrackedVecSource {
                inner: VecSource::new(v),
                open_count: Arc::clone(&open_count),
                max_open: Arc::clone(&max_open),
            }) as Arc<dyn SubSource<i32>>
        })
    };

    let vs = VecSource::new(groups);
    let collector = Arc::new(PlainCollector { items: StdMutex::new(Vec::new()) });

    vs.connect_downstream(
        Arc::clone(&flatten) as Arc<dyn AnyNode>,
        Arc::clone(&flatten) as Arc<dyn DownstreamSink<Vec<i32>>>,
        &mut InboundPort::unbound(NodeId::next()),
    )
    .unwrap();
    flatten
        .connect_upstream(Arc::clone(&vs) as Arc<dyn AnyNode>, Arc::clone(&vs) as Arc<dyn UpstreamSink>, &mut OutboundPort::unbound(NodeId::next()))
        .unwrap();
    flatten
        .connect_downstream(
            Arc::clone(&collector) as Arc<dyn AnyNode>,
            Arc::clone(&collector) as Arc<dyn DownstreamSink<i32>>,
            &mut InboundPort::unbound(NodeId::next()),
        )
        .unwrap();

    // FlattenConcat needs xStart (it pre-subscribes `parallelism` subs);
    // seal_and_run fires it, then downstream demand drains the rest.
    seal_and_run(vec![Arc::clone(&vs) as Arc<dyn AnyNode>], None).unwrap();
    flatten.handle_upstream(streamrt::PortId::next(), UpstreamSignal::Request(100));

    assert_eq!(collector.items.lock().unwrap().clone(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(max_open.load(Ordering::SeqCst) as u32 <= parallelism);
}
