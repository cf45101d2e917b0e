//! # streamrt — the core of a reactive-streams processing runtime
//!
//! `streamrt` builds, seals, and executes typed dataflow graphs whose
//! nodes communicate through a demand-driven (pull/push hybrid) protocol
//! with bounded memory, back-pressure, and well-defined failure
//! propagation.
//!
//! ## Core Concepts
//!
//! ### 1. The streaming protocol
//!
//! Every edge between two nodes carries two data-plane signal families,
//! split by direction rather than modeled as one generic payload enum
//! (see [`signal`] for why): [`signal::UpstreamSignal`] (`request`/
//! `cancel`, downstream → upstream) and [`signal::DownstreamSignal`]
//! (`onNext`/`onComplete`/`onError`, upstream → downstream). `xStart` and
//! `xEvent` (region → node) are control signals each node's own behavior
//! names directly rather than routing through an edge-shaped envelope.
//!
//! ### 2. Node scaffolding and the intercept protocol
//!
//! [`node::NodeCore`] is the shared scaffolding most stateful nodes wrap
//! their behavior in: it owns the current-state value, a sealed/region
//! pointer, and the intercept buffer that lets a node safely receive a
//! signal whose own side effect calls straight back into it, without
//! recursing into its own mutable state. A handful of provably
//! pass-through nodes (`Map`, the coupling pair, a sub-source's tail)
//! bypass it entirely as a documented optimization.
//!
//! ### 3. Concrete nodes
//!
//! [`nodes`] ships the five representative stage kinds plus two ancillary
//! nodes needed to exercise them: a linear transformer ([`nodes::Map`]), a
//! buffering gate ([`nodes::PrefixAndTail`]), a fan-out
//! ([`nodes::FanOutRoundRobin`]), a fan-in flatten with bounded
//! parallelism ([`nodes::FlattenConcat`]), a feedback-cycle splice
//! ([`nodes::coupling`]), an externally-pushed producer
//! ([`nodes::PushSource`]), and a finite in-memory source used to seed
//! scenarios and tests ([`nodes::VecSource`]).
//!
//! ### 4. Region engine
//!
//! [`region::seal_and_run`] discovers every node reachable from a set of
//! roots, partitions them into regions (maximal subgraphs sharing one
//! execution — a caller thread for synchronous regions, a mailbox atop a
//! `tokio` executor for asynchronous ones), seals each, and starts it.
//! The returned [`region::RunHandle`] is already complete for a purely
//! synchronous run; otherwise `.join()` awaits every asynchronous
//! region's dispatcher.
//!
//! ## Error handling
//!
//! [`error::StreamError`] is the construction/runtime failure surface
//! (port already bound, asynchronous region with no executor, ...).
//! [`error::ElemError`] is the type-erased payload an `onError` signal
//! carries through the graph itself — kept distinct because it flows
//! through user data paths rather than being returned to the caller of
//! the region-run API. A host-level unrecoverable condition is not
//! represented by either type: it is an ordinary Rust panic, which is
//! deliberately outside the `Result`-returning surface and tears down
//! the region it occurs in.
//!
//! ## What this crate does not do
//!
//! There is no surface builder DSL (attach/fanOut/drainTo), no graph
//! rendering or introspection, no application-facing node catalog beyond
//! the representative set above, and no on-disk format, wire protocol, or
//! CLI.

pub mod error;
pub mod node;
pub mod nodes;
pub mod port;
pub mod queue;
pub mod region;
pub mod signal;

pub use error::{ElemError, Result, StreamError};
pub use node::{AnyNode, ExecutionAffinity, NodeBehavior, NodeCore, NodeId, NodeKind};
pub use port::{Direction, InboundPort, OutboundPort, PortId};
pub use region::{connect, route_via, DownstreamPeer, ExecutionMode, RegionHandle, RegionId, RunHandle, UpstreamPeer};
pub use signal::{DownstreamSignal, DownstreamSink, UpstreamSignal, UpstreamSink};

pub use nodes::{
    coupling, push_source, CouplingInlet, CouplingOutlet, FanOutRoundRobin, FlattenConcat, Map, PrefixAndTail,
    PrefixTailPair, PushSource, PushSourceHandle, SubSource, TailSubSource, VecSource,
};

/// Walk every node reachable from `roots`, partition into regions, seal,
/// and start them. See [`region::seal_and_run`] for the full contract.
pub fn seal_and_run(
    roots: Vec<std::sync::Arc<dyn AnyNode>>,
    executor: Option<tokio::runtime::Handle>,
) -> Result<RunHandle> {
    region::seal_and_run(roots, executor)
}
