//! The data-plane signal families (`request`/`cancel` and
//! `onNext`/`onComplete`/`onError`), and the trait each is received
//! through.
//!
//! `xStart` and the push-source's `xEvent`s (spec §3, §4.6) are region-to-
//! node control signals rather than edge traffic, so they are not modeled
//! here: each behavior names them directly as variants of its own
//! `NodeBehavior::Event` (see `nodes::push_source::PushSourceEvent`), and
//! `xStart` specifically is delivered through `NodeBehavior::xstart_event`
//! rather than a generic envelope, since nothing outside a node's own
//! dispatch loop ever needs to inspect one in flight.
//!
//! The data-plane protocol is split by direction rather than modeled as
//! one payload
//! enum generic over a single element type, because a stage such as `Map`
//! is upstream-facing over one element type and downstream-facing over
//! another, and those two receiving roles must be two distinct trait impls
//! to avoid Rust's coherence rules rejecting the (perfectly legal) case
//! where a caller picks the same concrete type for both, e.g. `Map<i32,
//! i32>`. `UpstreamSignal` carries no element type at all — `request`/
//! `cancel` never depend on what flows through the edge — which is exactly
//! why it can be implemented once per node regardless of how many
//! downstream ports that node has (`FanOutRoundRobin`'s many outbounds all
//! share one `UpstreamSink` impl, disambiguated by `PortId`).

use crate::port::PortId;

/// downstream → upstream. `Request(n)` requires `n > 0` (spec I1); this is
/// checked at the call site, not encoded in the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamSignal {
    Request(u64),
    Cancel,
}

/// upstream → downstream, carrying the stage's element type.
#[derive(Debug, Clone)]
pub enum DownstreamSignal<T> {
    OnNext(T),
    OnComplete,
    OnError(crate::error::ElemError),
}

/// Implemented by whatever sits upstream of a sender: it receives
/// `request`/`cancel`. A node holds `Arc<dyn UpstreamSink>` for each peer
/// that is upstream of one of its ports.
pub trait UpstreamSink: Send + Sync {
    fn handle_upstream(&self, port: PortId, signal: UpstreamSignal);
}

/// Implemented by whatever sits downstream of a sender: it receives
/// `onNext`/`onComplete`/`onError`. A node holds `Arc<dyn
/// DownstreamSink<T>>` for each peer that is downstream of one of its
/// `T`-typed ports.
pub trait DownstreamSink<T>: Send + Sync {
    fn handle_downstream(&self, port: PortId, signal: DownstreamSignal<T>);
}
