//! Typed directional port handles bound pairwise during graph build.
//!
//! A port is thin: it carries the peer node's id (for routing) and a
//! process-wide unique identifier used to disambiguate which upstream fed
//! an `onNext` into a fan-in, or which outbound a fan-out should route to
//! next.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::NodeId;

/// A process-wide unique port identifier, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

impl PortId {
    pub(crate) fn next() -> Self {
        PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Direction a port carries data in, relative to the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Receives `onNext`/`onComplete`/`onError` from upstream; sends
    /// `request`/`cancel` to upstream.
    Inbound,
    /// Sends `onNext`/`onComplete`/`onError` downstream; receives
    /// `request`/`cancel` from downstream.
    Outbound,
}

/// An inbound port owned by exactly one node, bound to exactly one peer
/// outbound port.
#[derive(Debug, Clone, Copy)]
pub struct InboundPort {
    pub id: PortId,
    pub owner: NodeId,
    pub peer: Option<(NodeId, PortId)>,
}

/// An outbound port owned by exactly one node, bound to exactly one peer
/// inbound port.
#[derive(Debug, Clone, Copy)]
pub struct OutboundPort {
    pub id: PortId,
    pub owner: NodeId,
    pub peer: Option<(NodeId, PortId)>,
}

impl InboundPort {
    pub fn unbound(owner: NodeId) -> Self {
        InboundPort {
            id: PortId::next(),
            owner,
            peer: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.peer.is_some()
    }
}

impl OutboundPort {
    pub fn unbound(owner: NodeId) -> Self {
        OutboundPort {
            id: PortId::next(),
            owner,
            peer: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.peer.is_some()
    }
}

/// Bind an outbound port to an inbound port. Fails if either side is
/// already bound (spec §6 "failing if already bound").
pub fn bind(
    out: &mut OutboundPort,
    inn: &mut InboundPort,
) -> crate::error::Result<()> {
    if out.is_bound() || inn.is_bound() {
        return Err(crate::error::StreamError::Validation(
            "port already bound".to_string(),
        ));
    }
    out.peer = Some((inn.owner, inn.id));
    inn.peer = Some((out.owner, out.id));
    Ok(())
}
