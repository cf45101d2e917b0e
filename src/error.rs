//! Error types for node and region failure.
//!
//! This module defines the taxonomy from the runtime's error-handling design:
//! a `UserError` (a callback raised), a `ProtocolError` (an invariant of the
//! streaming protocol was observed to fail), a `ResourceError` (a downstream
//! resource failed on signal), and `Fatal` conditions which are not
//! represented here at all — they are not caught, and tear down the region
//! via an ordinary Rust panic.
//!
//! Every non-fatal variant carries the id and kind of the node that
//! observed the failure, so that a post-mortem report can name exactly
//! which stage failed and why.

use std::fmt;

use crate::node::{NodeId, NodeKind};

/// Result alias used throughout the crate.
pub type Result<T> = ::std::result::Result<T, StreamError>;

/// The error surface exposed to callers of the node-construction,
/// port-binding, and region-seal/run APIs (see spec §6).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A user-supplied callback (e.g. `Map`'s transform function) raised.
    #[error("node {node_id:?} ({node_kind:?}) user callback failed: {message}")]
    User {
        node_id: NodeId,
        node_kind: NodeKind,
        message: String,
    },

    /// An invariant of the streaming protocol was violated: demand went
    /// negative, an `onNext` arrived after `onComplete`, a signal arrived
    /// on an already-terminal edge, and so on.
    ///
    /// Treated the same as [`StreamError::User`] for recovery purposes, but
    /// flagged separately so a test harness can reject the run outright
    /// rather than accepting it as ordinary application failure.
    #[error("node {node_id:?} ({node_kind:?}) protocol violation: {message}")]
    Protocol {
        node_id: NodeId,
        node_kind: NodeKind,
        message: String,
    },

    /// A downstream resource (a sink, an external queue) failed while
    /// being signaled.
    #[error("node {node_id:?} ({node_kind:?}) downstream resource failed: {message}")]
    Resource {
        node_id: NodeId,
        node_kind: NodeKind,
        message: String,
    },

    /// A port-binding or construction precondition was violated (e.g. a
    /// port was already bound, or a parameter failed validation).
    #[error("{0}")]
    Validation(String),
}

impl StreamError {
    pub fn user(node_id: NodeId, node_kind: NodeKind, message: impl Into<String>) -> Self {
        StreamError::User {
            node_id,
            node_kind,
            message: message.into(),
        }
    }

    pub fn protocol(node_id: NodeId, node_kind: NodeKind, message: impl Into<String>) -> Self {
        StreamError::Protocol {
            node_id,
            node_kind,
            message: message.into(),
        }
    }

    pub fn resource(node_id: NodeId, node_kind: NodeKind, message: impl Into<String>) -> Self {
        StreamError::Resource {
            node_id,
            node_kind,
            message: message.into(),
        }
    }

    /// The node this error originated from, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            StreamError::User { node_id, .. }
            | StreamError::Protocol { node_id, .. }
            | StreamError::Resource { node_id, .. } => Some(*node_id),
            StreamError::Validation(_) => None,
        }
    }

    /// True for errors the testkit harness (outside this crate) should
    /// treat as an invariant breach rather than ordinary application
    /// failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, StreamError::Protocol { .. })
    }
}

/// Shared causes an `onError` signal may carry downstream. Kept separate
/// from [`StreamError`] because `onError(e)` payloads are user data that
/// flows through the graph, while `StreamError` is the construction/runtime
/// failure surface returned to the caller of the region-run API.
#[derive(Debug, Clone)]
pub struct ElemError(std::sync::Arc<dyn std::error::Error + Send + Sync + 'static>);

impl ElemError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ElemError(std::sync::Arc::new(err))
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Msg(String);
        impl fmt::Display for Msg {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl std::error::Error for Msg {}
        ElemError(std::sync::Arc::new(Msg(message.into())))
    }
}

impl fmt::Display for ElemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
