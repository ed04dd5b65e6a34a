//! Crate-level errors.
//!
//! Construction failures are fatal and surface from
//! [`ServerBuilder`](crate::ServerBuilder); everything that happens to an
//! individual connection after that is recovered locally by the loop and
//! never reaches this type.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by server construction and the event loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding the external listening socket failed.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        /// The address the bind was attempted on.
        addr: SocketAddr,
        /// The underlying socket error.
        source: io::Error,
    },

    /// Binding a protocol's loopback broadcast-ingress socket failed.
    #[error("failed to bind broadcast ingress for protocol {name:?}: {source}")]
    IngressBind {
        /// Name of the protocol whose ingress could not be bound.
        name: String,
        /// The underlying socket error.
        source: io::Error,
    },

    /// The builder was given an empty protocol registry.
    #[error("no protocols registered")]
    EmptyRegistry,

    /// A protocol name did not match any registry entry.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    /// The readiness wait failed; the loop has torn down every slot.
    #[error("listener died: {0}")]
    ListenerDead(io::Error),

    /// The event-loop thread panicked.
    #[error("event loop thread panicked")]
    LoopPanicked,

    /// TLS configuration could not be loaded or was rejected.
    #[cfg(feature = "tls")]
    #[error("tls configuration: {0}")]
    Tls(String),

    /// Any other I/O failure during construction.
    #[error(transparent)]
    Io(#[from] io::Error),
}
