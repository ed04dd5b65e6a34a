//! wsmux: a small, embeddable WebSocket server core.
//!
//! # Overview
//!
//! wsmux multiplexes three kinds of sockets in one single-threaded
//! cooperative loop: an external listening socket, one loopback
//! broadcast-ingress socket per registered protocol, and the population of
//! live client connections. Accepted sockets are driven through a
//! handshake-then-frames lifecycle and dispatched to user-supplied protocol
//! callbacks.
//!
//! # Core Guarantees
//!
//! - **Single mutator**: every mutation of the slot table and connection
//!   state happens on the loop's own thread. Cross-context broadcasts
//!   traverse the kernel's loopback FIFO, which is the only serialization
//!   point the design needs.
//! - **Orderly teardown**: a connection that ever reached the established
//!   state receives its `Closed` callback exactly once, on destruction,
//!   whatever the destruction path.
//! - **Order-preserving compaction**: removing a slot shifts the survivors
//!   down without reordering them.
//!
//! # Module Structure
//!
//! - [`server`]: builder, context construction, and the spawned [`Server`] handle
//! - [`event_loop`]: the slot table and the readiness multiplexer
//! - [`protocol`]: protocol registry, callback contract, per-session context
//! - [`connection`]: per-socket record and its lifecycle state machine
//! - [`broadcast`]: padded payload buffers and the external broadcast writer
//! - [`ingest`]: the frame-handler seam and the default RFC 6455 implementation
//! - [`handshake`]: HTTP upgrade parsing and accept-key computation
//! - [`frame`]: WebSocket frame codec
//! - [`transport`]: plain-TCP / TLS transport abstraction
//!
//! # Example
//!
//! ```no_run
//! use wsmux::{Protocol, Reason, ServerBuilder};
//!
//! let echo = Protocol::new("echo", |session, reason| {
//!     if let Reason::Receive(payload) = reason {
//!         let payload = payload.to_vec();
//!         let _ = session.write(wsmux::MessageKind::Text, &payload);
//!     }
//! });
//!
//! let server = ServerBuilder::new().port(8080).protocol(echo).spawn().unwrap();
//! println!("listening on {}", server.local_addr());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod broadcast;
pub mod codec;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod frame;
pub mod handshake;
pub mod ingest;
pub mod protocol;
pub mod server;
pub mod transport;

pub use broadcast::{Broadcaster, PaddedBuf, MAX_BROADCAST_PAYLOAD, POST_PADDING, PRE_PADDING};
pub use connection::{Connection, SessionState};
pub use error::Error;
pub use event_loop::{EventLoop, Turn};
pub use frame::{Frame, FrameCodec, Opcode, WsError};
pub use handshake::TokenKind;
pub use ingest::{DefaultFrameHandler, FrameHandler, Hangup};
pub use protocol::{Callback, Dispatch, MessageKind, Protocol, ProtocolMeta, Reason, Session};
pub use server::{Server, ServerBuilder, MAX_CLIENTS};
