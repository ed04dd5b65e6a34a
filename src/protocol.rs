//! Protocol registry and the callback contract.
//!
//! A server is configured with an ordered list of named protocols. Each one
//! carries a single callback that receives every event for the connections
//! bound to it; which protocol a connection binds to is decided at
//! handshake time from the `Sec-WebSocket-Protocol` header (the first
//! registered protocol is the default, and also the one that receives
//! non-upgrade HTTP requests).

use crate::broadcast::{BroadcastQueue, PaddedBuf, QueuedBroadcast, PRE_PADDING};
use crate::connection::{Connection, SessionState};
use crate::error::Error;
use crate::frame::{encode_server_header, Frame, Opcode, WsError, SERVER_HEADER_MAX};
use crate::handshake::TokenKind;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

/// Why a protocol callback is being invoked.
#[derive(Debug)]
pub enum Reason<'a> {
    /// Handshake complete; initialize per-session state.
    Established,
    /// Terminal; release per-session state. Delivered exactly once for any
    /// connection that reached the established state.
    Closed,
    /// Inbound application payload.
    Receive(&'a [u8]),
    /// A broadcast arrived for this protocol; the callback decides whether
    /// to forward it to the peer.
    Broadcast(&'a [u8]),
    /// A non-upgrade HTTP request; the value is the request path. Delivered
    /// only to the first registered protocol.
    Http(&'a str),
}

/// Payload kind for outbound writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text payload.
    Text,
    /// Binary payload.
    Binary,
}

impl MessageKind {
    fn opcode(self) -> Opcode {
        match self {
            Self::Text => Opcode::Text,
            Self::Binary => Opcode::Binary,
        }
    }
}

/// The protocol callback: one per registry entry, invoked for every event
/// on every connection bound to that protocol.
pub type Callback = Box<dyn FnMut(&mut Session<'_>, Reason<'_>) + Send>;

/// A protocol registration: a stable name plus its callback.
pub struct Protocol {
    name: String,
    callback: Callback,
}

impl Protocol {
    /// Register a protocol under `name`.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnMut(&mut Session<'_>, Reason<'_>) + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }

    /// The protocol's name, as matched against `Sec-WebSocket-Protocol`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, Callback) {
        (self.name, self.callback)
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Core-written registry metadata for one protocol.
#[derive(Debug, Clone)]
pub struct ProtocolMeta {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) ingress_port: u16,
}

impl ProtocolMeta {
    /// Protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the registry.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Loopback port of this protocol's broadcast ingress socket.
    #[must_use]
    pub fn ingress_port(&self) -> u16 {
        self.ingress_port
    }
}

/// The per-dispatch view of a connection handed to protocol callbacks.
///
/// A `Session` bundles the connection with the registry metadata and the
/// loop's broadcast queue, so a callback can answer the peer, stash
/// per-session state, and fan out broadcasts without ever touching the slot
/// table itself.
pub struct Session<'a> {
    conn: &'a mut Connection,
    meta: &'a [ProtocolMeta],
    queue: &'a mut BroadcastQueue,
}

impl<'a> Session<'a> {
    pub(crate) fn new(
        conn: &'a mut Connection,
        meta: &'a [ProtocolMeta],
        queue: &'a mut BroadcastQueue,
    ) -> Self {
        Self { conn, meta, queue }
    }

    /// Metadata of the protocol this connection is bound to.
    #[must_use]
    pub fn protocol(&self) -> &ProtocolMeta {
        &self.meta[self.conn.protocol_index()]
    }

    /// Connection lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.conn.state()
    }

    /// Peer socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Negotiated wire revision.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.conn.revision()
    }

    /// A handshake token accumulated on this connection.
    #[must_use]
    pub fn token(&self, kind: TokenKind) -> Option<&[u8]> {
        self.conn.token(kind)
    }

    /// Typed view of the per-session user data, if set and of type `T`.
    pub fn user_data<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.conn
            .user_space_mut()
            .as_mut()
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    /// Store per-session user data, replacing any previous value.
    pub fn set_user_data<T: Send + 'static>(&mut self, value: T) {
        *self.conn.user_space_mut() = Some(Box::new(value));
    }

    /// Encode and send one frame to this connection's peer.
    pub fn write(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), WsError> {
        let payload = Bytes::copy_from_slice(payload);
        let frame = match kind {
            MessageKind::Text => Frame::text(payload),
            MessageKind::Binary => Frame::binary(payload),
        };
        self.conn.send_frame(frame)
    }

    /// Send a padded payload by writing the frame header into the buffer's
    /// pre-padding region: one contiguous transport write, no payload copy.
    pub fn write_padded(&mut self, kind: MessageKind, buf: &mut PaddedBuf) -> Result<(), WsError> {
        let len = buf.len();
        let mut head = [0u8; SERVER_HEADER_MAX];
        let head_len = encode_server_header(kind.opcode(), len, &mut head);

        let raw = buf.raw_mut();
        let start = PRE_PADDING - head_len;
        raw[start..PRE_PADDING].copy_from_slice(&head[..head_len]);
        self.conn.send_raw(&raw[start..PRE_PADDING + len])?;
        Ok(())
    }

    /// Write raw bytes to the peer (HTTP fallback responses).
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.conn.send_raw(bytes)
    }

    /// Close and free this session once the current dispatch finishes: the
    /// loop sends the close through the normal destruction path, so an
    /// established connection still gets its `Closed` callback.
    pub fn close(&mut self) {
        self.conn.request_close();
    }

    /// Queue a broadcast to every established connection of this session's
    /// own protocol. Fan-out happens in slot order before the loop sleeps
    /// again.
    pub fn broadcast(&mut self, payload: PaddedBuf) {
        self.queue.push_back(QueuedBroadcast {
            protocol: self.conn.protocol_index(),
            payload,
        });
    }

    /// Queue a broadcast to the named protocol.
    pub fn broadcast_to(&mut self, protocol: &str, payload: PaddedBuf) -> Result<(), Error> {
        let meta = self
            .meta
            .iter()
            .find(|m| m.name == protocol)
            .ok_or_else(|| Error::UnknownProtocol(protocol.to_string()))?;
        self.queue.push_back(QueuedBroadcast {
            protocol: meta.index,
            payload,
        });
        Ok(())
    }
}

/// Dispatch context the loop and the frame handler use to invoke callbacks.
///
/// Borrows the callback table, the registry metadata and the broadcast
/// queue for the duration of one service step.
pub struct Dispatch<'a> {
    pub(crate) callbacks: &'a mut [Callback],
    pub(crate) meta: &'a [ProtocolMeta],
    pub(crate) queue: &'a mut BroadcastQueue,
}

impl Dispatch<'_> {
    /// Invoke the callback of the connection's bound protocol.
    pub fn deliver(&mut self, conn: &mut Connection, reason: Reason<'_>) {
        let index = conn.protocol_index();
        debug_assert!(index < self.callbacks.len());
        let callback = &mut self.callbacks[index];
        let mut session = Session::new(conn, self.meta, &mut *self.queue);
        callback(&mut session, reason);
    }

    /// Registry metadata, in registration order.
    #[must_use]
    pub fn meta(&self) -> &[ProtocolMeta] {
        self.meta
    }
}
