//! Per-socket connection record.
//!
//! A `Connection` is created when the external listener accepts a socket and
//! lives in exactly one slot of the loop's table. It is only ever mutated
//! from the loop's thread: the loop reads from its transport, the frame
//! handler drives its state machine, and callbacks touch it through
//! [`Session`](crate::Session).
//!
//! Lifecycle: `Http` (awaiting upgrade) → `Established` (framed traffic) →
//! `Dead` (terminal). Destruction delivers the `Closed` callback iff the
//! connection was established.

use crate::codec::{Decoder, Encoder};
use crate::frame::{Frame, FrameCodec, Opcode, WsError};
use crate::handshake::{HttpRequest, TokenKind};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

/// Wire revision assigned to a freshly accepted connection; the handshake
/// revises it from the client's `Sec-WebSocket-Version` header.
pub const DEFAULT_WIRE_REVISION: u32 = 76;

/// Largest reassembled message the fragment collector accepts.
pub const MAX_MESSAGE_SIZE: usize = FrameCodec::DEFAULT_MAX_PAYLOAD_SIZE;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Awaiting (or mid-way through) the HTTP upgrade.
    Http,
    /// Upgrade complete; framed traffic flows.
    Established,
    /// Terminal. No transition leaves this state.
    Dead,
}

/// Fixed-slot storage for accumulated handshake tokens.
#[derive(Debug, Default)]
pub struct TokenSet {
    tokens: [Option<Vec<u8>>; TokenKind::COUNT],
}

impl TokenSet {
    /// Stored bytes for `kind`, if that token was seen.
    #[must_use]
    pub fn get(&self, kind: TokenKind) -> Option<&[u8]> {
        self.tokens[kind as usize].as_deref()
    }

    /// Store the bytes for `kind`, replacing any previous value.
    pub fn set(&mut self, kind: TokenKind, value: Vec<u8>) {
        self.tokens[kind as usize] = Some(value);
    }

    /// Copy every token the request head carries into its slot.
    pub fn populate(&mut self, request: &HttpRequest) {
        self.set(TokenKind::GetUri, request.path.clone().into_bytes());
        for kind in TokenKind::ALL {
            if let Some(name) = kind.header_name() {
                if let Some(value) = request.header(name) {
                    self.set(kind, value.as_bytes().to_vec());
                }
            }
        }
    }

    /// Release every stored token buffer.
    pub fn clear(&mut self) {
        for slot in &mut self.tokens {
            *slot = None;
        }
    }
}

/// Partially reassembled fragmented message.
#[derive(Debug)]
struct Fragmented {
    opcode: Opcode,
    data: BytesMut,
}

/// Per-accepted-socket record driven by the event loop.
pub struct Connection {
    transport: Transport,
    state: SessionState,
    protocol_index: usize,
    tokens: TokenSet,
    pending: BytesMut,
    write_buf: BytesMut,
    codec: FrameCodec,
    fragments: Option<Fragmented>,
    user_space: Option<Box<dyn Any + Send>>,
    revision: u32,
    peer: SocketAddr,
    key: usize,
    close_requested: bool,
}

impl Connection {
    /// Create a connection in the `Http` state, bound to the registry head.
    #[must_use]
    pub(crate) fn new(transport: Transport, peer: SocketAddr, key: usize) -> Self {
        Self {
            transport,
            state: SessionState::Http,
            protocol_index: 0,
            tokens: TokenSet::default(),
            pending: BytesMut::with_capacity(1024),
            write_buf: BytesMut::with_capacity(1024),
            codec: FrameCodec::server(),
            fragments: None,
            user_space: None,
            revision: DEFAULT_WIRE_REVISION,
            peer,
            key,
            close_requested: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition the lifecycle state. `Dead` is terminal; a transition out
    /// of it is ignored.
    pub fn set_state(&mut self, state: SessionState) {
        if self.state != SessionState::Dead {
            self.state = state;
        }
    }

    /// Index of this connection's protocol in the registry.
    #[must_use]
    pub fn protocol_index(&self) -> usize {
        self.protocol_index
    }

    /// Rebind the connection to another registry entry (handshake time).
    pub fn set_protocol_index(&mut self, index: usize) {
        self.protocol_index = index;
    }

    /// Negotiated wire revision (76 until the handshake says otherwise).
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Record the wire revision announced by the client.
    pub fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    /// Peer socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Accumulated handshake token, by kind.
    #[must_use]
    pub fn token(&self, kind: TokenKind) -> Option<&[u8]> {
        self.tokens.get(kind)
    }

    /// Store every token the parsed request head carries.
    pub fn populate_tokens(&mut self, request: &HttpRequest) {
        self.tokens.populate(request);
    }

    /// Release all token buffers (destruction path).
    pub(crate) fn clear_tokens(&mut self) {
        self.tokens.clear();
    }

    /// The receive accumulation buffer.
    ///
    /// The loop appends freshly read bytes here; the frame handler consumes
    /// from the front.
    pub fn pending_mut(&mut self) -> &mut BytesMut {
        &mut self.pending
    }

    /// Decode the next complete frame out of the receive buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, WsError> {
        self.codec.decode(&mut self.pending)
    }

    /// Encode and write one frame through the transport.
    pub fn send_frame(&mut self, frame: Frame) -> Result<(), WsError> {
        let Self { transport, write_buf, codec, .. } = self;
        write_buf.clear();
        codec.encode(frame, write_buf)?;
        transport.write_all(write_buf)?;
        Ok(())
    }

    /// Write raw bytes through the transport (handshake responses, HTTP
    /// fallback bodies).
    pub fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.transport.write_all(bytes)
    }

    /// Start collecting a fragmented message.
    pub fn begin_fragmented(&mut self, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        if self.fragments.is_some() {
            return Err(WsError::FragmentSequence);
        }
        let mut data = BytesMut::with_capacity(payload.len());
        data.extend_from_slice(payload);
        self.fragments = Some(Fragmented { opcode, data });
        Ok(())
    }

    /// Append a continuation fragment. On the final fragment the assembled
    /// message is returned and the collector resets.
    pub fn append_fragment(
        &mut self,
        payload: &[u8],
        fin: bool,
    ) -> Result<Option<(Opcode, Bytes)>, WsError> {
        let Some(fragments) = self.fragments.as_mut() else {
            return Err(WsError::FragmentSequence);
        };
        if fragments.data.len() + payload.len() > MAX_MESSAGE_SIZE {
            return Err(WsError::PayloadTooLarge {
                size: (fragments.data.len() + payload.len()) as u64,
                max: MAX_MESSAGE_SIZE,
            });
        }
        fragments.data.extend_from_slice(payload);
        if fin {
            let done = self.fragments.take().expect("fragment state checked above");
            return Ok(Some((done.opcode, done.data.freeze())));
        }
        Ok(None)
    }

    /// True if a fragmented message is mid-assembly.
    #[must_use]
    pub fn fragment_pending(&self) -> bool {
        self.fragments.is_some()
    }

    /// The opaque per-session user-data slot.
    pub fn user_space_mut(&mut self) -> &mut Option<Box<dyn Any + Send>> {
        &mut self.user_space
    }

    /// Release the user-data slot (destruction path).
    pub(crate) fn take_user_space(&mut self) -> Option<Box<dyn Any + Send>> {
        self.user_space.take()
    }

    /// Shared access to the transport.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Ask the loop to destroy this connection once the current dispatch
    /// finishes. Idempotent; a `Dead` connection is already past it.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Whether destruction has been requested from callback context.
    #[must_use]
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Poller key this connection's socket is registered under.
    #[must_use]
    pub(crate) fn key(&self) -> usize {
        self.key
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("protocol_index", &self.protocol_index)
            .field("revision", &self.revision)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
