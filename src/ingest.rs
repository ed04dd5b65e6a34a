//! The frame-handler seam between the event loop and the wire protocol.
//!
//! The loop reads raw bytes and hands them to a [`FrameHandler`], which owns
//! everything protocol-shaped: HTTP parsing up to and including the upgrade,
//! protocol selection from the registry, per-frame decoding, and callback
//! invocation. [`DefaultFrameHandler`] speaks RFC 6455; replacing it swaps
//! the wire dialect without touching the multiplexer.

use crate::connection::{Connection, SessionState};
use crate::frame::{Frame, Opcode};
use crate::handshake::{self, HandshakeError, HttpRequest};
use crate::protocol::{Dispatch, ProtocolMeta, Reason};
use tracing::debug;

/// Request heads larger than this are refused outright.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// The connection has finished; the caller must destroy it and compact its
/// slot out of the table.
#[derive(Debug)]
pub struct Hangup;

/// Wire-protocol driver for accepted connections.
///
/// `ingest` is called with every chunk the loop reads. `Ok(())` means the
/// connection stays live whether or not any bytes were consumed;
/// `Err(Hangup)` means the connection is done and its slot must go.
/// Destruction delivers the `Closed` callback iff the connection reached
/// the established state, so a handler never delivers `Closed` itself.
pub trait FrameHandler: Send {
    /// Feed freshly received bytes through the connection's state machine.
    fn ingest(
        &mut self,
        conn: &mut Connection,
        cx: &mut Dispatch<'_>,
        data: &[u8],
    ) -> Result<(), Hangup>;
}

/// RFC 6455 frame handler: upgrade negotiation, frame decode, control-frame
/// replies, fragment reassembly.
#[derive(Debug, Default)]
pub struct DefaultFrameHandler;

impl FrameHandler for DefaultFrameHandler {
    fn ingest(
        &mut self,
        conn: &mut Connection,
        cx: &mut Dispatch<'_>,
        data: &[u8],
    ) -> Result<(), Hangup> {
        conn.pending_mut().extend_from_slice(data);
        if conn.state() == SessionState::Http {
            drive_handshake(conn, cx)?;
        }
        if conn.state() == SessionState::Established {
            drive_frames(conn, cx)?;
        }
        Ok(())
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn drive_handshake(conn: &mut Connection, cx: &mut Dispatch<'_>) -> Result<(), Hangup> {
    let Some(end) = head_end(conn.pending_mut()) else {
        if conn.pending_mut().len() > MAX_HEADER_BYTES {
            debug!(peer = %conn.peer_addr(), "request head too large");
            let _ = conn.send_raw(&handshake::reject_response(431, "Request Header Fields Too Large"));
            return Err(Hangup);
        }
        return Ok(());
    };

    let head = conn.pending_mut().split_to(end);
    let request = match HttpRequest::parse(&head) {
        Ok(request) => request,
        Err(error) => {
            debug!(peer = %conn.peer_addr(), %error, "malformed request head");
            let _ = conn.send_raw(&handshake::reject_response(400, "Bad Request"));
            return Err(Hangup);
        }
    };
    conn.populate_tokens(&request);

    if !request.is_upgrade() {
        debug!(peer = %conn.peer_addr(), path = %request.path, "plain http request");
        cx.deliver(conn, Reason::Http(&request.path));
        return Err(Hangup);
    }

    let names: Vec<&str> = cx.meta().iter().map(ProtocolMeta::name).collect();
    let upgrade = match handshake::negotiate(&request, &names) {
        Ok(upgrade) => upgrade,
        Err(error) => {
            debug!(peer = %conn.peer_addr(), %error, "upgrade refused");
            let (status, reason) = match error {
                HandshakeError::UnsupportedVersion(_) => (426, "Upgrade Required"),
                _ => (400, "Bad Request"),
            };
            let _ = conn.send_raw(&handshake::reject_response(status, reason));
            return Err(Hangup);
        }
    };

    let selected = upgrade.protocol.unwrap_or(0);
    let response =
        handshake::accept_response(&upgrade.accept_key, upgrade.protocol.map(|i| names[i]));
    if conn.send_raw(&response).is_err() {
        return Err(Hangup);
    }

    conn.set_revision(upgrade.version);
    conn.set_protocol_index(selected);
    conn.set_state(SessionState::Established);
    debug!(peer = %conn.peer_addr(), protocol = selected, "upgrade complete");
    cx.deliver(conn, Reason::Established);
    Ok(())
}

fn drive_frames(conn: &mut Connection, cx: &mut Dispatch<'_>) -> Result<(), Hangup> {
    loop {
        let frame = match conn.decode_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(error) => {
                debug!(peer = %conn.peer_addr(), %error, "frame decode failed");
                return Err(Hangup);
            }
        };

        match frame.opcode {
            Opcode::Ping => {
                if conn.send_frame(Frame::pong(frame.payload)).is_err() {
                    return Err(Hangup);
                }
            }
            Opcode::Pong => {}
            Opcode::Close => {
                let _ = conn.send_frame(Frame::close_echo(frame.payload));
                return Err(Hangup);
            }
            Opcode::Text | Opcode::Binary => {
                if conn.fragment_pending() {
                    debug!(peer = %conn.peer_addr(), "data frame inside fragmented message");
                    return Err(Hangup);
                }
                if frame.fin {
                    cx.deliver(conn, Reason::Receive(&frame.payload));
                } else if conn.begin_fragmented(frame.opcode, &frame.payload).is_err() {
                    return Err(Hangup);
                }
            }
            Opcode::Continuation => match conn.append_fragment(&frame.payload, frame.fin) {
                Ok(Some((_opcode, message))) => cx.deliver(conn, Reason::Receive(&message)),
                Ok(None) => {}
                Err(error) => {
                    debug!(peer = %conn.peer_addr(), %error, "fragment reassembly failed");
                    return Err(Hangup);
                }
            },
        }
    }
}
