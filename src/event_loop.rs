//! The readiness multiplexer.
//!
//! One loop services three kinds of slots: the external listener at index 0,
//! one broadcast-ingress listener per protocol at indices
//! `1..=count_protocols`, and beyond those the accepted loopback broadcast
//! writers ("forwarders") and real client connections. The slot
//! table is a single `Vec` of an explicit sum type; destroying a slot is a
//! `Vec::remove`, which keeps the survivors in order.
//!
//! The loop suspends in exactly one place: the poller wait, capped at
//! [`POLL_TIMEOUT`]. A wait that returns nothing is a legitimate tick;
//! embedders driving [`EventLoop::turn`] directly can hang periodic work off
//! it. Every socket is serviced only after readiness and interest is
//! re-armed afterwards (the poller delivers oneshot notifications).

use crate::broadcast::{BroadcastQueue, MAX_BROADCAST_PAYLOAD, PRE_PADDING};
use crate::connection::{Connection, SessionState};
use crate::error::Error;
use crate::ingest::FrameHandler;
use crate::protocol::{Callback, Dispatch, ProtocolMeta, Reason, Session};
use crate::transport::Transport;
use polling::{Event, Poller};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on one readiness wait; the loop's periodic tick interval.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes read from a connection per service step.
const READ_CHUNK: usize = 4096;

/// One entry of the slot table.
pub(crate) enum Slot {
    /// The external listening socket; always index 0.
    Listener {
        listener: TcpListener,
        key: usize,
    },
    /// A protocol's loopback broadcast-ingress listener; index `1 + protocol`.
    Ingress {
        listener: TcpListener,
        protocol: usize,
        key: usize,
    },
    /// An accepted loopback broadcast writer for `protocol`.
    Forwarder {
        stream: TcpStream,
        protocol: usize,
        key: usize,
    },
    /// A real client connection.
    Session(Box<Connection>),
}

impl Slot {
    fn key(&self) -> usize {
        match self {
            Self::Listener { key, .. } | Self::Ingress { key, .. } | Self::Forwarder { key, .. } => {
                *key
            }
            Self::Session(conn) => conn.key(),
        }
    }
}

/// What one [`EventLoop::turn`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// The wait timed out with no events: a periodic tick.
    Idle,
    /// At least one slot was serviced.
    Serviced,
    /// Shutdown was requested; every slot has been torn down.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceOutcome {
    Kept,
    Removed,
}

/// The single-threaded cooperative multiplexer.
///
/// Owns the listener, the ingress sockets, the connection table and the
/// protocol callbacks. Everything it owns is mutated only from the thread
/// that calls [`run`](Self::run) or [`turn`](Self::turn); the only handles
/// that escape are the shutdown flag and per-protocol loopback writers.
pub struct EventLoop {
    pub(crate) poller: Arc<Poller>,
    pub(crate) events: Vec<Event>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) meta: Vec<ProtocolMeta>,
    pub(crate) callbacks: Vec<Callback>,
    pub(crate) handler: Box<dyn FrameHandler>,
    pub(crate) queue: BroadcastQueue,
    pub(crate) scratch: Vec<u8>,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) max_clients: usize,
    pub(crate) next_key: usize,
    pub(crate) local_addr: SocketAddr,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<crate::transport::TlsConfig>,
}

impl EventLoop {
    /// Address the external listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry metadata, in registration order.
    #[must_use]
    pub fn protocols(&self) -> &[ProtocolMeta] {
        &self.meta
    }

    pub(crate) fn poller_handle(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until shutdown is requested or the listener dies.
    pub fn run(&mut self) -> Result<(), Error> {
        info!(addr = %self.local_addr, protocols = self.meta.len(), "event loop running");
        loop {
            if self.turn(POLL_TIMEOUT)? == Turn::Shutdown {
                return Ok(());
            }
        }
    }

    /// One iteration: wait for readiness (up to `timeout`), accept, service,
    /// fan out queued broadcasts.
    pub fn turn(&mut self, timeout: Duration) -> Result<Turn, Error> {
        self.events.clear();
        let count = match self.poller.wait(&mut self.events, Some(timeout)) {
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                error!(error = %e, "readiness wait failed");
                self.teardown();
                return Err(Error::ListenerDead(e));
            }
        };

        if self.shutdown.load(Ordering::SeqCst) {
            self.teardown();
            return Ok(Turn::Shutdown);
        }
        if count == 0 {
            return Ok(Turn::Idle);
        }

        // Readiness as an explicit per-slot set. Slots appended later this
        // turn have no entry and are serviced on a later readiness.
        let mut ready = vec![false; self.slots.len()];
        for event in &self.events {
            if !event.readable {
                continue;
            }
            if let Some(index) = self.slots.iter().position(|slot| slot.key() == event.key) {
                ready[index] = true;
            }
        }

        self.accept_pass(&ready);
        self.service_pass(&ready);
        self.drain_broadcasts();
        self.reap_close_requests();
        Ok(Turn::Serviced)
    }

    /// Destroy every connection whose callback asked for closure this turn.
    fn reap_close_requests(&mut self) {
        loop {
            let marked = self.slots.iter().position(|slot| {
                matches!(slot, Slot::Session(conn) if conn.close_requested())
            });
            match marked {
                Some(k) => self.destroy_slot(k),
                None => return,
            }
        }
    }

    /// Accept one connection on each ready listener slot: the external
    /// listener installs a `Session`, an ingress listener installs a
    /// `Forwarder` tagged with its protocol index.
    fn accept_pass(&mut self, ready: &[bool]) {
        for k in 0..=self.meta.len() {
            if !ready.get(k).copied().unwrap_or(false) {
                continue;
            }

            let accepted = match &self.slots[k] {
                Slot::Listener { listener, .. } | Slot::Ingress { listener, .. } => {
                    listener.accept()
                }
                _ => continue,
            };
            self.rearm_slot(k);

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(slot = k, error = %e, "accept failed");
                    continue;
                }
            };

            if self.slots.len() >= self.max_clients {
                warn!(peer = %peer, "slot table full, dropping new connection");
                continue;
            }

            if k == 0 {
                self.install_session(stream, peer);
            } else {
                self.install_forwarder(stream, k - 1);
            }
        }
    }

    fn install_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        let transport = match self.wrap_transport(stream) {
            Ok(transport) => transport,
            Err(e) => {
                // Browsers are known to probe with incompatible TLS
                // parameters and retry; a failed transport handshake is not
                // an event worth more than a debug line.
                debug!(peer = %peer, error = %e, "transport handshake failed");
                return;
            }
        };

        let key = self.next_key;
        self.next_key += 1;
        if let Err(e) = self.poller.add(transport.tcp(), Event::readable(key)) {
            warn!(peer = %peer, error = %e, "poller registration failed");
            return;
        }
        debug!(peer = %peer, key, "accepted connection");
        self.slots
            .push(Slot::Session(Box::new(Connection::new(transport, peer, key))));
    }

    fn install_forwarder(&mut self, stream: TcpStream, protocol: usize) {
        let key = self.next_key;
        self.next_key += 1;
        if let Err(e) = self.poller.add(&stream, Event::readable(key)) {
            warn!(protocol, error = %e, "poller registration failed");
            return;
        }
        debug!(protocol, key, "accepted broadcast writer");
        self.slots.push(Slot::Forwarder { stream, protocol, key });
    }

    #[cfg(feature = "tls")]
    fn wrap_transport(&self, stream: TcpStream) -> io::Result<Transport> {
        match &self.tls {
            Some(tls) => tls.accept(stream),
            None => Ok(Transport::Plain(stream)),
        }
    }

    #[cfg(not(feature = "tls"))]
    #[allow(clippy::unnecessary_wraps)]
    fn wrap_transport(&self, stream: TcpStream) -> io::Result<Transport> {
        Ok(Transport::Plain(stream))
    }

    /// Service ready slots beyond the listeners, in ascending order. A
    /// destroyed slot ends the pass: every index past it has shifted.
    fn service_pass(&mut self, ready: &[bool]) {
        let first = self.meta.len() + 1;
        for k in first..self.slots.len() {
            if !ready.get(k).copied().unwrap_or(false) {
                continue;
            }
            let outcome = if matches!(self.slots[k], Slot::Forwarder { .. }) {
                self.service_forwarder(k)
            } else if matches!(self.slots[k], Slot::Session(_)) {
                self.service_session(k)
            } else {
                ServiceOutcome::Kept
            };
            if outcome == ServiceOutcome::Removed {
                // Indices past k have shifted down by one. The pass ends
                // here, but the unserviced slots already had their oneshot
                // events consumed this wait, so their interest must be
                // re-armed or they would never wake again.
                for j in (k + 1)..ready.len() {
                    if ready[j] && j - 1 < self.slots.len() {
                        self.rearm_slot(j - 1);
                    }
                }
                return;
            }
        }
    }

    /// Read one payload off a broadcast writer and fan it out to every
    /// established connection of the tagged protocol, in slot order.
    fn service_forwarder(&mut self, k: usize) -> ServiceOutcome {
        let protocol;
        let read;
        {
            let Self { slots, scratch, .. } = &mut *self;
            let Slot::Forwarder { stream, protocol: tag, .. } = &mut slots[k] else {
                return ServiceOutcome::Kept;
            };
            protocol = *tag;
            read = stream.read(&mut scratch[PRE_PADDING..PRE_PADDING + MAX_BROADCAST_PAYLOAD]);
        }

        match read {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.rearm_slot(k);
                ServiceOutcome::Kept
            }
            Err(e) => {
                // A failed ingress read is logged and skipped; the ingress
                // plumbing itself stays up.
                warn!(protocol, error = %e, "error receiving broadcast payload");
                self.rearm_slot(k);
                ServiceOutcome::Kept
            }
            Ok(0) => {
                debug!(protocol, "broadcast writer hung up");
                self.destroy_slot(k);
                ServiceOutcome::Removed
            }
            Ok(n) => {
                let Self { slots, meta, callbacks, queue, scratch, .. } = &mut *self;
                let payload = &scratch[PRE_PADDING..PRE_PADDING + n];
                let first = meta.len() + 1;
                for slot in slots.iter_mut().skip(first) {
                    let Slot::Session(conn) = slot else { continue };
                    if conn.state() != SessionState::Established
                        || conn.protocol_index() != protocol
                    {
                        continue;
                    }
                    let index = conn.protocol_index();
                    let mut session = Session::new(conn, meta, queue);
                    let callback = &mut callbacks[index];
                    callback(&mut session, Reason::Broadcast(payload));
                }
                self.rearm_slot(k);
                ServiceOutcome::Kept
            }
        }
    }

    /// Read one chunk off a connection and feed the frame handler.
    fn service_session(&mut self, k: usize) -> ServiceOutcome {
        let mut chunk = [0u8; READ_CHUNK];
        let read = {
            let Slot::Session(conn) = &mut self.slots[k] else {
                return ServiceOutcome::Kept;
            };
            conn.transport_mut().read(&mut chunk)
        };

        match read {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.rearm_slot(k);
                ServiceOutcome::Kept
            }
            Err(e) => {
                warn!(slot = k, error = %e, "socket read failed");
                self.rearm_slot(k);
                ServiceOutcome::Kept
            }
            Ok(0) => {
                self.destroy_slot(k);
                ServiceOutcome::Removed
            }
            Ok(n) => {
                let survived = {
                    let Self { slots, meta, callbacks, queue, handler, .. } = &mut *self;
                    let Slot::Session(conn) = &mut slots[k] else {
                        return ServiceOutcome::Kept;
                    };
                    let mut cx = Dispatch {
                        callbacks: callbacks.as_mut_slice(),
                        meta: meta.as_slice(),
                        queue,
                    };
                    handler.ingest(conn, &mut cx, &chunk[..n]).is_ok()
                };
                if survived {
                    self.rearm_slot(k);
                    ServiceOutcome::Kept
                } else {
                    self.destroy_slot(k);
                    ServiceOutcome::Removed
                }
            }
        }
    }

    /// Fan out broadcasts queued by callbacks, in slot order, before the
    /// loop sleeps again. Broadcasts enqueued while draining are drained in
    /// the same pass.
    fn drain_broadcasts(&mut self) {
        while let Some(item) = self.queue.pop_front() {
            let Self { slots, meta, callbacks, queue, .. } = &mut *self;
            let payload = item.payload.payload();
            let first = meta.len() + 1;
            for slot in slots.iter_mut().skip(first) {
                let Slot::Session(conn) = slot else { continue };
                if conn.state() != SessionState::Established
                    || conn.protocol_index() != item.protocol
                {
                    continue;
                }
                let index = conn.protocol_index();
                let mut session = Session::new(conn, meta, queue);
                let callback = &mut callbacks[index];
                callback(&mut session, Reason::Broadcast(payload));
            }
        }
    }

    /// Destroy the slot at `k` and compact the table.
    ///
    /// For a connection: deliver `Closed` iff established, transition to
    /// `Dead`, release token buffers, shut the transport down both ways,
    /// close it, release the user-data slot.
    fn destroy_slot(&mut self, k: usize) {
        let Self { slots, meta, callbacks, queue, poller, .. } = &mut *self;
        match slots.remove(k) {
            Slot::Session(mut conn) => {
                debug!(peer = %conn.peer_addr(), state = ?conn.state(), "destroying connection");
                if conn.state() == SessionState::Established {
                    let index = conn.protocol_index();
                    let mut session = Session::new(&mut conn, meta, queue);
                    let callback = &mut callbacks[index];
                    callback(&mut session, Reason::Closed);
                }
                conn.set_state(SessionState::Dead);
                conn.clear_tokens();
                let _ = poller.delete(conn.transport().tcp());
                conn.transport_mut().shutdown();
                conn.take_user_space();
            }
            Slot::Forwarder { stream, .. } => {
                let _ = poller.delete(&stream);
            }
            Slot::Listener { listener, .. } | Slot::Ingress { listener, .. } => {
                let _ = poller.delete(&listener);
            }
        }
    }

    /// Tear down every slot, highest index first, so connections get their
    /// `Closed` callbacks while the registry slots still exist. Each
    /// descriptor is closed exactly once, by dropping its owning slot.
    fn teardown(&mut self) {
        debug!(slots = self.slots.len(), "tearing down");
        while !self.slots.is_empty() {
            self.destroy_slot(self.slots.len() - 1);
        }
    }

    /// Re-arm readiness interest for the slot at `k` (oneshot poller).
    fn rearm_slot(&self, k: usize) {
        let slot = &self.slots[k];
        let key = slot.key();
        let result = match slot {
            Slot::Listener { listener, .. } | Slot::Ingress { listener, .. } => {
                self.poller.modify(listener, Event::readable(key))
            }
            Slot::Forwarder { stream, .. } => self.poller.modify(stream, Event::readable(key)),
            Slot::Session(conn) => self.poller.modify(conn.transport().tcp(), Event::readable(key)),
        };
        if let Err(e) = result {
            warn!(slot = k, error = %e, "re-arming readiness failed");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("slots", &self.slots.len())
            .field("protocols", &self.meta.len())
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}
