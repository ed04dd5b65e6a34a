//! Server construction and the spawned-loop handle.
//!
//! [`ServerBuilder`] binds every privileged resource on the calling thread:
//! the external listener (with `SO_REUSEADDR`, so a restart can rebind over
//! sockets lingering in `TIME_WAIT`) and one loopback broadcast-ingress
//! listener per protocol, whose OS-assigned port is recorded on the
//! protocol's metadata. Only then does [`spawn`](ServerBuilder::spawn) move
//! the loop onto its own thread. Because the ingress listeners already
//! exist, a [`Broadcaster`] dial lands in their accept backlog no matter how
//! far the loop thread has gotten, so there is no startup race to sleep
//! away.

use crate::broadcast::{
    BroadcastQueue, Broadcaster, MAX_BROADCAST_PAYLOAD, POST_PADDING, PRE_PADDING,
};
use crate::error::Error;
use crate::event_loop::{EventLoop, Slot};
use crate::ingest::{DefaultFrameHandler, FrameHandler};
use crate::protocol::{Callback, Protocol, ProtocolMeta};
use polling::{Event, Poller};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Default ceiling on the slot table: listener, ingress sockets, broadcast
/// writers and client connections all count against it.
pub const MAX_CLIENTS: usize = 100;

/// Listen backlog for the external and ingress listeners.
const LISTEN_BACKLOG: i32 = 5;

/// Configures and creates a server.
pub struct ServerBuilder {
    addr: IpAddr,
    port: u16,
    protocols: Vec<Protocol>,
    max_clients: usize,
    gid: Option<u32>,
    uid: Option<u32>,
    handler: Box<dyn FrameHandler>,
    #[cfg(feature = "tls")]
    tls: Option<(std::path::PathBuf, std::path::PathBuf)>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// A builder with defaults: all interfaces, OS-assigned port, no TLS,
    /// no identity change, [`MAX_CLIENTS`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            protocols: Vec::new(),
            max_clients: MAX_CLIENTS,
            gid: None,
            uid: None,
            handler: Box::new(DefaultFrameHandler),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// TCP port to listen on; 0 lets the OS choose.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Interface address to bind; defaults to all interfaces.
    #[must_use]
    pub fn addr(mut self, addr: IpAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Register a protocol. Order matters: the first protocol is the
    /// default binding for fresh connections and the target of non-upgrade
    /// HTTP callbacks, and subprotocol negotiation prefers earlier entries.
    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Cap the slot table (listener and ingress slots included).
    #[must_use]
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Group id to switch to once the sockets are bound.
    #[must_use]
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    /// User id to switch to once the sockets are bound.
    #[must_use]
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Replace the default RFC 6455 frame handler.
    #[must_use]
    pub fn frame_handler(mut self, handler: impl FrameHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Serve TLS using the given PEM certificate chain and private key.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn tls_pem(
        mut self,
        cert_path: impl Into<std::path::PathBuf>,
        key_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        self.tls = Some((cert_path.into(), key_path.into()));
        self
    }

    /// Bind everything and return the loop for the caller to drive.
    pub fn build(self) -> Result<EventLoop, Error> {
        if self.protocols.is_empty() {
            return Err(Error::EmptyRegistry);
        }

        #[cfg(feature = "tls")]
        let tls = match &self.tls {
            Some((cert, key)) => Some(crate::transport::TlsConfig::from_pem_files(cert, key)?),
            None => None,
        };

        let bind_addr = SocketAddr::new(self.addr, self.port);
        let listener =
            bind_reusable(bind_addr).map_err(|source| Error::Bind { addr: bind_addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let poller = Arc::new(Poller::new()?);
        let mut slots = Vec::with_capacity(1 + self.protocols.len());
        let mut next_key = 0;

        poller.add(&listener, Event::readable(next_key))?;
        slots.push(Slot::Listener { listener, key: next_key });
        next_key += 1;

        let mut meta = Vec::with_capacity(self.protocols.len());
        let mut callbacks: Vec<Callback> = Vec::with_capacity(self.protocols.len());
        for (index, protocol) in self.protocols.into_iter().enumerate() {
            let (name, callback) = protocol.into_parts();
            let ingress = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .map_err(|source| Error::IngressBind { name: name.clone(), source })?;
            ingress.set_nonblocking(true)?;
            let ingress_port = ingress.local_addr()?.port();
            debug!(protocol = %name, index, ingress_port, "broadcast ingress bound");

            poller.add(&ingress, Event::readable(next_key))?;
            slots.push(Slot::Ingress { listener: ingress, protocol: index, key: next_key });
            next_key += 1;

            meta.push(ProtocolMeta { name, index, ingress_port });
            callbacks.push(callback);
        }

        drop_identity(self.gid, self.uid);

        info!(addr = %local_addr, protocols = meta.len(), "server context ready");

        Ok(EventLoop {
            poller,
            events: Vec::with_capacity(64),
            slots,
            meta,
            callbacks,
            handler: self.handler,
            queue: BroadcastQueue::new(),
            scratch: vec![0u8; PRE_PADDING + MAX_BROADCAST_PAYLOAD + POST_PADDING],
            shutdown: Arc::new(AtomicBool::new(false)),
            max_clients: self.max_clients,
            next_key,
            local_addr,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    /// Bind everything, then run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<Server, Error> {
        let mut event_loop = self.build()?;
        let local_addr = event_loop.local_addr();
        let meta = event_loop.protocols().to_vec();
        let shutdown = event_loop.shutdown_flag();
        let poller = event_loop.poller_handle();

        let thread = thread::Builder::new()
            .name("wsmux-loop".into())
            .spawn(move || event_loop.run())?;

        Ok(Server {
            local_addr,
            meta,
            shutdown,
            poller,
            thread: Some(thread),
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("protocols", &self.protocols.len())
            .field("max_clients", &self.max_clients)
            .finish_non_exhaustive()
    }
}

/// Handle to a server whose loop runs on its own thread.
///
/// The handle never touches the slot table; it only carries the registry
/// metadata, the shutdown flag and the poller waker. Cross-context
/// broadcasts go through [`Server::broadcaster`]. Dropping the handle
/// requests shutdown and detaches; call [`Server::shutdown`] to wait for
/// the loop to finish.
pub struct Server {
    local_addr: SocketAddr,
    meta: Vec<ProtocolMeta>,
    shutdown: Arc<AtomicBool>,
    poller: Arc<Poller>,
    thread: Option<JoinHandle<Result<(), Error>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("protocols", &self.meta.len())
            .finish_non_exhaustive()
    }
}

impl Server {
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

    /// Dial a broadcast writer into the named protocol's loopback ingress.
    ///
    /// Each call opens a fresh writer; keep it around for the lifetime of
    /// the external broadcasting context, since every live writer occupies
    /// one slot in the loop's table.
    pub fn broadcaster(&self, protocol: &str) -> Result<Broadcaster, Error> {
        let meta = self
            .meta
            .iter()
            .find(|m| m.name() == protocol)
            .ok_or_else(|| Error::UnknownProtocol(protocol.to_string()))?;
        Broadcaster::connect(meta.name(), meta.ingress_port()).map_err(Error::Io)
    }

    /// Request shutdown and wait for the loop thread to finish.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.request_shutdown();
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| Error::LoopPanicked)?,
            None => Ok(()),
        }
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.poller.notify();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_shutdown();
        }
    }
}

fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Switch group then user identity, after the privileged binds. Failures
/// are logged and ignored, matching the traditional server behavior of
/// carrying on with the identity it has.
#[cfg(unix)]
#[allow(unsafe_code)]
fn drop_identity(gid: Option<u32>, uid: Option<u32>) {
    // setgid must come first; it is no longer permitted once uid changes.
    if let Some(gid) = gid {
        let rc = unsafe { libc::setgid(gid as libc::gid_t) };
        if rc != 0 {
            warn!(gid, error = %io::Error::last_os_error(), "setgid failed");
        }
    }
    if let Some(uid) = uid {
        let rc = unsafe { libc::setuid(uid as libc::uid_t) };
        if rc != 0 {
            warn!(uid, error = %io::Error::last_os_error(), "setuid failed");
        }
    }
}

#[cfg(not(unix))]
fn drop_identity(_gid: Option<u32>, _uid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;

    fn noop_protocol(name: &str) -> Protocol {
        Protocol::new(name, |_session, _reason| {})
    }

    #[test]
    fn empty_registry_is_an_init_failure() {
        let err = ServerBuilder::new().build().unwrap_err();
        assert!(matches!(err, Error::EmptyRegistry));
    }

    #[test]
    fn build_installs_listener_and_ingress_slots() {
        let event_loop = ServerBuilder::new()
            .addr("127.0.0.1".parse().unwrap())
            .protocol(noop_protocol("chat"))
            .protocol(noop_protocol("other"))
            .build()
            .unwrap();

        assert_ne!(event_loop.local_addr().port(), 0);
        let protocols = event_loop.protocols();
        assert_eq!(protocols.len(), 2);
        assert_eq!(protocols[0].name(), "chat");
        assert_eq!(protocols[0].index(), 0);
        assert_ne!(protocols[0].ingress_port(), 0);
        assert_eq!(protocols[1].index(), 1);
        assert_ne!(protocols[0].ingress_port(), protocols[1].ingress_port());
    }

    #[test]
    fn rebind_over_previous_listener_port() {
        let first = ServerBuilder::new()
            .addr("127.0.0.1".parse().unwrap())
            .protocol(noop_protocol("chat"))
            .build()
            .unwrap();
        let port = first.local_addr().port();
        drop(first);

        let second = ServerBuilder::new()
            .addr("127.0.0.1".parse().unwrap())
            .port(port)
            .protocol(noop_protocol("chat"))
            .build()
            .unwrap();
        assert_eq!(second.local_addr().port(), port);
    }

    #[test]
    fn spawn_then_shutdown_joins_cleanly() {
        let server = ServerBuilder::new()
            .addr("127.0.0.1".parse().unwrap())
            .protocol(noop_protocol("chat"))
            .spawn()
            .unwrap();

        assert_eq!(server.protocols().len(), 1);
        server.shutdown().unwrap();
    }

    #[test]
    fn broadcaster_for_unknown_protocol_fails() {
        let server = ServerBuilder::new()
            .addr("127.0.0.1".parse().unwrap())
            .protocol(noop_protocol("chat"))
            .spawn()
            .unwrap();

        let err = server.broadcaster("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(_)));
        server.shutdown().unwrap();
    }
}
