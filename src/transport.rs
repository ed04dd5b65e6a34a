//! Transport abstraction: plain TCP or TLS-wrapped TCP.
//!
//! The loop and the frame handler only ever see a [`Transport`], which
//! offers blocking `read`/`write_all`/`shutdown` gated on readiness by the
//! caller. TLS support is compiled in behind the `tls` cargo feature and
//! configured from PEM files; the rustls server config is an attribute of
//! the server being built, never process-global state.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

#[cfg(feature = "tls")]
use crate::error::Error;
#[cfg(feature = "tls")]
use std::path::Path;
#[cfg(feature = "tls")]
use std::sync::Arc;

/// A connection's byte stream.
#[derive(Debug)]
pub enum Transport {
    /// Unencrypted TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    #[cfg(feature = "tls")]
    Tls {
        /// The rustls server-side session state.
        conn: Box<rustls::ServerConnection>,
        /// The underlying socket.
        tcp: TcpStream,
    },
}

impl Transport {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.read(buf),
            #[cfg(feature = "tls")]
            Self::Tls { conn, tcp } => rustls::Stream::new(conn.as_mut(), tcp).read(buf),
        }
    }

    /// Write the whole of `buf`.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(tcp) => tcp.write_all(buf),
            #[cfg(feature = "tls")]
            Self::Tls { conn, tcp } => {
                let mut stream = rustls::Stream::new(conn.as_mut(), tcp);
                stream.write_all(buf)?;
                stream.flush()
            }
        }
    }

    /// Shut the stream down in both directions, best effort. For TLS this
    /// sends `close_notify` first.
    pub fn shutdown(&mut self) {
        match self {
            Self::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
            #[cfg(feature = "tls")]
            Self::Tls { conn, tcp } => {
                conn.send_close_notify();
                let _ = conn.complete_io(tcp);
                let _ = tcp.shutdown(Shutdown::Both);
            }
        }
    }

    /// The underlying socket (poller registration, address queries).
    #[must_use]
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(tcp) => tcp,
            #[cfg(feature = "tls")]
            Self::Tls { tcp, .. } => tcp,
        }
    }

    /// Peer address of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }
}

/// TLS acceptor configuration for a server.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsConfig {
    config: Arc<rustls::ServerConfig>,
}

#[cfg(feature = "tls")]
impl TlsConfig {
    /// Load a certificate chain and private key from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        use rustls::crypto::ring::default_provider;

        let certs = load_certs(cert_path.as_ref())?;
        let key = load_key(key_path.as_ref())?;

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wrap a freshly accepted socket, driving the TLS handshake to
    /// completion before the connection enters the slot table.
    ///
    /// Failures here are expected in the wild (clients probe with
    /// incompatible parameters); the caller discards the socket and moves
    /// on.
    pub(crate) fn accept(&self, tcp: TcpStream) -> io::Result<Transport> {
        let mut conn = rustls::ServerConnection::new(Arc::clone(&self.config))
            .map_err(io::Error::other)?;
        let mut tcp = tcp;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)?;
        }
        Ok(Transport::Tls {
            conn: Box::new(conn),
            tcp,
        })
    }
}

#[cfg(feature = "tls")]
fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open certificate {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| Error::Tls(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open private key {}: {e}", path.display())))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("bad private key PEM: {e}")))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn plain_roundtrip_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        let mut transport = Transport::Plain(server);
        assert_eq!(transport.peer_addr().unwrap(), peer);

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        transport.write_all(b"pong").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        transport.shutdown();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0, "peer must observe the shutdown");
    }

    #[cfg(feature = "tls")]
    #[test]
    fn missing_pem_files_are_a_config_error() {
        let err = TlsConfig::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
