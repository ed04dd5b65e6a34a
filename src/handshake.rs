//! WebSocket upgrade handshake (RFC 6455 Section 4), server side.
//!
//! A client opens with an HTTP/1.1 upgrade request:
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! and the server answers `101 Switching Protocols` with the derived
//! `Sec-WebSocket-Accept` value. Requests without the upgrade headers are
//! plain HTTP and are routed to the first registered protocol instead.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// RFC 6455 GUID for `Sec-WebSocket-Accept` computation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// Per RFC 6455 Section 4.2.2: SHA-1 over the key concatenated with the
/// GUID, base64-encoded.
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Header token kinds a connection accumulates during its handshake.
///
/// The set mirrors the headers the upgrade logic consumes; each kind maps to
/// one fixed slot in the connection's token array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TokenKind {
    /// Request path from the GET line.
    GetUri = 0,
    /// `Host` header.
    Host = 1,
    /// `Connection` header.
    Connection = 2,
    /// `Upgrade` header.
    Upgrade = 3,
    /// `Origin` header.
    Origin = 4,
    /// `Sec-WebSocket-Key` header.
    Key = 5,
    /// `Sec-WebSocket-Version` header.
    Version = 6,
    /// `Sec-WebSocket-Protocol` header.
    Protocol = 7,
}

impl TokenKind {
    /// Number of token kinds (size of a connection's token array).
    pub const COUNT: usize = 8;

    /// All kinds, in slot order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::GetUri,
        Self::Host,
        Self::Connection,
        Self::Upgrade,
        Self::Origin,
        Self::Key,
        Self::Version,
        Self::Protocol,
    ];

    /// The header name this kind accumulates, lowercase.
    ///
    /// `GetUri` has no header; it comes from the request line.
    #[must_use]
    pub fn header_name(self) -> Option<&'static str> {
        match self {
            Self::GetUri => None,
            Self::Host => Some("host"),
            Self::Connection => Some("connection"),
            Self::Upgrade => Some("upgrade"),
            Self::Origin => Some("origin"),
            Self::Key => Some("sec-websocket-key"),
            Self::Version => Some("sec-websocket-version"),
            Self::Protocol => Some("sec-websocket-protocol"),
        }
    }
}

/// Handshake errors.
#[derive(Debug)]
pub enum HandshakeError {
    /// The HTTP request head could not be parsed.
    InvalidRequest(String),
    /// A required upgrade header is absent.
    MissingHeader(&'static str),
    /// `Sec-WebSocket-Key` is not 16 base64-encoded bytes.
    InvalidKey,
    /// Client offered a `Sec-WebSocket-Version` other than 13.
    UnsupportedVersion(String),
    /// Client offered subprotocols, none of which are registered.
    ProtocolMismatch {
        /// Protocols the client asked for.
        requested: Vec<String>,
    },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid HTTP request: {msg}"),
            Self::MissingHeader(name) => write!(f, "missing required header: {name}"),
            Self::InvalidKey => write!(f, "invalid Sec-WebSocket-Key"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported WebSocket version: {v}"),
            Self::ProtocolMismatch { requested } => {
                write!(f, "no registered protocol among {requested:?}")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Minimal HTTP request head.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (`GET` for upgrades).
    pub method: String,
    /// Request path.
    pub path: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Parse a request head (everything up to the blank line).
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| HandshakeError::InvalidRequest("invalid UTF-8".into()))?;

        let mut lines = text.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("missing method".into()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("missing path".into()))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self { method, path, headers })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Whether this request asks for a WebSocket upgrade.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }
}

/// Outcome of a validated upgrade request.
#[derive(Debug, Clone)]
pub struct Upgrade {
    /// Computed `Sec-WebSocket-Accept` value.
    pub accept_key: String,
    /// Index into the supported-protocol list, if the client named one.
    pub protocol: Option<usize>,
    /// Version the client announced.
    pub version: u32,
}

/// Validate an upgrade request against the registered protocol names.
///
/// Subprotocol selection follows registry order: the first registered name
/// the client also offered wins. A client that names protocols with no
/// registry overlap is refused; a client that names none keeps the registry
/// head.
pub fn negotiate(request: &HttpRequest, supported: &[&str]) -> Result<Upgrade, HandshakeError> {
    if request.method != "GET" {
        return Err(HandshakeError::InvalidRequest(format!(
            "method must be GET, got '{}'",
            request.method
        )));
    }

    let upgrade = request
        .header("upgrade")
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidRequest(format!(
            "Upgrade header must be 'websocket', got '{upgrade}'"
        )));
    }

    let connection = request
        .header("connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(HandshakeError::InvalidRequest(format!(
            "Connection header must contain 'Upgrade', got '{connection}'"
        )));
    }

    let version = request
        .header("sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    let client_key = request
        .header("sec-websocket-key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match base64::engine::general_purpose::STANDARD.decode(client_key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    let protocol = match request.header("sec-websocket-protocol") {
        Some(offered) => {
            let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
            match supported
                .iter()
                .position(|name| offered.contains(name))
            {
                Some(index) => Some(index),
                None => {
                    return Err(HandshakeError::ProtocolMismatch {
                        requested: offered.iter().map(|p| (*p).to_string()).collect(),
                    })
                }
            }
        }
        None => None,
    };

    Ok(Upgrade {
        accept_key: compute_accept_key(client_key),
        protocol,
        version: 13,
    })
}

/// Build the `101 Switching Protocols` response.
#[must_use]
pub fn accept_response(accept_key: &str, protocol: Option<&str>) -> Vec<u8> {
    let mut response = String::from(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n",
    );
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(accept_key);
    response.push_str("\r\n");
    if let Some(name) = protocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(name);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.into_bytes()
}

/// Build a rejection response with the given status.
#[must_use]
pub fn reject_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}
