#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Everything a protocol callback observed, tagged with the server-side
/// view of the peer (which equals the client socket's local address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Established(SocketAddr),
    Closed(SocketAddr),
    Receive(SocketAddr, Vec<u8>),
    Broadcast(SocketAddr, Vec<u8>),
    Http(String),
}

pub type EventLog = Arc<Mutex<Vec<Seen>>>;

pub fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn snapshot(log: &EventLog) -> Vec<Seen> {
    log.lock().unwrap().clone()
}

/// A protocol that records every callback into `log` and does nothing else.
pub fn recorder(name: &str, log: &EventLog) -> wsmux::Protocol {
    let log = Arc::clone(log);
    wsmux::Protocol::new(name, move |session, reason| {
        let peer = session.peer_addr();
        let mut log = log.lock().unwrap();
        match reason {
            wsmux::Reason::Established => log.push(Seen::Established(peer)),
            wsmux::Reason::Closed => log.push(Seen::Closed(peer)),
            wsmux::Reason::Receive(payload) => log.push(Seen::Receive(peer, payload.to_vec())),
            wsmux::Reason::Broadcast(payload) => log.push(Seen::Broadcast(peer, payload.to_vec())),
            wsmux::Reason::Http(path) => log.push(Seen::Http(path.to_string())),
        }
    })
}

/// RFC 6455 example key; its accept value is fixed, so tests can assert it.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// A bare-bones WebSocket client speaking the browser side of the wire.
pub struct WsClient {
    pub stream: TcpStream,
}

impl WsClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("client connect failed");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    /// The address the server sees this client as.
    pub fn addr(&self) -> SocketAddr {
        self.stream.local_addr().unwrap()
    }

    /// Perform the upgrade handshake and assert the 101 response.
    pub fn upgrade(&mut self, path: &str, protocol: Option<&str>) {
        let protocol_header = match protocol {
            Some(name) => format!("Sec-WebSocket-Protocol: {name}\r\n"),
            None => String::new(),
        };
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {protocol_header}\r\n"
        );
        self.stream.write_all(request.as_bytes()).unwrap();

        let head = self.read_head();
        assert!(
            head.starts_with("HTTP/1.1 101"),
            "expected 101 Switching Protocols, got: {head}"
        );
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    /// Read an HTTP response head up to the blank line.
    pub fn read_head(&mut self) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = self.stream.read(&mut byte).expect("reading response head");
            assert_ne!(n, 0, "peer closed before the head completed: {head:?}");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// Send a masked text frame (zero mask key keeps payloads readable in
    /// packet dumps).
    pub fn send_text(&mut self, payload: &[u8]) {
        self.send_frame(0x1, payload);
    }

    /// Send a masked close frame with no status code.
    pub fn send_close(&mut self) {
        self.send_frame(0x8, b"");
    }

    /// Send a masked ping frame.
    pub fn send_ping(&mut self, payload: &[u8]) {
        self.send_frame(0x9, payload);
    }

    fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = vec![0x80 | opcode];
        if payload.len() <= 125 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            assert!(payload.len() <= 65535, "test frames stay under 64k");
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).unwrap();
    }

    /// Read one unmasked server frame; returns (opcode, payload).
    pub fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).expect("frame header");
        let opcode = head[0] & 0x0F;
        assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");
        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext) as usize
            }
            small => small as usize,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).unwrap();
        (opcode, payload)
    }

    /// True once the server has closed the connection.
    pub fn observes_eof(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    }
}
