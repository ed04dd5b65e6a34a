//! Broadcast fan-out integration tests.
//!
//! Coverage:
//! - in-loop broadcast from inside a Receive callback reaches exactly the
//!   established connections of that protocol, in slot order
//! - cross-context broadcast through the loopback ingress produces the same
//!   recipient set and payload
//! - overload: a connection beyond the slot cap is accepted and immediately
//!   closed, with no callback activity

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use wsmux::{PaddedBuf, Protocol, Reason, ServerBuilder};

const WAIT: Duration = Duration::from_secs(5);

fn localhost() -> std::net::IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Chat protocol: records, and rebroadcasts every Receive to its own
/// protocol from inside the callback (the in-loop path).
fn rebroadcasting_chat(log: &EventLog) -> Protocol {
    let log = Arc::clone(log);
    Protocol::new("chat", move |session, reason| {
        let peer = session.peer_addr();
        match reason {
            Reason::Established => log.lock().unwrap().push(Seen::Established(peer)),
            Reason::Closed => log.lock().unwrap().push(Seen::Closed(peer)),
            Reason::Receive(payload) => {
                log.lock().unwrap().push(Seen::Receive(peer, payload.to_vec()));
                session.broadcast(PaddedBuf::new(payload));
            }
            Reason::Broadcast(payload) => {
                log.lock().unwrap().push(Seen::Broadcast(peer, payload.to_vec()));
            }
            Reason::Http(_) => {}
        }
    })
}

fn broadcasts_in(log: &EventLog) -> Vec<(std::net::SocketAddr, Vec<u8>)> {
    snapshot(log)
        .into_iter()
        .filter_map(|e| match e {
            Seen::Broadcast(peer, payload) => Some((peer, payload)),
            _ => None,
        })
        .collect()
}

struct ChatFixture {
    server: wsmux::Server,
    chat_log: EventLog,
    other_log: EventLog,
}

/// Two chat clients (a, b) and one bystander on "other".
fn chat_setup() -> (ChatFixture, WsClient, WsClient, WsClient) {
    init_test_logging();
    let chat_log = new_log();
    let other_log = new_log();
    let server = ServerBuilder::new()
        .addr(localhost())
        .protocol(rebroadcasting_chat(&chat_log))
        .protocol(recorder("other", &other_log))
        .spawn()
        .unwrap();

    let mut a = WsClient::connect(server.local_addr());
    a.upgrade("/", Some("chat"));
    let mut b = WsClient::connect(server.local_addr());
    b.upgrade("/", Some("chat"));
    let mut c = WsClient::connect(server.local_addr());
    c.upgrade("/", Some("other"));

    let fixture = ChatFixture { server, chat_log, other_log };
    assert!(
        wait_until(WAIT, || {
            snapshot(&fixture.chat_log)
                .iter()
                .filter(|e| matches!(e, Seen::Established(_)))
                .count()
                == 2
                && snapshot(&fixture.other_log)
                    .iter()
                    .any(|e| matches!(e, Seen::Established(_)))
        }),
        "three establishments expected"
    );
    (fixture, a, b, c)
}

#[test]
fn in_loop_broadcast_reaches_protocol_members_in_slot_order() {
    let (fixture, mut a, b, _c) = chat_setup();

    a.send_text(b"x");

    assert!(
        wait_until(WAIT, || broadcasts_in(&fixture.chat_log).len() == 2),
        "both chat members should hear the broadcast, got {:?}",
        snapshot(&fixture.chat_log)
    );

    let heard = broadcasts_in(&fixture.chat_log);
    assert_eq!(
        heard,
        vec![(a.addr(), b"x".to_vec()), (b.addr(), b"x".to_vec())],
        "recipients in slot order (a before b), payload intact"
    );
    assert!(
        broadcasts_in(&fixture.other_log).is_empty(),
        "the bystander protocol hears nothing"
    );
    fixture.server.shutdown().unwrap();
}

#[test]
fn cross_context_broadcast_matches_the_in_loop_recipient_set() {
    let (fixture, a, b, _c) = chat_setup();

    let writer = fixture.server.broadcaster("chat").unwrap();
    assert_eq!(writer.protocol(), "chat");
    let accepted = writer.send(b"y").unwrap();
    assert_eq!(accepted, 1, "one payload byte accepted by the kernel");

    assert!(
        wait_until(WAIT, || broadcasts_in(&fixture.chat_log).len() == 2),
        "both chat members should hear the external broadcast, got {:?}",
        snapshot(&fixture.chat_log)
    );

    let heard = broadcasts_in(&fixture.chat_log);
    assert_eq!(
        heard,
        vec![(a.addr(), b"y".to_vec()), (b.addr(), b"y".to_vec())]
    );
    assert!(broadcasts_in(&fixture.other_log).is_empty());
    fixture.server.shutdown().unwrap();
}

#[test]
fn external_writer_only_reaches_established_connections() {
    init_test_logging();
    let chat_log = new_log();
    let server = ServerBuilder::new()
        .addr(localhost())
        .protocol(rebroadcasting_chat(&chat_log))
        .spawn()
        .unwrap();

    // One established member, one still stuck in the HTTP state.
    let mut established = WsClient::connect(server.local_addr());
    established.upgrade("/", Some("chat"));
    let _pending = WsClient::connect(server.local_addr());

    assert!(wait_until(WAIT, || {
        snapshot(&chat_log).iter().any(|e| matches!(e, Seen::Established(_)))
    }));

    let writer = server.broadcaster("chat").unwrap();
    writer.send(b"z").unwrap();

    assert!(
        wait_until(WAIT, || broadcasts_in(&chat_log).len() == 1),
        "exactly the established member hears it"
    );
    assert_eq!(broadcasts_in(&chat_log), vec![(established.addr(), b"z".to_vec())]);
    server.shutdown().unwrap();
}

#[test]
fn overload_closes_the_extra_connection_without_callbacks() {
    init_test_logging();
    let log = new_log();
    // listener + 1 ingress + 2 connection slots
    let server = ServerBuilder::new()
        .addr(localhost())
        .max_clients(4)
        .protocol(recorder("chat", &log))
        .spawn()
        .unwrap();

    let mut first = WsClient::connect(server.local_addr());
    first.upgrade("/", None);
    let mut second = WsClient::connect(server.local_addr());
    second.upgrade("/", None);

    assert!(
        wait_until(WAIT, || {
            snapshot(&log)
                .iter()
                .filter(|e| matches!(e, Seen::Established(_)))
                .count()
                == 2
        }),
        "the first two clients establish"
    );

    let mut third = WsClient::connect(server.local_addr());
    assert!(
        third.observes_eof(),
        "the overflow connection is accepted and immediately closed"
    );

    let events = snapshot(&log);
    let established = events.iter().filter(|e| matches!(e, Seen::Established(_))).count();
    assert_eq!(established, 2, "no callback ever fires for the overflow socket");

    // The established members are unaffected.
    first.send_text(b"ok");
    assert!(
        wait_until(WAIT, || snapshot(&log).iter().any(|e| matches!(e, Seen::Receive(..)))),
        "existing connections keep working"
    );
    server.shutdown().unwrap();
}

#[test]
fn dropping_the_writer_frees_its_slot() {
    init_test_logging();
    let log = new_log();
    // listener + ingress + 1 writer or 1 client
    let server = ServerBuilder::new()
        .addr(localhost())
        .max_clients(3)
        .protocol(recorder("chat", &log))
        .spawn()
        .unwrap();

    let writer = server.broadcaster("chat").unwrap();
    writer.send(b"warm").unwrap();
    // Let the loop accept the writer's loopback connection into a slot.
    std::thread::sleep(Duration::from_millis(200));

    // Table is full: a client gets accepted then closed.
    let mut refused = WsClient::connect(server.local_addr());
    assert!(refused.observes_eof());

    drop(writer);
    // The hangup makes the forwarder slot readable; the loop reaps it on
    // the next pass.
    std::thread::sleep(Duration::from_millis(500));

    let mut retry = WsClient::connect(server.local_addr());
    retry.upgrade("/", None);
    assert!(
        wait_until(WAIT, || !snapshot(&log).is_empty()),
        "slot freed by the departed writer serves a new client"
    );
    server.shutdown().unwrap();
}
