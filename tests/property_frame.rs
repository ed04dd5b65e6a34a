//! Property tests for the frame codec.
//!
//! Verifies mask involution, encode/decode round-trips across the payload
//! length encodings, in-place header equivalence, and opcode parsing.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use wsmux::codec::{Decoder, Encoder};
use wsmux::frame::{apply_mask, encode_server_header, SERVER_HEADER_MAX};
use wsmux::{Frame, FrameCodec, Opcode};

fn arb_payload_any() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=2048)
}

fn arb_payload_boundary() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(0usize),
        Just(1),
        Just(125),
        Just(126),
        Just(127),
        Just(65535),
        Just(65536),
    ]
}

fn arb_data_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![Just(Opcode::Text), Just(Opcode::Binary)]
}

fn data_frame(opcode: Opcode, payload: Vec<u8>) -> Frame {
    match opcode {
        Opcode::Text => Frame::text(Bytes::from(payload)),
        Opcode::Binary => Frame::binary(Bytes::from(payload)),
        _ => unreachable!("data frames only"),
    }
}

proptest! {
    /// XOR masking is self-inverse for any payload and key.
    #[test]
    fn mask_involution(payload in arb_payload_any(), key in any::<[u8; 4]>()) {
        let mut data = payload.clone();
        apply_mask(&mut data, key);
        apply_mask(&mut data, key);
        prop_assert_eq!(data, payload);
    }

    /// Whatever a client-role codec emits, a server-role codec reads back.
    #[test]
    fn client_to_server_roundtrip(opcode in arb_data_opcode(), payload in arb_payload_any()) {
        let mut client = FrameCodec::client();
        let mut server = FrameCodec::server();

        let mut wire = BytesMut::new();
        client.encode(data_frame(opcode, payload.clone()), &mut wire).unwrap();

        let frame = server.decode(&mut wire).unwrap().expect("one complete frame");
        prop_assert_eq!(frame.opcode, opcode);
        prop_assert!(frame.fin);
        prop_assert_eq!(&frame.payload[..], &payload[..]);
        prop_assert!(wire.is_empty(), "no bytes left behind");
    }

    /// Server-role frames round-trip through a client-role decoder across
    /// every length-encoding boundary.
    #[test]
    fn server_to_client_roundtrip_at_boundaries(len in arb_payload_boundary()) {
        let payload = vec![0x42u8; len];
        let mut server = FrameCodec::server();
        let mut client = FrameCodec::client();

        let mut wire = BytesMut::new();
        server.encode(Frame::binary(Bytes::from(payload.clone())), &mut wire).unwrap();

        let frame = client.decode(&mut wire).unwrap().expect("one complete frame");
        prop_assert_eq!(frame.payload.len(), len);
        prop_assert_eq!(&frame.payload[..], &payload[..]);
    }

    /// Feeding the wire bytes one at a time decodes the same frame.
    #[test]
    fn byte_at_a_time_decode(payload in prop::collection::vec(any::<u8>(), 0..=300)) {
        let mut client = FrameCodec::client();
        let mut wire = BytesMut::new();
        client.encode(Frame::binary(Bytes::from(payload.clone())), &mut wire).unwrap();

        let mut server = FrameCodec::server();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            if let Some(frame) = server.decode(&mut buf).unwrap() {
                prop_assert_eq!(i, wire.len() - 1, "frame completes only on the last byte");
                decoded = Some(frame);
            }
        }
        let frame = decoded.expect("frame decoded");
        prop_assert_eq!(&frame.payload[..], &payload[..]);
    }

    /// The in-place header writer agrees with the streaming encoder for
    /// every payload length.
    #[test]
    fn in_place_header_equivalence(len in arb_payload_boundary(), opcode in arb_data_opcode()) {
        let mut head = [0u8; SERVER_HEADER_MAX];
        let head_len = encode_server_header(opcode, len, &mut head);

        let mut server = FrameCodec::server();
        let mut wire = BytesMut::new();
        server.encode(data_frame(opcode, vec![0u8; len]), &mut wire).unwrap();

        prop_assert_eq!(&wire[..head_len], &head[..head_len]);
        prop_assert_eq!(wire.len() - head_len, len, "header is followed by exactly the payload");
    }

    /// Reserved data opcodes never parse.
    #[test]
    fn reserved_opcodes_rejected(value in prop_oneof![3u8..=7u8, 0x0Bu8..=0x0Fu8]) {
        prop_assert!(Opcode::from_u8(value).is_err());
    }

    /// Valid opcodes round-trip through their wire value.
    #[test]
    fn opcode_wire_roundtrip(opcode in prop_oneof![
        Just(Opcode::Continuation),
        Just(Opcode::Text),
        Just(Opcode::Binary),
        Just(Opcode::Close),
        Just(Opcode::Ping),
        Just(Opcode::Pong),
    ]) {
        prop_assert_eq!(Opcode::from_u8(opcode as u8).unwrap(), opcode);
    }
}
