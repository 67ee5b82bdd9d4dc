//! Raw TCP Peer Tests
//!
//! The far end of each connection is a bare socket writing the wire format by
//! hand, so it can stop reading or send broken frames.

mod common;
mod message_types;

use common::*;
use message_types::*;
use relaymq::prelude::*;
use relaymq::{encode_frame, read_frame, MessageFrame, NodeRole, Settings, HANDSHAKE_TYPE_ID};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::channel;
use std::thread::{self, JoinHandle};

const BLOCK_SIZE: usize = 1024 * 1024;
const BLOCKS: usize = 32;

// ============================================================================
// Helper Functions
// ============================================================================

fn handshake_bytes(role: NodeRole) -> Vec<u8> {
    let mut payload = b"rfmq".to_vec();
    payload.extend_from_slice(&[0, 1, role.as_u8()]);
    encode_frame(&MessageFrame::new(HANDSHAKE_TYPE_ID, payload)).unwrap()
}

/// Connects a bare socket to `endpoint` and handshakes as `role`.
fn raw_client(endpoint: &Endpoint, role: NodeRole) -> TcpStream {
    let mut stream = TcpStream::connect(endpoint.address()).unwrap();
    stream.write_all(&handshake_bytes(role)).unwrap();
    let reply = read_frame(&mut stream, 64).unwrap().expect("Handshake reply");
    assert_eq!(reply.type_id(), HANDSHAKE_TYPE_ID);
    stream
}

/// Listens as a responder that reads one request, writes `reply` and hangs up.
fn raw_responder(reply: Vec<u8>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let hello = read_frame(&mut stream, 64).unwrap().expect("Requester handshake");
        assert_eq!(hello.type_id(), HANDSHAKE_TYPE_ID);
        stream.write_all(&handshake_bytes(NodeRole::Responder)).unwrap();
        read_frame(&mut stream, 1024).unwrap().expect("Request frame");
        stream.write_all(&reply).unwrap();
    });
    (endpoint, peer)
}

/// Sends one request to a raw responder answering with `reply` and checks
/// that the requester ends up cleanly disconnected.
fn request_with_broken_reply(reply: Vec<u8>) {
    let engine = build_engine();
    let (endpoint, peer) = raw_responder(reply);

    let requester = Requester::new(&engine);
    let (tx, disconnected) = channel();
    let _ = requester.on_disconnected(move |_info| {
        let _ = tx.send(());
    });
    requester.connect(endpoint.as_str()).unwrap();

    let result = requester.request_async(&TextMessage::new("hello"), None).wait();
    assert!(matches!(result, Err(RequestError::ConnectionClosed)), "{result:?}");
    assert!(requester.is_disconnected());
    disconnected.recv_timeout(WAIT).expect("Disconnect not reported");
    assert_eq!(requester.pending_count(), 0);
    peer.join().unwrap();
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn stalled_subscriber_does_not_hold_up_others() {
    init_tracing();
    let mut registry = MessageRegistry::new();
    register_all_messages(&mut registry);
    let settings = Settings {
        dispatcher_workers: 1,
        max_batch_size: 4,
        ..Settings::default()
    };
    let engine = Engine::with_settings(settings, &registry).unwrap();

    let publisher = Publisher::new(&engine);
    let endpoint = publisher.bind("tcp://127.0.0.1:0").unwrap();
    // Handshakes, then never reads another byte.
    let _stalled = raw_client(&endpoint, NodeRole::Subscriber);

    let healthy = Subscriber::new(&engine);
    let (tx, texts) = channel();
    let _ = healthy.on_message(move |message| {
        if let Some(text) = message.downcast_ref::<TextMessage>() {
            let _ = tx.send(text.text.clone());
        }
    });
    healthy.connect(&endpoint).unwrap();
    assert!(wait_until(|| publisher.subscriber_count() == 2));

    // Far more than the stalled socket can buffer.
    let block = ByteVector {
        data: vec![0u8; BLOCK_SIZE],
    };
    for _ in 0..BLOCKS {
        publisher.publish(&block).unwrap();
    }
    publisher.publish(&TextMessage::new("marker")).unwrap();

    let text = texts.recv_timeout(WAIT).expect("Healthy subscriber starved");
    assert_eq!(text, "marker");
    assert!(!healthy.is_disconnected());
}

#[test]
fn truncated_response_frame_disconnects() {
    // Three of the six header bytes.
    request_with_broken_reply(vec![1, 0, 9]);
}

#[test]
fn oversized_response_frame_disconnects() {
    let mut header = 1u16.to_le_bytes().to_vec();
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    request_with_broken_reply(header);
}

#[test]
fn garbage_handshake_is_rejected() {
    let engine = build_engine();
    let responder = Responder::new(&engine, |request: Box<dyn Message>| request);
    let endpoint = responder.bind("tcp://127.0.0.1:0").unwrap();

    let mut stream = TcpStream::connect(endpoint.address()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
        .write_all(&encode_frame(&MessageFrame::new(HANDSHAKE_TYPE_ID, b"nope".to_vec())).unwrap())
        .unwrap();

    // The server closes without registering a client. A reset counts too.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert_eq!(responder.client_count(), 0);
}
