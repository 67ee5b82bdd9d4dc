//! Service Queue Integration Tests

mod common;
mod message_types;

use common::*;
use message_types::*;
use relaymq::prelude::*;
use relaymq::NodeRole;
use std::collections::HashSet;
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

// ============================================================================
// Helper Functions
// ============================================================================

fn reader(engine: &Engine, endpoint: &Endpoint) -> (ServiceQueueReader, Receiver<String>) {
    let reader = ServiceQueueReader::new(engine);
    let (tx, received) = channel();
    let _ = reader.on_message(move |message| {
        let _ = tx.send(text_of(message));
    });
    reader.connect(endpoint).expect("Failed to connect reader");
    (reader, received)
}

fn writer(engine: &Engine, endpoint: &Endpoint) -> ServiceQueueWriter {
    let writer = ServiceQueueWriter::new(engine);
    writer.connect(endpoint).expect("Failed to connect writer");
    writer
}

fn drain(received: &Receiver<String>) -> Vec<String> {
    let mut texts = Vec::new();
    while let Ok(text) = received.recv_timeout(Duration::from_millis(200)) {
        texts.push(text);
    }
    texts
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn each_message_goes_to_exactly_one_reader() {
    for transport in TRANSPORTS {
        let engine = build_engine();
        let queue = ServiceQueue::new(&engine);
        let endpoint = queue.bind(bind_address(transport, "sq-round-robin")).unwrap();

        let (_first, first_received) = reader(&engine, &endpoint);
        let (_second, second_received) = reader(&engine, &endpoint);
        assert!(wait_until(|| queue.reader_count() == 2), "{transport}");

        let writer = writer(&engine, &endpoint);
        for i in 0..10 {
            writer.send(&TextMessage::new(format!("job {i}"))).unwrap();
        }

        let first = drain(&first_received);
        let second = drain(&second_received);
        assert_eq!(first.len(), 5, "{transport}: {first:?}");
        assert_eq!(second.len(), 5, "{transport}: {second:?}");

        let all: HashSet<_> = first.iter().chain(second.iter()).cloned().collect();
        assert_eq!(all.len(), 10, "{transport}");
    }
}

#[test]
fn backlog_is_flushed_to_first_reader() {
    for transport in TRANSPORTS {
        let engine = build_engine();
        let queue = ServiceQueue::new(&engine);
        let endpoint = queue.bind(bind_address(transport, "sq-backlog")).unwrap();

        let writer = writer(&engine, &endpoint);
        for i in 0..3 {
            writer.send(&TextMessage::new(format!("early {i}"))).unwrap();
        }
        assert!(wait_until(|| queue.backlog_len() == 3), "{transport}");

        let (_reader, received) = reader(&engine, &endpoint);
        let expected: Vec<String> = (0..3).map(|i| format!("early {i}")).collect();
        let texts: Vec<String> = (0..3)
            .map(|_| received.recv_timeout(WAIT).expect("Backlog not flushed"))
            .collect();
        assert_eq!(texts, expected, "{transport}");
        assert_eq!(queue.backlog_len(), 0, "{transport}");
    }
}

#[test]
fn reader_leaving_rotation() {
    let engine = build_engine();
    let queue = ServiceQueue::new(&engine);
    let endpoint = queue.bind("inproc://sq-leaving").unwrap();

    let (leaving, _leaving_received) = reader(&engine, &endpoint);
    let (_staying, staying_received) = reader(&engine, &endpoint);
    assert!(wait_until(|| queue.reader_count() == 2));

    leaving.disconnect();
    assert!(wait_until(|| queue.reader_count() == 1));

    let writer = writer(&engine, &endpoint);
    for i in 0..4 {
        writer.send(&TextMessage::new(format!("job {i}"))).unwrap();
    }
    assert_eq!(drain(&staying_received).len(), 4);
}

#[test]
fn writer_send_requires_connection() {
    let engine = build_engine();
    let writer = ServiceQueueWriter::new(&engine);
    let result = writer.send(&TextMessage::new("nowhere"));
    assert!(matches!(result, Err(Error::NotConnected)), "{result:?}");
}

#[test]
fn service_queue_roles_are_enforced() {
    let engine = build_engine();
    let queue = ServiceQueue::new(&engine);
    let endpoint = queue.bind("inproc://sq-roles").unwrap();

    let subscriber = Subscriber::new(&engine);
    let result = subscriber.connect(&endpoint);
    assert!(
        matches!(
            result,
            Err(Error::RoleMismatch {
                local: NodeRole::Subscriber,
                remote: NodeRole::ServiceQueue
            })
        ),
        "{result:?}"
    );

    let publisher = Publisher::new(&engine);
    let publisher_endpoint = publisher.bind("inproc://sq-roles-publisher").unwrap();
    let writer = ServiceQueueWriter::new(&engine);
    assert!(matches!(
        writer.connect(&publisher_endpoint),
        Err(Error::RoleMismatch { .. })
    ));
}
