//! Request/Response Integration Tests
//!
//! Every scenario runs over both the in-process and the TCP transport.

mod common;
mod message_types;

use common::*;
use futures::executor::block_on;
use futures::future::join;
use message_types::*;
use relaymq::prelude::*;
use relaymq::{downcast_response, NodeRole};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLOW_DELAY: Duration = Duration::from_millis(1000);

// ============================================================================
// Helper Functions
// ============================================================================

/// Echoes text back with an "echo: " prefix. Requests whose text starts with
/// "slow" are answered after [`SLOW_DELAY`].
fn echo_responder(engine: &Engine) -> Responder {
    Responder::new(engine, |request: Box<dyn Message>| -> Box<dyn Message> {
        let request = request
            .downcast::<TextMessage>()
            .expect("Responder expects TextMessage");
        if request.text.starts_with("slow") {
            thread::sleep(SLOW_DELAY);
        }
        Box::new(TextMessage::new(format!("echo: {}", request.text)))
    })
}

fn connected_pair(transport: &str, name: &str) -> (Engine, Responder, Requester) {
    let engine = build_engine();
    let responder = echo_responder(&engine);
    let endpoint = responder
        .bind(bind_address(transport, name))
        .expect("Failed to bind responder");

    let requester = Requester::new(&engine);
    requester
        .connect(&endpoint)
        .expect("Failed to connect requester");
    (engine, responder, requester)
}

fn request_text(requester: &Requester, text: &str) -> String {
    let response = requester
        .request(&TextMessage::new(text))
        .expect("Request failed");
    text_of(response.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn single_request() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-single");
        assert_eq!(request_text(&requester, "hello"), "echo: hello", "{transport}");
    }
}

#[test]
fn async_request() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-async");
        let response = block_on(requester.request_async(&TextMessage::new("hello"), None))
            .expect("Async request failed");
        assert_eq!(text_of(response.as_ref()), "echo: hello", "{transport}");
    }
}

#[test]
fn typed_request() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-typed");
        let response: TextMessage = requester
            .request_as(&TextMessage::new("typed"))
            .expect("Typed request failed");
        assert_eq!(response.text, "echo: typed", "{transport}");

        let wrong = requester.request_as::<ByteVector>(&TextMessage::new("typed"));
        assert!(
            matches!(wrong, Err(RequestError::WrongResponseType { .. })),
            "{transport}: {wrong:?}"
        );
    }
}

#[test]
fn sequential_requests() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-sequential");
        assert_eq!(request_text(&requester, "first"), "echo: first", "{transport}");
        assert_eq!(request_text(&requester, "second"), "echo: second", "{transport}");
    }
}

#[test]
fn simultaneous_async_requests_complete_in_order() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-simultaneous");
        let first = requester.request_async(&TextMessage::new("first"), None);
        let second = requester.request_async(&TextMessage::new("second"), None);

        let (first, second) = block_on(join(first, second));
        assert_eq!(text_of(first.unwrap().as_ref()), "echo: first", "{transport}");
        assert_eq!(text_of(second.unwrap().as_ref()), "echo: second", "{transport}");
    }
}

#[test]
fn concurrent_callers_get_their_own_responses() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-concurrent");
        let requester = Arc::new(requester);

        let callers: Vec<_> = (0..4)
            .map(|caller| {
                let requester = requester.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let text = format!("caller {caller} request {i}");
                        assert_eq!(request_text(&requester, &text), format!("echo: {text}"));
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().expect("Caller panicked");
        }
        assert_eq!(requester.pending_count(), 0, "{transport}");
    }
}

#[test]
fn large_message() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-large");
        let text = "x".repeat(1024 * 1024);
        let response = request_text(&requester, &text);
        assert_eq!(response.len(), text.len() + "echo: ".len(), "{transport}");
        assert!(response.ends_with(&text), "{transport}");
    }
}

#[test]
fn cancelled_request_does_not_disturb_later_ones() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-cancel");

        let token = CancellationToken::new();
        token.cancel_after(Duration::from_millis(100));
        let started = Instant::now();
        let result = block_on(requester.request_async(&TextMessage::new("slow"), Some(token)));
        assert_eq!(result.unwrap_err(), RequestError::Cancelled, "{transport}");
        assert!(started.elapsed() < SLOW_DELAY, "{transport}: cancel took {:?}", started.elapsed());

        // The cancelled request's response is still in flight; it must be
        // discarded rather than handed to the next request.
        assert!(!requester.is_disconnected(), "{transport}");
        assert_eq!(request_text(&requester, "after"), "echo: after", "{transport}");
    }
}

#[test]
fn already_cancelled_token_fails_immediately() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-precancel");
        let token = CancellationToken::new();
        token.cancel();

        let result = block_on(requester.request_async(&TextMessage::new("never"), Some(token)));
        assert_eq!(result.unwrap_err(), RequestError::Cancelled, "{transport}");
        assert_eq!(request_text(&requester, "after"), "echo: after", "{transport}");
    }
}

#[test]
fn blocking_request_times_out_and_connection_survives() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-timeout");

        let result = requester.request_timeout(&TextMessage::new("slow"), Some(Duration::from_millis(100)));
        assert_eq!(result.unwrap_err(), RequestError::Timeout, "{transport}");

        assert!(!requester.is_disconnected(), "{transport}");
        assert_eq!(request_text(&requester, "after"), "echo: after", "{transport}");
    }
}

#[test]
fn pending_requests_fail_on_disconnect() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-pending");

        let pending = requester.request_async(&TextMessage::new("slow"), None);
        thread::sleep(Duration::from_millis(100));
        requester.disconnect();

        assert_eq!(block_on(pending).unwrap_err(), RequestError::ConnectionClosed, "{transport}");
        assert!(requester.is_disconnected(), "{transport}");

        let after = requester.request(&TextMessage::new("after"));
        assert_eq!(after.unwrap_err(), RequestError::NotConnected, "{transport}");
    }
}

#[test]
fn request_before_connect_fails() {
    let engine = build_engine();
    let requester = Requester::new(&engine);
    assert!(requester.is_disconnected());

    let result = requester.request(&TextMessage::new("nobody"));
    assert_eq!(result.unwrap_err(), RequestError::NotConnected);

    let result = block_on(requester.request_async(&TextMessage::new("nobody"), None));
    assert_eq!(result.unwrap_err(), RequestError::NotConnected);
}

#[test]
fn unregistered_request_type_is_rejected() {
    for transport in TRANSPORTS {
        let (_engine, _responder, requester) = connected_pair(transport, "rr-unregistered");
        let result = requester.request(&UnregisteredMessage { id: 1 });
        assert!(matches!(result, Err(RequestError::Serialize(_))), "{transport}: {result:?}");
        assert_eq!(request_text(&requester, "after"), "echo: after", "{transport}");
    }
}

#[test]
fn client_connected_and_disconnected_events() {
    for transport in TRANSPORTS {
        let engine = build_engine();
        let responder = echo_responder(&engine);
        let (connected_tx, connected) = channel();
        let (disconnected_tx, disconnected) = channel();
        let _on_connect = responder.on_client_connected(move |info| {
            let _ = connected_tx.send(info.clone());
        });
        let _on_disconnect = responder.on_client_disconnected(move |info| {
            let _ = disconnected_tx.send(info.clone());
        });

        let endpoint = responder.bind(bind_address(transport, "rr-events")).unwrap();
        let requester = Requester::new(&engine);
        requester.connect(&endpoint).unwrap();

        let info = connected.recv_timeout(WAIT).expect("No ClientConnected event");
        assert_eq!(info.local_role, NodeRole::Responder, "{transport}");
        assert_eq!(info.remote_role, NodeRole::Requester, "{transport}");
        assert!(wait_until(|| responder.client_count() == 1), "{transport}");

        requester.disconnect();
        let gone = disconnected.recv_timeout(WAIT).expect("No ClientDisconnected event");
        assert_eq!(gone.id, info.id, "{transport}");
        assert!(wait_until(|| responder.client_count() == 0), "{transport}");
    }
}

#[test]
fn requester_sees_responder_close() {
    for transport in TRANSPORTS {
        let (_engine, responder, requester) = connected_pair(transport, "rr-server-close");
        let (tx, disconnected) = channel();
        let _subscription = requester.on_disconnected(move |info| {
            let _ = tx.send(info.clone());
        });

        responder.close();
        let info = disconnected.recv_timeout(WAIT).expect("No Disconnected event");
        assert_eq!(info.local_role, NodeRole::Requester, "{transport}");
        assert_eq!(info.remote_role, NodeRole::Responder, "{transport}");
        assert!(requester.is_disconnected(), "{transport}");
    }
}

#[test]
fn unsubscribed_listener_is_not_called() {
    let (_engine, responder, requester) = connected_pair("inproc", "rr-unsubscribe");
    let (tx, disconnected) = channel::<()>();
    let subscription = requester.on_disconnected(move |_| {
        let _ = tx.send(());
    });
    subscription.unsubscribe();

    responder.close();
    assert!(wait_until(|| requester.is_disconnected()));
    assert!(disconnected.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn reconnect_after_disconnect() {
    for transport in TRANSPORTS {
        let (_engine, responder, requester) = connected_pair(transport, "rr-reconnect");
        let endpoint = responder.endpoints().pop().unwrap();

        assert_eq!(request_text(&requester, "one"), "echo: one", "{transport}");
        requester.disconnect();
        requester.connect(&endpoint).unwrap();
        assert_eq!(request_text(&requester, "two"), "echo: two", "{transport}");
    }
}

#[test]
fn connect_twice_fails() {
    let (_engine, responder, requester) = connected_pair("inproc", "rr-connect-twice");
    let endpoint = responder.endpoints().pop().unwrap();
    let result = requester.connect(&endpoint);
    assert!(matches!(result, Err(Error::AlreadyConnected(_))), "{result:?}");
}

#[test]
fn role_mismatch_is_rejected() {
    for transport in TRANSPORTS {
        let engine = build_engine();
        let publisher = Publisher::new(&engine);
        let endpoint = publisher.bind(bind_address(transport, "rr-mismatch")).unwrap();

        let requester = Requester::new(&engine);
        let result = requester.connect(&endpoint);
        assert!(
            matches!(
                result,
                Err(Error::RoleMismatch {
                    local: NodeRole::Requester,
                    remote: NodeRole::Publisher
                })
            ),
            "{transport}: {result:?}"
        );
        assert!(requester.is_disconnected(), "{transport}");
        assert!(wait_until(|| publisher.subscriber_count() == 0), "{transport}");
    }
}

#[test]
fn connect_to_unbound_inproc_endpoint() {
    let engine = build_engine();
    let requester = Requester::new(&engine);

    let result = requester.connect_timeout("inproc://rr-nobody-home", None);
    assert!(matches!(result, Err(Error::Connection { .. })), "{result:?}");

    let result = requester.connect_timeout("inproc://rr-nobody-home", Some(Duration::from_millis(50)));
    assert!(matches!(result, Err(Error::ConnectTimeout { .. })), "{result:?}");
}

#[test]
fn connect_waits_for_late_inproc_bind() {
    let engine = build_engine();
    let requester = Requester::new(&engine);

    let binder = {
        let engine = engine.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let responder = echo_responder(&engine);
            responder.bind("inproc://rr-late-bind").unwrap();
            responder
        })
    };

    requester
        .connect_timeout("inproc://rr-late-bind", Some(WAIT))
        .expect("Connect should wait for the bind");
    let _responder = binder.join().unwrap();
    assert_eq!(request_text(&requester, "late"), "echo: late");
}

#[test]
fn connect_waits_for_late_tcp_bind() {
    let engine = build_engine();
    let requester = Requester::new(&engine);

    // Reserve a free port, then leave it for the responder to bind later.
    let address = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let endpoint = format!("tcp://{address}");

    let binder = {
        let engine = engine.clone();
        let endpoint = endpoint.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let responder = echo_responder(&engine);
            responder.bind(endpoint.as_str()).unwrap();
            responder
        })
    };

    requester
        .connect_timeout(endpoint.as_str(), Some(WAIT))
        .expect("Connect should wait for the bind");
    let _responder = binder.join().unwrap();
    assert_eq!(request_text(&requester, "late"), "echo: late");
}

#[test]
fn connect_to_unbound_tcp_endpoint() {
    let engine = build_engine();
    let requester = Requester::new(&engine);
    let address = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let endpoint = format!("tcp://{address}");

    let result = requester.connect_timeout(endpoint.as_str(), None);
    assert!(matches!(result, Err(Error::Connection { .. })), "{result:?}");

    let started = Instant::now();
    let result = requester.connect_timeout(endpoint.as_str(), Some(Duration::from_millis(100)));
    assert!(matches!(result, Err(Error::ConnectTimeout { .. })), "{result:?}");
    assert!(started.elapsed() < WAIT);
}

#[test]
fn panicking_handler_closes_the_connection() {
    for transport in TRANSPORTS {
        let engine = build_engine();
        let responder = Responder::new(&engine, |request: Box<dyn Message>| -> Box<dyn Message> {
            let request = request
                .downcast::<TextMessage>()
                .expect("Responder expects TextMessage");
            if request.text == "boom" {
                panic!("handler gave up");
            }
            Box::new(TextMessage::new(format!("echo: {}", request.text)))
        });
        let endpoint = responder.bind(bind_address(transport, "rr-handler-panic")).unwrap();

        let requester = Requester::new(&engine);
        requester.connect(&endpoint).unwrap();
        assert_eq!(request_text(&requester, "fine"), "echo: fine", "{transport}");
        assert!(wait_until(|| responder.client_count() == 1), "{transport}");

        let result = requester.request(&TextMessage::new("boom"));
        assert!(matches!(result, Err(RequestError::ConnectionClosed)), "{transport}: {result:?}");
        assert!(requester.is_disconnected(), "{transport}");
        assert!(wait_until(|| responder.client_count() == 0), "{transport}");
    }
}

#[test]
fn responder_serves_requesters_concurrently() {
    for transport in TRANSPORTS {
        let engine = build_engine();
        let responder = echo_responder(&engine);
        let endpoint = responder.bind(bind_address(transport, "rr-parallel")).unwrap();

        let slow = Requester::new(&engine);
        slow.connect(&endpoint).unwrap();
        let fast = Requester::new(&engine);
        fast.connect(&endpoint).unwrap();

        let pending = slow.request_async(&TextMessage::new("slow"), None);
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        assert_eq!(request_text(&fast, "fast"), "echo: fast", "{transport}");
        assert!(started.elapsed() < SLOW_DELAY, "{transport}: fast request waited behind slow one");

        let response = block_on(pending).unwrap();
        let response: TextMessage = downcast_response(response).unwrap();
        assert_eq!(response.text, "echo: slow", "{transport}");
    }
}
