//! Setup shared by the integration tests.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! # Info level (equivalent to -v)
//! TEST_LOG=1 cargo test request_response -- --nocapture
//!
//! # Debug level (equivalent to -vv)
//! TEST_LOG=2 cargo test request_response -- --nocapture
//!
//! # Trace level (equivalent to -vvv)
//! TEST_LOG=3 cargo test request_response -- --nocapture
//! ```

use crate::message_types::*;
use relaymq::prelude::*;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Both transports; every scenario runs against each.
pub const TRANSPORTS: [&str; 2] = ["inproc", "tcp"];

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("relaymq={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn register_all_messages(registry: &mut MessageRegistry) {
    register_bincode_message!(registry, TextMessage);
    register_bincode_message!(registry, ByteVector);
    register_bincode_message!(registry, SimpleMessage);
}

pub fn build_config() -> config::Config {
    config::Config::builder()
        .set_default("dispatcher_workers", 2)
        .unwrap()
        .set_default("max_batch_size", 16)
        .unwrap()
        .set_default("request_timeout_ms", 5000)
        .unwrap()
        .set_default("connect_timeout_ms", 2000)
        .unwrap()
        .build()
        .unwrap()
}

pub fn build_engine() -> Engine {
    init_tracing();
    let mut registry = MessageRegistry::new();
    register_all_messages(&mut registry);
    Engine::new(&build_config(), &registry).expect("Failed to create engine")
}

/// Endpoint to bind for `transport`. In-process names must be unique across
/// the tests of one binary; TCP binds an ephemeral port.
pub fn bind_address(transport: &str, name: &str) -> String {
    match transport {
        "inproc" => format!("inproc://{name}"),
        "tcp" => "tcp://127.0.0.1:0".to_string(),
        other => panic!("unknown transport {other}"),
    }
}

pub fn text_of(message: &dyn Message) -> String {
    message
        .downcast_ref::<TextMessage>()
        .expect("Expected a TextMessage")
        .text
        .clone()
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
