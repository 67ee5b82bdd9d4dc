//! Echo example - request/response with a responder and a requester
//!
//! ## What it shows
//!
//! - A [`Responder`] answering every request through a closure
//! - Blocking, timed and cancellable asynchronous requests
//! - Running both ends in one process over `inproc://`, or across processes
//!   over TCP
//!
//! # Usage
//!
//! ```bash
//! # Both ends in this process
//! cargo run --example echo
//!
//! # Separate processes
//! cargo run --example echo -- serve --bind tcp://127.0.0.1:5556
//! cargo run --example echo -- ask --connect tcp://127.0.0.1:5556 hello world
//! ```

use bincode::{Decode, Encode};
use clap::{Parser, Subcommand};
use config::Config;
use futures::executor::block_on;
use relaymq::prelude::*;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Encode, Decode, Debug)]
struct EchoRequest {
    text: String,
    delay_ms: u64,
}
impl_message!(EchoRequest, 1);

#[derive(Encode, Decode, Debug)]
struct EchoResponse {
    text: String,
}
impl_message!(EchoResponse, 2);

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("relaymq={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Echo requests through a responder", long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Mode {
    /// Answer requests until interrupted
    Serve {
        #[arg(short, long, default_value = "tcp://127.0.0.1:5556")]
        bind: String,
    },
    /// Send each word as a request and print the answers
    Ask {
        #[arg(short, long, default_value = "tcp://127.0.0.1:5556")]
        connect: String,

        words: Vec<String>,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let mut registry = MessageRegistry::new();
    register_bincode_message!(registry, EchoRequest);
    register_bincode_message!(registry, EchoResponse);

    let engine = match Engine::new_named(&config, &registry, "echo") {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Failed to start engine: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.mode {
        Some(Mode::Serve { bind }) => serve(&engine, &bind),
        Some(Mode::Ask { connect, words }) => ask(&engine, &connect, &words),
        None => local(&engine),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Modes
// ============================================================================

fn responder(engine: &Engine) -> Responder {
    Responder::new(engine, |request: Box<dyn Message>| -> Box<dyn Message> {
        match request.downcast::<EchoRequest>() {
            Ok(request) => {
                thread::sleep(Duration::from_millis(request.delay_ms));
                Box::new(EchoResponse { text: request.text })
            }
            Err(other) => Box::new(EchoResponse {
                text: format!("unexpected request {other:?}"),
            }),
        }
    })
}

fn serve(engine: &Engine, bind: &str) -> Result<(), Box<dyn std::error::Error>> {
    let responder = responder(engine);
    let _connected = responder.on_client_connected(|info| println!("Requester connected from {}", info.peer));
    let _disconnected = responder.on_client_disconnected(|info| println!("Requester {} left", info.peer));
    let endpoint = responder.bind(bind)?;
    println!("Answering requests on {endpoint}");
    loop {
        thread::park();
    }
}

fn ask(engine: &Engine, connect: &str, words: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let requester = Requester::new(engine);
    requester.connect(connect)?;
    for word in words {
        let response: EchoResponse = requester.request_as(&EchoRequest {
            text: word.clone(),
            delay_ms: 0,
        })?;
        println!("{word} -> {}", response.text);
    }
    Ok(())
}

fn local(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let responder = responder(engine);
    let endpoint = responder.bind("inproc://echo")?;

    let requester = Requester::new(engine);
    requester.connect(&endpoint)?;

    // Blocking
    let response: EchoResponse = requester.request_as(&EchoRequest {
        text: "Hello, World!".to_string(),
        delay_ms: 0,
    })?;
    println!("Blocking request answered: {}", response.text);

    // Timed out; the connection stays usable
    let timed_out = requester.request_timeout(
        &EchoRequest {
            text: "too slow".to_string(),
            delay_ms: 500,
        },
        Some(Duration::from_millis(50)),
    );
    println!("Slow request: {:?}", timed_out.map(|_| ()));

    // Two asynchronous requests, one cancelled before its answer arrives
    let token = CancellationToken::new();
    let cancelled = requester.request_async(
        &EchoRequest {
            text: "never seen".to_string(),
            delay_ms: 500,
        },
        Some(token.clone()),
    );
    let answered = requester.request_async(
        &EchoRequest {
            text: "async".to_string(),
            delay_ms: 0,
        },
        None,
    );
    token.cancel();
    println!("Cancelled request: {:?}", block_on(cancelled).map(|_| ()));
    let response: EchoResponse = relaymq::downcast_response(block_on(answered)?)?;
    println!("Async request answered: {}", response.text);

    requester.disconnect();
    responder.close();
    Ok(())
}
