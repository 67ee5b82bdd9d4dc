//! Ticker example - publish/subscribe and a service queue
//!
//! ## What it shows
//!
//! - A [`Publisher`] broadcasting price ticks to every [`Subscriber`]
//! - A [`ServiceQueue`] handing jobs to one of several readers
//! - Disconnect notifications when the publisher goes away
//!
//! # Usage
//!
//! ```bash
//! # Everything in this process over inproc://
//! cargo run --example ticker
//!
//! # Separate processes over TCP
//! cargo run --example ticker -- publish --bind tcp://127.0.0.1:5555
//! cargo run --example ticker -- subscribe --connect tcp://127.0.0.1:5555
//! ```

use bincode::{Decode, Encode};
use clap::{Parser, Subcommand};
use config::Config;
use relaymq::prelude::*;
use std::process::ExitCode;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Encode, Decode, Debug)]
struct Tick {
    symbol: String,
    price: f64,
    seq: u64,
}
impl_message!(Tick, 10);

#[derive(Encode, Decode, Debug)]
struct Job {
    id: u32,
}
impl_message!(Job, 11);

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
#[command(author, version, about = "Price ticker over publish/subscribe", long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Option<Mode>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Mode {
    /// Publish a tick every interval
    Publish {
        #[arg(short, long, default_value = "tcp://127.0.0.1:5555")]
        bind: String,

        /// Milliseconds between ticks
        #[arg(short, long, default_value_t = 500)]
        interval: u64,
    },
    /// Print every tick received
    Subscribe {
        #[arg(short, long, default_value = "tcp://127.0.0.1:5555")]
        connect: String,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut registry = MessageRegistry::new();
    register_bincode_message!(registry, Tick);
    register_bincode_message!(registry, Job);

    let engine = match Engine::new(&Config::default(), &registry) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Failed to start engine: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.mode {
        Some(Mode::Publish { bind, interval }) => publish(&engine, &bind, Duration::from_millis(interval)),
        Some(Mode::Subscribe { connect }) => subscribe(&engine, &connect),
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

fn print_tick(name: &'static str) -> impl Fn(&dyn Message) + Send + Sync + 'static {
    move |message: &dyn Message| {
        if let Some(tick) = message.downcast_ref::<Tick>() {
            println!("[{name}] #{} {} {:.2}", tick.seq, tick.symbol, tick.price);
        }
    }
}

fn publish(engine: &Engine, bind: &str, interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let publisher = Publisher::new(engine);
    let endpoint = publisher.bind(bind)?;
    println!("Publishing on {endpoint}");

    let mut price = 100.0;
    for seq in 0.. {
        price += if seq % 3 == 0 { -0.25 } else { 0.5 };
        publisher.publish(&Tick {
            symbol: "RMQ".to_string(),
            price,
            seq,
        })?;
        thread::sleep(interval);
    }
    Ok(())
}

fn subscribe(engine: &Engine, connect: &str) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = Subscriber::new(engine);
    let _ticks = subscriber.on_message(print_tick("ticks"));
    let (gone_tx, gone) = channel();
    let _gone = subscriber.on_disconnected(move |_| {
        let _ = gone_tx.send(());
    });
    subscriber.connect(connect)?;

    let _ = gone.recv();
    println!("Publisher went away");
    Ok(())
}

fn local(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    // Publish/subscribe
    let publisher = Publisher::new(engine);
    let endpoint = publisher.bind("inproc://ticker")?;

    let first = Subscriber::new(engine);
    let _first_ticks = first.on_message(print_tick("first"));
    first.connect(&endpoint)?;
    let second = Subscriber::new(engine);
    let _second_ticks = second.on_message(print_tick("second"));
    second.connect(&endpoint)?;

    while publisher.subscriber_count() < 2 {
        thread::sleep(Duration::from_millis(1));
    }
    for seq in 0..5 {
        publisher.publish(&Tick {
            symbol: "RMQ".to_string(),
            price: 100.0 + seq as f64,
            seq,
        })?;
    }
    thread::sleep(Duration::from_millis(100));
    publisher.close();

    // Service queue: each job goes to one worker
    let queue = ServiceQueue::new(engine);
    let endpoint = queue.bind("inproc://jobs")?;
    let workers: Vec<_> = ["alpha", "beta"]
        .into_iter()
        .map(|name| {
            let reader = ServiceQueueReader::new(engine);
            let _jobs = reader.on_message(move |message| {
                if let Some(job) = message.downcast_ref::<Job>() {
                    println!("[{name}] job {}", job.id);
                }
            });
            reader.connect(&endpoint).map(|()| reader)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    while queue.reader_count() < workers.len() {
        thread::sleep(Duration::from_millis(1));
    }

    let writer = ServiceQueueWriter::new(engine);
    writer.connect(&endpoint)?;
    for id in 0..6 {
        writer.send(&Job { id })?;
    }
    thread::sleep(Duration::from_millis(100));
    Ok(())
}
