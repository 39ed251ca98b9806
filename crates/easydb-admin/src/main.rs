//! The `easydb-admin` server binary: owns the process lifecycle, the
//! listening socket, and per-connection threads. It opens one [`engine::Engine`]
//! and hands every accepted connection a clone of the `Arc` to work with.
//!
//! The SQL lexer, parser, planner and executor are out of scope for this
//! workspace (see the storage engine specification's Non-goals), so the
//! per-connection dispatcher in [`conn`] only understands the administrative
//! surface the engine actually implements: transaction lifecycle and catalog
//! introspection. A statement it doesn't recognize gets an honest error
//! response rather than a fabricated result.

mod conn;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use engine::Engine;

/// EasyDB administrative server: accepts one client connection per OS
/// thread and drives a single open database.
#[derive(Parser, Debug)]
#[command(name = "easydb-admin", version, about)]
struct Args {
    /// Database directory to open, creating it if it does not yet exist.
    #[arg(short = 'd', long = "data-dir")]
    data_dir: PathBuf,

    /// TCP port to listen on for client connections.
    #[arg(short = 'p', long = "port", default_value_t = 50_000)]
    port: u16,

    /// Emit web-framed (single-line JSON) responses instead of plain text.
    #[arg(short = 'w', long = "web")]
    web: bool,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("easydb-admin: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = Config::builder().data_dir(args.data_dir.clone()).build();
    let engine = Engine::open(config).with_context(|| format!("opening database at {}", args.data_dir.display()))?;

    let addr = ("127.0.0.1", args.port);
    let listener = TcpListener::bind(addr).with_context(|| format!("binding to port {}", args.port))?;
    listener.set_nonblocking(true).context("setting listener non-blocking")?;
    log::info!("easydb-admin: listening on 127.0.0.1:{}", args.port);

    let shutting_down = Arc::new(AtomicBool::new(false));
    {
        let shutting_down = shutting_down.clone();
        ctrlc::set_handler(move || {
            log::info!("easydb-admin: received interrupt, shutting down listener");
            shutting_down.store(true, Ordering::SeqCst);
        })
        .context("installing SIGINT handler")?;
    }

    let mut handles = Vec::new();
    while !shutting_down.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("easydb-admin: accepted connection from {peer}");
                let engine = engine.clone();
                let web = args.web;
                handles.push(thread::spawn(move || conn::handle_client(engine, stream, web)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                log::warn!("easydb-admin: accept failed: {e}");
            }
        }
    }

    // In-flight connections are never interrupted; we only stop accepting
    // new ones and wait for the ones already running to finish on their own.
    for handle in handles {
        let _ = handle.join();
    }
    engine.shutdown().context("shutting down engine")?;
    log::info!("easydb-admin: clean shutdown complete");
    Ok(())
}
