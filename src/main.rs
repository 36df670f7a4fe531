//! wiremux — websocket echo server over the connection multiplexer.
//!
//! Demonstrates the full stack: a TCP accept loop feeds upgraded
//! connections into the multiplexer, readiness events are served by a
//! bounded worker pool, and every received message is echoed back on the
//! connection it arrived on.
//!
//! Usage:
//!   wiremux                          # Listen on 127.0.0.1:8080
//!   wiremux --port 9000 --workers 16 # Custom port and pool size
//!   wiremux --workers 0              # No pool: reads run on the poll thread

use std::net::TcpListener;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wiremux_transport::{ConnectionRegistry, MessageCallback, Multiplexer, Pool};

#[derive(Parser, Debug)]
#[command(name = "wiremux", about = "Wiremux — websocket echo multiplexer")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Worker threads for message handling (0 runs reads on the poll thread)
    #[arg(long, default_value = "8")]
    workers: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let registry = Arc::new(ConnectionRegistry::new());
    let callback: MessageCallback = Arc::new(|conn, opcode, payload| {
        if let Err(err) = conn.send(opcode, payload) {
            warn!(peer = ?conn.peer_addr(), %err, "echo failed");
        }
    });

    let mux = Multiplexer::new(callback, registry)?;
    if cli.workers > 0 {
        mux.set_pool(Arc::new(Pool::new(cli.workers)));
    }

    let listener = TcpListener::bind((cli.hostname.as_str(), cli.port))?;
    let addr = listener.local_addr()?;
    info!("wiremux echo listening on ws://{addr}/ws ({} workers)", cli.workers);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(err) = mux.accept(stream) {
                    warn!(%err, "inbound upgrade failed");
                }
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }

    Ok(())
}
