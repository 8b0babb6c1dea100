//! # Ferry Node
//!
//! Demo host for the transport: an echo server or a ping client ticking at a
//! fixed rate.
//!
//! ## Usage
//!
//! ```bash
//! # Echo server on 0.0.0.0:7777
//! ferry-node server --address 0.0.0.0
//!
//! # Client sending 10 reliable pings
//! ferry-node client --address 127.0.0.1 --count 10
//!
//! # Settings from a file, with debug logging
//! RUST_LOG=ferry_transport=debug ferry-node client --config ferry.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use ferry_transport::{DeliveryGuarantee, NetworkEvent, Transport, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

/// Ferry transport demo node.
#[derive(Parser, Debug)]
#[command(name = "ferry-node", about = "Ferry transport echo server / ping client")]
struct Cli {
    /// Run as echo server or ping client.
    #[arg(value_enum)]
    mode: Mode,

    /// Server address (client connects to it, server binds it).
    #[arg(long)]
    address: Option<String>,

    /// Server UDP port.
    #[arg(long)]
    port: Option<u16>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Update tick interval in milliseconds.
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Pings to send before the client disconnects (client only).
    #[arg(long, default_value_t = 5)]
    count: u32,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Config ──────────────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            TransportConfig::from_toml_str(&text)?
        }
        None => TransportConfig::default(),
    };
    if cli.address.is_some() || cli.port.is_some() {
        let address = cli
            .address
            .clone()
            .unwrap_or_else(|| config.connection.address.clone());
        let port = cli.port.unwrap_or(config.connection.port);
        let listen = config.connection.server_listen_address.clone();
        config.set_connection_data(address, port, listen);
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    let mut transport = Transport::new(config);
    match cli.mode {
        Mode::Server => transport.start_server()?,
        Mode::Client => transport.start_client()?,
    }
    tracing::info!(mode = ?cli.mode, local = ?transport.local_addr(), "ferry-node started");

    let tick = Duration::from_millis(cli.tick_ms.max(1));
    let mut pings_sent = 0u32;
    let mut pongs = 0u32;

    while running.load(Ordering::SeqCst) {
        transport.update();
        while let Some(ev) = transport.poll_event() {
            match ev.event {
                NetworkEvent::Connect(id) => {
                    tracing::info!(connection = %id, at = ?ev.receive_time, "connected");
                }
                NetworkEvent::Disconnect(id) => {
                    tracing::info!(connection = %id, "disconnected");
                    if cli.mode == Mode::Client {
                        running.store(false, Ordering::SeqCst);
                    }
                }
                NetworkEvent::Data(id, payload) => match cli.mode {
                    Mode::Server => {
                        if let Err(e) =
                            transport.send(id, &payload, DeliveryGuarantee::ReliableSequenced)
                        {
                            tracing::warn!(connection = %id, error = %e, "echo failed");
                        }
                    }
                    Mode::Client => {
                        pongs += 1;
                        tracing::info!(
                            reply = %String::from_utf8_lossy(&payload),
                            rtt = ?transport.current_rtt(id),
                            "pong"
                        );
                    }
                },
                NetworkEvent::TransportFailure => {
                    tracing::error!("transport failure");
                    running.store(false, Ordering::SeqCst);
                }
            }
        }

        if cli.mode == Mode::Client {
            if let Some(server) = transport.server_connection() {
                if transport.state() == ferry_transport::TransportState::Connected {
                    if pings_sent < cli.count {
                        let msg = format!("ping {pings_sent}");
                        transport.send(
                            server,
                            msg.as_bytes(),
                            DeliveryGuarantee::ReliableSequenced,
                        )?;
                        pings_sent += 1;
                    } else if pongs >= cli.count {
                        if let Some(stats) = transport.connection_stats(server) {
                            tracing::info!(stats = %serde_json::to_string(&stats)?, "final stats");
                        }
                        transport.disconnect_local_client();
                    }
                }
            }
        }

        std::thread::sleep(tick);
    }

    tracing::info!("shutting down...");
    transport.shutdown();
    Ok(())
}
