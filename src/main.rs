// memtftpd: an in-memory TFTP server (RFC 1350 subset).
//
// Clients upload a named blob with a write request and download it later
// with a read request. Nothing ever touches disk; blobs live in one flat
// in-memory namespace until the process exits. Only octet mode is
// supported, and there is no retransmission: a lost datagram ends its
// transfer via the idle timeout.
//
// Every request is answered from a fresh ephemeral port (the server-side
// Transfer ID); the main port only ever sees RRQ and WRQ.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process;
use std::sync::Arc;

pub mod builder;
pub mod errors;
pub mod handlers;
pub mod server;
pub mod store;
pub mod tftp;

use anyhow::Result;
use clap::Parser;

use crate::handlers::Handler;
use crate::server::{OpToHandleMap, Server};
use crate::store::FileStore;
use crate::tftp::{OpCode, TftpSocket};

/// In-memory TFTP server. Uploaded files live only in process memory.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// UDP port for the main listener
    #[arg(short, long, default_value_t = 69)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    log::info!("Starting memtftpd on port {}", args.port);
    let sock = match TftpSocket::bind((Ipv4Addr::LOCALHOST, args.port).into()) {
        Ok(sock) => Arc::new(sock),
        Err(e) => {
            log::error!("ListenUDP failure: {e}");
            process::exit(1);
        }
    };

    // The main listener only supports read and write requests, which create
    // new servers for data transfer. ACKs to the main port are ignored;
    // this server isn't smart enough to do anything about them.
    let op_to_handle: OpToHandleMap = HashMap::from([
        (OpCode::Rrq, Handler::ReadRequest),
        (OpCode::Wrq, Handler::WriteRequest),
        (OpCode::Ack, Handler::AckNoop),
    ]);
    let store = Arc::new(FileStore::new());
    let listener = Server::new(sock, op_to_handle, false, store, None);
    let stop = listener.stop_handle();
    let serve_task = tokio::spawn(listener.serve());

    wait_for_shutdown().await;
    let _ = stop.send(()).await;
    let _ = serve_task.await;
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => log::info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        log::info!("Received SIGINT, shutting down");
    }
}
