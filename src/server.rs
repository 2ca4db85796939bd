// The per-socket datagram router. One Server runs on the well-known listener
// port and accepts requests; every live transfer runs another Server on its
// own ephemeral port with a single-opcode handler map.
//
// Datagrams on a socket are routed serially: the protocol is lockstep, so a
// session only ever has one datagram in flight and nothing is gained by
// dispatching concurrently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::errors::SrvError;
use crate::handlers::{self, Handler};
use crate::store::FileStore;
use crate::tftp::{self, OpCode, Packet, SocketError, TftpSocket, DATAGRAM_SIZE, OP_CODE_SIZE};

/// Deadline for each socket read. On the listener it only paces the loop so
/// the stop channel gets observed; on a transfer socket it is the transfer's
/// idle timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub type OpToHandleMap = HashMap<OpCode, Handler>;

/// What the serve loop should do after routing a datagram.
enum Flow {
    Continue,
    Done,
}

pub struct Server {
    sock: Arc<TftpSocket>,
    op_to_handle: OpToHandleMap,
    is_transfer_server: bool,
    store: Arc<FileStore>,
    /// The client peer, fixed at creation for transfer servers. Read errors
    /// get a best-effort ERROR packet sent here.
    peer: Option<SocketAddr>,
    read_timeout: Duration,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
}

impl Server {
    pub fn new(
        sock: Arc<TftpSocket>,
        op_to_handle: OpToHandleMap,
        is_transfer_server: bool,
        store: Arc<FileStore>,
        peer: Option<SocketAddr>,
    ) -> Server {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Server {
            sock,
            op_to_handle,
            is_transfer_server,
            store,
            peer,
            read_timeout: READ_TIMEOUT,
            stop_tx,
            stop_rx,
        }
    }

    /// A handle that stops the serve loop after its in-flight datagram.
    pub fn stop_handle(&self) -> mpsc::Sender<()> {
        self.stop_tx.clone()
    }

    #[cfg(test)]
    fn with_read_timeout(mut self, read_timeout: Duration) -> Server {
        self.read_timeout = read_timeout;
        self
    }

    /// Reads and routes datagrams until the transfer completes, the idle
    /// timeout elapses (transfer servers), or the stop channel fires.
    /// Consumes the server; the socket closes when the loop exits.
    pub async fn serve(mut self) {
        loop {
            let mut buf = [0u8; DATAGRAM_SIZE];
            tokio::select! {
                _ = self.stop_rx.recv() => return,
                recvd = self.sock.recv_raw_with_timeout(self.read_timeout, &mut buf) => {
                    match recvd {
                        Ok((n, src)) => {
                            if let Flow::Done = self.route(&buf[..n], src).await {
                                return;
                            }
                        }
                        // Listener timeouts just give the loop a chance to
                        // observe the stop channel; a transfer timeout means
                        // the peer went away.
                        Err(SocketError::Timeout(_)) => {
                            if self.is_transfer_server {
                                self.remove_session();
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("Error reading from UDP: {e}");
                            if self.is_transfer_server {
                                if let Some(peer) = self.peer {
                                    let err = SrvError::Io {
                                        msg: format!("Error reading from UDP: {e}"),
                                    };
                                    send_err_packet(&self.sock, &err, peer).await;
                                }
                                self.remove_session();
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn route(&self, buf: &[u8], src: SocketAddr) -> Flow {
        let op = match tftp::read_op_code(buf) {
            Ok(op) => op,
            Err(e) => {
                self.respond_with_err(&SrvError::IllegalOp { msg: e.to_string() }, src).await;
                return Flow::Continue;
            }
        };
        let handler = match self.op_to_handle.get(&op) {
            Some(handler) => *handler,
            None => {
                let err = SrvError::UnsupportedOp { op: op as u16 };
                log::warn!("{err}");
                self.respond_with_err(&err, src).await;
                return Flow::Continue;
            }
        };

        match handlers::handle(handler, &buf[OP_CODE_SIZE..], &self.sock, src, &self.store).await {
            Err(e) => {
                log::warn!("Handle error: {e}");
                self.respond_with_err(&e, src).await;
                return Flow::Continue;
            }
            // A transfer server with no response is finished; we just saw
            // the terminal ACK. The listener has nothing to say either way.
            Ok(None) => {
                if self.is_transfer_server {
                    return Flow::Done;
                }
            }
            Ok(Some(resp)) => {
                if let Err(e) = self.respond(&resp, src).await {
                    log::warn!("{e}");
                    self.respond_with_err(&e, src).await;
                    return Flow::Continue;
                }
            }
        }

        // An undersized DATA datagram was the final block of a write.
        if op == OpCode::Data && buf.len() < DATAGRAM_SIZE && self.is_transfer_server {
            return Flow::Done;
        }
        Flow::Continue
    }

    async fn respond(&self, resp: &[u8], src: SocketAddr) -> Result<(), SrvError> {
        let n = self
            .sock
            .send_raw(resp, src)
            .await
            .map_err(|e| SrvError::Io { msg: format!("Error writing to UDP connection: {e}") })?;
        if n != resp.len() {
            return Err(SrvError::Io {
                msg: format!(
                    "Problem writing to UDP connection, {n} of {} bytes written",
                    resp.len()
                ),
            });
        }
        Ok(())
    }

    /// Sends the wire ERROR for `err` to `src`. An unexpected remote TID
    /// only rebuffs the stray peer; the session stays valid. Every other
    /// error is fatal for a transfer server's session, but the server itself
    /// keeps serving without one until the idle timeout: a follow-up
    /// datagram on the port is answered with the no-session error rather
    /// than silence.
    async fn respond_with_err(&self, err: &SrvError, src: SocketAddr) {
        send_err_packet(&self.sock, err, src).await;
        if self.is_transfer_server && !matches!(err, SrvError::UnexpectedRemoteTid { .. }) {
            self.remove_session();
        }
    }

    fn remove_session(&self) {
        if let Ok(addr) = self.sock.local_addr() {
            self.store.drop_session(addr.port());
        }
    }
}

/// Sends the wire ERROR packet for `err` to `dst`. Best effort; failures are
/// only logged.
pub(crate) async fn send_err_packet(sock: &TftpSocket, err: &SrvError, dst: SocketAddr) {
    let resp = Packet::Error { code: err.code(), message: err.to_string() }.to_bytes();
    match sock.send_raw(&resp, dst).await {
        Ok(n) if n != resp.len() => {
            log::warn!("Problem writing to UDP connection, {n} of {} bytes written", resp.len());
        }
        Ok(_) => {}
        Err(e) => log::warn!("Error writing to UDP connection: {e}"),
    }
}
