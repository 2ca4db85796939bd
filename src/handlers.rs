// Handlers for the TFTP opcodes. The listener registers the request
// handlers, which validate a RRQ/WRQ, register a session, and hand the rest
// of the transfer to a fresh server on an ephemeral port. That server
// registers exactly one data handler: DATA for writes, ACK for reads.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use crate::errors::SrvError;
use crate::server::{send_err_packet, OpToHandleMap, Server};
use crate::store::{Direction, FileStore};
use crate::tftp::{
    self, OpCode, Packet, SocketError, TftpSocket, BLOCK_NUM_SIZE, FIRST_DATA_BLOCK, MODE_OCTET,
};

/// A handler returns the response to send back, `None` for no reply, or an
/// error for the router to translate into an ERROR packet.
pub type HandleResult = Result<Option<Vec<u8>>, SrvError>;

/// The operations a router can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    WriteRequest,
    ReadRequest,
    /// Stray ACKs to the main port are silently dropped.
    AckNoop,
    WriteData,
    ReadData,
}

/// Dispatches a datagram payload (opcode already stripped) to a handler.
///
/// The future is boxed: request handlers spawn a transfer server whose serve
/// loop dispatches handlers again, and the indirection keeps that cycle out
/// of the async type graph.
pub fn handle<'a>(
    handler: Handler,
    buf: &'a [u8],
    sock: &'a Arc<TftpSocket>,
    src: SocketAddr,
    store: &'a Arc<FileStore>,
) -> Pin<Box<dyn Future<Output = HandleResult> + Send + 'a>> {
    Box::pin(async move {
        match handler {
            Handler::WriteRequest => handle_request(buf, src, store, true).await,
            Handler::ReadRequest => handle_request(buf, src, store, false).await,
            Handler::AckNoop => Ok(None),
            Handler::WriteData => handle_write_data(buf, sock, src, store),
            Handler::ReadData => handle_read_data(buf, sock, src, store),
        }
    })
}

/// Splits a request payload into filename and mode and checks the mode is
/// one this server speaks.
fn parse_request(buf: &[u8]) -> Result<(String, String), SrvError> {
    let (filename, mode) = tftp::parse_filename_and_mode(buf).map_err(|e| match e {
        SocketError::PacketParse(msg) => SrvError::BadRequest { msg },
        other => SrvError::BadRequest { msg: other.to_string() },
    })?;
    if mode != MODE_OCTET {
        return Err(SrvError::BadRequest { msg: format!("Unsupported mode: {mode}") });
    }
    Ok((filename, mode))
}

/// Answers a failed request from the transfer socket and reports "no reply"
/// back to the listener, which has nothing left to do for this request.
async fn abort_request(sock: &TftpSocket, src: SocketAddr, err: SrvError) -> HandleResult {
    log::warn!("Request error: {err}");
    send_err_packet(sock, &err, src).await;
    Ok(None)
}

/// Shared RRQ/WRQ handling: validate the request, register a session keyed
/// by a fresh ephemeral port, start a transfer server on that port, and send
/// the first response (ACK 0 for writes, DATA 1 for reads) from it.
async fn handle_request(
    buf: &[u8],
    src: SocketAddr,
    store: &Arc<FileStore>,
    is_write: bool,
) -> HandleResult {
    // The transfer socket is allocated before any validation; every
    // pre-transfer error goes back to the client from this socket, not from
    // the main listener.
    let sock = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into())
        .map_err(|e| SrvError::Io { msg: format!("Error getting new UDP conn: {e}") })?;
    let local_tid = local_tid(&sock)?;

    let (filename, mode) = match parse_request(buf) {
        Ok(parts) => parts,
        Err(e) => return abort_request(&sock, src, e).await,
    };
    if is_write {
        log::info!("Write request for filename: {filename}, mode: {mode}");
    } else {
        log::info!("Read request for filename: {filename}, mode: {mode}");
    }

    let exists = store.file_exists(&filename);
    if is_write && exists {
        return abort_request(&sock, src, SrvError::FileExists { filename }).await;
    }
    if !is_write && !exists {
        return abort_request(&sock, src, SrvError::FileNotFound { filename }).await;
    }

    let (next_block_num, direction) =
        if is_write { (FIRST_DATA_BLOCK, Direction::Write) } else { (0, Direction::Read) };
    if let Err(e) = store.add_session(local_tid, src.port(), &filename, next_block_num, direction)
    {
        return abort_request(&sock, src, e).await;
    }

    let first_resp = if is_write {
        Packet::Ack { block: 0 }
    } else {
        match store.read(local_tid, src.port(), 0) {
            Ok(data) => Packet::Data { block: FIRST_DATA_BLOCK, data: data.unwrap_or_default() },
            Err(e) => {
                store.drop_session(local_tid);
                return abort_request(&sock, src, e).await;
            }
        }
    };

    let sock = Arc::new(sock);
    let (op, handler) =
        if is_write { (OpCode::Data, Handler::WriteData) } else { (OpCode::Ack, Handler::ReadData) };
    let op_to_handle: OpToHandleMap = HashMap::from([(op, handler)]);
    let transfer = Server::new(Arc::clone(&sock), op_to_handle, true, Arc::clone(store), Some(src));
    let stop = transfer.stop_handle();
    tokio::spawn(transfer.serve());

    let resp = first_resp.to_bytes();
    let sent = match sock.send_raw(&resp, src).await {
        Ok(n) if n == resp.len() => true,
        Ok(n) => {
            log::warn!("Problem writing to UDP connection, {n} of {} bytes written", resp.len());
            false
        }
        Err(e) => {
            log::warn!("Error writing to UDP connection: {e}");
            false
        }
    };
    if !sent {
        // Roll the whole setup back; the client never saw the session.
        store.drop_session(local_tid);
        let _ = stop.send(()).await;
    }
    Ok(None)
}

/// DATA on a write-transfer socket: append the block and acknowledge it.
fn handle_write_data(
    buf: &[u8],
    sock: &TftpSocket,
    src: SocketAddr,
    store: &FileStore,
) -> HandleResult {
    let block_num = get_block_num(buf)?;
    // The rest of the buffer is the file data.
    let data = &buf[BLOCK_NUM_SIZE..];
    store.write(local_tid(sock)?, src.port(), block_num, data)?;
    Ok(Some(Packet::Ack { block: block_num }.to_bytes()))
}

/// ACK on a read-transfer socket: emit the next block, or nothing if this
/// was the terminal ACK.
fn handle_read_data(
    buf: &[u8],
    sock: &TftpSocket,
    src: SocketAddr,
    store: &FileStore,
) -> HandleResult {
    let block_num = get_block_num(buf)?;
    match store.read(local_tid(sock)?, src.port(), block_num)? {
        Some(data) => Ok(Some(Packet::Data { block: block_num + 1, data }.to_bytes())),
        None => Ok(None),
    }
}

fn get_block_num(buf: &[u8]) -> Result<u16, SrvError> {
    if buf.len() < BLOCK_NUM_SIZE {
        return Err(SrvError::BadRequest {
            msg: "Error parsing data request data: unexpected EOF".to_string(),
        });
    }
    Ok(tftp::u16_from_buffer(buf))
}

fn local_tid(sock: &TftpSocket) -> Result<u16, SrvError> {
    let addr = sock
        .local_addr()
        .map_err(|e| SrvError::Io { msg: format!("Error reading local socket addr: {e}") })?;
    Ok(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::ErrorCode;
    use std::time::Duration;

    const REMOTE_TID: u16 = 41000;
    const RECV_TTL: Duration = Duration::from_secs(2);

    fn bind() -> TftpSocket {
        TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    fn remote_addr() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, REMOTE_TID).into()
    }

    #[test]
    fn test_get_block_num() {
        assert_eq!(get_block_num(&[0xA8, 0xCA, 0x61, 0x62, 0x03]).unwrap(), 0xA8CA);
    }

    #[test]
    fn test_get_block_num_fail() {
        // Not enough bytes should fail.
        assert!(get_block_num(&[0xA8]).is_err());
    }

    #[test]
    fn test_parse_request() {
        let (filename, mode) =
            parse_request(b"foo\x00octet\x00").unwrap();
        assert_eq!(filename, "foo");
        assert_eq!(mode, "octet");
    }

    #[test]
    fn test_parse_request_no_filename() {
        let err = parse_request(b"\x00octet\x00").unwrap_err();
        assert_eq!(err, SrvError::BadRequest { msg: "No filename provided".to_string() });
    }

    #[test]
    fn test_parse_request_no_mode() {
        let err = parse_request(b"foo\x00").unwrap_err();
        assert_eq!(err, SrvError::BadRequest { msg: "No mode provided".to_string() });
    }

    #[test]
    fn test_parse_request_unsupported_mode() {
        let err = parse_request(b"foo\x00netascii\x00").unwrap_err();
        assert_eq!(err, SrvError::BadRequest { msg: "Unsupported mode: netascii".to_string() });
        // Mode matching is byte-exact.
        let err = parse_request(b"foo\x00OCTET\x00").unwrap_err();
        assert_eq!(err, SrvError::BadRequest { msg: "Unsupported mode: OCTET".to_string() });
    }

    #[tokio::test]
    async fn test_handle_write_data() {
        let store = FileStore::new();
        let sock = bind();
        store
            .add_session(local_tid(&sock).unwrap(), REMOTE_TID, "foo", 1, Direction::Write)
            .unwrap();

        // Block 1 carrying "abc"; expect an ack with block number set to 1.
        let resp =
            handle_write_data(&[0x00, 0x01, 0x61, 0x62, 0x63], &sock, remote_addr(), &store)
                .unwrap();
        assert_eq!(resp.unwrap(), vec![0x00, 0x04, 0x00, 0x01]);
        assert_eq!(store.file_contents("foo").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_handle_write_data_bad_block() {
        let store = FileStore::new();
        let sock = bind();
        store
            .add_session(local_tid(&sock).unwrap(), REMOTE_TID, "foo", 1, Direction::Write)
            .unwrap();

        let err = handle_write_data(&[0x00, 0x02, 0x61], &sock, remote_addr(), &store).unwrap_err();
        assert_eq!(err, SrvError::BadBlock { got: 2, want: 1 });
    }

    #[tokio::test]
    async fn test_handle_write_data_truncated_block_num() {
        let store = FileStore::new();
        let sock = bind();
        assert!(handle_write_data(&[0xA1], &sock, remote_addr(), &store).is_err());
    }

    #[tokio::test]
    async fn test_handle_write_data_unexpected_remote_tid() {
        let store = FileStore::new();
        let sock = bind();
        store
            .add_session(local_tid(&sock).unwrap(), REMOTE_TID, "foo", 1, Direction::Write)
            .unwrap();

        let stray: SocketAddr = (Ipv4Addr::LOCALHOST, REMOTE_TID + 1).into();
        let err = handle_write_data(&[0x00, 0x01, 0x61, 0x62, 0x63], &sock, stray, &store)
            .unwrap_err();
        assert_eq!(err, SrvError::UnexpectedRemoteTid { got: REMOTE_TID + 1, want: REMOTE_TID });
    }

    #[tokio::test]
    async fn test_handle_read_data() {
        let store =
            FileStore::with_files(HashMap::from([("foo".to_string(), b"abc".to_vec())]));
        let sock = bind();
        store
            .add_session(local_tid(&sock).unwrap(), REMOTE_TID, "foo", 0, Direction::Read)
            .unwrap();

        // ACK 0 yields a data packet with block number 1 and the file bytes.
        let resp = handle_read_data(&[0x00, 0x00], &sock, remote_addr(), &store).unwrap();
        assert_eq!(resp.unwrap(), vec![0x00, 0x03, 0x00, 0x01, 0x61, 0x62, 0x63]);

        // The final ACK gets no response.
        let resp = handle_read_data(&[0x00, 0x01], &sock, remote_addr(), &store).unwrap();
        assert_eq!(resp, None);
    }

    #[tokio::test]
    async fn test_handle_read_data_no_conn_info() {
        let store =
            FileStore::with_files(HashMap::from([("foo".to_string(), b"abc".to_vec())]));
        let sock = bind();
        let err = handle_read_data(&[0x00, 0x00], &sock, remote_addr(), &store).unwrap_err();
        assert!(matches!(err, SrvError::NoSession { .. }));
    }

    #[tokio::test]
    async fn test_handle_write_request() {
        let store = Arc::new(FileStore::new());
        let sock = Arc::new(bind());
        let src = sock.local_addr().unwrap();

        // foo\0octet\0
        let resp = handle(
            Handler::WriteRequest,
            b"foo\x00octet\x00",
            &sock,
            src,
            &store,
        )
        .await
        .unwrap();
        // Request handlers never respond over the listener socket...
        assert_eq!(resp, None);

        // ...the first response arrives from a fresh port instead.
        let (packet, from) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(packet, Packet::Ack { block: 0 });
        assert_ne!(from.port(), src.port());
    }

    #[tokio::test]
    async fn test_handle_read_request() {
        let store = Arc::new(FileStore::with_files(HashMap::from([(
            "foo".to_string(),
            b"abc".to_vec(),
        )])));
        let sock = Arc::new(bind());
        let src = sock.local_addr().unwrap();

        let resp =
            handle(Handler::ReadRequest, b"foo\x00octet\x00", &sock, src, &store).await.unwrap();
        assert_eq!(resp, None);

        let (packet, from) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(packet, Packet::Data { block: 1, data: b"abc".to_vec() });
        assert_ne!(from.port(), src.port());
    }

    #[tokio::test]
    async fn test_handle_write_request_existing_file() {
        let store = Arc::new(FileStore::with_files(HashMap::from([(
            "foo".to_string(),
            b"abc".to_vec(),
        )])));
        let sock = Arc::new(bind());
        let src = sock.local_addr().unwrap();

        let resp =
            handle(Handler::WriteRequest, b"foo\x00octet\x00", &sock, src, &store).await.unwrap();
        assert_eq!(resp, None);

        let (packet, _) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(
            packet,
            Packet::Error {
                code: ErrorCode::FileExists,
                message: "Filename \"foo\" already exists".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_handle_read_request_missing_file() {
        let store = Arc::new(FileStore::new());
        let sock = Arc::new(bind());
        let src = sock.local_addr().unwrap();

        let resp =
            handle(Handler::ReadRequest, b"bar\x00octet\x00", &sock, src, &store).await.unwrap();
        assert_eq!(resp, None);

        let (packet, _) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(
            packet,
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "Filename \"bar\" does not exist".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_handle_request_unsupported_mode() {
        let store = Arc::new(FileStore::new());
        let sock = Arc::new(bind());
        let src = sock.local_addr().unwrap();

        let resp =
            handle(Handler::WriteRequest, b"foo\x00mail\x00", &sock, src, &store).await.unwrap();
        assert_eq!(resp, None);

        let (packet, _) = sock.recv_with_timeout(RECV_TTL).await.unwrap();
        assert_eq!(
            packet,
            Packet::Error {
                code: ErrorCode::Generic,
                message: "Unsupported mode: mail".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_ack_noop() {
        let store = Arc::new(FileStore::new());
        let sock = Arc::new(bind());
        let src = sock.local_addr().unwrap();
        let resp = handle(Handler::AckNoop, &[0x00, 0x03], &sock, src, &store).await.unwrap();
        assert_eq!(resp, None);
    }
}
