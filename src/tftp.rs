// The TFTP wire format (RFC 1350 subset) and the UDP socket wrapper the
// servers run on.
//
// Packet layout, big-endian throughout:
//
// opcode   operation
// 1        Read request (RRQ):   filename, 0x00, mode, 0x00
// 2        Write request (WRQ):  filename, 0x00, mode, 0x00
// 3        Data (DATA):          block# (2 bytes), 0-512 data bytes
// 4        ACK:                  block# (2 bytes)
// 5        ERROR:                errcode (2 bytes), message, 0x00
//
// A DATA packet shorter than 512 bytes of payload marks the end of a
// transfer. Only octet mode is supported.

use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use async_io::Async;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::builder::{build_response, Item};

/// Payload bytes per full DATA block.
pub const BLOCK_SIZE: usize = 512;
/// Opcode field width.
pub const OP_CODE_SIZE: usize = 2;
/// Block-number field width.
pub const BLOCK_NUM_SIZE: usize = 2;
/// DATA packet header: opcode plus block number.
pub const DATA_HEADER_SIZE: usize = OP_CODE_SIZE + BLOCK_NUM_SIZE;
/// Largest datagram the protocol produces: a full DATA packet.
pub const DATAGRAM_SIZE: usize = BLOCK_SIZE + DATA_HEADER_SIZE;
/// DATA block numbering starts at 1; ACK 0 acknowledges a write request.
pub const FIRST_DATA_BLOCK: u16 = 1;
pub const MIN_OP_CODE: u16 = 1;
pub const MAX_OP_CODE: u16 = 5;

/// The only transfer mode this server accepts, compared byte-exact.
pub const MODE_OCTET: &str = "octet";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// A TFTP opcode, the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Err = 5,
}

/// A TFTP error code as carried by ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Generic = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    Full = 3,
    IllegalOp = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::Full,
            4 => ErrorCode::IllegalOp,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Generic,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// A read request packet.
    ReadReq {
        /// The file the client wants to read.
        filename: String,

        /// The transfer mode, kept raw; request handlers decide whether it
        /// is supported.
        mode: String,
    },

    /// A write request packet.
    WriteReq { filename: String, mode: String },

    /// A data packet.
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet.
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

pub(crate) fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, concatenates bytes from the start of the buffer until it
/// finds a 0 byte, which terminates the string.
///
/// Returns the extracted string and the position of the 0 byte (or the size
/// of the buffer, if no 0 byte was encountered). Bytes are widened to chars
/// one-for-one so that non-UTF-8 filenames stay distinct keys.
pub fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, &c) in buf.iter().enumerate() {
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }
    (s, buf.len())
}

/// Reads the opcode off the front of a datagram. Fails on a truncated buffer
/// or an opcode outside the TFTP range.
pub fn read_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    if buf.len() < OP_CODE_SIZE {
        return Err(SocketError::PacketParse("Unable to read op code".to_string()));
    }
    let raw = u16_from_buffer(&buf[..OP_CODE_SIZE]);
    match raw {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Err),
        _ => Err(SocketError::PacketParse(format!(
            "Op code {raw} outside [{MIN_OP_CODE}, {MAX_OP_CODE}]"
        ))),
    }
}

/// Splits a request payload (everything after the opcode) into filename and
/// mode. Both must be non-empty and 0x00-terminated.
pub fn parse_filename_and_mode(buf: &[u8]) -> TftpResult<(String, String)> {
    let (filename, filename_end) = string_from_buffer(buf);
    if filename_end == buf.len() || filename_end == 0 {
        return Err(SocketError::PacketParse("No filename provided".to_string()));
    }

    let rest = &buf[filename_end + 1..];
    let (mode, mode_end) = string_from_buffer(rest);
    if mode_end == rest.len() || mode_end == 0 {
        return Err(SocketError::PacketParse("No mode provided".to_string()));
    }

    Ok((filename, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[OP_CODE_SIZE..])?;
    Ok(Packet::ReadReq { filename, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode) = parse_filename_and_mode(&buf[OP_CODE_SIZE..])?;
    Ok(Packet::WriteReq { filename, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[OP_CODE_SIZE..DATA_HEADER_SIZE]);
    Ok(Packet::Data { block, data: Vec::from(&buf[DATA_HEADER_SIZE..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[OP_CODE_SIZE..DATA_HEADER_SIZE]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[OP_CODE_SIZE..DATA_HEADER_SIZE]));
    let (message, _) = string_from_buffer(&buf[DATA_HEADER_SIZE..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < DATA_HEADER_SIZE {
            return Err(SocketError::PacketParse("Packet too short".to_string()));
        }

        match read_op_code(buf)? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Err => parse_error(buf),
        }
    }

    /// Serializes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { filename, mode } => build_response(&[
                Item::U16(OpCode::Rrq as u16),
                Item::Bytes(filename.as_bytes()),
                Item::U8(0),
                Item::Bytes(mode.as_bytes()),
                Item::U8(0),
            ]),
            Packet::WriteReq { filename, mode } => build_response(&[
                Item::U16(OpCode::Wrq as u16),
                Item::Bytes(filename.as_bytes()),
                Item::U8(0),
                Item::Bytes(mode.as_bytes()),
                Item::U8(0),
            ]),
            Packet::Data { block, data } => build_response(&[
                Item::U16(OpCode::Data as u16),
                Item::U16(*block),
                Item::Bytes(data),
            ]),
            Packet::Ack { block } => {
                build_response(&[Item::U16(OpCode::Ack as u16), Item::U16(*block)])
            }
            Packet::Error { code, message } => build_response(&[
                Item::U16(OpCode::Err as u16),
                Item::U16(*code as u16),
                Item::Bytes(message.as_bytes()),
                Item::U8(0),
            ]),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that reads raw datagrams with a deadline and
/// sends packets in either structured or pre-built form.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket { sock: Async::<UdpSocket>::bind(addr)? })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    /// Reads one datagram into `buf`, failing with `SocketError::Timeout`
    /// after `ttl`.
    pub async fn recv_raw_with_timeout(
        &self,
        ttl: Duration,
        buf: &mut [u8],
    ) -> TftpResult<(usize, SocketAddr)> {
        let (n, src) = timeout(ttl, self.sock.recv_from(buf)).await??;
        Ok((n, src))
    }

    /// Reads one datagram and parses it as a TFTP packet.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; DATAGRAM_SIZE];
        let (n, src) = self.recv_raw_with_timeout(ttl, &mut buf).await?;
        let packet = Packet::parse_from_buf(&buf[..n])?;
        Ok((packet, src))
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<usize> {
        self.send_raw(&packet.to_bytes(), dst).await
    }

    pub async fn send_raw(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<usize> {
        Ok(self.sock.send_to(buf, dst).await?)
    }
}
