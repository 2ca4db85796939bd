// Server error taxonomy. Internal error kinds are modeled as one sum type;
// the router maps each kind to its TFTP wire code when it builds the ERROR
// packet, so everything below the router can stay wire-agnostic.

use std::error;
use std::fmt;

use crate::tftp::ErrorCode;

#[derive(Debug, PartialEq)]
pub enum SrvError {
    /// No session is registered for the local TID.
    NoSession { local_tid: u16 },

    /// A datagram arrived on a session socket from an unexpected source port.
    /// Carries the observed and expected ports for logging. The session
    /// itself stays valid; only the stray peer is rebuffed.
    UnexpectedRemoteTid { got: u16, want: u16 },

    /// A DATA or ACK block number did not match the session's next block.
    BadBlock { got: u16, want: u16 },

    /// A session already exists for the local TID.
    DuplicateLocalTid { local_tid: u16 },

    /// The write target is already committed.
    FileExists { filename: String },

    /// The read target does not exist.
    FileNotFound { filename: String },

    /// A write would grow past the largest blob the block arithmetic
    /// supports.
    FileTooLarge { filename: String },

    /// A malformed request or data payload.
    BadRequest { msg: String },

    /// An opcode outside the TFTP range, or one this socket cannot decode.
    IllegalOp { msg: String },

    /// An in-range opcode with no handler registered on this socket.
    UnsupportedOp { op: u16 },

    /// A network-level failure while responding.
    Io { msg: String },
}

impl SrvError {
    /// The TFTP wire code for this error kind.
    pub fn code(&self) -> ErrorCode {
        match self {
            SrvError::UnexpectedRemoteTid { .. } => ErrorCode::UnknownTid,
            SrvError::FileExists { .. } => ErrorCode::FileExists,
            SrvError::FileNotFound { .. } => ErrorCode::FileNotFound,
            SrvError::FileTooLarge { .. } => ErrorCode::Full,
            SrvError::IllegalOp { .. } => ErrorCode::IllegalOp,
            SrvError::NoSession { .. }
            | SrvError::BadBlock { .. }
            | SrvError::DuplicateLocalTid { .. }
            | SrvError::BadRequest { .. }
            | SrvError::UnsupportedOp { .. }
            | SrvError::Io { .. } => ErrorCode::Generic,
        }
    }
}

impl error::Error for SrvError {}

impl fmt::Display for SrvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SrvError::NoSession { local_tid } => {
                write!(f, "No connection info for local TID ({local_tid})")
            }
            SrvError::UnexpectedRemoteTid { got, want } => {
                write!(f, "Got remote tid: {got}, want {want}")
            }
            SrvError::BadBlock { got, want } => write!(f, "Got block {got}, want {want}"),
            SrvError::DuplicateLocalTid { local_tid } => {
                write!(f, "Local TID {local_tid} already exists")
            }
            SrvError::FileExists { filename } => {
                write!(f, "Filename \"{filename}\" already exists")
            }
            SrvError::FileNotFound { filename } => {
                write!(f, "Filename \"{filename}\" does not exist")
            }
            SrvError::FileTooLarge { filename } => {
                write!(f, "Filename \"{filename}\" exceeds the maximum file size")
            }
            SrvError::BadRequest { msg } | SrvError::IllegalOp { msg } | SrvError::Io { msg } => {
                write!(f, "{msg}")
            }
            SrvError::UnsupportedOp { op } => write!(f, "Unsupported op: {op}"),
        }
    }
}
