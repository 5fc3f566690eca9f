//! Client-side operation results.

use thiserror::Error;

use crate::opcode::{ServerResult, ENOENT};
use crate::payload::Payload;

/// Terminal failure of one FTP operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The server stopped answering and all retries were spent
    #[error("timed out waiting for the server")]
    Timeout,
    /// The engine is occupied; surfaced by embedders that refuse to queue
    #[error("another operation is in progress")]
    Busy,
    /// Reading or writing a local file failed
    #[error("local file I/O failed")]
    FileIoError,
    /// The remote file already exists
    #[error("file already exists")]
    FileExists,
    /// The file does not exist
    #[error("file does not exist")]
    FileDoesNotExist,
    /// The remote file is write-protected
    #[error("file is write-protected")]
    FileProtected,
    /// An argument cannot be expressed on the wire or names nothing
    #[error("invalid parameter")]
    InvalidParameter,
    /// The server does not implement the request
    #[error("command not supported by the server")]
    Unsupported,
    /// The server answered with something the protocol does not allow here
    #[error("protocol violation")]
    ProtocolError,
    /// The remote system is gone
    #[error("no connection to the system")]
    NoSystem,
    /// Unclassified failure
    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// Translates a NAK payload into the client-side result.
    pub fn from_nak(payload: &Payload) -> Self {
        let data = payload.data();
        let Some(&code) = data.first() else {
            return Self::ProtocolError;
        };
        let mut result = ServerResult::from_u8(code);
        // PX4 reports a missing file as an errno rather than its own code.
        if result == Some(ServerResult::FailErrno) && data.get(1) == Some(&ENOENT) {
            result = Some(ServerResult::FileNotFound);
        }
        match result {
            Some(ServerResult::FileExists) => Self::FileExists,
            Some(ServerResult::FileProtected) => Self::FileProtected,
            Some(ServerResult::UnknownCommand) => Self::Unsupported,
            Some(ServerResult::FileNotFound) => Self::FileDoesNotExist,
            // Everything unmapped, including a nonsensical `Success` NAK.
            _ => Self::ProtocolError,
        }
    }
}
