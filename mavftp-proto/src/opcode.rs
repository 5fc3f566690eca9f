//! Message opcodes and server result codes.

/// FTP message opcodes.
///
/// Requests use the values up to [`BurstReadFile`](Opcode::BurstReadFile);
/// responses are [`Ack`](Opcode::Ack) or [`Nak`](Opcode::Nak) with the
/// request's opcode echoed in the payload's `req_opcode` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Placeholder; never sent
    None = 0,
    /// Close the open session
    TerminateSession = 1,
    /// Drop all server-side session state
    ResetSessions = 2,
    /// Enumerate directory entries starting at `offset`
    ListDirectory = 3,
    /// Open a file for reading, answering with its size and a session
    OpenFileRo = 4,
    /// Read `size` bytes at `offset` from the open session
    ReadFile = 5,
    /// Create a file and open it for writing
    CreateFile = 6,
    /// Write the data region at `offset` into the open session
    WriteFile = 7,
    /// Delete a file
    RemoveFile = 8,
    /// Create a directory
    CreateDirectory = 9,
    /// Delete an empty directory
    RemoveDirectory = 10,
    /// Open (or create) a file for writing
    OpenFileWo = 11,
    /// Truncate a file to `offset` bytes
    TruncateFile = 12,
    /// Rename a file or directory; data carries both NUL-terminated paths
    Rename = 13,
    /// Compute a file's CRC32
    CalcFileCrc32 = 14,
    /// Stream a file range without per-chunk requests; unused here
    BurstReadFile = 15,
    /// Positive response
    Ack = 128,
    /// Negative response carrying a [`ServerResult`] in the first data byte
    Nak = 129,
}

impl Opcode {
    /// The opcode for a wire value, if it names one.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::TerminateSession,
            2 => Self::ResetSessions,
            3 => Self::ListDirectory,
            4 => Self::OpenFileRo,
            5 => Self::ReadFile,
            6 => Self::CreateFile,
            7 => Self::WriteFile,
            8 => Self::RemoveFile,
            9 => Self::CreateDirectory,
            10 => Self::RemoveDirectory,
            11 => Self::OpenFileWo,
            12 => Self::TruncateFile,
            13 => Self::Rename,
            14 => Self::CalcFileCrc32,
            15 => Self::BurstReadFile,
            128 => Self::Ack,
            129 => Self::Nak,
            _ => return None,
        })
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode as Self
    }
}

/// Error codes carried in the first data byte of a NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerResult {
    /// No error; nonsensical inside a NAK
    Success = 0,
    /// Unspecified failure
    Fail = 1,
    /// Failure with a POSIX errno in the second data byte
    FailErrno = 2,
    /// The request's data region had an impossible size
    InvalidDataSize = 3,
    /// The session token does not name an open session
    InvalidSession = 4,
    /// The server has no free session slots
    NoSessionsAvailable = 5,
    /// End of the file or of the directory listing
    Eof = 6,
    /// The server does not implement the opcode
    UnknownCommand = 7,
    /// The target file already exists
    FileExists = 8,
    /// The target file is write-protected
    FileProtected = 9,
    /// The target file does not exist
    FileNotFound = 10,
}

impl ServerResult {
    /// The result for a wire value, if it names one.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            1 => Self::Fail,
            2 => Self::FailErrno,
            3 => Self::InvalidDataSize,
            4 => Self::InvalidSession,
            5 => Self::NoSessionsAvailable,
            6 => Self::Eof,
            7 => Self::UnknownCommand,
            8 => Self::FileExists,
            9 => Self::FileProtected,
            10 => Self::FileNotFound,
            _ => return None,
        })
    }
}

/// `ENOENT`; PX4 reports missing files as [`ServerResult::FailErrno`] plus
/// this errno rather than [`ServerResult::FileNotFound`].
pub(crate) const ENOENT: u8 = 2;
