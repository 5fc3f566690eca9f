//! Client-side engine for the MAVLink File Transfer Protocol.
//!
//! MAVLink FTP moves files between a ground station and a vehicle over a
//! lossy datagram link: fixed-layout request/response payloads ride inside
//! `FILE_TRANSFER_PROTOCOL` frames, the server owns the remote filesystem,
//! and the client repeats unanswered requests until it hears back or runs
//! out of patience.
//!
//! This crate implements the client half as a state machine independent of
//! any particular transport or runtime. The [`Engine`] consumes queued
//! [`Command`]s, decoded inbound [`Payload`]s, and timer expiries, and
//! yields [`Event`]s describing the frames to transmit, the response timer
//! to arm or cancel, and the progress and completion of each operation.
//! The `mavftp` crate drives it with Tokio.
#![warn(missing_docs)]

mod engine;
mod error;
mod opcode;
mod payload;
#[cfg(test)]
mod tests;
mod work;

pub use crate::engine::{
    Command, Completion, Engine, EngineConfig, Event, OpId, DEFAULT_RETRIES,
};
pub use crate::error::Error;
pub use crate::opcode::{Opcode, ServerResult};
pub use crate::payload::{DecodeError, Payload, HEADER_SIZE, MAX_DATA_SIZE, PAYLOAD_SIZE};

/// Modulo-2¹⁶ "strictly earlier", after serial number arithmetic.
///
/// Sequence numbers wrap, so responses from before the wrap must still
/// compare as stale against responses from after it.
pub fn seq_lt(a: u16, b: u16) -> bool {
    const HALF: u16 = u16::MAX / 2;
    (a < b && b - a < HALF) || (a > b && a - b > HALF)
}
