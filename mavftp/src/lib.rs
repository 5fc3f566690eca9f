//! MAVLink File Transfer Protocol client for Tokio.
//!
//! MAVLink FTP manipulates the filesystem of a remote vehicle, typically an
//! autopilot, over a lossy datagram link. This crate wraps the sans-IO
//! engine from `mavftp-proto` with the runtime glue a ground application
//! needs: response timers, a serialized operation queue behind `async`
//! methods, temp-file staging for uploading generated content, and local
//! checksumming for remote-file comparison.
//!
//! The crate deliberately does not speak MAVLink itself. The application
//! bridges the transport: it implements [`FrameSink`] to pack and send
//! outbound [`OutboundFrame`]s with its own MAVLink stack, and feeds decoded
//! inbound `FILE_TRANSFER_PROTOCOL` payloads back through
//! [`FtpClient::receive`]. One client talks to one peer.
#![warn(missing_docs)]

mod checksum;
mod client;
mod transport;

pub use mavftp_proto::{
    Completion, Error, OpId, Opcode, Payload, ServerResult, MAX_DATA_SIZE, PAYLOAD_SIZE,
};

pub use crate::checksum::{crc32, file_crc32};
pub use crate::client::{ClientConfig, FtpClient, TransferProgress};
pub use crate::transport::{FrameSink, InboundFrame, OutboundFrame, AUTOPILOT_COMPONENT_ID};
