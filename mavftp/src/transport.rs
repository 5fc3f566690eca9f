//! The seam between the engine and the application's MAVLink transport.

use mavftp_proto::PAYLOAD_SIZE;

/// The MAVLink component id of an autopilot, the default FTP peer.
pub const AUTOPILOT_COMPONENT_ID: u8 = 1;

/// Where outbound `FILE_TRANSFER_PROTOCOL` frames go.
///
/// Implementations pack the payload into a MAVLink v2 message with the given
/// addressing and hand it to their link. Sends are made while the client
/// holds its internal lock and must not block.
pub trait FrameSink: Send + Sync + 'static {
    /// Ships one frame towards the peer.
    fn send(&self, frame: OutboundFrame);
}

/// An encoded payload plus the addressing the transport needs to frame it.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Our system id
    pub system_id: u8,
    /// Our component id
    pub component_id: u8,
    /// Addressed system
    pub target_system_id: u8,
    /// Addressed component
    pub target_component_id: u8,
    /// MAVLink network id, normally zero
    pub network_id: u8,
    /// The encoded payload
    pub payload: [u8; PAYLOAD_SIZE],
}

/// A decoded inbound `FILE_TRANSFER_PROTOCOL` frame.
#[derive(Debug, Clone, Copy)]
pub struct InboundFrame<'a> {
    /// Sending system id
    pub system_id: u8,
    /// Sending component id
    pub component_id: u8,
    /// Addressed system; zero addresses everyone
    pub target_system_id: u8,
    /// Addressed component; zero addresses everyone
    pub target_component_id: u8,
    /// Raw payload bytes; MAVLink v2 may have truncated trailing zeros
    pub payload: &'a [u8],
}
