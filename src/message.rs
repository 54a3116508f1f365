//! Module for the shared diagnostic message model used by the L2 and L3
//! layers

use std::time::Instant;

bitflags::bitflags! {
    /// Format flags describing how far a received message has been
    /// processed by the lower layers
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MsgFlags: u8 {
        /// The message is a complete frame (not a partial byte run)
        const FRAMED = 0x01;
        /// Headers and trailers have been stripped, only payload remains
        const DATA_ONLY = 0x02;
        /// The frame checksum has been verified (and removed)
        const CHECKSUMMED = 0x04;
        /// The message used functional (broadcast) addressing
        const FUNC_ADDR = 0x08;
    }
}

/// One diagnostic message.
///
/// Owns its payload exclusively. Where the original wire read yielded
/// several logical responses in one buffer (multiple ECUs answering a
/// functional request, or a misframed read), the receive path splits them
/// into separate owned messages returned as an ordered `Vec<DiagMessage>`
/// in arrival order.
#[derive(Debug, Clone)]
pub struct DiagMessage {
    /// Message payload. Depending on [MsgFlags::DATA_ONLY] this is either
    /// the raw frame or just the application data
    pub data: Vec<u8>,
    /// Source address (the originating ECU on receive)
    pub src: u8,
    /// Destination address (the tester, 0xF1, on receive)
    pub dest: u8,
    /// Processing state flags
    pub flags: MsgFlags,
    /// Instant the message was received, `None` for outgoing messages
    pub timestamp: Option<Instant>,
}

impl DiagMessage {
    /// Creates an outgoing message carrying `data` from `src`
    pub fn new(src: u8, dest: u8, data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            src,
            dest,
            flags: MsgFlags::default(),
            timestamp: None,
        }
    }

    /// Creates a received message stamped with the current instant
    pub fn received(src: u8, dest: u8, data: Vec<u8>, flags: MsgFlags) -> Self {
        Self {
            data,
            src,
            dest,
            flags,
            timestamp: Some(Instant::now()),
        }
    }
}
