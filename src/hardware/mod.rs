//! The hardware module contains the L0 device abstraction: the contract
//! every diagnostic adapter driver fulfils, plus a generic serial K-line
//! implementation and a simulation device for testing.

#[cfg(feature = "serial")]
pub mod serial;
pub mod simulation;

use crate::DiagResult;

bitflags::bitflags! {
    /// Capability flags of an L0 adapter.
    ///
    /// These are read-only facts about the adapter for the lifetime of a
    /// connection; the L2 drivers consult them to decide which framing and
    /// checksum work they must perform themselves versus skip.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct L0Flags: u32 {
        /// The adapter assembles and delivers whole L2 frames
        const DOES_L2_FRAME = 0x0001;
        /// The adapter appends the L2 checksum on transmit
        const DOES_L2_CKSUM = 0x0002;
        /// The adapter verifies and strips the L2 checksum on receive
        const STRIPS_L2_CKSUM = 0x0004;
        /// The adapter performs the P4 inter-byte spacing itself
        const DOES_P4_WAIT = 0x0008;
        /// The adapter completes the 5-baud handshake itself (inverted
        /// key byte / inverted address exchange)
        const DOES_SLOW_INIT = 0x0010;
        /// 5-baud initialisation supported
        const SLOW = 0x0020;
        /// Fast initialisation supported
        const FAST = 0x0040;
        /// Fast initialisation preferred when both are available
        const PREFER_FAST = 0x0080;
    }
}

/// Bus wake-up sequence kinds an adapter can be asked to perform
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusInit {
    /// ISO9141/ISO14230 5-baud address handshake towards `addr`
    FiveBaud {
        /// Target ECU address, 0x33 for the J1979 application protocol
        addr: u8,
    },
    /// ISO14230 fast initialisation pulse. The subsequent
    /// StartCommunication request completes the wake-up
    Fast,
}

/// Serial line settings for [L0Device::set_speed]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialSettings {
    /// Line speed in bits per second
    pub speed: u32,
    /// Data bits (7 or 8)
    pub databits: u8,
    /// Stop bits (1 or 2)
    pub stopbits: u8,
    /// Parity enabled. K-line protocols use 8N1 on the wire and leave
    /// 7O1 interpretation to the upper layers
    pub parity: bool,
}

impl SerialSettings {
    /// 8N1 at the given speed, the configuration used by every protocol
    /// in this stack
    pub const fn speed_8n1(speed: u32) -> Self {
        Self {
            speed,
            databits: 8,
            stopbits: 1,
            parity: false,
        }
    }
}

/// Contract of an L0 diagnostic adapter.
///
/// All operations are synchronous and blocking; receive timeouts are in
/// milliseconds. An implementation is opened by its own constructor and
/// closed by dropping it.
pub trait L0Device: Send + std::fmt::Debug {
    /// Writes `data` to the bus
    fn send(&mut self, data: &[u8]) -> DiagResult<()>;

    /// Reads up to `max_len` bytes, waiting at most `timeout_ms` for the
    /// first byte. Returns [crate::DiagError::Timeout] if nothing arrived
    fn recv(&mut self, max_len: usize, timeout_ms: u64) -> DiagResult<Vec<u8>>;

    /// Performs a bus wake-up sequence
    fn init_bus(&mut self, init: BusInit) -> DiagResult<()>;

    /// Reconfigures the serial line
    fn set_speed(&mut self, settings: &SerialSettings) -> DiagResult<()>;

    /// Discards any unread input
    fn flush_input(&mut self) -> DiagResult<()>;

    /// Capability flags of this adapter
    fn flags(&self) -> L0Flags;
}
