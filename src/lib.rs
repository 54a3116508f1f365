#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate implementing the legacy (pre-CAN) vehicle diagnostic protocol
//! stack used by OBD-II scan tools: bus wake-up, layer 2 framing and the
//! SAE J1979 session layer, running over a half-duplex serial K-line or
//! J1850 adapter.
//!
//! ## Protocol support
//!
//! ### ISO 9141-2
//! The classic K-line protocol. 5-baud bus initialisation with key byte
//! exchange, fixed 3 byte headers and an additive checksum. Target address
//! 0x33 selects the SAE J1979 scan tool application protocol.
//!
//! ### ISO 14230 (KWP2000)
//! Keyword protocol 2000 over K-line. Supports both the 5-baud and the
//! fast initialisation sequences, length-encoded headers and TesterPresent
//! keepalive handling.
//!
//! ### SAE J1850 (VPW / PWM)
//! Header plus CRC8 framing. Receive requires an adapter that performs
//! frame assembly in hardware; bus contention is retried with a bounded
//! policy.
//!
//! ### Raw
//! A pure byte tunnel for adapters or protocols that need no L2 framing.
//!
//! ### VAG (keyword 0x01 0x8A)
//! Only the start-communication handshake is implemented; data transfer
//! operations report [DiagError::ProtocolNotSupported].
//!
//! ## Layering
//!
//! * L0 — the adapter hardware, abstracted by [hardware::L0Device]
//! * L2 — protocol framing and bus init, [l2::L2Connection]
//! * L3 — the J1979 application session, [l3::j1979::J1979Session]
//!
//! A connection is single-owner: the bus is half duplex, so sends and
//! receives on one connection never overlap. All waits are blocking with
//! explicit millisecond timeouts; there are no background threads.

use std::sync::Arc;

pub mod dtc;
pub mod hardware;
pub mod l2;
pub mod l3;
pub mod message;
pub mod timing;

/// Diagnostic stack result
pub type DiagResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic stack error
///
/// Low level IO and timeout errors propagate unchanged through the send and
/// receive paths. [DiagError::IncompleteData] is consumed internally by the
/// L3 reassembly loop (it means "keep buffering") and is only surfaced by
/// functions that inspect partial frames directly.
pub enum DiagError {
    /// No data arrived within the requested timeout window. Recoverable,
    /// the caller may retry or give up
    #[error("timeout awaiting data from the bus")]
    Timeout,
    /// A partial frame was received. More bytes are needed before a
    /// decision can be made
    #[error("incomplete frame, more data required")]
    IncompleteData,
    /// Structurally invalid data (bad header, bad checksum, or an invalid
    /// mode/PID combination). Not recoverable within the current attempt
    #[error("malformed data received from the bus")]
    BadData,
    /// The key bytes (or the inverted address echo) received during bus
    /// initialisation did not match the protocol. The whole handshake must
    /// be restarted
    #[error("wrong key bytes received during bus initialisation")]
    WrongKeyBytes,
    /// Bus contention (VPW/PWM arbitration loss). Retried internally up to
    /// the configured bound, then surfaced
    #[error("bus error (arbitration collision)")]
    BusError,
    /// The selected driver and adapter combination lacks a required
    /// capability, or the operation is an unimplemented protocol stub
    #[error("protocol or operation not supported by this driver/adapter combination")]
    ProtocolNotSupported,
    /// The payload exceeds the maximum frame size of the protocol
    #[error("payload exceeds the protocol's maximum frame length")]
    BadLength,
    /// Underlying transport IO error
    #[error("transport IO error")]
    Io(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
}

impl From<std::io::Error> for DiagError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            DiagError::Timeout
        } else {
            DiagError::Io(Arc::new(e))
        }
    }
}
