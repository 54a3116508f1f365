//! VAG (keyword 0x01 0x8A) driver stub.
//!
//! Only the start-communication handshake is implemented; the block
//! transfer protocol that follows (byte-wise acknowledged telegrams with
//! sequence numbers) is not. Data operations report
//! [crate::DiagError::ProtocolNotSupported] rather than pretend.

use crate::hardware::{BusInit, L0Device, L0Flags, SerialSettings};
use crate::message::DiagMessage;
use crate::timing::{millisleep, W4MIN, W5MIN};
use crate::{DiagError, DiagResult};

use super::{read_byte, ConnState, ConnectionConfig, InitMode, L2Flags};

/// The eventual block protocol is framed with its own checksum
pub(crate) const L2_FLAGS: L2Flags = L2Flags::FRAMED.union(L2Flags::DOES_CKSUM);

/// Customary VAG line speed
const DEFAULT_SPEED: u32 = 9600;

/// Key bytes after stripping the odd parity bit; 0x8A on the wire
const VAG_KB1: u8 = 0x01;
const VAG_KB2: u8 = 0x0A;

/// The ECU sends the key bytes leisurely compared to ISO9141
const KEY_BYTE_TIMEOUT_MS: u64 = 100;

/// VAG protocol handshake state
#[derive(Debug)]
pub struct Vag;

impl Vag {
    /// 5-baud wake-up and key byte validation against the fixed VAG pair
    pub(crate) fn start_comms(
        dev: &mut dyn L0Device,
        state: &mut ConnState,
        cfg: &ConnectionConfig,
    ) -> DiagResult<Self> {
        if state.speed == 0 {
            state.speed = DEFAULT_SPEED;
        }
        dev.set_speed(&SerialSettings::speed_8n1(state.speed))?;

        if cfg.init != InitMode::FiveBaud {
            return Err(DiagError::ProtocolNotSupported);
        }

        dev.flush_input()?;
        millisleep(W5MIN);
        dev.init_bus(BusInit::FiveBaud { addr: cfg.target })?;

        // Key bytes arrive 7O1; read as 8N1 and drop the parity bit
        let kb1 = read_byte(dev, KEY_BYTE_TIMEOUT_MS)? & 0x7F;
        let kb2 = read_byte(dev, KEY_BYTE_TIMEOUT_MS)? & 0x7F;
        if kb1 != VAG_KB1 || kb2 != VAG_KB2 {
            log::warn!("VAG init returned key bytes 0x{kb1:02X} 0x{kb2:02X}");
            return Err(DiagError::WrongKeyBytes);
        }
        state.kb1 = kb1;
        state.kb2 = kb2;

        if !state.l0_flags.contains(L0Flags::DOES_SLOW_INIT) {
            millisleep(W4MIN);
            dev.send(&[!kb2])?;
        }
        log::debug!("VAG bus up, key bytes 0x{kb1:02X} 0x{kb2:02X}");
        Ok(Self)
    }

    /// Block transfer is not implemented
    pub(crate) fn send(
        &mut self,
        _dev: &mut dyn L0Device,
        _state: &ConnState,
        _msg: &DiagMessage,
    ) -> DiagResult<()> {
        Err(DiagError::ProtocolNotSupported)
    }

    /// Block transfer is not implemented
    pub(crate) fn recv(
        &mut self,
        _dev: &mut dyn L0Device,
        _state: &ConnState,
        _timeout_ms: u64,
    ) -> DiagResult<Vec<DiagMessage>> {
        Err(DiagError::ProtocolNotSupported)
    }
}
