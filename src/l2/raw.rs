//! Raw passthrough driver.
//!
//! No framing, no checksums, no initialisation: bytes in, bytes out.
//! Useful for adapters that do all protocol work in firmware and for
//! poking at a bus by hand.

use crate::hardware::{L0Device, SerialSettings};
use crate::message::{DiagMessage, MsgFlags};
use crate::{DiagError, DiagResult};

use super::{send_spaced, ConnState, ConnectionConfig};

/// Fallback line speed when the caller does not pick one
const DEFAULT_SPEED: u32 = 10400;

/// Largest single read requested from the adapter
const MAX_RECV: usize = 1024;

/// Raw tunnel state
#[derive(Debug)]
pub struct Raw;

impl Raw {
    /// Sets the line speed, nothing else to negotiate
    pub(crate) fn start_comms(
        dev: &mut dyn L0Device,
        state: &mut ConnState,
        _cfg: &ConnectionConfig,
    ) -> DiagResult<Self> {
        if state.speed == 0 {
            state.speed = DEFAULT_SPEED;
        }
        dev.set_speed(&SerialSettings::speed_8n1(state.speed))?;
        Ok(Self)
    }

    /// Transmits the payload untouched
    pub(crate) fn send(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        msg: &DiagMessage,
    ) -> DiagResult<()> {
        if msg.data.is_empty() {
            return Err(DiagError::BadLength);
        }
        log::trace!("raw tx {:02X?}", msg.data);
        send_spaced(dev, &msg.data, state.timing.p4min)
    }

    /// Hands whatever arrived up as one unframed message. Addresses are
    /// unknown at this layer
    pub(crate) fn recv(
        &mut self,
        dev: &mut dyn L0Device,
        _state: &ConnState,
        timeout_ms: u64,
    ) -> DiagResult<Vec<DiagMessage>> {
        let bytes = dev.recv(MAX_RECV, timeout_ms)?;
        log::trace!("raw rx {bytes:02X?}");
        Ok(vec![DiagMessage::received(0, 0, bytes, MsgFlags::empty())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationDevice;
    use crate::hardware::L0Flags;
    use crate::timing::Timing;

    fn state_for(dev: &SimulationDevice) -> ConnState {
        let mut state = ConnState {
            speed: 0,
            kb1: 0,
            kb2: 0,
            timing: Timing::iso9141(),
            l0_flags: dev.flags(),
        };
        state.timing.p4min = 0;
        state
    }

    #[test]
    fn passthrough_round_trip() {
        let mut dev = SimulationDevice::new(L0Flags::empty());
        let mut state = state_for(&dev);
        let mut proto = Raw::start_comms(&mut dev, &mut state, &ConnectionConfig::default()).unwrap();
        assert_eq!(state.speed, DEFAULT_SPEED);
        assert_eq!(dev.line_settings().unwrap().speed, DEFAULT_SPEED);

        proto
            .send(&mut dev, &state, &DiagMessage::new(0xF1, 0x33, &[0x01, 0x02]))
            .unwrap();
        assert_eq!(dev.last_tx().as_deref(), Some(&[0x01, 0x02][..]));

        dev.queue_bytes(&[0xAA, 0xBB]);
        let msgs = proto.recv(&mut dev, &state, 100).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, vec![0xAA, 0xBB]);
        assert!(msgs[0].flags.is_empty());
    }

    #[test]
    fn empty_send_rejected() {
        let mut dev = SimulationDevice::new(L0Flags::empty());
        let mut state = state_for(&dev);
        let mut proto = Raw::start_comms(&mut dev, &mut state, &ConnectionConfig::default()).unwrap();

        assert!(matches!(
            proto.send(&mut dev, &state, &DiagMessage::new(0, 0, &[])),
            Err(DiagError::BadLength)
        ));
    }
}
