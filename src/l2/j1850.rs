//! SAE J1850 driver (VPW and PWM).
//!
//! Frames carry a 3 byte header (format, target, source) and the SAE
//! J1850 CRC-8 trailer. The bus symbols are generated by the adapter;
//! this driver only supports adapters that assemble whole frames in
//! hardware and reports anything else as unsupported. Arbitration losses
//! surface as bus errors and are retried with a bounded resend policy.

use crate::hardware::{L0Device, L0Flags};
use crate::message::{DiagMessage, MsgFlags};
use crate::timing::{millisleep, SMART_TIMEOUT_MS};
use crate::{DiagError, DiagResult};

use super::{send_spaced, ConnState, ConnectionConfig, L2Flags, RetryPolicy};

/// Messages come back framed, payload only and CRC verified; there is no
/// initialisation handshake, a connection always succeeds
pub(crate) const L2_FLAGS: L2Flags = L2Flags::FRAMED
    .union(L2Flags::DATA_ONLY)
    .union(L2Flags::DOES_CKSUM)
    .union(L2Flags::CONNECTS_ALWAYS);

/// VPW runs at 10.4 kbps, PWM at 41.6 kbps
const VPW_SPEED: u32 = 10400;
const PWM_SPEED: u32 = 41600;

/// Header format byte, one per bus encoding
const VPW_FORMAT: u8 = 0x68;
const PWM_FORMAT: u8 = 0x61;

/// J1850 limits a frame to 12 bytes including the CRC
const MAX_FRAME: usize = 12;
/// Header, one data byte and the CRC
const MIN_FRAME: usize = 5;
/// Header plus CRC overhead
const FRAME_OVERHEAD: usize = 4;

/// Quiet period after opening before the first frame goes out
const BUS_SETTLE_MS: u64 = 50;

/// Largest single read requested from the adapter
const MAX_RECV: usize = 1024;

/// SAE J1850 protocol state
#[derive(Debug)]
pub struct J1850 {
    source: u8,
    target: u8,
    pwm: bool,
    /// Last transmitted frame, put back on the bus after a collision
    last_tx: Option<Vec<u8>>,
    retry: RetryPolicy,
}

impl J1850 {
    /// J1850 has no wake-up handshake; flush, settle and go
    pub(crate) fn start_comms(
        dev: &mut dyn L0Device,
        state: &mut ConnState,
        cfg: &ConnectionConfig,
        pwm: bool,
    ) -> DiagResult<Self> {
        if state.speed == 0 {
            state.speed = if pwm { PWM_SPEED } else { VPW_SPEED };
        }
        dev.flush_input()?;
        millisleep(BUS_SETTLE_MS);
        Ok(Self {
            source: cfg.source,
            target: cfg.target,
            pwm,
            last_tx: None,
            retry: RetryPolicy::default(),
        })
    }

    /// Frames and transmits one message, remembering it for collision
    /// recovery
    pub(crate) fn send(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        msg: &DiagMessage,
    ) -> DiagResult<()> {
        if msg.data.is_empty() || msg.data.len() > MAX_FRAME - FRAME_OVERHEAD {
            return Err(DiagError::BadLength);
        }

        let mut buf = Vec::with_capacity(msg.data.len() + FRAME_OVERHEAD);
        buf.push(if self.pwm { PWM_FORMAT } else { VPW_FORMAT });
        buf.push(msg.dest);
        buf.push(msg.src);
        buf.extend_from_slice(&msg.data);
        if !state.l0_flags.contains(L0Flags::DOES_L2_CKSUM) {
            buf.push(crc8(&buf));
        }
        log::trace!("J1850 tx {buf:02X?}");
        send_spaced(dev, &buf, state.timing.p4min)?;
        self.last_tx = Some(buf);
        Ok(())
    }

    /// Receives one frame from the adapter.
    ///
    /// Only frame-assembling adapters are usable: the VPW/PWM symbol
    /// timing cannot be recovered from a byte stream after the fact
    pub(crate) fn recv(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        timeout_ms: u64,
    ) -> DiagResult<Vec<DiagMessage>> {
        if !state.l0_flags.contains(L0Flags::DOES_L2_FRAME) {
            return Err(DiagError::ProtocolNotSupported);
        }
        // Frame-buffering adapters deliver late
        let tout = timeout_ms.max(SMART_TIMEOUT_MS);

        let last_tx = self.last_tx.as_deref();
        let frame = self.retry.run(
            dev,
            |dev| dev.recv(MAX_RECV, tout),
            |dev| match last_tx {
                Some(buf) => dev.send(buf),
                None => Ok(()),
            },
        )?;
        log::trace!("J1850 rx {frame:02X?}");
        self.decode(state, &frame).map(|m| vec![m])
    }

    fn decode(&self, state: &ConnState, frame: &[u8]) -> DiagResult<DiagMessage> {
        let stripped = state.l0_flags.contains(L0Flags::STRIPS_L2_CKSUM);
        let min_len = if stripped { MIN_FRAME - 1 } else { MIN_FRAME };
        if frame.len() < min_len {
            return Err(DiagError::BadData);
        }
        let data_end = if stripped {
            frame.len()
        } else {
            let rcv = frame[frame.len() - 1];
            let calc = crc8(&frame[..frame.len() - 1]);
            if rcv != calc {
                log::warn!("J1850 CRC 0x{rcv:02X}, expected 0x{calc:02X}");
                return Err(DiagError::BadData);
            }
            frame.len() - 1
        };
        Ok(DiagMessage::received(
            frame[2],
            frame[1],
            frame[3..data_end].to_vec(),
            MsgFlags::FRAMED | MsgFlags::DATA_ONLY | MsgFlags::CHECKSUMMED,
        ))
    }
}

/// SAE J1850 CRC-8. Bit-serial over MSB-first bits with the polynomial
/// chosen per bit, seed 0xFF, result inverted.
pub(crate) fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        for bit in (0..8).rev() {
            if byte & (1 << bit) != 0 {
                let poly = if crc & 0x80 != 0 { 0x01 } else { 0x1C };
                crc = ((crc << 1) | 1) ^ poly;
            } else {
                let poly = if crc & 0x80 != 0 { 0x1D } else { 0x00 };
                crc = (crc << 1) ^ poly;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationDevice;
    use crate::timing::Timing;

    fn state_for(dev: &SimulationDevice) -> ConnState {
        ConnState {
            speed: VPW_SPEED,
            kb1: 0,
            kb2: 0,
            timing: Timing::j1850(),
            l0_flags: dev.flags(),
        }
    }

    fn vpw(dev: &mut SimulationDevice, state: &mut ConnState) -> J1850 {
        J1850::start_comms(dev, state, &ConnectionConfig::default(), false).unwrap()
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc8(&[0x68, 0x6A, 0xF1, 0x01]), 0xF7);
    }

    #[test]
    fn crc_detects_corruption() {
        let frame = [0x68, 0x33, 0xF1, 0x01, 0x00];
        let crc = crc8(&frame);
        let mut corrupt = frame;
        corrupt[3] ^= 0x01;
        assert_ne!(crc8(&corrupt), crc);
    }

    #[test]
    fn send_adds_header_and_crc() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        proto
            .send(&mut dev, &state, &DiagMessage::new(0xF1, 0x33, &[0x01, 0x00]))
            .unwrap();
        let tx = dev.last_tx().unwrap();
        assert_eq!(&tx[..5], &[0x68, 0x33, 0xF1, 0x01, 0x00]);
        assert_eq!(tx[5], crc8(&tx[..5]));
    }

    #[test]
    fn pwm_uses_its_own_format_byte() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        state.speed = 0;
        let mut proto =
            J1850::start_comms(&mut dev, &mut state, &ConnectionConfig::default(), true).unwrap();
        assert_eq!(state.speed, PWM_SPEED);

        proto
            .send(&mut dev, &state, &DiagMessage::new(0xF1, 0x33, &[0x01]))
            .unwrap();
        assert_eq!(dev.last_tx().unwrap()[0], 0x61);
    }

    #[test]
    fn send_rejects_oversize_payload() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        let msg = DiagMessage::new(0xF1, 0x33, &[0u8; 9]);
        assert!(matches!(
            proto.send(&mut dev, &state, &msg),
            Err(DiagError::BadLength)
        ));
    }

    #[test]
    fn recv_requires_framing_adapter() {
        let mut dev = SimulationDevice::new(L0Flags::empty());
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        assert!(matches!(
            proto.recv(&mut dev, &state, 100),
            Err(DiagError::ProtocolNotSupported)
        ));
    }

    #[test]
    fn recv_decodes_frame() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        let mut frame = vec![0x68, 0xF1, 0x10, 0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10];
        frame.push(crc8(&frame));
        dev.queue_bytes(&frame);

        let msgs = proto.recv(&mut dev, &state, 100).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].src, 0x10);
        assert_eq!(msgs[0].dest, 0xF1);
        assert_eq!(msgs[0].data, vec![0x41, 0x00, 0xBE, 0x1F, 0xB8, 0x10]);
    }

    #[test]
    fn recv_rejects_bad_crc() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        let mut frame = vec![0x68, 0xF1, 0x10, 0x41, 0x00];
        frame.push(crc8(&frame) ^ 0xFF);
        dev.queue_bytes(&frame);

        assert!(matches!(
            proto.recv(&mut dev, &state, 100),
            Err(DiagError::BadData)
        ));
    }

    #[test]
    fn contention_resends_last_frame() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        proto
            .send(&mut dev, &state, &DiagMessage::new(0xF1, 0x33, &[0x01, 0x00]))
            .unwrap();
        let sent = dev.last_tx().unwrap().to_vec();

        dev.queue_error(DiagError::BusError);
        dev.queue_error(DiagError::BusError);
        let mut frame = vec![0x68, 0xF1, 0x10, 0x41, 0x00];
        frame.push(crc8(&frame));
        dev.queue_bytes(&frame);

        let msgs = proto.recv(&mut dev, &state, 100).unwrap();
        assert_eq!(msgs.len(), 1);
        // The original request went back out twice
        assert_eq!(dev.tx().len(), 3);
        assert!(dev.tx()[1..].iter().all(|t| *t == sent));
    }

    #[test]
    fn contention_retry_is_bounded() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_L2_FRAME);
        let mut state = state_for(&dev);
        let mut proto = vpw(&mut dev, &mut state);

        for _ in 0..=proto.retry.max_attempts {
            dev.queue_error(DiagError::BusError);
        }
        assert!(matches!(
            proto.recv(&mut dev, &state, 100),
            Err(DiagError::BusError)
        ));
    }
}
