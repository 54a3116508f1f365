//! ISO 9141-2 driver.
//!
//! The classic OBD-II K-line protocol: 5-baud initialisation with key byte
//! exchange, a fixed 3 byte header (format, target, source) and an 8 bit
//! additive checksum. Frames are at most 11 bytes, so application payloads
//! are at most 7 bytes.

use crate::hardware::{BusInit, L0Device, L0Flags, SerialSettings};
use crate::message::{DiagMessage, MsgFlags};
use crate::timing::{millisleep, SMART_TIMEOUT_MS, W2MAX, W3MAX, W4MAX, W4MIN, W5MIN};
use crate::{DiagError, DiagResult};

use super::{read_byte, send_spaced, ConnState, ConnectionConfig, InitMode, L2Flags};

/// Messages come back framed, payload only and checksum verified
pub(crate) const L2_FLAGS: L2Flags = L2Flags::FRAMED
    .union(L2Flags::DATA_ONLY)
    .union(L2Flags::DOES_CKSUM);

/// K-line speed mandated by ISO9141-2
const DEFAULT_SPEED: u32 = 10400;

/// Header to the ECU: format, functional target, tester source follows
const REQUEST_HEADER: [u8; 2] = [0x68, 0x6A];
/// Header from the ECU: format, tester target, ECU source follows
const RESPONSE_HEADER: [u8; 2] = [0x48, 0x6B];

/// Longest frame on the wire, header and checksum included
const MAX_FRAME: usize = 11;
/// Shortest valid frame: header, one data byte, checksum
const MIN_FRAME: usize = 5;
/// Header plus checksum overhead
const FRAME_OVERHEAD: usize = 4;

/// Largest single read requested from the adapter
const MAX_RECV: usize = 1024;

/// ISO9141-2 protocol state
#[derive(Debug)]
pub struct Iso9141 {
    source: u8,
    target: u8,
}

impl Iso9141 {
    /// Wakes the bus with the 5-baud sequence and validates the key bytes
    pub(crate) fn start_comms(
        dev: &mut dyn L0Device,
        state: &mut ConnState,
        cfg: &ConnectionConfig,
    ) -> DiagResult<Self> {
        if state.speed == 0 {
            state.speed = DEFAULT_SPEED;
        }
        dev.set_speed(&SerialSettings::speed_8n1(state.speed))?;

        let proto = Self {
            source: cfg.source,
            target: cfg.target,
        };
        match cfg.init {
            InitMode::FiveBaud => proto.wakeup_ecu(dev, state)?,
            InitMode::Monitor => {}
            InitMode::Fast => return Err(DiagError::ProtocolNotSupported),
        }
        Ok(proto)
    }

    /// The 5-baud handshake: address at 5 baud, synch pattern, two key
    /// bytes, then the inverted key byte / inverted address exchange
    fn wakeup_ecu(&self, dev: &mut dyn L0Device, state: &mut ConnState) -> DiagResult<()> {
        dev.flush_input()?;

        // The bus must be quiet before the address goes out
        millisleep(W5MIN);
        dev.init_bus(BusInit::FiveBaud { addr: self.target })?;

        let kb1 = read_byte(dev, W2MAX)?;
        let kb2 = read_byte(dev, W3MAX)?;
        if kb1 != kb2 || (kb1 != 0x08 && kb1 != 0x94) {
            log::warn!("ISO9141 init returned key bytes 0x{kb1:02X} 0x{kb2:02X}");
            return Err(DiagError::WrongKeyBytes);
        }
        state.kb1 = kb1;
        state.kb2 = kb2;
        // Key byte 0x94 advertises the shorter request-to-response gap
        state.timing.p2min = if kb1 == 0x94 { 0 } else { 25 };

        if !state.l0_flags.contains(L0Flags::DOES_SLOW_INIT) {
            millisleep(W4MIN);
            dev.send(&[!kb2])?;

            let inv_addr = read_byte(dev, W4MAX)?;
            if inv_addr != !self.target {
                log::warn!("ISO9141 init address echo was 0x{inv_addr:02X}");
                return Err(DiagError::WrongKeyBytes);
            }
        }
        log::debug!("ISO9141 bus up, key bytes 0x{kb1:02X} 0x{kb2:02X}");
        Ok(())
    }

    /// Frames and transmits one request after the P3 quiet period
    pub(crate) fn send(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        msg: &DiagMessage,
    ) -> DiagResult<()> {
        if msg.data.is_empty() || msg.data.len() > MAX_FRAME - FRAME_OVERHEAD {
            return Err(DiagError::BadLength);
        }

        // Quiet time since the last response
        millisleep(state.timing.p3min);

        let mut buf = Vec::with_capacity(msg.data.len() + FRAME_OVERHEAD);
        buf.extend_from_slice(&REQUEST_HEADER);
        buf.push(msg.src);
        buf.extend_from_slice(&msg.data);
        if !state.l0_flags.contains(L0Flags::DOES_L2_CKSUM) {
            buf.push(checksum(&buf));
        }
        log::trace!("ISO9141 tx {buf:02X?}");
        send_spaced(dev, &buf, state.timing.p4min)
    }

    /// Receives and decodes every frame pending on the bus
    pub(crate) fn recv(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        timeout_ms: u64,
    ) -> DiagResult<Vec<DiagMessage>> {
        let buf = int_recv(dev, state, timeout_ms)?;
        log::trace!("ISO9141 rx {buf:02X?}");
        self.decode(state, &buf)
    }

    /// Splits the raw receive buffer into frames and validates each one
    fn decode(&self, state: &ConnState, buf: &[u8]) -> DiagResult<Vec<DiagMessage>> {
        let stripped = state.l0_flags.contains(L0Flags::STRIPS_L2_CKSUM);
        let frames = if stripped {
            // No checksum bytes to scan on, the adapter delivers exactly
            // one verified frame per read
            vec![buf]
        } else {
            split_frames(buf)
        };

        let min_len = if stripped { MIN_FRAME - 1 } else { MIN_FRAME };
        let mut msgs = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.len() < min_len {
                return Err(DiagError::IncompleteData);
            }
            if frame.len() > MAX_FRAME {
                return Err(DiagError::BadData);
            }
            if frame[..2] != RESPONSE_HEADER {
                log::warn!("ISO9141 bad response header {:02X?}", &frame[..2]);
                return Err(DiagError::BadData);
            }
            let data_end = if stripped {
                frame.len()
            } else {
                let rcv = frame[frame.len() - 1];
                let calc = checksum(&frame[..frame.len() - 1]);
                if rcv != calc {
                    log::warn!("ISO9141 checksum 0x{rcv:02X}, expected 0x{calc:02X}");
                    return Err(DiagError::BadData);
                }
                frame.len() - 1
            };
            msgs.push(DiagMessage::received(
                frame[2],
                self.source,
                frame[3..data_end].to_vec(),
                MsgFlags::FRAMED | MsgFlags::DATA_ONLY | MsgFlags::CHECKSUMMED,
            ));
        }
        Ok(msgs)
    }
}

/// The byte-accumulating receive loop.
///
/// Three windows in turn: the caller's timeout until the first byte, the
/// inter-byte window while a frame is arriving, and the inter-frame window
/// that lets further ECUs answer a functional request. Reception ends when
/// the inter-frame window closes quiet.
pub(crate) fn int_recv(
    dev: &mut dyn L0Device,
    state: &ConnState,
    timeout_ms: u64,
) -> DiagResult<Vec<u8>> {
    // Buffering adapters deliver late, grant them slack
    let smart = state
        .l0_flags
        .intersects(L0Flags::DOES_L2_FRAME | L0Flags::DOES_P4_WAIT);
    let interbyte = state
        .timing
        .p1max
        .max(state.timing.p2min.saturating_sub(2));
    let interframe = state.timing.p3min + if smart { SMART_TIMEOUT_MS } else { 0 };

    let mut buf: Vec<u8> = Vec::new();
    let mut tout = timeout_ms;
    let mut draining = false;
    loop {
        match dev.recv(MAX_RECV, tout) {
            Ok(bytes) => {
                buf.extend_from_slice(&bytes);
                tout = interbyte;
                draining = false;
            }
            Err(DiagError::Timeout) => {
                if buf.is_empty() {
                    return Err(DiagError::Timeout);
                }
                if draining {
                    return Ok(buf);
                }
                draining = true;
                tout = interframe;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Splits a receive buffer holding several back to back responses.
///
/// A new frame starts wherever the response header reappears right after a
/// position whose preceding bytes form a checksum-valid frame of legal
/// length. Without such a boundary the whole remainder is one frame.
fn split_frames(buf: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut start = 0;
    while start < buf.len() {
        let mut end = buf.len();
        let mut i = start + MIN_FRAME;
        while i + 1 < buf.len() {
            if buf[i..i + 2] == RESPONSE_HEADER
                && i - start <= MAX_FRAME
                && checksum(&buf[start..i - 1]) == buf[i - 1]
            {
                end = i;
                break;
            }
            i += 1;
        }
        frames.push(&buf[start..end]);
        start = end;
    }
    frames
}

/// 8 bit additive checksum over header and data
pub(crate) fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::SimulationDevice;
    use crate::l2::{L2Connection, ProtocolKind};

    fn config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    fn connect(dev: SimulationDevice, cfg: &ConnectionConfig) -> DiagResult<L2Connection> {
        L2Connection::start_comms(Box::new(dev), ProtocolKind::Iso9141, cfg)
    }

    fn state_for(dev: &SimulationDevice) -> ConnState {
        ConnState {
            speed: DEFAULT_SPEED,
            kb1: 0,
            kb2: 0,
            timing: crate::timing::Timing::iso9141(),
            l0_flags: dev.flags(),
        }
    }

    #[test]
    fn additive_checksum() {
        assert_eq!(checksum(&[0x48, 0x6B, 0x01, 0x02, 0x03]), 0xB9);
        assert_eq!(checksum(&[0xFF, 0x01]), 0x00);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn five_baud_handshake() {
        let dev = SimulationDevice::new(L0Flags::SLOW);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[!0x33]);

        let conn = connect(dev, &config()).unwrap();
        assert_eq!(conn.key_bytes(), (0x08, 0x08));
        assert_eq!(conn.timing().p2min, 25);
        assert_eq!(conn.speed(), 10400);
    }

    #[test]
    fn handshake_sends_inverted_key_byte() {
        let mut dev = SimulationDevice::new(L0Flags::SLOW);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[!0x33]);
        let mut state = state_for(&dev);

        Iso9141::start_comms(&mut dev, &mut state, &config()).unwrap();
        assert_eq!(dev.inits(), vec![BusInit::FiveBaud { addr: 0x33 }]);
        assert_eq!(dev.last_tx().as_deref(), Some(&[0xF7][..]));
    }

    #[test]
    fn key_byte_94_shortens_p2min() {
        let dev = SimulationDevice::new(L0Flags::SLOW);
        dev.queue_bytes(&[0x94]);
        dev.queue_bytes(&[0x94]);
        dev.queue_bytes(&[!0x33]);

        let conn = connect(dev, &config()).unwrap();
        assert_eq!(conn.key_bytes(), (0x94, 0x94));
        assert_eq!(conn.timing().p2min, 0);
    }

    #[test]
    fn mismatched_key_bytes_rejected() {
        let dev = SimulationDevice::new(L0Flags::SLOW);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[0x94]);

        assert!(matches!(
            connect(dev, &config()),
            Err(DiagError::WrongKeyBytes)
        ));
    }

    #[test]
    fn unknown_key_bytes_rejected() {
        let dev = SimulationDevice::new(L0Flags::SLOW);
        dev.queue_bytes(&[0x55]);
        dev.queue_bytes(&[0x55]);

        assert!(matches!(
            connect(dev, &config()),
            Err(DiagError::WrongKeyBytes)
        ));
    }

    #[test]
    fn bad_address_echo_rejected() {
        let dev = SimulationDevice::new(L0Flags::SLOW);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[0x42]);

        assert!(matches!(
            connect(dev, &config()),
            Err(DiagError::WrongKeyBytes)
        ));
    }

    #[test]
    fn smart_adapter_skips_inverted_exchange() {
        let dev = SimulationDevice::new(L0Flags::SLOW | L0Flags::DOES_SLOW_INIT);
        // Key bytes only, the adapter completes the rest of the handshake
        dev.queue_bytes(&[0x08]);
        dev.queue_bytes(&[0x08]);

        let conn = connect(dev, &config()).unwrap();
        assert_eq!(conn.key_bytes(), (0x08, 0x08));
    }

    fn monitor_config() -> ConnectionConfig {
        ConnectionConfig {
            init: InitMode::Monitor,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn send_frames_and_checksums() {
        let mut dev = SimulationDevice::new(L0Flags::DOES_P4_WAIT);
        let mut state = state_for(&dev);
        state.timing.p3min = 0;
        let mut proto = Iso9141 {
            source: 0xF1,
            target: 0x33,
        };

        proto
            .send(&mut dev, &state, &DiagMessage::new(0xF1, 0x33, &[0x01, 0x00]))
            .unwrap();
        assert_eq!(
            dev.last_tx().as_deref(),
            Some(&[0x68, 0x6A, 0xF1, 0x01, 0x00, 0xC4][..])
        );
    }

    #[test]
    fn send_paces_bytes_on_passive_adapters() {
        let mut dev = SimulationDevice::new(L0Flags::empty());
        let mut state = state_for(&dev);
        state.timing.p3min = 0;
        state.timing.p4min = 1;
        let mut proto = Iso9141 {
            source: 0xF1,
            target: 0x33,
        };

        proto
            .send(&mut dev, &state, &DiagMessage::new(0xF1, 0x33, &[0x01]))
            .unwrap();
        // 3 header bytes, 1 data byte, 1 checksum, each its own write
        assert_eq!(dev.tx().len(), 5);
        assert!(dev.tx().iter().all(|w| w.len() == 1));
    }

    #[test]
    fn send_rejects_oversize_payload() {
        let mut dev = SimulationDevice::new(L0Flags::empty());
        let state = state_for(&dev);
        let mut proto = Iso9141 {
            source: 0xF1,
            target: 0x33,
        };
        let msg = DiagMessage::new(0xF1, 0x33, &[0u8; 8]);
        assert!(matches!(
            proto.send(&mut dev, &state, &msg),
            Err(DiagError::BadLength)
        ));
    }

    #[test]
    fn recv_decodes_single_response() {
        let dev = SimulationDevice::new(L0Flags::empty());
        dev.queue_bytes(&[0x48, 0x6B, 0x01, 0x02, 0x03, 0xB9]);
        let mut conn = connect(dev, &monitor_config()).unwrap();

        let msgs = conn.recv_msgs(100).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, vec![0x02, 0x03]);
        assert_eq!(msgs[0].src, 0x01);
        assert_eq!(msgs[0].dest, 0xF1);
        assert!(msgs[0]
            .flags
            .contains(MsgFlags::FRAMED | MsgFlags::DATA_ONLY | MsgFlags::CHECKSUMMED));
    }

    #[test]
    fn recv_splits_multiple_ecus() {
        let dev = SimulationDevice::new(L0Flags::empty());
        // Two ECUs answering one functional request, back to back
        dev.queue_bytes(&[
            0x48, 0x6B, 0x01, 0x02, 0x03, 0xB9, // first frame
            0x48, 0x6B, 0x02, 0x41, 0x00, 0xF6, // second frame
        ]);
        let mut conn = connect(dev, &monitor_config()).unwrap();

        let msgs = conn.recv_msgs(100).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].src, 0x01);
        assert_eq!(msgs[0].data, vec![0x02, 0x03]);
        assert_eq!(msgs[1].src, 0x02);
        assert_eq!(msgs[1].data, vec![0x41, 0x00]);
    }

    #[test]
    fn recv_accumulates_split_reads() {
        let dev = SimulationDevice::new(L0Flags::empty());
        // One frame delivered in dribs and drabs
        dev.queue_bytes(&[0x48, 0x6B]);
        dev.queue_bytes(&[0x01, 0x02]);
        dev.queue_bytes(&[0x03, 0xB9]);
        let mut conn = connect(dev, &monitor_config()).unwrap();

        let msgs = conn.recv_msgs(100).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, vec![0x02, 0x03]);
    }

    #[test]
    fn recv_rejects_bad_checksum() {
        let dev = SimulationDevice::new(L0Flags::empty());
        dev.queue_bytes(&[0x48, 0x6B, 0x01, 0x02, 0x03, 0xBA]);
        let mut conn = connect(dev, &monitor_config()).unwrap();

        assert!(matches!(conn.recv_msgs(100), Err(DiagError::BadData)));
    }

    #[test]
    fn recv_rejects_bad_header() {
        let dev = SimulationDevice::new(L0Flags::empty());
        dev.queue_bytes(&[0x48, 0x6C, 0x01, 0x02, 0x03, 0xBA]);
        let mut conn = connect(dev, &monitor_config()).unwrap();

        assert!(matches!(conn.recv_msgs(100), Err(DiagError::BadData)));
    }

    #[test]
    fn recv_times_out_on_silence() {
        let dev = SimulationDevice::new(L0Flags::empty());
        let mut conn = connect(dev, &monitor_config()).unwrap();

        assert!(matches!(conn.recv_msgs(10), Err(DiagError::Timeout)));
    }

    #[test]
    fn recv_short_frame_is_incomplete() {
        let dev = SimulationDevice::new(L0Flags::empty());
        dev.queue_bytes(&[0x48, 0x6B, 0x01]);
        let mut conn = connect(dev, &monitor_config()).unwrap();

        assert!(matches!(conn.recv_msgs(100), Err(DiagError::IncompleteData)));
    }
}
