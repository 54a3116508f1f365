//! ISO 14230-2 (KWP2000) driver.
//!
//! Keyword protocol 2000 over K-line. Headers are length-encoded: the
//! format byte carries the addressing mode in its top two bits and the
//! payload length in the low six, with an additional length byte for
//! payloads above 63 bytes. Supports both the 5-baud and the fast
//! initialisation sequences and sends its own TesterPresent keepalive.

use crate::hardware::{BusInit, L0Device, L0Flags, SerialSettings};
use crate::message::{DiagMessage, MsgFlags};
use crate::timing::{millisleep, W2MAX, W3MAX, W4MAX, W4MIN, W5MIN};
use crate::{DiagError, DiagResult};

use super::iso9141::{checksum, int_recv};
use super::{read_byte, send_spaced, ConnState, ConnectionConfig, InitMode, L2Flags};

/// Messages come back framed, payload only, checksum verified, and the
/// driver holds the session open itself
pub(crate) const L2_FLAGS: L2Flags = L2Flags::FRAMED
    .union(L2Flags::DATA_ONLY)
    .union(L2Flags::DOES_CKSUM)
    .union(L2Flags::KEEPALIVE);

/// K-line speed mandated by ISO14230-2
const DEFAULT_SPEED: u32 = 10400;

/// StartCommunication service, completes the fast init
const START_COMMUNICATION: u8 = 0x81;
/// StopCommunication service
const STOP_COMMUNICATION: u8 = 0x82;
/// TesterPresent service, the idle keepalive
const TESTER_PRESENT: u8 = 0x3E;
/// Positive responses echo the service with bit 6 set
const POSITIVE_RESPONSE: u8 = 0x40;

/// Payload bound of the single-byte length encoding
const SHORT_LEN_MAX: usize = 0x3F;
/// Payload bound of the additional length byte encoding
const LONG_LEN_MAX: usize = 255;

/// One decoded KWP2000 header
struct Header {
    hdr_len: usize,
    data_len: usize,
    src: u8,
    dest: u8,
    functional: bool,
}

/// ISO14230-2 protocol state
#[derive(Debug)]
pub struct Iso14230 {
    source: u8,
    target: u8,
    /// Headerless frames are only legal once a frame with addresses has
    /// established who is talking
    first_frame: bool,
    /// Frames decoded beyond the one a caller consumed, handed out by the
    /// next receive before the bus is read again
    pending: Vec<DiagMessage>,
}

impl Iso14230 {
    /// Wakes the bus with the selected initialisation sequence
    pub(crate) fn start_comms(
        dev: &mut dyn L0Device,
        state: &mut ConnState,
        cfg: &ConnectionConfig,
    ) -> DiagResult<Self> {
        if state.speed == 0 {
            state.speed = DEFAULT_SPEED;
        }
        dev.set_speed(&SerialSettings::speed_8n1(state.speed))?;

        let mut proto = Self {
            source: cfg.source,
            target: cfg.target,
            first_frame: true,
            pending: Vec::new(),
        };
        match cfg.init {
            InitMode::FiveBaud => proto.slow_init(dev, state)?,
            InitMode::Fast => proto.fast_init(dev, state)?,
            InitMode::Monitor => {}
        }
        Ok(proto)
    }

    /// The 5-baud handshake. Unlike ISO9141 the key bytes are not
    /// restricted to fixed values, the pair identifies the header formats
    /// the ECU supports
    fn slow_init(&mut self, dev: &mut dyn L0Device, state: &mut ConnState) -> DiagResult<()> {
        dev.flush_input()?;
        millisleep(W5MIN);
        dev.init_bus(BusInit::FiveBaud { addr: self.target })?;

        let kb1 = read_byte(dev, W2MAX)?;
        let kb2 = read_byte(dev, W3MAX)?;
        state.kb1 = kb1;
        state.kb2 = kb2;

        if !state.l0_flags.contains(L0Flags::DOES_SLOW_INIT) {
            millisleep(W4MIN);
            dev.send(&[!kb2])?;

            let inv_addr = read_byte(dev, W4MAX)?;
            if inv_addr != !self.target {
                log::warn!("KWP2000 slow init address echo was 0x{inv_addr:02X}");
                return Err(DiagError::WrongKeyBytes);
            }
        }
        log::debug!("KWP2000 bus up (slow init), key bytes 0x{kb1:02X} 0x{kb2:02X}");
        Ok(())
    }

    /// The fast initialisation: wake-up pulse followed immediately by a
    /// StartCommunication transaction. The wake-up and the request form
    /// one unit, the ECU only answers if nothing intervenes
    fn fast_init(&mut self, dev: &mut dyn L0Device, state: &mut ConnState) -> DiagResult<()> {
        dev.flush_input()?;
        millisleep(W5MIN);
        dev.init_bus(BusInit::Fast)?;

        // StartCommunication goes out functionally addressed and must
        // follow the wake-up pulse immediately, no P3 quiet period
        let mut msg = DiagMessage::new(self.source, self.target, &[START_COMMUNICATION]);
        msg.flags |= MsgFlags::FUNC_ADDR;
        let buf = self.encode(state, &msg)?;
        log::trace!("KWP2000 tx {buf:02X?}");
        send_spaced(dev, &buf, state.timing.p4min)?;

        let mut msgs = self.recv(dev, state, state.timing.p2max * 4)?;
        if msgs.is_empty() {
            return Err(DiagError::Timeout);
        }
        let resp = msgs.remove(0);
        if resp.data.first() != Some(&(START_COMMUNICATION | POSITIVE_RESPONSE)) || resp.data.len() < 3 {
            log::warn!("StartCommunication answered {:02X?}", resp.data);
            return Err(DiagError::BadData);
        }
        state.kb1 = resp.data[1];
        state.kb2 = resp.data[2];
        // Anything decoded past the init response belongs to the caller
        self.pending = msgs;
        log::debug!(
            "KWP2000 bus up (fast init), key bytes 0x{:02X} 0x{:02X}",
            state.kb1,
            state.kb2
        );
        Ok(())
    }

    /// Frames and transmits one request after the P3 quiet period
    pub(crate) fn send(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        msg: &DiagMessage,
    ) -> DiagResult<()> {
        let buf = self.encode(state, msg)?;
        millisleep(state.timing.p3min);
        log::trace!("KWP2000 tx {buf:02X?}");
        send_spaced(dev, &buf, state.timing.p4min)
    }

    /// Builds header, payload and checksum of one frame
    fn encode(&self, state: &ConnState, msg: &DiagMessage) -> DiagResult<Vec<u8>> {
        if msg.data.is_empty() || msg.data.len() > LONG_LEN_MAX {
            return Err(DiagError::BadLength);
        }

        let fmt_base = if msg.flags.contains(MsgFlags::FUNC_ADDR) {
            0xC0
        } else {
            0x80
        };
        let mut buf = Vec::with_capacity(msg.data.len() + 5);
        if msg.data.len() <= SHORT_LEN_MAX {
            buf.push(fmt_base | msg.data.len() as u8);
            buf.push(msg.dest);
            buf.push(msg.src);
        } else {
            // Length moves to an additional header byte
            buf.push(fmt_base);
            buf.push(msg.dest);
            buf.push(msg.src);
            buf.push(msg.data.len() as u8);
        }
        buf.extend_from_slice(&msg.data);
        if !state.l0_flags.contains(L0Flags::DOES_L2_CKSUM) {
            buf.push(checksum(&buf));
        }
        Ok(buf)
    }

    /// Receives and decodes every frame pending on the bus. The header
    /// length encoding gives exact frame boundaries, so back to back
    /// responses are walked without heuristics
    pub(crate) fn recv(
        &mut self,
        dev: &mut dyn L0Device,
        state: &ConnState,
        timeout_ms: u64,
    ) -> DiagResult<Vec<DiagMessage>> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        let buf = int_recv(dev, state, timeout_ms)?;
        log::trace!("KWP2000 rx {buf:02X?}");

        let stripped = state.l0_flags.contains(L0Flags::STRIPS_L2_CKSUM);
        let mut msgs = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let rest = &buf[offset..];
            let hdr = match decode_header(rest, self.first_frame) {
                Ok(hdr) => hdr,
                Err(DiagError::IncompleteData) if !msgs.is_empty() => {
                    // A trailing partial frame after complete ones, the
                    // bytes are lost with this read
                    log::warn!("KWP2000 dropping {} trailing bytes", rest.len());
                    break;
                }
                Err(e) => return Err(e),
            };
            let frame_len = hdr.hdr_len + hdr.data_len + usize::from(!stripped);
            if rest.len() < frame_len {
                return Err(DiagError::IncompleteData);
            }
            if !stripped {
                let rcv = rest[frame_len - 1];
                let calc = checksum(&rest[..frame_len - 1]);
                if rcv != calc {
                    log::warn!("KWP2000 checksum 0x{rcv:02X}, expected 0x{calc:02X}");
                    return Err(DiagError::BadData);
                }
            }
            let mut flags = MsgFlags::FRAMED | MsgFlags::DATA_ONLY | MsgFlags::CHECKSUMMED;
            if hdr.functional {
                flags |= MsgFlags::FUNC_ADDR;
            }
            msgs.push(DiagMessage::received(
                hdr.src,
                hdr.dest,
                rest[hdr.hdr_len..hdr.hdr_len + hdr.data_len].to_vec(),
                flags,
            ));
            self.first_frame = false;
            offset += frame_len;
        }
        Ok(msgs)
    }

    /// TesterPresent, sent when the link has been idle too long. The
    /// response is read and discarded, failures here are not fatal
    pub(crate) fn keepalive(&mut self, dev: &mut dyn L0Device, state: &ConnState) -> DiagResult<()> {
        log::trace!("KWP2000 TesterPresent keepalive");
        let msg = DiagMessage::new(self.source, self.target, &[TESTER_PRESENT]);
        self.send(dev, state, &msg)?;
        let _ = self.recv(dev, state, state.timing.p3min);
        Ok(())
    }

    /// StopCommunication, best effort. The session is torn down locally
    /// whether or not the ECU acknowledges
    pub(crate) fn stop_comms(&mut self, dev: &mut dyn L0Device, state: &ConnState) {
        let msg = DiagMessage::new(self.source, self.target, &[STOP_COMMUNICATION]);
        if self.send(dev, state, &msg).is_ok() {
            let _ = self.recv(dev, state, state.timing.p2max);
        }
    }
}

/// Decodes one KWP2000 header from the front of `data`.
///
/// The top two format bits select the addressing mode: 0x80 physical and
/// 0xC0 functional carry target and source bytes, 0x00 carries none and is
/// only legal mid-session. 0x40 is CARB mode, which this driver does not
/// speak. A zero length field means the length follows the header.
fn decode_header(data: &[u8], first_frame: bool) -> DiagResult<Header> {
    let fmt = data[0] & 0xC0;
    let dl = usize::from(data[0] & 0x3F);
    let hdr = match (fmt, dl) {
        (0x40, _) => return Err(DiagError::BadData),
        (0x80 | 0xC0, 0) => {
            if data.len() < 4 {
                return Err(DiagError::IncompleteData);
            }
            Header {
                hdr_len: 4,
                data_len: usize::from(data[3]),
                src: data[2],
                dest: data[1],
                functional: fmt == 0xC0,
            }
        }
        (0x80 | 0xC0, dl) => {
            if data.len() < 3 {
                return Err(DiagError::IncompleteData);
            }
            Header {
                hdr_len: 3,
                data_len: dl,
                src: data[2],
                dest: data[1],
                functional: fmt == 0xC0,
            }
        }
        (_, 0) => {
            if first_frame {
                return Err(DiagError::BadData);
            }
            if data.len() < 2 {
                return Err(DiagError::IncompleteData);
            }
            Header {
                hdr_len: 2,
                data_len: usize::from(data[1]),
                src: 0,
                dest: 0,
                functional: false,
            }
        }
        (_, dl) => {
            if first_frame {
                return Err(DiagError::BadData);
            }
            Header {
                hdr_len: 1,
                data_len: dl,
                src: 0,
                dest: 0,
                functional: false,
            }
        }
    };
    if hdr.data_len == 0 {
        // A zero payload mid-buffer means we joined mid-stream
        return Err(DiagError::BadData);
    }
    Ok(hdr)
}
