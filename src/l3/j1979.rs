//! SAE J1979 (OBD-II) session layer.
//!
//! Sits on top of an [L2Connection] and handles what L2 cannot: inferring
//! frame boundaries from the J1979 mode and PID bytes when the underlying
//! link delivers an unframed byte stream, reassembling trickled-in
//! responses, and keeping the ECU's session alive during idle periods.
//!
//! Frame boundary inference matters because several L2 configurations
//! (raw passthrough in particular) hand up byte runs that may split or
//! merge messages arbitrarily. The J1979 payload itself carries no length
//! field; the expected length follows from the mode/PID lookup tables in
//! the standard, reproduced here exactly.

use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Instant;

use crate::dtc;
use crate::hardware::L0Flags;
use crate::l2::{iso9141, L2Connection, L2Flags};
use crate::message::{DiagMessage, MsgFlags};
use crate::timing::J1979_KEEPALIVE_MS;
use crate::{DiagError, DiagResult};

/// Default tester address per SAE J1979
pub const TESTER_ADDR: u8 = 0xF1;
/// Functional target address of the OBD-II application protocol
pub const OBD_FUNC_ADDR: u8 = 0x33;

/// Grace period granted for trailing bytes once a read came up short
const DRAIN_TIMEOUT_MS: u64 = 5;
/// How long the keepalive waits for the response it throws away
const KEEPALIVE_RECV_MS: u64 = 50;

/// Fixed request frame lengths for modes 1 to 9, header and checksum
/// included. Index 0 is unused
const REQUEST_LENGTHS: [usize; 10] = [0, 6, 7, 5, 5, 6, 6, 5, 11, 6];

/// Expected total frame length (3 header bytes, payload, checksum byte)
/// of the J1979 message starting at `buf[0]`.
///
/// Requests have fixed lengths per mode. Responses vary by mode and, for
/// modes 0x41/0x42/0x45/0x49, by the PID or TID in the fifth byte.
/// Returns [DiagError::IncompleteData] while fewer than 5 bytes are
/// buffered and [DiagError::BadData] for invalid mode/PID combinations;
/// callers treat the two differently (wait versus discard).
pub fn expected_length(buf: &[u8]) -> DiagResult<usize> {
    if buf.len() < 5 {
        return Err(DiagError::IncompleteData);
    }
    let mode = buf[3];
    let pid = buf[4];

    if mode > 0x49 {
        return Err(DiagError::BadData);
    }
    if mode < 0x41 {
        return if (1..=9).contains(&mode) {
            Ok(REQUEST_LENGTHS[usize::from(mode)])
        } else {
            Err(DiagError::BadData)
        };
    }

    let len = match mode {
        0x41 | 0x42 => match pid {
            // PID 0x00/0x20: supported-PID bitmap
            p if p & 0x1F == 0 => 10,
            // Status since DTC clear, mode 1 only
            0x01 if mode == 0x41 => 10,
            // Freeze frame DTC, mode 2 only
            0x02 if mode == 0x42 => 8,
            0x01 | 0x02 => return Err(DiagError::BadData),
            0x03 => 8,
            0x04..=0x0B => 7,
            0x0C => 8,
            0x0D..=0x0F => 7,
            0x10 => 8,
            0x11..=0x13 => 7,
            0x14..=0x1B => 8,
            0x1C..=0x1E => 7,
            0x1F => 8,
            // J2190 extended PIDs not handled
            _ => return Err(DiagError::BadData),
        },
        0x43 => 11,
        0x44 => 5,
        0x45 => match pid {
            t if t & 0x1F == 0 => 11,
            t if t < 4 => 8,
            _ => 10,
        },
        0x46..=0x48 => 11,
        // Vehicle information: even infotypes carry 7 data bytes
        0x49 => {
            if pid % 2 == 0 {
                11
            } else {
                7
            }
        }
        _ => return Err(DiagError::BadData),
    };
    Ok(len)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecvState {
    /// Zero timeout poll for bytes already buffered on the link
    Probe,
    /// Full user timeout
    Wait,
    /// Short grace period for trailing bytes
    Drain,
}

/// One J1979 session over an existing L2 connection.
///
/// The session borrows the [L2Connection] per call and never owns its
/// lifetime; dropping the session leaves the link open.
#[derive(Debug)]
pub struct J1979Session {
    source: u8,
    rxbuf: Vec<u8>,
    pending: VecDeque<DiagMessage>,
    last_activity: Instant,
}

impl J1979Session {
    /// Opens a session for the tester address `source` (0xF1 by custom)
    pub fn new(source: u8) -> Self {
        Self {
            source,
            rxbuf: Vec::new(),
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Sends one J1979 payload, wrapping it in an ISO9141-style header
    /// and checksum when the L2 driver delivers raw bytes
    pub fn send(&mut self, l2: &mut L2Connection, msg: &DiagMessage) -> DiagResult<()> {
        if msg.data.is_empty() {
            return Err(DiagError::BadLength);
        }
        self.last_activity = Instant::now();

        if l2.l2_flags().contains(L2Flags::DATA_ONLY) {
            // L2 frames and addresses for us
            return l2.send(msg);
        }

        let mut buf = Vec::with_capacity(msg.data.len() + 4);
        if msg.data[0] >= 0x40 {
            // Response header
            buf.extend_from_slice(&[0x48, 0x6B]);
        } else {
            buf.extend_from_slice(&[0x68, 0x6A]);
        }
        buf.push(msg.src);
        buf.extend_from_slice(&msg.data);
        if !l2.l2_flags().contains(L2Flags::DOES_CKSUM)
            && !l2.l0_flags().contains(L0Flags::DOES_L2_CKSUM)
        {
            buf.push(iso9141::checksum(&buf));
        }
        l2.send(&DiagMessage::new(msg.src, msg.dest, &buf))
    }

    /// Receives one J1979 message.
    ///
    /// Over a framing L2 the call is a passthrough that strips whatever
    /// headers remain. Over a byte stream it runs a tiered timeout
    /// machine: a zero-timeout probe for bytes already on the link, the
    /// full user timeout, then a short drain for trailing bytes, with the
    /// reassembly loop run after every read.
    ///
    /// A returned message with an empty payload signals a framing loss:
    /// the buffered bytes did not form a valid J1979 message
    pub fn recv(&mut self, l2: &mut L2Connection, timeout_ms: u64) -> DiagResult<DiagMessage> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }

        if l2.l2_flags().contains(L2Flags::FRAMED) {
            self.recv_framed(l2, timeout_ms)
        } else {
            self.recv_bytes(l2, timeout_ms)
        }
    }

    /// Sends `msg` and waits for the matching response
    pub fn request(
        &mut self,
        l2: &mut L2Connection,
        msg: &DiagMessage,
        timeout_ms: u64,
    ) -> DiagResult<DiagMessage> {
        self.send(l2, msg)?;
        self.recv(l2, timeout_ms)
    }

    /// Holds the ECU session open: when the link has been idle past the
    /// J1979 limit and the L2 driver has no keepalive of its own, a
    /// Mode 1 PID 0 request goes out and its response is discarded
    pub fn keepalive(&mut self, l2: &mut L2Connection) -> DiagResult<()> {
        if self.last_activity.elapsed().as_millis() < u128::from(J1979_KEEPALIVE_MS) {
            return Ok(());
        }
        if l2.l2_flags().contains(L2Flags::KEEPALIVE) {
            return Ok(());
        }
        log::debug!("J1979 keepalive, link idle");
        let msg = DiagMessage::new(self.source, OBD_FUNC_ADDR, &[0x01, 0x00]);
        self.send(l2, &msg)?;
        // The answer only exists to reset the ECU's idle timer
        match self.recv(l2, KEEPALIVE_RECV_MS) {
            Ok(_) | Err(DiagError::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn recv_framed(&mut self, l2: &mut L2Connection, timeout_ms: u64) -> DiagResult<DiagMessage> {
        let msgs = l2.recv_msgs(timeout_ms)?;
        self.last_activity = Instant::now();
        for mut msg in msgs {
            if !msg.flags.contains(MsgFlags::DATA_ONLY) && msg.data.len() >= 4 {
                // L3 header and checksum still attached
                msg.dest = msg.data[1];
                msg.src = msg.data[2];
                msg.data.drain(..3);
                msg.data.pop();
                msg.flags |= MsgFlags::DATA_ONLY;
            }
            self.pending.push_back(msg);
        }
        self.pending.pop_front().ok_or(DiagError::Timeout)
    }

    fn recv_bytes(&mut self, l2: &mut L2Connection, timeout_ms: u64) -> DiagResult<DiagMessage> {
        let mut state = RecvState::Probe;
        loop {
            let tout = match state {
                RecvState::Probe => 0,
                RecvState::Wait => timeout_ms,
                RecvState::Drain => DRAIN_TIMEOUT_MS,
            };
            match l2.recv_msgs(tout) {
                Ok(msgs) => {
                    self.last_activity = Instant::now();
                    for msg in msgs {
                        self.rxbuf.extend_from_slice(&msg.data);
                    }
                }
                Err(DiagError::Timeout) => match state {
                    RecvState::Drain => break,
                    RecvState::Probe if self.pending.is_empty() && self.rxbuf.is_empty() => {
                        state = RecvState::Wait;
                        continue;
                    }
                    _ => {}
                },
                Err(e) => return Err(e),
            }

            self.process_data();
            if let Some(msg) = self.pending.pop_front() {
                return Ok(msg);
            }
            // Drain keeps reading until its window closes quiet
            state = match state {
                RecvState::Probe => RecvState::Wait,
                RecvState::Wait | RecvState::Drain => RecvState::Drain,
            };
        }
        self.pending.pop_front().ok_or(DiagError::Timeout)
    }

    /// The reassembly loop: slice complete messages off the front of the
    /// buffer until it runs dry or holds only a partial frame. A length
    /// inference failure appends a zero-length error message and aborts
    /// the loop; the stale bytes stay buffered for the next call.
    fn process_data(&mut self) {
        while !self.rxbuf.is_empty() {
            match expected_length(&self.rxbuf) {
                Ok(len) if len <= self.rxbuf.len() => {
                    let frame: Vec<u8> = self.rxbuf.drain(..len).collect();
                    self.pending.push_back(DiagMessage::received(
                        frame[2],
                        frame[1],
                        frame[3..len - 1].to_vec(),
                        MsgFlags::FRAMED | MsgFlags::DATA_ONLY | MsgFlags::FUNC_ADDR,
                    ));
                }
                // Partial frame, wait for the rest
                Ok(_) | Err(DiagError::IncompleteData) => return,
                Err(_) => {
                    log::warn!(
                        "J1979 framing lost, {} stale bytes {:02X?}",
                        self.rxbuf.len(),
                        self.rxbuf
                    );
                    self.pending.push_back(DiagMessage::received(
                        0,
                        0,
                        Vec::new(),
                        MsgFlags::empty(),
                    ));
                    return;
                }
            }
        }
    }
}

/// Renders a J1979 payload human readable: service names, PIDs/TIDs and
/// decoded trouble codes. No scaling of the data bytes
pub fn decode_message(data: &[u8]) -> String {
    let mut out = String::new();
    if data.is_empty() {
        return "J1979 framing error".into();
    }
    if data[0] & 0x40 != 0 {
        out.push_str("J1979 response ");
    } else {
        out.push_str("J1979 request ");
    }

    let hex_tail = |out: &mut String, bytes: &[u8]| {
        for b in bytes {
            let _ = write!(out, "0x{b:02X} ");
        }
    };

    // Services whose rendering reads a PID/TID (and frame/sensor) byte
    let needed = match data[0] {
        0x02 | 0x42 | 0x05 | 0x45 => 3,
        0x03 | 0x04 | 0x43 | 0x44 | 0x47 => 1,
        _ => 2,
    };
    if data.len() < needed {
        let _ = write!(out, "truncated: ");
        hex_tail(&mut out, data);
        return out.trim_end().to_string();
    }

    match data[0] {
        0x01 => {
            let _ = write!(out, "Mode 1 PID 0x{:02X}", data[1]);
        }
        0x41 => {
            let _ = write!(out, "Mode 1 Data: PID 0x{:02X} ", data[1]);
            hex_tail(&mut out, &data[2..]);
        }
        0x02 => {
            let _ = write!(out, "Mode 2 PID 0x{:02X} Frame 0x{:02X}", data[1], data[2]);
        }
        0x42 => {
            let _ = write!(
                out,
                "Mode 2 FreezeFrame Data: PID 0x{:02X} Frame 0x{:02X} ",
                data[1], data[2]
            );
            hex_tail(&mut out, &data[3..]);
        }
        0x03 => out.push_str("Mode 3 (Powertrain DTCs)"),
        0x07 => out.push_str("Request Non-Continuous Monitor System Test Results"),
        0x43 | 0x47 => {
            if data[0] == 0x47 {
                out.push_str("Non-Continuous Monitor System ");
            }
            out.push_str("DTCs: ");
            for pair in data[1..].chunks_exact(2) {
                if pair[0] == 0 && pair[1] == 0 {
                    continue;
                }
                let _ = write!(out, "{}  ", dtc::decode_j2012(pair[0], pair[1]));
            }
        }
        0x04 => out.push_str("Clear DTCs"),
        0x44 => out.push_str("DTCs cleared"),
        0x05 => {
            let _ = write!(
                out,
                "Oxygen Sensor Test ID 0x{:02X} Sensor 0x{:02X}",
                data[1], data[2]
            );
        }
        0x45 => {
            let _ = write!(
                out,
                "Oxygen Sensor TID 0x{:02X} Sensor 0x{:02X} ",
                data[1], data[2]
            );
            hex_tail(&mut out, &data[3..]);
        }
        0x06 => {
            let _ = write!(out, "Onboard monitoring test request TID 0x{:02X}", data[1]);
        }
        0x46 => {
            let _ = write!(out, "Onboard monitoring test result TID 0x{:02X} ", data[1]);
            hex_tail(&mut out, &data[2..]);
        }
        0x08 => {
            let _ = write!(out, "Request control of onboard system TID 0x{:02X}", data[1]);
        }
        0x48 => {
            let _ = write!(
                out,
                "Control of onboard system response TID 0x{:02X} ",
                data[1]
            );
            hex_tail(&mut out, &data[2..]);
        }
        0x09 => {
            let _ = write!(out, "Request vehicle information infotype 0x{:02X}", data[1]);
        }
        0x49 => {
            let _ = write!(out, "Vehicle information infotype 0x{:02X} ", data[1]);
            hex_tail(&mut out, &data[2..]);
        }
        other => {
            let _ = write!(out, "UnknownType 0x{other:02X}: Data Dump: ");
            hex_tail(&mut out, data);
        }
    }
    out.trim_end().to_string()
}
