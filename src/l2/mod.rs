//! Module for the L2 protocol drivers and the connection manager that
//! multiplexes over them.
//!
//! Each driver owns its protocol-private state and implements the common
//! operation set (`start_comms`, `send`, `recv`, `request`, `stop_comms`).
//! The connection manager selects a driver by [ProtocolKind] and dispatches
//! to it through a closed sum type, so protocol state is never handled
//! through opaque pointers.

pub mod iso14230;
pub mod iso9141;
pub mod j1850;
pub mod raw;
pub mod vag;

use crate::hardware::{L0Device, L0Flags};
use crate::message::DiagMessage;
use crate::timing::{millisleep, Timing, BUS_CONTENTION_RETRY_CAP};
use crate::{DiagError, DiagResult};

/// The L2 protocol families supported by this stack
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum ProtocolKind {
    /// ISO 9141-2
    Iso9141,
    /// ISO 14230-2 (KWP2000)
    Iso14230,
    /// SAE J1850 VPW (GM)
    SaeJ1850Vpw,
    /// SAE J1850 PWM (Ford)
    SaeJ1850Pwm,
    /// No framing, pure byte tunnel
    Raw,
    /// VAG keyword 0x01 0x8A (handshake only)
    Vag,
}

bitflags::bitflags! {
    /// Properties an L2 driver declares about the messages it delivers.
    ///
    /// Together with the adapter's [L0Flags] these form the read-only
    /// capability set of a connection; the L3 layer uses them to decide
    /// which framing and keepalive work remains to be done above L2.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct L2Flags: u8 {
        /// Received messages are whole frames
        const FRAMED = 0x01;
        /// Received messages carry payload only (headers stripped)
        const DATA_ONLY = 0x02;
        /// The driver computes and verifies checksums
        const DOES_CKSUM = 0x04;
        /// The driver performs its own idle keepalive, L3 must not
        const KEEPALIVE = 0x08;
        /// `start_comms` succeeds without talking to an ECU
        const CONNECTS_ALWAYS = 0x10;
    }
}

/// How the bus is woken up when communication starts
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum InitMode {
    /// 5-baud address handshake with key byte exchange
    #[default]
    FiveBaud,
    /// ISO14230 fast initialisation
    Fast,
    /// No initialisation, listen-only on an already-live bus
    Monitor,
}

/// Parameters of one L2 session. Passed explicitly into `start_comms`;
/// there is no global configuration state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionConfig {
    /// Line speed in bps. 0 selects the protocol default
    pub bitrate: u32,
    /// Tester source address, conventionally 0xF1
    pub source: u8,
    /// Target ECU address, 0x33 for the J1979 application protocol
    pub target: u8,
    /// Bus wake-up mode
    #[cfg_attr(feature = "serde", serde(skip, default))]
    pub init: InitMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            bitrate: 0,
            source: 0xF1,
            target: 0x33,
            init: InitMode::FiveBaud,
        }
    }
}

/// Bounded resend policy applied when the adapter reports bus contention
/// (VPW/PWM arbitration loss)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of resend attempts before the error is surfaced
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: BUS_CONTENTION_RETRY_CAP,
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with an error other than
    /// [DiagError::BusError], or the attempt bound is exhausted. Before
    /// each retry, `resend` puts the request back on the bus. Both
    /// closures borrow the shared context `ctx` in turn
    pub(crate) fn run<C: ?Sized, T>(
        &self,
        ctx: &mut C,
        mut op: impl FnMut(&mut C) -> DiagResult<T>,
        mut resend: impl FnMut(&mut C) -> DiagResult<()>,
    ) -> DiagResult<T> {
        let mut attempts = 0;
        loop {
            match op(ctx) {
                Err(DiagError::BusError) if attempts < self.max_attempts => {
                    attempts += 1;
                    log::debug!("bus contention, resend attempt {attempts}");
                    millisleep(self.backoff_ms);
                    resend(ctx)?;
                }
                other => return other,
            }
        }
    }
}

/// Connection attributes shared between the manager and the active driver:
/// negotiated speed, key bytes and the timing parameter set
#[derive(Debug, Copy, Clone)]
pub(crate) struct ConnState {
    pub speed: u32,
    pub kb1: u8,
    pub kb2: u8,
    pub timing: Timing,
    pub l0_flags: L0Flags,
}

/// The closed set of protocol drivers
#[derive(Debug)]
enum Driver {
    Iso9141(iso9141::Iso9141),
    Iso14230(iso14230::Iso14230),
    J1850(j1850::J1850),
    Raw(raw::Raw),
    Vag(vag::Vag),
}

/// One active L2 session with one ECU or bus.
///
/// Owns the adapter and the protocol-private driver state; both are
/// released exactly once when the connection is stopped or dropped.
#[derive(Debug)]
pub struct L2Connection {
    device: Box<dyn L0Device>,
    kind: ProtocolKind,
    state: ConnState,
    l2_flags: L2Flags,
    driver: Driver,
}

impl L2Connection {
    /// Establishes communication using the driver selected by `kind`.
    ///
    /// Performs the protocol's bus initialisation; a failure at any
    /// handshake step is returned as-is and the whole `start_comms` must
    /// be repeated, there is no partial-success state to resume from.
    pub fn start_comms(
        mut device: Box<dyn L0Device>,
        kind: ProtocolKind,
        cfg: &ConnectionConfig,
    ) -> DiagResult<Self> {
        let mut state = ConnState {
            speed: cfg.bitrate,
            kb1: 0,
            kb2: 0,
            timing: match kind {
                ProtocolKind::SaeJ1850Vpw | ProtocolKind::SaeJ1850Pwm => Timing::j1850(),
                ProtocolKind::Iso14230 => Timing::iso14230(),
                _ => Timing::iso9141(),
            },
            l0_flags: device.flags(),
        };
        log::debug!("start_comms {kind} cfg {cfg:02X?}");
        let (driver, l2_flags) = match kind {
            ProtocolKind::Iso9141 => (
                Driver::Iso9141(iso9141::Iso9141::start_comms(&mut *device, &mut state, cfg)?),
                iso9141::L2_FLAGS,
            ),
            ProtocolKind::Iso14230 => (
                Driver::Iso14230(iso14230::Iso14230::start_comms(
                    &mut *device,
                    &mut state,
                    cfg,
                )?),
                iso14230::L2_FLAGS,
            ),
            ProtocolKind::SaeJ1850Vpw | ProtocolKind::SaeJ1850Pwm => (
                Driver::J1850(j1850::J1850::start_comms(
                    &mut *device,
                    &mut state,
                    cfg,
                    kind == ProtocolKind::SaeJ1850Pwm,
                )?),
                j1850::L2_FLAGS,
            ),
            ProtocolKind::Raw => (
                Driver::Raw(raw::Raw::start_comms(&mut *device, &mut state, cfg)?),
                L2Flags::empty(),
            ),
            ProtocolKind::Vag => (
                Driver::Vag(vag::Vag::start_comms(&mut *device, &mut state, cfg)?),
                vag::L2_FLAGS,
            ),
        };
        Ok(Self {
            device,
            kind,
            state,
            l2_flags,
            driver,
        })
    }

    /// Frames and transmits one message
    pub fn send(&mut self, msg: &DiagMessage) -> DiagResult<()> {
        let dev = self.device.as_mut();
        match &mut self.driver {
            Driver::Iso9141(d) => d.send(dev, &self.state, msg),
            Driver::Iso14230(d) => d.send(dev, &self.state, msg),
            Driver::J1850(d) => d.send(dev, &self.state, msg),
            Driver::Raw(d) => d.send(dev, &self.state, msg),
            Driver::Vag(d) => d.send(dev, &self.state, msg),
        }
    }

    /// Receives all pending responses, invoking `callback` for each
    /// decoded message in arrival order. Returns [DiagError::Timeout] if
    /// nothing arrived within `timeout_ms`
    pub fn recv(
        &mut self,
        timeout_ms: u64,
        mut callback: impl FnMut(&DiagMessage),
    ) -> DiagResult<()> {
        let msgs = self.recv_msgs(timeout_ms)?;
        for m in &msgs {
            callback(m);
        }
        Ok(())
    }

    /// Receives all pending responses as an owned list in arrival order
    pub fn recv_msgs(&mut self, timeout_ms: u64) -> DiagResult<Vec<DiagMessage>> {
        let dev = self.device.as_mut();
        match &mut self.driver {
            Driver::Iso9141(d) => d.recv(dev, &self.state, timeout_ms),
            Driver::Iso14230(d) => d.recv(dev, &self.state, timeout_ms),
            Driver::J1850(d) => d.recv(dev, &self.state, timeout_ms),
            Driver::Raw(d) => d.recv(dev, &self.state, timeout_ms),
            Driver::Vag(d) => d.recv(dev, &self.state, timeout_ms),
        }
    }

    /// Sends `msg` and waits for the response set. The original error of
    /// either phase is propagated, never masked by a generic timeout
    pub fn request(&mut self, msg: &DiagMessage) -> DiagResult<Vec<DiagMessage>> {
        self.send(msg)?;
        self.recv_msgs(self.state.timing.p3max.min(1000))
    }

    /// Sends the driver's idle keepalive if the protocol has one
    pub fn keepalive(&mut self) -> DiagResult<()> {
        let dev = self.device.as_mut();
        match &mut self.driver {
            Driver::Iso14230(d) => d.keepalive(dev, &self.state),
            _ => Ok(()),
        }
    }

    /// Terminates the session, releasing the protocol state and the
    /// adapter. ISO14230 sends StopCommunication first, best effort
    pub fn stop_comms(mut self) -> DiagResult<()> {
        let dev = self.device.as_mut();
        if let Driver::Iso14230(d) = &mut self.driver {
            d.stop_comms(dev, &self.state);
        }
        Ok(())
    }

    /// The protocol family this connection speaks
    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// Negotiated line speed in bps
    pub fn speed(&self) -> u32 {
        self.state.speed
    }

    /// Key bytes returned by the ECU during initialisation, (0, 0) for
    /// protocols without a key byte exchange
    pub fn key_bytes(&self) -> (u8, u8) {
        (self.state.kb1, self.state.kb2)
    }

    /// Timing parameter set in force for this connection
    pub fn timing(&self) -> Timing {
        self.state.timing
    }

    /// Properties of the active driver
    pub fn l2_flags(&self) -> L2Flags {
        self.l2_flags
    }

    /// Capabilities of the underlying adapter
    pub fn l0_flags(&self) -> L0Flags {
        self.state.l0_flags
    }
}

/// Reads exactly one byte from the adapter within `timeout_ms`
pub(crate) fn read_byte(dev: &mut dyn L0Device, timeout_ms: u64) -> DiagResult<u8> {
    let buf = dev.recv(1, timeout_ms)?;
    buf.first().copied().ok_or(DiagError::Timeout)
}

/// Writes `buf` honouring the P4 inter-byte spacing: passive adapters get
/// the bytes one at a time with `p4min` gaps, adapters that pace
/// themselves (or a zero p4) get the whole buffer at once
pub(crate) fn send_spaced(dev: &mut dyn L0Device, buf: &[u8], p4min: u64) -> DiagResult<()> {
    if p4min == 0 || dev.flags().contains(L0Flags::DOES_P4_WAIT) {
        return dev.send(buf);
    }
    for (i, b) in buf.iter().enumerate() {
        if i > 0 {
            millisleep(p4min);
        }
        dev.send(std::slice::from_ref(b))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn protocol_kind_parses_from_name() {
        assert_eq!(ProtocolKind::from_str("Iso9141"), Ok(ProtocolKind::Iso9141));
        assert_eq!(
            ProtocolKind::from_str("SaeJ1850Vpw"),
            Ok(ProtocolKind::SaeJ1850Vpw)
        );
        assert!(ProtocolKind::from_str("Iso15765").is_err());
    }

    #[test]
    fn connection_debug_names_the_protocol() {
        let dev = crate::hardware::simulation::SimulationDevice::new(L0Flags::empty());
        let conn = L2Connection::start_comms(
            Box::new(dev),
            ProtocolKind::Raw,
            &ConnectionConfig::default(),
        )
        .unwrap();
        assert!(format!("{conn:?}").contains("Raw"));
    }

    #[test]
    fn retry_policy_gives_up_on_other_errors() {
        let policy = RetryPolicy::default();
        let mut calls = 0u32;
        let result: DiagResult<()> = policy.run(
            &mut calls,
            |calls| {
                *calls += 1;
                Err(DiagError::Timeout)
            },
            |_| Ok(()),
        );
        assert!(matches!(result, Err(DiagError::Timeout)));
        assert_eq!(calls, 1);
    }
}
