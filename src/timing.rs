//! Module for the protocol mandated timing windows.
//!
//! All values are milliseconds and come straight out of the ISO9141-2,
//! ISO14230-2 and SAE J1979 specifications. They are load bearing: the
//! receive state machines use them to find frame boundaries, so they must
//! not be re-derived or tuned.

use std::time::Duration;

/// W1: max time from end of address byte to start of synch pattern
pub const W1MAX: u64 = 300;
/// W2: max time from end of synch pattern to key byte 1
pub const W2MAX: u64 = 20;
/// W3: max time between key byte 1 and key byte 2
pub const W3MAX: u64 = 20;
/// W4: min time before the tester sends the inverted key byte 2
pub const W4MIN: u64 = 25;
/// W4: max time for the ECU's inverted address echo
pub const W4MAX: u64 = 50;
/// W5: min bus idle time before starting an initialisation sequence
pub const W5MIN: u64 = 300;

/// Extra timeout granted to adapters which buffer whole frames or perform
/// the P4 wait themselves
pub const SMART_TIMEOUT_MS: u64 = 100;

/// J1979 requires a message at least every 5 s to hold the session open;
/// we keep alive well before that
pub const J1979_KEEPALIVE_MS: u64 = 3500;

/// Bound on resend attempts after a VPW/PWM bus collision
pub const BUS_CONTENTION_RETRY_CAP: u32 = 30;

/// Inter-byte, inter-frame and inter-message timing parameters of one L2
/// connection. Defaults are per protocol; ISO9141/14230 refine `p2min`
/// from the negotiated key bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Max inter-byte gap inside a frame (ECU side)
    pub p1max: u64,
    /// Min time between end of request and start of response
    pub p2min: u64,
    /// Max time between end of request and start of response
    pub p2max: u64,
    /// Min time between end of all responses and a new request
    pub p3min: u64,
    /// Max idle time before the session is considered lost
    pub p3max: u64,
    /// Min inter-byte gap when the tester transmits
    pub p4min: u64,
}

impl Timing {
    /// ISO9141-2 default timing set
    pub const fn iso9141() -> Self {
        Self {
            p1max: 20,
            p2min: 25,
            p2max: 50,
            p3min: 55,
            p3max: 5000,
            p4min: 5,
        }
    }

    /// ISO14230-2 default timing set
    pub const fn iso14230() -> Self {
        Self {
            p1max: 20,
            p2min: 25,
            p2max: 50,
            p3min: 55,
            p3max: 5000,
            p4min: 5,
        }
    }

    /// SAE J1850 timing set. The bus arbitration is handled by the
    /// adapter, only the inter-request gap matters here
    pub const fn j1850() -> Self {
        Self {
            p1max: 20,
            p2min: 0,
            p2max: 100,
            p3min: 50,
            p3max: 5000,
            p4min: 0,
        }
    }
}

/// Blocking millisecond sleep, the only suspension primitive used by the
/// stack besides timeout-bounded reads. Not cancellable mid-wait; callers
/// needing cancellation must run the connection on its own thread.
pub fn millisleep(ms: u64) {
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
