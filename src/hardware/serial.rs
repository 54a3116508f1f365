//! Generic "dumb" serial K-line adapter.
//!
//! Drives a plain UART-to-K-line level shifter with no intelligence of its
//! own: bus initialisation is bit-banged on the TX line using break
//! conditions, and all framing, checksumming and P4 pacing is left to the
//! L2 drivers (the capability flag set is empty).

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::timing::{millisleep, W1MAX, W5MIN};
use crate::{DiagError, DiagResult};

use super::{BusInit, L0Device, L0Flags, SerialSettings};

/// Bit time of the 5 baud address transmission
const FIVE_BAUD_BIT_MS: u64 = 200;
/// Low / high pulse width of the ISO14230 fast init wake-up
const FAST_INIT_PULSE_MS: u64 = 25;
/// Synch pattern the ECU answers the 5-baud address with
const SYNCH_PATTERN: u8 = 0x55;

/// A passive serial K-line interface
pub struct KLineDevice {
    port: Box<dyn SerialPort>,
}

impl std::fmt::Debug for KLineDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KLineDevice {}", self.port.name().unwrap_or_default())
    }
}

impl KLineDevice {
    /// Opens the serial port `name` with the given line settings
    pub fn open(name: &str, settings: &SerialSettings) -> DiagResult<Self> {
        let port = serialport::new(name, settings.speed)
            .data_bits(to_data_bits(settings.databits))
            .stop_bits(to_stop_bits(settings.stopbits))
            .parity(if settings.parity {
                Parity::Odd
            } else {
                Parity::None
            })
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io_err)?;
        Ok(Self { port })
    }

    /// Bit-bangs `addr` onto the TX line at 5 baud, LSB first, 8N1.
    /// A break condition pulls the line low (dominant).
    fn five_baud_address(&mut self, addr: u8) -> DiagResult<()> {
        log::debug!("5-baud init, address 0x{addr:02X?}");
        // Start bit
        self.port.set_break().map_err(io_err)?;
        millisleep(FIVE_BAUD_BIT_MS);
        for bit in 0..8 {
            if addr & (1 << bit) != 0 {
                self.port.clear_break().map_err(io_err)?;
            } else {
                self.port.set_break().map_err(io_err)?;
            }
            millisleep(FIVE_BAUD_BIT_MS);
        }
        // Stop bit, line back to idle
        self.port.clear_break().map_err(io_err)?;
        millisleep(FIVE_BAUD_BIT_MS);
        Ok(())
    }
}

impl L0Device for KLineDevice {
    fn send(&mut self, data: &[u8]) -> DiagResult<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv(&mut self, max_len: usize, timeout_ms: u64) -> DiagResult<Vec<u8>> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms.max(1)))
            .map_err(io_err)?;
        let mut buf = vec![0u8; max_len];
        match self.port.read(&mut buf) {
            Ok(0) => Err(DiagError::Timeout),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn init_bus(&mut self, init: BusInit) -> DiagResult<()> {
        match init {
            BusInit::FiveBaud { addr } => {
                self.five_baud_address(addr)?;
                // The bit-bang echoes as garbage on RX, drop it before
                // looking for the synch pattern
                self.flush_input()?;
                let sync = self.recv(1, W1MAX)?;
                if sync.first() != Some(&SYNCH_PATTERN) {
                    log::warn!("5-baud init synch pattern was {sync:02X?}");
                    return Err(DiagError::BadData);
                }
                Ok(())
            }
            BusInit::Fast => {
                // TiniL = TiniH = 25 ms
                self.port.set_break().map_err(io_err)?;
                millisleep(FAST_INIT_PULSE_MS);
                self.port.clear_break().map_err(io_err)?;
                millisleep(FAST_INIT_PULSE_MS);
                self.flush_input()
            }
        }
    }

    fn set_speed(&mut self, settings: &SerialSettings) -> DiagResult<()> {
        self.port.set_baud_rate(settings.speed).map_err(io_err)?;
        self.port
            .set_data_bits(to_data_bits(settings.databits))
            .map_err(io_err)?;
        self.port
            .set_stop_bits(to_stop_bits(settings.stopbits))
            .map_err(io_err)?;
        self.port
            .set_parity(if settings.parity {
                Parity::Odd
            } else {
                Parity::None
            })
            .map_err(io_err)?;
        // Give the UART a moment to settle before traffic resumes
        millisleep(W5MIN.min(50));
        Ok(())
    }

    fn flush_input(&mut self) -> DiagResult<()> {
        self.port.clear(ClearBuffer::Input).map_err(io_err)?;
        Ok(())
    }

    fn flags(&self) -> L0Flags {
        // Passive interface: everything is done in software here
        L0Flags::SLOW | L0Flags::FAST
    }
}

fn to_data_bits(bits: u8) -> DataBits {
    match bits {
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn to_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

fn io_err(e: serialport::Error) -> DiagError {
    std::io::Error::from(e).into()
}
