//! Ethernet controller on a Linux `spidev` device.
//!
//! The W5500 sits on `/dev/spidevB.C` (mode 0, 8-bit words). Its reset pin
//! is a line on a GPIO character device, driven active low.
//!
//! # Requirements
//!
//! - The SPI controller must be enabled (e.g. `dtparam=spi=on` on a Pi)
//! - The user needs read/write access to the spidev and gpiochip nodes

use std::path::Path;

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use crate::bus::{Data, SpiTransport};
use crate::error::BusError;

const CONSUMER: &str = "hue-adapter-w5500-rst";

/// A spidev device plus the controller's reset line.
pub struct LinuxSpi {
    spi: Spidev,
    reset: LineHandle,
}

impl LinuxSpi {
    /// Opens and configures `device` at `baudrate`, and claims `reset_line`
    /// on `gpio_chip` as an output with the controller out of reset.
    pub fn open(device: &Path, baudrate: u32, gpio_chip: &Path, reset_line: u32) -> Result<Self, BusError> {
        let open_error = |path: &Path, reason: String| BusError::Open {
            device: path.display().to_string(),
            reason,
        };

        let mut spi = Spidev::open(device).map_err(|e| open_error(device, e.to_string()))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(baudrate)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        spi.configure(&options)
            .map_err(|e| open_error(device, e.to_string()))?;

        let mut chip = Chip::new(gpio_chip).map_err(|e| open_error(gpio_chip, e.to_string()))?;
        let reset = chip
            .get_line(reset_line)
            .and_then(|line| line.request(LineRequestFlags::OUTPUT, 1, CONSUMER))
            .map_err(|e| open_error(gpio_chip, format!("line {reset_line}: {e}")))?;

        Ok(Self { spi, reset })
    }
}

/// Bytes clocked out for one transfer. Reads clock out zeros after the
/// header while the controller answers.
fn outgoing(header: &[u8], data: &Data<'_>) -> Vec<u8> {
    let mut tx = header.to_vec();
    match data {
        Data::Write(bytes) => tx.extend_from_slice(bytes),
        Data::Read(buf) => tx.resize(header.len() + buf.len(), 0),
    }
    tx
}

impl SpiTransport for LinuxSpi {
    fn transfer(&mut self, header: &[u8], data: Data<'_>) -> Result<(), BusError> {
        let tx = outgoing(header, &data);
        let mut rx = vec![0u8; tx.len()];
        {
            let mut transfer = SpidevTransfer::read_write(&tx, &mut rx);
            self.spi
                .transfer(&mut transfer)
                .map_err(|e| BusError::Transfer(e.to_string()))?;
        }
        if let Data::Read(buf) = data {
            buf.copy_from_slice(&rx[header.len()..]);
        }
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), BusError> {
        self.reset
            .set_value(u8::from(!asserted))
            .map_err(|e| BusError::Transfer(format!("reset line: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_frames_header_then_payload() {
        let tx = outgoing(&[0x00, 0x39, 0x04], &Data::Write(&[0xAA, 0xBB]));
        assert_eq!(tx, vec![0x00, 0x39, 0x04, 0xAA, 0xBB]);
    }

    #[test]
    fn read_clocks_out_filler() {
        let mut buf = [0xFF; 4];
        let tx = outgoing(&[0x00, 0x39, 0x00], &Data::Read(&mut buf));
        assert_eq!(tx, vec![0x00, 0x39, 0x00, 0, 0, 0, 0]);
    }

    #[test]
    fn missing_device_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = LinuxSpi::open(
            &dir.path().join("spidev9.9"),
            2_000_000,
            &dir.path().join("gpiochip9"),
            6,
        );
        match result {
            Err(BusError::Open { device, .. }) => assert!(device.ends_with("spidev9.9")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a device that does not exist"),
        }
    }
}
