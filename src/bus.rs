//! Peripheral bus binding to the wired Ethernet controller.
//!
//! A [`PeripheralBus`] owns its [`SpiTransport`] outright. Every register
//! access needs `&mut PeripheralBus`, so exclusive access for the length of
//! a transaction is guaranteed by the borrow checker rather than a lock: the
//! bus lives inside the wired driver, the wired driver lives inside the
//! supervisor, and nothing else can reach it.

use serde::Serialize;

use crate::error::BusError;
#[cfg(target_os = "linux")]
use crate::linux_spi::LinuxSpi;
use crate::sim::W5500Model;

/// Direction and buffer of the data phase of one transfer.
#[derive(Debug)]
pub enum Data<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// A chip-select framed serial link plus the controller's reset line.
pub trait SpiTransport: Send {
    /// Runs one transfer with chip select held low: clocks out `header`,
    /// then clocks `data` out or in.
    fn transfer(&mut self, header: &[u8], data: Data<'_>) -> Result<(), BusError>;

    /// Drives the controller's hardware reset line. `true` holds the chip
    /// in reset.
    fn set_reset(&mut self, asserted: bool) -> Result<(), BusError>;
}

/// Static pin/bus assignment, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusDescriptor {
    pub id: u8,
    pub baudrate: u32,
    pub sck: u8,
    pub mosi: u8,
    pub miso: u8,
    pub cs: u8,
    pub rst: u8,
}

impl std::fmt::Display for BusDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SPI{} @ {} Hz (SCK={}, MOSI={}, MISO={}, CS={}, RST={})",
            self.id, self.baudrate, self.sck, self.mosi, self.miso, self.cs, self.rst
        )
    }
}

/// Exclusive handle on the bus, counting transfers and faults for the
/// diagnostics panel.
pub struct PeripheralBus<T> {
    transport: T,
    descriptor: BusDescriptor,
    transactions: u64,
    faults: u64,
}

impl<T: SpiTransport> PeripheralBus<T> {
    pub fn new(transport: T, descriptor: BusDescriptor) -> Self {
        Self {
            transport,
            descriptor,
            transactions: 0,
            faults: 0,
        }
    }

    pub fn write(&mut self, header: &[u8], data: &[u8]) -> Result<(), BusError> {
        self.run(header, Data::Write(data))
    }

    pub fn read(&mut self, header: &[u8], buf: &mut [u8]) -> Result<(), BusError> {
        self.run(header, Data::Read(buf))
    }

    pub fn set_reset(&mut self, asserted: bool) -> Result<(), BusError> {
        self.transport.set_reset(asserted)
    }

    /// Number of transfers attempted since construction.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn descriptor(&self) -> &BusDescriptor {
        &self.descriptor
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn run(&mut self, header: &[u8], data: Data<'_>) -> Result<(), BusError> {
        self.transactions += 1;
        let result = self.transport.transfer(header, data);
        if let Err(ref e) = result {
            self.faults += 1;
            tracing::debug!(error = %e, header = ?header, "bus transfer failed");
        }
        result
    }
}

/// Transport chosen at startup. Without an SPI device on the host the
/// controller is [`Transport::Unattached`] and every transfer fails.
pub enum Transport {
    /// A real W5500 behind Linux spidev.
    #[cfg(target_os = "linux")]
    Spidev(LinuxSpi),
    Emulated(W5500Model),
    Unattached,
}

impl SpiTransport for Transport {
    fn transfer(&mut self, header: &[u8], data: Data<'_>) -> Result<(), BusError> {
        match self {
            #[cfg(target_os = "linux")]
            Transport::Spidev(spi) => spi.transfer(header, data),
            Transport::Emulated(model) => model.transfer(header, data),
            Transport::Unattached => Err(BusError::Transfer("no controller attached".into())),
        }
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), BusError> {
        match self {
            #[cfg(target_os = "linux")]
            Transport::Spidev(spi) => spi.set_reset(asserted),
            Transport::Emulated(model) => model.set_reset(asserted),
            Transport::Unattached => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Vec<Vec<u8>>,
        fail: bool,
        reset: Vec<bool>,
    }

    impl SpiTransport for Recorder {
        fn transfer(&mut self, header: &[u8], data: Data<'_>) -> Result<(), BusError> {
            if self.fail {
                return Err(BusError::Transfer("MISO stuck low".into()));
            }
            let mut frame = header.to_vec();
            match data {
                Data::Write(bytes) => frame.extend_from_slice(bytes),
                Data::Read(buf) => buf.fill(0xAB),
            }
            self.frames.push(frame);
            Ok(())
        }

        fn set_reset(&mut self, asserted: bool) -> Result<(), BusError> {
            self.reset.push(asserted);
            Ok(())
        }
    }

    fn descriptor() -> BusDescriptor {
        BusDescriptor {
            id: 0,
            baudrate: 2_000_000,
            sck: 2,
            mosi: 3,
            miso: 4,
            cs: 5,
            rst: 6,
        }
    }

    #[test]
    fn counts_every_transfer() {
        let mut bus = PeripheralBus::new(Recorder::default(), descriptor());
        bus.write(&[0x00, 0x00, 0x04], &[0x80]).unwrap();
        let mut buf = [0u8; 2];
        bus.read(&[0x00, 0x39, 0x00], &mut buf).unwrap();

        assert_eq!(bus.transactions(), 2);
        assert_eq!(buf, [0xAB, 0xAB]);
        assert_eq!(bus.transport_mut().frames[0], vec![0x00, 0x00, 0x04, 0x80]);
    }

    #[test]
    fn failures_are_counted_and_returned() {
        let mut bus = PeripheralBus::new(
            Recorder {
                fail: true,
                ..Recorder::default()
            },
            descriptor(),
        );
        let err = bus.write(&[0, 0, 4], &[1]).unwrap_err();
        assert!(matches!(err, BusError::Transfer(_)));
        assert_eq!(bus.faults(), 1);
        assert_eq!(bus.transactions(), 1);
    }

    #[test]
    fn reset_line_passes_through() {
        let mut bus = PeripheralBus::new(Recorder::default(), descriptor());
        bus.set_reset(true).unwrap();
        bus.set_reset(false).unwrap();
        assert_eq!(bus.transport_mut().reset, vec![true, false]);
        assert_eq!(bus.transactions(), 0);
    }

    #[test]
    fn unattached_transport_fails_transfers() {
        let mut bus = PeripheralBus::new(Transport::Unattached, descriptor());
        assert!(bus.set_reset(true).is_ok());
        let mut buf = [0u8; 1];
        assert!(matches!(bus.read(&[0x00, 0x39, 0x00], &mut buf), Err(BusError::Transfer(_))));
        assert_eq!(bus.faults(), 1);
    }

    #[test]
    fn descriptor_display() {
        assert_eq!(
            descriptor().to_string(),
            "SPI0 @ 2000000 Hz (SCK=2, MOSI=3, MISO=4, CS=5, RST=6)"
        );
    }
}
