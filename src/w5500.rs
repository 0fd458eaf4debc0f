//! Register-level driver for the WIZnet W5500 Ethernet controller.
//!
//! Frames use variable-length data mode: a 16-bit offset address, a control
//! byte (`BSB[4:0] | RWB | OM[1:0]`), then the data phase. Only what the
//! adapter needs is implemented: reset and identification, PHY status,
//! network configuration and UDP sockets for DHCP.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::Serialize;

use crate::bus::{PeripheralBus, SpiTransport};
use crate::error::BusError;

/// Value of `VERSIONR` on a genuine W5500.
pub const CHIP_VERSION: u8 = 0x04;
pub const SOCKET_COUNT: u8 = 8;
/// Per-socket TX/RX buffer size configured by [`W5500::init_buffers`].
pub const SOCKET_BUFFER_SIZE: usize = 2048;
/// Bytes prepended by the chip to each received UDP datagram.
pub const UDP_HEADER_LEN: usize = 8;

pub const RESET_PULSE: Duration = Duration::from_millis(10);
pub const RESET_SETTLE: Duration = Duration::from_millis(100);

// Polls of a self-clearing register before the chip is declared stuck.
const COMMAND_POLLS: usize = 100;

pub mod reg {
    // Common register block
    pub const MR: u16 = 0x0000;
    pub const GAR: u16 = 0x0001;
    pub const SUBR: u16 = 0x0005;
    pub const SHAR: u16 = 0x0009;
    pub const SIPR: u16 = 0x000F;
    pub const PHYCFGR: u16 = 0x002E;
    pub const VERSIONR: u16 = 0x0039;

    // Socket register block
    pub const SN_MR: u16 = 0x0000;
    pub const SN_CR: u16 = 0x0001;
    pub const SN_IR: u16 = 0x0002;
    pub const SN_SR: u16 = 0x0003;
    pub const SN_PORT: u16 = 0x0004;
    pub const SN_DIPR: u16 = 0x000C;
    pub const SN_DPORT: u16 = 0x0010;
    pub const SN_RXBUF_SIZE: u16 = 0x001E;
    pub const SN_TXBUF_SIZE: u16 = 0x001F;
    pub const SN_TX_FSR: u16 = 0x0020;
    pub const SN_TX_RD: u16 = 0x0022;
    pub const SN_TX_WR: u16 = 0x0024;
    pub const SN_RX_RSR: u16 = 0x0026;
    pub const SN_RX_RD: u16 = 0x0028;
    pub const SN_RX_WR: u16 = 0x002A;
}

pub mod cmd {
    pub const OPEN: u8 = 0x01;
    pub const CLOSE: u8 = 0x10;
    pub const SEND: u8 = 0x20;
    pub const RECV: u8 = 0x40;
}

pub const MR_RST: u8 = 0x80;
pub const SNMR_UDP: u8 = 0x02;
pub const SOCK_CLOSED: u8 = 0x00;
pub const SOCK_UDP: u8 = 0x22;
pub const SNIR_SEND_OK: u8 = 0x10;
pub const SNIR_TIMEOUT: u8 = 0x08;
pub const SNIR_RECV: u8 = 0x04;

const PHY_LINK: u8 = 0x01;
const PHY_SPEED_100: u8 = 0x02;
const PHY_FULL_DUPLEX: u8 = 0x04;

/// Register/buffer block selected by the BSB bits of the control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Common,
    Socket(u8),
    TxBuffer(u8),
    RxBuffer(u8),
}

impl Block {
    pub fn bsb(self) -> u8 {
        match self {
            Block::Common => 0,
            Block::Socket(n) => n * 4 + 1,
            Block::TxBuffer(n) => n * 4 + 2,
            Block::RxBuffer(n) => n * 4 + 3,
        }
    }

    pub fn from_bsb(bsb: u8) -> Option<Self> {
        if bsb == 0 {
            return Some(Block::Common);
        }
        let socket = (bsb - 1) / 4;
        if socket >= SOCKET_COUNT {
            return None;
        }
        match bsb % 4 {
            1 => Some(Block::Socket(socket)),
            2 => Some(Block::TxBuffer(socket)),
            3 => Some(Block::RxBuffer(socket)),
            _ => None,
        }
    }
}

/// Builds the three-byte frame header for a variable-length-data-mode access.
pub fn frame_header(block: Block, address: u16, write: bool) -> [u8; 3] {
    let [hi, lo] = address.to_be_bytes();
    let control = (block.bsb() << 3) | (u8::from(write) << 2);
    [hi, lo, control]
}

/// Inverse of [`frame_header`]: `(block, address, is_write)`.
pub fn parse_frame_header(header: &[u8]) -> Option<(Block, u16, bool)> {
    let [hi, lo, control] = <[u8; 3]>::try_from(header).ok()?;
    let block = Block::from_bsb(control >> 3)?;
    let write = control & 0x04 != 0;
    Some((block, u16::from_be_bytes([hi, lo]), write))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PhyStatus {
    pub link: bool,
    pub speed_100: bool,
    pub full_duplex: bool,
}

impl From<u8> for PhyStatus {
    fn from(value: u8) -> Self {
        Self {
            link: value & PHY_LINK != 0,
            speed_100: value & PHY_SPEED_100 != 0,
            full_duplex: value & PHY_FULL_DUPLEX != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSettings {
    pub address: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl NetworkSettings {
    pub const UNSET: NetworkSettings = NetworkSettings {
        address: Ipv4Addr::UNSPECIFIED,
        subnet: Ipv4Addr::UNSPECIFIED,
        gateway: Ipv4Addr::UNSPECIFIED,
    };
}

pub struct W5500<T> {
    bus: PeripheralBus<T>,
}

impl<T: SpiTransport> W5500<T> {
    pub fn new(bus: PeripheralBus<T>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &PeripheralBus<T> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut PeripheralBus<T> {
        &mut self.bus
    }

    // ── Raw access ──────────────────────────────────────────────────

    pub fn read_bytes(&mut self, block: Block, address: u16, buf: &mut [u8]) -> Result<(), BusError> {
        self.bus.read(&frame_header(block, address, false), buf)
    }

    pub fn write_bytes(&mut self, block: Block, address: u16, data: &[u8]) -> Result<(), BusError> {
        self.bus.write(&frame_header(block, address, true), data)
    }

    pub fn read_u8(&mut self, block: Block, address: u16) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        self.read_bytes(block, address, &mut buf)?;
        Ok(buf[0])
    }

    pub fn write_u8(&mut self, block: Block, address: u16, value: u8) -> Result<(), BusError> {
        self.write_bytes(block, address, &[value])
    }

    pub fn read_u16(&mut self, block: Block, address: u16) -> Result<u16, BusError> {
        let mut buf = [0u8; 2];
        self.read_bytes(block, address, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn write_u16(&mut self, block: Block, address: u16, value: u16) -> Result<(), BusError> {
        self.write_bytes(block, address, &value.to_be_bytes())
    }

    /// Free-running size registers can change between the two byte reads;
    /// the datasheet asks for repeated reads until two agree.
    fn read_u16_stable(&mut self, block: Block, address: u16) -> Result<u16, BusError> {
        let mut previous = self.read_u16(block, address)?;
        for _ in 0..COMMAND_POLLS {
            let current = self.read_u16(block, address)?;
            if current == previous {
                return Ok(current);
            }
            previous = current;
        }
        Err(BusError::Stalled("size register read"))
    }

    fn read_ip(&mut self, address: u16) -> Result<Ipv4Addr, BusError> {
        let mut octets = [0u8; 4];
        self.read_bytes(Block::Common, address, &mut octets)?;
        Ok(Ipv4Addr::from(octets))
    }

    // ── Chip control ────────────────────────────────────────────────

    /// Pulses the RST line and waits for the chip to come back.
    pub async fn hard_reset(&mut self) -> Result<(), BusError> {
        self.bus.set_reset(true)?;
        tokio::time::sleep(RESET_PULSE).await;
        self.bus.set_reset(false)?;
        tokio::time::sleep(RESET_SETTLE).await;
        Ok(())
    }

    /// Sets `MR.RST` and waits for the chip to clear it.
    pub fn soft_reset(&mut self) -> Result<(), BusError> {
        self.write_u8(Block::Common, reg::MR, MR_RST)?;
        for _ in 0..COMMAND_POLLS {
            if self.read_u8(Block::Common, reg::MR)? & MR_RST == 0 {
                return Ok(());
            }
        }
        Err(BusError::Stalled("soft reset"))
    }

    pub fn version(&mut self) -> Result<u8, BusError> {
        self.read_u8(Block::Common, reg::VERSIONR)
    }

    pub fn verify_chip(&mut self) -> Result<(), BusError> {
        let found = self.version()?;
        if found == CHIP_VERSION {
            Ok(())
        } else {
            Err(BusError::UnexpectedChip {
                found,
                expected: CHIP_VERSION,
            })
        }
    }

    /// Gives every socket a 2 KiB TX and RX buffer.
    pub fn init_buffers(&mut self) -> Result<(), BusError> {
        let kib = u8::try_from(SOCKET_BUFFER_SIZE / 1024).unwrap_or(2);
        for socket in 0..SOCKET_COUNT {
            self.write_u8(Block::Socket(socket), reg::SN_RXBUF_SIZE, kib)?;
            self.write_u8(Block::Socket(socket), reg::SN_TXBUF_SIZE, kib)?;
        }
        Ok(())
    }

    pub fn phy(&mut self) -> Result<PhyStatus, BusError> {
        self.read_u8(Block::Common, reg::PHYCFGR).map(PhyStatus::from)
    }

    pub fn set_mac(&mut self, mac: &[u8; 6]) -> Result<(), BusError> {
        self.write_bytes(Block::Common, reg::SHAR, mac)
    }

    pub fn mac(&mut self) -> Result<[u8; 6], BusError> {
        let mut mac = [0u8; 6];
        self.read_bytes(Block::Common, reg::SHAR, &mut mac)?;
        Ok(mac)
    }

    pub fn set_network(&mut self, settings: &NetworkSettings) -> Result<(), BusError> {
        self.write_bytes(Block::Common, reg::GAR, &settings.gateway.octets())?;
        self.write_bytes(Block::Common, reg::SUBR, &settings.subnet.octets())?;
        self.write_bytes(Block::Common, reg::SIPR, &settings.address.octets())
    }

    pub fn network(&mut self) -> Result<NetworkSettings, BusError> {
        Ok(NetworkSettings {
            address: self.read_ip(reg::SIPR)?,
            subnet: self.read_ip(reg::SUBR)?,
            gateway: self.read_ip(reg::GAR)?,
        })
    }

    // ── UDP sockets ─────────────────────────────────────────────────

    fn command(&mut self, socket: u8, command: u8) -> Result<(), BusError> {
        self.write_u8(Block::Socket(socket), reg::SN_CR, command)?;
        for _ in 0..COMMAND_POLLS {
            if self.read_u8(Block::Socket(socket), reg::SN_CR)? == 0 {
                return Ok(());
            }
        }
        Err(BusError::Stalled("socket command"))
    }

    pub fn socket_status(&mut self, socket: u8) -> Result<u8, BusError> {
        self.read_u8(Block::Socket(socket), reg::SN_SR)
    }

    pub fn udp_open(&mut self, socket: u8, port: u16) -> Result<(), BusError> {
        if self.socket_status(socket)? != SOCK_CLOSED {
            self.close(socket)?;
        }
        self.write_u8(Block::Socket(socket), reg::SN_MR, SNMR_UDP)?;
        self.write_u16(Block::Socket(socket), reg::SN_PORT, port)?;
        self.command(socket, cmd::OPEN)?;
        if self.socket_status(socket)? == SOCK_UDP {
            Ok(())
        } else {
            Err(BusError::Stalled("UDP socket open"))
        }
    }

    pub fn udp_send(&mut self, socket: u8, dest: SocketAddrV4, payload: &[u8]) -> Result<(), BusError> {
        let free = usize::from(self.read_u16_stable(Block::Socket(socket), reg::SN_TX_FSR)?);
        if payload.len() > free {
            return Err(BusError::Transfer(format!(
                "datagram of {} bytes exceeds {free} bytes of TX space",
                payload.len()
            )));
        }
        let len = u16::try_from(payload.len())
            .map_err(|_| BusError::Transfer("datagram too large".into()))?;

        let pointer = self.read_u16(Block::Socket(socket), reg::SN_TX_WR)?;
        self.write_bytes(Block::TxBuffer(socket), pointer, payload)?;
        self.write_u16(Block::Socket(socket), reg::SN_TX_WR, pointer.wrapping_add(len))?;
        self.write_bytes(Block::Socket(socket), reg::SN_DIPR, &dest.ip().octets())?;
        self.write_u16(Block::Socket(socket), reg::SN_DPORT, dest.port())?;
        self.command(socket, cmd::SEND)?;

        for _ in 0..COMMAND_POLLS {
            let ir = self.read_u8(Block::Socket(socket), reg::SN_IR)?;
            if ir & SNIR_SEND_OK != 0 {
                self.write_u8(Block::Socket(socket), reg::SN_IR, SNIR_SEND_OK)?;
                return Ok(());
            }
            if ir & SNIR_TIMEOUT != 0 {
                self.write_u8(Block::Socket(socket), reg::SN_IR, SNIR_TIMEOUT)?;
                return Err(BusError::Transfer("UDP send timed out in controller".into()));
            }
        }
        Err(BusError::Stalled("UDP send"))
    }

    /// Pops one datagram if any is waiting. Returns the sender and the number
    /// of bytes copied into `buf` (excess bytes are discarded).
    pub fn udp_recv(&mut self, socket: u8, buf: &mut [u8]) -> Result<Option<(SocketAddrV4, usize)>, BusError> {
        let waiting = usize::from(self.read_u16_stable(Block::Socket(socket), reg::SN_RX_RSR)?);
        if waiting < UDP_HEADER_LEN {
            return Ok(None);
        }

        let pointer = self.read_u16(Block::Socket(socket), reg::SN_RX_RD)?;
        let mut header = [0u8; UDP_HEADER_LEN];
        self.read_bytes(Block::RxBuffer(socket), pointer, &mut header)?;
        let source = SocketAddrV4::new(
            Ipv4Addr::new(header[0], header[1], header[2], header[3]),
            u16::from_be_bytes([header[4], header[5]]),
        );
        let len = u16::from_be_bytes([header[6], header[7]]);

        let copied = usize::from(len).min(buf.len());
        let data_pointer = pointer.wrapping_add(UDP_HEADER_LEN as u16);
        self.read_bytes(Block::RxBuffer(socket), data_pointer, &mut buf[..copied])?;

        self.write_u16(Block::Socket(socket), reg::SN_RX_RD, data_pointer.wrapping_add(len))?;
        self.command(socket, cmd::RECV)?;
        Ok(Some((source, copied)))
    }

    pub fn close(&mut self, socket: u8) -> Result<(), BusError> {
        self.command(socket, cmd::CLOSE)?;
        self.write_u8(Block::Socket(socket), reg::SN_IR, 0xFF)
    }
}
