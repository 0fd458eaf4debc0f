//! Register-level W5500 emulator.
//!
//! Implements [`SpiTransport`] by decoding frame headers and acting on an
//! in-memory register file, the same way the silicon would: self-clearing
//! `Sn_CR`, write-one-to-clear `Sn_IR`, wrapping 2 KiB socket buffers with
//! the 8-byte UDP receive header. Datagrams sent through a socket are handed
//! to a bench DHCP server or a test responder, and their replies are queued
//! in the receive buffer.
//!
//! A [`ModelHandle`] stays with the caller to pull the cable, inject bus
//! faults, or remove the chip while the model itself is owned by the bus.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{BusDescriptor, Data, SpiTransport};
use crate::dhcp::{self, DhcpMessage, MessageType};
use crate::error::BusError;
use crate::w5500::{
    Block, CHIP_VERSION, MR_RST, NetworkSettings, SNIR_SEND_OK, SNIR_TIMEOUT, SNMR_UDP,
    SOCK_CLOSED, SOCK_UDP, SOCKET_BUFFER_SIZE, SOCKET_COUNT, UDP_HEADER_LEN, cmd,
    parse_frame_header, reg,
};

const COMMON_LEN: usize = 0x40;
const SOCKET_REGS_LEN: usize = 0x30;
const BUFFER_MASK: u16 = (SOCKET_BUFFER_SIZE - 1) as u16;

/// A UDP datagram as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddrV4,
    pub dest: SocketAddrV4,
    pub payload: Vec<u8>,
}

type Responder = Box<dyn FnMut(&Datagram) -> Vec<Datagram> + Send>;

/// Bench DHCP server answering on the emulated segment.
#[derive(Debug, Clone)]
pub struct SimDhcpServer {
    pub server: Ipv4Addr,
    pub offer: NetworkSettings,
    pub lease_secs: u32,
    /// DISCOVERs to drop before answering.
    pub ignore_discovers: u32,
    /// Answer every REQUEST with a NAK.
    pub refuse_requests: bool,
}

impl SimDhcpServer {
    pub fn new(offer: NetworkSettings) -> Self {
        Self {
            server: offer.gateway,
            offer,
            lease_secs: 3600,
            ignore_discovers: 0,
            refuse_requests: false,
        }
    }

    fn answer(&mut self, datagram: &Datagram) -> Vec<Datagram> {
        if datagram.dest.port() != dhcp::SERVER_PORT {
            return Vec::new();
        }
        let Ok(message) = DhcpMessage::decode(&datagram.payload) else {
            return Vec::new();
        };

        let reply = match message.message_type {
            MessageType::Discover if self.ignore_discovers > 0 => {
                self.ignore_discovers -= 1;
                return Vec::new();
            }
            MessageType::Discover => DhcpMessage::reply(
                MessageType::Offer,
                &message,
                self.server,
                Some((&self.offer, self.lease_secs)),
            ),
            MessageType::Request => {
                let wanted = message.requested_ip.unwrap_or(message.ciaddr);
                if self.refuse_requests || wanted != self.offer.address {
                    DhcpMessage::reply(MessageType::Nak, &message, self.server, None)
                } else {
                    DhcpMessage::reply(
                        MessageType::Ack,
                        &message,
                        self.server,
                        Some((&self.offer, self.lease_secs)),
                    )
                }
            }
            _ => return Vec::new(),
        };

        vec![Datagram {
            source: SocketAddrV4::new(self.server, dhcp::SERVER_PORT),
            dest: SocketAddrV4::new(Ipv4Addr::BROADCAST, dhcp::CLIENT_PORT),
            payload: reply.encode(),
        }]
    }
}

struct Control {
    link: bool,
    chip_present: bool,
    fail_transfers: u32,
    hard_resets: u32,
    dhcp: Option<SimDhcpServer>,
    responder: Option<Responder>,
    sent: Vec<Datagram>,
}

impl Control {
    fn dispatch(&mut self, datagram: &Datagram) -> Vec<Datagram> {
        self.sent.push(datagram.clone());
        if !self.link {
            return Vec::new();
        }
        if let Some(server) = self.dhcp.as_mut() {
            let replies = server.answer(datagram);
            if !replies.is_empty() {
                return replies;
            }
        }
        match self.responder.as_mut() {
            Some(responder) => responder(datagram),
            None => Vec::new(),
        }
    }
}

/// Caller-side controls for a [`W5500Model`].
#[derive(Clone)]
pub struct ModelHandle {
    control: Arc<Mutex<Control>>,
}

impl ModelHandle {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugs (`true`) or pulls (`false`) the Ethernet cable.
    pub fn set_link(&self, up: bool) {
        self.lock().link = up;
    }

    pub fn set_chip_present(&self, present: bool) {
        self.lock().chip_present = present;
    }

    /// Makes the next `count` SPI transfers fail.
    pub fn fail_transfers(&self, count: u32) {
        self.lock().fail_transfers = count;
    }

    pub fn set_dhcp_server(&self, server: SimDhcpServer) {
        self.lock().dhcp = Some(server);
    }

    pub fn clear_dhcp_server(&self) {
        self.lock().dhcp = None;
    }

    /// Drops the next `count` DHCPDISCOVERs.
    pub fn ignore_discovers(&self, count: u32) {
        if let Some(server) = self.lock().dhcp.as_mut() {
            server.ignore_discovers = count;
        }
    }

    pub fn refuse_requests(&self, refuse: bool) {
        if let Some(server) = self.lock().dhcp.as_mut() {
            server.refuse_requests = refuse;
        }
    }

    pub fn set_responder(&self, responder: impl FnMut(&Datagram) -> Vec<Datagram> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    pub fn hard_resets(&self) -> u32 {
        self.lock().hard_resets
    }

    /// Every datagram the chip has put on the wire.
    pub fn sent(&self) -> Vec<Datagram> {
        self.lock().sent.clone()
    }
}

struct SocketModel {
    regs: [u8; SOCKET_REGS_LEN],
    tx: Vec<u8>,
    rx: Vec<u8>,
}

impl SocketModel {
    fn new() -> Self {
        let mut regs = [0u8; SOCKET_REGS_LEN];
        regs[usize::from(reg::SN_RXBUF_SIZE)] = 2;
        regs[usize::from(reg::SN_TXBUF_SIZE)] = 2;
        Self {
            regs,
            tx: vec![0; SOCKET_BUFFER_SIZE],
            rx: vec![0; SOCKET_BUFFER_SIZE],
        }
    }

    fn get16(&self, address: u16) -> u16 {
        let at = usize::from(address);
        u16::from_be_bytes([self.regs[at], self.regs[at + 1]])
    }

    fn set16(&mut self, address: u16, value: u16) {
        let at = usize::from(address);
        self.regs[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn read(&self, address: u16) -> u8 {
        if address == reg::SN_TX_FSR || address == reg::SN_TX_FSR + 1 {
            let used = self.get16(reg::SN_TX_WR).wrapping_sub(self.get16(reg::SN_TX_RD));
            let free = (SOCKET_BUFFER_SIZE as u16).saturating_sub(used).to_be_bytes();
            return free[usize::from(address - reg::SN_TX_FSR)];
        }
        self.regs.get(usize::from(address)).copied().unwrap_or(0)
    }

    fn write(&mut self, address: u16, value: u8) {
        if address == reg::SN_IR {
            self.regs[usize::from(reg::SN_IR)] &= !value;
            return;
        }
        // Read-only registers.
        if matches!(address, 0x0020..=0x0023 | 0x0026..=0x0027 | 0x002A..=0x002B) || address == reg::SN_SR {
            return;
        }
        if let Some(slot) = self.regs.get_mut(usize::from(address)) {
            *slot = value;
        }
    }

    fn refresh_rx_size(&mut self) {
        let waiting = self.get16(reg::SN_RX_WR).wrapping_sub(self.get16(reg::SN_RX_RD));
        self.set16(reg::SN_RX_RSR, waiting);
    }

    fn enqueue(&mut self, datagram: &Datagram) {
        let Ok(len) = u16::try_from(datagram.payload.len()) else {
            return;
        };
        let waiting = usize::from(self.get16(reg::SN_RX_WR).wrapping_sub(self.get16(reg::SN_RX_RD)));
        if waiting + UDP_HEADER_LEN + usize::from(len) > SOCKET_BUFFER_SIZE {
            return;
        }
        let mut pointer = self.get16(reg::SN_RX_WR);
        let ip = datagram.source.ip().octets();
        let port = datagram.source.port().to_be_bytes();
        let header = [ip[0], ip[1], ip[2], ip[3], port[0], port[1], (len >> 8) as u8, len as u8];
        for byte in header.iter().chain(datagram.payload.iter()) {
            self.rx[usize::from(pointer & BUFFER_MASK)] = *byte;
            pointer = pointer.wrapping_add(1);
        }
        self.set16(reg::SN_RX_WR, pointer);
        self.refresh_rx_size();
    }
}

pub struct W5500Model {
    common: [u8; COMMON_LEN],
    sockets: Vec<SocketModel>,
    in_reset: bool,
    control: Arc<Mutex<Control>>,
}

impl Default for W5500Model {
    fn default() -> Self {
        Self::new()
    }
}

impl W5500Model {
    /// A present chip with the cable plugged in and nothing else on the segment.
    pub fn new() -> Self {
        Self {
            common: [0; COMMON_LEN],
            sockets: (0..SOCKET_COUNT).map(|_| SocketModel::new()).collect(),
            in_reset: false,
            control: Arc::new(Mutex::new(Control {
                link: true,
                chip_present: true,
                fail_transfers: 0,
                hard_resets: 0,
                dhcp: None,
                responder: None,
                sent: Vec::new(),
            })),
        }
    }

    /// A model with a DHCP server handing out `offer`.
    pub fn with_dhcp(offer: NetworkSettings) -> Self {
        let model = Self::new();
        model.handle().set_dhcp_server(SimDhcpServer::new(offer));
        model
    }

    pub fn handle(&self) -> ModelHandle {
        ModelHandle {
            control: Arc::clone(&self.control),
        }
    }

    fn reset_registers(&mut self) {
        self.common = [0; COMMON_LEN];
        for socket in &mut self.sockets {
            *socket = SocketModel::new();
        }
    }

    fn read_common(&self, address: u16, link: bool) -> u8 {
        match address {
            reg::VERSIONR => CHIP_VERSION,
            // 100 Mbit full duplex whenever the cable is in.
            reg::PHYCFGR => 0xB8 | if link { 0x07 } else { 0x00 },
            _ => self.common.get(usize::from(address)).copied().unwrap_or(0),
        }
    }

    fn write_common(&mut self, address: u16, value: u8) {
        if address == reg::MR && value & MR_RST != 0 {
            self.reset_registers();
            return;
        }
        if matches!(address, reg::VERSIONR | reg::PHYCFGR) {
            return;
        }
        if let Some(slot) = self.common.get_mut(usize::from(address)) {
            *slot = value;
        }
    }

    fn execute(&mut self, socket: u8, command: u8, control: &mut Control) {
        let source_ip = Ipv4Addr::new(self.common[0x0F], self.common[0x10], self.common[0x11], self.common[0x12]);
        let index = usize::from(socket);
        let model = &mut self.sockets[index];
        match command {
            cmd::OPEN => {
                for pointer in [reg::SN_TX_RD, reg::SN_TX_WR, reg::SN_RX_RD, reg::SN_RX_WR, reg::SN_RX_RSR] {
                    model.set16(pointer, 0);
                }
                model.regs[usize::from(reg::SN_SR)] = if model.regs[usize::from(reg::SN_MR)] & 0x0F == SNMR_UDP {
                    SOCK_UDP
                } else {
                    SOCK_CLOSED
                };
            }
            cmd::CLOSE => model.regs[usize::from(reg::SN_SR)] = SOCK_CLOSED,
            cmd::RECV => model.refresh_rx_size(),
            cmd::SEND => {
                if model.regs[usize::from(reg::SN_SR)] != SOCK_UDP {
                    model.regs[usize::from(reg::SN_IR)] |= SNIR_TIMEOUT;
                    return;
                }
                let start = model.get16(reg::SN_TX_RD);
                let end = model.get16(reg::SN_TX_WR);
                let len = end.wrapping_sub(start);
                let payload: Vec<u8> = (0..len)
                    .map(|i| model.tx[usize::from(start.wrapping_add(i) & BUFFER_MASK)])
                    .collect();
                model.set16(reg::SN_TX_RD, end);
                model.regs[usize::from(reg::SN_IR)] |= SNIR_SEND_OK;

                let dip = &model.regs[usize::from(reg::SN_DIPR)..usize::from(reg::SN_DIPR) + 4];
                let datagram = Datagram {
                    source: SocketAddrV4::new(source_ip, model.get16(reg::SN_PORT)),
                    dest: SocketAddrV4::new(Ipv4Addr::new(dip[0], dip[1], dip[2], dip[3]), model.get16(reg::SN_DPORT)),
                    payload,
                };
                for reply in control.dispatch(&datagram) {
                    model.enqueue(&reply);
                }
            }
            _ => {}
        }
    }
}

impl SpiTransport for W5500Model {
    fn transfer(&mut self, header: &[u8], data: Data<'_>) -> Result<(), BusError> {
        let control = Arc::clone(&self.control);
        let mut control = control.lock().unwrap_or_else(PoisonError::into_inner);

        if control.fail_transfers > 0 {
            control.fail_transfers -= 1;
            return Err(BusError::Transfer("injected bus fault".into()));
        }
        if self.in_reset {
            return Err(BusError::Transfer("controller held in reset".into()));
        }
        if !control.chip_present {
            // Nothing drives MISO: reads see zeros, writes vanish.
            if let Data::Read(buf) = data {
                buf.fill(0);
            }
            return Ok(());
        }

        let (block, address, write) =
            parse_frame_header(header).ok_or_else(|| BusError::Transfer("malformed frame header".into()))?;

        match (block, data) {
            (Block::Common, Data::Read(buf)) if !write => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = self.read_common(address.wrapping_add(i as u16), control.link);
                }
            }
            (Block::Common, Data::Write(bytes)) if write => {
                for (i, byte) in bytes.iter().enumerate() {
                    self.write_common(address.wrapping_add(i as u16), *byte);
                }
            }
            (Block::Socket(n), Data::Read(buf)) if !write => {
                let socket = &self.sockets[usize::from(n)];
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = socket.read(address.wrapping_add(i as u16));
                }
            }
            (Block::Socket(n), Data::Write(bytes)) if write => {
                let mut command = None;
                for (i, byte) in bytes.iter().enumerate() {
                    let target = address.wrapping_add(i as u16);
                    if target == reg::SN_CR {
                        command = Some(*byte);
                    } else {
                        self.sockets[usize::from(n)].write(target, *byte);
                    }
                }
                if let Some(command) = command {
                    self.execute(n, command, &mut control);
                }
            }
            (Block::TxBuffer(n), Data::Write(bytes)) if write => {
                let socket = &mut self.sockets[usize::from(n)];
                for (i, byte) in bytes.iter().enumerate() {
                    socket.tx[usize::from(address.wrapping_add(i as u16) & BUFFER_MASK)] = *byte;
                }
            }
            (Block::TxBuffer(n), Data::Read(buf)) if !write => {
                let socket = &self.sockets[usize::from(n)];
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = socket.tx[usize::from(address.wrapping_add(i as u16) & BUFFER_MASK)];
                }
            }
            (Block::RxBuffer(n), Data::Read(buf)) if !write => {
                let socket = &self.sockets[usize::from(n)];
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = socket.rx[usize::from(address.wrapping_add(i as u16) & BUFFER_MASK)];
                }
            }
            (Block::RxBuffer(_), Data::Write(_)) => {}
            _ => return Err(BusError::Transfer("RWB bit disagrees with data phase".into())),
        }
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), BusError> {
        if asserted && !self.in_reset {
            self.control
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .hard_resets += 1;
            self.reset_registers();
        }
        self.in_reset = asserted;
        Ok(())
    }
}

/// Pin assignment of the reference wiring, for tests and bench runs.
pub fn test_descriptor() -> BusDescriptor {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::w5500::frame_header;

    #[test]
    fn sn_cr_self_clears() {
        let mut model = W5500Model::new();
        model
            .transfer(&frame_header(Block::Socket(0), reg::SN_MR, true), Data::Write(&[SNMR_UDP]))
            .unwrap();
        model
            .transfer(&frame_header(Block::Socket(0), reg::SN_CR, true), Data::Write(&[cmd::OPEN]))
            .unwrap();

        let mut buf = [0xFF; 1];
        model
            .transfer(&frame_header(Block::Socket(0), reg::SN_CR, false), Data::Read(&mut buf))
            .unwrap();
        assert_eq!(buf[0], 0);
        model
            .transfer(&frame_header(Block::Socket(0), reg::SN_SR, false), Data::Read(&mut buf))
            .unwrap();
        assert_eq!(buf[0], SOCK_UDP);
    }

    #[test]
    fn injected_faults_run_out() {
        let mut model = W5500Model::new();
        model.handle().fail_transfers(2);
        let mut buf = [0u8; 1];
        let header = frame_header(Block::Common, reg::VERSIONR, false);
        assert!(model.transfer(&header, Data::Read(&mut buf)).is_err());
        assert!(model.transfer(&header, Data::Read(&mut buf)).is_err());
        model.transfer(&header, Data::Read(&mut buf)).unwrap();
        assert_eq!(buf[0], CHIP_VERSION);
    }

    #[test]
    fn reset_line_blocks_transfers_and_is_counted() {
        let mut model = W5500Model::new();
        let handle = model.handle();
        model.set_reset(true).unwrap();
        let mut buf = [0u8; 1];
        assert!(
            model
                .transfer(&frame_header(Block::Common, reg::VERSIONR, false), Data::Read(&mut buf))
                .is_err()
        );
        model.set_reset(false).unwrap();
        assert_eq!(handle.hard_resets(), 1);
    }

    #[test]
    fn dhcp_server_honours_ignore_counter() {
        let settings = NetworkSettings {
            address: Ipv4Addr::new(192, 168, 1, 60),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        };
        let mut server = SimDhcpServer::new(settings);
        server.ignore_discovers = 1;
        let discover = Datagram {
            source: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, dhcp::CLIENT_PORT),
            dest: SocketAddrV4::new(Ipv4Addr::BROADCAST, dhcp::SERVER_PORT),
            payload: DhcpMessage::discover(1, [2, 0, 0, 0, 0, 1], None).encode(),
        };
        assert!(server.answer(&discover).is_empty());
        let replies = server.answer(&discover);
        assert_eq!(replies.len(), 1);
        let offer = DhcpMessage::decode(&replies[0].payload).unwrap();
        assert_eq!(offer.message_type, MessageType::Offer);
        assert_eq!(offer.yiaddr, settings.address);
    }
}
