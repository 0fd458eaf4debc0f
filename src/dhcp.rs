//! Minimal DHCPv4 message codec (RFC 2131/2132).
//!
//! Only the options the adapter reads or sends are understood; everything
//! else is skipped on decode.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::DhcpError;
use crate::w5500::NetworkSettings;

pub const CLIENT_PORT: u16 = 68;
pub const SERVER_PORT: u16 = 67;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const BOOTP_LEN: usize = 236;
const MIN_MESSAGE_LEN: usize = 300;
const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const FLAG_BROADCAST: u16 = 0x8000;

mod option {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_LIST: u8 = 55;
    pub const CLIENT_ID: u8 = 61;
    pub const END: u8 = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub chaddr: [u8; 6],
    pub message_type: MessageType,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub lease_secs: Option<u32>,
    pub hostname: Option<String>,
}

impl DhcpMessage {
    fn client(message_type: MessageType, xid: u32, mac: [u8; 6]) -> Self {
        Self {
            op: BOOTREQUEST,
            xid,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: mac,
            message_type,
            requested_ip: None,
            server_id: None,
            subnet_mask: None,
            router: None,
            dns: None,
            lease_secs: None,
            hostname: None,
        }
    }

    pub fn discover(xid: u32, mac: [u8; 6], hostname: Option<&str>) -> Self {
        Self {
            hostname: hostname.map(String::from),
            ..Self::client(MessageType::Discover, xid, mac)
        }
    }

    /// REQUEST in SELECTING state, answering `offer`.
    pub fn request(xid: u32, mac: [u8; 6], offer: &DhcpMessage, hostname: Option<&str>) -> Self {
        Self {
            requested_ip: Some(offer.yiaddr),
            server_id: offer.server_id,
            hostname: hostname.map(String::from),
            ..Self::client(MessageType::Request, xid, mac)
        }
    }

    /// REQUEST in RENEWING state: the client already owns `address`.
    pub fn renew(xid: u32, mac: [u8; 6], address: Ipv4Addr) -> Self {
        Self {
            ciaddr: address,
            ..Self::client(MessageType::Request, xid, mac)
        }
    }

    /// Server-side reply to `request`, used by the bench DHCP responder.
    pub fn reply(
        message_type: MessageType,
        request: &DhcpMessage,
        server: Ipv4Addr,
        offer: Option<(&NetworkSettings, u32)>,
    ) -> Self {
        let (yiaddr, subnet_mask, router, lease_secs) = match offer {
            Some((settings, secs)) => (
                settings.address,
                Some(settings.subnet),
                Some(settings.gateway),
                Some(secs),
            ),
            None => (Ipv4Addr::UNSPECIFIED, None, None, None),
        };
        Self {
            op: BOOTREPLY,
            xid: request.xid,
            flags: request.flags,
            ciaddr: request.ciaddr,
            yiaddr,
            siaddr: server,
            chaddr: request.chaddr,
            message_type,
            requested_ip: None,
            server_id: Some(server),
            subnet_mask,
            router,
            dns: router,
            lease_secs,
            hostname: None,
        }
    }

    pub fn is_reply_to(&self, xid: u32, mac: &[u8; 6]) -> bool {
        self.op == BOOTREPLY && self.xid == xid && &self.chaddr == mac
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_MESSAGE_LEN + 32);
        out.push(self.op);
        out.push(HTYPE_ETHERNET);
        out.push(6);
        out.push(0);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.ciaddr.octets());
        out.extend_from_slice(&self.yiaddr.octets());
        out.extend_from_slice(&self.siaddr.octets());
        out.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
        out.extend_from_slice(&self.chaddr);
        out.resize(BOOTP_LEN, 0);
        out.extend_from_slice(&MAGIC_COOKIE);

        out.extend_from_slice(&[option::MESSAGE_TYPE, 1, self.message_type.code()]);
        if self.op == BOOTREQUEST {
            out.extend_from_slice(&[option::CLIENT_ID, 7, HTYPE_ETHERNET]);
            out.extend_from_slice(&self.chaddr);
        }
        push_ip(&mut out, option::REQUESTED_IP, self.requested_ip);
        push_ip(&mut out, option::SERVER_ID, self.server_id);
        push_ip(&mut out, option::SUBNET_MASK, self.subnet_mask);
        push_ip(&mut out, option::ROUTER, self.router);
        push_ip(&mut out, option::DNS, self.dns);
        if let Some(secs) = self.lease_secs {
            out.extend_from_slice(&[option::LEASE_TIME, 4]);
            out.extend_from_slice(&secs.to_be_bytes());
        }
        if let Some(name) = &self.hostname {
            let bytes = &name.as_bytes()[..name.len().min(63)];
            out.extend_from_slice(&[option::HOSTNAME, bytes.len() as u8]);
            out.extend_from_slice(bytes);
        }
        if self.op == BOOTREQUEST {
            out.extend_from_slice(&[
                option::PARAMETER_LIST,
                4,
                option::SUBNET_MASK,
                option::ROUTER,
                option::DNS,
                option::LEASE_TIME,
            ]);
        }
        out.push(option::END);

        if out.len() < MIN_MESSAGE_LEN {
            out.resize(MIN_MESSAGE_LEN, 0);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DhcpError> {
        if bytes.len() < BOOTP_LEN + MAGIC_COOKIE.len() {
            return Err(DhcpError::Malformed("message shorter than BOOTP header"));
        }
        if bytes[1] != HTYPE_ETHERNET || bytes[2] != 6 {
            return Err(DhcpError::Malformed("not an Ethernet hardware address"));
        }
        if bytes[BOOTP_LEN..BOOTP_LEN + 4] != MAGIC_COOKIE {
            return Err(DhcpError::Malformed("missing magic cookie"));
        }

        let ip_at = |at: usize| Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]);
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&bytes[28..34]);

        let mut message_type = None;
        let mut message = Self {
            op: bytes[0],
            xid: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            flags: u16::from_be_bytes([bytes[10], bytes[11]]),
            ciaddr: ip_at(12),
            yiaddr: ip_at(16),
            siaddr: ip_at(20),
            chaddr,
            message_type: MessageType::Discover,
            requested_ip: None,
            server_id: None,
            subnet_mask: None,
            router: None,
            dns: None,
            lease_secs: None,
            hostname: None,
        };

        let mut at = BOOTP_LEN + MAGIC_COOKIE.len();
        while at < bytes.len() {
            let code = bytes[at];
            if code == option::END {
                break;
            }
            if code == option::PAD {
                at += 1;
                continue;
            }
            let len = usize::from(*bytes.get(at + 1).ok_or(DhcpError::Malformed("truncated option"))?);
            let value = bytes
                .get(at + 2..at + 2 + len)
                .ok_or(DhcpError::Malformed("option overruns message"))?;
            match code {
                option::MESSAGE_TYPE => message_type = value.first().copied().and_then(MessageType::from_code),
                option::REQUESTED_IP => message.requested_ip = first_ip(value),
                option::SERVER_ID => message.server_id = first_ip(value),
                option::SUBNET_MASK => message.subnet_mask = first_ip(value),
                option::ROUTER => message.router = first_ip(value),
                option::DNS => message.dns = first_ip(value),
                option::LEASE_TIME => {
                    message.lease_secs = <[u8; 4]>::try_from(value).ok().map(u32::from_be_bytes);
                }
                option::HOSTNAME => message.hostname = Some(String::from_utf8_lossy(value).into_owned()),
                _ => {}
            }
            at += 2 + len;
        }

        message.message_type = message_type.ok_or(DhcpError::Malformed("missing message type"))?;
        Ok(message)
    }
}

fn push_ip(out: &mut Vec<u8>, code: u8, ip: Option<Ipv4Addr>) {
    if let Some(ip) = ip {
        out.extend_from_slice(&[code, 4]);
        out.extend_from_slice(&ip.octets());
    }
}

fn first_ip(value: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Address configuration granted by a DHCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub settings: NetworkSettings,
    pub dns: Option<Ipv4Addr>,
    pub server: Ipv4Addr,
    pub duration: Duration,
}

/// Lease time assumed when an ACK omits option 51.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(3600);

impl Lease {
    pub fn from_ack(ack: &DhcpMessage) -> Result<Self, DhcpError> {
        match ack.message_type {
            MessageType::Ack => {}
            MessageType::Nak => return Err(DhcpError::Declined),
            _ => return Err(DhcpError::Malformed("expected ACK")),
        }
        if ack.yiaddr.is_unspecified() {
            return Err(DhcpError::Malformed("ACK without an address"));
        }
        Ok(Self {
            settings: NetworkSettings {
                address: ack.yiaddr,
                subnet: ack.subnet_mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
                gateway: ack.router.unwrap_or(Ipv4Addr::UNSPECIFIED),
            },
            dns: ack.dns,
            server: ack.server_id.unwrap_or(ack.siaddr),
            duration: ack
                .lease_secs
                .map_or(DEFAULT_LEASE, |secs| Duration::from_secs(u64::from(secs))),
        })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.settings.address
    }

    /// T1: when renewal should start.
    pub fn renew_after(&self) -> Duration {
        self.duration / 2
    }
}
