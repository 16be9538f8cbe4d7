use std::net::Ipv4Addr;
use thiserror::Error;

// https://www.iana.org/assignments/protocol-numbers/protocol-numbers.xhtml
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Ipv4Type {
    // 8 bit
    ICMP = 0x1,
    IGMP = 0x2,
    TCP = 0x6,
    UDP = 0x11,
    Unknown,
}

impl From<u8> for Ipv4Type {
    fn from(value: u8) -> Self {
        match value {
            v if v == Ipv4Type::ICMP as u8 => Ipv4Type::ICMP,
            v if v == Ipv4Type::IGMP as u8 => Ipv4Type::IGMP,
            v if v == Ipv4Type::TCP as u8 => Ipv4Type::TCP,
            v if v == Ipv4Type::UDP as u8 => Ipv4Type::UDP,
            _ => Ipv4Type::Unknown,
        }
    }
}

impl From<Ipv4Type> for u8 {
    fn from(e: Ipv4Type) -> Self {
        e as u8
    }
}

#[derive(Error, Debug)]
pub enum L3Error {
    #[error("Datagram for {target_ip} is not addressed to this engine ({local_ip}).")]
    NotForUs {
        target_ip: Ipv4Addr,
        local_ip: Ipv4Addr,
    },
    #[error("Datagram carries protocol {proto}, only TCP is handled.")]
    UnsupportedProtocol { proto: u8 },
}
