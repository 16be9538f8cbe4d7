use crate::l2_l3::defs::Ipv4Type;
use anyhow::Result;
use std::net::Ipv4Addr;

const IPV4_HEADER_LENGTH_BASIC: usize = 20;
pub const IPV4_DEFAULT_TTL: u8 = 64;

// https://datatracker.ietf.org/doc/html/rfc791
//
//Bit 0: reserved, must be zero
//Bit 1: (DF) 0 = May Fragment,  1 = Don't Fragment.
//Bit 2: (MF) 0 = Last Fragment, 1 = More Fragments.
//
//    0   1   2
//  +---+---+---+
//  |   | D | M |
//  | 0 | F | F |
//  +---+---+---+
//
const IPV4_FLAG_DF: u8 = 0b010;
const IPV4_FLAG_MF: u8 = 0b001;

// Sum 16-bit big endian words of data on top of an existing partial sum.
// Odd trailing byte is padded with zero.
pub fn compute_ipv4_checksum(data: &[u8], partial: u32) -> u32 {
    let mut sum = partial as u64;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u64;
    }
    while (sum >> 32) > 0 {
        sum = (sum & 0xffff_ffff) + (sum >> 32);
    }
    sum as u32
}

// Fold carries into 16 bits and complement.
pub fn finalize_ipv4_checksum(sum: u32) -> u16 {
    let mut checksum_tmp = (sum & 0xffff) + (sum >> 16);
    while (checksum_tmp >> 16) > 0 {
        checksum_tmp = (checksum_tmp & 0xffff) + (checksum_tmp >> 16);
    }
    !(checksum_tmp as u16)
}

// https://datatracker.ietf.org/doc/html/rfc791
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Version|  IHL  |Type of Service|          Total Length         |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |         Identification        |Flags|      Fragment Offset    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Time to Live |    Protocol   |         Header Checksum       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       Source Address                          |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Destination Address                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Options                    |    Padding    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Clone, Debug, Default)]
pub struct Ipv4Packet {
    pub version: u8, // 4 bit
    pub ihl: u8,     // 4 bit
    pub type_of_service: u8,
    pub length: u16,
    pub identification: u16,
    pub flags: u8,        // 3 bit
    pub frag_offset: u16, // 13 bit
    pub ttl: u8,
    pub protocol: u8,
    pub header_checksum: u16,
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
    pub options: Option<u32>,
    pub payload: Vec<u8>,
    pub valid: bool,
}

impl Ipv4Packet {
    pub fn new() -> Self {
        Self {
            payload: Vec::new(),
            ..Default::default()
        }
    }

    // Datagram carrying a TCP segment, ready to be serialized by create_packet.
    pub fn new_tcp(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        ttl: u8,
        identification: u16,
        segment: Vec<u8>,
    ) -> Self {
        let mut packet = Self {
            version: 4,
            ihl: 5,
            length: (IPV4_HEADER_LENGTH_BASIC + segment.len()) as u16,
            identification,
            flags: IPV4_FLAG_DF,
            ttl,
            protocol: u8::from(Ipv4Type::TCP),
            src_addr: src_addr.octets(),
            dst_addr: dst_addr.octets(),
            payload: segment,
            valid: true,
            ..Default::default()
        };
        packet.calc_header_checksum_and_set();
        packet
    }

    pub fn read(&mut self, packet: &[u8]) -> Result<bool> {
        if packet.len() < IPV4_HEADER_LENGTH_BASIC {
            anyhow::bail!(
                "Insufficient packet length for IPv4 Header. packet.len()={}",
                packet.len()
            );
        }
        self.version = u8::from_be_bytes(packet[0..1].try_into()?) >> 4; // top 4 bit
        self.ihl = u8::from_be_bytes(packet[0..1].try_into()?) & 0xf; // bottom 4 bit
        self.type_of_service = u8::from_be_bytes(packet[1..2].try_into()?);
        self.length = u16::from_be_bytes(packet[2..4].try_into()?);
        self.identification = u16::from_be_bytes(packet[4..6].try_into()?);
        self.flags = (u16::from_be_bytes(packet[6..8].try_into()?) >> 13) as u8; // top 3 bit
        self.frag_offset = u16::from_be_bytes(packet[6..8].try_into()?) & 0x1fff; // bottom 13 bit
        self.ttl = u8::from_be_bytes(packet[8..9].try_into()?);
        self.protocol = u8::from_be_bytes(packet[9..10].try_into()?);
        self.header_checksum = u16::from_be_bytes(packet[10..12].try_into()?);
        self.src_addr = packet[12..16].try_into()?;
        self.dst_addr = packet[16..20].try_into()?;
        let header_length = match self.ihl {
            // 20 bytes header w/o option
            5 => {
                self.options = None;
                IPV4_HEADER_LENGTH_BASIC
            }
            // 24 byte header w/ option
            6 => {
                self.options = Some(u32::from_be_bytes(packet[20..24].try_into()?));
                IPV4_HEADER_LENGTH_BASIC + 4
            }
            other => anyhow::bail!("Unsupported Ipv4 Header length. length={}", other),
        };
        let total_length = self.length as usize;
        anyhow::ensure!(
            total_length >= header_length && total_length <= packet.len(),
            "IPv4 total length {} does not fit the received {} bytes.",
            total_length,
            packet.len()
        );
        // Anything beyond total length is link layer padding.
        self.payload = packet[header_length..total_length].to_vec();
        self.validate()?;

        Ok(self.valid)
    }

    fn calc_header_checksum(&self) -> u16 {
        let mut header = self.create_header();
        // checksum field is zero while summing
        header[10] = 0;
        header[11] = 0;
        finalize_ipv4_checksum(compute_ipv4_checksum(&header, 0))
    }

    pub fn calc_header_checksum_and_set(&mut self) {
        self.header_checksum = self.calc_header_checksum();
    }

    pub fn validate(&mut self) -> Result<bool> {
        self.valid = true;
        if self.version != 4 {
            log::debug!(
                "Unexpected ip header. version is {}, but is expected 4.",
                self.version
            );
            self.valid = false;
        }
        if Ipv4Type::from(self.protocol) == Ipv4Type::Unknown {
            log::debug!("Unexpected ip header. Unknown protocol {}.", self.protocol);
            self.valid = false;
        }
        if self.frag_offset != 0 || (self.flags & IPV4_FLAG_MF) != 0 {
            log::debug!(
                "Fragmented datagram (offset={} flags=0b{:03b}) is not reassembled here.",
                self.frag_offset,
                self.flags
            );
            self.valid = false;
        }
        let expected_checksum = self.calc_header_checksum();
        if self.header_checksum != expected_checksum {
            log::debug!(
                "Unexpected ip header. Header checksum is 0x{:x} but is expected 0x{:x}.",
                self.header_checksum,
                expected_checksum
            );
            self.valid = false;
            anyhow::bail!(
                "IP Header has bad checksum 0x{:x}, expected 0x{:x}.",
                self.header_checksum,
                expected_checksum
            );
        }

        Ok(self.valid)
    }

    fn create_header(&self) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(&(self.version << 4 | self.ihl).to_be_bytes());
        header.extend_from_slice(&self.type_of_service.to_be_bytes());
        header.extend_from_slice(&self.length.to_be_bytes());
        header.extend_from_slice(&self.identification.to_be_bytes());
        header.extend_from_slice(&((self.flags as u16) << 13 | self.frag_offset).to_be_bytes());
        header.extend_from_slice(&self.ttl.to_be_bytes());
        header.extend_from_slice(&self.protocol.to_be_bytes());
        header.extend_from_slice(&self.header_checksum.to_be_bytes());
        header.extend_from_slice(&self.src_addr);
        header.extend_from_slice(&self.dst_addr);
        if let Some(options) = self.options {
            header.extend_from_slice(&options.to_be_bytes());
        }

        header
    }

    pub fn create_packet(&self) -> Vec<u8> {
        // Caller is responsible for the header checksum.
        let mut packet = self.create_header();
        packet.extend_from_slice(&self.payload);
        packet
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }
}
