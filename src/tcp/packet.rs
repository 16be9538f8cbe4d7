use crate::l2_l3::{
    defs::Ipv4Type,
    ip::{compute_ipv4_checksum, finalize_ipv4_checksum, Ipv4Packet},
};
use crate::tcp::defs::{FourTuple, TcpOptionKind};
use anyhow::Result;
use bitflags::bitflags;
use std::net::Ipv4Addr;

// Tcp header max size is 60 (15*4) bytes because Max Data Offset is 15 (0b1111).
const TCP_HEADER_LENGTH_BASIC: usize = 20;

// https://datatracker.ietf.org/doc/html/rfc9293
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Source Port          |       Destination Port        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                        Sequence Number                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Acknowledgment Number                      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |  Data |       |C|E|U|A|P|R|S|F|                               |
// | Offset| Rsrvd |W|C|R|C|S|S|Y|I|            Window             |
// |       |       |R|E|G|K|H|T|N|N|                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Checksum            |         Urgent Pointer        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                           [Options]                           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               :
// :                             Data                              :
// :                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Default, Debug, Clone)]
pub struct TcpPacket {
    pub src_addr: [u8; 4], // pesudo header
    pub dst_addr: [u8; 4], // pesudo header
    pub protocol: u8,      // pesudo header
    pub tcp_length: u16,   // pesudo header
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub offset: u8, // 4 bit (payload begins from 4*offset bytes)
    pub flag: TcpFlag,
    pub window_size: u16,
    pub checksum: u16,
    pub urg_pointer: u16,
    pub option_raw: Vec<u8>,
    pub option: TcpOption,
    pub payload: Vec<u8>,
    pub valid: bool,
}

impl TcpPacket {
    pub fn new() -> Self {
        Self {
            option_raw: Vec::new(),
            option: TcpOption::new(),
            payload: Vec::new(),
            ..Default::default()
        }
    }

    // Outgoing segment skeleton addressed by `tuple`.
    pub fn new_segment(tuple: &FourTuple, seq_number: u32, ack_number: u32, flag: TcpFlag) -> Self {
        let mut segment = Self::new();
        segment.src_addr = tuple.src_addr.octets();
        segment.dst_addr = tuple.dst_addr.octets();
        segment.protocol = u8::from(Ipv4Type::TCP);
        segment.src_port = tuple.src_port;
        segment.dst_port = tuple.dst_port;
        segment.seq_number = seq_number;
        segment.ack_number = ack_number;
        segment.flag = flag;
        segment
    }

    pub fn read(&mut self, ipv4_packet: &Ipv4Packet) -> Result<bool> {
        let tcp_len = ipv4_packet.payload.len();
        if tcp_len > 0xffff {
            anyhow::bail!(
                "TCP packet payload length is {}, must be smaller than 65536+1.",
                tcp_len
            );
        } else if tcp_len < TCP_HEADER_LENGTH_BASIC {
            anyhow::bail!(
                "TCP packet payload length is {}, must be larger than header length ({}).",
                tcp_len,
                TCP_HEADER_LENGTH_BASIC
            );
        } else {
            self.tcp_length = tcp_len as u16;
        }

        let segment = &ipv4_packet.payload;
        self.src_addr = ipv4_packet.src_addr;
        self.dst_addr = ipv4_packet.dst_addr;
        self.protocol = ipv4_packet.protocol;
        self.src_port = u16::from_be_bytes(segment[0..2].try_into()?);
        self.dst_port = u16::from_be_bytes(segment[2..4].try_into()?);
        self.seq_number = u32::from_be_bytes(segment[4..8].try_into()?);
        self.ack_number = u32::from_be_bytes(segment[8..12].try_into()?);
        self.offset = segment[12] >> 4;
        let offset_bytes = (self.offset as usize) * 4;
        anyhow::ensure!(
            offset_bytes >= TCP_HEADER_LENGTH_BASIC && tcp_len >= offset_bytes,
            "TCP packet payload length is {}, but header's data offset indicate {}.",
            tcp_len,
            offset_bytes
        );
        self.flag = TcpFlag::from_bits_retain(segment[13]);
        self.window_size = u16::from_be_bytes(segment[14..16].try_into()?);
        self.checksum = u16::from_be_bytes(segment[16..18].try_into()?);
        self.urg_pointer = u16::from_be_bytes(segment[18..20].try_into()?);
        self.option_raw = segment[20..offset_bytes].to_vec();
        self.option.read(&self.option_raw)?;
        self.payload = segment[offset_bytes..].to_vec();
        self.validate()?;

        Ok(self.valid)
    }

    fn calc_header_checksum(&self) -> u16 {
        let mut header = self.create_header();
        // checksum field is zero while summing
        header[16] = 0;
        header[17] = 0;
        let sum = compute_ipv4_checksum(&self.create_pseudo_header(), 0);
        let sum = compute_ipv4_checksum(&header, sum);
        finalize_ipv4_checksum(compute_ipv4_checksum(&self.payload, sum))
    }

    fn calc_header_checksum_and_set(&mut self) {
        self.checksum = self.calc_header_checksum();
    }

    pub fn validate(&mut self) -> Result<bool> {
        self.valid = true;
        if Ipv4Type::from(self.protocol) != Ipv4Type::TCP {
            log::error!("Reading none TCP packet (proto {}) as TCP.", self.protocol);
            self.valid = false;
        }
        let expected_checksum = self.calc_header_checksum();
        if self.checksum != expected_checksum {
            log::debug!(
                "Unexpected tcp header. Header checksum is 0x{:x} but is expected 0x{:x}.",
                self.checksum,
                expected_checksum
            );
            anyhow::bail!(
                "TCP Header has bad checksum 0x{:x}, expected 0x{:x}.",
                self.checksum,
                expected_checksum
            );
        }

        Ok(self.valid)
    }

    pub fn create_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(TCP_HEADER_LENGTH_BASIC + self.option_raw.len());
        header.extend_from_slice(&self.src_port.to_be_bytes());
        header.extend_from_slice(&self.dst_port.to_be_bytes());
        header.extend_from_slice(&self.seq_number.to_be_bytes());
        header.extend_from_slice(&self.ack_number.to_be_bytes());

        let offset_flags = self.flag.bits() as u16 | ((self.offset as u16) << 12);
        header.extend_from_slice(&offset_flags.to_be_bytes());

        header.extend_from_slice(&self.window_size.to_be_bytes());
        header.extend_from_slice(&self.checksum.to_be_bytes());
        header.extend_from_slice(&self.urg_pointer.to_be_bytes());
        header.extend(&self.option_raw);

        header
    }

    fn create_pseudo_header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(&self.src_addr);
        header.extend_from_slice(&self.dst_addr);
        header.extend_from_slice(&(self.protocol as u16).to_be_bytes());
        header.extend_from_slice(&self.tcp_length.to_be_bytes());

        header
    }

    pub fn create_packet(&mut self) -> Vec<u8> {
        self.set_packet_params();
        let mut packet = self.create_header();
        packet.extend_from_slice(&self.payload);

        packet
    }

    // Serialize into a whole IPv4 datagram.
    pub fn create_datagram(&mut self, ttl: u8, identification: u16) -> Vec<u8> {
        let segment = self.create_packet();
        Ipv4Packet::new_tcp(
            Ipv4Addr::from(self.src_addr),
            Ipv4Addr::from(self.dst_addr),
            ttl,
            identification,
            segment,
        )
        .create_packet()
    }

    fn set_packet_params(&mut self) {
        // set option_raw, tcp_length, offset and checksum
        self.option_raw = self.option.create_packet_option();
        self.offset = ((TCP_HEADER_LENGTH_BASIC + self.option_raw.len()) / 4) as u8;
        self.tcp_length =
            (TCP_HEADER_LENGTH_BASIC + self.option_raw.len() + self.payload.len()) as u16;
        self.calc_header_checksum_and_set()
    }

    // Addressing for an answer to this segment, used when no session exists.
    pub fn reply_tuple(&self) -> FourTuple {
        FourTuple {
            src_addr: Ipv4Addr::from(self.dst_addr),
            src_port: self.dst_port,
            dst_addr: Ipv4Addr::from(self.src_addr),
            dst_port: self.src_port,
        }
    }

    // Sequence space consumed by this segment, SYN and FIN count one each.
    pub fn seg_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flag.contains(TcpFlag::SYN) {
            len += 1;
        }
        if self.flag.contains(TcpFlag::FIN) {
            len += 1;
        }
        len
    }

    pub fn print_general_info(&self) -> String {
        format!(
            "SEGINFO: SRC={}:{} DST={}:{} SEQ={} ACK={} LENGTH={} WND(RAW)={} FLAG={:?}",
            Ipv4Addr::from(self.src_addr),
            self.src_port,
            Ipv4Addr::from(self.dst_addr),
            self.dst_port,
            self.seq_number,
            self.ack_number,
            self.payload.len(),
            self.window_size,
            self.flag
        )
    }
}

bitflags! {
    #[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
    pub struct TcpFlag: u8 {
        const FIN = 0b00_00_00_01; // No more data from sender.
        const SYN = 0b00_00_00_10; // Synchronize sequence numbers.
        const RST = 0b00_00_01_00; // Reset the connection.
        const PSH = 0b00_00_10_00; // Push function
        const ACK = 0b00_01_00_00; // Acknowledgment field
        const URG = 0b00_10_00_00; // Urgent pointer field
        const ECE = 0b01_00_00_00; // ECN-Echo
        const CWR = 0b10_00_00_00; // Congestion Window Reduced
    }
}

// Only MSS and window scale are interpreted, anything else is skipped by its length.
#[derive(Default, Debug, PartialEq, Clone)]
pub struct TcpOption {
    pub mss: Option<u16>,         // kind=2 Maximum Segment Size  2 bytes
    pub window_scale: Option<u8>, // kind=3 Window Scale Option   1 bytes
}

impl TcpOption {
    pub fn new() -> Self {
        Self {
            mss: None,
            window_scale: None,
        }
    }

    pub fn read(&mut self, option: &[u8]) -> Result<()> {
        let mut offset: usize = 0;
        let length = option.len();
        while offset < length {
            let kind = option[offset];
            match TcpOptionKind::from(kind) {
                // Everything after the end of option list is padding.
                TcpOptionKind::EndOption => break,
                TcpOptionKind::NoOperation => {
                    offset += 1;
                }
                TcpOptionKind::MaxSegmentSize => {
                    anyhow::ensure!(
                        offset + 4 <= length,
                        "MaxSegmentSize needs 4 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1];
                    anyhow::ensure!(
                        len == 4,
                        "Length field of MaxSegmentSize must be 4 but is {}.",
                        len
                    );
                    self.mss = Some(u16::from_be_bytes(
                        option[offset + 2..offset + 4].try_into()?,
                    ));
                    offset += 4;
                }
                TcpOptionKind::WindowScale => {
                    anyhow::ensure!(
                        offset + 3 <= length,
                        "WindowScale needs 3 bytes but only {} bytes left.",
                        length - offset
                    );
                    let len = option[offset + 1];
                    anyhow::ensure!(
                        len == 3,
                        "Length field of WindowScale must be 3 but is {}.",
                        len
                    );
                    self.window_scale = Some(option[offset + 2]);
                    offset += 3;
                }
                TcpOptionKind::Unknown => {
                    log::trace!("Skipping tcp option. kind: {}", kind);
                    anyhow::ensure!(
                        offset + 2 <= length,
                        "Option kind {} needs at least 2 bytes but only {} bytes left.",
                        kind,
                        length - offset
                    );
                    let len = option[offset + 1] as usize;
                    anyhow::ensure!(
                        len >= 2 && offset + len <= length,
                        "Length field of option kind {} is {} but only {} bytes left.",
                        kind,
                        len,
                        length - offset
                    );
                    offset += len;
                }
            }
        }

        Ok(())
    }

    fn create_packet_option(&self) -> Vec<u8> {
        let mut packet = Vec::new();
        if let Some(mss) = self.mss {
            packet.push(u8::from(TcpOptionKind::MaxSegmentSize));
            packet.push(4);
            packet.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(window) = self.window_scale {
            packet.push(u8::from(TcpOptionKind::NoOperation));
            packet.push(u8::from(TcpOptionKind::WindowScale));
            packet.push(3);
            packet.push(window);
        }
        let len = packet.len();
        let mut padding = vec![u8::from(TcpOptionKind::NoOperation); (4 - len % 4) % 4];
        packet.append(&mut padding);

        packet
    }
}
