use std::fmt::{self, Display};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub type SessionId = u16;

// https://www.iana.org/assignments/tcp-parameters/tcp-parameters.xhtml
pub enum TcpOptionKind {
    // 8 bit
    EndOption = 0x00,      // mandatory
    NoOperation = 0x01,    // mandatory, used for word boundary align
    MaxSegmentSize = 0x02, // mandatory
    WindowScale = 0x3,     // https://datatracker.ietf.org/doc/html/rfc7323#section-2
    Unknown,
}

impl From<u8> for TcpOptionKind {
    fn from(value: u8) -> Self {
        match value {
            v if v == TcpOptionKind::EndOption as u8 => TcpOptionKind::EndOption,
            v if v == TcpOptionKind::NoOperation as u8 => TcpOptionKind::NoOperation,
            v if v == TcpOptionKind::MaxSegmentSize as u8 => TcpOptionKind::MaxSegmentSize,
            v if v == TcpOptionKind::WindowScale as u8 => TcpOptionKind::WindowScale,
            _ => TcpOptionKind::Unknown,
        }
    }
}

impl From<TcpOptionKind> for u8 {
    fn from(t: TcpOptionKind) -> Self {
        t as u8
    }
}

// LISTEN is not stored, it is CLOSED plus an open listening port.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum SessionState {
    #[default]
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    LastAck,
}

impl SessionState {
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            SessionState::Closed | SessionState::SynSent | SessionState::SynReceived
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "CLOSED"),
            SessionState::SynSent => write!(f, "SYN-SENT"),
            SessionState::SynReceived => write!(f, "SYN-RECEIVED"),
            SessionState::Established => write!(f, "ESTABLISHED"),
            SessionState::FinWait1 => write!(f, "FIN-WAIT-1"),
            SessionState::FinWait2 => write!(f, "FIN-WAIT-2"),
            SessionState::Closing => write!(f, "CLOSING"),
            SessionState::TimeWait => write!(f, "TIME-WAIT"),
            SessionState::LastAck => write!(f, "LAST-ACK"),
        }
    }
}

/// Key of the session table, seen from this host.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct ThreeTuple {
    pub their_addr: Ipv4Addr,
    pub my_port: u16,
    pub their_port: u16,
}

impl ThreeTuple {
    pub fn new(their_addr: Ipv4Addr, my_port: u16, their_port: u16) -> Self {
        Self {
            their_addr,
            my_port,
            their_port,
        }
    }
}

impl Display for ThreeTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "local=*:{} remote={}:{}",
            self.my_port, self.their_addr, self.their_port
        )
    }
}

/// Addressing of an egress segment. `src_*` is always this host.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct FourTuple {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

impl FourTuple {
    pub fn from_three(local_addr: Ipv4Addr, tuple: ThreeTuple) -> Self {
        Self {
            src_addr: local_addr,
            src_port: tuple.my_port,
            dst_addr: tuple.their_addr,
            dst_port: tuple.their_port,
        }
    }

    pub fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_addr, self.dst_port)
    }
}

impl Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "local={}:{} remote={}:{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// Who is asking a shared table. Replies and row locks are tagged with it.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum LookupSource {
    Rx,
    TxApp,
}

impl Display for LookupSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LookupSource::Rx => write!(f, "RX"),
            LookupSource::TxApp => write!(f, "TX-APP"),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum EventType {
    Syn,
    SynAck,
    Ack,
    AckNodelay,
    Fin,
    Rst,
    RstAck,
    Tx,
    Rt,
}

impl Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventType::Syn => write!(f, "SYN"),
            EventType::SynAck => write!(f, "SYN-ACK"),
            EventType::Ack => write!(f, "ACK"),
            EventType::AckNodelay => write!(f, "ACK-NODELAY"),
            EventType::Fin => write!(f, "FIN"),
            EventType::Rst => write!(f, "RST"),
            EventType::RstAck => write!(f, "RST-ACK"),
            EventType::Tx => write!(f, "TX"),
            EventType::Rt => write!(f, "RT"),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum SendError {
    None,
    NoConnection,
    NoSpace,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct SendResponse {
    pub session_id: SessionId,
    pub length: u16,
    pub remaining_space: u32,
    pub error: SendError,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct AppNotification {
    pub session_id: SessionId,
    pub length: u16,
    pub remote_addr: SocketAddrV4,
    pub opened: bool,
    pub closed: bool,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct OpenStatus {
    pub session_id: SessionId,
    pub success: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum TcpError {
    #[error("Session (id={id}) is not a valid session.")]
    InvalidSession { id: SessionId },
    #[error("Cannot open a connection to {addr}.")]
    InvalidDestination { addr: Ipv4Addr },
    #[error("No free ephemeral port is left.")]
    NoFreePort,
    #[error("No free session id is left. max_sessions={max}")]
    NoFreeSession { max: u16 },
    #[error("Connection to {addr} could not be opened.")]
    OpenFailed { addr: SocketAddrV4 },
    #[error("Port {port} cannot be opened for listening.")]
    ListenDenied { port: u16 },
    #[error("Timed out while waiting for {what}.")]
    Timeout { what: &'static str },
}
