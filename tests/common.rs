#![allow(dead_code)]
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use toe_r::{
    l2_l3::ip::Ipv4Packet,
    tcp::{
        config::ToeConfig,
        defs::{AppNotification, FourTuple, OpenStatus, SessionId, SessionState},
        packet::{TcpFlag, TcpPacket},
        stats::ToeStats,
        usrreq::Toe,
    },
};

pub const LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const PEER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const SERVER_PORT: u16 = 80;
pub const PEER_PORT: u16 = 40000;
pub const PEER_ISN: u32 = 1000;
pub const PEER_WINDOW: u16 = 0xffff;
pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(150);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// 10ms ticks so that retransmissions and TIME-WAIT are over within a test.
pub fn fast_config() -> ToeConfig {
    ToeConfig {
        local_addr: LOCAL_ADDR,
        timer_tick: Duration::from_millis(10),
        retransmit_timeouts: [20, 40, 60, 80, 100].map(Duration::from_millis),
        probe_interval: Duration::from_millis(10),
        time_wait: Duration::from_millis(50),
        ..Default::default()
    }
}

// Retransmission timer far away, for tests which look at every segment.
pub fn quiet_config() -> ToeConfig {
    ToeConfig {
        retransmit_timeouts: [Duration::from_secs(10); 5],
        ..fast_config()
    }
}

/// A Toe plus the peer side of its wire.
pub struct Harness {
    pub toe: Toe,
    egress: Receiver<Vec<u8>>,
    ingress: Sender<Vec<u8>>,
    ip_id: std::cell::Cell<u16>,
}

/// Peer view of one connection.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub id: SessionId,
    pub local_port: u16,
    pub peer_port: u16,
    // Next sequence number the peer sends.
    pub peer_seq: u32,
    // Next sequence number expected from the engine.
    pub engine_seq: u32,
}

pub fn start(config: ToeConfig) -> Result<Harness> {
    init_logger();
    let (egress_tx, egress) = channel();
    let toe = Toe::new(config, egress_tx)?;
    let ingress = toe.ingress();
    Ok(Harness {
        toe,
        egress,
        ingress,
        ip_id: std::cell::Cell::new(1),
    })
}

impl Harness {
    pub fn segment(
        &self,
        local_port: u16,
        peer_port: u16,
        seq: u32,
        ack: u32,
        flag: TcpFlag,
        payload: &[u8],
    ) -> TcpPacket {
        let tuple = FourTuple {
            src_addr: PEER_ADDR,
            src_port: peer_port,
            dst_addr: LOCAL_ADDR,
            dst_port: local_port,
        };
        let mut segment = TcpPacket::new_segment(&tuple, seq, ack, flag);
        segment.window_size = PEER_WINDOW;
        segment.payload = payload.to_vec();
        segment
    }

    pub fn datagram(&self, mut segment: TcpPacket) -> Vec<u8> {
        let id = self.ip_id.get();
        self.ip_id.set(id.wrapping_add(1));
        segment.create_datagram(64, id)
    }

    pub fn send_raw(&self, datagram: Vec<u8>) -> Result<()> {
        self.ingress
            .send(datagram)
            .context("Engine ingress is gone.")
    }

    pub fn send(&self, segment: TcpPacket) -> Result<()> {
        let datagram = self.datagram(segment);
        self.send_raw(datagram)
    }

    pub fn send_on(&self, conn: &Connection, flag: TcpFlag, payload: &[u8]) -> Result<()> {
        self.send(self.segment(
            conn.local_port,
            conn.peer_port,
            conn.peer_seq,
            conn.engine_seq,
            flag,
            payload,
        ))
    }

    pub fn expect_segment(&self) -> Result<TcpPacket> {
        let datagram = self
            .egress
            .recv_timeout(WAIT)
            .context("No segment from the engine.")?;
        let mut ipv4_packet = Ipv4Packet::new();
        anyhow::ensure!(ipv4_packet.read(&datagram)?, "Engine sent an invalid datagram.");
        anyhow::ensure!(ipv4_packet.src() == LOCAL_ADDR, "Wrong source address.");
        anyhow::ensure!(ipv4_packet.dst() == PEER_ADDR, "Wrong destination address.");
        let mut segment = TcpPacket::new();
        anyhow::ensure!(segment.read(&ipv4_packet)?, "Engine sent an invalid segment.");
        Ok(segment)
    }

    pub fn expect_no_segment(&self) -> Result<()> {
        match self.egress.recv_timeout(QUIET) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Ok(datagram) => anyhow::bail!("Unexpected datagram {}.", hex::encode(datagram)),
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Engine egress is gone."),
        }
    }

    pub fn expect_notification(
        &self,
        mut accept: impl FnMut(&AppNotification) -> bool,
    ) -> Result<AppNotification> {
        let deadline = Instant::now() + WAIT;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.toe.next_notification(left)? {
                Some(notification) if accept(&notification) => return Ok(notification),
                Some(_) => {}
                None => break,
            }
        }
        anyhow::bail!("No matching notification.")
    }

    pub fn expect_no_notification(&self) -> Result<()> {
        match self.toe.next_notification(QUIET)? {
            None => Ok(()),
            Some(notification) => anyhow::bail!("Unexpected notification {:?}.", notification),
        }
    }

    pub fn expect_open_status(&self) -> Result<OpenStatus> {
        self.toe
            .next_open_status(WAIT)?
            .context("No open status.")
    }

    pub fn wait_state(&self, id: SessionId, expected: SessionState) -> Result<()> {
        let deadline = Instant::now() + WAIT;
        loop {
            let state = self.toe.session_state(id)?;
            if state == expected {
                return Ok(());
            }
            anyhow::ensure!(
                Instant::now() < deadline,
                "Session {} is {} instead of {}.",
                id,
                state,
                expected
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    // Counters are bumped by several tasks, so they are polled as well.
    pub fn wait_stats(&self, mut accept: impl FnMut(&ToeStats) -> bool) -> Result<ToeStats> {
        let deadline = Instant::now() + WAIT;
        loop {
            let stats = self.toe.stats();
            if accept(&stats) {
                return Ok(stats);
            }
            anyhow::ensure!(Instant::now() < deadline, "Unexpected counters:\n{}", stats);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Listen, SYN, SYN-ACK, ACK. Returns the connection in ESTABLISHED.
    pub fn passive_open(&self) -> Result<Connection> {
        anyhow::ensure!(self.toe.listen(SERVER_PORT)?, "Listen failed.");
        let mut syn = self.segment(SERVER_PORT, PEER_PORT, PEER_ISN, 0, TcpFlag::SYN, &[]);
        syn.option.mss = Some(1460);
        self.send(syn)?;
        let syn_ack = self.expect_segment()?;
        anyhow::ensure!(
            syn_ack.flag == TcpFlag::SYN | TcpFlag::ACK,
            "Expected SYN-ACK, got {:?}.",
            syn_ack.flag
        );
        anyhow::ensure!(syn_ack.ack_number == PEER_ISN + 1, "Wrong SYN-ACK ack number.");
        let mut conn = Connection {
            id: 0,
            local_port: SERVER_PORT,
            peer_port: PEER_PORT,
            peer_seq: PEER_ISN + 1,
            engine_seq: syn_ack.seq_number.wrapping_add(1),
        };
        self.send_on(&conn, TcpFlag::ACK, &[])?;
        let opened = self.expect_notification(|n| n.opened)?;
        conn.id = opened.session_id;
        self.wait_state(conn.id, SessionState::Established)?;
        Ok(conn)
    }
}
