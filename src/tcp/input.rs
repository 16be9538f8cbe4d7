use crate::l2_l3::{
    defs::{Ipv4Type, L3Error},
    ip::Ipv4Packet,
};
use crate::tcp::{
    buffer::SessionBuffer,
    config::{ToeConfig, MAX_WINDOW_SHIFT},
    defs::{AppNotification, EventType, LookupSource, OpenStatus, SessionId, SessionState, ThreeTuple},
    event::{Event, EventMergerHandle, EventSource},
    packet::{TcpFlag, TcpPacket},
    port_table::PortTableHandle,
    rx_sar::{RxSarHandle, RxSarReply},
    seq::{seq_greater_than, seq_in_window},
    service::Service,
    session_lookup::SessionLookupHandle,
    state_table::StateTableHandle,
    stats::{inc, ToeCounters},
    timer::TimerHandle,
    tx_sar::{RxTxSarUpdate, TxSarHandle, TxSarRxReply},
};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{mpsc::Sender, Arc};

const RX_ENGINE: &str = "rx engine";
// Congestion avoidance growth per new ACK, roughly MSS/4.
const CWND_LINEAR_INCREMENT: u32 = 365;
const DUPLICATE_ACK_THRESHOLD: u8 = 3;

// Control bits as dispatched on: RST FIN SYN ACK.
const CTL_ACK: u8 = 0b0001;
const CTL_SYN: u8 = 0b0010;
const CTL_SYN_ACK: u8 = 0b0011;
const CTL_FIN_ACK: u8 = 0b0101;

fn control_bits(flag: TcpFlag) -> u8 {
    [TcpFlag::ACK, TcpFlag::SYN, TcpFlag::FIN, TcpFlag::RST]
        .iter()
        .enumerate()
        .filter(|(_, f)| flag.contains(**f))
        .fold(0, |bits, (i, _)| bits | 1 << i)
}

// Slow start below the threshold, linear growth above, capped at `cwnd_max`.
pub fn grow_congestion_window(cwnd: u32, ssthresh: u32, mss: u32, cwnd_max: u32) -> u32 {
    if cwnd <= ssthresh.saturating_sub(mss) {
        cwnd + mss
    } else if cwnd <= cwnd_max {
        cwnd + CWND_LINEAR_INCREMENT
    } else {
        cwnd
    }
}

/// Reset for a segment which matches no open port or session. rfc9293 3.10.7.1
pub fn reset_for_unknown(segment: &TcpPacket) -> Option<Event> {
    if segment.flag.contains(TcpFlag::RST) {
        return None;
    }
    if segment.flag.contains(TcpFlag::ACK) {
        Some(Event::rst_to(segment.reply_tuple(), segment.ack_number))
    } else {
        Some(Event::rst_ack_to(
            segment.reply_tuple(),
            segment.seq_number.wrapping_add(segment.seg_len()),
        ))
    }
}

// (our receive shift, peer send shift). Both stay 0 unless both sides scale.
pub fn window_shifts(config: &ToeConfig, segment: &TcpPacket) -> (u8, u8) {
    match (config.window_scale, segment.option.window_scale) {
        (true, Some(peer)) => (config.rx_window_shift(), peer.min(MAX_WINDOW_SHIFT)),
        _ => (0, 0),
    }
}

/// Receive side of the engine. Owns nothing but its handles, every decision is taken on a
/// locked state table row.
pub struct RxEngine {
    config: ToeConfig,
    ports: PortTableHandle,
    lookup: SessionLookupHandle,
    state: StateTableHandle,
    rx_sar: RxSarHandle,
    tx_sar: TxSarHandle,
    timers: TimerHandle,
    merger: EventMergerHandle,
    rx_buffer: Arc<SessionBuffer>,
    notifications: Sender<AppNotification>,
    open_status: Sender<OpenStatus>,
    counters: Arc<ToeCounters>,
}

// A segment which passed all checks, with where it came from.
struct Received<'a> {
    segment: &'a TcpPacket,
    id: SessionId,
    remote: SocketAddrV4,
}

impl Received<'_> {
    fn len(&self) -> u32 {
        self.segment.payload.len() as u32
    }

    fn seq(&self) -> u32 {
        self.segment.seq_number
    }

    fn ack(&self) -> u32 {
        self.segment.ack_number
    }

    fn notification(&self) -> AppNotification {
        AppNotification {
            session_id: self.id,
            length: 0,
            remote_addr: self.remote,
            opened: false,
            closed: false,
        }
    }
}

impl RxEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ToeConfig,
        ports: PortTableHandle,
        lookup: SessionLookupHandle,
        state: StateTableHandle,
        rx_sar: RxSarHandle,
        tx_sar: TxSarHandle,
        timers: TimerHandle,
        merger: EventMergerHandle,
        rx_buffer: Arc<SessionBuffer>,
        notifications: Sender<AppNotification>,
        open_status: Sender<OpenStatus>,
        counters: Arc<ToeCounters>,
    ) -> Self {
        Self {
            config,
            ports,
            lookup,
            state,
            rx_sar,
            tx_sar,
            timers,
            merger,
            rx_buffer,
            notifications,
            open_status,
            counters,
        }
    }

    /// IPv4 and TCP checks. None means the datagram is dropped.
    fn parse(&self, datagram: &[u8]) -> Option<TcpPacket> {
        let mut ipv4_packet = Ipv4Packet::new();
        match ipv4_packet.read(datagram) {
            Err(e) => {
                log::warn!("Failed to read ipv4 packet. Err: {:?}", e);
                inc(&self.counters.in_errs);
                return None;
            }
            Ok(false) => {
                log::warn!("Discarding invalid ipv4 packet.");
                inc(&self.counters.in_errs);
                return None;
            }
            Ok(true) => {}
        }
        if Ipv4Type::from(ipv4_packet.protocol) != Ipv4Type::TCP {
            log::debug!(
                "{}",
                L3Error::UnsupportedProtocol {
                    proto: ipv4_packet.protocol
                }
            );
            return None;
        }
        if ipv4_packet.dst() != self.config.local_addr {
            log::debug!(
                "{}",
                L3Error::NotForUs {
                    target_ip: ipv4_packet.dst(),
                    local_ip: self.config.local_addr
                }
            );
            return None;
        }
        let mut tcp_packet = TcpPacket::new();
        match tcp_packet.read(&ipv4_packet) {
            Err(e) => {
                log::warn!("Failed to read tcp packet. Err: {:?}", e);
                inc(&self.counters.in_errs);
                None
            }
            Ok(false) => {
                log::warn!("Discarding invalid tcp packet.");
                inc(&self.counters.in_errs);
                None
            }
            Ok(true) => {
                inc(&self.counters.in_segs);
                Some(tcp_packet)
            }
        }
    }

    fn push(&self, event: Event) -> Result<()> {
        self.merger.push(EventSource::Rx, event)
    }

    fn notify_app(&self, notification: AppNotification) -> Result<()> {
        self.notifications
            .send(notification)
            .context("Notification receiver is gone.")
    }

    fn process(&self, segment: &TcpPacket) -> Result<()> {
        log::debug!("{}", segment.print_general_info());
        let their_addr = Ipv4Addr::from(segment.src_addr);
        if !self.ports.check(segment.dst_port)? {
            log::debug!(
                "Port {} is not open. SEG.FLAG={:?}",
                segment.dst_port,
                segment.flag
            );
            return self.reset_unknown(segment);
        }
        let tuple = ThreeTuple::new(their_addr, segment.dst_port, segment.src_port);
        let flag = segment.flag;
        let allow_creation = flag.contains(TcpFlag::SYN)
            && !flag.contains(TcpFlag::RST)
            && !flag.contains(TcpFlag::FIN);
        let reply = self.lookup.lookup(tuple, allow_creation, LookupSource::Rx)?;
        if !reply.hit {
            log::debug!("No session for {}. SEG.FLAG={:?}", tuple, flag);
            return self.reset_unknown(segment);
        }
        let received = Received {
            segment,
            id: reply.session_id,
            remote: SocketAddrV4::new(their_addr, segment.src_port),
        };
        match control_bits(flag) {
            CTL_ACK => self.on_ack(&received),
            CTL_SYN => self.on_syn(&received),
            CTL_SYN_ACK => self.on_syn_ack(&received),
            CTL_FIN_ACK => self.on_fin(&received),
            _ => self.on_other(&received),
        }
    }

    fn reset_unknown(&self, segment: &TcpPacket) -> Result<()> {
        match reset_for_unknown(segment) {
            Some(event) => self.push(event),
            None => Ok(()),
        }
    }

    fn load(&self, id: SessionId) -> Result<(SessionState, RxSarReply, TxSarRxReply)> {
        let state = self.state.lock(LookupSource::Rx, id)?;
        let rx_sar = self.rx_sar.get(id)?;
        let tx_sar = self.tx_sar.rx_get(id)?;
        Ok((state, rx_sar, tx_sar))
    }

    fn commit(&self, id: SessionId, old: SessionState, new: SessionState) -> Result<()> {
        if old != new {
            log::debug!("[id={} state={}] -> {}", id, old, new);
        }
        self.state.set(LookupSource::Rx, id, new)
    }

    // In order payload which fits the window goes to the buffer. Returns whether it was taken.
    fn accept_payload(&self, seg: &Received, rx_sar: &RxSarReply, recvd: u32) -> Result<bool> {
        if seg.seq() != rx_sar.recvd || rx_sar.window_size < seg.len() {
            log::debug!(
                "[id={}] Dropping payload. SEG.SEQ={} SEG.LEN={} RCV.NXT={} RCV.WND={}",
                seg.id,
                seg.seq(),
                seg.len(),
                rx_sar.recvd,
                rx_sar.window_size
            );
            return Ok(false);
        }
        self.rx_buffer
            .write(seg.id, seg.seq(), &seg.segment.payload)?;
        self.rx_sar.set_recvd(seg.id, recvd)?;
        Ok(true)
    }

    fn on_ack(&self, seg: &Received) -> Result<()> {
        let id = seg.id;
        let (state, rx_sar, mut tx_sar) = self.load(id)?;
        let ack = seg.ack();
        let all_acked = ack == tx_sar.next_byte;
        let accepting = matches!(
            state,
            SessionState::Established
                | SessionState::SynReceived
                | SessionState::FinWait1
                | SessionState::FinWait2
                | SessionState::Closing
                | SessionState::LastAck
        );
        if accepting && seq_greater_than(ack, tx_sar.next_byte) {
            // Acknowledges something not yet sent. rfc9293 3.10.7.4
            log::debug!(
                "[id={} state={}] ACK for unsent data. SEG.ACK={} SND.NXT={}",
                id,
                state,
                ack,
                tx_sar.next_byte
            );
            self.push(Event::new(EventType::AckNodelay, id))?;
            return self.commit(id, state, state);
        }
        self.timers.clear_retransmit(id, all_acked)?;
        if !accepting {
            log::debug!(
                "[id={} state={}] Unexpected ACK, sending reset. SEG.SEQ={} SEG.ACK={}",
                id,
                state,
                seg.seq(),
                ack
            );
            self.push(Event::rst_ack(id, seg.seq().wrapping_add(seg.len())))?;
            return self.commit(id, state, state);
        }

        let in_window = seq_in_window(ack, tx_sar.prev_ack, tx_sar.next_byte);
        let fast_retransmitted = tx_sar.fast_retransmitted;
        let mut new_ack = false;
        if ack == tx_sar.prev_ack && tx_sar.prev_ack != tx_sar.next_byte {
            // Only pure ACKs count as duplicates. rfc5681 2
            if seg.len() == 0 {
                tx_sar.count = tx_sar.count.saturating_add(1);
            }
        } else if in_window && ack != tx_sar.prev_ack {
            self.timers.clear_probe(id)?;
            tx_sar.cong_window = grow_congestion_window(
                tx_sar.cong_window,
                tx_sar.slowstart_threshold,
                self.config.mss as u32,
                self.config.congestion_window_max(),
            );
            tx_sar.count = 0;
            tx_sar.fast_retransmitted = false;
            new_ack = true;
        }
        if in_window {
            self.tx_sar.rx_update(
                id,
                RxTxSarUpdate {
                    ack,
                    recv_window: seg.segment.window_size,
                    cong_window: tx_sar.cong_window,
                    count: tx_sar.count,
                    fast_retransmitted: tx_sar.count == DUPLICATE_ACK_THRESHOLD
                        || tx_sar.fast_retransmitted,
                    win_shift: None,
                },
            )?;
        }
        if new_ack && !self.config.tcp_nodelay {
            // Unsent data may have been waiting for this ACK. Goes after the SAR update.
            self.push(Event::tx(id, 0))?;
        }

        let mut notification = None;
        if seg.len() > 0 {
            let recvd = seg.seq().wrapping_add(seg.len());
            if self.accept_payload(seg, &rx_sar, recvd)? {
                notification = Some(AppNotification {
                    length: seg.len() as u16,
                    ..seg.notification()
                });
            }
        }
        if self.config.fast_retransmit
            && tx_sar.count == DUPLICATE_ACK_THRESHOLD
            && !fast_retransmitted
        {
            log::debug!("[id={} state={}] Fast retransmit at SEG.ACK={}.", id, state, ack);
            self.push(Event::new(EventType::Rt, id))?;
        } else if seg.len() > 0 {
            self.push(Event::new(EventType::Ack, id))?;
        }

        let mut new_state = state;
        if all_acked {
            match state {
                SessionState::SynReceived => {
                    new_state = SessionState::Established;
                    notification.get_or_insert_with(|| seg.notification()).opened = true;
                    log::info!("[id={}] Connection with {} established.", id, seg.remote);
                }
                SessionState::Closing => {
                    new_state = SessionState::TimeWait;
                    self.timers.set_close(id)?;
                }
                SessionState::LastAck => {
                    new_state = SessionState::Closed;
                    notification.get_or_insert_with(|| seg.notification()).closed = true;
                    log::info!("[id={}] Connection with {} closed.", id, seg.remote);
                }
                SessionState::FinWait1 if tx_sar.fin_sent => {
                    new_state = SessionState::FinWait2;
                }
                _ => {}
            }
        }
        self.commit(id, state, new_state)?;
        if let Some(notification) = notification {
            self.notify_app(notification)?;
        }
        Ok(())
    }

    fn on_syn(&self, seg: &Received) -> Result<()> {
        let id = seg.id;
        let (state, rx_sar, tx_sar) = self.load(id)?;
        match state {
            // LISTEN is CLOSED with an open port.
            SessionState::Closed | SessionState::SynSent => {
                let (rx_shift, tx_shift) = window_shifts(&self.config, seg.segment);
                self.rx_sar
                    .init(id, seg.seq().wrapping_add(1), rx_shift)?;
                self.tx_sar.rx_update(
                    id,
                    RxTxSarUpdate {
                        ack: tx_sar.prev_ack,
                        recv_window: seg.segment.window_size,
                        cong_window: tx_sar.cong_window,
                        count: 0,
                        fast_retransmitted: false,
                        win_shift: Some(tx_shift),
                    },
                )?;
                self.push(Event::new(EventType::SynAck, id))?;
                self.commit(id, state, SessionState::SynReceived)
            }
            SessionState::SynReceived => {
                if seg.seq().wrapping_add(1) == rx_sar.recvd {
                    log::debug!("[id={} state={}] Duplicate SYN, resending SYN-ACK.", id, state);
                    self.push(Event::retransmit(EventType::SynAck, id, 1))?;
                    self.commit(id, state, state)
                } else {
                    // Old duplicate SYN. rfc9293 figure 8
                    // The session is gone before the reset goes out, so address it directly.
                    self.push(Event::rst_ack_to(
                        seg.segment.reply_tuple(),
                        seg.seq().wrapping_add(1),
                    ))?;
                    inc(&self.counters.attempt_fails);
                    self.commit(id, state, SessionState::Closed)
                }
            }
            _ => {
                // Challenge ACK. rfc5961 4.2
                self.push(Event::new(EventType::AckNodelay, id))?;
                self.commit(id, state, state)
            }
        }
    }

    fn on_syn_ack(&self, seg: &Received) -> Result<()> {
        let id = seg.id;
        let (state, _, tx_sar) = self.load(id)?;
        let ack = seg.ack();
        self.timers.clear_retransmit(id, ack == tx_sar.next_byte)?;
        if state == SessionState::SynSent && ack == tx_sar.next_byte {
            let (rx_shift, tx_shift) = window_shifts(&self.config, seg.segment);
            self.rx_sar
                .init(id, seg.seq().wrapping_add(1), rx_shift)?;
            self.tx_sar.rx_update(
                id,
                RxTxSarUpdate {
                    ack,
                    recv_window: seg.segment.window_size,
                    cong_window: tx_sar.cong_window,
                    count: 0,
                    fast_retransmitted: false,
                    win_shift: Some(tx_shift),
                },
            )?;
            self.push(Event::new(EventType::AckNodelay, id))?;
            self.commit(id, state, SessionState::Established)?;
            log::info!("[id={}] Connection to {} established.", id, seg.remote);
            self.open_status
                .send(OpenStatus {
                    session_id: id,
                    success: true,
                })
                .context("Open status receiver is gone.")
        } else if !state.is_synchronized() {
            // <SEQ=SEG.ACK><CTL=RST> rfc9293 3.5.2
            self.push(Event::rst(id, ack))?;
            self.commit(id, state, state)
        } else {
            self.push(Event::new(EventType::AckNodelay, id))?;
            self.commit(id, state, state)
        }
    }

    fn on_fin(&self, seg: &Received) -> Result<()> {
        let id = seg.id;
        let (state, rx_sar, tx_sar) = self.load(id)?;
        let ack = seg.ack();
        let all_acked = ack == tx_sar.next_byte;
        self.timers.clear_retransmit(id, all_acked)?;
        let accepting = matches!(
            state,
            SessionState::Established | SessionState::FinWait1 | SessionState::FinWait2
        );
        // Out of order FINs are not accepted.
        if !accepting || rx_sar.recvd != seg.seq() || rx_sar.window_size < seg.len() {
            self.push(Event::new(EventType::Ack, id))?;
            return self.commit(id, state, state);
        }

        let in_window = seq_in_window(ack, tx_sar.prev_ack, tx_sar.next_byte);
        self.tx_sar.rx_update(
            id,
            RxTxSarUpdate {
                ack: if in_window { ack } else { tx_sar.prev_ack },
                recv_window: seg.segment.window_size,
                cong_window: tx_sar.cong_window,
                count: tx_sar.count,
                fast_retransmitted: tx_sar.fast_retransmitted,
                win_shift: None,
            },
        )?;
        self.timers.clear_probe(id)?;
        let data_end = seg.seq().wrapping_add(seg.len());
        let mut notification = None;
        if seg.len() > 0 {
            self.accept_payload(seg, &rx_sar, data_end)?;
            notification = Some(AppNotification {
                length: seg.len() as u16,
                ..seg.notification()
            });
        }
        // One more for the FIN.
        self.rx_sar.set_fin(id, data_end.wrapping_add(1))?;

        let new_state = if state == SessionState::Established {
            self.push(Event::new(EventType::Fin, id))?;
            SessionState::LastAck
        } else {
            self.push(Event::new(EventType::Ack, id))?;
            if all_acked && tx_sar.fin_sent {
                self.timers.set_close(id)?;
                SessionState::TimeWait
            } else {
                SessionState::Closing
            }
        };
        self.commit(id, state, new_state)?;
        if let Some(notification) = notification {
            self.notify_app(notification)?;
        }
        Ok(())
    }

    fn on_other(&self, seg: &Received) -> Result<()> {
        let id = seg.id;
        let (state, rx_sar, tx_sar) = self.load(id)?;
        if !seg.segment.flag.contains(TcpFlag::RST) {
            log::debug!(
                "[id={} state={}] Ignoring segment. SEG.FLAG={:?}",
                id,
                state,
                seg.segment.flag
            );
            return self.commit(id, state, state);
        }

        if state == SessionState::SynSent {
            if seg.segment.flag.contains(TcpFlag::ACK) && seg.ack() == tx_sar.next_byte {
                log::info!("[id={}] Connection to {} refused.", id, seg.remote);
                inc(&self.counters.attempt_fails);
                self.commit(id, state, SessionState::Closed)?;
                self.open_status
                    .send(OpenStatus {
                        session_id: id,
                        success: false,
                    })
                    .context("Open status receiver is gone.")?;
            } else {
                self.commit(id, state, state)?;
            }
            return Ok(());
        }

        if seg.seq() != rx_sar.recvd {
            log::debug!(
                "[id={} state={}] Ignoring RST outside the window. SEG.SEQ={} RCV.NXT={}",
                id,
                state,
                seg.seq(),
                rx_sar.recvd
            );
            return self.commit(id, state, state);
        }
        log::info!("[id={} state={}] Connection reset by {}.", id, state, seg.remote);
        match state {
            SessionState::SynReceived => inc(&self.counters.attempt_fails),
            SessionState::Established => inc(&self.counters.estab_resets),
            _ => {}
        }
        self.commit(id, state, SessionState::Closed)?;
        // The application only knows sessions it was told were opened.
        if state.is_synchronized() {
            self.notify_app(AppNotification {
                closed: true,
                ..seg.notification()
            })?;
        }
        Ok(())
    }
}

impl Service for RxEngine {
    type Msg = Vec<u8>;

    fn name(&self) -> &'static str {
        RX_ENGINE
    }

    fn handle(&mut self, datagram: Vec<u8>) -> Result<()> {
        match self.parse(&datagram) {
            Some(segment) => self.process(&segment),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod input_tests {
    use super::*;
    use crate::tcp::defs::FourTuple;
    use rstest::rstest;

    fn segment(flag: TcpFlag, seq: u32, ack: u32, payload: usize) -> TcpPacket {
        let tuple = FourTuple {
            src_addr: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 40000,
            dst_addr: Ipv4Addr::new(10, 0, 0, 1),
            dst_port: 80,
        };
        let mut segment = TcpPacket::new_segment(&tuple, seq, ack, flag);
        segment.payload = vec![0; payload];
        segment
    }

    #[rstest]
    #[case(TcpFlag::ACK, CTL_ACK)]
    #[case(TcpFlag::ACK | TcpFlag::PSH, CTL_ACK)]
    #[case(TcpFlag::SYN, CTL_SYN)]
    #[case(TcpFlag::SYN | TcpFlag::ACK, CTL_SYN_ACK)]
    #[case(TcpFlag::FIN | TcpFlag::ACK | TcpFlag::PSH, CTL_FIN_ACK)]
    #[case(TcpFlag::FIN, 0b0100)]
    #[case(TcpFlag::RST | TcpFlag::ACK, 0b1001)]
    fn test_control_bits(#[case] flag: TcpFlag, #[case] expected: u8) {
        assert_eq!(control_bits(flag), expected);
    }

    #[rstest]
    // slow start
    #[case(14600, 0xffff, 16060)]
    #[case(1460, 2920, 2920)]
    // threshold reached, linear growth
    #[case(2920, 2920, 3285)]
    // capped
    #[case(64100, 0xffff, 64100)]
    fn test_grow_congestion_window(#[case] cwnd: u32, #[case] ssthresh: u32, #[case] expected: u32) {
        assert_eq!(grow_congestion_window(cwnd, ssthresh, 1460, 0xffff - 2048), expected);
    }

    #[rstest]
    // SYN to a closed port: <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>
    #[case(TcpFlag::SYN, 1000, 0, 0, Some((EventType::RstAck, 1001)))]
    #[case(TcpFlag::FIN | TcpFlag::PSH, 1000, 0, 10, Some((EventType::RstAck, 1011)))]
    // ACK set: <SEQ=SEG.ACK><CTL=RST>
    #[case(TcpFlag::ACK, 1000, 5555, 10, Some((EventType::Rst, 5555)))]
    // never answer a reset
    #[case(TcpFlag::RST, 1000, 0, 0, None)]
    #[case(TcpFlag::RST | TcpFlag::ACK, 1000, 5555, 0, None)]
    fn test_reset_for_unknown(
        #[case] flag: TcpFlag,
        #[case] seq: u32,
        #[case] ack: u32,
        #[case] payload: usize,
        #[case] expected: Option<(EventType, u32)>,
    ) {
        let segment = segment(flag, seq, ack, payload);
        let event = reset_for_unknown(&segment);
        assert_eq!(event.map(|e| (e.kind, e.number)), expected);
        if let Some(event) = event {
            assert!(!event.has_session());
            let tuple = event.tuple.unwrap();
            assert_eq!(tuple.src_port, 80);
            assert_eq!(tuple.dst_addr, Ipv4Addr::new(10, 0, 0, 2));
        }
    }

    #[rstest]
    #[case(false, Some(7), (0, 0))]
    #[case(true, None, (0, 0))]
    #[case(true, Some(7), (2, 7))]
    #[case(true, Some(20), (2, 14))]
    fn test_window_shifts(
        #[case] window_scale: bool,
        #[case] offered: Option<u8>,
        #[case] expected: (u8, u8),
    ) {
        let config = ToeConfig {
            window_scale,
            ..Default::default()
        };
        let mut segment = segment(TcpFlag::SYN, 0, 0, 0);
        segment.option.window_scale = offered;
        assert_eq!(window_shifts(&config, &segment), expected);
    }
}
