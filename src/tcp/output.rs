use crate::tcp::{
    buffer::SessionBuffer,
    config::{ToeConfig, WINDOW_SCALE_BITS},
    defs::{EventType, FourTuple, SessionId},
    event::Event,
    isn::IsnGenerator,
    packet::{TcpFlag, TcpOption, TcpPacket},
    rx_sar::{RxSarHandle, RxSarReply},
    service::Service,
    session_lookup::SessionLookupHandle,
    stats::{inc, ToeCounters},
    timer::TimerHandle,
    tx_sar::{TxSarHandle, TxSarTxReply, TxTxSarUpdate},
};
use anyhow::{Context, Result};
use std::sync::{mpsc::Sender, Arc};

const TX_ENGINE: &str = "tx engine";
// Segments resent per RT event.
const MAX_RETRANSMIT_SEGMENTS: u32 = 4;
// SYN and SYN-ACK announce the largest unscaled window. rfc7323 2.2
const SYN_WINDOW: u16 = 0xffff;

/// Slow start threshold after a retransmission timeout, max(FlightSize / 2, 2 * MSS). rfc5681 (4)
pub fn timeout_slowstart_threshold(flight_size: u32, mss: u32) -> u32 {
    if flight_size > 4 * mss {
        flight_size / 2
    } else {
        2 * mss
    }
}

/// What the Nagle send loop decided for one TX event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendPlan {
    // (sequence number, length) of every data segment, in order.
    pub segments: Vec<(u32, u32)>,
    pub not_ackd: u32,
    pub probe: bool,
    pub fin: bool,
}

/// Sends full MSS segments while the usable window allows; a short segment only when nothing is
/// in flight, otherwise the probe timer retries later. rfc9293 3.7.4
pub fn plan_send(tx: &TxSarTxReply, mss: u32) -> SendPlan {
    let mut plan = SendPlan {
        not_ackd: tx.not_ackd,
        ..Default::default()
    };
    let mut usable = tx.usable_window;
    loop {
        let unsent = tx.app.wrapping_sub(plan.not_ackd);
        let idle = tx.ackd == plan.not_ackd;
        let length = if unsent <= usable {
            if unsent >= mss {
                mss
            } else {
                plan.fin = tx.fin_ready && !tx.fin_sent && (idle || unsent == 0);
                if !idle {
                    plan.probe = true;
                }
                let length = if idle { unsent } else { 0 };
                plan.push(length);
                return plan;
            }
        } else if usable >= mss {
            mss
        } else {
            plan.probe = true;
            let length = if idle { usable } else { 0 };
            plan.push(length);
            return plan;
        };
        plan.push(length);
        usable -= length;
    }
}

impl SendPlan {
    fn push(&mut self, length: u32) {
        if length > 0 {
            self.segments.push((self.not_ackd, length));
            self.not_ackd = self.not_ackd.wrapping_add(length);
        }
    }
}

/// Transmit side of the engine: turns each event into zero or more IPv4 datagrams on the egress
/// channel.
pub struct TxEngine {
    config: ToeConfig,
    lookup: SessionLookupHandle,
    rx_sar: RxSarHandle,
    tx_sar: TxSarHandle,
    timers: TimerHandle,
    tx_buffer: Arc<SessionBuffer>,
    isn: IsnGenerator,
    egress: Sender<Vec<u8>>,
    counters: Arc<ToeCounters>,
    ip_id: u16,
}

impl TxEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ToeConfig,
        lookup: SessionLookupHandle,
        rx_sar: RxSarHandle,
        tx_sar: TxSarHandle,
        timers: TimerHandle,
        tx_buffer: Arc<SessionBuffer>,
        isn: IsnGenerator,
        egress: Sender<Vec<u8>>,
        counters: Arc<ToeCounters>,
    ) -> Self {
        Self {
            config,
            lookup,
            rx_sar,
            tx_sar,
            timers,
            tx_buffer,
            isn,
            egress,
            counters,
            ip_id: rand::random(),
        }
    }

    fn mss(&self) -> u32 {
        self.config.mss as u32
    }

    fn advertised_window(rx: &RxSarReply) -> u16 {
        (rx.window_size >> rx.win_shift).min(u16::MAX as u32) as u16
    }

    fn emit(&mut self, mut segment: TcpPacket, retransmission: bool) -> Result<()> {
        log::debug!("{}", segment.print_general_info());
        let datagram = segment.create_datagram(self.config.ttl, self.ip_id);
        self.ip_id = self.ip_id.wrapping_add(1);
        self.egress
            .send(datagram)
            .context("Egress receiver is gone.")?;
        if retransmission {
            inc(&self.counters.retrans_segs);
        } else {
            inc(&self.counters.out_segs);
        }
        Ok(())
    }

    // ACK is set on everything but the first SYN and resets to segments without ACK.
    fn segment(
        tuple: &FourTuple,
        seq: u32,
        rx: &RxSarReply,
        flag: TcpFlag,
        payload: Vec<u8>,
    ) -> TcpPacket {
        let mut segment = TcpPacket::new_segment(tuple, seq, rx.recvd, flag);
        segment.window_size = Self::advertised_window(rx);
        segment.payload = payload;
        segment
    }

    fn send_data(
        &mut self,
        id: SessionId,
        tuple: &FourTuple,
        rx: &RxSarReply,
        seq: u32,
        length: u32,
        retransmission: bool,
    ) -> Result<()> {
        let payload = self.tx_buffer.read(id, seq, length as usize)?;
        let segment = Self::segment(tuple, seq, rx, TcpFlag::ACK | TcpFlag::PSH, payload);
        self.emit(segment, retransmission)
    }

    fn send_fin(
        &mut self,
        id: SessionId,
        tuple: &FourTuple,
        rx: &RxSarReply,
        seq: u32,
        retransmission: bool,
    ) -> Result<()> {
        let segment = Self::segment(tuple, seq, rx, TcpFlag::FIN | TcpFlag::ACK, Vec::new());
        self.emit(segment, retransmission)?;
        self.timers.set_retransmit(id, EventType::Rt)
    }

    fn on_tx(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let id = event.session_id;
        let rx = self.rx_sar.get(id)?;
        let tx = self.tx_sar.tx_get(id)?;
        if self.config.tcp_nodelay {
            // The application already checked the window, send exactly what it pushed.
            if event.length == 0 {
                return Ok(());
            }
            self.tx_sar.tx_update(
                id,
                TxTxSarUpdate::not_ackd(tx.not_ackd.wrapping_add(event.length)),
            )?;
            self.send_data(id, tuple, &rx, tx.not_ackd, event.length, false)?;
            return self.timers.set_retransmit(id, EventType::Rt);
        }

        let plan = plan_send(&tx, self.mss());
        log::trace!("[id={}] Send plan {:?}.", id, plan);
        if plan.fin {
            self.tx_sar.tx_update(
                id,
                TxTxSarUpdate {
                    not_ackd: plan.not_ackd.wrapping_add(1),
                    fin_ready: true,
                    fin_sent: true,
                    ..Default::default()
                },
            )?;
        } else if plan.not_ackd != tx.not_ackd {
            self.tx_sar
                .tx_update(id, TxTxSarUpdate::not_ackd(plan.not_ackd))?;
        }
        for (seq, length) in &plan.segments {
            self.send_data(id, tuple, &rx, *seq, *length, false)?;
        }
        if !plan.segments.is_empty() {
            self.timers.set_retransmit(id, EventType::Rt)?;
        }
        if plan.probe {
            self.timers.set_probe(id)?;
        }
        if plan.fin {
            self.send_fin(id, tuple, &rx, plan.not_ackd, false)?;
        }
        Ok(())
    }

    fn on_retransmit(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let id = event.session_id;
        let rx = self.rx_sar.get(id)?;
        let tx = self.tx_sar.tx_get(id)?;
        let mss = self.mss();
        // Only the first timeout of a series lowers the threshold.
        if event.rt_count == 1 {
            let threshold = timeout_slowstart_threshold(tx.used_length, mss);
            log::debug!(
                "[id={}] Retransmission timeout, ssthresh {} -> {}.",
                id,
                tx.slowstart_threshold,
                threshold
            );
            self.tx_sar.tx_set_ssthresh(id, threshold)?;
        }
        let mut seq = tx.ackd;
        let mut remaining = tx.used_length;
        let mut segments = 0;
        while remaining > 0 && segments < MAX_RETRANSMIT_SEGMENTS {
            let length = remaining.min(mss);
            self.send_data(id, tuple, &rx, seq, length, true)?;
            seq = seq.wrapping_add(length);
            remaining -= length;
            segments += 1;
        }
        if remaining == 0 && tx.fin_sent {
            return self.send_fin(id, tuple, &rx, tx.not_ackd.wrapping_sub(1), true);
        }
        if segments > 0 {
            self.timers.set_retransmit(id, EventType::Rt)?;
        }
        Ok(())
    }

    fn on_ack(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let rx = self.rx_sar.get(event.session_id)?;
        let tx = self.tx_sar.tx_get(event.session_id)?;
        let segment = Self::segment(tuple, tx.not_ackd, &rx, TcpFlag::ACK, Vec::new());
        self.emit(segment, false)
    }

    fn syn_options(&self, offer_scale: bool) -> TcpOption {
        TcpOption {
            mss: Some(self.config.mss),
            window_scale: offer_scale.then_some(WINDOW_SCALE_BITS),
        }
    }

    fn on_syn(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let id = event.session_id;
        let seq = if event.rt_count != 0 {
            self.tx_sar.tx_get(id)?.ackd
        } else {
            let isn = self.isn.isn(tuple);
            self.tx_sar.tx_update(
                id,
                TxTxSarUpdate {
                    not_ackd: isn.wrapping_add(1),
                    init: true,
                    syn_sent: true,
                    ..Default::default()
                },
            )?;
            isn
        };
        let mut segment = TcpPacket::new_segment(tuple, seq, 0, TcpFlag::SYN);
        segment.window_size = SYN_WINDOW;
        segment.option = self.syn_options(self.config.window_scale);
        self.emit(segment, event.rt_count != 0)?;
        self.timers.set_retransmit(id, EventType::Syn)
    }

    fn on_syn_ack(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let id = event.session_id;
        let rx = self.rx_sar.get(id)?;
        let tx = self.tx_sar.tx_get(id)?;
        let seq = if event.rt_count != 0 {
            tx.ackd
        } else {
            // Simultaneous open answers with the ISN of our own SYN.
            let isn = if tx.syn_sent {
                tx.not_ackd.wrapping_sub(1)
            } else {
                self.isn.isn(tuple)
            };
            self.tx_sar.tx_update(
                id,
                TxTxSarUpdate {
                    not_ackd: isn.wrapping_add(1),
                    init: true,
                    syn_sent: tx.syn_sent,
                    ..Default::default()
                },
            )?;
            isn
        };
        let mut segment =
            TcpPacket::new_segment(tuple, seq, rx.recvd, TcpFlag::SYN | TcpFlag::ACK);
        segment.window_size = SYN_WINDOW;
        segment.option = self.syn_options(rx.win_shift != 0);
        self.emit(segment, event.rt_count != 0)?;
        self.timers.set_retransmit(id, EventType::SynAck)
    }

    fn on_fin(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let id = event.session_id;
        let rx = self.rx_sar.get(id)?;
        let tx = self.tx_sar.tx_get(id)?;
        if event.rt_count != 0 || tx.fin_sent {
            return self.send_fin(id, tuple, &rx, tx.not_ackd.wrapping_sub(1), true);
        }
        if !self.config.tcp_nodelay && tx.unsent() != 0 {
            // Goes out behind the last data segment.
            log::debug!("[id={}] FIN waits for {} unsent bytes.", id, tx.unsent());
            return self.tx_sar.tx_update(
                id,
                TxTxSarUpdate {
                    not_ackd: tx.not_ackd,
                    fin_ready: true,
                    ..Default::default()
                },
            );
        }
        self.tx_sar.tx_update(
            id,
            TxTxSarUpdate {
                not_ackd: tx.not_ackd.wrapping_add(1),
                fin_ready: true,
                fin_sent: true,
                ..Default::default()
            },
        )?;
        self.send_fin(id, tuple, &rx, tx.not_ackd, false)
    }

    fn on_reset(&mut self, event: &Event, tuple: &FourTuple) -> Result<()> {
        let segment = match (event.kind, event.has_session()) {
            (EventType::RstAck, true) => {
                let tx = self.tx_sar.tx_get(event.session_id)?;
                TcpPacket::new_segment(tuple, tx.not_ackd, event.number, TcpFlag::RST | TcpFlag::ACK)
            }
            (EventType::RstAck, false) => {
                TcpPacket::new_segment(tuple, 0, event.number, TcpFlag::RST | TcpFlag::ACK)
            }
            // <SEQ=SEG.ACK><CTL=RST>
            _ => TcpPacket::new_segment(tuple, event.number, 0, TcpFlag::RST),
        };
        self.emit(segment, false)
    }
}

impl Service for TxEngine {
    type Msg = Event;

    fn name(&self) -> &'static str {
        TX_ENGINE
    }

    fn handle(&mut self, event: Event) -> Result<()> {
        let tuple = match event.tuple {
            Some(tuple) => tuple,
            None => match self.lookup.reverse_lookup(event.session_id)? {
                Some(tuple) => tuple,
                None => {
                    log::debug!(
                        "[id={}] Dropping {} event, the session is gone.",
                        event.session_id,
                        event.kind
                    );
                    return Ok(());
                }
            },
        };
        log::trace!("[id={}] Handling {} event.", event.session_id, event.kind);
        match event.kind {
            EventType::Tx => self.on_tx(&event, &tuple),
            EventType::Rt => self.on_retransmit(&event, &tuple),
            EventType::Ack | EventType::AckNodelay => self.on_ack(&event, &tuple),
            EventType::Syn => self.on_syn(&event, &tuple),
            EventType::SynAck => self.on_syn_ack(&event, &tuple),
            EventType::Fin => self.on_fin(&event, &tuple),
            EventType::Rst | EventType::RstAck => self.on_reset(&event, &tuple),
        }
    }
}

#[cfg(test)]
mod output_tests {
    use super::*;
    use rstest::rstest;

    const MSS: u32 = 1000;

    fn tx_reply(ackd: u32, not_ackd: u32, app: u32, usable_window: u32) -> TxSarTxReply {
        TxSarTxReply {
            ackd,
            not_ackd,
            app,
            usable_window,
            used_length: not_ackd.wrapping_sub(ackd),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(0, 1000)]
    #[case(4000, 2000)]
    #[case(4001, 2000)]
    #[case(10000, 5000)]
    fn test_timeout_slowstart_threshold(#[case] flight: u32, #[case] expected: u32) {
        assert_eq!(timeout_slowstart_threshold(flight, MSS / 2), expected);
    }

    #[rstest]
    // idle and shorter than a segment
    #[case(tx_reply(100, 100, 600, 10000), vec![(100, 500)], 600, false)]
    // full segments, then the short tail waits for their ACK
    #[case(tx_reply(100, 100, 2600, 10000), vec![(100, 1000), (1100, 1000)], 2100, true)]
    #[case(tx_reply(0, 100, 2600, 10000), vec![(100, 1000), (1100, 1000)], 2100, true)]
    // window smaller than one segment while idle: fill the window
    #[case(tx_reply(100, 100, 2600, 700), vec![(100, 700)], 800, true)]
    // window smaller than one segment with data in flight
    #[case(tx_reply(0, 100, 2600, 700), vec![], 100, true)]
    // window limits the number of full segments
    #[case(tx_reply(100, 100, 5100, 2500), vec![(100, 1000), (1100, 1000)], 2100, true)]
    // nothing to send
    #[case(tx_reply(100, 100, 100, 10000), vec![], 100, false)]
    // wraps around the sequence space
    #[case(tx_reply(u32::MAX - 99, u32::MAX - 99, 1000, 10000), vec![(u32::MAX - 99, 1000)], 900, true)]
    fn test_plan_send(
        #[case] tx: TxSarTxReply,
        #[case] segments: Vec<(u32, u32)>,
        #[case] not_ackd: u32,
        #[case] probe: bool,
    ) {
        let plan = plan_send(&tx, MSS);
        assert_eq!(plan.segments, segments);
        assert_eq!(plan.not_ackd, not_ackd);
        assert_eq!(plan.probe, probe);
        assert!(!plan.fin);
    }

    #[rstest]
    // all data sent and acknowledged
    #[case(tx_reply(100, 100, 100, 10000), true)]
    // the last short segment goes first, FIN right behind it
    #[case(tx_reply(100, 100, 400, 10000), true)]
    // nothing unsent but data in flight
    #[case(tx_reply(0, 100, 100, 10000), true)]
    // short segment held back, FIN has to wait too
    #[case(tx_reply(0, 100, 400, 10000), false)]
    fn test_plan_send_fin(#[case] mut tx: TxSarTxReply, #[case] expected: bool) {
        tx.fin_ready = true;
        assert_eq!(plan_send(&tx, MSS).fin, expected);
        tx.fin_sent = true;
        assert!(!plan_send(&tx, MSS).fin);
    }

    #[rstest]
    #[case(0xffff, 0, 0xffff)]
    #[case(0x3ffff, 2, 0xffff)]
    #[case(0x3fffb, 2, 0xfffe)]
    #[case(0x20000, 0, 0xffff)]
    fn test_advertised_window(#[case] window_size: u32, #[case] win_shift: u8, #[case] expected: u16) {
        let rx = RxSarReply {
            recvd: 0,
            appd: 0,
            win_shift,
            window_size,
        };
        assert_eq!(TxEngine::advertised_window(&rx), expected);
    }
}
