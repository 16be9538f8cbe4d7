use crate::tcp::{
    defs::SessionId,
    service::{notify, request, Service},
};
use anyhow::Result;
use std::sync::mpsc::Sender;

const TX_SAR_TABLE: &str = "tx sar table";

pub const INITIAL_SLOWSTART_THRESHOLD: u32 = 0xffff;
// rfc6928
pub const INITIAL_CWND_SEGMENTS: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TxSarEntry {
    // SND.UNA
    ackd: u32,
    // SND.NXT
    not_ackd: u32,
    // Next sequence number the application writes to.
    app: u32,
    // Peer window as announced, unscaled.
    recv_window: u16,
    win_shift: u8,
    cong_window: u32,
    slowstart_threshold: u32,
    count: u8,
    fast_retransmitted: bool,
    syn_sent: bool,
    fin_ready: bool,
    fin_sent: bool,
}

impl TxSarEntry {
    fn peer_window(&self) -> u32 {
        (self.recv_window as u32) << self.win_shift
    }

    fn min_window(&self) -> u32 {
        self.peer_window().min(self.cong_window)
    }

    fn in_flight(&self) -> u32 {
        self.not_ackd.wrapping_sub(self.ackd)
    }
}

/// What the RX engine needs for ACK processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxSarRxReply {
    pub prev_ack: u32,
    pub next_byte: u32,
    pub cong_window: u32,
    pub slowstart_threshold: u32,
    pub count: u8,
    pub fast_retransmitted: bool,
    pub fin_sent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxTxSarUpdate {
    pub ack: u32,
    pub recv_window: u16,
    pub cong_window: u32,
    pub count: u8,
    pub fast_retransmitted: bool,
    // Only SYN segments carry a scale.
    pub win_shift: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxSarTxReply {
    pub ackd: u32,
    pub not_ackd: u32,
    pub app: u32,
    pub cong_window: u32,
    pub slowstart_threshold: u32,
    pub syn_sent: bool,
    pub fin_ready: bool,
    pub fin_sent: bool,
    // Unacknowledged payload bytes, a sent FIN not included.
    pub used_length: u32,
    pub usable_window: u32,
}

impl TxSarTxReply {
    // Written by the application but not sent yet.
    pub fn unsent(&self) -> u32 {
        self.app.wrapping_sub(self.not_ackd)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxTxSarUpdate {
    pub not_ackd: u32,
    // A new connection: ackd = not_ackd - 1, app = not_ackd, congestion state reset.
    pub init: bool,
    pub syn_sent: bool,
    pub fin_ready: bool,
    pub fin_sent: bool,
}

impl TxTxSarUpdate {
    pub fn not_ackd(not_ackd: u32) -> Self {
        Self {
            not_ackd,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxSarAppReply {
    pub ackd: u32,
    pub app: u32,
    pub min_window: u32,
}

#[derive(Debug)]
pub struct TxSarTable {
    entries: Vec<TxSarEntry>,
    mss: u32,
}

impl TxSarTable {
    pub fn new(max_sessions: u16, mss: u16) -> Self {
        Self {
            entries: vec![TxSarEntry::default(); max_sessions as usize],
            mss: mss as u32,
        }
    }

    fn entry(&self, id: SessionId) -> TxSarEntry {
        self.entries.get(id as usize).copied().unwrap_or_default()
    }

    fn entry_mut(&mut self, id: SessionId) -> Option<&mut TxSarEntry> {
        let entry = self.entries.get_mut(id as usize);
        if entry.is_none() {
            log::warn!("TX SAR access for invalid session id {}.", id);
        }
        entry
    }

    pub fn rx_get(&self, id: SessionId) -> TxSarRxReply {
        let entry = self.entry(id);
        TxSarRxReply {
            prev_ack: entry.ackd,
            next_byte: entry.not_ackd,
            cong_window: entry.cong_window,
            slowstart_threshold: entry.slowstart_threshold,
            count: entry.count,
            fast_retransmitted: entry.fast_retransmitted,
            fin_sent: entry.fin_sent,
        }
    }

    pub fn rx_update(&mut self, id: SessionId, update: RxTxSarUpdate) {
        if let Some(entry) = self.entry_mut(id) {
            entry.ackd = update.ack;
            entry.recv_window = update.recv_window;
            entry.cong_window = update.cong_window;
            entry.count = update.count;
            entry.fast_retransmitted = update.fast_retransmitted;
            if let Some(shift) = update.win_shift {
                entry.win_shift = shift;
            }
        }
    }

    pub fn tx_get(&self, id: SessionId) -> TxSarTxReply {
        let entry = self.entry(id);
        let in_flight = entry.in_flight();
        TxSarTxReply {
            ackd: entry.ackd,
            not_ackd: entry.not_ackd,
            app: entry.app,
            cong_window: entry.cong_window,
            slowstart_threshold: entry.slowstart_threshold,
            syn_sent: entry.syn_sent,
            fin_ready: entry.fin_ready,
            fin_sent: entry.fin_sent,
            used_length: if entry.fin_sent {
                in_flight.saturating_sub(1)
            } else {
                in_flight
            },
            usable_window: entry.min_window().saturating_sub(in_flight),
        }
    }

    pub fn tx_update(&mut self, id: SessionId, update: TxTxSarUpdate) {
        let mss = self.mss;
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.not_ackd = update.not_ackd;
        if update.init {
            *entry = TxSarEntry {
                ackd: update.not_ackd.wrapping_sub(1),
                not_ackd: update.not_ackd,
                app: update.not_ackd,
                recv_window: entry.recv_window,
                win_shift: entry.win_shift,
                cong_window: INITIAL_CWND_SEGMENTS * mss,
                slowstart_threshold: INITIAL_SLOWSTART_THRESHOLD,
                count: 0,
                fast_retransmitted: false,
                syn_sent: update.syn_sent,
                fin_ready: false,
                fin_sent: false,
            };
        } else {
            entry.fin_ready |= update.fin_ready;
            entry.fin_sent |= update.fin_sent;
        }
    }

    pub fn tx_set_ssthresh(&mut self, id: SessionId, slowstart_threshold: u32) {
        if let Some(entry) = self.entry_mut(id) {
            entry.slowstart_threshold = slowstart_threshold;
        }
    }

    pub fn app_get(&self, id: SessionId) -> TxSarAppReply {
        let entry = self.entry(id);
        TxSarAppReply {
            ackd: entry.ackd,
            app: entry.app,
            min_window: entry.min_window(),
        }
    }

    pub fn app_push(&mut self, id: SessionId, app: u32) {
        if let Some(entry) = self.entry_mut(id) {
            entry.app = app;
        }
    }

    // A reused session id must not see the flags of its previous owner.
    pub fn release(&mut self, id: SessionId) {
        if let Some(entry) = self.entry_mut(id) {
            *entry = TxSarEntry::default();
        }
    }
}

pub enum TxSarMsg {
    RxGet {
        id: SessionId,
        reply: Sender<TxSarRxReply>,
    },
    RxUpdate {
        id: SessionId,
        update: RxTxSarUpdate,
    },
    TxGet {
        id: SessionId,
        reply: Sender<TxSarTxReply>,
    },
    TxUpdate {
        id: SessionId,
        update: TxTxSarUpdate,
    },
    TxSetSsthresh {
        id: SessionId,
        slowstart_threshold: u32,
    },
    AppGet {
        id: SessionId,
        reply: Sender<TxSarAppReply>,
    },
    AppPush {
        id: SessionId,
        app: u32,
    },
    Release {
        id: SessionId,
    },
}

pub struct TxSarService {
    table: TxSarTable,
}

impl TxSarService {
    pub fn new(max_sessions: u16, mss: u16) -> Self {
        Self {
            table: TxSarTable::new(max_sessions, mss),
        }
    }
}

impl Service for TxSarService {
    type Msg = TxSarMsg;

    fn name(&self) -> &'static str {
        TX_SAR_TABLE
    }

    fn handle(&mut self, msg: TxSarMsg) -> Result<()> {
        match msg {
            TxSarMsg::RxGet { id, reply } => reply.send(self.table.rx_get(id))?,
            TxSarMsg::RxUpdate { id, update } => self.table.rx_update(id, update),
            TxSarMsg::TxGet { id, reply } => reply.send(self.table.tx_get(id))?,
            TxSarMsg::TxUpdate { id, update } => {
                log::trace!("[id={}] TX SAR update {:?}.", id, update);
                self.table.tx_update(id, update)
            }
            TxSarMsg::TxSetSsthresh {
                id,
                slowstart_threshold,
            } => self.table.tx_set_ssthresh(id, slowstart_threshold),
            TxSarMsg::AppGet { id, reply } => reply.send(self.table.app_get(id))?,
            TxSarMsg::AppPush { id, app } => self.table.app_push(id, app),
            TxSarMsg::Release { id } => self.table.release(id),
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct TxSarHandle {
    tx: Sender<TxSarMsg>,
}

impl TxSarHandle {
    pub fn new(tx: Sender<TxSarMsg>) -> Self {
        Self { tx }
    }

    pub fn rx_get(&self, id: SessionId) -> Result<TxSarRxReply> {
        request(&self.tx, TX_SAR_TABLE, |reply| TxSarMsg::RxGet { id, reply })
    }

    pub fn rx_update(&self, id: SessionId, update: RxTxSarUpdate) -> Result<()> {
        notify(&self.tx, TX_SAR_TABLE, TxSarMsg::RxUpdate { id, update })
    }

    pub fn tx_get(&self, id: SessionId) -> Result<TxSarTxReply> {
        request(&self.tx, TX_SAR_TABLE, |reply| TxSarMsg::TxGet { id, reply })
    }

    pub fn tx_update(&self, id: SessionId, update: TxTxSarUpdate) -> Result<()> {
        notify(&self.tx, TX_SAR_TABLE, TxSarMsg::TxUpdate { id, update })
    }

    pub fn tx_set_ssthresh(&self, id: SessionId, slowstart_threshold: u32) -> Result<()> {
        notify(
            &self.tx,
            TX_SAR_TABLE,
            TxSarMsg::TxSetSsthresh {
                id,
                slowstart_threshold,
            },
        )
    }

    pub fn app_get(&self, id: SessionId) -> Result<TxSarAppReply> {
        request(&self.tx, TX_SAR_TABLE, |reply| TxSarMsg::AppGet { id, reply })
    }

    pub fn app_push(&self, id: SessionId, app: u32) -> Result<()> {
        notify(&self.tx, TX_SAR_TABLE, TxSarMsg::AppPush { id, app })
    }

    pub fn release(&self, id: SessionId) -> Result<()> {
        notify(&self.tx, TX_SAR_TABLE, TxSarMsg::Release { id })
    }
}
