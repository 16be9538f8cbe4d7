use crate::tcp::{
    defs::SessionId,
    service::{notify, request, Service},
};
use anyhow::Result;
use std::sync::mpsc::Sender;

const RX_SAR_TABLE: &str = "rx sar table";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RxSarEntry {
    // RCV.NXT
    recvd: u32,
    // Application read cursor, an offset into the session window.
    appd: u32,
    win_shift: u8,
    // The FIN counts in RCV.NXT but takes no buffer space.
    fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSarReply {
    pub recvd: u32,
    pub appd: u32,
    pub win_shift: u8,
    // Free space of the receive buffer, unscaled.
    pub window_size: u32,
}

impl RxSarReply {
    // Bytes received but not read by the application yet.
    pub fn available(&self, window_mask: u32) -> u32 {
        window_mask - self.window_size
    }
}

#[derive(Debug)]
pub struct RxSarTable {
    entries: Vec<RxSarEntry>,
    window_mask: u32,
}

impl RxSarTable {
    pub fn new(max_sessions: u16, window_mask: u32) -> Self {
        Self {
            entries: vec![RxSarEntry::default(); max_sessions as usize],
            window_mask,
        }
    }

    fn entry(&self, id: SessionId) -> RxSarEntry {
        self.entries.get(id as usize).copied().unwrap_or_default()
    }

    fn entry_mut(&mut self, id: SessionId) -> Option<&mut RxSarEntry> {
        let entry = self.entries.get_mut(id as usize);
        if entry.is_none() {
            log::warn!("RX SAR access for invalid session id {}.", id);
        }
        entry
    }

    pub fn get(&self, id: SessionId) -> RxSarReply {
        let entry = self.entry(id);
        let data_end = entry.recvd.wrapping_sub(entry.fin as u32);
        RxSarReply {
            recvd: entry.recvd,
            appd: entry.appd,
            win_shift: entry.win_shift,
            window_size: entry
                .appd
                .wrapping_sub(data_end & self.window_mask)
                .wrapping_sub(1)
                & self.window_mask,
        }
    }

    pub fn set_recvd(&mut self, id: SessionId, recvd: u32) {
        if let Some(entry) = self.entry_mut(id) {
            entry.recvd = recvd;
        }
    }

    // `recvd` is one past the FIN.
    pub fn set_fin(&mut self, id: SessionId, recvd: u32) {
        if let Some(entry) = self.entry_mut(id) {
            entry.recvd = recvd;
            entry.fin = true;
        }
    }

    // A fresh connection starts with an empty buffer.
    pub fn init(&mut self, id: SessionId, recvd: u32, win_shift: u8) {
        let window_mask = self.window_mask;
        if let Some(entry) = self.entry_mut(id) {
            *entry = RxSarEntry {
                recvd,
                appd: recvd & window_mask,
                win_shift,
                fin: false,
            };
        }
    }

    pub fn app_get(&self, id: SessionId) -> u32 {
        self.entry(id).appd
    }

    pub fn app_set(&mut self, id: SessionId, appd: u32) {
        let window_mask = self.window_mask;
        if let Some(entry) = self.entry_mut(id) {
            entry.appd = appd & window_mask;
        }
    }
}

pub enum RxSarMsg {
    Get {
        id: SessionId,
        reply: Sender<RxSarReply>,
    },
    SetRecvd {
        id: SessionId,
        recvd: u32,
    },
    SetFin {
        id: SessionId,
        recvd: u32,
    },
    Init {
        id: SessionId,
        recvd: u32,
        win_shift: u8,
    },
    AppGet {
        id: SessionId,
        reply: Sender<u32>,
    },
    AppSet {
        id: SessionId,
        appd: u32,
    },
}

pub struct RxSarService {
    table: RxSarTable,
}

impl RxSarService {
    pub fn new(max_sessions: u16, window_mask: u32) -> Self {
        Self {
            table: RxSarTable::new(max_sessions, window_mask),
        }
    }
}

impl Service for RxSarService {
    type Msg = RxSarMsg;

    fn name(&self) -> &'static str {
        RX_SAR_TABLE
    }

    fn handle(&mut self, msg: RxSarMsg) -> Result<()> {
        match msg {
            RxSarMsg::Get { id, reply } => reply.send(self.table.get(id))?,
            RxSarMsg::SetRecvd { id, recvd } => self.table.set_recvd(id, recvd),
            RxSarMsg::SetFin { id, recvd } => {
                log::trace!("[id={}] RX SAR FIN, recvd={}.", id, recvd);
                self.table.set_fin(id, recvd)
            }
            RxSarMsg::Init {
                id,
                recvd,
                win_shift,
            } => {
                log::trace!("[id={}] RX SAR init recvd={} shift={}.", id, recvd, win_shift);
                self.table.init(id, recvd, win_shift)
            }
            RxSarMsg::AppGet { id, reply } => reply.send(self.table.app_get(id))?,
            RxSarMsg::AppSet { id, appd } => self.table.app_set(id, appd),
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RxSarHandle {
    tx: Sender<RxSarMsg>,
}

impl RxSarHandle {
    pub fn new(tx: Sender<RxSarMsg>) -> Self {
        Self { tx }
    }

    pub fn get(&self, id: SessionId) -> Result<RxSarReply> {
        request(&self.tx, RX_SAR_TABLE, |reply| RxSarMsg::Get { id, reply })
    }

    pub fn set_recvd(&self, id: SessionId, recvd: u32) -> Result<()> {
        notify(&self.tx, RX_SAR_TABLE, RxSarMsg::SetRecvd { id, recvd })
    }

    pub fn set_fin(&self, id: SessionId, recvd: u32) -> Result<()> {
        notify(&self.tx, RX_SAR_TABLE, RxSarMsg::SetFin { id, recvd })
    }

    pub fn init(&self, id: SessionId, recvd: u32, win_shift: u8) -> Result<()> {
        notify(
            &self.tx,
            RX_SAR_TABLE,
            RxSarMsg::Init {
                id,
                recvd,
                win_shift,
            },
        )
    }

    pub fn app_get(&self, id: SessionId) -> Result<u32> {
        request(&self.tx, RX_SAR_TABLE, |reply| RxSarMsg::AppGet { id, reply })
    }

    pub fn app_set(&self, id: SessionId, appd: u32) -> Result<()> {
        notify(&self.tx, RX_SAR_TABLE, RxSarMsg::AppSet { id, appd })
    }
}

#[cfg(test)]
mod rx_sar_tests {
    use super::*;
    use rstest::rstest;

    const MASK: u32 = 0xffff;

    #[rstest]
    // empty buffer advertises everything but one byte
    #[case(1001, 0, 0xffff)]
    #[case(0xffff_fff0, 0, 0xffff)]
    // 100 bytes waiting to be read
    #[case(1001, 100, 0xffff - 100)]
    // received data wraps at the window boundary
    #[case(0x0001_fff0, 0x20, 0xffff - 0x20)]
    fn test_window_size(#[case] isn_recvd: u32, #[case] received: u32, #[case] expected: u32) {
        let mut table = RxSarTable::new(2, MASK);
        table.init(1, isn_recvd, 0);
        table.set_recvd(1, isn_recvd.wrapping_add(received));
        let reply = table.get(1);
        assert_eq!(reply.window_size, expected);
        assert_eq!(reply.available(MASK), received);
    }

    #[test]
    fn test_read_reopens_window() {
        let mut table = RxSarTable::new(1, MASK);
        table.init(0, 0xfff0, 2);
        table.set_recvd(0, 0x1_0010);
        assert_eq!(table.get(0).available(MASK), 0x20);
        let appd = table.app_get(0);
        assert_eq!(appd, 0xfff0);
        table.app_set(0, appd + 0x18);
        assert_eq!(table.app_get(0), 0x0008);
        let reply = table.get(0);
        assert_eq!(reply.available(MASK), 0x08);
        assert_eq!(reply.win_shift, 2);
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    fn test_fin_takes_no_buffer_space(#[case] payload: u32) {
        let mut table = RxSarTable::new(1, MASK);
        table.init(0, 1001, 0);
        table.set_recvd(0, 1001 + payload);
        table.set_fin(0, 1001 + payload + 1);
        let reply = table.get(0);
        assert_eq!(reply.recvd, 1001 + payload + 1);
        assert_eq!(reply.available(MASK), payload);

        table.app_set(0, table.app_get(0) + payload);
        assert_eq!(table.get(0).available(MASK), 0);
        assert_eq!(table.get(0).window_size, MASK);
    }

    #[test]
    fn test_init_clears_fin() {
        let mut table = RxSarTable::new(1, MASK);
        table.init(0, 1001, 0);
        table.set_fin(0, 1002);
        table.init(0, 5001, 0);
        table.set_recvd(0, 5003);
        assert_eq!(table.get(0).available(MASK), 2);
    }

    #[test]
    fn test_invalid_id_reads_default() {
        let mut table = RxSarTable::new(1, MASK);
        table.set_recvd(5, 10);
        assert_eq!(table.get(5).recvd, 0);
    }
}
