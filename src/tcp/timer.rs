use crate::tcp::{
    config::ToeConfig,
    defs::{AppNotification, EventType, OpenStatus, SessionId},
    event::{Event, EventMergerHandle, EventSource},
    service::{notify, Service},
    session_lookup::SessionLookupHandle,
    state_table::StateTableHandle,
    stats::{inc, ToeCounters},
};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{mpsc::Sender, Arc};
use std::time::{Duration, Instant};

const RETRANSMIT_TIMER: &str = "retransmit timer";
const PROBE_TIMER: &str = "probe timer";
const CLOSE_TIMER: &str = "close timer";

// A session is given up after this many retransmissions.
pub const MAX_RETRIES: u8 = 4;

#[derive(Debug, Clone, Copy)]
struct RetransmitEntry {
    time: u32,
    retries: u8,
    active: bool,
    kind: EventType,
}

impl Default for RetransmitEntry {
    fn default() -> Self {
        Self {
            time: 0,
            retries: 0,
            active: false,
            kind: EventType::Rt,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetransmitExpiry {
    // Resend, `Event::rt_count` is the new retry count.
    Fire(Event),
    // Retries are used up, the session has to go.
    GiveUp { session_id: SessionId, kind: EventType },
}

/// Per session retransmission countdown with backoff by retry count.
#[derive(Debug)]
pub struct RetransmitTimerTable {
    entries: Vec<RetransmitEntry>,
    // Ticks to wait, indexed by retry count.
    timeouts: [u32; 5],
}

impl RetransmitTimerTable {
    pub fn new(max_sessions: u16, timeouts: [u32; 5]) -> Self {
        Self {
            entries: vec![RetransmitEntry::default(); max_sessions as usize],
            timeouts,
        }
    }

    pub fn from_config(config: &ToeConfig) -> Self {
        Self::new(
            config.max_sessions,
            config.retransmit_timeouts.map(|d| config.ticks(d)),
        )
    }

    // A running countdown is kept, only the event kind is refreshed.
    pub fn set(&mut self, id: SessionId, kind: EventType) {
        let Some(entry) = self.entries.get_mut(id as usize) else {
            log::warn!("Retransmit timer set for invalid session id {}.", id);
            return;
        };
        entry.kind = kind;
        if !entry.active {
            entry.time = self.timeouts[(entry.retries as usize).min(self.timeouts.len() - 1)];
        }
        entry.active = true;
    }

    // Called on ACK progress. `stop` when everything sent is acknowledged.
    pub fn clear(&mut self, id: SessionId, stop: bool) {
        let Some(entry) = self.entries.get_mut(id as usize) else {
            return;
        };
        if stop {
            entry.time = 0;
            entry.active = false;
        } else {
            entry.time = self.timeouts[0];
        }
        entry.retries = 0;
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.entries.get(id as usize).map_or(false, |e| e.active)
    }

    pub fn retries(&self, id: SessionId) -> u8 {
        self.entries.get(id as usize).map_or(0, |e| e.retries)
    }

    // One sweep over all sessions.
    pub fn tick(&mut self) -> Vec<RetransmitExpiry> {
        let mut expired = Vec::new();
        for (id, entry) in self.entries.iter_mut().enumerate() {
            if !entry.active {
                continue;
            }
            if entry.time > 1 {
                entry.time -= 1;
                continue;
            }
            entry.time = 0;
            entry.active = false;
            if entry.retries < MAX_RETRIES {
                entry.retries += 1;
                expired.push(RetransmitExpiry::Fire(Event::retransmit(
                    entry.kind,
                    id as SessionId,
                    entry.retries,
                )));
            } else {
                entry.retries = 0;
                expired.push(RetransmitExpiry::GiveUp {
                    session_id: id as SessionId,
                    kind: entry.kind,
                });
            }
        }
        expired
    }
}

/// Single shot countdowns, used by the probe and the close timer.
#[derive(Debug)]
pub struct CountdownTable {
    entries: Vec<Option<u32>>,
}

impl CountdownTable {
    pub fn new(max_sessions: u16) -> Self {
        Self {
            entries: vec![None; max_sessions as usize],
        }
    }

    pub fn set(&mut self, id: SessionId, ticks: u32) {
        match self.entries.get_mut(id as usize) {
            Some(slot @ None) => *slot = Some(ticks.max(1)),
            Some(Some(_)) => {}
            None => log::warn!("Timer set for invalid session id {}.", id),
        }
    }

    pub fn clear(&mut self, id: SessionId) {
        if let Some(slot) = self.entries.get_mut(id as usize) {
            *slot = None;
        }
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        matches!(self.entries.get(id as usize), Some(Some(_)))
    }

    pub fn tick(&mut self) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for (id, slot) in self.entries.iter_mut().enumerate() {
            if let Some(time) = slot {
                if *time > 1 {
                    *time -= 1;
                } else {
                    *slot = None;
                    expired.push(id as SessionId);
                }
            }
        }
        expired
    }
}

pub enum RetransmitTimerMsg {
    Set { id: SessionId, kind: EventType },
    Clear { id: SessionId, stop: bool },
}

pub struct RetransmitTimerService {
    table: RetransmitTimerTable,
    tick: Duration,
    merger: EventMergerHandle,
    state: StateTableHandle,
    lookup: SessionLookupHandle,
    notifications: Sender<AppNotification>,
    open_status: Sender<OpenStatus>,
    counters: Arc<ToeCounters>,
}

impl RetransmitTimerService {
    pub fn new(
        config: &ToeConfig,
        merger: EventMergerHandle,
        state: StateTableHandle,
        lookup: SessionLookupHandle,
        notifications: Sender<AppNotification>,
        open_status: Sender<OpenStatus>,
        counters: Arc<ToeCounters>,
    ) -> Self {
        Self {
            table: RetransmitTimerTable::from_config(config),
            tick: config.timer_tick,
            merger,
            state,
            lookup,
            notifications,
            open_status,
            counters,
        }
    }

    fn give_up(&mut self, session_id: SessionId, kind: EventType) -> Result<()> {
        let remote_addr = self
            .lookup
            .reverse_lookup(session_id)?
            .map_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), |t| t.remote());
        log::info!(
            "[id={}] Giving up on {} after {} retransmissions, releasing the session.",
            session_id,
            kind,
            MAX_RETRIES
        );
        self.state.release(session_id)?;
        if matches!(kind, EventType::Syn | EventType::SynAck) {
            inc(&self.counters.attempt_fails);
        }
        if kind == EventType::Syn {
            self.open_status
                .send(OpenStatus {
                    session_id,
                    success: false,
                })
                .context("Open status receiver is gone.")?;
        } else {
            self.notifications
                .send(AppNotification {
                    session_id,
                    length: 0,
                    remote_addr,
                    opened: false,
                    closed: true,
                })
                .context("Notification receiver is gone.")?;
        }
        Ok(())
    }
}

impl Service for RetransmitTimerService {
    type Msg = RetransmitTimerMsg;

    fn name(&self) -> &'static str {
        RETRANSMIT_TIMER
    }

    fn handle(&mut self, msg: RetransmitTimerMsg) -> Result<()> {
        match msg {
            RetransmitTimerMsg::Set { id, kind } => self.table.set(id, kind),
            RetransmitTimerMsg::Clear { id, stop } => self.table.clear(id, stop),
        }
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.tick)
    }

    fn tick(&mut self, _now: Instant) -> Result<()> {
        for expiry in self.table.tick() {
            match expiry {
                RetransmitExpiry::Fire(event) => {
                    log::debug!(
                        "[id={}] Retransmission timeout, firing {} (retry {}).",
                        event.session_id,
                        event.kind,
                        event.rt_count
                    );
                    self.merger.push(EventSource::RetransmitTimer, event)?;
                }
                RetransmitExpiry::GiveUp { session_id, kind } => self.give_up(session_id, kind)?,
            }
        }
        Ok(())
    }
}

pub enum ProbeTimerMsg {
    Set { id: SessionId },
    Clear { id: SessionId },
}

pub struct ProbeTimerService {
    table: CountdownTable,
    interval: Duration,
    nagle: bool,
    merger: EventMergerHandle,
}

impl ProbeTimerService {
    pub fn new(config: &ToeConfig, merger: EventMergerHandle) -> Self {
        Self {
            table: CountdownTable::new(config.max_sessions),
            interval: config.probe_interval,
            nagle: !config.tcp_nodelay,
            merger,
        }
    }
}

impl Service for ProbeTimerService {
    type Msg = ProbeTimerMsg;

    fn name(&self) -> &'static str {
        PROBE_TIMER
    }

    fn handle(&mut self, msg: ProbeTimerMsg) -> Result<()> {
        match msg {
            // Ticks are probe_interval long.
            ProbeTimerMsg::Set { id } => self.table.set(id, 1),
            ProbeTimerMsg::Clear { id } => self.table.clear(id),
        }
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn tick(&mut self, _now: Instant) -> Result<()> {
        for id in self.table.tick() {
            // With Nagle, let the TX engine look at the unsent data again.
            let event = if self.nagle {
                Event::tx(id, 0)
            } else {
                Event::new(EventType::Ack, id)
            };
            log::trace!("[id={}] Probe timer fired {}.", id, event.kind);
            self.merger.push(EventSource::ProbeTimer, event)?;
        }
        Ok(())
    }
}

pub enum CloseTimerMsg {
    Set { id: SessionId },
    Clear { id: SessionId },
}

pub struct CloseTimerService {
    table: CountdownTable,
    tick: Duration,
    time_wait_ticks: u32,
    state: StateTableHandle,
}

impl CloseTimerService {
    pub fn new(config: &ToeConfig, state: StateTableHandle) -> Self {
        Self {
            table: CountdownTable::new(config.max_sessions),
            tick: config.timer_tick,
            time_wait_ticks: config.ticks(config.time_wait),
            state,
        }
    }
}

impl Service for CloseTimerService {
    type Msg = CloseTimerMsg;

    fn name(&self) -> &'static str {
        CLOSE_TIMER
    }

    fn handle(&mut self, msg: CloseTimerMsg) -> Result<()> {
        match msg {
            CloseTimerMsg::Set { id } => self.table.set(id, self.time_wait_ticks),
            CloseTimerMsg::Clear { id } => self.table.clear(id),
        }
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        Some(self.tick)
    }

    fn tick(&mut self, _now: Instant) -> Result<()> {
        for id in self.table.tick() {
            log::debug!("[id={}] TIME-WAIT expired.", id);
            self.state.release(id)?;
        }
        Ok(())
    }
}

/// Client side of all three timers.
#[derive(Clone)]
pub struct TimerHandle {
    retransmit: Sender<RetransmitTimerMsg>,
    probe: Sender<ProbeTimerMsg>,
    close: Sender<CloseTimerMsg>,
}

impl TimerHandle {
    pub fn new(
        retransmit: Sender<RetransmitTimerMsg>,
        probe: Sender<ProbeTimerMsg>,
        close: Sender<CloseTimerMsg>,
    ) -> Self {
        Self {
            retransmit,
            probe,
            close,
        }
    }

    pub fn set_retransmit(&self, id: SessionId, kind: EventType) -> Result<()> {
        notify(&self.retransmit, RETRANSMIT_TIMER, RetransmitTimerMsg::Set { id, kind })
    }

    pub fn clear_retransmit(&self, id: SessionId, stop: bool) -> Result<()> {
        notify(&self.retransmit, RETRANSMIT_TIMER, RetransmitTimerMsg::Clear { id, stop })
    }

    pub fn set_probe(&self, id: SessionId) -> Result<()> {
        notify(&self.probe, PROBE_TIMER, ProbeTimerMsg::Set { id })
    }

    pub fn clear_probe(&self, id: SessionId) -> Result<()> {
        notify(&self.probe, PROBE_TIMER, ProbeTimerMsg::Clear { id })
    }

    pub fn set_close(&self, id: SessionId) -> Result<()> {
        notify(&self.close, CLOSE_TIMER, CloseTimerMsg::Set { id })
    }

    // Nothing may fire for a session which is being released.
    pub fn cancel(&self, id: SessionId) -> Result<()> {
        self.clear_retransmit(id, true)?;
        self.clear_probe(id)?;
        notify(&self.close, CLOSE_TIMER, CloseTimerMsg::Clear { id })
    }
}
