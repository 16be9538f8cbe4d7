use crate::tcp::{
    defs::{EventType, FourTuple, SessionId},
    service::{notify, Service},
};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

const EVENT_ENGINE: &str = "event engine";

/// Request to the TX engine to emit one kind of segment for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub session_id: SessionId,
    // TX: bytes the application pushed.
    pub length: u32,
    // SYN, SYN-ACK, RT: how often this was already retransmitted.
    pub rt_count: u8,
    // RST: SEG.SEQ to use. RST-ACK: SEG.ACK to use.
    pub number: u32,
    // Addressing for resets to segments which have no session.
    pub tuple: Option<FourTuple>,
}

impl Event {
    pub fn new(kind: EventType, session_id: SessionId) -> Self {
        Self {
            kind,
            session_id,
            length: 0,
            rt_count: 0,
            number: 0,
            tuple: None,
        }
    }

    pub fn tx(session_id: SessionId, length: u32) -> Self {
        Self {
            length,
            ..Self::new(EventType::Tx, session_id)
        }
    }

    pub fn retransmit(kind: EventType, session_id: SessionId, rt_count: u8) -> Self {
        Self {
            rt_count,
            ..Self::new(kind, session_id)
        }
    }

    // <SEQ=SND.NXT><ACK=ack><CTL=RST,ACK>
    pub fn rst_ack(session_id: SessionId, ack: u32) -> Self {
        Self {
            number: ack,
            ..Self::new(EventType::RstAck, session_id)
        }
    }

    // <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK> rfc9293
    pub fn rst_ack_to(tuple: FourTuple, ack: u32) -> Self {
        Self {
            number: ack,
            tuple: Some(tuple),
            ..Self::new(EventType::RstAck, 0)
        }
    }

    pub fn rst(session_id: SessionId, seq: u32) -> Self {
        Self {
            number: seq,
            ..Self::new(EventType::Rst, session_id)
        }
    }

    // <SEQ=SEG.ACK><CTL=RST> rfc9293
    pub fn rst_to(tuple: FourTuple, seq: u32) -> Self {
        Self {
            number: seq,
            tuple: Some(tuple),
            ..Self::new(EventType::Rst, 0)
        }
    }

    pub fn has_session(&self) -> bool {
        self.tuple.is_none()
    }
}

/// Producers, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Rx = 0,
    RetransmitTimer = 1,
    ProbeTimer = 2,
    App = 3,
}

const EVENT_SOURCES: usize = 4;

/// Merges all event producers into the single stream the TX engine consumes,
/// holding back plain ACKs for `ack_delay` so they can ride on a later segment.
#[derive(Debug)]
pub struct EventMerger {
    queues: [VecDeque<Event>; EVENT_SOURCES],
    ack_delay: Option<Duration>,
    pending_acks: HashMap<SessionId, Instant>,
}

impl EventMerger {
    pub fn new(ack_delay: Option<Duration>) -> Self {
        Self {
            queues: Default::default(),
            ack_delay,
            pending_acks: HashMap::new(),
        }
    }

    pub fn push(&mut self, source: EventSource, event: Event) {
        self.queues[source as usize].push_back(event);
    }

    pub fn has_queued(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }

    // Nothing pending for this session may fire after it is gone.
    pub fn release(&mut self, session_id: SessionId) {
        self.pending_acks.remove(&session_id);
        for queue in &mut self.queues {
            queue.retain(|e| !e.has_session() || e.session_id != session_id);
        }
    }

    pub fn next_ack_deadline(&self) -> Option<Instant> {
        self.pending_acks.values().min().copied()
    }

    pub fn next(&mut self, now: Instant) -> Option<Event> {
        let expired = self
            .pending_acks
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .min();
        if let Some(id) = expired {
            self.pending_acks.remove(&id);
            return Some(Event::new(EventType::Ack, id));
        }
        while let Some(event) = self.queues.iter_mut().find_map(|q| q.pop_front()) {
            if let Some(event) = self.delay_ack(event, now) {
                return Some(event);
            }
        }
        None
    }

    fn delay_ack(&mut self, event: Event, now: Instant) -> Option<Event> {
        let Some(delay) = self.ack_delay else {
            return Some(event);
        };
        if !event.has_session() {
            return Some(event);
        }
        if event.kind == EventType::Ack && !self.pending_acks.contains_key(&event.session_id) {
            self.pending_acks.insert(event.session_id, now + delay);
            return None;
        }
        // Anything else carries the acknowledgment already.
        self.pending_acks.remove(&event.session_id);
        Some(event)
    }
}

pub enum EventMergerMsg {
    Push { source: EventSource, event: Event },
    Release { session_id: SessionId },
}

pub struct EventMergerService {
    merger: EventMerger,
    queued_at: Option<Instant>,
    out: Sender<Event>,
}

impl EventMergerService {
    pub fn new(ack_delay: Option<Duration>, out: Sender<Event>) -> Self {
        Self {
            merger: EventMerger::new(ack_delay),
            queued_at: None,
            out,
        }
    }
}

impl Service for EventMergerService {
    type Msg = EventMergerMsg;

    fn name(&self) -> &'static str {
        EVENT_ENGINE
    }

    fn handle(&mut self, msg: EventMergerMsg) -> Result<()> {
        match msg {
            EventMergerMsg::Push { source, event } => {
                log::trace!(
                    "Queued {} event for session {} from {:?}.",
                    event.kind,
                    event.session_id,
                    source
                );
                self.merger.push(source, event);
                self.queued_at.get_or_insert_with(Instant::now);
            }
            EventMergerMsg::Release { session_id } => self.merger.release(session_id),
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.queued_at, self.merger.next_ack_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    fn tick(&mut self, now: Instant) -> Result<()> {
        while let Some(event) = self.merger.next(now) {
            self.out.send(event)?;
        }
        self.queued_at = None;
        Ok(())
    }
}

#[derive(Clone)]
pub struct EventMergerHandle {
    tx: Sender<EventMergerMsg>,
}

impl EventMergerHandle {
    pub fn new(tx: Sender<EventMergerMsg>) -> Self {
        Self { tx }
    }

    pub fn push(&self, source: EventSource, event: Event) -> Result<()> {
        notify(&self.tx, EVENT_ENGINE, EventMergerMsg::Push { source, event })
    }

    pub fn release(&self, session_id: SessionId) -> Result<()> {
        notify(&self.tx, EVENT_ENGINE, EventMergerMsg::Release { session_id })
    }
}
