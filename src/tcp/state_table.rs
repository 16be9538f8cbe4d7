use crate::tcp::{
    defs::{LookupSource, SessionId, SessionState},
    event::EventMergerHandle,
    service::{notify, request, Service},
    session_lookup::SessionLookupHandle,
    stats::{inc, ToeCounters},
    timer::TimerHandle,
    tx_sar::TxSarHandle,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{mpsc::Sender, Arc};

const STATE_TABLE: &str = "state table";

#[derive(Debug)]
pub enum StateRequest {
    Lock {
        source: LookupSource,
        id: SessionId,
        reply: Sender<SessionState>,
    },
    Set {
        source: LookupSource,
        id: SessionId,
        state: SessionState,
    },
    Update {
        source: LookupSource,
        id: SessionId,
        state: SessionState,
        reply: Sender<SessionState>,
    },
    // From the timers. Always ends in CLOSED.
    Release {
        id: SessionId,
    },
}

impl StateRequest {
    fn id(&self) -> SessionId {
        match self {
            StateRequest::Lock { id, .. }
            | StateRequest::Set { id, .. }
            | StateRequest::Update { id, .. }
            | StateRequest::Release { id } => *id,
        }
    }
}

/// A state write which happened, for the owner to run the side effects of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateWrite {
    pub id: SessionId,
    pub old: SessionState,
    pub new: SessionState,
    // None for timer releases.
    pub source: Option<LookupSource>,
}

impl StateWrite {
    // A CLOSED write frees the session, except when the application just hands back an
    // untouched CLOSED row it had locked.
    pub fn releases_session(&self) -> bool {
        self.new == SessionState::Closed
            && !(self.source == Some(LookupSource::TxApp) && self.old == SessionState::Closed)
    }
}

/// Per session TCP state. A row read with `Lock` stays locked for its source until the
/// matching `Set`; requests of anybody else for that row wait in arrival order.
#[derive(Debug)]
pub struct StateTable {
    states: Vec<SessionState>,
    locks: HashMap<SessionId, LookupSource>,
    parked: VecDeque<StateRequest>,
}

impl StateTable {
    pub fn new(max_sessions: u16) -> Self {
        Self {
            states: vec![SessionState::Closed; max_sessions as usize],
            locks: HashMap::new(),
            parked: VecDeque::new(),
        }
    }

    // Lock free read. Ids out of range read as CLOSED.
    pub fn get(&self, id: SessionId) -> SessionState {
        self.states
            .get(id as usize)
            .copied()
            .unwrap_or(SessionState::Closed)
    }

    pub fn is_locked(&self, id: SessionId) -> bool {
        self.locks.contains_key(&id)
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn submit(&mut self, req: StateRequest) -> Result<Vec<StateWrite>> {
        let mut writes = Vec::new();
        let id = req.id();
        let from_holder = matches!(
            &req,
            StateRequest::Set { source, id, .. } if self.locks.get(id) == Some(source)
        );
        if !from_holder && (self.parked.iter().any(|p| p.id() == id) || self.must_wait(&req)) {
            log::trace!("State table row {} is locked, parking request.", id);
            self.parked.push_back(req);
            return Ok(writes);
        }
        let unlocked = self.apply(req, &mut writes)?;
        if unlocked {
            self.replay(&mut writes)?;
        }
        Ok(writes)
    }

    fn must_wait(&self, req: &StateRequest) -> bool {
        match req {
            StateRequest::Set { source, id, .. } => {
                self.locks.get(id).map_or(false, |holder| holder != source)
            }
            other => self.locks.contains_key(&other.id()),
        }
    }

    fn replay(&mut self, writes: &mut Vec<StateWrite>) -> Result<()> {
        let mut blocked = HashSet::new();
        let mut still_parked = VecDeque::new();
        while let Some(req) = self.parked.pop_front() {
            let id = req.id();
            if blocked.contains(&id) || self.must_wait(&req) {
                blocked.insert(id);
                still_parked.push_back(req);
            } else {
                self.apply(req, writes)?;
            }
        }
        self.parked = still_parked;
        Ok(())
    }

    // Returns true when a row lock was dropped.
    fn apply(&mut self, req: StateRequest, writes: &mut Vec<StateWrite>) -> Result<bool> {
        match req {
            StateRequest::Lock { source, id, reply } => {
                if (id as usize) < self.states.len() {
                    self.locks.insert(id, source);
                }
                reply.send(self.get(id))?;
                Ok(false)
            }
            StateRequest::Set { source, id, state } => {
                let unlocked = self.locks.get(&id) == Some(&source);
                if unlocked {
                    self.locks.remove(&id);
                }
                self.write(id, state, Some(source), writes);
                Ok(unlocked)
            }
            StateRequest::Update {
                source,
                id,
                state,
                reply,
            } => {
                let old = self.get(id);
                self.write(id, state, Some(source), writes);
                reply.send(old)?;
                Ok(false)
            }
            StateRequest::Release { id } => {
                self.write(id, SessionState::Closed, None, writes);
                Ok(false)
            }
        }
    }

    fn write(
        &mut self,
        id: SessionId,
        new: SessionState,
        source: Option<LookupSource>,
        writes: &mut Vec<StateWrite>,
    ) {
        let Some(slot) = self.states.get_mut(id as usize) else {
            log::warn!("State write {} for invalid session id {}.", new, id);
            return;
        };
        let old = *slot;
        *slot = new;
        if old != new {
            log::debug!("[id={} state={}] -> {}", id, old, new);
        }
        writes.push(StateWrite {
            id,
            old,
            new,
            source,
        });
    }
}

pub enum StateTableMsg {
    Get {
        id: SessionId,
        reply: Sender<SessionState>,
    },
    Request(StateRequest),
}

/// Everything which has to forget a session when its row goes CLOSED.
#[derive(Clone)]
pub struct SessionCleanup {
    pub lookup: SessionLookupHandle,
    pub timers: TimerHandle,
    pub merger: EventMergerHandle,
    pub tx_sar: TxSarHandle,
}

pub struct StateTableService {
    table: StateTable,
    cleanup: SessionCleanup,
    counters: Arc<ToeCounters>,
}

impl StateTableService {
    pub fn new(max_sessions: u16, cleanup: SessionCleanup, counters: Arc<ToeCounters>) -> Self {
        Self {
            table: StateTable::new(max_sessions),
            cleanup,
            counters,
        }
    }

    fn after_write(&self, write: &StateWrite) -> Result<()> {
        if write.releases_session() {
            self.cleanup.timers.cancel(write.id)?;
            self.cleanup.merger.release(write.id)?;
            self.cleanup.tx_sar.release(write.id)?;
            // Last, the id may be handed out again right after.
            self.cleanup.lookup.release(write.id)?;
        } else if write.old != write.new {
            match (write.new, write.source) {
                (SessionState::SynReceived, Some(LookupSource::Rx)) => {
                    inc(&self.counters.passive_opens)
                }
                (SessionState::SynSent, Some(LookupSource::TxApp)) => {
                    inc(&self.counters.active_opens)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Service for StateTableService {
    type Msg = StateTableMsg;

    fn name(&self) -> &'static str {
        STATE_TABLE
    }

    fn handle(&mut self, msg: StateTableMsg) -> Result<()> {
        match msg {
            StateTableMsg::Get { id, reply } => reply.send(self.table.get(id))?,
            StateTableMsg::Request(req) => {
                for write in self.table.submit(req)? {
                    self.after_write(&write)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct StateTableHandle {
    tx: Sender<StateTableMsg>,
}

impl StateTableHandle {
    pub fn new(tx: Sender<StateTableMsg>) -> Self {
        Self { tx }
    }

    pub fn get(&self, id: SessionId) -> Result<SessionState> {
        request(&self.tx, STATE_TABLE, |reply| StateTableMsg::Get { id, reply })
    }

    pub fn lock(&self, source: LookupSource, id: SessionId) -> Result<SessionState> {
        request(&self.tx, STATE_TABLE, |reply| {
            StateTableMsg::Request(StateRequest::Lock { source, id, reply })
        })
    }

    pub fn set(&self, source: LookupSource, id: SessionId, state: SessionState) -> Result<()> {
        notify(
            &self.tx,
            STATE_TABLE,
            StateTableMsg::Request(StateRequest::Set { source, id, state }),
        )
    }

    pub fn update(
        &self,
        source: LookupSource,
        id: SessionId,
        state: SessionState,
    ) -> Result<SessionState> {
        request(&self.tx, STATE_TABLE, |reply| {
            StateTableMsg::Request(StateRequest::Update {
                source,
                id,
                state,
                reply,
            })
        })
    }

    pub fn release(&self, id: SessionId) -> Result<()> {
        notify(
            &self.tx,
            STATE_TABLE,
            StateTableMsg::Request(StateRequest::Release { id }),
        )
    }
}
