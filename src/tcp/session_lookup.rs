use crate::tcp::{
    defs::{FourTuple, LookupSource, SessionId, ThreeTuple},
    port_table::{is_ephemeral, PortTableHandle},
    service::{notify, request, Service},
    stats::{inc, ToeCounters},
};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{mpsc::Sender, Arc};

const SESSION_LOOKUP: &str = "session lookup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupReply {
    pub session_id: SessionId,
    pub hit: bool,
    pub source: LookupSource,
}

/// Forward (tuple -> id) and reverse (id -> tuple) session maps with id allocation.
/// A reverse slot being `Some` is the valid flag of that id.
#[derive(Debug)]
pub struct SessionTable {
    forward: HashMap<ThreeTuple, SessionId>,
    reverse: Vec<Option<ThreeTuple>>,
    free_ids: VecDeque<SessionId>,
    next_fresh: SessionId,
}

impl SessionTable {
    pub fn new(max_sessions: u16) -> Self {
        Self {
            forward: HashMap::new(),
            reverse: vec![None; max_sessions as usize],
            free_ids: VecDeque::new(),
            next_fresh: 0,
        }
    }

    pub fn get(&self, tuple: &ThreeTuple) -> Option<SessionId> {
        self.forward.get(tuple).copied()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    // Recycled ids first, then never used ones.
    fn allocate_id(&mut self) -> Option<SessionId> {
        if let Some(id) = self.free_ids.pop_front() {
            return Some(id);
        }
        if (self.next_fresh as usize) < self.reverse.len() {
            let id = self.next_fresh;
            self.next_fresh += 1;
            Some(id)
        } else {
            None
        }
    }

    /// Returns the id and whether it was created by this call.
    pub fn lookup(&mut self, tuple: ThreeTuple, allow_creation: bool) -> Option<(SessionId, bool)> {
        if let Some(id) = self.get(&tuple) {
            return Some((id, false));
        }
        if !allow_creation {
            return None;
        }
        let id = self.allocate_id()?;
        self.forward.insert(tuple, id);
        self.reverse[id as usize] = Some(tuple);
        Some((id, true))
    }

    /// Returns the tuple of a released session, None if the id was not valid.
    pub fn release(&mut self, id: SessionId) -> Option<ThreeTuple> {
        let tuple = self.reverse.get_mut(id as usize)?.take()?;
        self.forward.remove(&tuple);
        self.free_ids.push_back(id);
        Some(tuple)
    }

    pub fn reverse_lookup(&self, id: SessionId) -> Option<ThreeTuple> {
        self.reverse.get(id as usize).copied().flatten()
    }
}

pub enum SessionLookupMsg {
    Lookup {
        tuple: ThreeTuple,
        allow_creation: bool,
        source: LookupSource,
        reply: Sender<LookupReply>,
    },
    Release {
        id: SessionId,
    },
    ReverseLookup {
        id: SessionId,
        reply: Sender<Option<FourTuple>>,
    },
}

pub struct SessionLookupService {
    table: SessionTable,
    local_addr: Ipv4Addr,
    ports: PortTableHandle,
    counters: Arc<ToeCounters>,
}

impl SessionLookupService {
    pub fn new(
        max_sessions: u16,
        local_addr: Ipv4Addr,
        ports: PortTableHandle,
        counters: Arc<ToeCounters>,
    ) -> Self {
        Self {
            table: SessionTable::new(max_sessions),
            local_addr,
            ports,
            counters,
        }
    }
}

impl Service for SessionLookupService {
    type Msg = SessionLookupMsg;

    fn name(&self) -> &'static str {
        SESSION_LOOKUP
    }

    fn handle(&mut self, msg: SessionLookupMsg) -> Result<()> {
        match msg {
            SessionLookupMsg::Lookup {
                tuple,
                allow_creation,
                source,
                reply,
            } => {
                let result = self.table.lookup(tuple, allow_creation);
                let lookup_reply = match result {
                    Some((id, created)) => {
                        if created {
                            inc(&self.counters.curr_estab);
                            log::info!(
                                "[id={}] Created session for {} (requested by {}).",
                                id,
                                tuple,
                                source
                            );
                        }
                        LookupReply {
                            session_id: id,
                            hit: true,
                            source,
                        }
                    }
                    None => {
                        if allow_creation {
                            log::warn!(
                                "No free session id for {}. {} sessions in use.",
                                tuple,
                                self.table.len()
                            );
                        }
                        LookupReply {
                            session_id: 0,
                            hit: false,
                            source,
                        }
                    }
                };
                reply.send(lookup_reply)?;
            }
            SessionLookupMsg::Release { id } => match self.table.release(id) {
                Some(tuple) => {
                    self.counters.dec_curr_estab();
                    log::info!("[id={}] Released session for {}.", id, tuple);
                    if is_ephemeral(tuple.my_port) {
                        self.ports.release(tuple.my_port)?;
                    }
                }
                None => log::warn!("Releasing session id {} which is not valid.", id),
            },
            SessionLookupMsg::ReverseLookup { id, reply } => {
                let tuple = self
                    .table
                    .reverse_lookup(id)
                    .map(|t| FourTuple::from_three(self.local_addr, t));
                reply.send(tuple)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionLookupHandle {
    tx: Sender<SessionLookupMsg>,
}

impl SessionLookupHandle {
    pub fn new(tx: Sender<SessionLookupMsg>) -> Self {
        Self { tx }
    }

    pub fn lookup(
        &self,
        tuple: ThreeTuple,
        allow_creation: bool,
        source: LookupSource,
    ) -> Result<LookupReply> {
        request(&self.tx, SESSION_LOOKUP, |reply| SessionLookupMsg::Lookup {
            tuple,
            allow_creation,
            source,
            reply,
        })
    }

    pub fn release(&self, id: SessionId) -> Result<()> {
        notify(&self.tx, SESSION_LOOKUP, SessionLookupMsg::Release { id })
    }

    pub fn reverse_lookup(&self, id: SessionId) -> Result<Option<FourTuple>> {
        request(&self.tx, SESSION_LOOKUP, |reply| {
            SessionLookupMsg::ReverseLookup { id, reply }
        })
    }
}
