use crate::tcp::service::{notify, request, Service};
use anyhow::Result;
use std::sync::mpsc::Sender;

const PORT_TABLE: &str = "port table";
// Lower half of the port space can be listened on, upper half is handed out for active opens.
const EPHEMERAL_PORT_BIT: u16 = 0x8000;
const PORT_RANGE_SIZE: usize = 1 << 15;

pub fn is_ephemeral(port: u16) -> bool {
    port & EPHEMERAL_PORT_BIT != 0
}

/// Listening bitmap (0..32767) and ephemeral in-use bitmap (32768..65535).
#[derive(Debug)]
pub struct PortTable {
    listening: Vec<bool>,
    ephemeral: Vec<bool>,
    cursor: usize,
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            listening: vec![false; PORT_RANGE_SIZE],
            ephemeral: vec![false; PORT_RANGE_SIZE],
            cursor: 0,
        }
    }

    pub fn open_listen(&mut self, port: u16) -> bool {
        if is_ephemeral(port) {
            log::debug!("Port {} is in the ephemeral range, cannot listen on it.", port);
            return false;
        }
        let slot = &mut self.listening[port as usize];
        if *slot {
            log::debug!("Port {} is already listening.", port);
            false
        } else {
            *slot = true;
            log::info!("Port {} is listening.", port);
            true
        }
    }

    pub fn check(&self, port: u16) -> bool {
        if is_ephemeral(port) {
            self.ephemeral[(port & !EPHEMERAL_PORT_BIT) as usize]
        } else {
            self.listening[port as usize]
        }
    }

    pub fn allocate_ephemeral(&mut self) -> Option<u16> {
        for step in 0..PORT_RANGE_SIZE {
            let index = (self.cursor + step) % PORT_RANGE_SIZE;
            if !self.ephemeral[index] {
                self.ephemeral[index] = true;
                self.cursor = (index + 1) % PORT_RANGE_SIZE;
                return Some(index as u16 | EPHEMERAL_PORT_BIT);
            }
        }
        None
    }

    pub fn release(&mut self, port: u16) {
        let slot = if is_ephemeral(port) {
            &mut self.ephemeral[(port & !EPHEMERAL_PORT_BIT) as usize]
        } else {
            &mut self.listening[port as usize]
        };
        if !*slot {
            log::warn!("Releasing port {} which is not in use.", port);
        }
        *slot = false;
    }
}

pub enum PortTableMsg {
    OpenListen { port: u16, reply: Sender<bool> },
    Check { port: u16, reply: Sender<bool> },
    AllocateEphemeral { reply: Sender<Option<u16>> },
    Release { port: u16 },
}

pub struct PortTableService {
    table: PortTable,
}

impl Default for PortTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTableService {
    pub fn new() -> Self {
        Self {
            table: PortTable::new(),
        }
    }
}

impl Service for PortTableService {
    type Msg = PortTableMsg;

    fn name(&self) -> &'static str {
        PORT_TABLE
    }

    // Both sub tables answer from the same queue, so replies keep request order.
    fn handle(&mut self, msg: PortTableMsg) -> Result<()> {
        match msg {
            PortTableMsg::OpenListen { port, reply } => {
                reply.send(self.table.open_listen(port))?;
            }
            PortTableMsg::Check { port, reply } => {
                reply.send(self.table.check(port))?;
            }
            PortTableMsg::AllocateEphemeral { reply } => {
                let port = self.table.allocate_ephemeral();
                log::trace!("Allocated ephemeral port {:?}.", port);
                reply.send(port)?;
            }
            PortTableMsg::Release { port } => self.table.release(port),
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PortTableHandle {
    tx: Sender<PortTableMsg>,
}

impl PortTableHandle {
    pub fn new(tx: Sender<PortTableMsg>) -> Self {
        Self { tx }
    }

    pub fn open_listen(&self, port: u16) -> Result<bool> {
        request(&self.tx, PORT_TABLE, |reply| PortTableMsg::OpenListen {
            port,
            reply,
        })
    }

    pub fn check(&self, port: u16) -> Result<bool> {
        request(&self.tx, PORT_TABLE, |reply| PortTableMsg::Check { port, reply })
    }

    pub fn allocate_ephemeral(&self) -> Result<Option<u16>> {
        request(&self.tx, PORT_TABLE, |reply| PortTableMsg::AllocateEphemeral {
            reply,
        })
    }

    pub fn release(&self, port: u16) -> Result<()> {
        notify(&self.tx, PORT_TABLE, PortTableMsg::Release { port })
    }
}
