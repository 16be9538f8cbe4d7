use crate::tcp::{
    buffer::SessionBuffer,
    config::ToeConfig,
    defs::{
        AppNotification, EventType, LookupSource, OpenStatus, SendError, SendResponse, SessionId,
        SessionState, TcpError, ThreeTuple,
    },
    event::{Event, EventMergerHandle, EventMergerService, EventSource},
    input::RxEngine,
    isn::IsnGenerator,
    output::TxEngine,
    port_table::{PortTableHandle, PortTableService},
    rx_sar::{RxSarHandle, RxSarService},
    service::spawn_service,
    session_lookup::{SessionLookupHandle, SessionLookupService},
    state_table::{SessionCleanup, StateTableHandle, StateTableService},
    stats::{ToeCounters, ToeStats},
    timer::{CloseTimerService, ProbeTimerService, RetransmitTimerService, TimerHandle},
    tx_sar::{TxSarHandle, TxSarService},
};
use anyhow::{Context, Result};
use std::net::SocketAddrV4;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Receiver, RecvTimeoutError, Sender},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::Duration;

/// The offload engine as seen by the application: every table, both engines and the timers run
/// on their own threads, this handle only talks to them.
pub struct Toe {
    config: ToeConfig,
    ports: PortTableHandle,
    lookup: SessionLookupHandle,
    state: StateTableHandle,
    rx_sar: RxSarHandle,
    tx_sar: TxSarHandle,
    merger: EventMergerHandle,
    rx_buffer: Arc<SessionBuffer>,
    tx_buffer: Arc<SessionBuffer>,
    ingress: Sender<Vec<u8>>,
    notifications: Mutex<Receiver<AppNotification>>,
    open_status: Mutex<Receiver<OpenStatus>>,
    counters: Arc<ToeCounters>,
    // send and read walk app pointers in several steps.
    send_lock: Mutex<()>,
    read_lock: Mutex<()>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Toe {
    /// Spawns all tasks. Outgoing IPv4 datagrams are sent to `egress`.
    pub fn new(config: ToeConfig, egress: Sender<Vec<u8>>) -> Result<Self> {
        config.validate()?;
        let max = config.max_sessions;
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(ToeCounters::default());

        let (port_tx, port_rx) = channel();
        let (lookup_tx, lookup_rx) = channel();
        let (state_tx, state_rx) = channel();
        let (rx_sar_tx, rx_sar_rx) = channel();
        let (tx_sar_tx, tx_sar_rx) = channel();
        let (merger_tx, merger_rx) = channel();
        let (event_tx, event_rx) = channel();
        let (retransmit_tx, retransmit_rx) = channel();
        let (probe_tx, probe_rx) = channel();
        let (close_tx, close_rx) = channel();
        let (ingress_tx, ingress_rx) = channel();
        let (notification_tx, notification_rx) = channel();
        let (open_status_tx, open_status_rx) = channel();

        let ports = PortTableHandle::new(port_tx);
        let lookup = SessionLookupHandle::new(lookup_tx);
        let state = StateTableHandle::new(state_tx);
        let rx_sar = RxSarHandle::new(rx_sar_tx);
        let tx_sar = TxSarHandle::new(tx_sar_tx);
        let merger = EventMergerHandle::new(merger_tx);
        let timers = TimerHandle::new(retransmit_tx, probe_tx, close_tx);
        let rx_buffer = Arc::new(SessionBuffer::new("rx buffer", max, config.buffer_size()));
        let tx_buffer = Arc::new(SessionBuffer::new("tx buffer", max, config.buffer_size()));

        let cleanup = SessionCleanup {
            lookup: lookup.clone(),
            timers: timers.clone(),
            merger: merger.clone(),
            tx_sar: tx_sar.clone(),
        };
        let rx_engine = RxEngine::new(
            config.clone(),
            ports.clone(),
            lookup.clone(),
            state.clone(),
            rx_sar.clone(),
            tx_sar.clone(),
            timers.clone(),
            merger.clone(),
            rx_buffer.clone(),
            notification_tx.clone(),
            open_status_tx.clone(),
            counters.clone(),
        );
        let tx_engine = TxEngine::new(
            config.clone(),
            lookup.clone(),
            rx_sar.clone(),
            tx_sar.clone(),
            timers.clone(),
            tx_buffer.clone(),
            IsnGenerator::new(),
            egress,
            counters.clone(),
        );
        let retransmit_timer = RetransmitTimerService::new(
            &config,
            merger.clone(),
            state.clone(),
            lookup.clone(),
            notification_tx,
            open_status_tx,
            counters.clone(),
        );

        let threads = vec![
            spawn_service(PortTableService::new(), port_rx, running.clone())?,
            spawn_service(
                SessionLookupService::new(max, config.local_addr, ports.clone(), counters.clone()),
                lookup_rx,
                running.clone(),
            )?,
            spawn_service(
                StateTableService::new(max, cleanup, counters.clone()),
                state_rx,
                running.clone(),
            )?,
            spawn_service(
                RxSarService::new(max, config.window_mask()),
                rx_sar_rx,
                running.clone(),
            )?,
            spawn_service(
                TxSarService::new(max, config.mss),
                tx_sar_rx,
                running.clone(),
            )?,
            spawn_service(
                EventMergerService::new(config.ack_delay, event_tx),
                merger_rx,
                running.clone(),
            )?,
            spawn_service(retransmit_timer, retransmit_rx, running.clone())?,
            spawn_service(
                ProbeTimerService::new(&config, merger.clone()),
                probe_rx,
                running.clone(),
            )?,
            spawn_service(
                CloseTimerService::new(&config, state.clone()),
                close_rx,
                running.clone(),
            )?,
            spawn_service(rx_engine, ingress_rx, running.clone())?,
            spawn_service(tx_engine, event_rx, running.clone())?,
        ];
        log::info!(
            "Offload engine up on {} with {} sessions, mss {}.",
            config.local_addr,
            max,
            config.mss
        );

        Ok(Self {
            config,
            ports,
            lookup,
            state,
            rx_sar,
            tx_sar,
            merger,
            rx_buffer,
            tx_buffer,
            ingress: ingress_tx,
            notifications: Mutex::new(notification_rx),
            open_status: Mutex::new(open_status_rx),
            counters,
            send_lock: Mutex::new(()),
            read_lock: Mutex::new(()),
            running,
            threads: Mutex::new(threads),
        })
    }

    pub fn config(&self) -> &ToeConfig {
        &self.config
    }

    /// IPv4 datagrams received from the network go here.
    pub fn ingress(&self) -> Sender<Vec<u8>> {
        self.ingress.clone()
    }

    fn check_session(&self, id: SessionId) -> Result<()> {
        if id >= self.config.max_sessions {
            anyhow::bail!(TcpError::InvalidSession { id });
        }
        Ok(())
    }

    /// Passive open. False if the port is listening already or not in the listening range.
    pub fn listen(&self, port: u16) -> Result<bool> {
        self.ports.open_listen(port)
    }

    /// Active open. The handshake result arrives later through `next_open_status`.
    pub fn open(&self, addr: SocketAddrV4) -> Result<SessionId> {
        let ip = *addr.ip();
        if ip.is_multicast() || ip.is_broadcast() || ip.is_unspecified() {
            anyhow::bail!(TcpError::InvalidDestination { addr: ip });
        }
        let port = self
            .ports
            .allocate_ephemeral()?
            .ok_or(TcpError::NoFreePort)?;
        let reply = self
            .lookup
            .lookup(ThreeTuple::new(ip, port, addr.port()), true, LookupSource::TxApp)?;
        if !reply.hit {
            self.ports.release(port)?;
            anyhow::bail!(TcpError::NoFreeSession {
                max: self.config.max_sessions
            });
        }
        let id = reply.session_id;
        self.state
            .update(LookupSource::TxApp, id, SessionState::SynSent)?;
        self.merger
            .push(EventSource::App, Event::new(EventType::Syn, id))?;
        log::info!("[id={}] Opening connection {}:{} -> {}.", id, self.config.local_addr, port, addr);
        Ok(id)
    }

    pub fn next_open_status(&self, timeout: Duration) -> Result<Option<OpenStatus>> {
        let receiver = self
            .open_status
            .lock()
            .map_err(|_| anyhow::anyhow!("Open status receiver is poisoned."))?;
        match receiver.recv_timeout(timeout) {
            Ok(status) => Ok(Some(status)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Open status sender is gone."),
        }
    }

    pub fn next_notification(&self, timeout: Duration) -> Result<Option<AppNotification>> {
        let receiver = self
            .notifications
            .lock()
            .map_err(|_| anyhow::anyhow!("Notification receiver is poisoned."))?;
        match receiver.recv_timeout(timeout) {
            Ok(notification) => Ok(Some(notification)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => anyhow::bail!("Notification sender is gone."),
        }
    }

    /// Active close of an established connection. Anything else is left as is.
    pub fn close(&self, id: SessionId) -> Result<()> {
        self.check_session(id)?;
        let state = self.state.lock(LookupSource::TxApp, id)?;
        if state != SessionState::Established {
            log::debug!("[id={} state={}] Nothing to close.", id, state);
            return self.state.set(LookupSource::TxApp, id, state);
        }
        self.state
            .set(LookupSource::TxApp, id, SessionState::FinWait1)?;
        self.merger
            .push(EventSource::App, Event::new(EventType::Fin, id))?;
        log::info!("[id={} state={}] Closing.", id, SessionState::FinWait1);
        Ok(())
    }

    /// Copies `data` into the send buffer, all of it or nothing.
    pub fn send(&self, id: SessionId, data: &[u8]) -> Result<SendResponse> {
        self.check_session(id)?;
        let _guard = self
            .send_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Send lock is poisoned."))?;
        let mut response = SendResponse {
            session_id: id,
            length: 0,
            remaining_space: 0,
            error: SendError::None,
        };
        let state = self.state.get(id)?;
        if state != SessionState::Established {
            log::debug!("[id={} state={}] Refusing to send.", id, state);
            response.error = SendError::NoConnection;
            return Ok(response);
        }

        let sar = self.tx_sar.app_get(id)?;
        let buffered = sar.app.wrapping_sub(sar.ackd);
        let free = self.config.window_mask().saturating_sub(buffered);
        let length = data.len() as u32;
        let fits = if self.config.tcp_nodelay {
            // One event is one segment, and it must fit the usable window right away.
            let usable = sar.min_window.saturating_sub(buffered);
            length <= free.min(self.config.mss as u32) && length <= usable
        } else {
            length <= free && length <= u16::MAX as u32
        };
        response.remaining_space = free;
        if !fits {
            log::debug!(
                "[id={}] No space for {} bytes. free={} window={}",
                id,
                length,
                free,
                sar.min_window
            );
            response.error = SendError::NoSpace;
            return Ok(response);
        }
        if length == 0 {
            return Ok(response);
        }

        self.tx_buffer.write(id, sar.app, data)?;
        self.tx_sar.app_push(id, sar.app.wrapping_add(length))?;
        self.merger
            .push(EventSource::App, Event::tx(id, length))?;
        response.length = length as u16;
        response.remaining_space = free - length;
        Ok(response)
    }

    /// Up to `length` received bytes, fewer if less is available.
    pub fn read(&self, id: SessionId, length: usize) -> Result<Vec<u8>> {
        self.check_session(id)?;
        let _guard = self
            .read_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Read lock is poisoned."))?;
        let sar = self.rx_sar.get(id)?;
        let available = sar.available(self.config.window_mask());
        let length = (length as u32).min(available);
        if length == 0 {
            return Ok(Vec::new());
        }
        let data = self.rx_buffer.read(id, sar.appd, length as usize)?;
        self.rx_sar.app_set(id, sar.appd.wrapping_add(length))?;
        // The peer may be waiting on a window below one segment. rfc9293 3.8.6.2.2
        if sar.window_size < self.config.mss as u32 {
            self.merger
                .push(EventSource::App, Event::new(EventType::AckNodelay, id))?;
        }
        Ok(data)
    }

    pub fn session_state(&self, id: SessionId) -> Result<SessionState> {
        self.state.get(id)
    }

    pub fn stats(&self) -> ToeStats {
        self.counters.snapshot()
    }

    /// Stops and joins every task. Also done on drop.
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let threads: Vec<_> = self
            .threads
            .lock()
            .map_err(|_| anyhow::anyhow!("Thread list is poisoned."))?
            .drain(..)
            .collect();
        for handle in threads {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("{} task panicked.", name))
                .context("Failed to stop the offload engine.")?;
        }
        log::info!("Offload engine on {} stopped.", self.config.local_addr);
        Ok(())
    }
}

impl Drop for Toe {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Shutdown failed. Err: {:?}", e);
        }
    }
}
