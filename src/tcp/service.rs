use anyhow::{Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{channel, Receiver, RecvTimeoutError, Sender},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

// Upper bound on how long a task sleeps before looking at the running flag again.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const SERVICE_MAX_BATCH: usize = 64;

#[derive(Error, Debug, PartialEq)]
pub enum ServiceError {
    #[error("{service} task is not running anymore.")]
    Disconnected { service: &'static str },
}

/// Send a request which carries its own reply channel and wait for the answer.
/// Every caller gets its own reply, so answers can never be delivered to the wrong requester.
pub fn request<M, R>(
    tx: &Sender<M>,
    service: &'static str,
    build: impl FnOnce(Sender<R>) -> M,
) -> Result<R> {
    let (reply_tx, reply_rx) = channel();
    tx.send(build(reply_tx))
        .map_err(|_| ServiceError::Disconnected { service })?;
    Ok(reply_rx
        .recv()
        .map_err(|_| ServiceError::Disconnected { service })?)
}

/// Fire and forget.
pub fn notify<M>(tx: &Sender<M>, service: &'static str, msg: M) -> Result<()> {
    tx.send(msg)
        .map_err(|_| ServiceError::Disconnected { service })?;
    Ok(())
}

/// A task owning one piece of state, driven only by messages (and ticks).
pub trait Service: Send + 'static {
    type Msg: Send + 'static;

    fn name(&self) -> &'static str;

    fn handle(&mut self, msg: Self::Msg) -> Result<()>;

    /// Period of `tick`, None for purely message driven tasks.
    fn tick_period(&self) -> Option<Duration> {
        None
    }

    /// Deadline driven work besides the periodic tick, e.g. delayed events.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    fn tick(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }
}

pub fn spawn_service<S: Service>(
    mut service: S,
    rx: Receiver<S::Msg>,
    running: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let name = service.name();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            log::info!("Starting {} task.", name);
            run_service(&mut service, &rx, &running);
            log::info!("Stopped {} task.", name);
        })
        .with_context(|| format!("Failed to spawn {} task.", name))
}

fn run_service<S: Service>(service: &mut S, rx: &Receiver<S::Msg>, running: &AtomicBool) {
    let period = service.tick_period();
    let mut next_tick = period.map(|p| Instant::now() + p);
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        let deadline = [next_tick, service.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        let wait = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .min(SERVICE_POLL_INTERVAL),
            None => SERVICE_POLL_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(msg) => {
                // Take whatever else is already queued so a tick sees all of it at once.
                let batch = std::iter::once(msg).chain(rx.try_iter().take(SERVICE_MAX_BATCH));
                for msg in batch {
                    if let Err(e) = service.handle(msg) {
                        log::error!("{} failed to handle a request. Err: {:?}", service.name(), e);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("{} has no more clients.", service.name());
                break;
            }
        }
        let now = Instant::now();
        let tick_due = next_tick.map_or(false, |t| now >= t);
        let deadline_due = service.next_deadline().map_or(false, |t| now >= t);
        if tick_due || deadline_due {
            // One full sweep per tick, a late tick is not replayed.
            if let (true, Some(period)) = (tick_due, period) {
                next_tick = Some(now + period);
            }
            if let Err(e) = service.tick(now) {
                log::error!("{} failed to handle a tick. Err: {:?}", service.name(), e);
            }
        }
    }
}
