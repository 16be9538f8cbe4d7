use anyhow::Result;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const WINDOW_SCALE_BITS: u8 = 2;
// Largest shift a peer may announce. rfc7323 2.3
pub const MAX_WINDOW_SHIFT: u8 = 14;
// Session ids are 14 bit wide.
pub const MAX_SESSIONS_LIMIT: u16 = 1 << 14;
pub const DEFAULT_MSS: u16 = 1460;

#[derive(Debug, Clone)]
pub struct ToeConfig {
    pub local_addr: Ipv4Addr,
    pub mss: u16,
    pub max_sessions: u16,
    pub window_scale: bool,
    pub tcp_nodelay: bool,
    pub fast_retransmit: bool,
    pub ack_delay: Option<Duration>,
    pub timer_tick: Duration,
    pub retransmit_timeouts: [Duration; 5],
    pub probe_interval: Duration,
    pub time_wait: Duration,
    pub ttl: u8,
}

impl Default for ToeConfig {
    fn default() -> Self {
        Self {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            mss: DEFAULT_MSS,
            max_sessions: 32,
            window_scale: false,
            tcp_nodelay: true,
            fast_retransmit: true,
            ack_delay: None,
            timer_tick: Duration::from_millis(100),
            retransmit_timeouts: [
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ],
            probe_interval: Duration::from_millis(50),
            time_wait: Duration::from_secs(60),
            ttl: 64,
        }
    }
}

impl ToeConfig {
    pub fn new(local_addr: Ipv4Addr) -> Self {
        Self {
            local_addr,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_sessions > 0 && self.max_sessions <= MAX_SESSIONS_LIMIT,
            "max_sessions must be within 1..={}, got {}.",
            MAX_SESSIONS_LIMIT,
            self.max_sessions
        );
        anyhow::ensure!(self.mss > 0, "mss must not be zero.");
        anyhow::ensure!(
            (self.mss as u32) * 4 < self.buffer_size(),
            "mss {} is too large for a {} bytes session buffer.",
            self.mss,
            self.buffer_size()
        );
        anyhow::ensure!(!self.timer_tick.is_zero(), "timer_tick must not be zero.");
        anyhow::ensure!(
            !self.probe_interval.is_zero(),
            "probe_interval must not be zero."
        );
        anyhow::ensure!(self.ttl > 0, "ttl must not be zero.");
        Ok(())
    }

    pub fn window_bits(&self) -> u32 {
        if self.window_scale {
            16 + WINDOW_SCALE_BITS as u32
        } else {
            16
        }
    }

    // Per session, the rx and tx buffers are this large each.
    pub fn buffer_size(&self) -> u32 {
        1 << self.window_bits()
    }

    pub fn window_mask(&self) -> u32 {
        self.buffer_size() - 1
    }

    pub fn congestion_window_max(&self) -> u32 {
        self.buffer_size() - 2048
    }

    pub fn rx_window_shift(&self) -> u8 {
        if self.window_scale {
            WINDOW_SCALE_BITS
        } else {
            0
        }
    }

    // Number of ticks needed to cover `duration`, at least one.
    pub fn ticks(&self, duration: Duration) -> u32 {
        let ticks = duration.as_micros() / self.timer_tick.as_micros().max(1);
        ticks.clamp(1, u32::MAX as u128) as u32
    }
}
