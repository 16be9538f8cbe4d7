use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU32, Ordering};

// MIB-II tcp group counters. rfc1213 6.10
// Each counter has a single writing task, readers only take snapshots.
#[derive(Debug, Default)]
pub struct ToeCounters {
    pub in_segs: AtomicU32,
    pub in_errs: AtomicU32,
    pub out_segs: AtomicU32,
    pub retrans_segs: AtomicU32,
    pub active_opens: AtomicU32,
    pub passive_opens: AtomicU32,
    pub attempt_fails: AtomicU32,
    pub estab_resets: AtomicU32,
    pub curr_estab: AtomicU32,
}

pub fn inc(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ToeCounters {
    pub fn dec_curr_estab(&self) {
        // saturating, a double release must not wrap the gauge
        let _ = self
            .curr_estab
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> ToeStats {
        ToeStats {
            tcp_in_segs: self.in_segs.load(Ordering::Relaxed),
            tcp_in_errs: self.in_errs.load(Ordering::Relaxed),
            tcp_out_segs: self.out_segs.load(Ordering::Relaxed),
            tcp_retrans_segs: self.retrans_segs.load(Ordering::Relaxed),
            tcp_active_opens: self.active_opens.load(Ordering::Relaxed),
            tcp_passive_opens: self.passive_opens.load(Ordering::Relaxed),
            tcp_attempt_fails: self.attempt_fails.load(Ordering::Relaxed),
            tcp_estab_resets: self.estab_resets.load(Ordering::Relaxed),
            tcp_curr_estab: self.curr_estab.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ToeStats {
    pub tcp_in_segs: u32,
    pub tcp_in_errs: u32,
    pub tcp_out_segs: u32,
    pub tcp_retrans_segs: u32,
    pub tcp_active_opens: u32,
    pub tcp_passive_opens: u32,
    pub tcp_attempt_fails: u32,
    pub tcp_estab_resets: u32,
    pub tcp_curr_estab: u32,
}

impl Display for ToeStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "tcpInSegs       {}", self.tcp_in_segs)?;
        writeln!(f, "tcpInErrs       {}", self.tcp_in_errs)?;
        writeln!(f, "tcpOutSegs      {}", self.tcp_out_segs)?;
        writeln!(f, "tcpRetransSegs  {}", self.tcp_retrans_segs)?;
        writeln!(f, "tcpActiveOpens  {}", self.tcp_active_opens)?;
        writeln!(f, "tcpPassiveOpens {}", self.tcp_passive_opens)?;
        writeln!(f, "tcpAttemptFails {}", self.tcp_attempt_fails)?;
        writeln!(f, "tcpEstabResets  {}", self.tcp_estab_resets)?;
        write!(f, "tcpCurrEstab    {}", self.tcp_curr_estab)
    }
}
