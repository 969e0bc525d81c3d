use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::frame::round_to;
use crate::output::format_prefix;
use crate::proto::pool::Feedback;

pub const HASHRATE_WINDOW: usize = 5;
pub const PING_WINDOW: usize = 10;

/// Mean over the last `cap` samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    cap: usize,
    samples: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            samples: VecDeque::with_capacity(cap.max(1)),
        }
    }

    /// Adds a sample and returns the new mean.
    pub fn push(&mut self, sample: f64) -> f64 {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.mean()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// One worker's recent hashrate and ping.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    hashrate: RollingWindow,
    ping: RollingWindow,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            hashrate: RollingWindow::new(HASHRATE_WINDOW),
            ping: RollingWindow::new(PING_WINDOW),
        }
    }
}

impl WorkerStats {
    pub fn record_hashrate(&mut self, hashrate: f64) -> f64 {
        self.hashrate.push(hashrate)
    }

    pub fn record_ping(&mut self, ping: Duration) -> f64 {
        self.ping.push(ping.as_millis() as f64)
    }

    pub fn hashrate(&self) -> f64 {
        self.hashrate.mean()
    }

    pub fn ping_ms(&self) -> f64 {
        self.ping.mean()
    }
}

/// Process-wide share and error counters.
#[derive(Debug, Default)]
pub struct SessionCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    blocks: AtomicU64,
    checksum_failures: AtomicU64,
    bus_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub blocks: u64,
    pub checksum_failures: u64,
    pub bus_retries: u64,
}

impl SessionCounters {
    /// Books a pool verdict.
    pub fn apply(&self, feedback: &Feedback) {
        match feedback {
            Feedback::Good => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Feedback::Block => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                self.blocks.fetch_add(1, Ordering::Relaxed);
            }
            Feedback::Bad(_) | Feedback::Unknown(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn inc_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bus_retry(&self) {
        self.bus_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            bus_retries: self.bus_retries.load(Ordering::Relaxed),
        }
    }
}

/// Latest mean hashrate per worker, summed for reports.
#[derive(Debug)]
pub struct HashrateBoard {
    rates: Mutex<Vec<f64>>,
}

impl HashrateBoard {
    pub fn new(workers: usize) -> Self {
        Self {
            rates: Mutex::new(vec![0.0; workers]),
        }
    }

    pub fn set(&self, worker: usize, hashrate: f64) {
        let mut rates = self.rates.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = rates.get_mut(worker) {
            *slot = hashrate;
        }
    }

    pub fn total(&self) -> f64 {
        self.rates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub period: Duration,
    pub shares: u64,
    pub shares_per_sec: f64,
    pub blocks: u64,
    pub hashrate: f64,
    pub hashes: u64,
    pub uptime: Duration,
    pub checksum_error_rate: f64,
    pub bus_retry_rate: f64,
}

impl Report {
    pub fn render(&self) -> String {
        format!(
            "Periodic mining report (last {}s):\n\
             \t\t‖ {} shares ({} shares/s)\n\
             \t\t‖ {} blocks found\n\
             \t\t‖ Hashrate: {}\n\
             \t\t‖ About {} hashes computed\n\
             \t\t‖ Total mining time: {}\n\
             \t\t‖ CRC8 Error Rate: {} E/s\n\
             \t\t‖ I2C Retry Rate: {} R/s",
            self.period.as_secs(),
            self.shares,
            self.shares_per_sec,
            self.blocks,
            format_prefix(self.hashrate, "H/s", 2),
            self.hashes,
            format_uptime(self.uptime),
            self.checksum_error_rate,
            self.bus_retry_rate,
        )
    }
}

/// Emits a [`Report`] once per interval, with deltas since the previous one.
#[derive(Debug)]
pub struct ReportScheduler {
    interval: Duration,
    period_start: Instant,
    last: CounterSnapshot,
}

impl ReportScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            period_start: now,
            last: CounterSnapshot::default(),
        }
    }

    pub fn maybe_report(
        &mut self,
        now: Instant,
        counters: CounterSnapshot,
        hashrate: f64,
        uptime: Duration,
    ) -> Option<Report> {
        let period = now.saturating_duration_since(self.period_start);
        if period < self.interval {
            return None;
        }
        let secs = period.as_secs_f64().round().max(1.0);
        let shares = counters.accepted.saturating_sub(self.last.accepted);
        let checksum = counters
            .checksum_failures
            .saturating_sub(self.last.checksum_failures);
        let retries = counters.bus_retries.saturating_sub(self.last.bus_retries);

        self.period_start = now;
        self.last = counters;

        Some(Report {
            period: Duration::from_secs(secs as u64),
            shares,
            shares_per_sec: round_to(shares as f64 / secs, 1),
            blocks: counters.blocks,
            hashrate,
            hashes: (hashrate * secs) as u64,
            uptime,
            checksum_error_rate: round_to(checksum as f64 / secs, 6),
            bus_retry_rate: round_to(retries as f64 / secs, 6),
        })
    }
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        7200.. => format!("{} hours", secs / 3600),
        3600.. => format!("{} hour", secs / 3600),
        120.. => format!("{} minutes", secs / 60),
        60.. => format!("{} minute", secs / 60),
        _ => format!("{secs} seconds"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_keeps_last_samples() {
        let mut w = RollingWindow::new(3);
        assert_eq!(w.mean(), 0.0);
        w.push(1.0);
        w.push(2.0);
        assert_eq!(w.push(3.0), 2.0);
        assert_eq!(w.push(10.0), 5.0);
        assert_eq!(w.samples.len(), 3);
    }

    #[test]
    fn worker_windows_have_fixed_sizes() {
        let mut s = WorkerStats::default();
        for i in 1..=7 {
            s.record_hashrate(i as f64);
        }
        // last five: 3..=7
        assert_eq!(s.hashrate(), 5.0);
        for _ in 0..12 {
            s.record_ping(Duration::from_millis(40));
        }
        assert_eq!(s.record_ping(Duration::from_millis(150)), 51.0);
    }

    #[test]
    fn feedback_moves_the_right_counters() {
        let c = SessionCounters::default();
        c.apply(&Feedback::Good);
        c.apply(&Feedback::Block);
        c.apply(&Feedback::Bad(Some("LowDifficulty".into())));
        c.apply(&Feedback::Unknown(vec!["ERR".into()]));
        c.inc_checksum_failure();
        c.inc_bus_retry();
        c.inc_bus_retry();
        assert_eq!(
            c.snapshot(),
            CounterSnapshot {
                accepted: 2,
                rejected: 2,
                blocks: 1,
                checksum_failures: 1,
                bus_retries: 2,
            }
        );
    }

    #[test]
    fn board_sums_workers() {
        let b = HashrateBoard::new(2);
        b.set(0, 100.0);
        b.set(1, 50.5);
        b.set(7, 1e9);
        assert_eq!(b.total(), 150.5);
    }

    #[test]
    fn scheduler_reports_deltas_per_interval() {
        let t0 = Instant::now();
        let mut sched = ReportScheduler::new(Duration::from_secs(60), t0);
        let mut snap = CounterSnapshot {
            accepted: 30,
            blocks: 1,
            checksum_failures: 6,
            bus_retries: 12,
            ..Default::default()
        };
        assert!(
            sched
                .maybe_report(t0 + Duration::from_secs(59), snap, 100.0, Duration::ZERO)
                .is_none()
        );

        let r = sched
            .maybe_report(t0 + Duration::from_secs(60), snap, 100.0, Duration::from_secs(60))
            .unwrap();
        assert_eq!(r.shares, 30);
        assert_eq!(r.shares_per_sec, 0.5);
        assert_eq!(r.hashes, 6000);
        assert_eq!(r.checksum_error_rate, 0.1);
        assert_eq!(r.bus_retry_rate, 0.2);

        snap.accepted = 36;
        let r = sched
            .maybe_report(t0 + Duration::from_secs(120), snap, 100.0, Duration::from_secs(120))
            .unwrap();
        assert_eq!(r.shares, 6);
        assert_eq!(r.blocks, 1);
        assert_eq!(r.checksum_error_rate, 0.0);
        assert!(r.render().contains("2 minutes"));
    }

    #[test]
    fn uptime_wording() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42 seconds");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1 minute");
        assert_eq!(format_uptime(Duration::from_secs(150)), "2 minutes");
        assert_eq!(format_uptime(Duration::from_secs(3700)), "1 hour");
        assert_eq!(format_uptime(Duration::from_secs(7300)), "2 hours");
    }
}
