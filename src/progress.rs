//! # Progress: Hunt Request Counters
//!
//! Thread-safe tallies shared between hunt callers and the background status
//! reporter. Callers update atomics lock-free from rayon workers; the
//! reporter reads them on an interval and logs a summary line.
//!
//! The reporter polls its shutdown flag every 100ms, so `stop` followed by
//! joining the handle returns promptly even with a long report interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const POLL: Duration = Duration::from_millis(100);

pub struct Progress {
    /// Discovery requests finished, whatever their outcome.
    pub requests: AtomicU64,
    pub discovered: AtomicU64,
    /// Requests whose time budget ran out.
    pub timed_out: AtomicU64,
    /// Requests that failed with an error.
    pub faults: AtomicU64,
    /// Largest prime handed out so far.
    pub largest: AtomicU64,
    start: Instant,
    shutdown: AtomicBool,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub requests: u64,
    pub discovered: u64,
    pub timed_out: u64,
    pub faults: u64,
    pub largest: u64,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Progress {
            requests: AtomicU64::new(0),
            discovered: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            largest: AtomicU64::new(0),
            start: Instant::now(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn record_discovery(&self, number: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.discovered.fetch_add(1, Ordering::Relaxed);
        self.largest.fetch_max(number, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            requests: self.requests.load(Ordering::Relaxed),
            discovered: self.discovered.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            largest: self.largest.load(Ordering::Relaxed),
        }
    }

    pub fn start_reporter(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let progress = Arc::clone(self);
        thread::spawn(move || {
            let mut last = Instant::now();
            while !progress.shutdown.load(Ordering::Relaxed) {
                thread::sleep(POLL);
                if last.elapsed() >= interval {
                    progress.print_status();
                    last = Instant::now();
                }
            }
        })
    }

    pub fn print_status(&self) {
        let elapsed = self.start.elapsed();
        let snap = self.snapshot();
        let rate = if elapsed.as_secs() > 0 {
            snap.discovered as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let h = elapsed.as_secs() / 3600;
        let m = (elapsed.as_secs() % 3600) / 60;
        let s = elapsed.as_secs() % 60;
        info!(
            requests = snap.requests,
            discovered = snap.discovered,
            timed_out = snap.timed_out,
            faults = snap.faults,
            largest = snap.largest,
            rate = format_args!("{:.2}", rate),
            elapsed = format_args!("{:02}:{:02}:{:02}", h, m, s),
            "hunt progress"
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
