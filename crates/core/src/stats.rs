//! Statistics sink for protocol engines
//!
//! Engines report two events: an execution attempt (including re-executions
//! after an abort) and a finalized commit with its latency. Counters are
//! relaxed atomics since they are diagnostic only.
//!
//! Latency percentiles come from a reservoir of at most [`SAMPLE`] values.
//! The replacement index is derived by hashing the commit counter, so the
//! reservoir is deterministic for a given commit sequence and needs no
//! locking.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of latency samples retained for percentile reporting
pub const SAMPLE: usize = 1000;

/// Shared statistics sink
///
/// One instance is shared by every worker of an engine (and may be shared
/// across engines). All methods take `&self`.
pub struct Statistics {
    count_commit: AtomicU64,
    count_execution: AtomicU64,
    count_latency_25us: AtomicU64,
    count_latency_50us: AtomicU64,
    count_latency_100us: AtomicU64,
    count_latency_100us_above: AtomicU64,
    sample_latency: Vec<AtomicU64>,
}

impl Statistics {
    /// Create an empty sink
    pub fn new() -> Self {
        Statistics {
            count_commit: AtomicU64::new(0),
            count_execution: AtomicU64::new(0),
            count_latency_25us: AtomicU64::new(0),
            count_latency_50us: AtomicU64::new(0),
            count_latency_100us: AtomicU64::new(0),
            count_latency_100us_above: AtomicU64::new(0),
            sample_latency: (0..SAMPLE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Count one (re-)execution attempt
    pub fn journal_execute(&self) {
        self.count_execution.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one finalized commit and record its latency in microseconds
    pub fn journal_commit(&self, latency_us: u64) {
        let n = self.count_commit.fetch_add(1, Ordering::Relaxed);
        if latency_us <= 25 {
            self.count_latency_25us.fetch_add(1, Ordering::Relaxed);
        } else if latency_us <= 50 {
            self.count_latency_50us.fetch_add(1, Ordering::Relaxed);
        } else if latency_us <= 100 {
            self.count_latency_100us.fetch_add(1, Ordering::Relaxed);
        } else {
            self.count_latency_100us_above.fetch_add(1, Ordering::Relaxed);
        }
        // Reservoir: the first SAMPLE commits fill the buffer, after that
        // commit n replaces a pseudo-random slot with probability SAMPLE/(n+1).
        if (n as usize) < SAMPLE {
            self.sample_latency[n as usize].store(latency_us, Ordering::Relaxed);
        } else {
            let r = splitmix64(n) % (n + 1);
            if (r as usize) < SAMPLE {
                self.sample_latency[r as usize].store(latency_us, Ordering::Relaxed);
            }
        }
    }

    /// Number of finalized commits so far
    pub fn commits(&self) -> u64 {
        self.count_commit.load(Ordering::Relaxed)
    }

    /// Number of execution attempts so far
    pub fn executions(&self) -> u64 {
        self.count_execution.load(Ordering::Relaxed)
    }

    fn sorted_samples(&self) -> Vec<u64> {
        let filled = (self.commits() as usize).min(SAMPLE);
        let mut samples: Vec<u64> = self.sample_latency[..filled]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();
        samples.sort_unstable();
        samples
    }

    fn percentile(samples: &[u64], pct: usize) -> u64 {
        if samples.is_empty() {
            return 0;
        }
        let idx = (pct * samples.len() / 100).min(samples.len() - 1);
        samples[idx]
    }

    /// Render absolute counters and latency percentiles
    pub fn print(&self) -> String {
        let samples = self.sorted_samples();
        let mut out = String::new();
        let _ = writeln!(out, "commit             {}", self.commits());
        let _ = writeln!(out, "execution          {}", self.executions());
        let _ = writeln!(
            out,
            "25us               {}",
            self.count_latency_25us.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "50us               {}",
            self.count_latency_50us.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "100us              {}",
            self.count_latency_100us.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            ">100us             {}",
            self.count_latency_100us_above.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "latency(50%)       {}us", Self::percentile(&samples, 50));
        let _ = writeln!(out, "latency(75%)       {}us", Self::percentile(&samples, 75));
        let _ = writeln!(out, "latency(95%)       {}us", Self::percentile(&samples, 95));
        let _ = writeln!(out, "latency(99%)       {}us", Self::percentile(&samples, 99));
        out
    }

    /// Render counters normalized to per-second rates over `duration`
    pub fn print_with_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs_f64().max(f64::MIN_POSITIVE);
        let rate = |count: &AtomicU64| count.load(Ordering::Relaxed) as f64 / secs;
        let samples = self.sorted_samples();
        let mut out = String::new();
        let _ = writeln!(out, "duration      {:?}", duration);
        let _ = writeln!(out, "commit        {:.4} tx/s", rate(&self.count_commit));
        let _ = writeln!(out, "execution     {:.4} tx/s", rate(&self.count_execution));
        let _ = writeln!(out, "25us          {:.4} tx/s", rate(&self.count_latency_25us));
        let _ = writeln!(out, "50us          {:.4} tx/s", rate(&self.count_latency_50us));
        let _ = writeln!(out, "100us         {:.4} tx/s", rate(&self.count_latency_100us));
        let _ = writeln!(
            out,
            ">100us        {:.4} tx/s",
            rate(&self.count_latency_100us_above)
        );
        let _ = writeln!(out, "latency(50%)  {}us", Self::percentile(&samples, 50));
        let _ = writeln!(out, "latency(75%)  {}us", Self::percentile(&samples, 75));
        let _ = writeln!(out, "latency(95%)  {}us", Self::percentile(&samples, 95));
        let _ = writeln!(out, "latency(99%)  {}us", Self::percentile(&samples, 99));
        out
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

// Mixer from the splitmix64 generator; good avalanche, no state.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
