//! Process resource tracing via procfs.
//!
//! The tracer attaches to a spawned child and is sampled while the child
//! runs. Counters unavailable on the current platform stay zero.

use ccw_common::ResourceUsage;
use std::time::{Duration, Instant};

/// Sampling cadence for the first ten seconds of an execution.
pub const FAST_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
/// Sampling cadence after the first ten seconds.
pub const SLOW_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// Wall-clock point at which sampling slows down.
pub const FAST_SAMPLE_WINDOW: Duration = Duration::from_secs(10);

/// Tracks one child process from attach to finalization.
#[derive(Debug, Default)]
pub struct ProcessTracer {
    pid: Option<u32>,
    started: Option<Instant>,
    max_rss_kb: u64,
    cpu_ms: u64,
    io_baseline: Option<(u64, u64)>,
    io_read_kb: u64,
    io_write_kb: u64,
}

impl ProcessTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to a child pid and record the IO baseline.
    pub fn attach(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.started = Some(Instant::now());
        self.io_baseline = read_io_counters(pid);
    }

    /// Interval to sleep before the next sample, given time since attach.
    pub fn sample_interval(&self) -> Duration {
        let elapsed = self
            .started
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO);
        if elapsed < FAST_SAMPLE_WINDOW {
            FAST_SAMPLE_INTERVAL
        } else {
            SLOW_SAMPLE_INTERVAL
        }
    }

    /// Take one sample of the child's current counters.
    pub fn sample(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Some(rss_kb) = read_rss_kb(pid) {
            self.max_rss_kb = self.max_rss_kb.max(rss_kb);
        }
        if let Some(cpu_ms) = read_cpu_ms(pid) {
            self.cpu_ms = self.cpu_ms.max(cpu_ms);
        }
        if let (Some((read0, write0)), Some((read1, write1))) =
            (self.io_baseline, read_io_counters(pid))
        {
            self.io_read_kb = read1.saturating_sub(read0) / 1024;
            self.io_write_kb = write1.saturating_sub(write0) / 1024;
        }
    }

    /// Final usage. Takes a last sample first so short-lived children still
    /// report CPU time.
    pub fn usage(&mut self) -> ResourceUsage {
        self.sample();
        ResourceUsage {
            cpu_ms: self.cpu_ms,
            rss_max_kb: self.max_rss_kb,
            io_read_kb: self.io_read_kb,
            io_write_kb: self.io_write_kb,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        // VmHWM is the high-water mark; fall back to VmRSS when absent.
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            return parse_kb_field(rest);
        }
    }
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:").and_then(parse_kb_field))
}

#[cfg(target_os = "linux")]
fn parse_kb_field(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

#[cfg(target_os = "linux")]
fn read_cpu_ms(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesized comm; utime and stime are fields 14/15
    // of the full line, i.e. offsets 11/12 past the comm.
    let after_comm = stat.rsplit(')').next()?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    Some((utime + stime) * 1000 / ticks_per_sec as u64)
}

#[cfg(target_os = "linux")]
fn read_io_counters(pid: u32) -> Option<(u64, u64)> {
    let io = std::fs::read_to_string(format!("/proc/{pid}/io")).ok()?;
    let mut read_bytes = None;
    let mut write_bytes = None;
    for line in io.lines() {
        if let Some(rest) = line.strip_prefix("read_bytes:") {
            read_bytes = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("write_bytes:") {
            write_bytes = rest.trim().parse().ok();
        }
    }
    Some((read_bytes?, write_bytes?))
}

#[cfg(not(target_os = "linux"))]
fn read_rss_kb(_pid: u32) -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_ms(_pid: u32) -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_io_counters(_pid: u32) -> Option<(u64, u64)> {
    None
}
