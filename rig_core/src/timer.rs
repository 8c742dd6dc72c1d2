//! Timer loop that drives the scheduler.
//!
//! The engine itself is time-agnostic; this module is the one place that
//! knows about wall clocks. It calls [`Scheduler::advance`] at
//! `tic_hz * FREQ_MULTIPLIER` with drift-free absolute-time pacing when
//! built with the `rt` feature (`clock_nanosleep(TIMER_ABSTIME)` on
//! `CLOCK_MONOTONIC`, after `mlockall` + CPU pinning + `SCHED_FIFO`),
//! and with plain `std::thread::sleep` otherwise. An overrun is counted
//! and logged but never aborts the loop: a late tic is recoverable, a
//! dead engine is not.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rig_common::error::RigError;

use crate::critical::Shared;
use crate::scheduler::Scheduler;

// ─── Timing statistics ───────────────────────────────────────────────────────

/// O(1) per-period timing statistics, updated every period with no
/// allocation.
#[derive(Debug, Clone)]
pub struct TicStats {
    /// Timer periods executed.
    pub period_count: u64,
    /// Last period body duration [ns].
    pub last_period_ns: i64,
    /// Minimum period body duration [ns].
    pub min_period_ns: i64,
    /// Maximum period body duration [ns].
    pub max_period_ns: i64,
    /// Running sum for average computation.
    pub sum_period_ns: i64,
    /// Periods whose body overran the budget.
    pub overruns: u64,
    /// Maximum wake-up latency [ns] (expected vs actual wake).
    pub max_latency_ns: i64,
}

impl TicStats {
    pub const fn new() -> Self {
        Self {
            period_count: 0,
            last_period_ns: 0,
            min_period_ns: i64::MAX,
            max_period_ns: 0,
            sum_period_ns: 0,
            overruns: 0,
            max_latency_ns: 0,
        }
    }

    /// Record one period. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, duration_ns: i64, latency_ns: i64) {
        self.period_count += 1;
        self.last_period_ns = duration_ns;
        if duration_ns < self.min_period_ns {
            self.min_period_ns = duration_ns;
        }
        if duration_ns > self.max_period_ns {
            self.max_period_ns = duration_ns;
        }
        self.sum_period_ns += duration_ns;
        if latency_ns > self.max_latency_ns {
            self.max_latency_ns = latency_ns;
        }
    }

    /// Average period body time [ns] (0 before the first period).
    #[inline]
    pub fn avg_period_ns(&self) -> i64 {
        if self.period_count == 0 {
            0
        } else {
            self.sum_period_ns / self.period_count as i64
        }
    }
}

impl Default for TicStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── RT setup ────────────────────────────────────────────────────────────────

/// Lock all current and future memory pages so the loop never page
/// faults.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), RigError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| RigError::Fatal(format!("mlockall failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), RigError> {
    Ok(())
}

/// Touch a large stack allocation so the pages exist before the loop
/// starts.
fn prefault_stack() {
    let mut buf = [0u8; 1024 * 1024];
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the current thread to one CPU core.
#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), RigError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| RigError::Fatal(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| RigError::Fatal(format!("sched_setaffinity failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), RigError> {
    Ok(())
}

/// Set `SCHED_FIFO` with the given priority.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), RigError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(RigError::Fatal(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), RigError> {
    Ok(())
}

/// Full RT setup sequence, called once before entering the loop. Every
/// step is a no-op without the `rt` feature except the stack prefault,
/// which is harmless everywhere.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), RigError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

// ─── Tic loop ────────────────────────────────────────────────────────────────

/// Drives a shared scheduler at a fixed timer rate until told to stop.
pub struct TicLoop {
    engine: Arc<Shared<Scheduler>>,
    stop: Arc<AtomicBool>,
    period_ns: i64,
    stats: TicStats,
}

impl TicLoop {
    /// `timer_hz` is the full timer rate, already multiplied by the
    /// sub-tic factor (see [`RigConfig::timer_hz`]).
    ///
    /// [`RigConfig::timer_hz`]: rig_common::config::RigConfig::timer_hz
    pub fn new(
        engine: Arc<Shared<Scheduler>>,
        stop: Arc<AtomicBool>,
        timer_hz: u32,
    ) -> Result<Self, RigError> {
        if timer_hz == 0 {
            return Err(RigError::Config("timer rate must be > 0"));
        }
        Ok(Self {
            engine,
            stop,
            period_ns: 1_000_000_000 / i64::from(timer_hz),
            stats: TicStats::new(),
        })
    }

    /// Run until the stop flag is raised. Returns the accumulated
    /// timing statistics.
    pub fn run(mut self) -> Result<TicStats, RigError> {
        #[cfg(feature = "rt")]
        {
            self.run_rt_loop()?;
        }

        #[cfg(not(feature = "rt"))]
        {
            self.run_sim_loop();
        }

        Ok(self.stats)
    }

    #[inline]
    fn period_body(&mut self) {
        self.engine.with(|scheduler| scheduler.advance());
    }

    fn note_overrun(&mut self, duration_ns: i64) {
        self.stats.overruns += 1;
        tracing::warn!(
            duration_ns,
            budget_ns = self.period_ns,
            overruns = self.stats.overruns,
            "timer period overran its budget"
        );
    }

    /// Absolute-time pacing on `CLOCK_MONOTONIC`.
    #[cfg(feature = "rt")]
    fn run_rt_loop(&mut self) -> Result<(), RigError> {
        use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};

        let clock = ClockId::CLOCK_MONOTONIC;
        let mut next_wake = clock_gettime(clock)
            .map_err(|e| RigError::Fatal(format!("clock_gettime: {e}")))?;

        while !self.stop.load(Ordering::Relaxed) {
            next_wake = timespec_add_ns(next_wake, self.period_ns);

            let period_start = clock_gettime(clock)
                .map_err(|e| RigError::Fatal(format!("clock_gettime: {e}")))?;
            let wake_latency_ns = timespec_diff_ns(&period_start, &next_wake).abs();

            self.period_body();

            let period_end = clock_gettime(clock)
                .map_err(|e| RigError::Fatal(format!("clock_gettime: {e}")))?;
            let duration_ns = timespec_diff_ns(&period_end, &period_start);
            self.stats.record(duration_ns, wake_latency_ns);

            if duration_ns > self.period_ns {
                self.note_overrun(duration_ns);
            }

            let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &next_wake);
        }
        Ok(())
    }

    /// Approximate pacing with `std::thread::sleep`.
    #[cfg(not(feature = "rt"))]
    fn run_sim_loop(&mut self) {
        use std::time::{Duration, Instant};

        let period = Duration::from_nanos(self.period_ns as u64);

        while !self.stop.load(Ordering::Relaxed) {
            let period_start = Instant::now();

            self.period_body();

            let elapsed = period_start.elapsed();
            let duration_ns = elapsed.as_nanos() as i64;
            self.stats.record(duration_ns, 0);

            if duration_ns > self.period_ns {
                self.note_overrun(duration_ns);
            }

            if let Some(remaining) = period.checked_sub(elapsed) {
                std::thread::sleep(remaining);
            }
        }
    }
}

// ─── Time helpers ────────────────────────────────────────────────────────────

#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
