//! Adaptive scheduling: the frame-skip gate and the CPU core budget.
//!
//! The gate runs inference on one of every K frames (`counter mod K == 0`), which
//! bounds CPU use while keeping the temporal sampling roughly uniform. Skipped frames
//! cost nothing beyond the read. Both K and the core budget are fixed at startup.

use anyhow::Result;
use std::time::Duration;

use crate::config::ScheduleSettings;

/// Counters kept by the gate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub processed: u64,
    pub skipped: u64,
    pub inference_total: Duration,
    pub inference_worst: Duration,
    /// Inferences slower than the time budget one processed frame is allowed.
    pub budget_misses: u64,
}

impl SchedulerStats {
    pub fn mean_inference(&self) -> Duration {
        if self.processed == 0 {
            Duration::ZERO
        } else {
            self.inference_total.div_f64(self.processed as f64)
        }
    }
}

pub struct FrameScheduler {
    interval: u64,
    counter: u64,
    inference_budget: Option<Duration>,
    stats: SchedulerStats,
}

impl FrameScheduler {
    pub fn new(settings: &ScheduleSettings, target_fps: u32) -> Self {
        let interval = settings.frame_skip_interval.max(1);
        // With K-frame skipping each inference has K frame periods to finish.
        let inference_budget = (target_fps > 0)
            .then(|| Duration::from_millis(1000 * interval / target_fps as u64));
        Self {
            interval,
            counter: 0,
            inference_budget,
            stats: SchedulerStats::default(),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Decide whether the next frame is inferred. Call exactly once per frame read.
    pub fn should_process(&mut self) -> bool {
        let process = self.counter % self.interval == 0;
        self.counter = self.counter.wrapping_add(1);
        if process {
            self.stats.processed += 1;
        } else {
            self.stats.skipped += 1;
        }
        process
    }

    pub fn record_inference(&mut self, elapsed: Duration) {
        self.stats.inference_total += elapsed;
        if elapsed > self.stats.inference_worst {
            self.stats.inference_worst = elapsed;
        }
        if self.inference_budget.is_some_and(|budget| elapsed > budget) {
            self.stats.budget_misses += 1;
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}

/// Outcome of applying the core budget at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreBudget {
    /// The process is pinned to these cores.
    Pinned(Vec<usize>),
    /// Budget covers every core the process may already use.
    Unrestricted,
    /// Affinity is not available on this platform.
    Unsupported,
}

/// Pick the lowest-numbered `budget` cores out of the allowed set.
pub fn select_cores(allowed: &[usize], budget: usize) -> Vec<usize> {
    let mut cores = allowed.to_vec();
    cores.sort_unstable();
    cores.dedup();
    cores.truncate(budget.max(1));
    cores
}

/// Restrict the calling thread (and every thread it spawns later) to the budget.
///
/// Call before any worker thread is started.
pub fn apply_core_budget(budget: usize) -> Result<CoreBudget> {
    #[cfg(target_os = "linux")]
    {
        let allowed = affinity::allowed_cores()?;
        if budget >= allowed.len() {
            return Ok(CoreBudget::Unrestricted);
        }
        let cores = select_cores(&allowed, budget);
        affinity::pin_to(&cores)?;
        Ok(CoreBudget::Pinned(cores))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = budget;
        Ok(CoreBudget::Unsupported)
    }
}

#[cfg(target_os = "linux")]
mod affinity {
    use anyhow::{Context, Result};

    pub(super) fn allowed_cores() -> Result<Vec<usize>> {
        // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        // SAFETY: the pointer and size describe a live cpu_set_t.
        let rc =
            unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("sched_getaffinity");
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            // SAFETY: index is below CPU_SETSIZE.
            .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
            .collect())
    }

    pub(super) fn pin_to(cores: &[usize]) -> Result<()> {
        // SAFETY: as above.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &cpu in cores {
            // SAFETY: cores come from sched_getaffinity, so each is below CPU_SETSIZE.
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        // SAFETY: the pointer and size describe a live cpu_set_t.
        let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("sched_setaffinity");
        }
        Ok(())
    }
}
