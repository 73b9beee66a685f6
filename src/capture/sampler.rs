//! Software overflow driver.
//!
//! Runs one thread per simulated core, each calling
//! [`CaptureTrigger::on_overflow`] at a fixed tick. Paired with
//! [`SoftwareCounters`] this exercises the whole pipeline without access to
//! hardware counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::record::NUM_COUNTERS;
use super::trigger::{CaptureTrigger, CounterSource};

/// Samples taken on a core before its simulated task switches.
const SAMPLES_PER_TASK: u64 = 64;

/// Counter source backed by the monotonic clock.
///
/// Cycles are nanoseconds since construction. Event counter `i` reports the
/// nanoseconds since the last re-arm shifted right by `i`, so every counter
/// resets on re-arm like a hardware accumulator. The running pid rotates
/// through `pids` every 64 samples.
pub struct SoftwareCounters {
    epoch: Instant,
    pids: Vec<u32>,
    armed_at: Box<[AtomicU64]>,
    ticks: Box<[AtomicU64]>,
}

impl SoftwareCounters {
    pub fn new(cores: usize, pids: Vec<u32>) -> Self {
        Self {
            epoch: Instant::now(),
            pids,
            armed_at: (0..cores).map(|_| AtomicU64::new(0)).collect(),
            ticks: (0..cores).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl CounterSource for SoftwareCounters {
    fn read_cycles(&self, _core: u32) -> u64 {
        self.now_ns()
    }

    fn read_counter(&self, core: u32, index: usize) -> u32 {
        let armed = self
            .armed_at
            .get(core as usize)
            .map_or(0, |a| a.load(Ordering::Relaxed));
        let delta = self.now_ns().saturating_sub(armed);
        u32::try_from(delta >> index).unwrap_or(u32::MAX)
    }

    fn counter_count(&self) -> usize {
        NUM_COUNTERS
    }

    fn current_pid(&self, core: u32) -> u32 {
        let Some(ticks) = self.ticks.get(core as usize) else {
            return 0;
        };
        let tick = ticks.fetch_add(1, Ordering::Relaxed);
        if self.pids.is_empty() {
            return 0;
        }
        let slot = (tick / SAMPLES_PER_TASK + u64::from(core)) % self.pids.len() as u64;
        self.pids.get(slot as usize).copied().unwrap_or_default()
    }

    fn rearm(&self, core: u32, _period: u32) {
        if let Some(armed) = self.armed_at.get(core as usize) {
            armed.store(self.now_ns(), Ordering::Relaxed);
        }
    }
}

/// Drives a trigger from per-core threads until stopped.
pub struct Sampler {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<u64>>,
}

impl Sampler {
    /// Spawns one sampling thread per core of `trigger`.
    pub fn spawn<C>(trigger: Arc<CaptureTrigger<C>>, tick: Duration) -> Result<Self>
    where
        C: CounterSource + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(trigger.cores());

        for core in 0..trigger.cores() as u32 {
            let trigger = Arc::clone(&trigger);
            let stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("sampler-{core}"))
                .spawn(move || {
                    let mut overflows = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        trigger.on_overflow(core);
                        overflows += 1;
                        thread::sleep(tick);
                    }
                    overflows
                })
                .with_context(|| format!("spawning sampler thread for core {core}"))?;
            workers.push(handle);
        }

        Ok(Self { stop, workers })
    }

    /// Stops every sampling thread and waits for them to exit.
    pub fn stop(self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        let mut total = 0;
        for (core, worker) in self.workers.into_iter().enumerate() {
            match worker.join() {
                Ok(n) => {
                    debug!(core, overflows = n, "sampler thread stopped");
                    total += n;
                }
                Err(_) => warn!(core, "sampler thread panicked"),
            }
        }
        total
    }
}
