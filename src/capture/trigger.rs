//! Per-overflow sample capture.
//!
//! [`CaptureTrigger::on_overflow`] is the producer side of the pipeline. It
//! runs once per counter overflow on the core that overflowed, takes only that
//! core's slot lock and the pool's set locks, and never allocates.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::control::{Control, Knob, StatusRequest};
use super::pool::SampleBufferPool;
use super::record::{Buffer, Sample, NUM_COUNTERS};

/// Architecture-specific counter register access.
pub trait CounterSource: Send + Sync {
    /// Current cycle counter value on `core`.
    fn read_cycles(&self, core: u32) -> u64;

    /// Current value of event counter `index` on `core`.
    fn read_counter(&self, core: u32, index: usize) -> u32;

    /// Number of event counters the hardware provides.
    fn counter_count(&self) -> usize {
        NUM_COUNTERS
    }

    /// Pid of the task running on `core`.
    fn current_pid(&self, core: u32) -> u32;

    /// Restarts the overflow period and resets the event accumulators.
    fn rearm(&self, core: u32, period: u32);
}

/// What a single overflow did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Sample appended to the core's active buffer.
    Recorded,
    /// Sample appended and the buffer handed to the full set.
    Published,
    /// No free buffer; the sample was dropped and counted.
    Missed,
    /// Capture is not running or the core is unknown.
    Ignored,
}

/// Owns one active-buffer slot per core and fills it on overflow.
pub struct CaptureTrigger<C> {
    pool: Arc<SampleBufferPool>,
    control: Arc<Control>,
    counters: C,
    active: Box<[Mutex<Option<Box<Buffer>>>]>,
}

impl<C: CounterSource> CaptureTrigger<C> {
    pub fn new(pool: Arc<SampleBufferPool>, control: Arc<Control>, counters: C, cores: usize) -> Self {
        Self {
            pool,
            control,
            counters,
            active: (0..cores).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn cores(&self) -> usize {
        self.active.len()
    }

    pub fn pool(&self) -> &Arc<SampleBufferPool> {
        &self.pool
    }

    pub fn control(&self) -> &Arc<Control> {
        &self.control
    }

    pub fn counters(&self) -> &C {
        &self.counters
    }

    /// Records one sample for `core`.
    pub fn on_overflow(&self, core: u32) -> CaptureOutcome {
        self.control.record_overflow();

        if !self.control.is_running() || self.pool.is_shutdown() {
            return CaptureOutcome::Ignored;
        }
        let Some(slot) = self.active.get(core as usize) else {
            return CaptureOutcome::Ignored;
        };

        let period = self.control.active_period();
        let mut slot = slot.lock();

        if slot.is_none() {
            // A stop may have flushed this slot after the check above.
            if !self.control.is_running() {
                return CaptureOutcome::Ignored;
            }
            match self.pool.acquire_free() {
                Some(mut buffer) => {
                    buffer.reset(core);
                    *slot = Some(buffer);
                }
                None => {
                    self.control.record_missed();
                    self.counters.rearm(core, period);
                    return CaptureOutcome::Missed;
                }
            }
        }

        let sample = self.snapshot(core, period);
        let filled = match slot.as_mut() {
            Some(buffer) => buffer.push(sample),
            None => false,
        };

        let outcome = if filled {
            if let Some(buffer) = slot.take() {
                self.pool.publish_full(buffer);
            }
            CaptureOutcome::Published
        } else {
            CaptureOutcome::Recorded
        };

        self.counters.rearm(core, period);
        outcome
    }

    fn snapshot(&self, core: u32, period: u32) -> Sample {
        let mut counters = [0u32; NUM_COUNTERS];
        let available = self.counters.counter_count().min(NUM_COUNTERS);
        for (index, value) in counters.iter_mut().enumerate().take(available) {
            *value = self.counters.read_counter(core, index);
        }

        Sample {
            cycles: self.counters.read_cycles(core).wrapping_add(u64::from(period)),
            pid: self.counters.current_pid(core),
            counters,
        }
    }

    /// Starts capture: clamps the period, reopens the pool and returns any
    /// stale active buffers to the free set.
    pub fn start(&self) {
        for slot in self.active.iter() {
            if let Some(buffer) = slot.lock().take() {
                self.pool.release_free(buffer);
            }
        }
        self.pool.resume();
        let period = self.control.begin();
        for core in 0..self.active.len() {
            self.counters.rearm(core as u32, period);
        }
        info!(period, cores = self.active.len(), "capture started");
    }

    /// Stops capture: flushes partially filled buffers to the full set and
    /// wakes blocked readers, which drain what remains then see end of stream.
    pub fn stop(&self) {
        self.control.halt();
        let flushed = self.flush_active();
        self.pool.shutdown();
        info!(
            flushed,
            missed = self.control.missed(),
            overflows = self.control.overflows(),
            "capture stopped",
        );
    }

    /// Publishes every non-empty active buffer. Returns how many were published.
    pub fn flush_active(&self) -> usize {
        let mut flushed = 0;
        for slot in self.active.iter() {
            let Some(buffer) = slot.lock().take() else {
                continue;
            };
            if buffer.is_empty() {
                self.pool.release_free(buffer);
            } else {
                debug!(core = buffer.core(), samples = buffer.len(), "flushing partial buffer");
                self.pool.publish_full(buffer);
                flushed += 1;
            }
        }
        flushed
    }

    /// Applies a control-file write, acting on status changes.
    pub fn apply(&self, knob: Knob, raw: &str) -> Result<()> {
        match self.control.write(knob, raw)? {
            None => {}
            Some(StatusRequest::Start) => self.start(),
            Some(StatusRequest::Stop) => self.stop(),
            Some(StatusRequest::Dump) => {
                let stats = self.pool.stats();
                info!(
                    period = self.control.active_period(),
                    missed = self.control.missed(),
                    overflows = self.control.overflows(),
                    free = stats.free,
                    full = stats.full,
                    status = %self.control.status(),
                    "capture state",
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use super::*;
    use crate::capture::record::BUFFER_ENTRIES;

    #[derive(Default)]
    struct FakeCounters {
        cycles: AtomicU64,
        pid: AtomicU32,
        rearms: AtomicU32,
        last_period: AtomicU32,
    }

    impl CounterSource for FakeCounters {
        fn read_cycles(&self, _core: u32) -> u64 {
            self.cycles.fetch_add(10, Ordering::Relaxed)
        }

        fn read_counter(&self, core: u32, index: usize) -> u32 {
            core * 100 + index as u32
        }

        fn counter_count(&self) -> usize {
            4
        }

        fn current_pid(&self, _core: u32) -> u32 {
            self.pid.load(Ordering::Relaxed)
        }

        fn rearm(&self, _core: u32, period: u32) {
            self.rearms.fetch_add(1, Ordering::Relaxed);
            self.last_period.store(period, Ordering::Relaxed);
        }
    }

    fn trigger(buffers: usize, cores: usize) -> CaptureTrigger<FakeCounters> {
        let pool = Arc::new(SampleBufferPool::new(buffers));
        let control = Arc::new(Control::new(20_000, &[]));
        CaptureTrigger::new(pool, control, FakeCounters::default(), cores)
    }

    #[test]
    fn test_ignored_until_started() {
        let t = trigger(2, 1);
        assert_eq!(t.on_overflow(0), CaptureOutcome::Ignored);
        assert_eq!(t.control().overflows(), 1);
        assert_eq!(t.pool().stats().free, 2);
    }

    #[test]
    fn test_unknown_core_ignored() {
        let t = trigger(2, 1);
        t.start();
        assert_eq!(t.on_overflow(5), CaptureOutcome::Ignored);
    }

    #[test]
    fn test_sample_contents() {
        let t = trigger(2, 2);
        t.start();
        t.counters().pid.store(77, Ordering::Relaxed);
        t.counters().cycles.store(1_000, Ordering::Relaxed);

        assert_eq!(t.on_overflow(1), CaptureOutcome::Recorded);
        assert_eq!(t.counters().last_period.load(Ordering::Relaxed), 20_000);

        assert_eq!(t.flush_active(), 1);
        let buf = t.pool().drain_full().unwrap();
        assert_eq!(buf.core(), 1);
        let s = buf.samples()[0];
        assert_eq!(s.pid, 77);
        assert_eq!(s.cycles, 1_000 + 20_000);
        assert_eq!(s.counters, [100, 101, 102, 103, 0, 0]);
    }

    #[test]
    fn test_full_buffer_published() {
        let t = trigger(2, 1);
        t.start();
        for _ in 0..BUFFER_ENTRIES - 1 {
            assert_eq!(t.on_overflow(0), CaptureOutcome::Recorded);
        }
        assert_eq!(t.on_overflow(0), CaptureOutcome::Published);

        let stats = t.pool().stats();
        assert_eq!(stats.full, 1);
        assert_eq!(stats.free, 1);
    }

    #[test]
    fn test_exhausted_pool_counts_missed() {
        let t = trigger(1, 2);
        t.start();
        assert_eq!(t.on_overflow(0), CaptureOutcome::Recorded);

        let rearms = t.counters().rearms.load(Ordering::Relaxed);
        assert_eq!(t.on_overflow(1), CaptureOutcome::Missed);
        assert_eq!(t.control().missed(), 1);
        // Counters are re-armed even when the sample is dropped.
        assert_eq!(t.counters().rearms.load(Ordering::Relaxed), rearms + 1);
    }

    #[test]
    fn test_stop_flushes_and_closes() {
        let t = trigger(3, 2);
        t.start();
        t.on_overflow(0);
        t.on_overflow(0);

        t.stop();
        assert!(!t.control().is_running());
        assert_eq!(t.on_overflow(0), CaptureOutcome::Ignored);

        let buf = t.pool().drain_full().unwrap();
        assert_eq!(buf.len(), 2);
        t.pool().release_free(buf);
        assert!(t.pool().drain_full().is_none());
    }

    #[test]
    fn test_start_releases_stale_buffers() {
        let t = trigger(2, 1);
        t.start();
        t.on_overflow(0);
        assert_eq!(t.pool().stats().free, 1);

        t.start();
        assert_eq!(t.pool().stats().free, 2);
    }

    #[test]
    fn test_apply_status_knob() {
        let t = trigger(2, 1);
        t.apply(Knob::Status, "1").unwrap();
        assert!(t.control().is_running());

        t.on_overflow(0);
        t.apply(Knob::Status, "0").unwrap();
        assert!(t.pool().is_shutdown());
        assert_eq!(t.pool().stats().full, 1);

        assert!(t.apply(Knob::Period, "nope").is_err());
    }

    #[test]
    fn test_dump_keeps_capture_running() {
        let t = trigger(2, 1);
        t.start();
        assert_eq!(t.on_overflow(0), CaptureOutcome::Recorded);

        t.apply(Knob::Status, "2").unwrap();
        assert!(t.control().is_running());
        assert!(!t.pool().is_shutdown());
        assert_eq!(t.on_overflow(0), CaptureOutcome::Recorded);
    }

    #[test]
    fn test_unknown_status_leaves_counters() {
        let t = trigger(1, 2);
        t.start();
        t.on_overflow(0);
        t.on_overflow(1);
        t.on_overflow(1);
        assert_eq!(t.control().missed(), 2);

        assert!(t.apply(Knob::Status, "7").is_err());
        assert_eq!(t.control().missed(), 2);
        assert!(t.control().is_running());
    }

    #[test]
    fn test_no_acquire_after_halt() {
        let t = trigger(2, 1);
        t.start();
        // Producer passed the first running check, then stop flushed the slot.
        t.control().halt();
        t.flush_active();
        assert_eq!(t.on_overflow(0), CaptureOutcome::Ignored);
        assert_eq!(t.pool().stats().free, 2);
    }
}
