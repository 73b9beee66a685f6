//! Runtime control knobs for a capture session.
//!
//! Mirrors the small control-file surface a capture driver exposes: the
//! overflow period, four event selectors, a status word and the missed
//! counter. Values are written as decimal or `0x`-prefixed hex text.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

/// Default overflow period in cycles.
pub const DEFAULT_PERIOD: u32 = 1_000_000;

/// Smallest period accepted when capture starts.
pub const MIN_PERIOD: u32 = 10_000;

/// Number of programmable event selectors.
pub const NUM_EVENT_SELECTS: usize = 4;

/// Event selector values used when none are configured.
pub const DEFAULT_EVENT_SELECTS: [u32; NUM_EVENT_SELECTS] = [0x8, 0, 0, 0];

/// Capture status as stored in the status knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped = 0,
    Running = 1,
    Dump = 2,
}

impl Status {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::Running),
            2 => Some(Self::Dump),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Dump => "dump",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named control knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Knob {
    Period,
    Status,
    Missed,
    Event(usize),
}

impl Knob {
    /// Resolves a control-file name (`period`, `status`, `missed`, `ctr0`..`ctr3`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "period" => Some(Self::Period),
            "status" => Some(Self::Status),
            "missed" => Some(Self::Missed),
            _ => {
                let index: usize = name.strip_prefix("ctr")?.parse().ok()?;
                (index < NUM_EVENT_SELECTS).then_some(Self::Event(index))
            }
        }
    }
}

/// What a status write asks the capture side to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequest {
    Start,
    Stop,
    /// Report the capture state; capture keeps running.
    Dump,
}

/// Parses a knob value written as decimal or `0x` hex.
pub fn parse_knob_value(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).with_context(|| format!("invalid hex value: {raw}"));
    }
    raw.parse::<u32>()
        .with_context(|| format!("invalid value: {raw}"))
}

/// Shared capture control block.
pub struct Control {
    period: AtomicU32,
    active_period: AtomicU32,
    events: [AtomicU32; NUM_EVENT_SELECTS],
    status: AtomicU32,
    missed: AtomicU32,
    overflows: AtomicU64,
}

impl Control {
    pub fn new(period: u32, events: &[u32]) -> Self {
        Self {
            period: AtomicU32::new(period),
            active_period: AtomicU32::new(period.max(MIN_PERIOD)),
            events: std::array::from_fn(|i| {
                AtomicU32::new(events.get(i).copied().unwrap_or_default())
            }),
            status: AtomicU32::new(Status::Stopped as u32),
            missed: AtomicU32::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    /// Requested period; takes effect on the next start.
    pub fn period(&self) -> u32 {
        self.period.load(Ordering::Relaxed)
    }

    pub fn set_period(&self, period: u32) {
        self.period.store(period, Ordering::Relaxed);
    }

    /// Period in effect for the running session.
    pub fn active_period(&self) -> u32 {
        self.active_period.load(Ordering::Relaxed)
    }

    pub fn event_select(&self, index: usize) -> Option<u32> {
        self.events
            .get(index)
            .map(|e| e.load(Ordering::Relaxed))
    }

    pub fn event_selects(&self) -> [u32; NUM_EVENT_SELECTS] {
        std::array::from_fn(|i| self.event_select(i).unwrap_or_default())
    }

    pub fn status(&self) -> Status {
        Status::from_u32(self.status.load(Ordering::Acquire)).unwrap_or(Status::Stopped)
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Relaxed)
    }

    pub fn record_missed(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Enters the running state, clamping the requested period.
    pub(crate) fn begin(&self) -> u32 {
        let period = self.period().max(MIN_PERIOD);
        if period != self.period() {
            tracing::warn!(
                requested = self.period(),
                period,
                "period below minimum, clamped",
            );
        }
        self.period.store(period, Ordering::Relaxed);
        self.active_period.store(period, Ordering::Relaxed);
        self.status.store(Status::Running as u32, Ordering::Release);
        period
    }

    pub(crate) fn halt(&self) {
        self.status.store(Status::Stopped as u32, Ordering::Release);
    }

    /// Reads a knob as the control file would present it.
    pub fn read(&self, knob: Knob) -> u32 {
        match knob {
            Knob::Period => self.period(),
            Knob::Status => self.status() as u32,
            Knob::Missed => self.missed(),
            Knob::Event(i) => self.event_select(i).unwrap_or_default(),
        }
    }

    /// Applies a knob write.
    ///
    /// Plain value knobs are stored directly. A status write is returned as a
    /// [`StatusRequest`] for the capture side to act on.
    pub fn write(&self, knob: Knob, raw: &str) -> Result<Option<StatusRequest>> {
        let value = parse_knob_value(raw)?;
        match knob {
            Knob::Period => self.set_period(value),
            Knob::Missed => self.missed.store(value, Ordering::Relaxed),
            Knob::Event(i) => match self.events.get(i) {
                Some(e) => e.store(value, Ordering::Relaxed),
                None => bail!("no event selector {i}"),
            },
            Knob::Status => {
                let request = match Status::from_u32(value) {
                    Some(Status::Stopped) => StatusRequest::Stop,
                    Some(Status::Running) => StatusRequest::Start,
                    Some(Status::Dump) => StatusRequest::Dump,
                    None => bail!("unknown status code {value}"),
                };
                return Ok(Some(request));
            }
        }
        Ok(None)
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD, &DEFAULT_EVENT_SELECTS)
    }
}
