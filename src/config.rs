//! Scheduler configuration: limits, defaults and the execution regime
//!
//! Constants bound the engine (trace capacity, interrupt nesting, tick
//! range). `MasterConfig` carries the choices made once when a `Master`
//! is built and never changed while it runs.
//!
//! Author: Moroya Sakamoto

use crate::timer::{Duration, Instant};

/// Fraction of the sample interval a periodic task may run late before
/// the overrun is fatal. Tasks can override it with
/// `Task::set_timing_tolerance`.
pub const DEFAULT_LATE_TIME_FRACTION: f64 = 1.0;

/// Deepest allowed nesting of timer interrupts before the guard trips.
pub const MAX_REENTER: u32 = 8;

/// Number of transition records kept by the trace log. Older records are
/// overwritten once the log is full.
pub const TRACE_CAPACITY: usize = 1024;

/// Smallest accepted tick interval (1 us).
pub const MIN_TICK: Duration = Duration::from_ticks(1);

/// Largest accepted tick interval (1e6 s).
pub const MAX_TICK: Duration = Duration::from_ticks(1_000_000_000_000);

/// Smallest accepted stop time (1 us).
pub const MIN_STOP_TIME: Instant = Instant::from_ticks(1);

/// Input frequency of the classic PC interval timer, in Hz.
pub const COUNTER_FREQ_HZ: u32 = 1_193_180;

/// Counts between two reads of a free-running counter above which the
/// reading is treated as an undetected counter overflow.
pub const COUNTER_DELTA_LIMIT: u32 = 0xB000;

/// Default number of histogram bins for execution-time profiles.
pub const PROFILE_BINS: usize = 100;

/// Default lower histogram edge, in seconds.
pub const PROFILE_MIN_SECS: f64 = 0.0;

/// Default upper histogram edge, in seconds.
pub const PROFILE_MAX_SECS: f64 = 0.05;

/// How the engine dispatches its task lists.
///
/// Picked once at construction; every sweep of every process uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Regime {
    /// Every task of every list is asked to run on every pass.
    #[default]
    Sequential,
    /// Timer tasks every pass, then at most one other task.
    MinimumLatency,
    /// Timer and preemptible tasks run from the timer interrupt, the rest
    /// from the background loop.
    Preemptive,
}

impl Regime {
    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Regime::Sequential => "Sequential",
            Regime::MinimumLatency => "Minimum latency",
            Regime::Preemptive => "Preemptive",
        }
    }
}

/// Construction-time settings for a `Master`.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Dispatch regime
    pub regime: Regime,
    /// Tick interval handed to the time source (None = set later)
    pub tick: Option<Duration>,
    /// Scheduler stops once the time passes this instant (None = never)
    pub stop_time: Option<Instant>,
    /// Interrupt nesting limit
    pub max_reentry: u32,
    /// Record state transitions in the trace log
    pub trace: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            regime: Regime::Sequential,
            tick: None,
            stop_time: None,
            max_reentry: MAX_REENTER,
            trace: true,
        }
    }
}

impl MasterConfig {
    /// Default configuration with the given regime
    pub fn new(regime: Regime) -> Self {
        Self {
            regime,
            ..Self::default()
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    pub fn with_stop_time(mut self, stop_time: Instant) -> Self {
        self.stop_time = Some(stop_time);
        self
    }

    pub fn with_max_reentry(mut self, depth: u32) -> Self {
        self.max_reentry = depth;
        self
    }

    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }
}
