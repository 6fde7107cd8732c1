//! Time source: the scheduler's monotonic clock
//!
//! Microsecond-resolution time behind four strategies:
//! - `Simulated`: advances one tick per `increment()`, for offline runs
//! - `FreeRunning`: accumulates deltas of a down-counting hardware timer
//! - `InterruptTicks`: counts ticks delivered by a periodic interrupt
//! - `Host`: the host's monotonic clock
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::{COUNTER_DELTA_LIMIT, COUNTER_FREQ_HZ, MAX_TICK, MIN_TICK};
use crate::error::SchedError;

/// Point in scheduler time, microseconds since start.
pub type Instant = fugit::TimerInstantU64<1_000_000>;

/// Span of scheduler time, in microseconds.
pub type Duration = fugit::TimerDurationU64<1_000_000>;

/// Scheduler time zero
pub const START: Instant = Instant::from_ticks(0);

/// Instant as seconds
pub fn as_secs(t: Instant) -> f64 {
    t.ticks() as f64 / 1_000_000.0
}

/// Duration as seconds
pub fn duration_secs(d: Duration) -> f64 {
    d.ticks() as f64 / 1_000_000.0
}

/// Time from `from` to `to` (zero if `to` is earlier)
pub fn elapsed(from: Instant, to: Instant) -> Duration {
    Duration::from_ticks(to.ticks().saturating_sub(from.ticks()))
}

/// Down-counting hardware timer read by the free-running strategy.
pub trait HardwareCounter {
    /// Latch and read the current count.
    fn latch(&mut self) -> u16;
    /// Counts in one full wrap of the counter.
    fn period(&self) -> u32;
    /// Count frequency in Hz.
    fn frequency_hz(&self) -> u32;
}

/// Software down-counter.
///
/// Clones share the count, so a test can keep one handle and move the
/// other into a `TimeSource`.
#[derive(Clone)]
pub struct SoftCounter {
    value: Rc<Cell<u32>>,
    period: u32,
    frequency_hz: u32,
}

impl SoftCounter {
    /// Counter wrapping every `period` counts (at most 65536)
    pub fn new(period: u32, frequency_hz: u32) -> Self {
        Self {
            value: Rc::new(Cell::new(0)),
            period: period.clamp(1, 0x1_0000),
            frequency_hz: frequency_hz.max(1),
        }
    }

    /// Let `counts` counts elapse
    pub fn advance(&self, counts: u32) {
        let period = self.period as u64;
        let value = self.value.get() as u64;
        let step = counts as u64 % period;
        self.value.set(((value + period - step) % period) as u32);
    }
}

impl Default for SoftCounter {
    /// Full 16-bit wrap at the PC interval timer frequency
    fn default() -> Self {
        Self::new(0x1_0000, COUNTER_FREQ_HZ)
    }
}

impl HardwareCounter for SoftCounter {
    fn latch(&mut self) -> u16 {
        self.value.get() as u16
    }

    fn period(&self) -> u32 {
        self.period
    }

    fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }
}

/// Which strategy a `TimeSource` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    Simulated,
    FreeRunning,
    InterruptTicks,
    Host,
}

impl ClockKind {
    /// Mode line of the timer status dump
    pub fn name(self) -> &'static str {
        match self {
            ClockKind::Simulated => "Simulated Time",
            ClockKind::FreeRunning => "Free-Running Timer",
            ClockKind::InterruptTicks => "Interrupt Timing",
            ClockKind::Host => "Host Clock",
        }
    }
}

/// Tick count shared with the interrupt side.
#[derive(Default)]
struct TickShared {
    ticks: AtomicU64,
    pending: AtomicU64,
    running: AtomicBool,
}

/// Interrupt-side producer for the interrupt-tick strategy.
#[derive(Clone)]
pub struct TickHandle {
    shared: Arc<TickShared>,
}

impl TickHandle {
    /// Record one timer interrupt. Ignored while the clock is stopped.
    pub fn tick(&self) {
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.ticks.fetch_add(1, Ordering::AcqRel);
            self.shared.pending.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Ticks seen since the clock started
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Acquire)
    }
}

enum Strategy {
    Simulated,
    FreeRunning {
        counter: Box<dyn HardwareCounter>,
        last: u16,
        counts: u64,
        limit: u32,
    },
    InterruptTicks,
    Host {
        origin: Option<std::time::Instant>,
        base: Duration,
    },
}

/// Monotonic clock
pub struct TimeSource {
    strategy: Strategy,
    /// Tick interval (zero until `setup`)
    tick: Duration,
    /// Last time read
    now: Instant,
    /// Next timer interrupt boundary, for strategies without real ticks
    next_interrupt: Instant,
    running: bool,
    started: bool,
    shared: Arc<TickShared>,
}

impl TimeSource {
    fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            tick: Duration::from_ticks(0),
            now: START,
            next_interrupt: START,
            running: false,
            started: false,
            shared: Arc::new(TickShared::default()),
        }
    }

    /// Simulated time, advanced by `increment()`
    pub fn simulated() -> Self {
        Self::with_strategy(Strategy::Simulated)
    }

    /// Free-running hardware counter with the default plausibility limit
    pub fn free_running(counter: Box<dyn HardwareCounter>) -> Self {
        Self::free_running_with_limit(counter, COUNTER_DELTA_LIMIT)
    }

    /// Free-running hardware counter; a delta above `limit` counts is fatal
    pub fn free_running_with_limit(counter: Box<dyn HardwareCounter>, limit: u32) -> Self {
        Self::with_strategy(Strategy::FreeRunning {
            counter,
            last: 0,
            counts: 0,
            limit,
        })
    }

    /// Time counted in timer interrupts; feed it through `tick_handle()`
    pub fn interrupt_ticks() -> Self {
        Self::with_strategy(Strategy::InterruptTicks)
    }

    /// Host monotonic clock
    pub fn host() -> Self {
        Self::with_strategy(Strategy::Host {
            origin: None,
            base: Duration::from_ticks(0),
        })
    }

    pub fn kind(&self) -> ClockKind {
        match self.strategy {
            Strategy::Simulated => ClockKind::Simulated,
            Strategy::FreeRunning { .. } => ClockKind::FreeRunning,
            Strategy::InterruptTicks => ClockKind::InterruptTicks,
            Strategy::Host { .. } => ClockKind::Host,
        }
    }

    /// Set the tick interval. Must lie within 1 us to 1e6 s.
    pub fn setup(&mut self, tick: Duration) -> Result<(), SchedError> {
        if tick.ticks() < MIN_TICK.ticks() || tick.ticks() > MAX_TICK.ticks() {
            return Err(SchedError::TickOutOfBounds { tick });
        }
        self.tick = tick;
        Ok(())
    }

    /// Tick interval (zero until configured)
    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    /// Reset time to zero and start counting
    pub fn start(&mut self) {
        self.now = START;
        self.next_interrupt = START + self.tick;
        self.shared.ticks.store(0, Ordering::Release);
        self.shared.pending.store(0, Ordering::Release);
        if let Strategy::FreeRunning { counts, .. } = &mut self.strategy {
            *counts = 0;
        }
        if let Strategy::Host { base, .. } = &mut self.strategy {
            *base = Duration::from_ticks(0);
        }
        self.started = true;
        self.resume();
    }

    /// Continue counting from the current time. Starts from zero if the
    /// clock has never run.
    pub fn resume(&mut self) {
        if !self.started {
            self.start();
            return;
        }
        match &mut self.strategy {
            Strategy::FreeRunning { counter, last, .. } => *last = counter.latch(),
            Strategy::Host { origin, .. } => *origin = Some(std::time::Instant::now()),
            Strategy::Simulated | Strategy::InterruptTicks => {}
        }
        self.running = true;
        self.shared.running.store(true, Ordering::Release);
    }

    /// Freeze time at its current value
    pub fn stop(&mut self) {
        if let Strategy::Host { origin, base } = &mut self.strategy {
            if let Some(o) = origin.take() {
                *base = *base + Duration::from_ticks(o.elapsed().as_micros() as u64);
            }
        }
        self.running = false;
        self.shared.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance simulated time by one tick. No-op for the other strategies
    /// and while stopped.
    pub fn increment(&mut self) {
        if self.running && matches!(self.strategy, Strategy::Simulated) {
            self.now = self.now + self.tick;
        }
    }

    /// Move simulated time forward by `d`. No-op for the other strategies
    /// and while stopped.
    pub fn advance(&mut self, d: Duration) {
        if self.running && matches!(self.strategy, Strategy::Simulated) {
            self.now = self.now + d;
        }
    }

    /// Current time
    pub fn now(&mut self) -> Result<Instant, SchedError> {
        if !self.running {
            return Ok(self.now);
        }
        let tick = self.tick;
        let at = self.now;
        match &mut self.strategy {
            Strategy::Simulated => {}
            Strategy::FreeRunning {
                counter,
                last,
                counts,
                limit,
            } => {
                let current = counter.latch();
                let delta = count_delta(*last, current, counter.period());
                if delta > *limit {
                    return Err(SchedError::CounterOverflow {
                        delta,
                        limit: *limit,
                        at,
                    });
                }
                *last = current;
                *counts += delta as u64;
                let micros = (*counts as u128 * 1_000_000) / counter.frequency_hz() as u128;
                self.now = Instant::from_ticks(micros as u64);
            }
            Strategy::InterruptTicks => {
                let ticks = self.shared.ticks.load(Ordering::Acquire);
                self.now = Instant::from_ticks(ticks.saturating_mul(tick.ticks()));
            }
            Strategy::Host { origin, base } => {
                let elapsed = origin
                    .map(|o| o.elapsed().as_micros() as u64)
                    .unwrap_or(0);
                self.now = Instant::from_ticks(base.ticks() + elapsed);
            }
        }
        Ok(self.now)
    }

    /// Current time, read inside a critical section for the strategies
    /// whose state is shared with an interrupt.
    pub fn now_protected(&mut self) -> Result<Instant, SchedError> {
        match self.kind() {
            ClockKind::FreeRunning | ClockKind::InterruptTicks => {
                critical_section::with(|_cs| self.now())
            }
            ClockKind::Simulated | ClockKind::Host => self.now(),
        }
    }

    /// Last time read, without touching the hardware
    pub fn last_read(&self) -> Instant {
        self.now
    }

    /// Producer handle for the interrupt-tick strategy
    pub fn tick_handle(&self) -> TickHandle {
        TickHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of timer interrupts due now.
    ///
    /// Pending ticks for the interrupt-tick strategy; for the others, the
    /// tick boundaries crossed since the last call.
    pub fn due_interrupts(&mut self) -> Result<u64, SchedError> {
        if let Strategy::InterruptTicks = self.strategy {
            return Ok(self.shared.pending.swap(0, Ordering::AcqRel));
        }
        let step = self.tick.ticks();
        if step == 0 {
            return Ok(0);
        }
        let now = self.now()?.ticks();
        let next = self.next_interrupt.ticks();
        if now < next {
            return Ok(0);
        }
        let due = (now - next) / step + 1;
        self.next_interrupt = Instant::from_ticks(next + due * step);
        Ok(due)
    }

    /// Render the timer status dump
    pub fn write_status<W: Write>(
        &self,
        w: &mut W,
        max_depth: u32,
        isr_runs: u64,
    ) -> fmt::Result {
        writeln!(w, "Status Dump for Timer Object at time {}", as_secs(self.now))?;
        writeln!(w, "Mode:  {} ", self.kind().name())?;
        writeln!(w, "    Time Increment: {} sec.", duration_secs(self.tick))?;
        writeln!(w, "    Maximum Re-entry depth: {max_depth}")?;
        writeln!(w, "    The ISR ran {isr_runs} times\n")
    }
}

/// Counts elapsed between two reads of a down-counter
fn count_delta(last: u16, current: u16, period: u32) -> u32 {
    let (last, current) = (last as u32, current as u32);
    if current <= last {
        last - current
    } else {
        period.saturating_sub(current) + last
    }
}

/// Lateness window of one periodic activation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deadline {
    /// Activation time (absolute)
    due: Instant,
    /// Allowed lateness
    tolerance: Duration,
}

impl Deadline {
    pub fn new(due: Instant, tolerance: Duration) -> Self {
        Self { due, tolerance }
    }

    /// Not yet time to run
    pub fn is_early(&self, now: Instant) -> bool {
        now.ticks() < self.due.ticks()
    }

    /// Later than the tolerance allows
    pub fn is_missed(&self, now: Instant) -> bool {
        now.ticks() > self.due.ticks().saturating_add(self.tolerance.ticks())
    }

    /// Lateness so far (0 if early)
    pub fn lateness(&self, now: Instant) -> Duration {
        Duration::from_ticks(now.ticks().saturating_sub(self.due.ticks()))
    }
}
