//! Master: top-level scheduler controller
//!
//! Owns the processes, the time source, the interrupt guard and the trace
//! log. `go()` runs the scheduling loop until the stop time passes, a stop
//! is requested, or a fatal error halts the engine.
//!
//! Every fatal error goes through one path: status Stopped, clock
//! stopped, an `*** ERROR:` exit message, an error log line, and the
//! error handed back to the caller. A halted master never resumes.
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};
use std::path::Path;
use std::sync::Arc;

use crate::config::{MasterConfig, Regime, MIN_STOP_TIME, MIN_TICK};
use crate::error::SchedError;
use crate::guard::{InterruptGuard, IsrEntry, IsrFrame};
use crate::process::{write_or_warn, Process};
use crate::profile::render;
use crate::task::Dispatch;
use crate::timer::{as_secs, ClockKind, Duration, Instant, TimeSource};
use crate::trace::{write_trace, write_trace_numbers, TraceLog};

/// Handle of a process inside the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(usize);

impl ProcessId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Running state of the scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    Stopped,
    Going,
}

/// What one timer interrupt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrOutcome {
    /// Foreground tasks were dispatched
    Dispatched,
    /// A critical section was open
    Suppressed,
    /// The guard tripped, the engine halted earlier, or the regime runs
    /// no foreground
    Disabled,
}

/// Requests a normal stop of `go()` from a task body or another thread
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

const NORMAL_EXIT: &str = "Normal Exit from scheduler";

/// Scheduler root
pub struct Master {
    regime: Regime,
    tracing: bool,
    stop_time: Option<Instant>,
    processes: Vec<Process>,
    clock: TimeSource,
    guard: Arc<InterruptGuard>,
    trace: TraceLog,
    status: MasterStatus,
    halted: bool,
    exit_message: String,
    stop: StopHandle,
    /// Foreground passes actually dispatched
    foreground_runs: u64,
}

/// Sweep resources for one process
fn dispatch<'a>(
    clock: &'a mut TimeSource,
    guard: &'a InterruptGuard,
    trace: &'a mut TraceLog,
    tracing: bool,
    process: usize,
) -> Dispatch<'a> {
    let env = Dispatch::new(clock, guard);
    let mut env = if tracing { env.with_trace(trace) } else { env };
    env.for_process(process);
    env
}

impl Master {
    /// Build a master around `clock`. A tick interval in `config` is
    /// applied to the clock here.
    pub fn new(config: MasterConfig, mut clock: TimeSource) -> Result<Self, SchedError> {
        if let Some(tick) = config.tick {
            clock.setup(tick)?;
        }
        if let Some(stop_time) = config.stop_time {
            check_stop_time(stop_time)?;
        }
        Ok(Self {
            regime: config.regime,
            tracing: config.trace,
            stop_time: config.stop_time,
            processes: Vec::new(),
            clock,
            guard: Arc::new(InterruptGuard::new(config.max_reentry)),
            trace: TraceLog::new(),
            status: MasterStatus::Stopped,
            halted: false,
            exit_message: String::new(),
            stop: StopHandle::default(),
            foreground_runs: 0,
        })
    }

    /// Master on simulated time
    pub fn simulated(config: MasterConfig) -> Result<Self, SchedError> {
        Self::new(config, TimeSource::simulated())
    }

    pub fn add_process(&mut self, name: impl Into<String>) -> ProcessId {
        self.processes.push(Process::new(name));
        ProcessId(self.processes.len() - 1)
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(id.0)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(id.0)
    }

    pub fn processes(&self) -> &[Process] {
        &self.processes
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    pub fn status(&self) -> MasterStatus {
        self.status
    }

    /// Stopped by a fatal error
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Why the last run ended
    pub fn exit_message(&self) -> &str {
        &self.exit_message
    }

    /// Last time read from the clock
    pub fn now(&self) -> Instant {
        self.clock.last_read()
    }

    pub fn clock(&self) -> &TimeSource {
        &self.clock
    }

    pub fn trace_log(&self) -> &TraceLog {
        &self.trace
    }

    /// Shared with whatever delivers timer interrupts
    pub fn interrupt_guard(&self) -> Arc<InterruptGuard> {
        Arc::clone(&self.guard)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Foreground passes dispatched so far
    pub fn foreground_runs(&self) -> u64 {
        self.foreground_runs
    }

    /// Set the clock's tick interval; out of bounds is fatal
    pub fn set_tick_time(&mut self, tick: Duration) -> Result<(), SchedError> {
        self.clock.setup(tick).map_err(|e| self.fatal(e))
    }

    /// Stop once time passes `stop_time`; below 1 us is fatal
    pub fn set_stop_time(&mut self, stop_time: Instant) -> Result<(), SchedError> {
        check_stop_time(stop_time).map_err(|e| self.fatal(e))?;
        self.stop_time = Some(stop_time);
        Ok(())
    }

    /// Run until the stop time, a stop request or a fatal error.
    ///
    /// A second call resumes from the current time; after a fatal error
    /// it returns `Halted`.
    pub fn go(&mut self) -> Result<(), SchedError> {
        if self.halted {
            return Err(SchedError::Halted {
                message: self.exit_message.clone(),
            });
        }
        self.run().map_err(|e| self.fatal(e))
    }

    fn run(&mut self) -> Result<(), SchedError> {
        if self.clock.tick_interval().ticks() < MIN_TICK.ticks() {
            return Err(SchedError::TickNotConfigured);
        }
        self.stop.clear();
        self.status = MasterStatus::Going;
        self.clock.resume();
        log::info!(
            "scheduler going: {} regime, {}",
            self.regime.name(),
            self.clock.kind().name()
        );

        loop {
            // ticks that piled up during one pass coalesce into one interrupt
            if self.regime == Regime::Preemptive && self.clock.due_interrupts()? > 0 {
                self.interrupt()?;
            }
            if self.sweep_background()? == 0 {
                self.clock.increment();
            }
            if self.stop.is_requested() {
                self.finish(NORMAL_EXIT.to_owned());
                return Ok(());
            }
            let now = self.clock.now()?;
            if self.stop_time.is_some_and(|stop| now.ticks() > stop.ticks()) {
                self.finish(format!("Normal scheduler exit at end time {}", as_secs(now)));
                return Ok(());
            }
        }
    }

    /// Background pass over every process; returns task visits
    fn sweep_background(&mut self) -> Result<u64, SchedError> {
        let Self {
            processes,
            clock,
            guard,
            trace,
            tracing,
            regime,
            ..
        } = self;
        let mut visits = 0;
        for (n, process) in processes.iter_mut().enumerate() {
            let mut env = dispatch(clock, guard, trace, *tracing, n);
            process.run_background(*regime, &mut env)?;
            visits += env.visits();
        }
        Ok(visits)
    }

    /// One timer interrupt: enter the guard, then run the foreground
    /// sweep unless a critical section is open or the guard has tripped.
    /// Only the preemptive regime has a foreground; elsewhere this is a
    /// no-op reported as `Disabled`.
    pub fn service_interrupt(&mut self) -> Result<IsrOutcome, SchedError> {
        self.interrupt().map_err(|e| self.fatal(e))
    }

    fn interrupt(&mut self) -> Result<IsrOutcome, SchedError> {
        if self.regime != Regime::Preemptive {
            return Ok(IsrOutcome::Disabled);
        }
        let guard = Arc::clone(&self.guard);
        let outcome = match guard.enter()? {
            IsrEntry::Disabled(_) => IsrOutcome::Disabled,
            IsrEntry::Suppressed(_) => IsrOutcome::Suppressed,
            IsrEntry::Dispatch(_) if self.halted => IsrOutcome::Disabled,
            IsrEntry::Dispatch(frame) => {
                self.run_foreground(&frame)?;
                IsrOutcome::Dispatched
            }
        };
        Ok(outcome)
    }

    fn run_foreground(&mut self, frame: &IsrFrame<'_>) -> Result<(), SchedError> {
        let Self {
            processes,
            clock,
            guard,
            trace,
            tracing,
            foreground_runs,
            ..
        } = self;
        clock.now()?;
        log::trace!("foreground pass at nesting level {}", frame.level());
        *foreground_runs += 1;
        for (n, process) in processes.iter_mut().enumerate() {
            let mut env = dispatch(clock, guard, trace, *tracing, n);
            process.run_foreground(&mut env)?;
        }
        Ok(())
    }

    /// Stop the clock; state is kept so `go()` can resume. Bodies running
    /// inside `go()` use a `StopHandle` instead.
    pub fn stop(&mut self) {
        self.status = MasterStatus::Stopped;
        self.clock.stop();
    }

    fn finish(&mut self, message: String) {
        self.status = MasterStatus::Stopped;
        self.clock.stop();
        log::info!("{message}");
        self.exit_message = message;
    }

    fn fatal(&mut self, error: SchedError) -> SchedError {
        self.status = MasterStatus::Stopped;
        self.clock.stop();
        self.halted = true;
        self.exit_message = format!("*** ERROR: {error}");
        log::error!("{}", self.exit_message);
        error
    }

    pub fn profile_on(&mut self) {
        self.processes.iter_mut().for_each(Process::profile_on);
    }

    pub fn profile_off(&mut self) {
        self.processes.iter_mut().for_each(Process::profile_off);
    }

    /// Durations are only meaningful on a real clock or from interrupts
    fn timing_available(&self) -> bool {
        self.clock.kind() != ClockKind::Simulated || self.regime == Regime::Preemptive
    }

    /// Profiles of every process
    pub fn write_profiles<W: Write>(&self, w: &mut W) -> fmt::Result {
        let timing = self.timing_available();
        self.processes
            .iter()
            .try_for_each(|p| p.write_profiles(w, timing))
    }

    /// Write all profiles to `path`; failure halts the engine
    pub fn dump_profiles(&mut self, path: impl AsRef<Path>) -> Result<(), SchedError> {
        let path = path.as_ref();
        let text = render(|s| self.write_profiles(s));
        std::fs::write(path, text).map_err(|e| self.fatal(SchedError::profile_io(path, e)))
    }

    /// Trace with names; a write failure is only logged
    pub fn dump_trace(&self, path: impl AsRef<Path>) -> bool {
        let text = render(|s| write_trace(&self.trace, &self.processes, s));
        write_or_warn(path.as_ref(), "trace", &text)
    }

    /// Trace with serial numbers; a write failure is only logged
    pub fn dump_trace_numbers(&self, path: impl AsRef<Path>) -> bool {
        let text = render(|s| write_trace_numbers(&self.trace, s));
        write_or_warn(path.as_ref(), "trace", &text)
    }

    pub fn write_timer_status<W: Write>(&self, w: &mut W) -> fmt::Result {
        self.clock
            .write_status(w, self.guard.max_depth(), self.guard.runs())
    }

    /// Timer status; a write failure is only logged
    pub fn dump_timer_status(&self, path: impl AsRef<Path>) -> bool {
        let text = render(|s| self.write_timer_status(s));
        write_or_warn(path.as_ref(), "timer status", &text)
    }

    /// Configuration of one process; a write failure is only logged
    pub fn dump_configuration(&self, id: ProcessId, path: impl AsRef<Path>) -> bool {
        self.process(id)
            .is_some_and(|p| p.dump_configuration(path))
    }

    /// Status of one process at the current time
    pub fn dump_status(&self, id: ProcessId, path: impl AsRef<Path>) -> bool {
        let now = self.now();
        self.process(id).is_some_and(|p| p.dump_status(path, now))
    }
}

fn check_stop_time(stop_time: Instant) -> Result<(), SchedError> {
    if stop_time.ticks() < MIN_STOP_TIME.ticks() {
        return Err(SchedError::StopTimeTooSmall { stop_time });
    }
    Ok(())
}
