//! Task: the schedulable unit
//!
//! A task owns its timing (interval, next due time, lateness tolerance),
//! its priority, its status and a body. The body is either a state
//! machine built from `State`s or a single run callback. `schedule()`
//! decides on each visit whether the task is due and, if so, runs the
//! body once.
//!
//! Bodies see their task only through a `Context`, so a state or callback
//! can idle, deactivate or retune its own task without holding a pointer
//! to it.
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use std::path::Path;
use std::sync::Arc;

use crate::config::DEFAULT_LATE_TIME_FRACTION;
use crate::error::{SchedError, TriggerError};
use crate::guard::{InterruptGuard, PreemptionLock};
use crate::profile::{render, write_banner, Profiler};
use crate::state::{State, StateId, StateLogic};
use crate::timer::{as_secs, duration_secs, elapsed, Deadline, Duration, Instant, TimeSource, START};
use crate::trace::{Change, TraceLog, TraceRecord};

/// Task type; decides timing rules, legal parameters and task list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Reserved; the engine never runs it
    Hardware,
    /// Runs from the timer interrupt every interval
    TimerInterrupt,
    /// Periodic, priority-ordered, may be preempted
    Preemptible,
    /// Periodic background task
    SampleTime,
    /// Runs once per trigger
    Event,
    /// Runs whenever the processor is otherwise free
    Continuous,
}

impl TaskKind {
    /// Name used in dumps and messages
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Hardware => "Hardware",
            TaskKind::TimerInterrupt => "Timer Int.",
            TaskKind::Preemptible => "Preemptible",
            TaskKind::SampleTime => "Sample Time",
            TaskKind::Event => "Event",
            TaskKind::Continuous => "Continuous",
        }
    }

    /// Due time is checked only while Idle
    pub fn is_periodic(self) -> bool {
        matches!(self, TaskKind::TimerInterrupt | TaskKind::SampleTime)
    }

    /// Takes a priority at construction
    pub fn has_priority(self) -> bool {
        matches!(
            self,
            TaskKind::Preemptible | TaskKind::SampleTime | TaskKind::Event
        )
    }

    /// Takes a sample interval at construction
    pub fn has_interval(self) -> bool {
        matches!(
            self,
            TaskKind::TimerInterrupt | TaskKind::Preemptible | TaskKind::SampleTime
        )
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    Idle = 0,
    Ready = 1,
    Pending = 2,
    Running = 3,
    Preempted = 4,
    Deactivated = 5,
}

impl TaskStatus {
    pub fn name(self) -> &'static str {
        match self {
            TaskStatus::Idle => "Idle",
            TaskStatus::Ready => "Ready",
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Preempted => "Pre-empted",
            TaskStatus::Deactivated => "Deactivated",
        }
    }

    /// Statuses in which `schedule()` does no work
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Preempted | TaskStatus::Deactivated
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskStatus::Idle,
            1 => TaskStatus::Ready,
            2 => TaskStatus::Pending,
            3 => TaskStatus::Running,
            4 => TaskStatus::Preempted,
            _ => TaskStatus::Deactivated,
        }
    }
}

/// Status shared between the task and its event triggers
#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn load(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, status: TaskStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Idle -> Pending, or the status that blocked it
    fn trigger(&self) -> Result<(), TaskStatus> {
        self.0
            .compare_exchange(
                TaskStatus::Idle as u8,
                TaskStatus::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }
}

/// Handle that fires an Event task from anywhere.
///
/// Cloneable and `Send`; another thread or an interrupt routine can hold
/// one while the scheduler owns the task.
#[derive(Debug, Clone)]
pub struct EventTrigger {
    status: Arc<StatusCell>,
}

impl EventTrigger {
    /// Idle -> Pending. Refused without side effects otherwise.
    pub fn trigger(&self) -> Result<(), TriggerError> {
        self.status.trigger().map_err(TriggerError::NotIdle)
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }
}

/// Constructor parameters checked against the task kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskParams {
    pub priority: Option<i32>,
    pub interval: Option<Duration>,
}

impl TaskParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// User task body without states
pub trait TaskRun {
    fn run(&mut self, cx: &mut Context<'_>);
}

impl<F> TaskRun for F
where
    F: FnMut(&mut Context<'_>),
{
    fn run(&mut self, cx: &mut Context<'_>) {
        self(cx)
    }
}

/// Everything about a task a body may read or change
pub(crate) struct TaskCore {
    name: String,
    kind: TaskKind,
    serial: usize,
    status: Arc<StatusCell>,
    priority: Option<i32>,
    /// Zero for kinds without an interval
    interval: Duration,
    next_due: Instant,
    tolerance: Duration,
    late_fraction: f64,
    runs: u64,
    /// Numeric state of runner-based tasks, traced on change
    numeric_state: i64,
    trace: bool,
}

impl TaskCore {
    fn status(&self) -> TaskStatus {
        self.status.load()
    }

    fn set_status(&self, status: TaskStatus) {
        self.status.store(status);
    }

    fn sample_time(&self) -> Option<Duration> {
        self.kind.has_interval().then_some(self.interval)
    }

    fn priority(&self) -> Option<i32> {
        self.kind.has_priority().then_some(self.priority).flatten()
    }

    fn idle(&self) {
        if self.kind != TaskKind::Continuous {
            self.set_status(TaskStatus::Idle);
        }
    }

    fn deactivate(&self) {
        self.set_status(TaskStatus::Deactivated);
    }

    fn reactivate(&mut self, now: Instant) {
        if self.status() != TaskStatus::Deactivated {
            return;
        }
        match self.kind {
            TaskKind::TimerInterrupt | TaskKind::SampleTime => {
                self.next_due = now;
                self.set_status(TaskStatus::Idle);
            }
            TaskKind::Preemptible => {
                self.next_due = now;
                self.set_status(TaskStatus::Ready);
            }
            _ => self.set_status(TaskStatus::Ready),
        }
    }

    fn set_sample_time(&mut self, interval: Duration) -> bool {
        if !self.kind.has_interval() || interval.ticks() == 0 {
            return false;
        }
        self.interval = interval;
        self.update_tolerance();
        true
    }

    fn update_tolerance(&mut self) {
        let ticks = (self.interval.ticks() as f64 * self.late_fraction).round();
        self.tolerance = Duration::from_ticks(ticks as u64);
    }
}

/// View of the running task handed to bodies.
///
/// A detached context (no task, no clock) turns every task call into a
/// no-op, so states can be exercised before they are attached.
pub struct Context<'a> {
    task: Option<&'a mut TaskCore>,
    clock: Option<&'a mut TimeSource>,
    guard: Option<&'a InterruptGuard>,
    now: Instant,
    fault: Option<SchedError>,
}

impl<'a> Context<'a> {
    /// Context bound to no task, frozen at `now`
    pub fn detached(now: Instant) -> Self {
        Self {
            task: None,
            clock: None,
            guard: None,
            now,
            fault: None,
        }
    }

    pub(crate) fn attached(
        task: &'a mut TaskCore,
        clock: &'a mut TimeSource,
        guard: &'a InterruptGuard,
        now: Instant,
    ) -> Self {
        Self {
            task: Some(task),
            clock: Some(clock),
            guard: Some(guard),
            now,
            fault: None,
        }
    }

    /// Current time. A clock fault is kept and reported once the body
    /// returns; the last good reading is used meanwhile.
    pub fn now(&mut self) -> Instant {
        if let Some(clock) = self.clock.as_deref_mut() {
            match clock.now_protected() {
                Ok(t) => self.now = t,
                Err(e) => {
                    self.fault.get_or_insert(e);
                }
            }
        }
        self.now
    }

    pub fn task_name(&self) -> &str {
        self.task.as_deref().map_or("", |t| t.name.as_str())
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.task.as_deref().map(TaskCore::status)
    }

    /// Completed runs before this one
    pub fn runs(&self) -> u64 {
        self.task.as_deref().map_or(0, |t| t.runs)
    }

    /// Done until the next period (or trigger)
    pub fn idle(&mut self) {
        if let Some(task) = self.task.as_deref() {
            task.idle();
        }
    }

    pub fn deactivate(&mut self) {
        if let Some(task) = self.task.as_deref() {
            task.deactivate();
        }
    }

    pub fn reactivate(&mut self) {
        let now = self.now();
        if let Some(task) = self.task.as_deref_mut() {
            task.reactivate(now);
        }
    }

    pub fn sample_time(&self) -> Option<Duration> {
        self.task.as_deref().and_then(TaskCore::sample_time)
    }

    /// Change the interval; false if the task has none or `interval` is zero
    pub fn set_sample_time(&mut self, interval: Duration) -> bool {
        self.task
            .as_deref_mut()
            .is_some_and(|t| t.set_sample_time(interval))
    }

    pub fn priority(&self) -> Option<i32> {
        self.task.as_deref().and_then(TaskCore::priority)
    }

    /// Set the numeric state traced for runner-based tasks
    pub fn set_state(&mut self, state: i64) {
        if let Some(task) = self.task.as_deref_mut() {
            task.numeric_state = state;
        }
    }

    pub fn state(&self) -> i64 {
        self.task.as_deref().map_or(0, |t| t.numeric_state)
    }

    /// Open a critical section against foreground dispatch
    pub fn prevent_preemption(&self) -> Option<PreemptionLock<'a>> {
        self.guard.map(InterruptGuard::prevent_preemption)
    }

    pub(crate) fn take_fault(&mut self) -> Option<SchedError> {
        self.fault.take()
    }
}

/// Engine resources borrowed by one sweep
pub struct Dispatch<'a> {
    clock: &'a mut TimeSource,
    trace: Option<&'a mut TraceLog>,
    guard: &'a InterruptGuard,
    process: usize,
    visits: u64,
}

impl<'a> Dispatch<'a> {
    pub fn new(clock: &'a mut TimeSource, guard: &'a InterruptGuard) -> Self {
        Self {
            clock,
            trace: None,
            guard,
            process: 0,
            visits: 0,
        }
    }

    /// Record transitions into `log`
    pub fn with_trace(mut self, log: &'a mut TraceLog) -> Self {
        self.trace = Some(log);
        self
    }

    /// Index of the process being swept, for trace records
    pub fn for_process(&mut self, process: usize) -> &mut Self {
        self.process = process;
        self
    }

    pub fn clock(&mut self) -> &mut TimeSource {
        &mut *self.clock
    }

    /// Count one task visit; simulated time moves one tick
    pub(crate) fn visit(&mut self) {
        self.visits += 1;
        self.clock.increment();
    }

    /// Task visits so far
    pub fn visits(&self) -> u64 {
        self.visits
    }
}

struct StateMachine {
    states: Vec<State>,
    initial: Option<StateId>,
    current: Option<StateId>,
}

struct Runner {
    run: Box<dyn TaskRun>,
    profiler: Profiler,
    profiling: bool,
}

enum Body {
    Empty,
    States(StateMachine),
    Runner(Runner),
}

enum BodyFault {
    NoBody,
    NoInitialState,
    UnknownState(usize),
    Clock(SchedError),
}

impl StateMachine {
    /// Scan the current state; returns (from, to) when it transitioned
    fn run(&mut self, cx: &mut Context<'_>) -> Result<Option<(StateId, StateId)>, BodyFault> {
        let current = match self.current {
            Some(id) => id,
            None => {
                let initial = self.initial.ok_or(BodyFault::NoInitialState)?;
                self.current = Some(initial);
                initial
            }
        };
        let state = self
            .states
            .get_mut(current.0)
            .ok_or(BodyFault::UnknownState(current.0))?;
        let Some(next) = state.schedule(cx) else {
            return Ok(None);
        };
        self.states
            .get_mut(next.0)
            .ok_or(BodyFault::UnknownState(next.0))?
            .mark_entering();
        self.current = Some(next);
        Ok(Some((current, next)))
    }
}

/// Schedulable unit
pub struct Task {
    core: TaskCore,
    body: Body,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.core.name)
            .field("kind", &self.core.kind)
            .field("serial", &self.core.serial)
            .field("status", &self.core.status())
            .field("runs", &self.core.runs)
            .finish()
    }
}

impl Task {
    /// Build a task, checking `params` against `kind`.
    ///
    /// Priority is required exactly for Preemptible, SampleTime and Event
    /// tasks; an interval exactly for TimerInterrupt, Preemptible and
    /// SampleTime tasks.
    pub fn new(
        name: impl Into<String>,
        kind: TaskKind,
        params: TaskParams,
    ) -> Result<Self, SchedError> {
        let name = name.into();
        if kind == TaskKind::Hardware {
            return Err(SchedError::ReservedKind { task: name, kind });
        }
        if kind.has_priority() != params.priority.is_some()
            || kind.has_interval() != params.interval.is_some()
        {
            return Err(SchedError::WrongParameters { task: name, kind });
        }
        let interval = params.interval.unwrap_or(Duration::from_ticks(0));
        if kind.has_interval() && interval.ticks() == 0 {
            return Err(SchedError::ZeroInterval { task: name });
        }
        let initial = if kind == TaskKind::Continuous {
            TaskStatus::Ready
        } else {
            TaskStatus::Idle
        };

        let mut core = TaskCore {
            name,
            kind,
            serial: 0,
            status: Arc::new(StatusCell::new(initial)),
            priority: params.priority,
            interval,
            next_due: START + interval,
            tolerance: Duration::from_ticks(0),
            late_fraction: DEFAULT_LATE_TIME_FRACTION,
            runs: 0,
            numeric_state: 0,
            trace: true,
        };
        core.update_tolerance();
        Ok(Self {
            core,
            body: Body::Empty,
        })
    }

    pub fn timer_interrupt(
        name: impl Into<String>,
        interval: Duration,
    ) -> Result<Self, SchedError> {
        Self::new(name, TaskKind::TimerInterrupt, TaskParams::new().interval(interval))
    }

    pub fn preemptible(
        name: impl Into<String>,
        priority: i32,
        interval: Duration,
    ) -> Result<Self, SchedError> {
        Self::new(
            name,
            TaskKind::Preemptible,
            TaskParams::new().priority(priority).interval(interval),
        )
    }

    pub fn sample_time(
        name: impl Into<String>,
        priority: i32,
        interval: Duration,
    ) -> Result<Self, SchedError> {
        Self::new(
            name,
            TaskKind::SampleTime,
            TaskParams::new().priority(priority).interval(interval),
        )
    }

    pub fn event(name: impl Into<String>, priority: i32) -> Result<Self, SchedError> {
        Self::new(name, TaskKind::Event, TaskParams::new().priority(priority))
    }

    pub fn continuous(name: impl Into<String>) -> Result<Self, SchedError> {
        Self::new(name, TaskKind::Continuous, TaskParams::new())
    }

    /// First due time `offset` after start instead of one interval
    pub fn with_phase(mut self, offset: Duration) -> Self {
        self.core.next_due = START + offset;
        self
    }

    /// Use a run callback as the body
    pub fn with_run(mut self, run: impl TaskRun + 'static) -> Result<Self, SchedError> {
        self.set_run(run)?;
        Ok(self)
    }

    /// Use a run callback as the body; refused once states exist
    pub fn set_run(&mut self, run: impl TaskRun + 'static) -> Result<(), SchedError> {
        if matches!(self.body, Body::States(_)) {
            return Err(SchedError::BodyConflict {
                task: self.core.name.clone(),
            });
        }
        self.body = Body::Runner(Runner {
            run: Box::new(run),
            profiler: Profiler::default(),
            profiling: false,
        });
        Ok(())
    }

    /// Reserve a named state; its behavior comes later via `define_state`
    pub fn declare_state(&mut self, name: impl Into<String>) -> Result<StateId, SchedError> {
        if matches!(self.body, Body::Empty) {
            self.body = Body::States(StateMachine {
                states: Vec::new(),
                initial: None,
                current: None,
            });
        }
        let Body::States(sm) = &mut self.body else {
            return Err(SchedError::BodyConflict {
                task: self.core.name.clone(),
            });
        };
        let id = StateId(sm.states.len());
        let mut state = State::declared(name);
        state.set_serial(id.serial());
        sm.states.push(state);
        Ok(id)
    }

    pub fn define_state(
        &mut self,
        id: StateId,
        logic: impl StateLogic + 'static,
    ) -> Result<(), SchedError> {
        let state = self.state_entry(id)?;
        state.define(Box::new(logic))
    }

    /// Declare and define in one step
    pub fn add_state(
        &mut self,
        name: impl Into<String>,
        logic: impl StateLogic + 'static,
    ) -> Result<StateId, SchedError> {
        let id = self.declare_state(name)?;
        self.define_state(id, logic)?;
        Ok(id)
    }

    pub fn set_initial_state(&mut self, id: StateId) -> Result<(), SchedError> {
        self.state_entry(id)?;
        if let Body::States(sm) = &mut self.body {
            sm.initial = Some(id);
        }
        Ok(())
    }

    fn state_entry(&mut self, id: StateId) -> Result<&mut State, SchedError> {
        let unknown = SchedError::UnknownState {
            task: self.core.name.clone(),
            state: id.0,
        };
        match &mut self.body {
            Body::States(sm) => sm.states.get_mut(id.0).ok_or(unknown),
            _ => Err(unknown),
        }
    }

    /// Body present and every declared state defined
    pub(crate) fn validate(&self) -> Result<(), SchedError> {
        match &self.body {
            Body::Empty => Err(SchedError::NoBody {
                task: self.core.name.clone(),
            }),
            Body::Runner(_) => Ok(()),
            Body::States(sm) => match sm.states.iter().find(|s| !s.is_defined()) {
                Some(s) => Err(SchedError::UndefinedState {
                    task: self.core.name.clone(),
                    state: s.name().to_owned(),
                }),
                None => Ok(()),
            },
        }
    }

    pub(crate) fn set_serial(&mut self, serial: usize) {
        self.core.serial = serial;
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn kind(&self) -> TaskKind {
        self.core.kind
    }

    /// Serial number within the owning process (0 until inserted)
    pub fn serial(&self) -> usize {
        self.core.serial
    }

    pub fn status(&self) -> TaskStatus {
        self.core.status()
    }

    pub fn priority(&self) -> Option<i32> {
        self.core.priority()
    }

    /// Sample interval (None for kinds without one)
    pub fn sample_interval(&self) -> Option<Duration> {
        self.core.sample_time()
    }

    /// Change the interval and recompute the tolerance
    pub fn set_sample_time(&mut self, interval: Duration) -> bool {
        self.core.set_sample_time(interval)
    }

    /// Allowed lateness as a fraction of the interval
    pub fn set_timing_tolerance(&mut self, fraction: f64) {
        self.core.late_fraction = if fraction.is_finite() { fraction.max(0.0) } else { 0.0 };
        self.core.update_tolerance();
    }

    pub fn tolerance(&self) -> Duration {
        self.core.tolerance
    }

    pub fn next_due(&self) -> Instant {
        self.core.next_due
    }

    pub fn runs(&self) -> u64 {
        self.core.runs
    }

    /// Numeric state of a runner-based task
    pub fn numeric_state(&self) -> i64 {
        self.core.numeric_state
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        match &self.body {
            Body::States(sm) => sm.states.get(id.0),
            _ => None,
        }
    }

    pub fn state_mut(&mut self, id: StateId) -> Option<&mut State> {
        self.state_entry(id).ok()
    }

    /// States in declaration order
    pub fn states(&self) -> impl Iterator<Item = &State> + '_ {
        let states: &[State] = match &self.body {
            Body::States(sm) => &sm.states,
            _ => &[],
        };
        states.iter()
    }

    pub fn current_state(&self) -> Option<StateId> {
        match &self.body {
            Body::States(sm) => sm.current,
            _ => None,
        }
    }

    pub fn idle(&mut self) {
        self.core.idle();
    }

    pub fn deactivate(&mut self) {
        self.core.deactivate();
    }

    /// Leave Deactivated; periodic tasks become due at `now`
    pub fn reactivate(&mut self, now: Instant) {
        self.core.reactivate(now);
    }

    /// Fire an Event task: Idle -> Pending
    pub fn trigger_event(&self) -> Result<(), TriggerError> {
        if self.core.kind != TaskKind::Event {
            return Err(TriggerError::WrongKind(self.core.kind));
        }
        self.core.status.trigger().map_err(TriggerError::NotIdle)
    }

    /// Trigger handle for an Event task
    pub fn event_trigger(&self) -> Option<EventTrigger> {
        (self.core.kind == TaskKind::Event).then(|| EventTrigger {
            status: Arc::clone(&self.core.status),
        })
    }

    pub fn trace_on(&mut self) {
        self.core.trace = true;
    }

    pub fn trace_off(&mut self) {
        self.core.trace = false;
    }

    pub fn is_tracing(&self) -> bool {
        self.core.trace
    }

    #[cfg(test)]
    pub(crate) fn force_status(&mut self, status: TaskStatus) {
        self.core.set_status(status);
    }

    /// One dispatch visit.
    ///
    /// Busy tasks are left alone. Periodic tasks run only once due and
    /// fail fatally when later than their tolerance; Event tasks only when
    /// triggered. Returns Ready after a run unless the body idled or
    /// deactivated the task.
    pub fn schedule(&mut self, env: &mut Dispatch<'_>) -> Result<TaskStatus, SchedError> {
        let status = self.core.status();
        if status.is_busy() {
            return Ok(status);
        }

        let kind = self.core.kind;
        if (kind.is_periodic() && status == TaskStatus::Idle) || kind == TaskKind::Preemptible {
            let now = env.clock.now()?;
            let deadline = Deadline::new(self.core.next_due, self.core.tolerance);
            if deadline.is_early(now) {
                return Ok(TaskStatus::Idle);
            }
            if deadline.is_missed(now) {
                return Err(SchedError::DeadlineOverrun {
                    task: self.core.name.clone(),
                    now,
                    due: self.core.next_due,
                    tolerance: self.core.tolerance,
                });
            }
            self.core.set_status(TaskStatus::Ready);
            self.core.next_due = self.core.next_due + self.core.interval;
        }

        if kind == TaskKind::Event && self.core.status() == TaskStatus::Idle {
            return Ok(TaskStatus::Idle);
        }

        self.core.set_status(TaskStatus::Running);
        let old_state = self.core.numeric_state;
        let now = env.clock.last_read();
        let guard = env.guard;

        let outcome = match &mut self.body {
            Body::Empty => Err(BodyFault::NoBody),
            Body::Runner(runner) => {
                let mut cx = Context::attached(&mut self.core, &mut *env.clock, guard, now);
                let begin = runner.profiling.then(|| cx.now());
                runner.run.run(&mut cx);
                if let Some(begin) = begin {
                    let end = cx.now();
                    runner.profiler.record(elapsed(begin, end));
                }
                cx.take_fault().map_or(Ok(None), |e| Err(BodyFault::Clock(e)))
            }
            Body::States(sm) => {
                let mut cx = Context::attached(&mut self.core, &mut *env.clock, guard, now);
                let moved = sm.run(&mut cx);
                match cx.take_fault() {
                    Some(e) => Err(BodyFault::Clock(e)),
                    None => moved,
                }
            }
        };
        let transition = outcome.map_err(|fault| self.fault(fault))?;

        let change = match transition {
            Some((from, to)) if from != to => Some(Change::States { from, to }),
            _ if old_state != self.core.numeric_state => Some(Change::Numeric {
                from: old_state,
                to: self.core.numeric_state,
            }),
            _ => None,
        };
        if let Some(change) = change {
            self.record_transition(env, change);
        }

        self.core.runs += 1;
        match self.core.status() {
            TaskStatus::Running => {
                self.core.set_status(TaskStatus::Ready);
                Ok(TaskStatus::Ready)
            }
            other => Ok(other),
        }
    }

    fn fault(&self, fault: BodyFault) -> SchedError {
        let task = self.core.name.clone();
        match fault {
            BodyFault::NoBody => SchedError::NoBody { task },
            BodyFault::NoInitialState => SchedError::NoInitialState { task },
            BodyFault::UnknownState(state) => SchedError::UnknownState { task, state },
            BodyFault::Clock(e) => e,
        }
    }

    fn record_transition(&self, env: &mut Dispatch<'_>, change: Change) {
        let at = env.clock.last_read();
        match change {
            Change::States { from, to } => log::debug!(
                "{}: {} -> {}",
                self.core.name,
                self.state(from).map_or("?", State::name),
                self.state(to).map_or("?", State::name)
            ),
            Change::Numeric { from, to } => log::debug!("{}: {} -> {}", self.core.name, from, to),
        }
        if !self.core.trace {
            return;
        }
        if let Some(log) = env.trace.as_deref_mut() {
            log.record(TraceRecord {
                at,
                process: env.process,
                task: self.core.serial,
                change,
            });
        }
    }

    /// Profile the run callback, or every state of a state-based task
    pub fn profile_on(&mut self) {
        match &mut self.body {
            Body::Runner(r) => r.profiling = true,
            Body::States(sm) => sm.states.iter_mut().for_each(State::profile_on),
            Body::Empty => {}
        }
    }

    pub fn profile_off(&mut self) {
        match &mut self.body {
            Body::Runner(r) => r.profiling = false,
            Body::States(sm) => sm.states.iter_mut().for_each(State::profile_off),
            Body::Empty => {}
        }
    }

    /// Profile summaries: the run callback, or each state's hooks
    pub fn write_profile<W: Write>(&self, w: &mut W) -> fmt::Result {
        match &self.body {
            Body::Runner(r) => {
                write_banner(w, &format!("----- Task \"{}\" Run Function ", self.core.name))?;
                r.profiler.write_profile(w)
            }
            Body::States(sm) => sm
                .states
                .iter()
                .try_for_each(|s| s.write_profile(w, &self.core.name)),
            Body::Empty => Ok(()),
        }
    }

    /// Histogram of run callback durations
    pub fn write_durations<W: Write>(&self, w: &mut W) -> fmt::Result {
        match &self.body {
            Body::Runner(r) => r.profiler.write_histogram(w),
            _ => {
                writeln!(w, "ERROR!  Task \"{}\" is state based.", self.core.name)?;
                writeln!(w, "        Run() function timing is not available")
            }
        }
    }

    /// Write the profile summaries to a file; failure is fatal
    pub fn dump_profile(&self, path: impl AsRef<Path>) -> Result<(), SchedError> {
        let path = path.as_ref();
        std::fs::write(path, render(|s| self.write_profile(s)))
            .map_err(|e| SchedError::profile_io(path, e))
    }

    /// Write the duration histogram to a file; failure is fatal
    pub fn dump_durations(&self, path: impl AsRef<Path>) -> Result<(), SchedError> {
        let path = path.as_ref();
        std::fs::write(path, render(|s| self.write_durations(s)))
            .map_err(|e| SchedError::profile_io(path, e))
    }

    /// One row of the process configuration table
    pub fn write_configuration<W: Write>(&self, w: &mut W) -> fmt::Result {
        let priority = match self.priority() {
            Some(p) => format!("{p:4}"),
            None => "    -".to_owned(),
        };
        let sample = match self.sample_interval() {
            Some(d) => format!("{:9.3}", duration_secs(d)),
            None => "  -  ".to_owned(),
        };
        write!(
            w,
            "\n{:<24} {:>9} {:>4}  {:>11}  ",
            self.core.name,
            self.core.kind.name(),
            priority,
            sample
        )?;
        let mut states = self.states();
        match states.next() {
            Some(first) => writeln!(w, "{:<24}", first.name())?,
            None => writeln!(w, "{:<24}", " - ")?,
        }
        for state in states {
            writeln!(w, "{:56}{}", "", state.name())?;
        }
        Ok(())
    }

    /// Status block at time `now`
    pub fn write_status<W: Write>(&self, w: &mut W, now: Instant) -> fmt::Result {
        write!(
            w,
            "        Name: {:<18}  Type: {:<16}  Time: {}\n        Status: {:<16}  Runs: {}\n",
            self.core.name,
            self.core.kind.name(),
            as_secs(now),
            self.core.status().name(),
            self.core.runs
        )?;
        if self.core.kind.is_periodic() {
            write!(w, "        Sample Time: {:<11}", duration_secs(self.core.interval))?;
        }
        if matches!(self.core.kind, TaskKind::SampleTime | TaskKind::Event) {
            if let Some(p) = self.core.priority {
                write!(w, "  Priority: {p}")?;
            }
        }
        write!(w, "\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FnState;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn clock_at(ms: u64) -> TimeSource {
        let mut clock = TimeSource::simulated();
        clock.setup(Duration::millis(1)).unwrap();
        clock.start();
        clock.advance(Duration::millis(ms));
        clock
    }

    fn counting(task: Task) -> (Task, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let task = task.with_run(move |_: &mut Context<'_>| seen.set(seen.get() + 1)).unwrap();
        (task, count)
    }

    #[test]
    fn test_wrong_parameters_rejected() {
        let none = TaskParams::new();
        let prio = TaskParams::new().priority(1);
        let every = TaskParams::new().interval(Duration::millis(10));
        let both = prio.interval(Duration::millis(10));

        let cases = [
            (TaskKind::TimerInterrupt, every, [none, prio, both]),
            (TaskKind::Preemptible, both, [none, prio, every]),
            (TaskKind::SampleTime, both, [none, prio, every]),
            (TaskKind::Event, prio, [none, every, both]),
            (TaskKind::Continuous, none, [prio, every, both]),
        ];
        for (kind, good, bad) in cases {
            assert!(Task::new("ok", kind, good).is_ok(), "{kind:?}");
            for params in bad {
                assert!(
                    matches!(
                        Task::new("bad", kind, params),
                        Err(SchedError::WrongParameters { .. })
                    ),
                    "{kind:?} {params:?}"
                );
            }
        }
    }

    #[test]
    fn test_reserved_and_zero_interval() {
        assert!(matches!(
            Task::new("hw", TaskKind::Hardware, TaskParams::new()),
            Err(SchedError::ReservedKind { .. })
        ));
        assert!(matches!(
            Task::sample_time("zero", 1, Duration::from_ticks(0)),
            Err(SchedError::ZeroInterval { .. })
        ));
    }

    #[test]
    fn test_initial_status_and_timing() {
        let task = Task::sample_time("Heater", 5, Duration::millis(100)).unwrap();
        assert_eq!(task.status(), TaskStatus::Idle);
        assert_eq!(task.next_due().ticks(), 100_000);
        assert_eq!(task.tolerance().ticks(), 100_000);
        assert_eq!(Task::continuous("Loop").unwrap().status(), TaskStatus::Ready);

        let phased = Task::timer_interrupt("Fast", Duration::millis(10))
            .unwrap()
            .with_phase(Duration::millis(3));
        assert_eq!(phased.next_due().ticks(), 3_000);
    }

    #[test]
    fn test_heater_scenario() {
        let guard = InterruptGuard::default();
        let heater = Task::sample_time("Heater", 5, Duration::millis(100)).unwrap();
        let (mut heater, runs) = counting(heater);

        let mut clock = clock_at(50);
        let status = heater.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Idle);
        assert_eq!(heater.next_due().ticks(), 100_000);
        assert_eq!(runs.get(), 0);

        let mut clock = clock_at(100);
        let status = heater.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Ready);
        assert_eq!(heater.next_due().ticks(), 200_000);
        assert_eq!(runs.get(), 1);
        assert_eq!(heater.runs(), 1);
    }

    #[test]
    fn test_overrun_window() {
        let guard = InterruptGuard::default();
        let task = || {
            Task::sample_time("Pump", 1, Duration::millis(100))
                .unwrap()
                .with_run(|cx: &mut Context<'_>| cx.idle())
                .unwrap()
        };

        let mut at_edge = task();
        let mut clock = clock_at(200);
        let status = at_edge.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Idle);
        assert_eq!(at_edge.runs(), 1);

        let mut late = task();
        let mut clock = clock_at(201);
        let err = late.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap_err();
        assert!(matches!(err, SchedError::DeadlineOverrun { .. }));
        assert_eq!(late.runs(), 0);
    }

    #[test]
    fn test_tolerance_follows_fraction() {
        let mut task = Task::preemptible("Ctl", 3, Duration::millis(10)).unwrap();
        task.set_timing_tolerance(0.5);
        assert_eq!(task.tolerance().ticks(), 5_000);
        assert!(task.set_sample_time(Duration::millis(40)));
        assert_eq!(task.sample_interval(), Some(Duration::millis(40)));
        assert_eq!(task.tolerance().ticks(), 20_000);
        assert!(!task.set_sample_time(Duration::from_ticks(0)));

        let mut event = Task::event("Btn", 1).unwrap();
        assert!(!event.set_sample_time(Duration::millis(1)));
        assert_eq!(event.sample_interval(), None);
    }

    #[test]
    fn test_button_event_scenario() {
        let guard = InterruptGuard::default();
        let (mut button, runs) = counting(Task::event("Button", 2).unwrap());
        let mut clock = clock_at(0);

        let status = button.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Idle);
        assert_eq!(runs.get(), 0);

        button.trigger_event().unwrap();
        assert_eq!(button.status(), TaskStatus::Pending);
        assert_eq!(
            button.trigger_event(),
            Err(TriggerError::NotIdle(TaskStatus::Pending))
        );
        let status = button.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Ready);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_event_trigger_handle() {
        let guard = InterruptGuard::default();
        let mut task = Task::event("Alarm", 1)
            .unwrap()
            .with_run(|cx: &mut Context<'_>| cx.idle())
            .unwrap();
        let trigger = task.event_trigger().unwrap();
        let remote = std::thread::spawn(move || trigger.trigger());
        remote.join().unwrap().unwrap();

        let mut clock = clock_at(0);
        let status = task.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Idle);
        assert_eq!(task.runs(), 1);

        let sampled = Task::sample_time("S", 1, Duration::millis(1)).unwrap();
        assert!(sampled.event_trigger().is_none());
        assert_eq!(
            sampled.trigger_event(),
            Err(TriggerError::WrongKind(TaskKind::SampleTime))
        );
    }

    #[test]
    fn test_busy_task_not_run() {
        let guard = InterruptGuard::default();
        let (mut task, runs) = counting(Task::continuous("Loop").unwrap());
        let mut clock = clock_at(0);
        for busy in [TaskStatus::Running, TaskStatus::Preempted, TaskStatus::Deactivated] {
            task.force_status(busy);
            assert_eq!(task.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap(), busy);
        }
        assert_eq!(runs.get(), 0);
    }

    #[test]
    fn test_reactivate() {
        let mut periodic = Task::sample_time("P", 1, Duration::millis(10)).unwrap();
        periodic.deactivate();
        periodic.reactivate(Instant::from_ticks(42_000));
        assert_eq!(periodic.status(), TaskStatus::Idle);
        assert_eq!(periodic.next_due().ticks(), 42_000);

        let mut cont = Task::continuous("C").unwrap();
        cont.deactivate();
        cont.reactivate(START);
        assert_eq!(cont.status(), TaskStatus::Ready);

        // reactivate is a no-op unless deactivated
        let mut idle = Task::event("E", 1).unwrap();
        idle.reactivate(START);
        assert_eq!(idle.status(), TaskStatus::Idle);
    }

    #[test]
    fn test_continuous_ignores_idle() {
        let mut task = Task::continuous("C").unwrap();
        task.idle();
        assert_eq!(task.status(), TaskStatus::Ready);
    }

    #[test]
    fn test_body_required() {
        let guard = InterruptGuard::default();
        let mut bare = Task::continuous("Bare").unwrap();
        assert!(matches!(bare.validate(), Err(SchedError::NoBody { .. })));
        let mut clock = clock_at(0);
        assert!(matches!(
            bare.schedule(&mut Dispatch::new(&mut clock, &guard)),
            Err(SchedError::NoBody { .. })
        ));
    }

    #[test]
    fn test_body_conflict() {
        let mut task = Task::continuous("Mixed").unwrap();
        task.add_state("A", FnState::new().on_action(|_| {})).unwrap();
        assert!(matches!(
            task.set_run(|_: &mut Context<'_>| {}),
            Err(SchedError::BodyConflict { .. })
        ));

        let mut runner = Task::continuous("Runner")
            .unwrap()
            .with_run(|_: &mut Context<'_>| {})
            .unwrap();
        assert!(matches!(runner.declare_state("A"), Err(SchedError::BodyConflict { .. })));
    }

    #[test]
    fn test_undefined_and_initial_state() {
        let guard = InterruptGuard::default();
        let mut task = Task::continuous("Fsm").unwrap();
        let later = task.declare_state("Later").unwrap();
        assert!(matches!(task.validate(), Err(SchedError::UndefinedState { .. })));
        task.define_state(later, FnState::new().on_action(|_| {})).unwrap();
        assert!(task.validate().is_ok());

        let mut clock = clock_at(0);
        assert!(matches!(
            task.schedule(&mut Dispatch::new(&mut clock, &guard)),
            Err(SchedError::NoInitialState { .. })
        ));
        assert!(task.set_initial_state(StateId(7)).is_err());
    }

    #[test]
    fn test_state_transition_and_trace() {
        let guard = InterruptGuard::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut task = Task::continuous("Door").unwrap();
        let closed = task.declare_state("Closed").unwrap();
        let open = task.declare_state("Open").unwrap();

        let l = log.clone();
        let closed_logic = FnState::new()
            .on_action(move |_| l.borrow_mut().push("closed"))
            .on_transition(move |_| Some(open));
        task.define_state(closed, closed_logic).unwrap();
        let (a, b) = (log.clone(), log.clone());
        task.define_state(
            open,
            FnState::new()
                .on_entry(move |_| a.borrow_mut().push("enter open"))
                .on_action(move |_| b.borrow_mut().push("open")),
        )
        .unwrap();
        task.set_initial_state(closed).unwrap();
        task.set_serial(4);

        let mut clock = clock_at(5);
        let mut trace = TraceLog::new();
        let mut env = Dispatch::new(&mut clock, &guard).with_trace(&mut trace);
        env.for_process(1);
        for _ in 0..3 {
            assert_eq!(task.schedule(&mut env).unwrap(), TaskStatus::Ready);
        }
        assert_eq!(task.current_state(), Some(open));
        assert_eq!(*log.borrow(), vec!["closed", "enter open", "open", "open"]);

        let records: Vec<_> = trace.iter().copied().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].process, 1);
        assert_eq!(records[0].task, 4);
        assert_eq!(records[0].change, Change::States { from: closed, to: open });
    }

    #[test]
    fn test_numeric_state_trace() {
        let guard = InterruptGuard::default();
        let mut task = Task::continuous("Count")
            .unwrap()
            .with_run(|cx: &mut Context<'_>| {
                if cx.runs() % 2 == 1 {
                    cx.set_state(cx.state() + 1);
                }
            })
            .unwrap();
        let mut clock = clock_at(0);
        let mut trace = TraceLog::new();
        {
            let mut env = Dispatch::new(&mut clock, &guard).with_trace(&mut trace);
            for _ in 0..3 {
                task.schedule(&mut env).unwrap();
            }
        }
        assert_eq!(task.numeric_state(), 1);
        let changes: Vec<_> = trace.iter().map(|r| r.change).collect();
        assert_eq!(changes, vec![Change::Numeric { from: 0, to: 1 }]);

        // fourth run changes state again, untraced
        task.trace_off();
        let mut env = Dispatch::new(&mut clock, &guard).with_trace(&mut trace);
        task.schedule(&mut env).unwrap();
        assert_eq!(task.numeric_state(), 2);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn test_context_reaches_task() {
        let guard = InterruptGuard::default();
        let seen = Rc::new(Cell::new((None, None)));
        let out = seen.clone();
        let mut task = Task::preemptible("Servo", 7, Duration::millis(2))
            .unwrap()
            .with_run(move |cx: &mut Context<'_>| {
                out.set((cx.priority(), cx.sample_time()));
                assert_eq!(cx.task_name(), "Servo");
                assert_eq!(cx.status(), Some(TaskStatus::Running));
                let lock = cx.prevent_preemption();
                assert!(lock.is_some());
                cx.deactivate();
            })
            .unwrap();
        let mut clock = clock_at(2);
        let status = task.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();
        assert_eq!(status, TaskStatus::Deactivated);
        assert_eq!(seen.get(), (Some(7), Some(Duration::millis(2))));
        assert_eq!(guard.preemption_locks(), 0);
    }

    #[test]
    fn test_runner_profile() {
        let guard = InterruptGuard::default();
        let (mut task, _) = counting(Task::continuous("Prof").unwrap());
        task.profile_on();
        let mut clock = clock_at(0);
        task.schedule(&mut Dispatch::new(&mut clock, &guard)).unwrap();

        let text = render(|s| task.write_profile(s));
        assert!(text.starts_with("----- Task \"Prof\" Run Function ---"));
        assert!(text.contains("Number of runs:     1"));

        let states = Task::continuous("Fsm").unwrap();
        let text = render(|s| states.write_durations(s));
        assert!(text.contains("is state based"));
    }

    #[test]
    fn test_dump_profile_fails_on_bad_path() {
        let task = Task::continuous("P").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no").join("such").join("file.txt");
        assert!(matches!(task.dump_profile(&missing), Err(SchedError::ProfileIo { .. })));

        let ok = dir.path().join("durations.txt");
        task.dump_durations(&ok).unwrap();
        assert!(std::fs::read_to_string(ok).unwrap().starts_with("ERROR!"));
    }

    #[test]
    fn test_configuration_row() {
        let mut task = Task::sample_time("Heater", 5, Duration::millis(100)).unwrap();
        task.add_state("Off", FnState::new().on_action(|_| {})).unwrap();
        task.add_state("On", FnState::new().on_action(|_| {})).unwrap();
        let text = render(|s| task.write_configuration(s));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "");
        let row = "Heater                   Sample Time    5        0.100  Off";
        assert!(lines[1].starts_with(row));
        assert_eq!(lines[2], format!("{:56}On", ""));

        let cont = Task::continuous("Loop").unwrap();
        let text = render(|s| cont.write_configuration(s));
        assert!(text.contains("Continuous     -          -     -"));
    }

    #[test]
    fn test_status_block() {
        let task = Task::sample_time("Heater", 5, Duration::millis(100)).unwrap();
        let text = render(|s| task.write_status(s, Instant::from_ticks(250_000)));
        assert!(text.contains("Name: Heater"));
        assert!(text.contains("Time: 0.25\n"));
        assert!(text.contains("Status: Idle"));
        assert!(text.contains("Sample Time: 0.1"));
        assert!(text.contains("Priority: 5"));
        assert!(text.ends_with("\n\n"));
    }
}
