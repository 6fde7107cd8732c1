//! Error taxonomy for the scheduling engine
//!
//! Configuration errors (bad task parameters, missing bodies), timing
//! errors (deadline overruns, a timer task running into its own next
//! period), interrupt reentry exhaustion and profile output failures are
//! all fatal. The `Master` funnels them into a single stop path.
//!
//! `TriggerError` is the one recoverable outcome: a rejected event
//! trigger has no side effects.
//!
//! Author: Moroya Sakamoto

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::task::{TaskKind, TaskStatus};
use crate::timer::{as_secs, duration_secs, Duration, Instant};

/// Fatal scheduler errors.
#[derive(Debug)]
#[non_exhaustive]
pub enum SchedError {
    /// Constructor parameters do not fit the task kind.
    WrongParameters { task: String, kind: TaskKind },
    /// The kind exists in the taxonomy but the engine never runs it.
    ReservedKind { task: String, kind: TaskKind },
    /// A periodic task was given a zero sample interval.
    ZeroInterval { task: String },
    /// Both states and a run callback were supplied.
    BodyConflict { task: String },
    /// Neither states nor a run callback were supplied.
    NoBody { task: String },
    /// A declared state never received its behavior.
    UndefinedState { task: String, state: String },
    /// A state-based task has no initial state.
    NoInitialState { task: String },
    /// A transition named a state the task does not own.
    UnknownState { task: String, state: usize },
    /// A state behavior declares no entry, action or transition test.
    StateWithoutBehavior { state: String },
    /// A periodic task was dispatched later than its tolerance allows.
    DeadlineOverrun {
        task: String,
        now: Instant,
        due: Instant,
        tolerance: Duration,
    },
    /// A timer-interrupt task was still running at its own next due time.
    InterruptedItself { task: String },
    /// Timer interrupts nested deeper than the configured maximum.
    ReentryLimit { depth: u32, max: u32 },
    /// Tick interval outside 1 us to 1e6 s.
    TickOutOfBounds { tick: Duration },
    /// `go()` was called before a tick interval was configured.
    TickNotConfigured,
    /// Stop time below 1 us.
    StopTimeTooSmall { stop_time: Instant },
    /// Two counter reads differ by more than the plausibility limit.
    CounterOverflow { delta: u32, limit: u32, at: Instant },
    /// Histogram parameters are unusable.
    InvalidHistogram { bins: usize, min: f64, max: f64 },
    /// A profile dump could not be written.
    ProfileIo { path: PathBuf, source: io::Error },
    /// The engine stopped on an earlier fatal error and cannot resume.
    Halted { message: String },
}

impl SchedError {
    /// Wraps a profile dump I/O failure, keeping the path.
    pub fn profile_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ProfileIo {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongParameters { task, kind } => write!(
                f,
                "Task \"{task}\" constructed with wrong parameters for a {} task",
                kind.name()
            ),
            Self::ReservedKind { task, kind } => write!(
                f,
                "Task \"{task}\" has type {}, which the scheduler cannot run",
                kind.name()
            ),
            Self::ZeroInterval { task } => {
                write!(f, "Task \"{task}\" needs a non-zero sample time")
            }
            Self::BodyConflict { task } => write!(
                f,
                "Task \"{task}\" has both states and a run function"
            ),
            Self::NoBody { task } => write!(
                f,
                "No states or Run() function specified for task \"{task}\""
            ),
            Self::UndefinedState { task, state } => write!(
                f,
                "State \"{state}\" of task \"{task}\" was declared but never defined"
            ),
            Self::NoInitialState { task } => {
                write!(f, "No initial state specified for task \"{task}\"")
            }
            Self::UnknownState { task, state } => write!(
                f,
                "Task \"{task}\" has no state with index {state}"
            ),
            Self::StateWithoutBehavior { state } => write!(
                f,
                "State \"{state}\" has no entry, action or transition test function"
            ),
            Self::DeadlineOverrun {
                task,
                now,
                due,
                tolerance,
            } => write!(
                f,
                "Unable to run task \"{task}\" on time (now {:.6}, due {:.6}, tolerance {:.6})",
                as_secs(*now),
                as_secs(*due),
                duration_secs(*tolerance)
            ),
            Self::InterruptedItself { task } => write!(
                f,
                "Timer interrupt task \"{task}\" has interrupted itself"
            ),
            Self::ReentryLimit { depth, max } => write!(
                f,
                "Re-entry depth {depth} exceeds the maximum of {max}"
            ),
            Self::TickOutOfBounds { tick } => write!(
                f,
                "Tick time {:.6} is not within bounds (1 usec to 1Msec)",
                duration_secs(*tick)
            ),
            Self::TickNotConfigured => write!(
                f,
                "Tick time is too small; has the tick interval been set?"
            ),
            Self::StopTimeTooSmall { stop_time } => write!(
                f,
                "Stop time {:.6} is too small",
                as_secs(*stop_time)
            ),
            Self::CounterOverflow { delta, limit, at } => write!(
                f,
                "Timer overflow: {delta} counts since the last read exceed {limit} at time {:.6}",
                as_secs(*at)
            ),
            Self::InvalidHistogram { bins, min, max } => write!(
                f,
                "Invalid histogram parameters: {bins} bins from {min} to {max}"
            ),
            Self::ProfileIo { path, source } => write!(
                f,
                "Cannot write profile file \"{}\": {source}",
                path.display()
            ),
            Self::Halted { message } => write!(f, "Scheduler halted: {message}"),
        }
    }
}

impl std::error::Error for SchedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ProfileIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Why an event trigger was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TriggerError {
    /// Only Event tasks accept triggers.
    WrongKind(TaskKind),
    /// The task was not Idle (already pending, running or deactivated).
    NotIdle(TaskStatus),
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongKind(kind) => {
                write!(f, "{} tasks cannot be triggered", kind.name())
            }
            Self::NotIdle(status) => {
                write!(f, "task is {}, not Idle", status.name())
            }
        }
    }
}

impl std::error::Error for TriggerError {}
