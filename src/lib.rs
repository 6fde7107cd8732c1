//! translogic: Transition-Logic Real-Time Scheduler
//!
//! Don't write control loops, write state machines.
//!
//! Cooperative and preemptive scheduling of control tasks:
//! - Timer-interrupt, preemptible, sample-time, event and continuous tasks
//! - Tasks as state machines (entry / action / transition test) or plain run closures
//! - Sequential, minimum-latency and preemptive dispatch regimes
//! - Simulated, free-running counter, interrupt-tick and host time sources
//! - Bounded transition trace, execution-time profiles and text dumps
//!
//! Author: Moroya Sakamoto

pub mod config;
pub mod error;
pub mod guard;
pub mod list;
pub mod master;
pub mod process;
pub mod profile;
pub mod state;
pub mod task;
pub mod timer;
pub mod trace;

pub use config::{MasterConfig, Regime};
pub use error::{SchedError, TriggerError};
pub use guard::{InterruptGuard, IsrEntry, IsrFrame, PreemptionLock};
pub use list::{ListCategory, TaskList};
pub use master::{IsrOutcome, Master, MasterStatus, ProcessId, StopHandle};
pub use process::{Process, TaskId};
pub use profile::{ProfileSummary, Profiler};
pub use state::{Capabilities, FnState, State, StateId, StateLogic};
pub use task::{Context, Dispatch, EventTrigger, Task, TaskKind, TaskParams, TaskRun, TaskStatus};
pub use timer::{
    ClockKind, Deadline, Duration, HardwareCounter, Instant, SoftCounter, TickHandle, TimeSource,
};
pub use trace::{Change, TraceLog, TraceRecord};
