//! State: one node of a task's finite-state machine
//!
//! Each scan runs `entry` once on arrival, `action` every scan, then
//! `transition_test`, which may name the next state. Behaviors are plain
//! trait objects; `FnState` builds one from closures.
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};
use core::ops::BitOr;

use crate::error::SchedError;
use crate::profile::{write_banner, Profiler};
use crate::task::Context;
use crate::timer::elapsed;

/// Handle of a state inside its owning task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

impl StateId {
    /// Position in the task's state table
    pub fn index(self) -> usize {
        self.0
    }

    /// 1-based serial number shown in dumps
    pub fn serial(self) -> usize {
        self.0 + 1
    }
}

/// Which hooks a behavior actually implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    entry: bool,
    action: bool,
    transition: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        entry: false,
        action: false,
        transition: false,
    };
    pub const ENTRY: Capabilities = Capabilities {
        entry: true,
        ..Self::NONE
    };
    pub const ACTION: Capabilities = Capabilities {
        action: true,
        ..Self::NONE
    };
    pub const TRANSITION: Capabilities = Capabilities {
        transition: true,
        ..Self::NONE
    };
    pub const ALL: Capabilities = Capabilities {
        entry: true,
        action: true,
        transition: true,
    };

    pub fn has_entry(self) -> bool {
        self.entry
    }

    pub fn has_action(self) -> bool {
        self.action
    }

    pub fn has_transition(self) -> bool {
        self.transition
    }

    pub fn is_empty(self) -> bool {
        self == Self::NONE
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self {
        Capabilities {
            entry: self.entry || rhs.entry,
            action: self.action || rhs.action,
            transition: self.transition || rhs.transition,
        }
    }
}

/// Behavior of one state.
///
/// Every hook defaults to a no-op. `capabilities` must report the hooks
/// an implementation overrides; a behavior reporting none is rejected.
pub trait StateLogic {
    /// Runs once each time the state is entered, before `action`.
    fn entry(&mut self, _cx: &mut Context<'_>) {}

    /// Runs on every scan while the state is current.
    fn action(&mut self, _cx: &mut Context<'_>) {}

    /// Runs after `action`; `Some` names the next state.
    fn transition_test(&mut self, _cx: &mut Context<'_>) -> Option<StateId> {
        None
    }

    /// Hooks this behavior overrides
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }
}

type Hook = Box<dyn FnMut(&mut Context<'_>)>;
type Test = Box<dyn FnMut(&mut Context<'_>) -> Option<StateId>>;

/// State behavior assembled from closures
#[derive(Default)]
pub struct FnState {
    entry: Option<Hook>,
    action: Option<Hook>,
    test: Option<Test>,
}

impl FnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_entry(mut self, f: impl FnMut(&mut Context<'_>) + 'static) -> Self {
        self.entry = Some(Box::new(f));
        self
    }

    pub fn on_action(mut self, f: impl FnMut(&mut Context<'_>) + 'static) -> Self {
        self.action = Some(Box::new(f));
        self
    }

    pub fn on_transition(
        mut self,
        f: impl FnMut(&mut Context<'_>) -> Option<StateId> + 'static,
    ) -> Self {
        self.test = Some(Box::new(f));
        self
    }
}

impl StateLogic for FnState {
    fn entry(&mut self, cx: &mut Context<'_>) {
        if let Some(f) = self.entry.as_mut() {
            f(cx);
        }
    }

    fn action(&mut self, cx: &mut Context<'_>) {
        if let Some(f) = self.action.as_mut() {
            f(cx);
        }
    }

    fn transition_test(&mut self, cx: &mut Context<'_>) -> Option<StateId> {
        self.test.as_mut().and_then(|f| f(cx))
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::NONE;
        if self.entry.is_some() {
            caps = caps | Capabilities::ENTRY;
        }
        if self.action.is_some() {
            caps = caps | Capabilities::ACTION;
        }
        if self.test.is_some() {
            caps = caps | Capabilities::TRANSITION;
        }
        caps
    }
}

/// Execution-time profiles of the three hooks
#[derive(Debug, Clone, Default)]
struct HookProfiles {
    entry: Profiler,
    action: Profiler,
    test: Profiler,
}

/// One node of a task's state machine
pub struct State {
    name: String,
    /// 1-based, assigned by the owning task
    serial: usize,
    logic: Option<Box<dyn StateLogic>>,
    /// Entry must run before the next action
    entering: bool,
    profiling: bool,
    profiles: Option<Box<HookProfiles>>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("defined", &self.logic.is_some())
            .field("entering", &self.entering)
            .field("profiling", &self.profiling)
            .finish()
    }
}

impl State {
    /// Build a state; the behavior must implement at least one hook.
    pub fn new(
        name: impl Into<String>,
        logic: impl StateLogic + 'static,
    ) -> Result<Self, SchedError> {
        let mut state = Self::declared(name);
        state.define(Box::new(logic))?;
        Ok(state)
    }

    /// Named placeholder without behavior yet
    pub(crate) fn declared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serial: 0,
            logic: None,
            entering: true,
            profiling: false,
            profiles: None,
        }
    }

    pub(crate) fn define(&mut self, logic: Box<dyn StateLogic>) -> Result<(), SchedError> {
        if logic.capabilities().is_empty() {
            return Err(SchedError::StateWithoutBehavior {
                state: self.name.clone(),
            });
        }
        self.logic = Some(logic);
        Ok(())
    }

    pub(crate) fn set_serial(&mut self, serial: usize) {
        self.serial = serial;
    }

    pub(crate) fn mark_entering(&mut self) {
        self.entering = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serial number within the owning task (0 until attached)
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Will entry run on the next scan?
    pub fn is_entering(&self) -> bool {
        self.entering
    }

    /// Has a behavior been attached?
    pub fn is_defined(&self) -> bool {
        self.logic.is_some()
    }

    /// One scan: entry (on arrival), action, transition test.
    pub fn schedule(&mut self, cx: &mut Context<'_>) -> Option<StateId> {
        let logic = self.logic.as_mut()?;
        let mut profiles = if self.profiling {
            self.profiles.as_deref_mut()
        } else {
            None
        };

        if self.entering {
            self.entering = false;
            timed(profiles.as_mut().map(|p| &mut p.entry), cx, |cx| logic.entry(cx));
        }
        timed(profiles.as_mut().map(|p| &mut p.action), cx, |cx| logic.action(cx));
        let next = timed(profiles.as_mut().map(|p| &mut p.test), cx, |cx| {
            logic.transition_test(cx)
        });

        if next.is_some() {
            self.entering = true;
        }
        next
    }

    /// Start profiling with the default histogram
    pub fn profile_on(&mut self) {
        self.profiles.get_or_insert_with(Box::default);
        self.profiling = true;
    }

    /// Start profiling with custom histogram bins for all three hooks
    pub fn profile_on_with_bins(
        &mut self,
        count: usize,
        min: f64,
        max: f64,
    ) -> Result<(), SchedError> {
        let profiles = HookProfiles {
            entry: Profiler::with_bins(count, min, max)?,
            action: Profiler::with_bins(count, min, max)?,
            test: Profiler::with_bins(count, min, max)?,
        };
        self.profiles = Some(Box::new(profiles));
        self.profiling = true;
        Ok(())
    }

    pub fn profile_off(&mut self) {
        self.profiling = false;
    }

    pub fn is_profiling(&self) -> bool {
        self.profiling
    }

    /// Runs recorded for (entry, action, test)
    pub fn profiled_runs(&self) -> (u64, u64, u64) {
        self.profiles
            .as_deref()
            .map(|p| (p.entry.runs(), p.action.runs(), p.test.runs()))
            .unwrap_or_default()
    }

    /// Summary blocks for entry, action and test
    pub fn write_profile<W: Write>(&self, w: &mut W, task: &str) -> fmt::Result {
        let empty = HookProfiles::default();
        let profiles = self.profiles.as_deref().unwrap_or(&empty);
        let hooks = [
            ("Entry", &profiles.entry),
            ("Action", &profiles.action),
            ("Test", &profiles.test),
        ];
        for (hook, profiler) in hooks {
            write_banner(
                w,
                &format!("----- Task \"{task}\" State \"{}\" {hook} Function ", self.name),
            )?;
            profiler.write_profile(w)?;
        }
        Ok(())
    }

    /// Histogram tables of the entry, action and test durations
    pub fn write_durations<W: Write>(
        &self,
        entry: &mut W,
        action: &mut W,
        test: &mut W,
    ) -> fmt::Result {
        let empty = HookProfiles::default();
        let profiles = self.profiles.as_deref().unwrap_or(&empty);
        profiles.entry.write_histogram(entry)?;
        profiles.action.write_histogram(action)?;
        profiles.test.write_histogram(test)
    }
}

/// Run `f`, recording its duration when a profiler is given
fn timed<'a, R>(
    profiler: Option<&mut Profiler>,
    cx: &mut Context<'a>,
    f: impl FnOnce(&mut Context<'a>) -> R,
) -> R {
    match profiler {
        None => f(cx),
        Some(p) => {
            let begin = cx.now();
            let out = f(cx);
            p.record(elapsed(begin, cx.now()));
            out
        }
    }
}
