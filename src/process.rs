//! Process: a named group of tasks dispatched together
//!
//! Owns the task arena and the four category lists, and implements the
//! three regime sweeps on top of the list primitives.
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};
use std::path::Path;

use crate::config::Regime;
use crate::error::SchedError;
use crate::list::{ListCategory, TaskList};
use crate::profile::render;
use crate::task::{Dispatch, Task};
use crate::timer::Instant;

/// Handle of a task inside its process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

impl TaskId {
    /// Position in the process's task arena
    pub fn index(self) -> usize {
        self.0
    }
}

/// Named group of tasks
pub struct Process {
    name: String,
    tasks: Vec<Task>,
    /// Indexed by `slot(category)`
    lists: [TaskList; 4],
}

fn slot(category: ListCategory) -> usize {
    match category {
        ListCategory::TimerInterrupt => 0,
        ListCategory::Preemptible => 1,
        ListCategory::Background => 2,
        ListCategory::Continuous => 3,
    }
}

impl Process {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            lists: ListCategory::ALL.map(TaskList::new),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take ownership of `task`, give it a serial number and file it in
    /// the list for its kind. The task's body must be complete.
    pub fn add_task(&mut self, mut task: Task) -> Result<TaskId, SchedError> {
        task.validate()?;
        let kind = task.kind();
        let category = ListCategory::of(kind).ok_or_else(|| SchedError::ReservedKind {
            task: task.name().to_owned(),
            kind,
        })?;
        let id = TaskId(self.tasks.len());
        task.set_serial(id.0 + 1);
        log::trace!("process {}: task {} -> {:?}", self.name, task.name(), category);
        self.tasks.push(task);
        self.lists[slot(category)].insert(id.0, &self.tasks);
        Ok(id)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id.0)
    }

    /// Task with the given serial number (1-based)
    pub fn task_by_serial(&self, serial: usize) -> Option<&Task> {
        self.tasks.get(serial.checked_sub(1)?)
    }

    pub fn find(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().position(|t| t.name() == name).map(TaskId)
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.iter()
    }

    pub fn list(&self, category: ListCategory) -> &TaskList {
        &self.lists[slot(category)]
    }

    /// Tasks in sweep order: category lists one after another
    fn in_sweep_order(&self) -> impl Iterator<Item = &Task> + '_ {
        self.lists
            .iter()
            .flat_map(move |l| l.members().iter().map(move |&i| &self.tasks[i]))
    }

    /// One pass of the non-interrupt side
    pub fn run_background(
        &mut self,
        regime: Regime,
        env: &mut Dispatch<'_>,
    ) -> Result<(), SchedError> {
        let [timer, preemptible, background, continuous] = &mut self.lists;
        let tasks = &mut self.tasks;
        match regime {
            Regime::Sequential => {
                timer.run_all(tasks, env)?;
                preemptible.run_all(tasks, env)?;
                background.run_all(tasks, env)?;
                continuous.run_all(tasks, env)
            }
            Regime::MinimumLatency => {
                timer.run_timer_interrupts(tasks, env)?;
                if !preemptible.run_highest_ready(tasks, env)?
                    && !background.run_next(tasks, env)?
                {
                    continuous.run_next(tasks, env)?;
                }
                Ok(())
            }
            Regime::Preemptive => {
                if !background.run_next(tasks, env)? {
                    continuous.run_next(tasks, env)?;
                }
                Ok(())
            }
        }
    }

    /// One pass of the timer-interrupt side (preemptive regime)
    pub fn run_foreground(&mut self, env: &mut Dispatch<'_>) -> Result<(), SchedError> {
        let [timer, preemptible, _, _] = &self.lists;
        timer.run_timer_interrupts(&mut self.tasks, env)?;
        preemptible.run_preemptive(&mut self.tasks, env)
    }

    pub fn profile_on(&mut self) {
        self.tasks.iter_mut().for_each(Task::profile_on);
    }

    pub fn profile_off(&mut self) {
        self.tasks.iter_mut().for_each(Task::profile_off);
    }

    /// Task configuration table
    pub fn write_configuration<W: Write>(&self, w: &mut W) -> fmt::Result {
        write!(w, "\nConfiguration of Tasks in Process \"{}\"\n\n", self.name)?;
        w.write_str("Task                                            Sample  State\n")?;
        w.write_str("Name                     Type       Priority    Time    Names\n\n")?;
        for task in self.in_sweep_order() {
            task.write_configuration(w)?;
        }
        w.write_str("\n\n")
    }

    /// Status blocks of every task at time `now`
    pub fn write_status<W: Write>(&self, w: &mut W, now: Instant) -> fmt::Result {
        writeln!(w, "Status Dump for Tasks in Process \"{}\"", self.name)?;
        for task in self.in_sweep_order() {
            task.write_status(w, now)?;
        }
        Ok(())
    }

    /// Profiles of every task. Without a real clock the durations mean
    /// nothing, so only a notice is written.
    pub fn write_profiles<W: Write>(&self, w: &mut W, timing: bool) -> fmt::Result {
        if !timing {
            w.write_str("Function timing information is not available.\n")?;
            w.write_str("In order to measure function timing, you must use\n")?;
            return w.write_str("a real-time clock or the preemptive regime.\n\n");
        }
        write!(w, "\nTiming information for tasks in process \"{}\"\n\n", self.name)?;
        for task in self.in_sweep_order() {
            task.write_profile(w)?;
        }
        Ok(())
    }

    /// Write the configuration table to `path`; a failure is only logged
    pub fn dump_configuration(&self, path: impl AsRef<Path>) -> bool {
        write_or_warn(path.as_ref(), "configuration", &render(|s| self.write_configuration(s)))
    }

    /// Write the status dump to `path`; a failure is only logged
    pub fn dump_status(&self, path: impl AsRef<Path>, now: Instant) -> bool {
        write_or_warn(path.as_ref(), "status", &render(|s| self.write_status(s, now)))
    }

    /// Write the profiles to `path`; failure is fatal
    pub fn dump_profiles(&self, path: impl AsRef<Path>, timing: bool) -> Result<(), SchedError> {
        let path = path.as_ref();
        std::fs::write(path, render(|s| self.write_profiles(s, timing)))
            .map_err(|e| SchedError::profile_io(path, e))
    }
}

/// Diagnostic dumps never stop the scheduler
pub(crate) fn write_or_warn(path: &Path, what: &str, text: &str) -> bool {
    match std::fs::write(path, text) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("cannot write {what} dump to {}: {e}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::InterruptGuard;
    use crate::state::FnState;
    use crate::task::{Context, TaskStatus};
    use crate::timer::{Duration, TimeSource};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn logged(task: Task, log: &Log) -> Task {
        let log = log.clone();
        task.with_run(move |cx: &mut Context<'_>| log.borrow_mut().push(cx.task_name().to_owned()))
            .unwrap()
    }

    fn clock_at(ms: u64) -> TimeSource {
        let mut clock = TimeSource::simulated();
        clock.setup(Duration::micros(1)).unwrap();
        clock.start();
        clock.advance(Duration::millis(ms));
        clock
    }

    /// One task of each kind, all due at 10 ms
    fn plant(log: &Log) -> Process {
        let mut p = Process::new("Plant");
        let every = Duration::millis(10);
        p.add_task(logged(Task::continuous("Cont").unwrap(), log)).unwrap();
        p.add_task(logged(Task::sample_time("Samp", 2, every).unwrap(), log)).unwrap();
        p.add_task(logged(Task::preemptible("Pre", 1, every).unwrap(), log)).unwrap();
        p.add_task(
            Task::timer_interrupt("Tmr", every)
                .unwrap()
                .with_run({
                    let log = log.clone();
                    move |cx: &mut Context<'_>| {
                        log.borrow_mut().push("Tmr".into());
                        cx.idle();
                    }
                })
                .unwrap(),
        )
        .unwrap();
        p
    }

    #[test]
    fn test_tasks_filed_by_kind() {
        let p = plant(&Log::default());
        assert_eq!(p.list(ListCategory::Continuous).members(), &[0]);
        assert_eq!(p.list(ListCategory::Background).members(), &[1]);
        assert_eq!(p.list(ListCategory::Preemptible).members(), &[2]);
        assert_eq!(p.list(ListCategory::TimerInterrupt).members(), &[3]);
        assert_eq!(p.task_by_serial(1).unwrap().name(), "Cont");
        assert!(p.task_by_serial(0).is_none());
        assert_eq!(p.find("Tmr").map(TaskId::index), Some(3));
    }

    #[test]
    fn test_add_task_rejects_incomplete() {
        let mut p = Process::new("P");
        let err = p.add_task(Task::continuous("Bare").unwrap()).unwrap_err();
        assert!(matches!(err, SchedError::NoBody { .. }));

        let mut fsm = Task::continuous("Fsm").unwrap();
        fsm.declare_state("Pending").unwrap();
        assert!(matches!(p.add_task(fsm), Err(SchedError::UndefinedState { .. })));
        assert_eq!(p.tasks().count(), 0);
    }

    #[test]
    fn test_sequential_runs_everything_in_category_order() {
        let log = Log::default();
        let mut p = plant(&log);
        let guard = InterruptGuard::default();
        let mut clock = clock_at(10);
        p.run_background(Regime::Sequential, &mut Dispatch::new(&mut clock, &guard))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["Tmr", "Pre", "Samp", "Cont"]);
    }

    #[test]
    fn test_minimum_latency_runs_one_besides_timers() {
        let log = Log::default();
        let mut p = plant(&log);
        let guard = InterruptGuard::default();
        let mut clock = clock_at(10);
        let mut env = Dispatch::new(&mut clock, &guard);

        p.run_background(Regime::MinimumLatency, &mut env).unwrap();
        assert_eq!(*log.borrow(), vec!["Tmr", "Pre"]);

        // preemptible now waits for its next period; background gets the turn
        p.run_background(Regime::MinimumLatency, &mut env).unwrap();
        assert_eq!(*log.borrow(), vec!["Tmr", "Pre", "Samp"]);

        // sample-time task is Ready and runs again; continuous still waits
        p.run_background(Regime::MinimumLatency, &mut env).unwrap();
        assert_eq!(log.borrow().last().map(String::as_str), Some("Samp"));
    }

    #[test]
    fn test_preemptive_split() {
        let log = Log::default();
        let mut p = plant(&log);
        let guard = InterruptGuard::default();
        let mut clock = clock_at(10);
        let mut env = Dispatch::new(&mut clock, &guard);

        p.run_foreground(&mut env).unwrap();
        assert_eq!(*log.borrow(), vec!["Tmr", "Pre"]);
        p.run_background(Regime::Preemptive, &mut env).unwrap();
        assert_eq!(*log.borrow(), vec!["Tmr", "Pre", "Samp"]);
    }

    #[test]
    fn test_preemptive_background_falls_back_to_continuous() {
        let log = Log::default();
        let mut p = Process::new("Idle");
        p.add_task(logged(Task::event("Evt", 1).unwrap(), &log)).unwrap();
        p.add_task(logged(Task::continuous("Cont").unwrap(), &log)).unwrap();
        let guard = InterruptGuard::default();
        let mut clock = clock_at(0);
        p.run_background(Regime::Preemptive, &mut Dispatch::new(&mut clock, &guard))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["Cont"]);
    }

    #[test]
    fn test_configuration_dump() {
        let mut p = plant(&Log::default());
        let mut fsm = Task::event("Door", 3).unwrap();
        fsm.add_state("Closed", FnState::new().on_action(|_| {})).unwrap();
        p.add_task(fsm).unwrap();

        let text = render(|s| p.write_configuration(s));
        assert!(text.starts_with("\nConfiguration of Tasks in Process \"Plant\"\n\n"));
        let tmr = text.find("Tmr").unwrap();
        let door = text.find("Door").unwrap();
        let cont = text.find("Cont").unwrap();
        assert!(tmr < door && door < cont);
        assert!(text.contains("Closed"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn test_status_and_profile_dumps() {
        let p = plant(&Log::default());
        let text = render(|s| p.write_status(s, Instant::from_ticks(0)));
        assert!(text.starts_with("Status Dump for Tasks in Process \"Plant\"\n"));
        assert_eq!(text.matches("Name: ").count(), 4);
        assert!(text.contains(TaskStatus::Ready.name()));

        let text = render(|s| p.write_profiles(s, false));
        assert!(text.starts_with("Function timing information is not available."));
        let text = render(|s| p.write_profiles(s, true));
        assert!(text.contains("Timing information for tasks in process \"Plant\""));
    }

    #[test]
    fn test_dump_files() {
        let p = plant(&Log::default());
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.txt");
        assert!(p.dump_configuration(&config));
        assert!(std::fs::read_to_string(&config).unwrap().contains("Samp"));

        let bad = dir.path().join("missing").join("status.txt");
        assert!(!p.dump_status(&bad, Instant::from_ticks(0)));
        assert!(matches!(p.dump_profiles(&bad, true), Err(SchedError::ProfileIo { .. })));
    }
}
