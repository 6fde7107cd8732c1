//! Task lists and their sweeps
//!
//! A process keeps its tasks in one arena and four lists of arena
//! indices, one per category. Preemptible and background lists are kept
//! in descending priority (ties in insertion order); the other two in
//! insertion order.
//!
//! Author: Moroya Sakamoto

use crate::error::SchedError;
use crate::task::{Dispatch, Task, TaskKind, TaskStatus};

/// Which list a task lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListCategory {
    TimerInterrupt,
    Preemptible,
    /// SampleTime and Event tasks
    Background,
    Continuous,
}

impl ListCategory {
    /// Sweep order within a pass
    pub const ALL: [ListCategory; 4] = [
        ListCategory::TimerInterrupt,
        ListCategory::Preemptible,
        ListCategory::Background,
        ListCategory::Continuous,
    ];

    /// List for a task kind (None for the reserved kind)
    pub fn of(kind: TaskKind) -> Option<Self> {
        match kind {
            TaskKind::TimerInterrupt => Some(ListCategory::TimerInterrupt),
            TaskKind::Preemptible => Some(ListCategory::Preemptible),
            TaskKind::SampleTime | TaskKind::Event => Some(ListCategory::Background),
            TaskKind::Continuous => Some(ListCategory::Continuous),
            TaskKind::Hardware => None,
        }
    }

    pub fn is_priority_ordered(self) -> bool {
        matches!(self, ListCategory::Preemptible | ListCategory::Background)
    }
}

/// Ordered indices into a process's task arena
#[derive(Debug, Clone)]
pub struct TaskList {
    category: ListCategory,
    members: Vec<usize>,
    /// Round-robin position for `run_next`
    cursor: usize,
}

impl TaskList {
    pub fn new(category: ListCategory) -> Self {
        Self {
            category,
            members: Vec::new(),
            cursor: 0,
        }
    }

    pub fn category(&self) -> ListCategory {
        self.category
    }

    /// Arena indices in sweep order
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Insert `index`; priority lists place it behind every task of equal
    /// or higher priority.
    pub(crate) fn insert(&mut self, index: usize, tasks: &[Task]) {
        if !self.category.is_priority_ordered() {
            self.members.push(index);
            return;
        }
        let key = |i: usize| tasks[i].priority().unwrap_or(0);
        let priority = key(index);
        let at = self
            .members
            .iter()
            .position(|&m| key(m) < priority)
            .unwrap_or(self.members.len());
        self.members.insert(at, index);
    }

    /// Ask every task once, in list order
    pub(crate) fn run_all(
        &self,
        tasks: &mut [Task],
        env: &mut Dispatch<'_>,
    ) -> Result<(), SchedError> {
        for &i in &self.members {
            env.visit();
            tasks[i].schedule(env)?;
        }
        Ok(())
    }

    /// Run each timer task until it idles.
    ///
    /// A task still running when asked again, or still busy at its own
    /// next due time, has interrupted itself.
    pub(crate) fn run_timer_interrupts(
        &self,
        tasks: &mut [Task],
        env: &mut Dispatch<'_>,
    ) -> Result<(), SchedError> {
        for &i in &self.members {
            loop {
                env.visit();
                let task = &mut tasks[i];
                match task.schedule(env)? {
                    TaskStatus::Running => {
                        return Err(SchedError::InterruptedItself {
                            task: task.name().to_owned(),
                        })
                    }
                    TaskStatus::Ready | TaskStatus::Pending => {
                        let now = env.clock().now()?;
                        if now.ticks() >= task.next_due().ticks() {
                            return Err(SchedError::InterruptedItself {
                                task: task.name().to_owned(),
                            });
                        }
                    }
                    _ => break,
                }
            }
        }
        Ok(())
    }

    /// Priority sweep that stops at the first Running or Preempted task
    pub(crate) fn run_preemptive(
        &self,
        tasks: &mut [Task],
        env: &mut Dispatch<'_>,
    ) -> Result<(), SchedError> {
        for &i in &self.members {
            env.visit();
            if matches!(
                tasks[i].schedule(env)?,
                TaskStatus::Running | TaskStatus::Preempted
            ) {
                break;
            }
        }
        Ok(())
    }

    /// Run the highest-priority task that is ready; true if one ran
    pub(crate) fn run_highest_ready(
        &self,
        tasks: &mut [Task],
        env: &mut Dispatch<'_>,
    ) -> Result<bool, SchedError> {
        for &i in &self.members {
            env.visit();
            let before = tasks[i].runs();
            let status = tasks[i].schedule(env)?;
            if tasks[i].runs() != before {
                return Ok(true);
            }
            if matches!(status, TaskStatus::Running | TaskStatus::Preempted) {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Give the next task in rotation one chance; true if it ran
    pub(crate) fn run_next(
        &mut self,
        tasks: &mut [Task],
        env: &mut Dispatch<'_>,
    ) -> Result<bool, SchedError> {
        if self.members.is_empty() {
            return Ok(false);
        }
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
        let i = self.members[self.cursor];
        self.cursor = (self.cursor + 1) % self.members.len();

        env.visit();
        let before = tasks[i].runs();
        tasks[i].schedule(env)?;
        Ok(tasks[i].runs() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::InterruptGuard;
    use crate::task::Context;
    use crate::timer::{Duration, TimeSource};
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn logged(task: Task, log: &Log) -> Task {
        let log = log.clone();
        task.with_run(move |cx: &mut Context<'_>| log.borrow_mut().push(cx.task_name().to_owned()))
            .unwrap()
    }

    fn build(category: ListCategory, tasks: &[Task]) -> TaskList {
        let mut list = TaskList::new(category);
        for i in 0..tasks.len() {
            list.insert(i, tasks);
        }
        list
    }

    fn clock() -> TimeSource {
        let mut clock = TimeSource::simulated();
        clock.setup(Duration::micros(1)).unwrap();
        clock.start();
        clock
    }

    #[test]
    fn test_category_of_kind() {
        assert_eq!(ListCategory::of(TaskKind::Event), Some(ListCategory::Background));
        assert_eq!(ListCategory::of(TaskKind::SampleTime), Some(ListCategory::Background));
        assert_eq!(ListCategory::of(TaskKind::Hardware), None);
        assert!(!ListCategory::TimerInterrupt.is_priority_ordered());
    }

    #[test]
    fn test_preemptive_visits_by_priority() {
        let log = Log::default();
        let mut tasks: Vec<Task> = [3, 1, 2]
            .iter()
            .map(|&p| {
                let task = Task::preemptible(format!("P{p}"), p, Duration::millis(1)).unwrap();
                logged(task, &log)
            })
            .collect();
        let list = build(ListCategory::Preemptible, &tasks);
        assert_eq!(list.members(), &[0, 2, 1]);

        let guard = InterruptGuard::default();
        let mut clock = clock();
        clock.advance(Duration::millis(1));
        list.run_preemptive(&mut tasks, &mut Dispatch::new(&mut clock, &guard))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["P3", "P2", "P1"]);
    }

    #[test]
    fn test_preemptive_stops_at_running() {
        let log = Log::default();
        let mut tasks = vec![
            logged(Task::preemptible("High", 9, Duration::millis(1)).unwrap(), &log),
            logged(Task::preemptible("Mid", 5, Duration::millis(1)).unwrap(), &log),
            logged(Task::preemptible("Low", 1, Duration::millis(1)).unwrap(), &log),
        ];
        tasks[1].force_status(TaskStatus::Preempted);
        let list = build(ListCategory::Preemptible, &tasks);

        let guard = InterruptGuard::default();
        let mut clock = clock();
        clock.advance(Duration::millis(1));
        list.run_preemptive(&mut tasks, &mut Dispatch::new(&mut clock, &guard))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["High"]);
        assert_eq!(tasks[2].runs(), 0);
    }

    #[test]
    fn test_equal_priority_keeps_insertion_order() {
        let tasks: Vec<Task> = ["A", "B", "C"]
            .iter()
            .map(|n| Task::event(*n, 4).unwrap())
            .collect();
        let list = build(ListCategory::Background, &tasks);
        assert_eq!(list.members(), &[0, 1, 2]);
    }

    #[test]
    fn test_round_robin_rotation() {
        let log = Log::default();
        let mut tasks: Vec<Task> = ["A", "B", "C"]
            .iter()
            .map(|n| logged(Task::event(*n, 1).unwrap(), &log))
            .collect();
        let mut list = build(ListCategory::Background, &tasks);

        let guard = InterruptGuard::default();
        let mut clock = clock();
        let mut env = Dispatch::new(&mut clock, &guard);
        for _ in 0..6 {
            for t in tasks.iter() {
                // always ready
                let _ = t.trigger_event();
            }
            assert!(list.run_next(&mut tasks, &mut env).unwrap());
        }
        assert_eq!(*log.borrow(), vec!["A", "B", "C", "A", "B", "C"]);
        assert_eq!(env.visits(), 6);
    }

    #[test]
    fn test_run_next_reports_idle() {
        let mut tasks = vec![Task::event("Quiet", 1)
            .unwrap()
            .with_run(|_: &mut Context<'_>| {})
            .unwrap()];
        let mut list = build(ListCategory::Background, &tasks);
        let guard = InterruptGuard::default();
        let mut clock = clock();
        let mut env = Dispatch::new(&mut clock, &guard);
        assert!(!list.run_next(&mut tasks, &mut env).unwrap());
        assert!(!TaskList::new(ListCategory::Continuous)
            .run_next(&mut tasks, &mut env)
            .unwrap());
    }

    #[test]
    fn test_highest_ready_runs_one() {
        let log = Log::default();
        let mut tasks = vec![
            logged(Task::preemptible("Later", 9, Duration::millis(5)).unwrap(), &log),
            logged(Task::preemptible("Now", 5, Duration::millis(1)).unwrap(), &log),
            logged(Task::preemptible("AlsoNow", 1, Duration::millis(1)).unwrap(), &log),
        ];
        let list = build(ListCategory::Preemptible, &tasks);
        let guard = InterruptGuard::default();
        let mut clock = clock();
        clock.advance(Duration::millis(1));
        let ran = list
            .run_highest_ready(&mut tasks, &mut Dispatch::new(&mut clock, &guard))
            .unwrap();
        assert!(ran);
        assert_eq!(*log.borrow(), vec!["Now"]);
    }

    #[test]
    fn test_timer_task_runs_until_idle() {
        let guard = InterruptGuard::default();
        let passes = Rc::new(RefCell::new(0));
        let seen = passes.clone();
        let mut tasks = vec![Task::timer_interrupt("Tick", Duration::millis(1))
            .unwrap()
            .with_run(move |cx: &mut Context<'_>| {
                *seen.borrow_mut() += 1;
                if *seen.borrow() == 3 {
                    cx.idle();
                }
            })
            .unwrap()];
        let list = build(ListCategory::TimerInterrupt, &tasks);
        let mut clock = clock();
        clock.advance(Duration::millis(1));
        list.run_timer_interrupts(&mut tasks, &mut Dispatch::new(&mut clock, &guard))
            .unwrap();
        assert_eq!(*passes.borrow(), 3);
        assert_eq!(tasks[0].status(), TaskStatus::Idle);
    }

    #[test]
    fn test_timer_task_interrupting_itself() {
        let guard = InterruptGuard::default();
        let mut tasks = vec![Task::timer_interrupt("Slow", Duration::micros(50))
            .unwrap()
            .with_run(|_: &mut Context<'_>| {})
            .unwrap()];
        let list = build(ListCategory::TimerInterrupt, &tasks);
        let mut clock = clock();
        clock.advance(Duration::micros(50));
        let err = list
            .run_timer_interrupts(&mut tasks, &mut Dispatch::new(&mut clock, &guard))
            .unwrap_err();
        assert!(matches!(err, SchedError::InterruptedItself { .. }));

        let mut running = vec![Task::timer_interrupt("Stuck", Duration::micros(50))
            .unwrap()
            .with_run(|_: &mut Context<'_>| {})
            .unwrap()];
        running[0].force_status(TaskStatus::Running);
        let list = build(ListCategory::TimerInterrupt, &running);
        assert!(matches!(
            list.run_timer_interrupts(&mut running, &mut Dispatch::new(&mut clock, &guard)),
            Err(SchedError::InterruptedItself { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_priority_order(priorities in proptest::collection::vec(-20i32..20, 1..24)) {
            let tasks: Vec<Task> = priorities
                .iter()
                .enumerate()
                .map(|(n, &p)| Task::sample_time(format!("T{n}"), p, Duration::millis(1)).unwrap())
                .collect();
            let list = build(ListCategory::Background, &tasks);
            prop_assert_eq!(list.len(), tasks.len());
            for pair in list.members().windows(2) {
                let (a, b) = (pair[0], pair[1]);
                let (pa, pb) = (tasks[a].priority(), tasks[b].priority());
                prop_assert!(pa > pb || (pa == pb && a < b));
            }
        }
    }
}
