//! Transition trace log
//!
//! Fixed-capacity circular log of state changes. Reading never consumes
//! records, so a dump can be produced any number of times.
//!
//! Author: Moroya Sakamoto

use core::fmt::{self, Write};

use heapless::HistoryBuffer;

use crate::config::TRACE_CAPACITY;
use crate::process::Process;
use crate::state::StateId;
use crate::timer::{as_secs, Instant};

/// What changed in one trace record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// State-based task moved between states
    States { from: StateId, to: StateId },
    /// Runner-based task changed its numeric state
    Numeric { from: i64, to: i64 },
}

/// One transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceRecord {
    pub at: Instant,
    /// Index of the owning process
    pub process: usize,
    /// Serial number of the task within its process
    pub task: usize,
    pub change: Change,
}

/// Circular transition log
pub struct TraceLog {
    records: Box<HistoryBuffer<TraceRecord, TRACE_CAPACITY>>,
    total: u64,
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceLog {
    pub fn new() -> Self {
        Self {
            records: Box::new(HistoryBuffer::new()),
            total: 0,
        }
    }

    /// Append a record, overwriting the oldest when full
    pub fn record(&mut self, record: TraceRecord) {
        self.records.write(record);
        self.total += 1;
    }

    /// Records currently held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.len() == 0
    }

    /// Records ever written, including overwritten ones
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &TraceRecord> + '_ {
        self.records.oldest_ordered()
    }

    pub fn clear(&mut self) {
        *self.records = HistoryBuffer::new();
        self.total = 0;
    }
}

const HEADER: &str = "State Transition Logic Trace File \n\n";

/// Render the log with process, task and state names
pub fn write_trace<W: Write>(log: &TraceLog, processes: &[Process], w: &mut W) -> fmt::Result {
    w.write_str(HEADER)?;
    w.write_str("Time       Process           Task              From              To \n\n")?;
    for r in log.iter() {
        let process = processes.get(r.process);
        let task = process.and_then(|p| p.task_by_serial(r.task));
        let process_name = process.map_or("?", |p| p.name());
        let task_name = task.map_or("?", |t| t.name());
        match r.change {
            Change::States { from, to } => {
                let state_name =
                    |id: StateId| task.and_then(|t| t.state(id)).map_or("?", |s| s.name());
                writeln!(
                    w,
                    "{:<10.4} {:<17} {:<17} {:<17} {:<17}",
                    as_secs(r.at),
                    process_name,
                    task_name,
                    state_name(from),
                    state_name(to)
                )?;
            }
            Change::Numeric { from, to } => writeln!(
                w,
                "{:<10.4} {:<17} {:<17} {:<17} {:<17}",
                as_secs(r.at),
                process_name,
                task_name,
                from,
                to
            )?,
        }
    }
    Ok(())
}

/// Render the log with serial numbers only
pub fn write_trace_numbers<W: Write>(log: &TraceLog, w: &mut W) -> fmt::Result {
    w.write_str(HEADER)?;
    w.write_str("Time       Process  Task     From     To\n\n")?;
    for r in log.iter() {
        let (from, to) = match r.change {
            Change::States { from, to } => (from.serial() as i64, to.serial() as i64),
            Change::Numeric { from, to } => (from, to),
        };
        writeln!(
            w,
            "{:<10.4} {:<8} {:<8} {:<8} {:<8}",
            as_secs(r.at),
            r.process,
            r.task,
            from,
            to
        )?;
    }
    Ok(())
}
