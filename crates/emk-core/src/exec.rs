//! The rule queue: dual-queue scheduling with one special worker
//!
//! Ready rules are distributed over N worker threads. Exactly one worker is
//! *special*: it is the only worker allowed to run cwd-unsafe rules, since
//! such a rule owns the process working directory while it runs. The
//! special queue holds cwd-unsafe rules (plus spill-over when the special
//! worker would otherwise sit idle); the normal queue holds cwd-safe rules.
//! The special worker prefers its own queue and may steal from the head of
//! the normal queue; normal workers never touch the special queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::BuildError;
use crate::graph::RuleId;

/// A unit of work handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Execute a rule.
    Run(RuleId),
    /// Shut down the worker.
    Stop,
}

#[derive(Debug, Default)]
struct QueueState {
    special: VecDeque<Task>,
    normal: VecDeque<Task>,
    tasks: usize,
    errors: Vec<BuildError>,
    special_idle: bool,
}

/// The shared work queue for one build phase.
#[derive(Debug)]
pub struct RuleQueue {
    threads: usize,
    state: Mutex<QueueState>,
    normal_cond: Condvar,
    special_cond: Condvar,
    join_cond: Condvar,
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RuleQueue {
    /// Create a queue for a pool of `threads` workers.
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            state: Mutex::new(QueueState::default()),
            normal_cond: Condvar::new(),
            special_cond: Condvar::new(),
            join_cond: Condvar::new(),
        }
    }

    /// Enqueue a ready rule. Dropped silently once the queue is errored.
    ///
    /// A cwd-unsafe rule always goes to the special queue. A cwd-safe rule
    /// spills to the special queue only when that queue is empty and the
    /// special worker is idle (or the pool has a single worker).
    pub fn put(&self, rule: RuleId, cwd_safe: bool) {
        let mut st = lock(&self.state);
        if !st.errors.is_empty() {
            return;
        }
        st.tasks += 1;
        let spill = st.special.is_empty() && st.special_idle;
        if !cwd_safe || self.threads == 1 || spill {
            st.special.push_back(Task::Run(rule));
            self.special_cond.notify_one();
        } else {
            st.normal.push_back(Task::Run(rule));
            self.normal_cond.notify_one();
        }
    }

    /// Take the next task for a worker. Blocks until work (or stop) arrives.
    pub fn get(&self, special: bool) -> Task {
        let mut st = lock(&self.state);
        if !st.errors.is_empty() {
            return Task::Stop;
        }
        if special {
            loop {
                if let Some(task) = st.special.pop_front() {
                    return task;
                }
                // Steal from the head of the normal queue, but never a stop
                // token destined for a normal worker.
                if matches!(st.normal.front(), Some(Task::Run(_))) {
                    if let Some(task) = st.normal.pop_front() {
                        return task;
                    }
                }
                st.special_idle = true;
                st = self
                    .special_cond
                    .wait(st)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                st.special_idle = false;
            }
        } else {
            loop {
                if let Some(task) = st.normal.pop_front() {
                    return task;
                }
                st = self
                    .normal_cond
                    .wait(st)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }
    }

    /// Mark one task finished; wakes the coordinator when none remain.
    pub fn done_task(&self) {
        let mut st = lock(&self.state);
        if !st.errors.is_empty() {
            return;
        }
        st.tasks -= 1;
        if st.tasks == 0 {
            self.join_cond.notify_all();
        }
    }

    /// Wait until all tasks have drained or an error was recorded.
    pub fn join(&self) {
        let mut st = lock(&self.state);
        while st.tasks > 0 && st.errors.is_empty() {
            st = self
                .join_cond
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Push stop tokens for every worker.
    pub fn stop(&self) {
        let mut st = lock(&self.state);
        st.special.push_back(Task::Stop);
        self.special_cond.notify_all();
        for _ in 1..self.threads {
            st.normal.push_back(Task::Stop);
        }
        self.normal_cond.notify_all();
    }

    /// Record a build error; the queue enters its errored state and the
    /// coordinator is woken.
    pub fn error(&self, err: BuildError) {
        let mut st = lock(&self.state);
        st.errors.push(err);
        self.join_cond.notify_all();
    }

    /// Whether any error has been recorded.
    pub fn errored(&self) -> bool {
        !lock(&self.state).errors.is_empty()
    }

    /// Drain the recorded errors, in arrival order.
    pub fn take_errors(&self) -> Vec<BuildError> {
        std::mem::take(&mut lock(&self.state).errors)
    }
}
