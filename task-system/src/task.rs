// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    any::Any,
    fmt::{self, Debug},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::panic::{self, AssertUnwindSafe};

use arrayvec::ArrayString;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// The maximum length of a task's name, in bytes.
pub const TASK_NAME_LEN: usize = 64;

/// Name of a task, shown in profilers and logs.
pub type TaskName = ArrayString<TASK_NAME_LEN>;

/// Callback called once after the last invocation of a task has finished.
pub type TaskFinishedCallback = Box<dyn FnMut(&Task) + Send + 'static>;

/// Creates a [`TaskName`], truncating `name` to [`TASK_NAME_LEN`] bytes.
pub fn task_name(name: &str) -> TaskName {
    let mut truncated = ArrayString::new();
    for c in name.chars() {
        if truncated.try_push(c).is_err() {
            break;
        }
    }
    truncated
}

/// Whether a task may block on other task groups while it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TaskNesting {
    /// The task never waits for other groups. Threads waiting for a group can
    /// run these tasks while they wait.
    #[default]
    Never,
    /// The task may call
    /// [`Scheduler::wait_for_group`](crate::Scheduler::wait_for_group). These
    /// are never picked up by waiting threads, so that a wait can't end up
    /// nested inside an unrelated wait.
    Maybe,
}

struct TaskSettings {
    name: TaskName,
    nesting: TaskNesting,
    multiplicity: u32,
    on_finished: Option<TaskFinishedCallback>,
}

/// A unit of work, run one or more times (its "multiplicity") when the
/// [`GroupHandle`](crate::GroupHandle) it's added to gets scheduled.
///
/// Tasks are shared with the scheduler via [`Arc`](std::sync::Arc), and can
/// be reused: once the task has finished, it can be reconfigured and added to
/// another group.
pub struct Task {
    settings: Mutex<TaskSettings>,
    body: Box<dyn Fn(u32) + Send + Sync + 'static>,
    /// How many invocations are left before the task is finished. Hammered by
    /// every thread running an invocation, so it's kept on its own cache line.
    remaining_runs: CachePadded<AtomicU32>,
    cancel_requested: AtomicBool,
    /// Set from being added to a group until the finished callback has been
    /// called.
    scheduled: AtomicBool,
}

impl Task {
    /// Creates a task which runs `body` once per scheduling.
    pub fn new(name: &str, body: impl Fn() + Send + Sync + 'static) -> Task {
        Task::new_parallel(name, 0, move |_| body())
    }

    /// Creates a task which runs `body` `multiplicity` times per scheduling,
    /// possibly in parallel, each invocation getting a distinct index in
    /// `0..multiplicity`. A multiplicity of 0 runs the task once, with the
    /// index 0.
    pub fn new_parallel(
        name: &str,
        multiplicity: u32,
        body: impl Fn(u32) + Send + Sync + 'static,
    ) -> Task {
        Task {
            settings: Mutex::new(TaskSettings {
                name: task_name(name),
                nesting: TaskNesting::default(),
                multiplicity,
                on_finished: None,
            }),
            body: Box::new(body),
            remaining_runs: CachePadded::new(AtomicU32::new(0)),
            cancel_requested: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Sets the name, nesting mode and finished-callback of the task.
    ///
    /// ### Panics
    ///
    /// If the task is scheduled and hasn't finished yet.
    #[track_caller]
    pub fn configure(
        &self,
        name: &str,
        nesting: TaskNesting,
        on_finished: Option<TaskFinishedCallback>,
    ) {
        assert!(
            self.is_finished(),
            "task should be finished before being reconfigured",
        );
        let mut settings = self.settings.lock();
        settings.name = task_name(name);
        settings.nesting = nesting;
        settings.on_finished = on_finished;
    }

    /// Sets how many times the task runs per scheduling. See
    /// [`Task::new_parallel`].
    ///
    /// ### Panics
    ///
    /// If the task is scheduled and hasn't finished yet.
    #[track_caller]
    pub fn set_multiplicity(&self, multiplicity: u32) {
        assert!(
            self.is_finished(),
            "task should be finished before its multiplicity is changed",
        );
        self.settings.lock().multiplicity = multiplicity;
    }

    pub fn name(&self) -> TaskName {
        self.settings.lock().name
    }

    pub fn nesting(&self) -> TaskNesting {
        self.settings.lock().nesting
    }

    pub fn multiplicity(&self) -> u32 {
        self.settings.lock().multiplicity
    }

    /// The amount of invocations one scheduling of this task consists of.
    pub fn invocation_count(&self) -> u32 {
        self.multiplicity().max(1)
    }

    /// Returns true if the task isn't scheduled in any group, or all of its
    /// invocations have run and its finished-callback has been called.
    pub fn is_finished(&self) -> bool {
        !self.scheduled.load(Ordering::Acquire)
            && self.remaining_runs.load(Ordering::Acquire) == 0
    }

    /// Requests the remaining invocations to be skipped. Invocations that
    /// are already running are not interrupted.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Prepares the task to be run by a group. Called when the task is added
    /// to a group.
    ///
    /// ### Panics
    ///
    /// If the task is already scheduled, including by a concurrent call.
    #[track_caller]
    pub(crate) fn reset(&self) {
        let claimed = self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
        assert!(
            claimed.is_ok(),
            "task should be finished before being added to a group",
        );
        let runs = self.invocation_count();
        self.cancel_requested.store(false, Ordering::Release);
        self.remaining_runs.store(runs, Ordering::Release);
    }

    /// Runs one invocation of the task. After a cancel, the body is skipped
    /// but the invocation is still counted, so the task only finishes once
    /// every queued invocation has been through here.
    ///
    /// Returns true if this call finished the last remaining invocation, in
    /// which case [`Task::finish`] should be called.
    pub(crate) fn run(&self, invocation: u32) -> bool {
        if self.remaining_runs.load(Ordering::Acquire) == 0 {
            return false;
        }

        if !self.is_cancel_requested() {
            profiling::scope!(self.name().as_str());
            (self.body)(invocation);
        }

        self.complete_invocation()
    }

    /// Counts one invocation as done without running it. Returns true if it
    /// was the last remaining one.
    pub(crate) fn complete_invocation(&self) -> bool {
        let previous = self
            .remaining_runs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |runs| {
                runs.checked_sub(1)
            });
        previous == Ok(1)
    }

    /// Calls the finished-callback and marks the task as finished. A
    /// panicking callback is logged and dropped.
    pub(crate) fn finish(&self) {
        let callback = self.settings.lock().on_finished.take();
        if let Some(mut callback) = callback {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
                Ok(()) => {
                    let mut settings = self.settings.lock();
                    // The callback may have reconfigured the task.
                    if settings.on_finished.is_none() {
                        settings.on_finished = Some(callback);
                    }
                }
                Err(payload) => tracing::error!(
                    task = %self.name(),
                    "finished-callback of task panicked: {}",
                    panic_message(&*payload),
                ),
            }
        }
        self.scheduled.store(false, Ordering::Release);
    }
}

/// Extracts the message out of a panic payload, for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("remaining_runs", &self.remaining_runs.load(Ordering::Relaxed))
            .field("cancel_requested", &self.is_cancel_requested())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::{task_name, Task, TaskNesting, TASK_NAME_LEN};

    #[test]
    fn multiplicity_runs_every_invocation_once() {
        let sum = Arc::new(AtomicU32::new(0));
        let sum_in_task = sum.clone();
        let task = Task::new_parallel("sum", 4, move |i| {
            sum_in_task.fetch_add(i + 1, Ordering::Relaxed);
        });

        task.reset();
        assert!(!task.is_finished());
        assert!(!task.run(0));
        assert!(!task.run(1));
        assert!(!task.run(2));
        assert!(task.run(3));
        assert_eq!(1 + 2 + 3 + 4, sum.load(Ordering::Relaxed));

        // Counter is at zero, further runs don't run the body.
        assert!(!task.run(0));
        assert_eq!(10, sum.load(Ordering::Relaxed));

        assert!(!task.is_finished());
        task.finish();
        assert!(task.is_finished());
    }

    #[test]
    fn zero_multiplicity_runs_once() {
        let task = Task::new("once", || {});
        assert_eq!(1, task.invocation_count());
        task.reset();
        assert!(task.run(0));
    }

    #[test]
    fn cancel_skips_remaining_invocations() {
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in_task = runs.clone();
        let task = Task::new_parallel("cancelled", 8, move |_| {
            runs_in_task.fetch_add(1, Ordering::Relaxed);
        });

        task.reset();
        assert!(!task.run(0));
        task.cancel();
        // Skipped invocations still count down one by one, so the task isn't
        // finished while the rest of them are queued.
        for invocation in 1..7 {
            assert!(!task.run(invocation));
            assert!(!task.is_finished());
        }
        assert!(task.run(7));
        assert!(!task.complete_invocation());
        assert_eq!(1, runs.load(Ordering::Relaxed));

        // Rescheduling clears the cancellation.
        task.finish();
        task.reset();
        assert!(!task.is_cancel_requested());
    }

    #[test]
    fn finished_callback_is_kept_for_reuse() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_callback = calls.clone();
        let task = Task::new("callback", || {});
        task.configure(
            "callback",
            TaskNesting::Never,
            Some(Box::new(move |task: &Task| {
                assert_eq!("callback", task.name().as_str());
                calls_in_callback.fetch_add(1, Ordering::Relaxed);
            })),
        );

        for _ in 0..3 {
            task.reset();
            assert!(task.run(0));
            task.finish();
        }
        assert_eq!(3, calls.load(Ordering::Relaxed));
    }

    #[test]
    #[should_panic(expected = "task should be finished")]
    fn configuring_a_scheduled_task_panics() {
        let task = Task::new("busy", || {});
        task.reset();
        task.set_multiplicity(3);
    }

    #[test]
    #[should_panic(expected = "task should be finished before being added to a group")]
    fn scheduling_a_scheduled_task_twice_panics() {
        let task = Task::new("twice", || {});
        task.reset();
        task.reset();
    }

    #[test]
    fn names_are_truncated() {
        let long_name = "x".repeat(TASK_NAME_LEN * 2);
        assert_eq!(TASK_NAME_LEN, task_name(&long_name).len());
    }
}
