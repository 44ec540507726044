// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, ThreadId},
};

use enum_map::EnumMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    task::panic_message,
    task_group::{GroupFinishedCallback, GroupState, TaskGroup},
    GroupHandle, Task, TaskNesting, TaskPriority, WorkerType,
};

use super::worker;

/// How often a worker or the main thread blocked in
/// [`Shared::wait_for_group`] checks the queues of its own worker type for
/// work it could help with.
const HELPER_POLL_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_SYSTEM_ID: AtomicU64 = AtomicU64::new(1);

/// One invocation of a task, waiting in a priority queue.
pub(crate) struct ReadyTask {
    pub task: Arc<Task>,
    pub invocation: u32,
    pub group: GroupHandle,
    pub nesting: TaskNesting,
}

/// What [`SchedulerState::enqueue_group_tasks`] did.
pub(crate) enum Scheduled {
    /// The group has no tasks, and is done already.
    Empty,
    Queued {
        worker_type: WorkerType,
        invocations: u32,
    },
}

/// The kind of thread calling [`Shared::wait_for_group`], which determines
/// what it is allowed to run while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Helper {
    Worker(WorkerType),
    MainThread,
    Other,
}

/// Everything guarded by the scheduler lock.
pub(crate) struct SchedulerState {
    pub queues: EnumMap<TaskPriority, VecDeque<ReadyTask>>,
    pub groups: Vec<TaskGroup>,
    pub free_groups: Vec<u32>,
    pub stop_requested: EnumMap<WorkerType, bool>,
    /// Worker threads currently running, per type.
    pub worker_counts: EnumMap<WorkerType, usize>,
}

impl SchedulerState {
    fn new() -> SchedulerState {
        SchedulerState {
            queues: EnumMap::default(),
            groups: Vec::new(),
            free_groups: Vec::new(),
            stop_requested: EnumMap::default(),
            worker_counts: EnumMap::default(),
        }
    }

    /// Returns the group if the handle isn't stale.
    pub fn group(&self, handle: GroupHandle) -> Option<&TaskGroup> {
        self.groups
            .get(handle.slot as usize)
            .filter(|group| group.matches(handle))
    }

    pub fn group_mut(&mut self, handle: GroupHandle) -> Option<&mut TaskGroup> {
        self.groups
            .get_mut(handle.slot as usize)
            .filter(|group| group.matches(handle))
    }

    pub fn group_state(&self, handle: GroupHandle) -> GroupState {
        self.group(handle)
            .map_or(GroupState::Finished, TaskGroup::state)
    }

    pub fn create_group(
        &mut self,
        priority: TaskPriority,
        on_finished: Option<GroupFinishedCallback>,
    ) -> GroupHandle {
        let slot = match self.free_groups.pop() {
            Some(slot) => slot,
            None => {
                self.groups.push(TaskGroup::new());
                (self.groups.len() - 1) as u32
            }
        };
        let group = &mut self.groups[slot as usize];
        group.reuse(priority, on_finished);
        GroupHandle {
            slot,
            generation: group.generation,
        }
    }

    pub fn allocated_groups(&self) -> usize {
        self.groups.len() - self.free_groups.len()
    }

    /// Returns true if `from` is `to`, or depends on it through any chain of
    /// unfinished groups.
    #[cfg(debug_assertions)]
    pub fn depends_transitively(&self, from: GroupHandle, to: GroupHandle) -> bool {
        let mut stack = vec![from];
        let mut visited = Vec::new();
        while let Some(handle) = stack.pop() {
            if handle == to {
                return true;
            }
            if visited.contains(&handle) {
                continue;
            }
            visited.push(handle);
            if let Some(group) = self.group(handle) {
                stack.extend_from_slice(&group.depends_on);
            }
        }
        false
    }

    /// Pushes every invocation of the group's tasks onto the queue of its
    /// priority. The group should be started and have no active
    /// dependencies.
    pub fn enqueue_group_tasks(&mut self, handle: GroupHandle) -> Scheduled {
        let Some(group) = self
            .groups
            .get_mut(handle.slot as usize)
            .filter(|group| group.matches(handle))
        else {
            return Scheduled::Empty;
        };
        debug_assert!(group.started_by_user && group.active_dependencies == 0);

        let queue = &mut self.queues[group.priority];
        let mut invocations = 0;
        for task in &group.tasks {
            let nesting = task.nesting();
            for invocation in 0..task.invocation_count() {
                queue.push_back(ReadyTask {
                    task: task.clone(),
                    invocation,
                    group: handle,
                    nesting,
                });
                invocations += 1;
            }
        }

        if invocations == 0 {
            return Scheduled::Empty;
        }
        group.remaining_invocations = invocations;
        // Threads already waiting for this group can start helping.
        group.signal.notify_all();
        Scheduled::Queued {
            worker_type: group.priority.worker_type(),
            invocations,
        }
    }

    /// Pops the next invocation from the given queue and marks it as running.
    pub fn pop_priority(&mut self, priority: TaskPriority) -> Option<ReadyTask> {
        let entry = self.queues[priority].pop_front()?;
        self.mark_executing(&entry);
        Some(entry)
    }

    /// Pops the highest priority invocation a worker of the given type can
    /// run.
    pub fn pop_ready(&mut self, worker_type: WorkerType) -> Option<ReadyTask> {
        worker_type
            .priorities()
            .find_map(|priority| self.pop_priority(priority))
    }

    /// Pops an invocation the thread waiting for `waited` can run while it
    /// waits: one of the waited group's own, for the main thread any main
    /// thread task, or for worker threads any non-nesting task of their
    /// worker type.
    pub fn pop_helpable(&mut self, waited: GroupHandle, helper: Helper) -> Option<ReadyTask> {
        let priority = self.group(waited)?.priority;
        let main_thread_only = priority.worker_type() == WorkerType::MainThread;
        if helper == Helper::MainThread || !main_thread_only {
            let queue = &mut self.queues[priority];
            if let Some(index) = queue.iter().position(|entry| entry.group == waited) {
                if let Some(entry) = queue.remove(index) {
                    self.mark_executing(&entry);
                    return Some(entry);
                }
            }
        }

        let worker_type = match helper {
            Helper::Worker(worker_type) => worker_type,
            // Nothing else can run these, so the main thread takes them
            // regardless of nesting.
            Helper::MainThread => {
                return WorkerType::MainThread
                    .priorities()
                    .find_map(|priority| self.pop_priority(priority));
            }
            Helper::Other => return None,
        };
        for priority in worker_type.priorities() {
            let queue = &mut self.queues[priority];
            if let Some(index) = queue
                .iter()
                .position(|entry| entry.nesting == TaskNesting::Never)
            {
                if let Some(entry) = queue.remove(index) {
                    self.mark_executing(&entry);
                    return Some(entry);
                }
            }
        }
        None
    }

    fn mark_executing(&mut self, entry: &ReadyTask) {
        if let Some(group) = self.group_mut(entry.group) {
            group.executing_invocations += 1;
        }
    }

    /// Moves the queued invocations of the future-frame priorities one frame
    /// closer to the current frame.
    pub fn promote_frame_tasks(&mut self) {
        // Ascending order, so that each invocation only moves one step.
        for priority in TaskPriority::ALL {
            let Some(promoted) = priority.promoted() else {
                continue;
            };
            let moved = core::mem::take(&mut self.queues[priority]);
            for entry in &moved {
                if let Some(group) = self.group_mut(entry.group) {
                    group.priority = promoted;
                }
            }
            self.queues[promoted].extend(moved);
        }
    }
}

/// State shared between the task system, its worker threads and every
/// [`Scheduler`](crate::Scheduler) handle.
pub(crate) struct Shared {
    pub state: Mutex<SchedulerState>,
    /// Workers of each type sleep on these when their queues are empty.
    pub wake_workers: EnumMap<WorkerType, Condvar>,
    /// Distinguishes this task system's worker threads from other instances'.
    pub system_id: u64,
    pub main_thread: ThreadId,
    pub target_frame_time_nanos: AtomicU64,
}

impl Shared {
    pub fn new(target_frame_time: Duration) -> Shared {
        Shared {
            state: Mutex::new(SchedulerState::new()),
            wake_workers: EnumMap::default(),
            system_id: NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed),
            main_thread: thread::current().id(),
            target_frame_time_nanos: AtomicU64::new(duration_as_nanos(target_frame_time)),
        }
    }

    pub fn target_frame_time(&self) -> Duration {
        Duration::from_nanos(self.target_frame_time_nanos.load(Ordering::Relaxed))
    }

    pub fn set_target_frame_time(&self, target_frame_time: Duration) {
        let nanos = duration_as_nanos(target_frame_time);
        self.target_frame_time_nanos.store(nanos, Ordering::Relaxed);
    }

    pub fn pop_priority(&self, priority: TaskPriority) -> Option<ReadyTask> {
        self.state.lock().pop_priority(priority)
    }

    /// Wakes up enough workers of the given type to run `invocations` tasks.
    pub fn wake(&self, worker_type: WorkerType, invocations: u32) {
        if invocations == 1 {
            self.wake_workers[worker_type].notify_one();
        } else {
            self.wake_workers[worker_type].notify_all();
        }
    }

    /// Starts running the group's invocations, or finishes it right away if
    /// it's empty.
    pub fn schedule_group(&self, mut state: MutexGuard<'_, SchedulerState>, handle: GroupHandle) {
        match state.enqueue_group_tasks(handle) {
            Scheduled::Empty => self.finish_group(state, handle),
            Scheduled::Queued {
                worker_type,
                invocations,
            } => {
                drop(state);
                self.wake(worker_type, invocations);
            }
        }
    }

    /// Runs one invocation on the calling thread, and does the bookkeeping
    /// after it. Must be called without holding the scheduler lock.
    pub fn execute(&self, entry: ReadyTask) {
        let ReadyTask {
            task,
            invocation,
            group,
            ..
        } = entry;

        let last_invocation = match panic::catch_unwind(AssertUnwindSafe(|| task.run(invocation)))
        {
            Ok(last_invocation) => last_invocation,
            Err(payload) => {
                tracing::error!(
                    task = %task.name(),
                    invocation,
                    "task panicked: {}",
                    panic_message(&*payload),
                );
                task.complete_invocation()
            }
        };
        if last_invocation {
            task.finish();
        }
        drop(task);

        let mut state = self.state.lock();
        let Some(group_state) = state.group_mut(group) else {
            debug_assert!(false, "group of a running invocation should not be finished");
            return;
        };
        group_state.executing_invocations -= 1;
        group_state.remaining_invocations -= 1;
        if group_state.remaining_invocations == 0 {
            self.finish_group(state, group);
        }
    }

    /// Finishes the group, and any dependents of it that finish right away
    /// because they're empty. Calls the group callbacks, schedules the
    /// dependents whose last dependency this was, frees the slots and wakes
    /// up the waiting threads.
    pub fn finish_group(&self, mut state: MutexGuard<'_, SchedulerState>, handle: GroupHandle) {
        let mut finishing = vec![handle];
        let mut released_tasks = Vec::new();
        let mut woken_worker_types: EnumMap<WorkerType, bool> = EnumMap::default();

        while let Some(handle) = finishing.pop() {
            let callback = state
                .group_mut(handle)
                .and_then(|group| group.on_finished.take());
            if let Some(callback) = callback {
                MutexGuard::unlocked(&mut state, || run_group_callback(callback, handle));
            }

            let Some(group) = state.group_mut(handle) else {
                continue;
            };
            let dependents = core::mem::take(&mut group.others_depending_on_me);
            let signal = group.signal.clone();
            released_tasks.extend(group.release());
            state.free_groups.push(handle.slot);

            for dependent in dependents {
                let Some(dependent_group) = state.group_mut(dependent) else {
                    continue;
                };
                dependent_group.active_dependencies -= 1;
                if dependent_group.active_dependencies > 0 || !dependent_group.started_by_user {
                    continue;
                }
                match state.enqueue_group_tasks(dependent) {
                    Scheduled::Empty => finishing.push(dependent),
                    Scheduled::Queued { worker_type, .. } => {
                        woken_worker_types[worker_type] = true;
                    }
                }
            }

            signal.notify_all();
        }
        drop(state);

        for (worker_type, woken) in woken_worker_types {
            if woken {
                self.wake_workers[worker_type].notify_all();
            }
        }
        drop(released_tasks);
    }

    /// Identifies the calling thread for [`Shared::wait_for_group`].
    pub fn current_helper(&self) -> Helper {
        match worker::current_worker() {
            Some(worker) if worker.system_id == self.system_id => {
                Helper::Worker(worker.worker_type)
            }
            _ if thread::current().id() == self.main_thread => Helper::MainThread,
            _ => Helper::Other,
        }
    }

    /// Blocks until the group has finished, running its invocations (and for
    /// worker threads and the main thread, other tasks of their type) in the
    /// meantime.
    pub fn wait_for_group(&self, handle: GroupHandle) {
        let helper = self.current_helper();
        let mut state = self.state.lock();
        loop {
            let Some(group) = state.group(handle) else {
                return;
            };
            let signal = group.signal.clone();

            if let Some(entry) = state.pop_helpable(handle, helper) {
                MutexGuard::unlocked(&mut state, || self.execute(entry));
                continue;
            }

            // Work the helper could run may get queued without signalling
            // this group, so helpers poll.
            match helper {
                Helper::Worker(_) | Helper::MainThread => {
                    signal.wait_for(&mut state, HELPER_POLL_INTERVAL);
                }
                Helper::Other => signal.wait(&mut state),
            }
        }
    }
}

fn run_group_callback(callback: GroupFinishedCallback, handle: GroupHandle) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(handle))) {
        tracing::error!(
            ?handle,
            "finished-callback of task group panicked: {}",
            panic_message(&*payload),
        );
    }
}

fn duration_as_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{GroupHandle, Task, TaskNesting, TaskPriority, WorkerType};

    use super::{Helper, Scheduled, SchedulerState};

    fn started_group(
        state: &mut SchedulerState,
        priority: TaskPriority,
        tasks: &[Arc<Task>],
    ) -> GroupHandle {
        let handle = state.create_group(priority, None);
        let group = state.group_mut(handle).unwrap();
        for task in tasks {
            task.reset();
            group.tasks.push(task.clone());
        }
        group.started_by_user = true;
        handle
    }

    #[test]
    fn slots_are_reused_with_new_generations() {
        let mut state = SchedulerState::new();
        let first = state.create_group(TaskPriority::ThisFrame, None);
        assert_eq!(1, state.allocated_groups());

        let tasks = state.group_mut(first).unwrap().release();
        assert!(tasks.is_empty());
        state.free_groups.push(first.slot);
        assert!(state.group(first).is_none());

        let second = state.create_group(TaskPriority::ThisFrame, None);
        assert_eq!(first.slot, second.slot);
        assert_ne!(first.generation, second.generation);
        assert!(state.group(first).is_none());
        assert!(state.group(second).is_some());
    }

    #[test]
    fn invocations_are_queued_per_multiplicity() {
        let mut state = SchedulerState::new();
        let task = Arc::new(Task::new_parallel("parallel", 3, |_| {}));
        let handle = started_group(&mut state, TaskPriority::LongRunning, &[task]);

        assert!(matches!(
            state.enqueue_group_tasks(handle),
            Scheduled::Queued {
                worker_type: WorkerType::LongTasks,
                invocations: 3,
            }
        ));
        assert_eq!(3, state.queues[TaskPriority::LongRunning].len());
        assert!(state.pop_ready(WorkerType::ShortTasks).is_none());
        let entry = state.pop_ready(WorkerType::LongTasks).unwrap();
        assert_eq!(0, entry.invocation);
        assert_eq!(1, state.group(handle).unwrap().executing_invocations);
    }

    #[test]
    fn workers_pop_higher_priorities_first() {
        let mut state = SchedulerState::new();
        let late = started_group(
            &mut state,
            TaskPriority::LateThisFrame,
            &[Arc::new(Task::new("late", || {}))],
        );
        let early = started_group(
            &mut state,
            TaskPriority::EarlyThisFrame,
            &[Arc::new(Task::new("early", || {}))],
        );
        state.enqueue_group_tasks(late);
        state.enqueue_group_tasks(early);

        assert_eq!(early, state.pop_ready(WorkerType::ShortTasks).unwrap().group);
        assert_eq!(late, state.pop_ready(WorkerType::ShortTasks).unwrap().group);
    }

    #[test]
    fn helpers_only_take_allowed_work() {
        let mut state = SchedulerState::new();
        let nesting = Arc::new(Task::new("nesting", || {}));
        nesting.configure("nesting", TaskNesting::Maybe, None);
        let other = started_group(&mut state, TaskPriority::ThisFrame, &[nesting]);
        let main = started_group(
            &mut state,
            TaskPriority::ThisFrameMainThread,
            &[Arc::new(Task::new("main", || {}))],
        );
        state.enqueue_group_tasks(other);
        state.enqueue_group_tasks(main);

        // Only the main thread can run main thread tasks, and workers never
        // pick up nesting tasks of other groups.
        assert!(state.pop_helpable(main, Helper::Other).is_none());
        assert!(state
            .pop_helpable(main, Helper::Worker(WorkerType::ShortTasks))
            .is_none());

        // The waited group's own tasks are fine regardless of nesting.
        assert_eq!(other, state.pop_helpable(other, Helper::Other).unwrap().group);

        // The main thread runs main thread tasks while waiting for anything.
        assert_eq!(main, state.pop_helpable(other, Helper::MainThread).unwrap().group);
    }

    #[test]
    fn promotion_moves_invocations_one_frame_closer() {
        let mut state = SchedulerState::new();
        let next = started_group(
            &mut state,
            TaskPriority::NextFrame,
            &[Arc::new(Task::new("next", || {}))],
        );
        let in_two = started_group(
            &mut state,
            TaskPriority::In2Frames,
            &[Arc::new(Task::new("in two", || {}))],
        );
        state.enqueue_group_tasks(next);
        state.enqueue_group_tasks(in_two);

        state.promote_frame_tasks();
        assert_eq!(1, state.queues[TaskPriority::ThisFrame].len());
        assert_eq!(1, state.queues[TaskPriority::NextFrame].len());
        assert!(state.queues[TaskPriority::In2Frames].is_empty());
        assert_eq!(TaskPriority::ThisFrame, state.group(next).unwrap().priority);

        state.promote_frame_tasks();
        assert_eq!(2, state.queues[TaskPriority::ThisFrame].len());
    }

    #[test]
    #[cfg(debug_assertions)]
    fn transitive_dependencies_are_found() {
        let mut state = SchedulerState::new();
        let a = state.create_group(TaskPriority::ThisFrame, None);
        let b = state.create_group(TaskPriority::ThisFrame, None);
        let c = state.create_group(TaskPriority::ThisFrame, None);
        state.group_mut(b).unwrap().depends_on.push(a);
        state.group_mut(c).unwrap().depends_on.push(b);
        assert!(state.depends_transitively(c, a));
        assert!(!state.depends_transitively(a, c));
    }
}
