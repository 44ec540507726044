// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The task system itself: worker threads, priority queues and task group
//! scheduling.
//!
//! [`TaskSystem`] owns the worker threads and is driven by the main thread
//! once per frame via [`TaskSystem::finish_frame_tasks`]. The scheduling API
//! lives in [`Scheduler`], which the task system dereferences to, and which
//! can be cloned into tasks to schedule more work from within them.

mod state;
mod worker;


use core::{ops::Deref, time::Duration};
use std::sync::Arc;

use enum_map::EnumMap;
use platform::{Instant, Platform, WorkerEntry, WorkerThreadDesc, WorkerThreadHandle};

use crate::{
    task_group::{GroupFinishedCallback, GroupState, TaskGroup},
    GroupHandle, Task, TaskPriority, TaskSystemConfig, TaskSystemError, WorkerType,
};

use state::{SchedulerState, Shared};

/// Cloneable handle for creating, starting and waiting for task groups.
///
/// Group functions given a stale [`GroupHandle`] treat the group as already
/// finished. Modifying a group that has already been started, or through a
/// stale handle, is a bug: it panics in debug builds, and is ignored with a
/// warning in release builds.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a new group, to which tasks and dependencies can be added
    /// until it's started with [`Scheduler::start_group`].
    ///
    /// `on_finished` is called after every task of the group has finished,
    /// before any groups depending on this one are scheduled.
    pub fn create_group(
        &self,
        priority: TaskPriority,
        on_finished: Option<GroupFinishedCallback>,
    ) -> GroupHandle {
        self.shared.state.lock().create_group(priority, on_finished)
    }

    /// Adds a task to an unstarted group.
    ///
    /// ### Panics
    ///
    /// If the task hasn't finished running from a previous scheduling.
    #[track_caller]
    pub fn add_task(&self, group: GroupHandle, task: Arc<Task>) {
        let mut state = self.shared.state.lock();
        let Some(group) = configurable_group(&mut state, group, "add a task to") else {
            return;
        };
        task.reset();
        group.tasks.push(task);
    }

    /// Makes `group` wait for `depends_on` to finish before any of its tasks
    /// are run. If `depends_on` has already finished, this does nothing.
    ///
    /// ### Panics
    ///
    /// In debug builds, if the dependency would create a cycle.
    pub fn add_dependency(&self, group: GroupHandle, depends_on: GroupHandle) {
        let mut state = self.shared.state.lock();
        if configurable_group(&mut state, group, "add a dependency to").is_none() {
            return;
        }
        if state.group(depends_on).is_none() {
            return;
        }

        #[cfg(debug_assertions)]
        if state.depends_transitively(depends_on, group) {
            drop(state);
            panic!("task group dependencies should not form a cycle");
        }

        if let Some(dependency) = state.group_mut(depends_on) {
            dependency.others_depending_on_me.push(group);
        }
        if let Some(group) = state.group_mut(group) {
            group.depends_on.push(depends_on);
            group.active_dependencies += 1;
        }
    }

    /// Makes `group` depend on every group in `depends_on`.
    pub fn add_dependencies(&self, group: GroupHandle, depends_on: &[GroupHandle]) {
        for &dependency in depends_on {
            self.add_dependency(group, dependency);
        }
    }

    /// Lets the group run as soon as its dependencies have finished. An empty
    /// group with no unfinished dependencies finishes immediately.
    pub fn start_group(&self, group: GroupHandle) {
        let mut state = self.shared.state.lock();
        let Some(group_state) = configurable_group(&mut state, group, "start") else {
            return;
        };
        group_state.started_by_user = true;
        if group_state.active_dependencies == 0 {
            self.shared.schedule_group(state, group);
        }
    }

    pub fn start_groups(&self, groups: &[GroupHandle]) {
        for &group in groups {
            self.start_group(group);
        }
    }

    /// Creates and starts a group consisting of just the given task,
    /// optionally depending on another group.
    pub fn start_single_task(
        &self,
        task: Arc<Task>,
        priority: TaskPriority,
        depends_on: Option<GroupHandle>,
    ) -> GroupHandle {
        let group = self.create_group(priority, None);
        self.add_task(group, task);
        if let Some(depends_on) = depends_on {
            self.add_dependency(group, depends_on);
        }
        self.start_group(group);
        group
    }

    /// Blocks until the group has finished. Returns immediately for stale
    /// handles.
    ///
    /// The calling thread runs the group's queued invocations while waiting.
    /// Worker threads (i.e. tasks with [`TaskNesting::Maybe`]) also run other
    /// tasks of their worker type which don't nest.
    ///
    /// Only the main thread runs main thread tasks, so other threads waiting
    /// for a main thread group block until the main thread processes it. The
    /// main thread runs any queued main thread task while it waits.
    ///
    /// [`TaskNesting::Maybe`]: crate::TaskNesting::Maybe
    pub fn wait_for_group(&self, group: GroupHandle) {
        profiling::scope!("wait_for_group");
        self.shared.wait_for_group(group);
    }

    pub fn is_group_finished(&self, group: GroupHandle) -> bool {
        self.shared.state.lock().group(group).is_none()
    }

    pub fn group_state(&self, group: GroupHandle) -> GroupState {
        self.shared.state.lock().group_state(group)
    }

    /// Requests every task of the group to skip its remaining invocations,
    /// and optionally waits for the group to finish. Invocations that are
    /// already running are not interrupted.
    pub fn cancel_group(&self, group: GroupHandle, wait: bool) {
        {
            let state = self.shared.state.lock();
            let Some(group_state) = state.group(group) else {
                return;
            };
            for task in &group_state.tasks {
                task.cancel();
            }
        }
        if wait {
            self.wait_for_group(group);
        }
    }

    /// The amount of groups which have been created but not finished yet.
    pub fn num_allocated_groups(&self) -> usize {
        self.shared.state.lock().allocated_groups()
    }

    /// The amount of invocations waiting in the queue of the given priority.
    pub fn num_queued_invocations(&self, priority: TaskPriority) -> usize {
        self.shared.state.lock().queues[priority].len()
    }

    /// The amount of worker threads of the given type currently running.
    pub fn worker_count(&self, worker_type: WorkerType) -> usize {
        self.shared.state.lock().worker_counts[worker_type]
    }

    /// The type and index of the calling thread, if it's a worker thread of
    /// this task system.
    pub fn current_worker(&self) -> Option<(WorkerType, usize)> {
        worker::current_worker()
            .filter(|worker| worker.system_id == self.shared.system_id)
            .map(|worker| (worker.worker_type, worker.index))
    }

    pub fn target_frame_time(&self) -> Duration {
        self.shared.target_frame_time()
    }
}

/// Returns the group if it can still be modified, otherwise reports the
/// misuse.
#[track_caller]
fn configurable_group<'a>(
    state: &'a mut SchedulerState,
    handle: GroupHandle,
    action: &str,
) -> Option<&'a mut TaskGroup> {
    match state.group_mut(handle) {
        Some(group) if !group.started_by_user => Some(group),
        Some(_) => {
            debug_assert!(false, "tried to {action} a task group that was already started");
            tracing::warn!(?handle, "tried to {action} a task group that was already started");
            None
        }
        None => {
            debug_assert!(false, "tried to {action} a task group that has already finished");
            tracing::warn!(?handle, "tried to {action} a task group that has already finished");
            None
        }
    }
}

/// Owner of the worker threads. Drive it from the main thread by calling
/// [`TaskSystem::finish_frame_tasks`] once per frame.
///
/// Shuts down the workers when dropped.
pub struct TaskSystem<'platform> {
    platform: &'platform dyn Platform,
    scheduler: Scheduler,
    config: TaskSystemConfig,
    workers: EnumMap<WorkerType, Vec<WorkerThreadHandle>>,
    running: bool,
    last_frame_end: Option<Instant>,
}

impl<'platform> TaskSystem<'platform> {
    /// Creates a task system without starting any worker threads yet.
    ///
    /// The calling thread is considered the main thread: it's the only one
    /// that runs main thread tasks while waiting for groups.
    pub fn new(
        platform: &'platform dyn Platform,
        config: TaskSystemConfig,
    ) -> Result<TaskSystem<'platform>, TaskSystemError> {
        config.validate()?;
        Ok(TaskSystem {
            platform,
            scheduler: Scheduler {
                shared: Arc::new(Shared::new(config.target_frame_time())),
            },
            config,
            workers: EnumMap::default(),
            running: false,
            last_frame_end: None,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &TaskSystemConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Spawns the worker threads. Does nothing if they're already running.
    pub fn startup(&mut self) -> Result<(), TaskSystemError> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        for worker_type in WorkerType::SPAWNED {
            if let Err(err) = self.spawn_workers(worker_type) {
                self.shutdown();
                return Err(err);
            }
        }
        tracing::debug!(
            short_tasks = self.scheduler.worker_count(WorkerType::ShortTasks),
            long_tasks = self.scheduler.worker_count(WorkerType::LongTasks),
            file_access = self.scheduler.worker_count(WorkerType::FileAccess),
            "task system started",
        );
        Ok(())
    }

    /// Stops and joins every worker thread. Invocations still in the queues
    /// stay there, and get run if the task system is started again.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        for worker_type in WorkerType::SPAWNED {
            self.stop_workers(worker_type);
        }
        self.running = false;
        tracing::debug!("task system shut down");
    }

    /// Changes the amount of worker threads of a type, restarting the workers
    /// of that type if the task system is running. None resets the count to
    /// the default.
    pub fn set_worker_thread_count(
        &mut self,
        worker_type: WorkerType,
        count: Option<usize>,
    ) -> Result<(), TaskSystemError> {
        let mut config = self.config.clone();
        config.set_worker_count(worker_type, count);
        config.validate()?;
        self.config = config;

        if self.running && worker_type != WorkerType::MainThread {
            self.stop_workers(worker_type);
            self.spawn_workers(worker_type)?;
        }
        Ok(())
    }

    /// The amount of worker threads of a type the task system is configured
    /// to run.
    pub fn worker_thread_count(&self, worker_type: WorkerType) -> usize {
        self.config
            .worker_count(worker_type, self.platform.available_parallelism())
    }

    pub fn set_target_frame_time(&mut self, target_frame_time: Duration) {
        self.config.target_frame_time_ms = target_frame_time.as_secs_f64() * 1000.0;
        self.scheduler.shared.set_target_frame_time(target_frame_time);
    }

    /// Runs every queued [`TaskPriority::ThisFrameMainThread`] invocation on
    /// the calling thread.
    pub fn process_main_thread_tasks(&self) {
        let shared = &self.scheduler.shared;
        while let Some(entry) = shared.pop_priority(TaskPriority::ThisFrameMainThread) {
            shared.execute(entry);
        }
    }

    /// Ends the frame from the task system's point of view:
    ///
    /// 1. Runs the queued this-frame invocations on the calling thread until
    ///    the queues are empty, alongside the workers.
    /// 2. Runs [`TaskPriority::SomeFrameMainThread`] invocations while the
    ///    frame still has time left according to the target frame time (at
    ///    least one per frame, if there are any).
    /// 3. Moves the next-frame priorities' invocations one frame closer.
    pub fn finish_frame_tasks(&mut self) {
        profiling::scope!("finish_frame_tasks");
        let shared = &self.scheduler.shared;

        loop {
            let entry = {
                let mut state = shared.state.lock();
                TaskPriority::THIS_FRAME
                    .into_iter()
                    .find_map(|priority| state.pop_priority(priority))
            };
            match entry {
                Some(entry) => shared.execute(entry),
                None => break,
            }
        }

        let frame_start = self.last_frame_end.unwrap_or_else(|| self.platform.now());
        let target_frame_time = shared.target_frame_time();
        let mut ran_some_frame_task = false;
        loop {
            let elapsed = self.platform.now().saturating_duration_since(frame_start);
            if ran_some_frame_task && elapsed >= target_frame_time {
                break;
            }
            let Some(entry) = shared.pop_priority(TaskPriority::SomeFrameMainThread) else {
                break;
            };
            shared.execute(entry);
            ran_some_frame_task = true;
        }

        shared.state.lock().promote_frame_tasks();
        shared.wake_workers[WorkerType::ShortTasks].notify_all();

        self.last_frame_end = Some(self.platform.now());
    }

    fn spawn_workers(&mut self, worker_type: WorkerType) -> Result<(), TaskSystemError> {
        let count = self.worker_thread_count(worker_type);
        self.scheduler.shared.state.lock().stop_requested[worker_type] = false;

        let result: Result<(), TaskSystemError> = (0..count).try_for_each(|index| {
            let name = format!("{}-{index}", worker_type.thread_name_prefix());
            let mut desc = WorkerThreadDesc::new(&name);
            desc.stack_size = self.config.thread_stack_size;

            let shared = self.scheduler.shared.clone();
            let entry: WorkerEntry =
                Box::new(move || worker::worker_main(shared, worker_type, index));
            let handle = self
                .platform
                .spawn_worker_thread(desc, entry)
                .ok_or(TaskSystemError::WorkerSpawnFailed { worker_type, index })?;
            self.workers[worker_type].push(handle);
            Ok(())
        });

        let spawned = self.workers[worker_type].len();
        self.scheduler.shared.state.lock().worker_counts[worker_type] = spawned;
        result
    }

    fn stop_workers(&mut self, worker_type: WorkerType) {
        {
            let mut state = self.scheduler.shared.state.lock();
            state.stop_requested[worker_type] = true;
            state.worker_counts[worker_type] = 0;
        }
        self.scheduler.shared.wake_workers[worker_type].notify_all();

        for handle in core::mem::take(&mut self.workers[worker_type]) {
            if !handle.join() {
                tracing::warn!(?worker_type, "a worker thread panicked");
            }
        }
    }
}

impl Deref for TaskSystem<'_> {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for TaskSystem<'_> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
