// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use parking_lot::Condvar;

use crate::{Task, TaskPriority};

/// Callback called once after every task of a group has finished, before the
/// group's dependents are scheduled.
pub type GroupFinishedCallback = Box<dyn FnOnce(GroupHandle) + Send + 'static>;

/// Reference to a task group. Handles are plain values and stay valid only
/// until the group finishes: after that, the group's slot gets a new
/// generation, and this handle is considered "stale," which the scheduling
/// functions treat as "already finished."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// The lifecycle of a task group, as seen through a [`GroupHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    /// Created, tasks and dependencies can be added.
    Configuring,
    /// Started, but waiting for the groups it depends on to finish.
    Pending,
    /// Started and its invocations are queued, but none are running.
    Ready,
    /// At least one invocation or the finished-callback is running.
    Running,
    /// All invocations have run. Stale handles always report this.
    Finished,
}

/// Initial generation of a group slot. Generations are odd, so that a zeroed
/// handle never matches a slot.
const FIRST_GENERATION: u32 = 1;

pub(crate) struct TaskGroup {
    pub in_use: bool,
    pub started_by_user: bool,
    pub generation: u32,
    pub priority: TaskPriority,
    pub tasks: Vec<Arc<Task>>,
    /// Groups that need to finish before this one gets scheduled.
    pub depends_on: Vec<GroupHandle>,
    /// Groups that wait for this one to finish.
    pub others_depending_on_me: Vec<GroupHandle>,
    /// How many groups in `depends_on` are still unfinished.
    pub active_dependencies: u32,
    /// Invocations queued or running. Zero until the group gets queued.
    pub remaining_invocations: u32,
    pub executing_invocations: u32,
    pub on_finished: Option<GroupFinishedCallback>,
    /// Notified when the group finishes, and when its invocations get queued
    /// so waiting threads can help run them.
    pub signal: Arc<Condvar>,
}

impl TaskGroup {
    pub fn new() -> TaskGroup {
        TaskGroup {
            in_use: false,
            started_by_user: false,
            generation: FIRST_GENERATION,
            priority: TaskPriority::ThisFrame,
            tasks: Vec::new(),
            depends_on: Vec::new(),
            others_depending_on_me: Vec::new(),
            active_dependencies: 0,
            remaining_invocations: 0,
            executing_invocations: 0,
            on_finished: None,
            signal: Arc::new(Condvar::new()),
        }
    }

    /// Takes the slot into use with a new generation.
    pub fn reuse(&mut self, priority: TaskPriority, on_finished: Option<GroupFinishedCallback>) {
        debug_assert!(!self.in_use, "only free group slots should be reused");
        self.generation = next_generation(self.generation);
        self.in_use = true;
        self.started_by_user = false;
        self.priority = priority;
        self.tasks.clear();
        self.depends_on.clear();
        self.others_depending_on_me.clear();
        self.active_dependencies = 0;
        self.remaining_invocations = 0;
        self.executing_invocations = 0;
        self.on_finished = on_finished;
    }

    /// Frees the slot, invalidating every existing handle to it. Returns the
    /// tasks, so that they can be dropped without holding the scheduler lock.
    pub fn release(&mut self) -> Vec<Arc<Task>> {
        self.generation = next_generation(self.generation);
        self.in_use = false;
        self.started_by_user = false;
        self.depends_on.clear();
        self.others_depending_on_me.clear();
        self.on_finished = None;
        core::mem::take(&mut self.tasks)
    }

    pub fn matches(&self, handle: GroupHandle) -> bool {
        self.in_use && self.generation == handle.generation
    }

    pub fn state(&self) -> GroupState {
        if !self.started_by_user {
            GroupState::Configuring
        } else if self.active_dependencies > 0 {
            GroupState::Pending
        } else if self.executing_invocations > 0 || self.remaining_invocations == 0 {
            // Zero remaining invocations on a scheduled group means its
            // finished-callback is running.
            GroupState::Running
        } else {
            GroupState::Ready
        }
    }
}

fn next_generation(generation: u32) -> u32 {
    let next = generation.wrapping_add(2);
    if next == 0 {
        FIRST_GENERATION
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use crate::TaskPriority;

    use super::{next_generation, GroupHandle, GroupState, TaskGroup};

    #[test]
    fn generations_are_odd_and_change_on_reuse_and_release() {
        let mut group = TaskGroup::new();
        let initial = group.generation;
        assert_eq!(1, initial % 2);

        group.reuse(TaskPriority::ThisFrame, None);
        let handle = GroupHandle {
            slot: 0,
            generation: group.generation,
        };
        assert_ne!(initial, handle.generation);
        assert!(group.matches(handle));

        group.release();
        assert!(!group.matches(handle));
        assert_eq!(1, group.generation % 2);

        group.reuse(TaskPriority::ThisFrame, None);
        assert!(!group.matches(handle));
    }

    #[test]
    fn generation_never_wraps_to_zero() {
        assert_eq!(1, next_generation(u32::MAX));
        assert_ne!(0, next_generation(u32::MAX - 1));
    }

    #[test]
    fn state_follows_counters() {
        let mut group = TaskGroup::new();
        group.reuse(TaskPriority::ThisFrame, None);
        assert_eq!(GroupState::Configuring, group.state());
        group.started_by_user = true;
        group.active_dependencies = 1;
        assert_eq!(GroupState::Pending, group.state());
        group.active_dependencies = 0;
        group.remaining_invocations = 2;
        assert_eq!(GroupState::Ready, group.state());
        group.executing_invocations = 1;
        assert_eq!(GroupState::Running, group.state());
    }
}
