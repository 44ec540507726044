// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use enum_map::Enum;

/// Scheduling class of a task group, determining which queue its tasks are
/// pushed onto, and thus which threads run them and in which order.
///
/// The variants are in priority order: a worker always picks the first
/// non-empty queue among the priorities of its [`WorkerType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum TaskPriority {
    /// Highest priority for work that needs to be done this frame.
    EarlyThisFrame,
    /// Work that needs to be done this frame.
    ThisFrame,
    /// Work that needs to be done this frame, but after everything else.
    LateThisFrame,
    /// Moved to [`TaskPriority::EarlyThisFrame`] at the end of the frame.
    EarlyNextFrame,
    /// Moved to [`TaskPriority::ThisFrame`] at the end of the frame.
    NextFrame,
    /// Moved to [`TaskPriority::LateThisFrame`] at the end of the frame.
    LateNextFrame,
    /// Moved to [`TaskPriority::NextFrame`] at the end of the frame.
    In2Frames,
    /// Moved to [`TaskPriority::In2Frames`] at the end of the frame.
    In3Frames,
    /// Work that takes longer than a frame, but should get done soon.
    LongRunningHighPriority,
    /// Work that takes longer than a frame.
    LongRunning,
    /// File reads and writes which something is actively waiting for.
    FileAccessHighPriority,
    /// File reads and writes.
    FileAccess,
    /// Work that must run on the main thread before the frame ends.
    ThisFrameMainThread,
    /// Work that must run on the main thread, whenever there's spare time left
    /// in a frame.
    SomeFrameMainThread,
}

impl TaskPriority {
    /// Every priority, from highest to lowest.
    pub const ALL: [TaskPriority; 14] = [
        TaskPriority::EarlyThisFrame,
        TaskPriority::ThisFrame,
        TaskPriority::LateThisFrame,
        TaskPriority::EarlyNextFrame,
        TaskPriority::NextFrame,
        TaskPriority::LateNextFrame,
        TaskPriority::In2Frames,
        TaskPriority::In3Frames,
        TaskPriority::LongRunningHighPriority,
        TaskPriority::LongRunning,
        TaskPriority::FileAccessHighPriority,
        TaskPriority::FileAccess,
        TaskPriority::ThisFrameMainThread,
        TaskPriority::SomeFrameMainThread,
    ];

    /// The priorities that need to be drained before a frame can end.
    pub const THIS_FRAME: [TaskPriority; 4] = [
        TaskPriority::EarlyThisFrame,
        TaskPriority::ThisFrame,
        TaskPriority::LateThisFrame,
        TaskPriority::ThisFrameMainThread,
    ];

    /// The type of thread that is allowed to run tasks of this priority.
    pub fn worker_type(self) -> WorkerType {
        match self {
            TaskPriority::EarlyThisFrame
            | TaskPriority::ThisFrame
            | TaskPriority::LateThisFrame
            | TaskPriority::EarlyNextFrame
            | TaskPriority::NextFrame
            | TaskPriority::LateNextFrame
            | TaskPriority::In2Frames
            | TaskPriority::In3Frames => WorkerType::ShortTasks,
            TaskPriority::LongRunningHighPriority | TaskPriority::LongRunning => {
                WorkerType::LongTasks
            }
            TaskPriority::FileAccessHighPriority | TaskPriority::FileAccess => {
                WorkerType::FileAccess
            }
            TaskPriority::ThisFrameMainThread | TaskPriority::SomeFrameMainThread => {
                WorkerType::MainThread
            }
        }
    }

    /// The priority this one turns into at the end of a frame, if it's a
    /// frame-relative priority scheduled for a future frame.
    pub fn promoted(self) -> Option<TaskPriority> {
        match self {
            TaskPriority::EarlyNextFrame => Some(TaskPriority::EarlyThisFrame),
            TaskPriority::NextFrame => Some(TaskPriority::ThisFrame),
            TaskPriority::LateNextFrame => Some(TaskPriority::LateThisFrame),
            TaskPriority::In2Frames => Some(TaskPriority::NextFrame),
            TaskPriority::In3Frames => Some(TaskPriority::In2Frames),
            _ => None,
        }
    }
}

/// The kinds of threads the task system runs tasks on. Each spawned worker
/// thread is pinned to one of these, and only runs tasks whose
/// [`TaskPriority::worker_type`] matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum WorkerType {
    /// Runs the frame-relative priorities.
    ShortTasks,
    /// Runs the long running priorities.
    LongTasks,
    /// Runs the file access priorities.
    FileAccess,
    /// Not a spawned thread: the thread which owns the
    /// [`TaskSystem`](crate::TaskSystem), running main-thread tasks while
    /// pumping frames.
    MainThread,
}

impl WorkerType {
    /// The worker types which get their own spawned threads.
    pub const SPAWNED: [WorkerType; 3] = [
        WorkerType::ShortTasks,
        WorkerType::LongTasks,
        WorkerType::FileAccess,
    ];

    /// The priorities served by threads of this type, from highest to lowest.
    pub fn priorities(self) -> impl Iterator<Item = TaskPriority> {
        TaskPriority::ALL
            .into_iter()
            .filter(move |priority| priority.worker_type() == self)
    }

    pub(crate) fn thread_name_prefix(self) -> &'static str {
        match self {
            WorkerType::ShortTasks => "short-tasks",
            WorkerType::LongTasks => "long-tasks",
            WorkerType::FileAccess => "file-access",
            WorkerType::MainThread => "main",
        }
    }
}
