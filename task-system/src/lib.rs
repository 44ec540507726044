// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cooperative task scheduling for a game engine's frame loop.
//!
//! Work is split into [`Task`]s, which are bundled into task groups
//! ([`GroupHandle`]) that can depend on each other. Started groups get their
//! task invocations queued by [`TaskPriority`], and run by the worker threads
//! of the [`TaskSystem`], or by the threads waiting for them. The
//! [`IntervalScheduler`] spreads periodic updates over frames within a cost
//! budget.

mod config;
mod error;
mod interval_scheduler;
pub mod multithreading;
mod priority;
mod task;
mod task_group;
mod task_system;

#[cfg(test)]
mod test_platform;

pub use config::{TaskSystemConfig, MAX_WORKER_THREADS};
pub use error::TaskSystemError;
pub use interval_scheduler::{IntervalScheduler, UpdateRate, HISTOGRAM_SIZE};
pub use priority::{TaskPriority, WorkerType};
pub use task::{task_name, Task, TaskFinishedCallback, TaskName, TaskNesting, TASK_NAME_LEN};
pub use task_group::{GroupFinishedCallback, GroupHandle, GroupState};
pub use task_system::{Scheduler, TaskSystem};
