// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{TaskSystemError, WorkerType};

/// The maximum amount of worker threads of a single [`WorkerType`].
pub const MAX_WORKER_THREADS: usize = 128;

const DEFAULT_LONG_TASK_WORKERS: usize = 2;
const DEFAULT_FILE_ACCESS_WORKERS: usize = 1;

/// Startup parameters for [`TaskSystem`](crate::TaskSystem).
///
/// Every field has a default, so a config file only needs to contain the
/// values it wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSystemConfig {
    /// Threads for the frame-relative priorities. Defaults to the platform's
    /// available parallelism.
    pub short_task_workers: Option<usize>,
    /// Threads for the long running priorities. Defaults to 2.
    pub long_task_workers: Option<usize>,
    /// Threads for the file access priorities. Defaults to 1.
    pub file_access_workers: Option<usize>,
    /// How long a frame should take, used to decide how much
    /// [`TaskPriority::SomeFrameMainThread`](crate::TaskPriority::SomeFrameMainThread)
    /// work fits in a frame.
    pub target_frame_time_ms: f64,
    /// Stack size for spawned worker threads, None for the platform default.
    pub thread_stack_size: Option<usize>,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        TaskSystemConfig {
            short_task_workers: None,
            long_task_workers: None,
            file_access_workers: None,
            target_frame_time_ms: 1000.0 / 60.0,
            thread_stack_size: None,
        }
    }
}

impl TaskSystemConfig {
    /// The amount of threads to spawn for the given worker type, given the
    /// platform's available parallelism.
    pub fn worker_count(&self, worker_type: WorkerType, available_parallelism: usize) -> usize {
        let configured = match worker_type {
            WorkerType::ShortTasks => self.short_task_workers,
            WorkerType::LongTasks => self.long_task_workers,
            WorkerType::FileAccess => self.file_access_workers,
            WorkerType::MainThread => return 0,
        };
        configured
            .unwrap_or(match worker_type {
                WorkerType::ShortTasks => available_parallelism.max(1),
                WorkerType::LongTasks => DEFAULT_LONG_TASK_WORKERS,
                _ => DEFAULT_FILE_ACCESS_WORKERS,
            })
            .min(MAX_WORKER_THREADS)
    }

    /// Overrides the worker count of a worker type, None resets it to the
    /// default. The main thread "worker type" is always the one calling
    /// thread, so setting it does nothing.
    pub fn set_worker_count(&mut self, worker_type: WorkerType, count: Option<usize>) {
        match worker_type {
            WorkerType::ShortTasks => self.short_task_workers = count,
            WorkerType::LongTasks => self.long_task_workers = count,
            WorkerType::FileAccess => self.file_access_workers = count,
            WorkerType::MainThread => {}
        }
    }

    pub fn target_frame_time(&self) -> Duration {
        Duration::from_secs_f64(self.target_frame_time_ms / 1000.0)
    }

    /// Checks the invariants the task system relies on.
    pub fn validate(&self) -> Result<(), TaskSystemError> {
        let counts = [
            self.short_task_workers,
            self.long_task_workers,
            self.file_access_workers,
        ];
        if counts.into_iter().flatten().any(|count| count > MAX_WORKER_THREADS) {
            return Err(TaskSystemError::InvalidConfig {
                reason: "worker thread counts should be at most 128",
            });
        }
        if !(self.target_frame_time_ms.is_finite() && self.target_frame_time_ms > 0.0) {
            return Err(TaskSystemError::InvalidConfig {
                reason: "target frame time should be a positive amount of milliseconds",
            });
        }
        if self.thread_stack_size == Some(0) {
            return Err(TaskSystemError::InvalidConfig {
                reason: "thread stack size should not be zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use crate::{TaskSystemError, WorkerType};

    use super::TaskSystemConfig;

    #[test]
    fn missing_fields_use_defaults() {
        let config: TaskSystemConfig =
            serde_json::from_str(r#"{ "long_task_workers": 4 }"#).unwrap();
        assert_eq!(Some(4), config.long_task_workers);
        assert_eq!(None, config.short_task_workers);
        assert_eq!(TaskSystemConfig::default().target_frame_time_ms, config.target_frame_time_ms);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<TaskSystemConfig>(r#"{ "workers": 4 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn default_worker_counts() {
        let config = TaskSystemConfig::default();
        assert_eq!(6, config.worker_count(WorkerType::ShortTasks, 6));
        assert_eq!(1, config.worker_count(WorkerType::ShortTasks, 0));
        assert_eq!(2, config.worker_count(WorkerType::LongTasks, 6));
        assert_eq!(1, config.worker_count(WorkerType::FileAccess, 6));
        assert_eq!(0, config.worker_count(WorkerType::MainThread, 6));
    }

    #[test]
    fn overridden_worker_counts() {
        let mut config = TaskSystemConfig::default();
        config.set_worker_count(WorkerType::ShortTasks, Some(0));
        config.set_worker_count(WorkerType::FileAccess, Some(3));
        assert_eq!(0, config.worker_count(WorkerType::ShortTasks, 6));
        assert_eq!(3, config.worker_count(WorkerType::FileAccess, 6));
        config.set_worker_count(WorkerType::FileAccess, None);
        assert_eq!(1, config.worker_count(WorkerType::FileAccess, 6));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let too_many_threads = TaskSystemConfig {
            short_task_workers: Some(1000),
            ..Default::default()
        };
        assert!(matches!(
            too_many_threads.validate(),
            Err(TaskSystemError::InvalidConfig { .. })
        ));

        let zero_frame_time = TaskSystemConfig {
            target_frame_time_ms: 0.0,
            ..Default::default()
        };
        assert!(zero_frame_time.validate().is_err());
    }

    #[test]
    fn frame_time_is_converted_from_milliseconds() {
        let config = TaskSystemConfig {
            target_frame_time_ms: 20.0,
            ..Default::default()
        };
        assert_eq!(Duration::from_millis(20), config.target_frame_time());
    }
}
