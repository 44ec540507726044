// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use alloc::boxed::Box;
use core::fmt::{self, Debug};

use arrayvec::ArrayString;

#[allow(unused_imports)] // used in docs
use crate::Platform;

/// The maximum length of a worker thread's name, in bytes.
pub const WORKER_THREAD_NAME_LEN: usize = 32;

/// The function a worker thread runs, passed into
/// [`Platform::spawn_worker_thread`].
pub type WorkerEntry = Box<dyn FnOnce() + Send + 'static>;

/// Parameters for [`Platform::spawn_worker_thread`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerThreadDesc {
    /// Name of the thread, for debuggers and profilers.
    pub name: ArrayString<WORKER_THREAD_NAME_LEN>,
    /// Stack size for the thread in bytes, or None for the platform default.
    pub stack_size: Option<usize>,
}

impl WorkerThreadDesc {
    /// Creates a thread description with the given name (truncated to
    /// [`WORKER_THREAD_NAME_LEN`] bytes) and the default stack size.
    pub fn new(name: &str) -> WorkerThreadDesc {
        WorkerThreadDesc {
            name: truncated_name(name),
            stack_size: None,
        }
    }
}

fn truncated_name(name: &str) -> ArrayString<WORKER_THREAD_NAME_LEN> {
    let mut truncated = ArrayString::new();
    for c in name.chars() {
        if truncated.try_push(c).is_err() {
            break;
        }
    }
    truncated
}

/// Handle to a thread spawned with [`Platform::spawn_worker_thread`].
///
/// Dropping the handle detaches the thread.
pub struct WorkerThreadHandle {
    join_fn: Box<dyn FnOnce() -> bool + Send + 'static>,
}

impl WorkerThreadHandle {
    /// Creates a handle from a function that blocks until the thread has
    /// exited, returning false if the thread panicked.
    pub fn new(join_fn: impl FnOnce() -> bool + Send + 'static) -> WorkerThreadHandle {
        WorkerThreadHandle {
            join_fn: Box::new(join_fn),
        }
    }

    /// Blocks until the thread exits. Returns false if the thread panicked.
    pub fn join(self) -> bool {
        (self.join_fn)()
    }
}

impl Debug for WorkerThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThreadHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkerThreadDesc, WORKER_THREAD_NAME_LEN};

    #[test]
    fn long_names_are_truncated() {
        let desc = WorkerThreadDesc::new("a-very-long-worker-thread-name-that-keeps-going");
        assert_eq!(WORKER_THREAD_NAME_LEN, desc.name.len());
        assert!(desc.name.starts_with("a-very-long-worker"));
    }

    #[test]
    fn multibyte_names_are_truncated_on_char_boundaries() {
        let desc = WorkerThreadDesc::new("työläinen-työläinen-työläinen-työläinen");
        assert!(desc.name.len() <= WORKER_THREAD_NAME_LEN);
        assert!(desc.name.starts_with("työläinen"));
    }
}
