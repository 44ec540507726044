// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! [`Platform`] implementation on top of the Rust standard library, for
//! desktop targets with regular OS threads.

use std::{num::NonZeroUsize, thread, time};

use platform::{Instant, Platform, WorkerEntry, WorkerThreadDesc, WorkerThreadHandle};

/// Platform implementation backed by `std::thread` and `std::time`.
pub struct StdPlatform {
    /// The point in time mapped to [`Instant::reference`].
    epoch: time::Instant,
}

impl StdPlatform {
    pub fn new() -> StdPlatform {
        StdPlatform {
            epoch: time::Instant::now(),
        }
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        StdPlatform::new()
    }
}

impl Platform for StdPlatform {
    fn now(&self) -> Instant {
        Instant::reference() + self.epoch.elapsed()
    }

    fn available_parallelism(&self) -> usize {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    fn spawn_worker_thread(
        &self,
        desc: WorkerThreadDesc,
        entry: WorkerEntry,
    ) -> Option<WorkerThreadHandle> {
        let mut builder = thread::Builder::new().name(desc.name.to_string());
        if let Some(stack_size) = desc.stack_size {
            builder = builder.stack_size(stack_size);
        }

        match builder.spawn(entry) {
            Ok(handle) => Some(WorkerThreadHandle::new(move || handle.join().is_ok())),
            Err(err) => {
                tracing::warn!(name = %desc.name, "failed to spawn worker thread: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use platform::{Platform, WorkerThreadDesc};

    use super::StdPlatform;

    #[test]
    fn clock_moves_forward() {
        let platform = StdPlatform::new();
        let before = platform.now();
        std::thread::sleep(Duration::from_millis(2));
        let after = platform.now();
        assert!(after.duration_since(before).unwrap() >= Duration::from_millis(2));
    }

    #[test]
    fn spawned_thread_runs_and_joins() {
        let platform = StdPlatform::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_in_thread = ran.clone();
        let handle = platform
            .spawn_worker_thread(
                WorkerThreadDesc::new("test-worker"),
                Box::new(move || ran_in_thread.store(true, Ordering::Release)),
            )
            .unwrap();
        assert!(handle.join());
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn panicking_thread_is_reported_on_join() {
        let platform = StdPlatform::new();
        let handle = platform
            .spawn_worker_thread(
                WorkerThreadDesc::new("doomed-worker"),
                Box::new(|| panic!("worker thread panic for testing")),
            )
            .unwrap();
        assert!(!handle.join());
    }
}
