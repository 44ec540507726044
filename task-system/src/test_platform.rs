// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::time::Duration;
use std::thread;

use parking_lot::Mutex;
use platform::{Instant, Platform, WorkerEntry, WorkerThreadDesc, WorkerThreadHandle};

/// Platform for tests: real threads, but a clock that only moves when the
/// test moves it.
pub struct TestPlatform {
    parallelism: usize,
    elapsed: Mutex<Duration>,
}

impl TestPlatform {
    pub fn new(parallelism: usize) -> TestPlatform {
        TestPlatform {
            parallelism,
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }
}

impl Platform for TestPlatform {
    fn now(&self) -> Instant {
        Instant::reference() + *self.elapsed.lock()
    }

    fn available_parallelism(&self) -> usize {
        self.parallelism
    }

    fn spawn_worker_thread(
        &self,
        desc: WorkerThreadDesc,
        entry: WorkerEntry,
    ) -> Option<WorkerThreadHandle> {
        let handle = thread::Builder::new()
            .name(desc.name.to_string())
            .spawn(entry)
            .ok()?;
        Some(WorkerThreadHandle::new(move || handle.join().is_ok()))
    }
}
