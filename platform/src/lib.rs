// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! This crate revolves around the [`Platform`] trait, which can be
//! implemented to provide a "platform implementation" for the task system.
//! The task system never touches OS threads or clocks directly, it asks the
//! platform for them, which keeps the scheduler testable with a fake clock
//! and usable on platforms with unusual threading models.
//!
//! This is split off of the scheduler crate so that the scheduler and the
//! platform implementation can be compiled independently.

#![no_std]
#![warn(missing_docs)]

extern crate alloc;

mod thread;
mod time;

pub use thread::*;
pub use time::*;

/// A trait for using platform-dependent features from the task system without
/// depending on any platform implementation directly.
///
/// All the functions have a `&self` parameter, so that the methods can access
/// some (possibly internally mutable) state, but still keeping the platform
/// object as widely usable as possible. None of these functions are hot, and
/// this trait is object safe, so using &dyn [`Platform`] should be fine
/// performance-wise.
pub trait Platform {
    /// Returns the current point in time according to the platform
    /// implementation.
    fn now(&self) -> Instant;

    /// Returns how many threads the system could process in parallel
    /// efficiently.
    ///
    /// Note that this count shouldn't be decremented by one to "leave room for
    /// the main thread," because the main thread often sleeps while waiting for
    /// worker threads to finish their work.
    fn available_parallelism(&self) -> usize;

    /// Spawns a worker thread which runs `entry` and then exits. Returns None
    /// if the thread could not be spawned.
    ///
    /// Implementation note: `entry` does not return until the task system
    /// asks its workers to stop, so the returned [`WorkerThreadHandle`]
    /// should block in [`WorkerThreadHandle::join`] until the thread has
    /// actually exited.
    fn spawn_worker_thread(
        &self,
        desc: WorkerThreadDesc,
        entry: WorkerEntry,
    ) -> Option<WorkerThreadHandle>;
}
