// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Data-parallel helpers on top of the task system.

use core::{
    slice,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{Scheduler, Task, TaskPriority, WorkerType};

/// The maximum amount of chunks [`parallel_for`] splits its data into.
pub const MAX_THREADS: usize = 128;

/// Runs the function on multiple threads, splitting the data into one part for
/// each short task worker thread.
///
/// The function also gets the offset of the specific subslice it got, relative
/// to the start of `data`.
///
/// The return value is the size of the chunks `data` was split into. The same
/// slices can be acquired by calling `chunks` or `chunks_mut` on `data` and
/// passing it in as the chunk size. If the input slice is empty, 0 is returned.
///
/// The chunks are run as one [`TaskPriority::ThisFrame`] task, and the calling
/// thread helps run them while waiting, so this works without any worker
/// threads too.
///
/// ### Panics
///
/// If `func` panicked for any of the chunks. The panic is raised after every
/// chunk has been processed.
#[track_caller]
pub fn parallel_for<T, F>(scheduler: &Scheduler, data: &mut [T], func: F) -> usize
where
    T: Send,
    F: Fn(&mut [T], usize) + Sync,
{
    /// The data and function of a [`parallel_for`] call, with the types and
    /// lifetimes erased so that the chunks can be sent off as a task.
    struct ChunkedWork {
        /// Cast from: `*mut T`, the start of `data`.
        data: *mut (),
        len: usize,
        chunk_size: usize,
        /// Cast from: `*const F`.
        func: *const (),
        /// Pass in `self.func` and a chunk of `self.data` to call the function
        /// with the right types.
        func_proxy: unsafe fn(func: *const (), data: *mut (), offset: usize, len: usize),
        panicked: Arc<AtomicBool>,
    }

    impl ChunkedWork {
        /// ### Safety
        ///
        /// The `data` and `func` the work was created from must still be
        /// borrowed by the [`parallel_for`] call, and no two calls can be for
        /// the same chunk.
        unsafe fn run_chunk(&self, chunk: usize) {
            let offset = chunk * self.chunk_size;
            let len = self.chunk_size.min(self.len - offset);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                // Safety: upheld by the caller.
                unsafe { (self.func_proxy)(self.func, self.data, offset, len) };
            }));
            if result.is_err() {
                self.panicked.store(true, Ordering::Release);
            }
        }
    }

    // Safety: the pointers point to a `[T]` where `T: Send`, split into
    // non-overlapping chunks, and to an `F: Sync` which is only used through
    // shared references.
    unsafe impl Send for ChunkedWork {}
    unsafe impl Sync for ChunkedWork {}

    /// ### Safety
    ///
    /// `func` must point to a live `Func`, and `data` to a live `[Item]` with at
    /// least `offset + len` elements, of which the `offset..offset + len`
    /// range isn't borrowed anywhere else.
    unsafe fn call_func<Item, Func: Fn(&mut [Item], usize)>(
        func: *const (),
        data: *mut (),
        offset: usize,
        len: usize,
    ) {
        // Safety: upheld by the caller.
        let (func, chunk) = unsafe {
            let chunk_start = (data as *mut Item).add(offset);
            (&*(func as *const Func), slice::from_raw_parts_mut(chunk_start, len))
        };
        func(chunk, offset);
    }

    if data.is_empty() {
        return 0;
    }

    let max_chunks = scheduler
        .worker_count(WorkerType::ShortTasks)
        .clamp(1, MAX_THREADS);
    let chunk_size = data.len().div_ceil(max_chunks);
    let chunk_count = data.len().div_ceil(chunk_size);

    // Shadow `func` to ensure that the value doesn't get dropped until the end
    // of this function, since this borrow is shared with the threads.
    let func = &func;

    let panicked = Arc::new(AtomicBool::new(false));
    let work = ChunkedWork {
        data: data.as_mut_ptr() as *mut (),
        len: data.len(),
        chunk_size,
        func: func as *const F as *const (),
        func_proxy: call_func::<T, F>,
        panicked: panicked.clone(),
    };

    let task = Arc::new(Task::new_parallel(
        "parallel_for",
        chunk_count as u32,
        move |chunk| {
            // Safety:
            // - Lifetime-wise, `data` and `func` are borrowed until the end of
            //   the `parallel_for` call, which waits for the group containing
            //   this task, so every invocation runs while they're borrowed.
            // - Exclusive-access-wise, each invocation index is run exactly
            //   once per scheduling, and each index maps to its own chunk.
            unsafe { work.run_chunk(chunk as usize) };
        },
    ));

    let group = scheduler.start_single_task(task, TaskPriority::ThisFrame, None);
    scheduler.wait_for_group(group);

    if panicked.load(Ordering::Acquire) {
        panic!("a parallel_for chunk panicked");
    }

    chunk_size
}
