// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{cell::Cell, sync::Arc};

use crossbeam_utils::Backoff;
use parking_lot::MutexGuard;

use crate::WorkerType;

use super::state::Shared;

#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerIdentity {
    pub system_id: u64,
    pub worker_type: WorkerType,
    pub index: usize,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerIdentity>> = const { Cell::new(None) };
}

/// Returns the identity of the calling thread, if it's a task system worker.
pub(crate) fn current_worker() -> Option<WorkerIdentity> {
    CURRENT_WORKER.get()
}

/// The main loop of a worker thread: runs invocations from the queues of its
/// worker type until the task system asks the workers of this type to stop.
pub(crate) fn worker_main(shared: Arc<Shared>, worker_type: WorkerType, index: usize) {
    CURRENT_WORKER.set(Some(WorkerIdentity {
        system_id: shared.system_id,
        worker_type,
        index,
    }));
    tracing::trace!(?worker_type, index, "worker thread started");

    let backoff = Backoff::new();
    let mut state = shared.state.lock();
    loop {
        if state.stop_requested[worker_type] {
            break;
        }

        if let Some(entry) = state.pop_ready(worker_type) {
            MutexGuard::unlocked(&mut state, || shared.execute(entry));
            backoff.reset();
            continue;
        }

        // Spin for a while before going to sleep, as new tasks tend to come in
        // bursts within a frame.
        if !backoff.is_completed() {
            MutexGuard::unlocked(&mut state, || backoff.snooze());
        } else {
            shared.wake_workers[worker_type].wait(&mut state);
        }
    }
    drop(state);

    CURRENT_WORKER.set(None);
    tracing::trace!(?worker_type, index, "worker thread stopped");
}
