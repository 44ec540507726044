// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::WorkerType;

/// Errors from setting up or reconfiguring a [`TaskSystem`](crate::TaskSystem).
///
/// Misuse of the scheduling API itself (e.g. configuring a task that is still
/// running) is a programming error and panics instead.
#[derive(Debug, thiserror::Error)]
pub enum TaskSystemError {
    #[error("invalid task system configuration: {reason}")]
    InvalidConfig { reason: &'static str },
    #[error("the platform failed to spawn {worker_type:?} worker thread #{index}")]
    WorkerSpawnFailed {
        worker_type: WorkerType,
        index: usize,
    },
}
