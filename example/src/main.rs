// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;
mod settings;
mod simulation;

use std::{thread, time::Duration};

use anyhow::Context;
use platform::Platform;
use platform_std::StdPlatform;
use simulation::Simulation;
use task_system::{TaskSystem, WorkerType};

fn main() -> anyhow::Result<()> {
    let opts = cli::options().run();

    tracing_subscriber::fmt()
        .with_max_level(opts.verbosity_level)
        .init();

    #[cfg(feature = "profile")]
    profiling::tracy_client::Client::start();

    let mut config = settings::read(opts.config.as_deref())?;
    if let Some(workers) = opts.workers {
        config.set_worker_count(WorkerType::ShortTasks, Some(workers));
    }

    let platform = StdPlatform::new();
    let mut task_system =
        TaskSystem::new(&platform, config).context("Invalid task system configuration")?;
    task_system
        .startup()
        .context("Failed to start the task system")?;
    tracing::info!(
        "Started {} short task, {} long task and {} file access workers",
        task_system.worker_thread_count(WorkerType::ShortTasks),
        task_system.worker_thread_count(WorkerType::LongTasks),
        task_system.worker_thread_count(WorkerType::FileAccess),
    );

    let mut simulation = Simulation::new(opts.agents, opts.snapshot.clone());
    let target_frame_time = task_system.target_frame_time();
    let mut last_frame = platform.now();
    for _ in 0..opts.frames {
        let frame_start = platform.now();
        let delta = frame_start.saturating_duration_since(last_frame);
        last_frame = frame_start;

        simulation.run_frame(&mut task_system, &platform, delta);

        let frame_time = platform.now().saturating_duration_since(frame_start);
        if let Some(remaining) = target_frame_time.checked_sub(frame_time) {
            if remaining > Duration::ZERO {
                thread::sleep(remaining);
            }
        }

        profiling::finish_frame!();
    }

    task_system.shutdown();

    let stats = simulation.stats();
    tracing::info!(
        "Simulated {} frames, {} presented, {} snapshots, {} agent updates (stalest {:.1} ms)",
        stats.frames,
        stats.presented_frames,
        stats.snapshots,
        stats.agent_thoughts,
        stats.max_agent_staleness_ms,
    );
    tracing::debug!(?stats, "Final statistics");

    Ok(())
}
