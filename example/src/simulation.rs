use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use platform::Platform;
use serde::Serialize;
use task_system::{
    multithreading::parallel_for, GroupHandle, IntervalScheduler, Task, TaskPriority, TaskSystem,
    UpdateRate,
};

const BODIES: usize = 10_000;
const WORLD_EXTENT: f32 = 100.0;
const ANIMATION_BATCHES: u32 = 8;
const SNAPSHOT_INTERVAL_FRAMES: u64 = 60;
const AGENT_RATES: [UpdateRate; 5] = [
    UpdateRate::Max30fps,
    UpdateRate::Max20fps,
    UpdateRate::Max10fps,
    UpdateRate::Max5fps,
    UpdateRate::Max1fps,
];

#[derive(Debug, Clone, Copy, Default)]
struct Body {
    position: [f32; 2],
    velocity: [f32; 2],
}

#[derive(Debug, Clone, Copy, Default)]
struct Agent {
    thoughts: u64,
    max_staleness: Duration,
}

/// Counters shared with the tasks of the simulation.
#[derive(Default)]
struct SharedStats {
    frame: AtomicU64,
    poses: [AtomicU64; ANIMATION_BATCHES as usize],
    pose_checksum: AtomicU64,
    presented_frames: AtomicU64,
    cleanups: AtomicU64,
    snapshots: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            frame: self.frame.load(Ordering::Relaxed),
            presented_frames: self.presented_frames.load(Ordering::Relaxed),
            pose_checksum: self.pose_checksum.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FrameSnapshot {
    frame: u64,
    presented_frames: u64,
    pose_checksum: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationStats {
    pub frames: u64,
    pub presented_frames: u64,
    pub cleanups: u64,
    pub snapshots: u64,
    pub pose_checksum: u64,
    pub agent_thoughts: u64,
    pub max_agent_staleness_ms: f64,
}

/// A toy game world, updated with a bit of everything the task system offers:
/// a `parallel_for` over physics bodies, a dependent animation and skinning
/// pipeline, a main thread task, occasional file writes in the background,
/// some next-frame cleanup, and rate-limited agent updates.
pub struct Simulation {
    bodies: Vec<Body>,
    agents: Vec<Agent>,
    agent_scheduler: IntervalScheduler<usize>,
    stats: Arc<SharedStats>,
    animation: Arc<Task>,
    skinning: Arc<Task>,
    present: Arc<Task>,
    cleanup: Arc<Task>,
    snapshot: Arc<Task>,
    frame: u64,
}

impl Simulation {
    pub fn new(agent_count: usize, snapshot_path: Option<PathBuf>) -> Simulation {
        let stats = Arc::new(SharedStats::default());

        let bodies = (0..BODIES)
            .map(|i| Body {
                position: [0.0; 2],
                velocity: [(i % 7) as f32 - 3.0, (i % 5) as f32 - 2.0],
            })
            .collect();

        let mut agent_scheduler =
            IntervalScheduler::new(Duration::from_millis(1), Duration::from_secs(1));
        for agent in 0..agent_count {
            agent_scheduler.add_or_update_work_rate(agent, AGENT_RATES[agent % AGENT_RATES.len()]);
        }

        let animation = {
            let stats = stats.clone();
            Task::new_parallel("animation", ANIMATION_BATCHES, move |batch| {
                let frame = stats.frame.load(Ordering::Relaxed);
                let pose = (frame * 31 + batch as u64 * 7) % 1000;
                stats.poses[batch as usize].store(pose, Ordering::Relaxed);
            })
        };

        let skinning = {
            let stats = stats.clone();
            Task::new("skinning", move || {
                let sum: u64 = stats
                    .poses
                    .iter()
                    .map(|pose| pose.load(Ordering::Relaxed))
                    .sum();
                stats.pose_checksum.fetch_add(sum, Ordering::Relaxed);
            })
        };

        let present = {
            let stats = stats.clone();
            Task::new("present", move || {
                let presented = stats.presented_frames.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!("Presented frame #{presented}");
            })
        };

        let cleanup = {
            let stats = stats.clone();
            Task::new("cleanup", move || {
                stats.cleanups.fetch_add(1, Ordering::Relaxed);
            })
        };

        let snapshot = {
            let stats = stats.clone();
            Task::new("snapshot", move || {
                let json = match serde_json::to_string_pretty(&stats.snapshot()) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::warn!("Failed to serialize a snapshot: {err}");
                        return;
                    }
                };
                match &snapshot_path {
                    Some(path) => {
                        if let Err(err) = fs::write(path, json) {
                            tracing::warn!("Failed to write {}: {err}", path.display());
                            return;
                        }
                    }
                    None => tracing::debug!("Snapshot: {json}"),
                }
                stats.snapshots.fetch_add(1, Ordering::Relaxed);
            })
        };

        Simulation {
            bodies,
            agents: vec![Agent::default(); agent_count],
            agent_scheduler,
            stats,
            animation: Arc::new(animation),
            skinning: Arc::new(skinning),
            present: Arc::new(present),
            cleanup: Arc::new(cleanup),
            snapshot: Arc::new(snapshot),
            frame: 0,
        }
    }

    pub fn run_frame(
        &mut self,
        task_system: &mut TaskSystem,
        platform: &dyn Platform,
        delta: Duration,
    ) {
        profiling::scope!("Simulation::run_frame");
        self.stats.frame.store(self.frame, Ordering::Relaxed);

        let dt = delta.as_secs_f32();
        parallel_for(task_system, &mut self.bodies, |bodies, _| {
            for body in bodies {
                integrate(body, dt);
            }
        });

        let animation = task_system.create_group(TaskPriority::EarlyThisFrame, None);
        task_system.add_task(animation, self.animation.clone());
        let skinning = task_system.create_group(
            TaskPriority::ThisFrame,
            Some(Box::new(|handle: GroupHandle| tracing::trace!(?handle, "Skinning done"))),
        );
        task_system.add_task(skinning, self.skinning.clone());
        task_system.add_dependency(skinning, animation);
        task_system.start_groups(&[skinning, animation]);

        if self.present.is_finished() {
            task_system.start_single_task(
                self.present.clone(),
                TaskPriority::ThisFrameMainThread,
                Some(skinning),
            );
        }

        if self.cleanup.is_finished() {
            task_system.start_single_task(self.cleanup.clone(), TaskPriority::NextFrame, None);
        }

        if self.frame % SNAPSHOT_INTERVAL_FRAMES == 0 && self.snapshot.is_finished() {
            task_system.start_single_task(self.snapshot.clone(), TaskPriority::FileAccess, None);
        }

        // Agents get slower for a while every few seconds, to see the
        // scheduler adapt.
        if self.frame % 240 == 120 {
            for agent in (0..self.agents.len()).step_by(3) {
                self.agent_scheduler.add_or_update_work_rate(agent, UpdateRate::Max2fps);
            }
        } else if self.frame % 240 == 0 {
            for agent in (0..self.agents.len()).step_by(3) {
                let rate = AGENT_RATES[agent % AGENT_RATES.len()];
                self.agent_scheduler.add_or_update_work_rate(agent, rate);
            }
        }

        let agents = &mut self.agents;
        self.agent_scheduler.update(
            platform,
            delta,
            task_system.target_frame_time(),
            |&agent, since_last_run| think(&mut agents[agent], since_last_run),
        );

        task_system.wait_for_group(skinning);
        task_system.finish_frame_tasks();
        self.frame += 1;
    }

    pub fn stats(&self) -> SimulationStats {
        SimulationStats {
            frames: self.frame,
            presented_frames: self.stats.presented_frames.load(Ordering::Relaxed),
            cleanups: self.stats.cleanups.load(Ordering::Relaxed),
            snapshots: self.stats.snapshots.load(Ordering::Relaxed),
            pose_checksum: self.stats.pose_checksum.load(Ordering::Relaxed),
            agent_thoughts: self.agents.iter().map(|agent| agent.thoughts).sum(),
            max_agent_staleness_ms: self
                .agents
                .iter()
                .map(|agent| agent.max_staleness.as_secs_f64() * 1000.0)
                .fold(0.0, f64::max),
        }
    }
}

fn integrate(body: &mut Body, dt: f32) {
    for axis in 0..2 {
        body.position[axis] += body.velocity[axis] * dt;
        if body.position[axis].abs() > WORLD_EXTENT {
            body.position[axis] = body.position[axis].clamp(-WORLD_EXTENT, WORLD_EXTENT);
            body.velocity[axis] = -body.velocity[axis];
        }
    }
}

fn think(agent: &mut Agent, since_last_run: Duration) {
    agent.thoughts += 1;
    agent.max_staleness = agent.max_staleness.max(since_last_run);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use platform::Platform;
    use platform_std::StdPlatform;
    use task_system::{TaskSystem, TaskSystemConfig};

    use super::{integrate, Body, Simulation, WORLD_EXTENT};

    #[test]
    fn bodies_bounce_off_the_world_edges() {
        let mut body = Body {
            position: [WORLD_EXTENT - 0.5, 0.0],
            velocity: [1.0, 0.0],
        };
        integrate(&mut body, 1.0);
        assert_eq!(WORLD_EXTENT, body.position[0]);
        assert_eq!(-1.0, body.velocity[0]);
    }

    #[test]
    fn frames_run_every_pipeline() {
        let platform = StdPlatform::new();
        let config = TaskSystemConfig {
            short_task_workers: Some(2),
            ..Default::default()
        };
        let mut task_system = TaskSystem::new(&platform, config).unwrap();
        task_system.startup().unwrap();

        let mut simulation = Simulation::new(10, None);
        let mut last_frame = platform.now();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(2));
            let now = platform.now();
            let delta = now.saturating_duration_since(last_frame);
            simulation.run_frame(&mut task_system, &platform, delta);
            last_frame = now;
        }
        task_system.shutdown();

        let stats = simulation.stats();
        assert_eq!(5, stats.frames);
        assert_eq!(5, stats.presented_frames);
        assert!(stats.agent_thoughts >= 5);
        assert!(stats.cleanups >= 1);
        assert!(stats.snapshots <= 1);
    }
}
