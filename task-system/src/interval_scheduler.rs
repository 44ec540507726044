// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::time::Duration;

use platform::Platform;

/// The amount of buckets in the interval histogram of [`IntervalScheduler`].
pub const HISTOGRAM_SIZE: usize = 32;

/// How fast the expected amount of runs per frame follows changes in the
/// histogram.
const RUNS_PER_FRAME_SMOOTHING: f64 = 0.05;
/// How fast the cost estimate of an entry follows its measured costs.
const COST_SMOOTHING: f64 = 0.1;
const DEFAULT_BUDGET_FRACTION: f64 = 0.25;

/// How often some periodic work wants to be run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum UpdateRate {
    #[default]
    EveryFrame,
    Max30fps,
    Max20fps,
    Max10fps,
    Max5fps,
    Max2fps,
    Max1fps,
    /// Not run at all.
    Never,
}

impl UpdateRate {
    /// The time between runs, or None for [`UpdateRate::Never`].
    pub fn interval(self) -> Option<Duration> {
        match self {
            UpdateRate::EveryFrame => Some(Duration::ZERO),
            UpdateRate::Max30fps => Some(Duration::from_nanos(1_000_000_000 / 30)),
            UpdateRate::Max20fps => Some(Duration::from_millis(50)),
            UpdateRate::Max10fps => Some(Duration::from_millis(100)),
            UpdateRate::Max5fps => Some(Duration::from_millis(200)),
            UpdateRate::Max2fps => Some(Duration::from_millis(500)),
            UpdateRate::Max1fps => Some(Duration::from_secs(1)),
            UpdateRate::Never => None,
        }
    }
}

struct Entry<T> {
    work: T,
    interval: Duration,
    /// Scheduler time after which the entry should run again.
    due: Duration,
    last_run: Duration,
    /// Smoothed cost of one run, in seconds.
    cost: f64,
}

/// Spreads periodic work over frames.
///
/// Each piece of work has an interval it wants to run at. Every
/// [`IntervalScheduler::update`], the most overdue work is run first, as long
/// as the frame's cost budget and the expected amount of runs per frame
/// allow. Work is never delayed past `max_interval` since its last run
/// though: when skipping a frame would make it that stale, it runs regardless
/// of the budget.
///
/// The expected amount of runs per frame is estimated from a histogram of the
/// intervals, which keeps the load even when lots of work shares the same
/// interval.
pub struct IntervalScheduler<T> {
    min_interval: Duration,
    max_interval: Duration,
    /// `1 / (max_interval - min_interval)`, in 1/seconds.
    inv_interval_range: f64,
    /// The amount of entries in each interval bucket. Every-frame work isn't
    /// counted, it's always run anyway.
    histogram: [u32; HISTOGRAM_SIZE],
    /// The interval (in seconds) each histogram bucket represents. Spaced
    /// quadratically, as short intervals need finer buckets.
    histogram_slot_values: [f64; HISTOGRAM_SIZE],
    entries: Vec<Entry<T>>,
    /// Sum of every delta passed to [`IntervalScheduler::update`].
    clock: Duration,
    runs_per_frame: f64,
    budget_fraction: f64,
    run_order: Vec<usize>,
}

impl<T: PartialEq> IntervalScheduler<T> {
    /// Creates a scheduler for work with intervals between `min_interval`
    /// and `max_interval`. Longer intervals are clamped to `max_interval`.
    ///
    /// ### Panics
    ///
    /// If `min_interval` is zero, or `max_interval` isn't greater than
    /// `min_interval`.
    #[track_caller]
    pub fn new(min_interval: Duration, max_interval: Duration) -> IntervalScheduler<T> {
        assert!(
            !min_interval.is_zero(),
            "min_interval should be greater than zero",
        );
        assert!(
            max_interval > min_interval,
            "max_interval should be greater than min_interval",
        );

        let range = (max_interval - min_interval).as_secs_f64();
        let mut histogram_slot_values = [0.0; HISTOGRAM_SIZE];
        for (i, value) in histogram_slot_values.iter_mut().enumerate() {
            let x = i as f64 / (HISTOGRAM_SIZE - 1) as f64;
            *value = x * x * range + min_interval.as_secs_f64();
        }

        IntervalScheduler {
            min_interval,
            max_interval,
            inv_interval_range: 1.0 / range,
            histogram: [0; HISTOGRAM_SIZE],
            histogram_slot_values,
            entries: Vec::new(),
            clock: Duration::ZERO,
            runs_per_frame: 0.0,
            budget_fraction: DEFAULT_BUDGET_FRACTION,
            run_order: Vec::new(),
        }
    }

    /// Sets the share of the target frame time the scheduled work should
    /// stay within. Defaults to 0.25.
    ///
    /// ### Panics
    ///
    /// If the fraction isn't a positive number.
    #[track_caller]
    pub fn with_budget_fraction(mut self, budget_fraction: f64) -> IntervalScheduler<T> {
        assert!(
            budget_fraction.is_finite() && budget_fraction > 0.0,
            "budget fraction should be a positive number",
        );
        self.budget_fraction = budget_fraction;
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// Adds the work, or changes its interval if it has already been added.
    /// A zero interval runs the work every frame.
    pub fn add_or_update_work(&mut self, work: T, interval: Duration) {
        let interval = interval.min(self.max_interval);
        if let Some(index) = self.entries.iter().position(|entry| entry.work == work) {
            self.remove_from_histogram(self.entries[index].interval);
            let entry = &mut self.entries[index];
            entry.interval = interval;
            entry.due = entry.due.min(entry.last_run + interval);
        } else {
            self.entries.push(Entry {
                work,
                interval,
                due: self.clock,
                last_run: self.clock,
                cost: 0.0,
            });
        }
        self.add_to_histogram(interval);
    }

    /// Like [`IntervalScheduler::add_or_update_work`], with the interval of
    /// the given rate. [`UpdateRate::Never`] removes the work.
    pub fn add_or_update_work_rate(&mut self, work: T, rate: UpdateRate) {
        match rate.interval() {
            Some(interval) => self.add_or_update_work(work, interval),
            None => {
                self.remove_work(&work);
            }
        }
    }

    /// Removes the work. Returns false if it wasn't scheduled.
    pub fn remove_work(&mut self, work: &T) -> bool {
        let Some(index) = self.entries.iter().position(|entry| entry.work == *work) else {
            return false;
        };
        let entry = self.entries.swap_remove(index);
        self.remove_from_histogram(entry.interval);
        true
    }

    /// The interval of the work, if it's scheduled.
    pub fn interval(&self, work: &T) -> Option<Duration> {
        self.entries
            .iter()
            .find(|entry| entry.work == *work)
            .map(|entry| entry.interval)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.histogram = [0; HISTOGRAM_SIZE];
        self.runs_per_frame = 0.0;
    }

    /// Advances the scheduler by `delta` and calls `run_work` for the work
    /// that should run this frame, along with the time since each one last
    /// ran. The costs of the runs are measured with the platform's clock,
    /// and kept within `target_frame_time` times the budget fraction, except
    /// for work that runs every frame or would get too stale otherwise.
    ///
    /// Staleness is predicted with the assumption that the next frame's
    /// delta is the same as this one's. When deltas vary, work can end up
    /// running at most the difference between the longest and shortest
    /// delta later than `max_interval`.
    pub fn update(
        &mut self,
        platform: &dyn Platform,
        delta: Duration,
        target_frame_time: Duration,
        mut run_work: impl FnMut(&T, Duration),
    ) {
        if delta.is_zero() {
            return;
        }
        profiling::scope!("IntervalScheduler::update");

        self.clock += delta;
        let dt = delta.as_secs_f64();
        let expected_runs = self.expected_runs_per_second(dt) * dt;
        self.runs_per_frame = lerp(self.runs_per_frame, expected_runs, RUNS_PER_FRAME_SMOOTHING);
        let max_optional_runs = (self.runs_per_frame.ceil() as usize).max(1);
        let budget = target_frame_time.mul_f64(self.budget_fraction);

        self.run_order.clear();
        self.run_order.extend(0..self.entries.len());
        let entries = &self.entries;
        self.run_order.sort_by_key(|&index| entries[index].due);

        let mut optional_runs = 0;
        let mut spent = Duration::ZERO;
        for &index in &self.run_order {
            let entry = &mut self.entries[index];
            let since_last_run = self.clock.saturating_sub(entry.last_run);

            // Would be over max_interval by the next update, if the next
            // delta is this one again.
            let mandatory =
                entry.interval.is_zero() || since_last_run + delta > self.max_interval;
            let allowed = entry.due <= self.clock
                && (optional_runs == 0
                    || (optional_runs < max_optional_runs
                        && spent + Duration::from_secs_f64(entry.cost) <= budget));
            if !mandatory && !allowed {
                continue;
            }

            let start = platform.now();
            run_work(&entry.work, since_last_run);
            let cost = platform.now().saturating_duration_since(start);

            entry.cost = lerp(entry.cost, cost.as_secs_f64(), COST_SMOOTHING);
            entry.last_run = self.clock;
            entry.due = self.clock + entry.interval;
            spent += cost;
            if !mandatory {
                optional_runs += 1;
            }
        }
    }

    /// How many runs per second the scheduled work adds up to, not counting
    /// every-frame work.
    fn expected_runs_per_second(&self, dt: f64) -> f64 {
        self.histogram
            .iter()
            .zip(&self.histogram_slot_values)
            .map(|(&count, &interval)| count as f64 / interval.max(dt))
            .sum()
    }

    fn histogram_index(&self, interval: Duration) -> Option<usize> {
        if interval.is_zero() {
            return None;
        }
        let offset = interval.as_secs_f64() - self.min_interval.as_secs_f64();
        let x = offset * self.inv_interval_range;
        let index = (x.max(0.0).sqrt() * (HISTOGRAM_SIZE - 1) as f64).round() as usize;
        Some(index.min(HISTOGRAM_SIZE - 1))
    }

    fn add_to_histogram(&mut self, interval: Duration) {
        if let Some(index) = self.histogram_index(interval) {
            self.histogram[index] += 1;
        }
    }

    fn remove_from_histogram(&mut self, interval: Duration) {
        if let Some(index) = self.histogram_index(interval) {
            self.histogram[index] -= 1;
        }
    }
}

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    from + (to - from) * t
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::sync::Arc;

    use crate::test_platform::TestPlatform;

    use super::{IntervalScheduler, UpdateRate, HISTOGRAM_SIZE};

    const FRAME: Duration = Duration::from_millis(16);

    #[test]
    #[should_panic(expected = "min_interval should be greater than zero")]
    fn zero_min_interval_is_rejected() {
        IntervalScheduler::<u32>::new(Duration::ZERO, Duration::from_secs(1));
    }

    #[test]
    #[should_panic(expected = "max_interval should be greater than min_interval")]
    fn inverted_interval_range_is_rejected() {
        IntervalScheduler::<u32>::new(Duration::from_secs(1), Duration::from_secs(1));
    }

    #[test]
    fn histogram_buckets_cover_the_interval_range() {
        let scheduler =
            IntervalScheduler::<u32>::new(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(None, scheduler.histogram_index(Duration::ZERO));
        assert_eq!(Some(0), scheduler.histogram_index(Duration::from_millis(1)));
        assert_eq!(Some(0), scheduler.histogram_index(Duration::from_millis(10)));
        assert_eq!(
            Some(HISTOGRAM_SIZE - 1),
            scheduler.histogram_index(Duration::from_secs(1)),
        );
        let slots = &scheduler.histogram_slot_values;
        assert!((slots[0] - 0.01).abs() < 1e-9);
        assert!((slots[HISTOGRAM_SIZE - 1] - 1.0).abs() < 1e-9);
        assert!(slots.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn work_management() {
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), Duration::from_secs(1));
        assert!(scheduler.is_empty());

        scheduler.add_or_update_work_rate("physics", UpdateRate::EveryFrame);
        scheduler.add_or_update_work_rate("ai", UpdateRate::Max10fps);
        scheduler.add_or_update_work("audio", Duration::from_secs(5));
        assert_eq!(3, scheduler.len());
        assert_eq!(Some(Duration::ZERO), scheduler.interval(&"physics"));
        assert_eq!(Some(Duration::from_secs(1)), scheduler.interval(&"audio"));

        scheduler.add_or_update_work_rate("ai", UpdateRate::Max2fps);
        assert_eq!(3, scheduler.len());
        assert_eq!(Some(Duration::from_millis(500)), scheduler.interval(&"ai"));

        scheduler.add_or_update_work_rate("ai", UpdateRate::Never);
        assert_eq!(None, scheduler.interval(&"ai"));
        assert!(scheduler.remove_work(&"audio"));
        assert!(!scheduler.remove_work(&"audio"));
        assert_eq!(1, scheduler.len());
        assert_eq!(0, scheduler.histogram.iter().sum::<u32>());

        scheduler.clear();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn zero_delta_runs_nothing() {
        let platform = TestPlatform::new(1);
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), Duration::from_secs(1));
        scheduler.add_or_update_work_rate(0, UpdateRate::EveryFrame);
        let mut runs = 0;
        scheduler.update(&platform, Duration::ZERO, FRAME, |_, _| runs += 1);
        assert_eq!(0, runs);
    }

    #[test]
    fn every_frame_work_runs_every_frame() {
        let platform = TestPlatform::new(1);
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), Duration::from_secs(1));
        scheduler.add_or_update_work_rate(0, UpdateRate::EveryFrame);
        scheduler.add_or_update_work_rate(1, UpdateRate::EveryFrame);
        let mut runs = 0;
        for _ in 0..10 {
            scheduler.update(&platform, FRAME, FRAME, |_, _| runs += 1);
        }
        assert_eq!(20, runs);
    }

    #[test]
    fn rate_limited_work_runs_at_its_rate() {
        let platform = TestPlatform::new(1);
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), Duration::from_secs(1));
        scheduler.add_or_update_work_rate(0, UpdateRate::Max10fps);
        let mut runs = 0;
        // 60 frames of 16ms, just under a second.
        for _ in 0..60 {
            scheduler.update(&platform, FRAME, FRAME, |_, since_last_run| {
                assert!(since_last_run <= Duration::from_millis(120));
                runs += 1;
            });
        }
        assert!((8..=10).contains(&runs), "ran {runs} times");
    }

    #[test]
    fn budget_limits_optional_runs() {
        let platform = Arc::new(TestPlatform::new(1));
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), Duration::from_secs(1));
        for work in 0..10 {
            scheduler.add_or_update_work_rate(work, UpdateRate::Max1fps);
        }

        // Each run takes 10ms of a 4ms budget, so only the first due entry
        // gets to run each frame.
        let mut runs_per_frame = Vec::new();
        for _ in 0..5 {
            let mut runs = 0;
            scheduler.update(&*platform, FRAME, FRAME, |_, _| {
                platform.advance(Duration::from_millis(10));
                runs += 1;
            });
            runs_per_frame.push(runs);
        }
        assert_eq!(vec![1; 5], runs_per_frame);
    }

    #[test]
    fn staleness_is_bounded_under_budget_pressure() {
        let platform = Arc::new(TestPlatform::new(1));
        let max_interval = Duration::from_millis(500);
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), max_interval);
        let rates = [
            UpdateRate::Max30fps,
            UpdateRate::Max20fps,
            UpdateRate::Max10fps,
            UpdateRate::Max5fps,
            UpdateRate::Max2fps,
            UpdateRate::Max1fps,
        ];
        for work in 0..120 {
            scheduler.add_or_update_work_rate(work, rates[work % rates.len()]);
        }

        let mut last_runs = vec![None; 120];
        let mut frame_start = Duration::ZERO;
        for frame in 0..500 {
            frame_start += FRAME;
            scheduler.update(&*platform, FRAME, FRAME, |&work, since_last_run| {
                // Every run blows most of the frame's budget.
                platform.advance(Duration::from_millis(3));
                assert!(
                    since_last_run <= max_interval,
                    "work {work} was {since_last_run:?} stale on frame {frame}",
                );
                last_runs[work] = Some(frame_start);
            });
        }

        for (work, last_run) in last_runs.into_iter().enumerate() {
            let last_run = last_run.unwrap_or_default();
            assert!(
                frame_start - last_run <= max_interval,
                "work {work} last ran at {last_run:?}, the last frame was at {frame_start:?}",
            );
        }
    }

    #[test]
    fn staleness_overshoot_is_bounded_by_delta_variation() {
        let platform = Arc::new(TestPlatform::new(1));
        let max_interval = Duration::from_millis(200);
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(1), max_interval);
        for work in 0..60 {
            scheduler.add_or_update_work_rate(work, UpdateRate::Max5fps);
        }

        let deltas = [4, 16, 40, 8, 40, 4].map(Duration::from_millis);
        let overshoot = Duration::from_millis(40 - 4);
        let mut runs = 0;
        for frame in 0..600 {
            let delta = deltas[frame % deltas.len()];
            scheduler.update(&*platform, delta, FRAME, |&work, since_last_run| {
                platform.advance(Duration::from_millis(3));
                assert!(
                    since_last_run <= max_interval + overshoot,
                    "work {work} was {since_last_run:?} stale on frame {frame}",
                );
                runs += 1;
            });
        }
        assert!(runs > 0);
    }
}
