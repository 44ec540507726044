// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

#[allow(unused_imports)] // used in docs
use crate::Platform;

/// Analogous to the standard library `Instant` type, representing a point in
/// time, as returned by [`Platform::now`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Debug for Instant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if *self >= Instant::reference() {
            f.debug_tuple("Instant")
                .field(&self.saturating_duration_since(Instant::reference()))
                .field(&"after reference point")
                .finish()
        } else {
            f.debug_tuple("Instant")
                .field(&Instant::reference().saturating_duration_since(*self))
                .field(&"before reference point")
                .finish()
        }
    }
}

impl Instant {
    /// An arbitrary point in time to use as a starting point for other
    /// instances of [`Instant`].
    ///
    /// Generally intended to be used once in the platform implementation. Use
    /// [`Platform::now`] to get the current point in time.
    pub const fn reference() -> Instant {
        Instant(Duration::from_secs(u64::MAX / 2))
    }

    /// Returns the duration from `past_instant` to `self`.
    ///
    /// Returns None if `past_instant` is after `self`.
    pub fn duration_since(self, past_instant: Instant) -> Option<Duration> {
        self.0.checked_sub(past_instant.0)
    }

    /// Returns the duration from `past_instant` to `self`, or zero if
    /// `past_instant` is after `self`.
    ///
    /// Useful for measuring how long something took, where a clock going
    /// backwards should just count as "no time at all."
    pub fn saturating_duration_since(self, past_instant: Instant) -> Duration {
        self.0.saturating_sub(past_instant.0)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Self::Output {
        Instant(self.0 - rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Self::Output {
        Instant(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::Instant;

    #[test]
    fn duration_since_is_none_for_future_instants() {
        let earlier = Instant::reference();
        let later = earlier + Duration::from_millis(5);
        assert_eq!(Some(Duration::from_millis(5)), later.duration_since(earlier));
        assert_eq!(None, earlier.duration_since(later));
        assert_eq!(Duration::ZERO, earlier.saturating_duration_since(later));
    }
}
