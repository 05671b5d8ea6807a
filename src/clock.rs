use crate::CancellationToken;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Something which records the elapsed real time and lets a task wait.
///
/// This uses shared references because one clock is shared between every
/// actuator task in a run.
pub trait Clock: Send + Sync {
    /// The amount of time that has passed since a clock-specific reference
    /// point (e.g. when the clock was created).
    fn elapsed(&self) -> Duration;

    /// Block the current task for `duration`.
    fn sleep(&self, duration: Duration);
}

impl<'a, C: Clock + ?Sized> Clock for &'a C {
    fn elapsed(&self) -> Duration { (*self).elapsed() }

    fn sleep(&self, duration: Duration) { (*self).sleep(duration) }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn elapsed(&self) -> Duration { (**self).elapsed() }

    fn sleep(&self, duration: Duration) { (**self).sleep(duration) }
}

/// A monotonically non-decreasing clock backed by the operating system.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatingSystemClock {
    created_at: Instant,
}

impl OperatingSystemClock {
    pub fn new() -> OperatingSystemClock { OperatingSystemClock::default() }
}

impl Clock for OperatingSystemClock {
    fn elapsed(&self) -> Duration { self.created_at.elapsed() }

    fn sleep(&self, duration: Duration) { thread::sleep(duration) }
}

impl Default for OperatingSystemClock {
    fn default() -> OperatingSystemClock {
        OperatingSystemClock {
            created_at: Instant::now(),
        }
    }
}

/// A clock which only moves forward when somebody sleeps on it.
///
/// Sleeping never blocks, which lets a multi-second dwell or pause complete
/// instantly. Concurrent sleepers all advance the same counter, so the
/// reported time is only meaningful as an ordering hint.
#[derive(Debug, Default)]
pub struct SimulatedClock {
    nanos: AtomicU64,
}

impl SimulatedClock {
    pub fn new() -> SimulatedClock { SimulatedClock::default() }

    /// The total time every sleeper has asked for so far.
    pub fn slept(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl Clock for SimulatedClock {
    fn elapsed(&self) -> Duration { self.slept() }

    fn sleep(&self, duration: Duration) {
        let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
        // let the other actuator threads make progress
        thread::yield_now();
    }
}

/// Sleep for `duration` in slices no longer than `slice`, checking `token`
/// between slices.
///
/// Returns `false` if the wait was cut short by cancellation.
pub(crate) fn sleep_unless_cancelled<C: Clock + ?Sized>(
    clock: &C,
    duration: Duration,
    slice: Duration,
    token: &CancellationToken,
) -> bool {
    let slice = if slice == Duration::new(0, 0) {
        duration
    } else {
        slice
    };
    let mut remaining = duration;

    loop {
        if token.is_cancelled() {
            return false;
        }
        if remaining == Duration::new(0, 0) {
            return true;
        }

        let nap = remaining.min(slice);
        clock.sleep(nap);
        remaining -= nap;
    }
}
