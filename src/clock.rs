//! The fixed-rate timing driver.
//!
//! [`FrameClock`] owns the schedule of logic ticks: the game loop asks it
//! how many simulation steps are due and calls the scheduler once per step.
//! When the loop falls behind (debugger pause, OS hiccup), due ticks are
//! handed out in bounded bursts: logic frames are coalesced across calls
//! but never dropped, while the caller is free to skip display updates for
//! all but the last tick of a burst.

use web_time::{Duration, Instant};

/// A monotonic fixed-rate clock measuring due simulation ticks.
#[derive(Debug, Clone)]
pub struct FrameClock {
    period: Duration,
    next_tick: Instant,
    max_burst: u32,
}

impl FrameClock {
    /// Creates a clock at the given rate.
    ///
    /// `max_burst` bounds how many ticks one [`FrameClock::due_ticks`] call
    /// returns; the remainder stays due for the next call.
    #[must_use]
    pub fn new(frame_rate_hz: u32, max_burst: u32) -> Self {
        let hz = frame_rate_hz.max(1);
        FrameClock {
            period: Duration::from_nanos(1_000_000_000 / u64::from(hz)),
            next_tick: Instant::now(),
            max_burst: max_burst.max(1),
        }
    }

    /// The duration of one simulation frame.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Re-anchors the schedule at `now`, forgetting any backlog. Used after
    /// intentional pauses where catching up would be wrong (e.g. while a
    /// joining client waits for its snapshot).
    pub fn reset(&mut self, now: Instant) {
        self.next_tick = now;
    }

    /// Number of logic ticks to run now, at most `max_burst` per call.
    ///
    /// Every returned tick advances the schedule by one period; backlog
    /// beyond the burst limit remains due, so logic frames are delayed but
    /// never lost.
    pub fn due_ticks(&mut self, now: Instant) -> u32 {
        let mut due = 0;
        while due < self.max_burst && self.next_tick <= now {
            self.next_tick += self.period;
            due += 1;
        }
        due
    }

    /// Time until the next tick is due, or zero if it is already due.
    #[must_use]
    pub fn until_next_tick(&self, now: Instant) -> Duration {
        self.next_tick.saturating_duration_since(now)
    }
}

// #########
// # TESTS #
// #########
