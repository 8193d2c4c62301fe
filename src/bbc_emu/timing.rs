//! Cycle-granular timing wheel.
//!
//! One scheduler drives the CPU and every peripheral in lockstep.  The
//! master clock ticks at 2 MHz (the CPU rate); 1 MHz peripherals store
//! their countdowns pre-doubled so the half-tick phase between the
//! peripheral bus and the CPU is expressible without fractions.
//!
//! Unlike a closure-based event queue, timers here are registered once,
//! up front, and identified by a small id.  `advance` reports which
//! timers fired (in registration order) and the owner reacts; this keeps
//! the wheel free of borrows into the chips it is clocking.

use log::trace;

/// Master-clock tick count (signed so overdue countdowns are representable).
pub type Tick = i64;

/// Master clock rate: 2 MHz, twice the 1 MHz peripheral bus.
pub const TICK_RATE: u64 = 2_000_000;

/// Cap returned by `next_deadline` when nothing is due; generous but far
/// from overflowing the countdown arithmetic.
const MAX_DEADLINE: Tick = 1 << 30;

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

struct Timer {
    /// Counting at all.  A stopped timer holds its value.
    armed: bool,
    /// Reported from `advance` when the countdown reaches zero.  A
    /// non-firing timer still decrements; it just never preempts.
    firing: bool,
    /// Ticks until the timer is due.  Negative means overdue.
    value: Tick,
}

pub struct Timing {
    /// Monotonic tick counter since power-on.
    total_ticks: u64,
    /// Registration order is firing order for same-tick deadlines.
    timers: Vec<Timer>,
}

impl Timing {
    pub fn new() -> Self {
        Self {
            total_ticks: 0,
            timers: Vec::new(),
        }
    }

    pub fn tick_rate(&self) -> u64 {
        TICK_RATE
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Register a timer slot.  All registration happens at machine
    /// construction; the returned id is stable for the machine's life.
    pub fn register(&mut self) -> TimerId {
        self.timers.push(Timer {
            armed: false,
            firing: false,
            value: 0,
        });
        TimerId(self.timers.len() - 1)
    }

    /// Arm a timer `countdown` ticks from now, firing.
    pub fn start(&mut self, id: TimerId, countdown: Tick) {
        assert!(countdown >= 0, "timer armed in the past: {countdown}");
        let t = &mut self.timers[id.0];
        t.armed = true;
        t.firing = true;
        t.value = countdown;
    }

    /// Freeze a timer.  Its value stops decrementing but is retained
    /// (pulse-counting peripherals suspend and later resume).
    pub fn stop(&mut self, id: TimerId) {
        self.timers[id.0].armed = false;
    }

    /// Un-freeze a stopped timer without touching its value or firing
    /// state; the countdown continues from wherever `stop` left it.
    pub fn resume(&mut self, id: TimerId) {
        self.timers[id.0].armed = true;
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.timers[id.0].armed
    }

    /// A non-firing timer keeps counting but is excluded from deadlines
    /// and never reported by `advance`.
    pub fn set_firing(&mut self, id: TimerId, on: bool) {
        self.timers[id.0].firing = on;
    }

    /// Replace the countdown, relative to now.
    pub fn set_value(&mut self, id: TimerId, value: Tick) {
        let t = &mut self.timers[id.0];
        t.value = value;
    }

    /// Current countdown.  Negative values mean the deadline passed while
    /// the owner wasn't looking (e.g. interrupts masked); the owner fixes
    /// those up with its own re-latch policy.
    pub fn value(&self, id: TimerId) -> Tick {
        let t = &self.timers[id.0];
        t.value
    }

    /// Ticks the CPU may run before the next firing timer is due.
    /// Non-negative: an overdue firing timer yields 0.
    pub fn next_deadline(&self) -> Tick {
        let mut deadline = MAX_DEADLINE;
        for t in &self.timers {
            if t.armed && t.firing && t.value < deadline {
                deadline = t.value;
            }
        }
        deadline.max(0)
    }

    /// Move time forward by `n` ticks.  Every armed countdown drops by
    /// `n`; timers that are due (value <= 0) and firing are reported once,
    /// in registration order.  Owners re-arm or silence them before the
    /// next advance.
    pub fn advance(&mut self, n: Tick) -> Vec<TimerId> {
        assert!(n >= 0, "time went backwards: {n}");
        self.total_ticks += n as u64;

        let mut fired = Vec::new();
        for (i, t) in self.timers.iter_mut().enumerate() {
            if !t.armed {
                continue;
            }
            t.value -= n;
            if t.firing && t.value <= 0 {
                trace!("timer {i} fired at tick {}", self.total_ticks);
                fired.push(TimerId(i));
            }
        }
        fired
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn deadline_tracks_minimum() {
        let mut w = Timing::new();
        let a = w.register();
        let b = w.register();
        w.start(a, 100);
        w.start(b, 40);
        assert_eq!(w.next_deadline(), 40);
        assert!(w.advance(40).contains(&b));
        assert_eq!(w.value(a), 60);
    }

    #[test]
    fn non_firing_timer_decrements_silently() {
        let mut w = Timing::new();
        let a = w.register();
        w.start(a, 10);
        w.set_firing(a, false);
        assert_eq!(w.next_deadline(), MAX_DEADLINE);
        assert!(w.advance(25).is_empty());
        assert_eq!(w.value(a), -15);
    }

    #[test]
    fn stopped_timer_holds_value() {
        let mut w = Timing::new();
        let a = w.register();
        w.start(a, 10);
        w.stop(a);
        assert!(w.advance(8).is_empty());
        assert_eq!(w.value(a), 10);
    }

    #[test]
    fn same_tick_fires_in_registration_order() {
        let mut w = Timing::new();
        let a = w.register();
        let b = w.register();
        w.start(b, 6);
        w.start(a, 6);
        assert_eq!(w.advance(6), vec![a, b]);
    }

    #[test]
    fn overdue_firing_timer_clamps_deadline_to_zero() {
        let mut w = Timing::new();
        let a = w.register();
        w.start(a, 4);
        w.advance(9);
        assert_eq!(w.next_deadline(), 0);
    }

    #[test]
    #[should_panic(expected = "armed in the past")]
    fn arming_in_the_past_is_fatal() {
        let mut w = Timing::new();
        let a = w.register();
        w.start(a, -1);
    }

    proptest! {
        /// Over any sequence of advances, `next_deadline` is non-negative
        /// and equals the minimum armed-firing countdown.
        #[test]
        fn deadline_monotonicity(steps in proptest::collection::vec(0i64..5000, 1..64)) {
            let mut w = Timing::new();
            let ids = [w.register(), w.register(), w.register()];
            w.start(ids[0], 7000);
            w.start(ids[1], 3000);
            w.start(ids[2], 1000);
            w.set_firing(ids[2], false);

            for n in steps {
                let d = w.next_deadline();
                prop_assert!(d >= 0);
                let min = ids
                    .iter()
                    .filter(|&&id| w.is_armed(id))
                    .filter(|&&id| id != ids[2])
                    .map(|&id| w.value(id))
                    .min()
                    .unwrap_or(MAX_DEADLINE);
                prop_assert_eq!(d, min.max(0));
                for id in w.advance(n) {
                    // Re-arm to keep the wheel busy, never in the past.
                    w.start(id, 2048);
                }
            }
        }
    }
}
