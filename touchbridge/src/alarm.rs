/// A point in time on a free-running 32-bit millisecond counter
///
/// The counter is expected to wrap. All comparisons go through [`Instant::elapsed_since`], which
/// uses modular arithmetic, so an interval is measured correctly across the overflow as long as
/// it is shorter than 2^32 ms.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instant(u32);

impl Instant {
    pub const fn from_millis(ms: u32) -> Instant {
        Instant(ms)
    }

    pub const fn as_millis(self) -> u32 {
        self.0
    }

    /// Milliseconds from `earlier` to `self`, modulo 2^32
    pub fn elapsed_since(self, earlier: Instant) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl core::ops::Add<u32> for Instant {
    type Output = Self;
    fn add(self, rhs: u32) -> Self::Output {
        Instant(self.0.wrapping_add(rhs))
    }
}

impl core::ops::AddAssign<u32> for Instant {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl From<Instant> for u32 {
    fn from(t: Instant) -> Self {
        t.0
    }
}

/// Trait representing a monotonic millisecond time source
pub trait Clock {
    /// Current value of the millisecond counter
    fn now(&self) -> Instant;
}

impl<T> Clock for &T
where
    T: Clock,
{
    fn now(&self) -> Instant {
        (*self).now()
    }
}

/// What an alarm does once it has been observed as elapsed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlarmKind {
    /// Stays armed; keeps reporting elapsed until disarmed or re-armed
    Continuous,
    /// Disarms itself the first time it reports elapsed
    SingleShot,
}

/// Countdown alarm
///
/// Alarms hold no reference to a clock; every time-dependent operation takes the current
/// [`Instant`]. A disarmed alarm never reports elapsed.
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Alarm {
    start: Instant,
    duration: u32,
    armed: bool,
    kind: AlarmKind,
}

impl Alarm {
    /// Creates a disarmed alarm
    pub const fn new() -> Self {
        Alarm {
            start: Instant(0),
            duration: 0,
            armed: false,
            kind: AlarmKind::SingleShot,
        }
    }

    /// Starts counting `duration_ms` from `now`
    ///
    /// Re-arming an armed alarm restarts it.
    pub fn arm(&mut self, now: Instant, duration_ms: u32, kind: AlarmKind) {
        self.start = now;
        self.duration = duration_ms;
        self.kind = kind;
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Extends an armed alarm by `extra_ms`, saturating
    pub fn snooze(&mut self, extra_ms: u32) {
        if self.armed {
            self.duration = self.duration.saturating_add(extra_ms);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Checks the alarm against `now`
    ///
    /// A single shot alarm disarms itself when this returns `true`. A zero duration alarm
    /// elapses on the first check.
    pub fn has_elapsed(&mut self, now: Instant) -> bool {
        if !self.armed {
            return false;
        }
        let elapsed = now.elapsed_since(self.start) >= self.duration;
        if elapsed && self.kind == AlarmKind::SingleShot {
            self.armed = false;
        }
        elapsed
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Self::new()
    }
}
