use crate::alarm::{Alarm, AlarmKind, Instant};
use crate::bus::{DriverError, DriverResult};

/// Condition of the bus as judged by the [`LockedBusMonitor`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusHealth {
    Healthy,
    /// Busy persisted past the detection window; recovery is in progress
    Locked { attempts: u8 },
    /// Every recovery attempt was spent. The engine stops trying; a device reset is up to the
    /// caller.
    Exhausted,
}

/// Tracks sustained busy conditions and paces recovery attempts
#[derive(Clone, Debug)]
pub struct LockedBusMonitor {
    detect: Alarm,
    recover: Alarm,
    attempts: u8,
    locked: bool,
    detect_ms: u32,
    interval_ms: u32,
    max_attempts: u8,
}

impl LockedBusMonitor {
    pub const fn new(detect_ms: u32, interval_ms: u32, max_attempts: u8) -> Self {
        LockedBusMonitor {
            detect: Alarm::new(),
            recover: Alarm::new(),
            attempts: 0,
            locked: false,
            detect_ms,
            interval_ms,
            max_attempts,
        }
    }

    /// Back to defaults, keeping the configuration
    pub fn reset(&mut self) {
        self.detect.disarm();
        self.recover.disarm();
        self.attempts = 0;
        self.locked = false;
    }

    /// Feeds the result of a low level bus operation
    ///
    /// Returns `true` when this observation flipped the monitor into the locked state.
    pub fn observe(&mut self, now: Instant, result: DriverResult) -> bool {
        match result {
            Ok(()) => {
                if self.locked || self.detect.is_armed() {
                    self.reset();
                }
                false
            }
            Err(DriverError::Busy) => {
                if self.locked {
                    return false;
                }
                if !self.detect.is_armed() {
                    self.detect.arm(now, self.detect_ms, AlarmKind::Continuous);
                    false
                } else if self.detect.has_elapsed(now) {
                    self.detect.disarm();
                    self.locked = true;
                    self.recover
                        .arm(now, self.interval_ms, AlarmKind::SingleShot);
                    true
                } else {
                    false
                }
            }
            Err(_) => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn recovery_attempts(&self) -> u8 {
        self.attempts
    }

    /// No more recovery attempts will be made
    pub fn is_exhausted(&self) -> bool {
        self.locked && self.attempts >= self.max_attempts
    }

    /// Whether the next recovery attempt should run now
    pub fn recovery_due(&mut self, now: Instant) -> bool {
        self.locked && !self.is_exhausted() && self.recover.has_elapsed(now)
    }

    /// Counts a recovery attempt and schedules the next one
    pub fn begin_recovery(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.recover
            .arm(now, self.interval_ms, AlarmKind::SingleShot);
    }

    pub fn health(&self) -> BusHealth {
        if !self.locked {
            BusHealth::Healthy
        } else if self.is_exhausted() {
            BusHealth::Exhausted
        } else {
            BusHealth::Locked {
                attempts: self.attempts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u32) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn sustained_busy_locks() {
        let mut m = LockedBusMonitor::new(10, 5, 3);
        assert!(!m.observe(at(0), Err(DriverError::Busy)));
        assert!(!m.observe(at(9), Err(DriverError::Busy)));
        assert!(!m.is_locked());
        assert!(m.observe(at(10), Err(DriverError::Busy)));
        assert!(m.is_locked());
        assert_eq!(m.health(), BusHealth::Locked { attempts: 0 });
    }

    #[test]
    fn other_errors_do_not_lock_or_clear() {
        let mut m = LockedBusMonitor::new(10, 5, 3);
        m.observe(at(0), Err(DriverError::Busy));
        m.observe(at(5), Err(DriverError::Nak));
        assert!(m.observe(at(10), Err(DriverError::Busy)));
    }

    #[test]
    fn success_resets_everything() {
        let mut m = LockedBusMonitor::new(10, 5, 3);
        m.observe(at(0), Err(DriverError::Busy));
        m.observe(at(10), Err(DriverError::Busy));
        assert!(!m.recovery_due(at(14)));
        assert!(m.recovery_due(at(15)));
        m.begin_recovery(at(15));
        assert_eq!(m.recovery_attempts(), 1);
        m.observe(at(16), Ok(()));
        assert!(!m.is_locked());
        assert_eq!(m.recovery_attempts(), 0);
        assert_eq!(m.health(), BusHealth::Healthy);
        // Detection starts over
        assert!(!m.observe(at(20), Err(DriverError::Busy)));
    }

    #[test]
    fn attempts_exhaust() {
        let mut m = LockedBusMonitor::new(0, 5, 2);
        m.observe(at(0), Err(DriverError::Busy));
        assert!(m.observe(at(0), Err(DriverError::Busy)));
        let mut now = 0;
        for _ in 0..2 {
            now += 5;
            assert!(m.recovery_due(at(now)));
            m.begin_recovery(at(now));
        }
        assert!(m.is_exhausted());
        assert_eq!(m.health(), BusHealth::Exhausted);
        assert!(!m.recovery_due(at(now + 100)));
    }
}
