use crate::bus::DriverError;

bitflags::bitflags! {
    /// Outcome flags of a bus operation
    ///
    /// Each flag is one independent failure category. The empty set means success, but engine
    /// operations only ever hand out a non-empty set, wrapped in `Err`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct I2cStatus: u8 {
        /// The engine has no arena
        const DEACTIVATED   = 1 << 0;
        const INVALID_INPUT = 1 << 1;
        /// Generic low level driver failure
        const DRIVER_ERROR  = 1 << 2;
        const LOCKED_BUS    = 1 << 3;
        const TIMED_OUT     = 1 << 4;
        /// Address not acknowledged
        const NAK           = 1 << 5;
        /// Malformed peripheral response, after the retry was spent
        const INVALID_READ  = 1 << 6;
        const QUEUE_FULL    = 1 << 7;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for I2cStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "I2cStatus({=u8:#04x})", self.bits())
    }
}

impl From<DriverError> for I2cStatus {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Nak => I2cStatus::NAK,
            DriverError::Timeout => I2cStatus::TIMED_OUT,
            DriverError::Driver | DriverError::Busy => I2cStatus::DRIVER_ERROR,
        }
    }
}

/// Diagnostic code naming the internal step that produced an error
///
/// The high nibble groups codes by subsystem: `0x1_` public entry points, `0x2_` peripheral
/// initiated reads, `0x3_` host requests, `0x4_` bus recovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Callsite {
    Process = 0x10,
    EnqueueRead = 0x11,
    EnqueueWrite = 0x12,
    Ack = 0x13,
    Read = 0x14,
    Write = 0x15,
    SetAddress = 0x16,

    RxSwitchToResponseBuffer = 0x21,
    RxReadLength = 0x22,
    RxProcessLength = 0x23,
    RxReadExtraData = 0x24,
    RxProcessExtraData = 0x25,
    RxClearIrq = 0x26,
    RxCheckComplete = 0x27,

    XferDequeueAndAct = 0x31,
    XferRxCheckComplete = 0x32,
    XferTxCheckComplete = 0x33,

    LockedBus = 0x40,
    BusRecovery = 0x41,
}

impl Callsite {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Error type for an unknown callsite code
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnknownCallsite(pub u8);

impl TryFrom<u8> for Callsite {
    type Error = UnknownCallsite;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use Callsite::*;
        Ok(match code {
            0x10 => Process,
            0x11 => EnqueueRead,
            0x12 => EnqueueWrite,
            0x13 => Ack,
            0x14 => Read,
            0x15 => Write,
            0x16 => SetAddress,
            0x21 => RxSwitchToResponseBuffer,
            0x22 => RxReadLength,
            0x23 => RxProcessLength,
            0x24 => RxReadExtraData,
            0x25 => RxProcessExtraData,
            0x26 => RxClearIrq,
            0x27 => RxCheckComplete,
            0x31 => XferDequeueAndAct,
            0x32 => XferRxCheckComplete,
            0x33 => XferTxCheckComplete,
            0x40 => LockedBus,
            0x41 => BusRecovery,
            _ => return Err(UnknownCallsite(code)),
        })
    }
}

impl From<Callsite> for u8 {
    fn from(c: Callsite) -> Self {
        c.code()
    }
}

/// Running count of reported errors, one counter per status flag
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCounters {
    counts: [u16; 8],
}

impl ErrorCounters {
    pub const fn new() -> Self {
        ErrorCounters { counts: [0; 8] }
    }

    /// Bumps the counter of every flag set in `status`
    pub fn record(&mut self, status: I2cStatus) {
        for (bit, count) in self.counts.iter_mut().enumerate() {
            if status.bits() & (1 << bit) != 0 {
                *count = count.saturating_add(1);
            }
        }
    }

    /// Returns the count for a single flag
    ///
    /// If `flag` has several bits set, the largest of their counts is returned.
    pub fn get(&self, flag: I2cStatus) -> u16 {
        self.counts
            .iter()
            .enumerate()
            .filter(|(bit, _)| flag.bits() & (1 << bit) != 0)
            .map(|(_, c)| *c)
            .max()
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.counts = [0; 8];
    }
}
