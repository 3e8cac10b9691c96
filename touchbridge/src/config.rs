use crate::bus::PACKET_HEADER_SIZE;
use crate::transfer_queue::RECORD_SIZE;

/// Engine tuning
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Peripheral address used until `set_slave_address` is called
    pub default_address: u8,
    /// Nominal bus clock, used to scale operation timeouts with the byte count
    pub bus_clock_hz: u32,
    /// Fixed part of an operation timeout when the caller passes a zero budget
    pub base_timeout_ms: u32,
    /// How long busy must persist before the bus is declared locked
    pub locked_detect_ms: u32,
    /// Pause between recovery attempts on a locked bus
    pub recovery_interval_ms: u32,
    pub max_recovery_attempts: u8,
}

impl EngineConfig {
    pub const fn new() -> Self {
        EngineConfig {
            default_address: 0x24,
            bus_clock_hz: 400_000,
            base_timeout_ms: 20,
            locked_detect_ms: 100,
            recovery_interval_ms: 50,
            max_recovery_attempts: 10,
        }
    }

    /// Bus time, rounded up to whole milliseconds, to move `bytes` bytes plus the address byte
    pub fn transfer_time_ms(&self, bytes: usize) -> u32 {
        let clock = self.bus_clock_hz.max(1) as u64;
        let bits = (bytes as u64 + 1) * 9;
        let ms = (bits * 1000).div_ceil(clock);
        ms.min(u32::MAX as u64) as u32
    }

    /// Budget used when a caller asks for the default timeout
    pub fn default_timeout_ms(&self) -> u32 {
        self.base_timeout_ms
            .saturating_add(self.transfer_time_ms(PACKET_HEADER_SIZE))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How an activation arena is split up
///
/// The arena holds the host request queue (record table and payload bytes) followed by the
/// receive buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArenaLayout {
    pub max_records: usize,
    pub payload_bytes: usize,
    pub rx_bytes: usize,
}

impl ArenaLayout {
    /// Normal translator operation: several queued requests, full size packets
    pub const TOUCH: ArenaLayout = ArenaLayout {
        max_records: 8,
        payload_bytes: 512,
        rx_bytes: PACKET_HEADER_SIZE + 254,
    };

    /// Firmware update pass-through: one subchunk in flight, short status replies
    pub const UPDATE: ArenaLayout = ArenaLayout {
        max_records: 2,
        payload_bytes: 160,
        rx_bytes: PACKET_HEADER_SIZE + 14,
    };

    pub const fn required_bytes(&self) -> usize {
        self.max_records * RECORD_SIZE + self.payload_bytes + self.rx_bytes
    }

    /// A layout the engine can run with
    pub const fn is_valid(&self) -> bool {
        self.max_records > 0
            && self.payload_bytes > 1
            && self.payload_bytes <= u16::MAX as usize
            && self.rx_bytes > PACKET_HEADER_SIZE
    }
}
