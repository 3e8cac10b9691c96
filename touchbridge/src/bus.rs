/// Failure reported by a [`BusDriver`] primitive
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DriverError {
    /// Address not acknowledged
    Nak,
    /// Generic driver or peripheral failure
    Driver,
    /// The driver gave up waiting on the hardware
    Timeout,
    /// The bus is busy or the peripheral block is not ready
    Busy,
}

/// Result of a single [`BusDriver`] primitive
pub type DriverResult = Result<(), DriverError>;

/// Trait representing the two-wire bus master hardware
///
/// The engine is the only user of the bus while it is activated. Transfers are issued with
/// [`write`](BusDriver::write) and [`read`](BusDriver::read), then completion is observed with
/// [`poll_ready`](BusDriver::poll_ready). A `read` fills `buffer` before it returns; the engine
/// does not look at the data until the bus reports ready.
pub trait BusDriver {
    /// Issue a write of `data` to the 7-bit address `address`
    fn write(&mut self, address: u8, data: &[u8]) -> DriverResult;

    /// Issue a read of `buffer.len()` bytes from `address`
    ///
    /// A zero length read only addresses the device.
    fn read(&mut self, address: u8, buffer: &mut [u8]) -> DriverResult;

    /// Check whether the bus is idle and the last transfer finished cleanly
    ///
    /// Must return `Err(DriverError::Busy)` while a transfer is in flight or the bus is held,
    /// and the last transfer's failure otherwise.
    fn poll_ready(&mut self) -> DriverResult;

    /// Sample the peripheral's data ready line
    fn is_interrupt_asserted(&mut self) -> bool;

    /// Reset and reconfigure the bus master block
    fn reinitialize(&mut self);

    /// Clear any latched status in the bus master block
    fn clear_status(&mut self);
}

impl<T> BusDriver for &mut T
where
    T: BusDriver,
{
    fn write(&mut self, address: u8, data: &[u8]) -> DriverResult {
        (**self).write(address, data)
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> DriverResult {
        (**self).read(address, buffer)
    }

    fn poll_ready(&mut self) -> DriverResult {
        (**self).poll_ready()
    }

    fn is_interrupt_asserted(&mut self) -> bool {
        (**self).is_interrupt_asserted()
    }

    fn reinitialize(&mut self) {
        (**self).reinitialize()
    }

    fn clear_status(&mut self) {
        (**self).clear_status()
    }
}

/// Highest valid 7-bit address
pub const MAX_ADDRESS: u8 = 0x7F;

/// Length of the `{command, length}` packet header
pub const PACKET_HEADER_SIZE: usize = 2;
/// Reserved length byte marking an invalid packet
pub const INVALID_LENGTH: u8 = 0xFF;
/// Command bits of the header's first byte; bit 7 is reserved
pub const COMMAND_MASK: u8 = 0x7F;
/// Reserved command value meaning "no command"
pub const INVALID_COMMAND: u8 = 0x00;

/// Transfer direction, as encoded in the low bit of a [`TransferDescriptor`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Write,
    Read,
}

/// Packed `{7-bit address, direction}` byte leading every queued host request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferDescriptor(u8);

impl TransferDescriptor {
    const DIRECTION_READ: u8 = 0x01;

    /// Returns `None` for an address above [`MAX_ADDRESS`]
    pub const fn new(address: u8, direction: Direction) -> Option<Self> {
        if address > MAX_ADDRESS {
            return None;
        }
        let dir = match direction {
            Direction::Write => 0,
            Direction::Read => Self::DIRECTION_READ,
        };
        Some(TransferDescriptor(address << 1 | dir))
    }

    pub const fn from_byte(b: u8) -> Self {
        TransferDescriptor(b)
    }

    pub const fn to_byte(self) -> u8 {
        self.0
    }

    pub const fn address(self) -> u8 {
        self.0 >> 1
    }

    pub const fn direction(self) -> Direction {
        if self.0 & Self::DIRECTION_READ != 0 {
            Direction::Read
        } else {
            Direction::Write
        }
    }
}

/// Peripheral buffer targeted by subsequent reads
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum BufferSelector {
    Command = 0x00,
    Response = 0x01,
}

impl BufferSelector {
    /// The 2-byte control write selecting this buffer
    ///
    /// The same write clears the peripheral's interrupt condition.
    pub const fn control_message(self) -> [u8; 2] {
        [self as u8, 0]
    }

    /// Decodes a control write, if `data` is one
    pub fn from_control_message(data: &[u8]) -> Option<Self> {
        match data {
            [0x00, 0] => Some(BufferSelector::Command),
            [0x01, 0] => Some(BufferSelector::Response),
            _ => None,
        }
    }
}
