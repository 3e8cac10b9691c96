//! Touchbridge is the bus master side of a serial-to-two-wire touch controller bridge
//!
//! The bridge relays host commands to a touch controller peripheral and packets generated by the
//! peripheral back to the host. This crate implements only the part talking to the peripheral:
//! it moves raw byte packets across one bus master/slave relationship, with bounded time spent
//! on every operation, and never hands a corrupted packet upward. Serial framing toward the host,
//! command interpretation, and firmware update chunking live elsewhere and use this crate through
//! [`CommEngine`].
//!
//! The peripheral speaks a small packet protocol. Every packet starts with a `{command, length}`
//! header followed by `length` payload bytes. A command of `0x00` (bit 7 ignored) and a length of
//! `0xFF` are reserved as invalid. The peripheral exposes a command buffer and a response buffer;
//! a two byte `{selector, 0}` control write selects the buffer subsequent reads come from and
//! acknowledges the interrupt for the packet just read. See [`BufferSelector`].
//!
//! Hooking up the engine is a three part process: the bus driver, the interrupt, and the main
//! loop.
//!
//! Start with the bus driver. This is done by creating a [`BusDriver`] implementation for the
//! bus master block of the target, together with a [`Clock`] giving a free-running millisecond
//! count. Both are project specific. Transfers are issued by [`BusDriver::write`] and
//! [`BusDriver::read`] and their completion is observed through [`BusDriver::poll_ready`], which
//! must report [`DriverError::Busy`] while the bus is held. A bus that stays busy past the
//! configured detection window is considered locked; the engine then reinitializes the bus
//! master and addresses the peripheral at a fixed interval until a transfer succeeds, or the
//! configured number of attempts is spent. At that point [`CommEngine::bus_health`] reports
//! [`BusHealth::Exhausted`] and it is up to the caller to reset the device.
//!
//! Next, the data ready interrupt. The handler acknowledges the interrupt source and raises a
//! [`DataReadySignal`], nothing more:
//! ```ignore
//! static DATA_READY: DataReadySignal = DataReadySignal::new();
//!
//! #[interrupt]
//! fn EXTI4() {
//!     exti_clear_pending(4);
//!     DATA_READY.raise();
//! }
//! ```
//!
//! Finally, the main loop. The engine borrows an arena for the host request queue and the
//! receive buffer; [`ArenaLayout`] describes how it is split. Received packets are handed to the
//! rx callback, which must copy out what it needs before returning. An example could be:
//! ```ignore
//! let mut on_packet = |packet: &[u8]| host_tx.extend(packet);
//! let mut on_error = |status: I2cStatus, site: Callsite| report(status.bits(), site.code());
//!
//! let mut engine = CommEngine::new(bus, clock, &DATA_READY, EngineConfig::default());
//! engine.register_rx_callback(&mut on_packet);
//! engine.register_error_callback(&mut on_error);
//! engine.activate(&mut ARENA[..], ArenaLayout::TOUCH);
//!
//! loop {
//!     if let Some((address, command)) = host_rx.next_command() {
//!         let _ = engine.enqueue_write(address, command);
//!     }
//!     let _ = engine.process(0);
//! }
//! ```
//!
//! Errors are reported as [`I2cStatus`] flag sets, by value. Each reported error is also passed
//! to the error callback together with a [`Callsite`] naming the step that produced it, and
//! counted in [`ErrorCounters`].
//!
//! With the `std` feature the [`sim`] module provides a simulated bus and peripheral for running
//! the engine on a host.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub mod alarm;
pub mod bus;
mod comm;
pub mod config;
mod engine;
pub mod locked_bus;
pub mod status;
pub mod transfer_queue;

#[cfg(any(test, feature = "std"))]
pub mod sim;

pub use alarm::{Alarm, AlarmKind, Clock, Instant};
pub use bus::{BufferSelector, BusDriver, Direction, DriverError, DriverResult, TransferDescriptor};
pub use comm::CommState;
pub use config::{ArenaLayout, EngineConfig};
pub use engine::{CommEngine, DataReadySignal, ErrorCallback, RxCallback};
pub use locked_bus::BusHealth;
pub use status::{Callsite, ErrorCounters, I2cStatus};
pub use transfer_queue::{QueueFull, RecordTransform, TransferQueue, Verbatim};
