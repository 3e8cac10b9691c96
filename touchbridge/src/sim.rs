//! Simulated bus and touch peripheral
//!
//! These run the engine on a host without hardware. The peripheral follows the same command and
//! response buffer protocol as the real device: packets are served from its response buffer, a
//! host write switches it to the command buffer, and the `{selector, 0}` control write switches
//! buffers, rewinds the read pointer, and acknowledges the packet if it has been read to the end.

use crate::alarm::{Clock, Instant};
use crate::bus::{BufferSelector, BusDriver, DriverError, DriverResult};
use crate::engine::DataReadySignal;
use core::cell::Cell;
use std::collections::VecDeque;
use std::vec::Vec;

/// Manually advanced millisecond clock
#[derive(Debug, Default)]
pub struct SimClock {
    now: Cell<u32>,
}

impl SimClock {
    pub fn new(start_ms: u32) -> Self {
        SimClock {
            now: Cell::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.now.get())
    }
}

#[derive(Clone, Debug)]
struct StagedPacket {
    bytes: Vec<u8>,
    irq: bool,
}

/// Touch controller model
#[derive(Clone, Debug)]
pub struct SimPeripheral {
    address: u8,
    selected: BufferSelector,
    packets: VecDeque<StagedPacket>,
    cursor: usize,
    commands: Vec<Vec<u8>>,
}

impl SimPeripheral {
    pub fn new(address: u8) -> Self {
        SimPeripheral {
            address,
            selected: BufferSelector::Response,
            packets: VecDeque::new(),
            cursor: 0,
            commands: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Queues a packet and raises the data ready line for it
    pub fn push_packet(&mut self, bytes: &[u8]) {
        self.packets.push_back(StagedPacket {
            bytes: bytes.to_vec(),
            irq: true,
        });
    }

    /// Queues response buffer content without raising the data ready line
    ///
    /// This is what a host-initiated read picks up.
    pub fn load_response(&mut self, bytes: &[u8]) {
        self.packets.push_back(StagedPacket {
            bytes: bytes.to_vec(),
            irq: false,
        });
    }

    /// Forces the buffer subsequent reads come from
    pub fn select(&mut self, selector: BufferSelector) {
        self.selected = selector;
        self.cursor = 0;
    }

    pub fn selected(&self) -> BufferSelector {
        self.selected
    }

    pub fn interrupt_asserted(&self) -> bool {
        self.packets.front().is_some_and(|p| p.irq)
    }

    /// Packets not yet acknowledged
    pub fn pending_packets(&self) -> usize {
        self.packets.len()
    }

    /// Non-control writes received so far
    pub fn commands(&self) -> &[Vec<u8>] {
        &self.commands
    }

    fn write(&mut self, data: &[u8]) {
        match BufferSelector::from_control_message(data) {
            Some(selector) => {
                let read_out = self
                    .packets
                    .front()
                    .is_some_and(|p| self.cursor > 0 && self.cursor >= p.bytes.len());
                if selector == BufferSelector::Response && read_out {
                    self.packets.pop_front();
                }
                self.select(selector);
            }
            None => {
                self.commands.push(data.to_vec());
                self.select(BufferSelector::Command);
            }
        }
    }

    fn read(&mut self, buffer: &mut [u8]) {
        if buffer.is_empty() {
            return;
        }
        if self.selected == BufferSelector::Command {
            buffer.fill(0);
            return;
        }
        let data = self.packets.front().map(|p| &p.bytes[..]).unwrap_or(&[]);
        for (i, b) in buffer.iter_mut().enumerate() {
            *b = data.get(self.cursor + i).copied().unwrap_or(0xFF);
        }
        self.cursor += buffer.len();
    }
}

/// Transaction seen by the [`SimBus`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    Write { address: u8, data: Vec<u8> },
    Read { address: u8, len: usize },
    Reinitialize,
    ClearStatus,
}

/// [`BusDriver`] backed by a [`SimPeripheral`]
///
/// Transfers complete as soon as they are issued. Busy periods, a stuck bus, and transfer
/// failures are scripted. When a clock is attached, every ready poll advances it, which is how
/// time passes while the engine waits on the bus. When a signal is attached, it is raised on
/// every rising edge of the data ready line, standing in for the interrupt handler.
pub struct SimBus<'c> {
    peripheral: SimPeripheral,
    clock: Option<&'c SimClock>,
    irq: Option<&'c DataReadySignal>,
    tick_ms: u32,
    ready_before_busy: usize,
    busy_polls: usize,
    stuck: bool,
    failures: VecDeque<DriverError>,
    log: Vec<BusEvent>,
}

impl<'c> SimBus<'c> {
    pub fn new(peripheral: SimPeripheral) -> Self {
        SimBus {
            peripheral,
            clock: None,
            irq: None,
            tick_ms: 0,
            ready_before_busy: 0,
            busy_polls: 0,
            stuck: false,
            failures: VecDeque::new(),
            log: Vec::new(),
        }
    }

    /// Advance `clock` by `tick_ms` on every ready poll
    pub fn with_clock(mut self, clock: &'c SimClock, tick_ms: u32) -> Self {
        self.clock = Some(clock);
        self.tick_ms = tick_ms;
        self
    }

    /// Raise `signal` on rising edges of the data ready line
    pub fn with_interrupt(mut self, signal: &'c DataReadySignal) -> Self {
        if self.peripheral.interrupt_asserted() {
            signal.raise();
        }
        self.irq = Some(signal);
        self
    }

    /// Stages a packet on the peripheral, as [`SimPeripheral::push_packet`]
    pub fn push_packet(&mut self, bytes: &[u8]) {
        self.track_irq(|p| p.push_packet(bytes));
    }

    pub fn peripheral(&self) -> &SimPeripheral {
        &self.peripheral
    }

    pub fn peripheral_mut(&mut self) -> &mut SimPeripheral {
        &mut self.peripheral
    }

    /// After `ready` more successful polls, report busy for `busy` polls
    pub fn hold_busy_after(&mut self, ready: usize, busy: usize) {
        self.ready_before_busy = ready;
        self.busy_polls = busy;
    }

    /// Report busy on every poll and transfer until cleared
    pub fn set_stuck(&mut self, stuck: bool) {
        self.stuck = stuck;
    }

    /// Fail the next issued transfer with `error`
    pub fn fail_next(&mut self, error: DriverError) {
        self.failures.push_back(error);
    }

    pub fn log(&self) -> &[BusEvent] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Writes seen so far, in order
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.log
            .iter()
            .filter_map(|e| match e {
                BusEvent::Write { address, data } => Some((*address, data.clone())),
                _ => None,
            })
            .collect()
    }

    fn track_irq(&mut self, f: impl FnOnce(&mut SimPeripheral)) {
        let before = self.peripheral.interrupt_asserted();
        let pending = self.peripheral.pending_packets();
        f(&mut self.peripheral);
        // Acknowledging a packet drops the line, even if the next packet raises it right away
        let acknowledged = self.peripheral.pending_packets() < pending;
        if (!before || acknowledged) && self.peripheral.interrupt_asserted() {
            if let Some(signal) = self.irq {
                signal.raise();
            }
        }
    }

    fn issue(&mut self, address: u8) -> DriverResult {
        if self.stuck {
            return Err(DriverError::Busy);
        }
        if let Some(e) = self.failures.pop_front() {
            return Err(e);
        }
        if address != self.peripheral.address {
            return Err(DriverError::Nak);
        }
        Ok(())
    }
}

impl BusDriver for SimBus<'_> {
    fn write(&mut self, address: u8, data: &[u8]) -> DriverResult {
        self.log.push(BusEvent::Write {
            address,
            data: data.to_vec(),
        });
        self.issue(address)?;
        self.track_irq(|p| p.write(data));
        Ok(())
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> DriverResult {
        self.log.push(BusEvent::Read {
            address,
            len: buffer.len(),
        });
        self.issue(address)?;
        self.peripheral.read(buffer);
        Ok(())
    }

    fn poll_ready(&mut self) -> DriverResult {
        if let Some(clock) = self.clock {
            clock.advance(self.tick_ms);
        }
        if self.stuck {
            return Err(DriverError::Busy);
        }
        if self.ready_before_busy > 0 {
            self.ready_before_busy -= 1;
            return Ok(());
        }
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return Err(DriverError::Busy);
        }
        Ok(())
    }

    fn is_interrupt_asserted(&mut self) -> bool {
        self.peripheral.interrupt_asserted()
    }

    fn reinitialize(&mut self) {
        self.log.push(BusEvent::Reinitialize);
    }

    fn clear_status(&mut self) {
        self.log.push(BusEvent::ClearStatus);
    }
}
