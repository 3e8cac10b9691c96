use crate::alarm::{Alarm, AlarmKind, Clock};
use crate::bus::*;
use crate::config::EngineConfig;
use crate::engine::{DataReadySignal, RxCallback};
use crate::locked_bus::LockedBusMonitor;
use crate::status::{Callsite, I2cStatus};
use crate::transfer_queue::{DescriptorPrefix, TransferQueue};

/// State of the slave communication state machine
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommState {
    Waiting,
    RxPending,
    RxSwitchToResponseBuffer,
    RxReadLength,
    RxProcessLength,
    RxReadExtraData,
    RxProcessExtraData,
    RxClearIrq,
    RxCheckComplete,
    XferDequeueAndAct,
    XferRxCheckComplete,
    XferTxCheckComplete,
}

impl CommState {
    // States that wait for the bus before acting. These are also the timeout checkpoints.
    fn waits_for_bus(self) -> bool {
        !matches!(self, CommState::Waiting | CommState::RxPending)
    }

    fn callsite(self) -> Callsite {
        match self {
            CommState::Waiting | CommState::RxPending => Callsite::Process,
            CommState::RxSwitchToResponseBuffer => Callsite::RxSwitchToResponseBuffer,
            CommState::RxReadLength => Callsite::RxReadLength,
            CommState::RxProcessLength => Callsite::RxProcessLength,
            CommState::RxReadExtraData => Callsite::RxReadExtraData,
            CommState::RxProcessExtraData => Callsite::RxProcessExtraData,
            CommState::RxClearIrq => Callsite::RxClearIrq,
            CommState::RxCheckComplete => Callsite::RxCheckComplete,
            CommState::XferDequeueAndAct => Callsite::XferDequeueAndAct,
            CommState::XferRxCheckComplete => Callsite::XferRxCheckComplete,
            CommState::XferTxCheckComplete => Callsite::XferTxCheckComplete,
        }
    }
}

/// Error produced by an operation, with the step it came from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Fault {
    pub status: I2cStatus,
    pub callsite: Callsite,
}

/// Everything the state machine borrows from the engine for one operation
pub(crate) struct Ports<'p, 'a, B, C> {
    pub bus: &'p mut B,
    pub clock: &'p C,
    pub monitor: &'p mut LockedBusMonitor,
    pub config: &'p EngineConfig,
    pub signal: &'a DataReadySignal,
    pub queue: &'p mut TransferQueue<'a, DescriptorPrefix>,
    pub rx: &'p mut [u8],
    pub on_rx: &'p mut Option<RxCallback<'a>>,
    pub address: u8,
}

/// Protocol state machine toward the addressed peripheral
///
/// One operation at a time: either a peripheral initiated packet read, or one queued host
/// request. An operation runs from `Waiting` back to `Waiting` under a single timeout alarm.
pub(crate) struct SlaveComm {
    state: CommState,
    timeout: Alarm,
    pending_rx_size: usize,
    switch_retried: bool,
    response_selected: bool,
    rx_op: bool,
    rx_read_issued: bool,
    deferred: Option<Fault>,
}

impl SlaveComm {
    pub const fn new() -> Self {
        SlaveComm {
            state: CommState::Waiting,
            timeout: Alarm::new(),
            pending_rx_size: 0,
            switch_retried: false,
            response_selected: true,
            rx_op: false,
            rx_read_issued: false,
            deferred: None,
        }
    }

    /// Forget everything about the peripheral
    ///
    /// A freshly addressed peripheral is assumed to have its response buffer selected.
    pub fn reset(&mut self) {
        *self = SlaveComm::new();
    }

    pub fn state(&self) -> CommState {
        self.state
    }

    /// Tracks the peripheral's selected buffer across a write to it
    pub fn note_write(&mut self, data: &[u8]) {
        self.response_selected =
            BufferSelector::from_control_message(data) == Some(BufferSelector::Response);
    }

    /// Picks the next operation, if any, and arms its timeout
    ///
    /// A pending peripheral read always goes before queued host requests.
    pub fn begin<B: BusDriver, C: Clock>(
        &mut self,
        ports: &mut Ports<'_, '_, B, C>,
        budget_ms: u32,
    ) -> bool {
        if self.state != CommState::Waiting {
            return true;
        }
        if ports.signal.is_raised() && ports.bus.is_interrupt_asserted() {
            self.state = CommState::RxPending;
        } else if !ports.queue.is_empty() {
            self.state = CommState::XferDequeueAndAct;
        } else {
            return false;
        }
        self.timeout
            .arm(ports.clock.now(), budget_ms, AlarmKind::Continuous);
        self.rx_op = self.state == CommState::RxPending;
        self.rx_read_issued = false;
        self.switch_retried = false;
        self.pending_rx_size = 0;
        self.deferred = None;
        true
    }

    /// Drives the current operation to completion
    ///
    /// Always leaves the machine in `Waiting`. If a peripheral read is aborted the data ready
    /// flag is raised again, so the packet is picked up by a later call as long as the
    /// peripheral still asserts its line. Once part of the packet has been read, the retry
    /// starts with a buffer select to rewind the peripheral's read pointer.
    pub fn run<B: BusDriver, C: Clock>(
        &mut self,
        ports: &mut Ports<'_, '_, B, C>,
    ) -> Result<(), Fault> {
        if let Err(fault) = self.drive(ports) {
            if self.rx_op {
                if self.rx_read_issued {
                    self.response_selected = false;
                }
                ports.signal.raise();
            }
            return Err(fault);
        }
        match self.deferred.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn drive<B: BusDriver, C: Clock>(
        &mut self,
        ports: &mut Ports<'_, '_, B, C>,
    ) -> Result<(), Fault> {
        while self.state != CommState::Waiting {
            if self.state.waits_for_bus() {
                if self.timeout.has_elapsed(ports.clock.now()) {
                    return Err(self.abort(I2cStatus::TIMED_OUT));
                }
                let ready = ports.bus.poll_ready();
                if ports.monitor.observe(ports.clock.now(), ready) {
                    warn!("bus locked during {}", self.state);
                }
                match ready {
                    Ok(()) => {}
                    Err(DriverError::Busy) if ports.monitor.is_locked() => {
                        return Err(self.abort(I2cStatus::LOCKED_BUS));
                    }
                    Err(DriverError::Busy) => continue,
                    Err(e) => return Err(self.abort(e.into())),
                }
            }
            self.step(ports)?;
        }
        self.timeout.disarm();
        Ok(())
    }

    fn abort(&mut self, status: I2cStatus) -> Fault {
        let fault = Fault {
            status,
            callsite: self.state.callsite(),
        };
        debug!("abort in {}: {}", self.state, status);
        self.state = CommState::Waiting;
        self.timeout.disarm();
        self.deferred = None;
        fault
    }

    // Result of issuing a transfer. `Ok(false)` means the bus was busy and the state runs again
    // on the next pass.
    fn issued<B, C: Clock>(
        &mut self,
        ports: &mut Ports<'_, '_, B, C>,
        result: DriverResult,
    ) -> Result<bool, Fault> {
        ports.monitor.observe(ports.clock.now(), result);
        match result {
            Ok(()) => Ok(true),
            Err(DriverError::Busy) => Ok(false),
            Err(e) => Err(self.abort(e.into())),
        }
    }

    fn step<B: BusDriver, C: Clock>(
        &mut self,
        ports: &mut Ports<'_, '_, B, C>,
    ) -> Result<(), Fault> {
        let address = ports.address;
        match self.state {
            CommState::Waiting => {}
            CommState::RxPending => {
                ports.signal.clear();
                self.state = if self.response_selected {
                    CommState::RxReadLength
                } else {
                    CommState::RxSwitchToResponseBuffer
                };
            }
            CommState::RxSwitchToResponseBuffer => {
                let msg = BufferSelector::Response.control_message();
                let r = ports.bus.write(address, &msg);
                if self.issued(ports, r)? {
                    self.response_selected = true;
                    self.state = CommState::RxReadLength;
                }
            }
            CommState::RxReadLength => {
                // A buffer select also acknowledges a packet that was read in full
                if !ports.bus.is_interrupt_asserted() {
                    trace!("data ready line dropped, nothing to read");
                    self.state = CommState::Waiting;
                    return Ok(());
                }
                self.rx_read_issued = true;
                let r = ports.bus.read(address, &mut ports.rx[..PACKET_HEADER_SIZE]);
                if self.issued(ports, r)? {
                    self.state = CommState::RxProcessLength;
                }
            }
            CommState::RxProcessLength => self.process_header(ports),
            CommState::RxReadExtraData => {
                let r = ports
                    .bus
                    .read(address, &mut ports.rx[PACKET_HEADER_SIZE..self.pending_rx_size]);
                if self.issued(ports, r)? {
                    self.state = CommState::RxProcessExtraData;
                }
            }
            CommState::RxProcessExtraData => {
                deliver(ports.on_rx, &ports.rx[..self.pending_rx_size]);
                self.state = CommState::RxClearIrq;
            }
            CommState::RxClearIrq => {
                let msg = BufferSelector::Response.control_message();
                let r = ports.bus.write(address, &msg);
                if self.issued(ports, r)? {
                    self.response_selected = true;
                    self.state = CommState::RxCheckComplete;
                }
            }
            CommState::RxCheckComplete => {
                self.state = CommState::Waiting;
            }
            CommState::XferDequeueAndAct => self.dispatch_request(ports)?,
            CommState::XferRxCheckComplete => {
                deliver(ports.on_rx, &ports.rx[..self.pending_rx_size]);
                self.state = CommState::Waiting;
            }
            CommState::XferTxCheckComplete => {
                self.state = CommState::Waiting;
            }
        }
        Ok(())
    }

    fn process_header<B, C>(&mut self, ports: &mut Ports<'_, '_, B, C>) {
        let command = ports.rx[0] & COMMAND_MASK;
        let length = ports.rx[1];
        let total = PACKET_HEADER_SIZE + length as usize;

        if length == INVALID_LENGTH || total > ports.rx.len() {
            warn!("invalid packet length {=u8}", length);
            self.reject();
        } else if command == INVALID_COMMAND {
            if self.switch_retried {
                warn!("invalid command after buffer switch");
                self.reject();
            } else {
                // The peripheral may still be on its command buffer
                self.switch_retried = true;
                self.response_selected = false;
                self.state = CommState::RxSwitchToResponseBuffer;
            }
        } else {
            self.pending_rx_size = total;
            self.timeout
                .snooze(ports.config.transfer_time_ms(length as usize));
            self.state = if length > 0 {
                CommState::RxReadExtraData
            } else {
                CommState::RxProcessExtraData
            };
        }
    }

    // Drops the packet but still acknowledges it, reporting once the acknowledge is done
    fn reject(&mut self) {
        self.deferred = Some(Fault {
            status: I2cStatus::INVALID_READ,
            callsite: Callsite::RxProcessLength,
        });
        self.state = CommState::RxClearIrq;
    }

    fn dispatch_request<B: BusDriver, C: Clock>(
        &mut self,
        ports: &mut Ports<'_, '_, B, C>,
    ) -> Result<(), Fault> {
        let Some(record) = ports.queue.peek() else {
            self.state = CommState::Waiting;
            return Ok(());
        };
        let Some((&first, body)) = record.split_first() else {
            ports.queue.dequeue();
            return Err(self.abort(I2cStatus::INVALID_INPUT));
        };
        let descriptor = TransferDescriptor::from_byte(first);
        let target = descriptor.address();

        let (result, next, size) = match descriptor.direction() {
            Direction::Write => {
                let r = ports.bus.write(target, body);
                if r.is_ok() && target == ports.address {
                    self.note_write(body);
                }
                (r, CommState::XferTxCheckComplete, body.len())
            }
            Direction::Read => match body {
                [n] if *n > 0 && (*n as usize) <= ports.rx.len() => {
                    let n = *n as usize;
                    let r = ports.bus.read(target, &mut ports.rx[..n]);
                    (r, CommState::XferRxCheckComplete, n)
                }
                _ => {
                    ports.queue.dequeue();
                    return Err(self.abort(I2cStatus::INVALID_INPUT));
                }
            },
        };

        ports.monitor.observe(ports.clock.now(), result);
        match result {
            Ok(()) => {
                ports.queue.dequeue();
                self.pending_rx_size = size;
                self.timeout.snooze(ports.config.transfer_time_ms(size));
                self.state = next;
                Ok(())
            }
            // Not issued, the request stays queued
            Err(DriverError::Busy) => Ok(()),
            Err(e) => {
                ports.queue.dequeue();
                Err(self.abort(e.into()))
            }
        }
    }
}

fn deliver(on_rx: &mut Option<RxCallback<'_>>, packet: &[u8]) {
    match on_rx {
        Some(cb) => cb(packet),
        None => trace!("no rx callback, dropped {=usize} bytes", packet.len()),
    }
}
