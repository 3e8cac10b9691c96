use crate::alarm::{Alarm, AlarmKind, Clock};
use crate::bus::{BusDriver, Direction, DriverError, DriverResult, TransferDescriptor, MAX_ADDRESS};
use crate::comm::{CommState, Ports, SlaveComm};
use crate::config::{ArenaLayout, EngineConfig};
use crate::locked_bus::{BusHealth, LockedBusMonitor};
use crate::status::{Callsite, ErrorCounters, I2cStatus};
use crate::transfer_queue::{DescriptorPrefix, TransferQueue, RECORD_SIZE};
use core::sync::atomic::{AtomicBool, Ordering};

/// Callback receiving each inbound packet, or the data of a completed host read
///
/// The slice is only valid for the duration of the call.
pub type RxCallback<'a> = &'a mut dyn FnMut(&[u8]);

/// Callback observing every reported error
pub type ErrorCallback<'a> = &'a mut dyn FnMut(I2cStatus, Callsite);

/// Data ready flag shared with the peripheral's interrupt handler
///
/// The interrupt handler acknowledges the interrupt in hardware and calls
/// [`raise`](DataReadySignal::raise), nothing else. Everything else happens in
/// [`CommEngine::process`].
pub struct DataReadySignal {
    pending: AtomicBool,
}

impl DataReadySignal {
    /// Declared const so it can back a `static`
    pub const fn new() -> Self {
        DataReadySignal {
            pending: AtomicBool::new(false),
        }
    }

    /// Marks a packet as pending. Safe to call from interrupt context.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }
}

impl Default for DataReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

struct Session<'a> {
    queue: TransferQueue<'a, DescriptorPrefix>,
    rx: &'a mut [u8],
    layout: ArenaLayout,
}

/// Bus master communication engine
///
/// Owns the bus driver and all protocol state. The caller lends it an arena with
/// [`activate`](CommEngine::activate) and then calls [`process`](CommEngine::process) from the
/// main loop. Queue and state machine are only ever touched from the caller's context; the
/// interrupt handler only raises the [`DataReadySignal`].
pub struct CommEngine<'a, B: BusDriver, C: Clock> {
    bus: B,
    clock: C,
    config: EngineConfig,
    signal: &'a DataReadySignal,
    session: Option<Session<'a>>,
    comm: SlaveComm,
    monitor: LockedBusMonitor,
    address: u8,
    rx_callback: Option<RxCallback<'a>>,
    error_callback: Option<ErrorCallback<'a>>,
    counters: ErrorCounters,
}

impl<'a, B: BusDriver, C: Clock> CommEngine<'a, B, C> {
    pub fn new(bus: B, clock: C, signal: &'a DataReadySignal, config: EngineConfig) -> Self {
        let monitor = LockedBusMonitor::new(
            config.locked_detect_ms,
            config.recovery_interval_ms,
            config.max_recovery_attempts,
        );
        CommEngine {
            bus,
            clock,
            address: config.default_address & MAX_ADDRESS,
            config,
            signal,
            session: None,
            comm: SlaveComm::new(),
            monitor,
            rx_callback: None,
            error_callback: None,
            counters: ErrorCounters::new(),
        }
    }

    /// Gives back the bus driver
    pub fn free(self) -> B {
        self.bus
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Takes `arena` into use, split according to `layout`
    ///
    /// Returns the number of bytes used from the start of `arena`, or 0 if the arena is too
    /// small, the layout unusable, or the engine already active.
    pub fn activate(&mut self, arena: &'a mut [u8], layout: ArenaLayout) -> usize {
        if self.session.is_some() {
            warn!("activate while active");
            return 0;
        }
        let required = layout.required_bytes();
        if !layout.is_valid() || arena.len() < required {
            warn!("arena of {=usize} bytes, need {=usize}", arena.len(), required);
            return 0;
        }

        let (table, rest) = arena.split_at_mut(layout.max_records * RECORD_SIZE);
        let (data, rest) = rest.split_at_mut(layout.payload_bytes);
        let (rx, _) = rest.split_at_mut(layout.rx_bytes);
        self.session = Some(Session {
            queue: TransferQueue::with_transform(table, data, DescriptorPrefix),
            rx,
            layout,
        });
        self.reset_link();
        debug!("activated with {=usize} bytes", required);
        required
    }

    /// Releases the arena
    ///
    /// Returns the number of bytes freed, 0 if the engine was not active. Queued requests are
    /// dropped.
    pub fn deactivate(&mut self) -> usize {
        match self.session.take() {
            Some(session) => {
                self.reset_link();
                session.layout.required_bytes()
            }
            None => 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Layout of the current arena
    pub fn layout(&self) -> Option<ArenaLayout> {
        self.session.as_ref().map(|s| s.layout)
    }

    pub fn register_rx_callback(&mut self, callback: RxCallback<'a>) {
        self.rx_callback = Some(callback);
    }

    pub fn register_error_callback(&mut self, callback: ErrorCallback<'a>) {
        self.error_callback = Some(callback);
    }

    /// Addresses a different peripheral
    ///
    /// The new peripheral shares no buffer or interrupt state with the old one, so all
    /// protocol state starts over. Queued host requests are kept.
    pub fn set_slave_address(&mut self, address: u8) -> Result<(), I2cStatus> {
        if address > MAX_ADDRESS {
            return self.fail(I2cStatus::INVALID_INPUT, Callsite::SetAddress);
        }
        self.address = address;
        self.reset_link();
        Ok(())
    }

    /// Goes back to the configured default peripheral
    pub fn reset_slave_address(&mut self) {
        self.address = self.config.default_address & MAX_ADDRESS;
        self.reset_link();
    }

    pub fn slave_address(&self) -> u8 {
        self.address
    }

    /// Queues a read of `size` bytes from `address`
    ///
    /// The data is delivered to the rx callback once [`process`](CommEngine::process) has run
    /// the request.
    pub fn enqueue_read(&mut self, address: u8, size: usize) -> Result<(), I2cStatus> {
        let callsite = Callsite::EnqueueRead;
        let Some(session) = self.session.as_mut() else {
            return self.fail(I2cStatus::DEACTIVATED, callsite);
        };
        let max = session.rx.len().min(u8::MAX as usize);
        let descriptor = match TransferDescriptor::new(address, Direction::Read) {
            Some(d) if (1..=max).contains(&size) => d,
            _ => return self.fail(I2cStatus::INVALID_INPUT, callsite),
        };
        match session.queue.enqueue(descriptor, &[size as u8]) {
            Ok(()) => Ok(()),
            Err(_) => self.fail(I2cStatus::QUEUE_FULL, callsite),
        }
    }

    /// Queues a write of `data` to `address`
    pub fn enqueue_write(&mut self, address: u8, data: &[u8]) -> Result<(), I2cStatus> {
        let callsite = Callsite::EnqueueWrite;
        let Some(session) = self.session.as_mut() else {
            return self.fail(I2cStatus::DEACTIVATED, callsite);
        };
        let max = session.queue.data_capacity() - 1;
        let descriptor = match TransferDescriptor::new(address, Direction::Write) {
            Some(d) if (1..=max).contains(&data.len()) => d,
            _ => return self.fail(I2cStatus::INVALID_INPUT, callsite),
        };
        match session.queue.enqueue(descriptor, data) {
            Ok(()) => Ok(()),
            Err(_) => self.fail(I2cStatus::QUEUE_FULL, callsite),
        }
    }

    /// Number of queued host requests
    pub fn queued(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.queue.len())
    }

    /// Checks for a device at `address` with an address-only read
    ///
    /// Blocks until the transfer completes or `timeout_ms` passes. A zero timeout selects a
    /// default computed from the configuration.
    pub fn ack(&mut self, address: u8, timeout_ms: u32) -> Result<(), I2cStatus> {
        self.blocking(address, 0, timeout_ms, Callsite::Ack, |bus| {
            bus.read(address, &mut [])
        })
    }

    /// Reads `buffer.len()` bytes from `address`, bypassing the queue
    ///
    /// Blocks as [`ack`](CommEngine::ack).
    pub fn read(
        &mut self,
        address: u8,
        buffer: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), I2cStatus> {
        if buffer.is_empty() {
            return self.fail(I2cStatus::INVALID_INPUT, Callsite::Read);
        }
        let len = buffer.len();
        self.blocking(address, len, timeout_ms, Callsite::Read, |bus| {
            bus.read(address, buffer)
        })
    }

    /// Writes `data` to `address`, bypassing the queue
    ///
    /// Blocks as [`ack`](CommEngine::ack).
    pub fn write(&mut self, address: u8, data: &[u8], timeout_ms: u32) -> Result<(), I2cStatus> {
        if data.is_empty() {
            return self.fail(I2cStatus::INVALID_INPUT, Callsite::Write);
        }
        self.blocking(address, data.len(), timeout_ms, Callsite::Write, |bus| {
            bus.write(address, data)
        })?;
        if address == self.address {
            self.comm.note_write(data);
        }
        Ok(())
    }

    /// Runs pending work
    ///
    /// A pending peripheral packet is always handled before queued host requests, and host
    /// requests run in FIFO order. Each operation is bounded by `timeout_ms` (0 selects the
    /// default), extended by the bus time of its payload. Work continues until none is left, an
    /// operation fails, or `timeout_ms` has passed since the call started. The state machine is
    /// back in `Waiting` when this returns.
    ///
    /// While the bus is locked, this attempts recovery instead, at the configured interval.
    pub fn process(&mut self, timeout_ms: u32) -> Result<(), I2cStatus> {
        if self.session.is_none() {
            return self.fail(I2cStatus::DEACTIVATED, Callsite::Process);
        }
        if self.monitor.is_locked() {
            self.recover()?;
        }

        let budget = self.budget(timeout_ms, 0);
        let mut call = Alarm::new();
        call.arm(self.clock.now(), budget, AlarmKind::SingleShot);

        loop {
            let result = self.with_ports(|comm, ports| {
                if comm.begin(ports, budget) {
                    Some(comm.run(ports))
                } else {
                    None
                }
            });
            match result.flatten() {
                None => return Ok(()),
                Some(Err(fault)) => return self.fail(fault.status, fault.callsite),
                Some(Ok(())) => {}
            }
            if call.has_elapsed(self.clock.now()) {
                return Ok(());
            }
        }
    }

    /// Current state machine state; `Waiting` between calls
    pub fn state(&self) -> CommState {
        self.comm.state()
    }

    pub fn bus_health(&self) -> BusHealth {
        self.monitor.health()
    }

    pub fn error_counters(&self) -> &ErrorCounters {
        &self.counters
    }

    pub fn reset_error_counters(&mut self) {
        self.counters.reset();
    }

    fn with_ports<R>(
        &mut self,
        f: impl FnOnce(&mut SlaveComm, &mut Ports<'_, 'a, B, C>) -> R,
    ) -> Option<R> {
        let session = self.session.as_mut()?;
        let mut ports = Ports {
            bus: &mut self.bus,
            clock: &self.clock,
            monitor: &mut self.monitor,
            config: &self.config,
            signal: self.signal,
            queue: &mut session.queue,
            rx: &mut *session.rx,
            on_rx: &mut self.rx_callback,
            address: self.address,
        };
        Some(f(&mut self.comm, &mut ports))
    }

    fn reset_link(&mut self) {
        self.comm.reset();
        self.monitor.reset();
        self.signal.clear();
    }

    fn budget(&self, timeout_ms: u32, bytes: usize) -> u32 {
        if timeout_ms == 0 {
            self.config
                .default_timeout_ms()
                .saturating_add(self.config.transfer_time_ms(bytes))
        } else {
            timeout_ms
        }
    }

    fn fail<T>(&mut self, status: I2cStatus, callsite: Callsite) -> Result<T, I2cStatus> {
        self.counters.record(status);
        warn!("{} at {}", status, callsite);
        if let Some(cb) = self.error_callback.as_mut() {
            cb(status, callsite);
        }
        Err(status)
    }

    // Waits for the bus to go idle, feeding every poll to the locked bus monitor
    fn wait_ready(&mut self, alarm: &mut Alarm) -> Result<(), I2cStatus> {
        loop {
            let ready = self.bus.poll_ready();
            let now = self.clock.now();
            self.monitor.observe(now, ready);
            match ready {
                Ok(()) => return Ok(()),
                Err(DriverError::Busy) if self.monitor.is_locked() => {
                    return Err(I2cStatus::LOCKED_BUS)
                }
                Err(DriverError::Busy) => {
                    if alarm.has_elapsed(now) {
                        return Err(I2cStatus::TIMED_OUT);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn blocking(
        &mut self,
        address: u8,
        bytes: usize,
        timeout_ms: u32,
        callsite: Callsite,
        mut op: impl FnMut(&mut B) -> DriverResult,
    ) -> Result<(), I2cStatus> {
        if self.session.is_none() {
            return self.fail(I2cStatus::DEACTIVATED, callsite);
        }
        if address > MAX_ADDRESS {
            return self.fail(I2cStatus::INVALID_INPUT, callsite);
        }
        if self.monitor.is_locked() {
            return self.fail(I2cStatus::LOCKED_BUS, callsite);
        }

        let mut alarm = Alarm::new();
        let budget = self.budget(timeout_ms, bytes);
        alarm.arm(self.clock.now(), budget, AlarmKind::SingleShot);

        let result = loop {
            if let Err(status) = self.wait_ready(&mut alarm) {
                break Err(status);
            }
            let issued = op(&mut self.bus);
            let now = self.clock.now();
            self.monitor.observe(now, issued);
            match issued {
                Err(DriverError::Busy) if self.monitor.is_locked() => {
                    break Err(I2cStatus::LOCKED_BUS)
                }
                Err(DriverError::Busy) if alarm.has_elapsed(now) => break Err(I2cStatus::TIMED_OUT),
                // Not issued, wait for the bus and try again
                Err(DriverError::Busy) => {}
                issued => break issued.map_err(I2cStatus::from),
            }
        };
        match result.and_then(|()| self.wait_ready(&mut alarm)) {
            Ok(()) => Ok(()),
            Err(status) => self.fail(status, callsite),
        }
    }

    fn recover(&mut self) -> Result<(), I2cStatus> {
        let now = self.clock.now();
        if !self.monitor.recovery_due(now) {
            return self.fail(I2cStatus::LOCKED_BUS, Callsite::LockedBus);
        }
        self.monitor.begin_recovery(now);
        warn!(
            "bus recovery attempt {=u8}",
            self.monitor.recovery_attempts()
        );

        self.bus.reinitialize();
        self.bus.clear_status();
        let mut alarm = Alarm::new();
        alarm.arm(now, self.budget(0, 0), AlarmKind::SingleShot);
        let mut result = self.bus.read(self.address, &mut []);
        if result.is_ok() {
            result = loop {
                match self.bus.poll_ready() {
                    Err(DriverError::Busy) if !alarm.has_elapsed(self.clock.now()) => {}
                    r => break r,
                }
            };
        }
        self.monitor.observe(self.clock.now(), result);

        if self.monitor.is_locked() {
            if self.monitor.is_exhausted() {
                error!("bus recovery exhausted");
            }
            return self.fail(I2cStatus::LOCKED_BUS, Callsite::BusRecovery);
        }
        debug!("bus recovered");
        self.comm.reset();
        Ok(())
    }
}
