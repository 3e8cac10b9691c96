#![allow(dead_code)]

use std::cell::RefCell;
use touchbridge::sim::{SimBus, SimClock, SimPeripheral};
use touchbridge::{Callsite, CommEngine, DataReadySignal, EngineConfig, I2cStatus};

pub const ADDR: u8 = 0x24;

pub type Engine<'a> = CommEngine<'a, SimBus<'a>, &'a SimClock>;

/// Engine on a simulated bus where every ready poll takes 1 ms
pub fn engine<'a>(
    clock: &'a SimClock,
    signal: &'a DataReadySignal,
    config: EngineConfig,
) -> Engine<'a> {
    let bus = SimBus::new(SimPeripheral::new(ADDR))
        .with_clock(clock, 1)
        .with_interrupt(signal);
    CommEngine::new(bus, clock, signal, config)
}

/// Collects whatever the engine hands to its callbacks
#[derive(Default)]
pub struct Recorder {
    pub packets: RefCell<Vec<Vec<u8>>>,
    pub errors: RefCell<Vec<(I2cStatus, Callsite)>>,
}

impl Recorder {
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.borrow().clone()
    }

    pub fn errors(&self) -> Vec<(I2cStatus, Callsite)> {
        self.errors.borrow().clone()
    }
}
