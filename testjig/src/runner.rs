use crate::scenario::{Action, Scenario};
use anyhow::{bail, Result};
use std::cell::RefCell;
use touchbridge::sim::{SimBus, SimClock, SimPeripheral};
use touchbridge::{CommEngine, DataReadySignal, I2cStatus};

type Engine<'a> = CommEngine<'a, SimBus<'a>, &'a SimClock>;

/// Outcome of one scenario
#[derive(Debug)]
pub struct Report {
    pub name: String,
    pub steps: usize,
    pub mismatches: Vec<String>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Runs `scenario` on a fresh engine
///
/// The simulated peripheral answers on the configured default address. Every ready poll takes
/// one millisecond of simulated time.
pub fn run(scenario: &Scenario) -> Result<Report> {
    let layout = scenario.layout.arena_layout();
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = vec![0u8; layout.required_bytes()];
    let packets = RefCell::new(Vec::new());
    let mut on_rx = |p: &[u8]| packets.borrow_mut().push(p.to_vec());

    let bus = SimBus::new(SimPeripheral::new(scenario.config.default_address))
        .with_clock(&clock, 1)
        .with_interrupt(&signal);
    let mut engine = CommEngine::new(bus, &clock, &signal, scenario.config.clone());
    if engine.activate(&mut arena, layout) == 0 {
        bail!("layout {layout:?} is not usable");
    }
    engine.register_rx_callback(&mut on_rx);

    let mut report = Report {
        name: scenario.name.clone(),
        steps: scenario.steps.len(),
        mismatches: Vec::new(),
    };
    for (i, step) in scenario.steps.iter().enumerate() {
        let expected = step.expected()?;
        let got = match apply(&mut engine, &clock, &step.action) {
            Ok(()) => I2cStatus::empty(),
            Err(status) => status,
        };
        if got != expected {
            report.mismatches.push(format!(
                "step {} {:?}: expected {:?}, got {:?}",
                i + 1,
                step.action,
                expected,
                got
            ));
        }
    }

    let packets = packets.borrow();
    if *packets != scenario.packets {
        report.mismatches.push(format!(
            "packets: expected {:02x?}, got {:02x?}",
            scenario.packets, *packets
        ));
    }
    Ok(report)
}

fn apply(engine: &mut Engine<'_>, clock: &SimClock, action: &Action) -> Result<(), I2cStatus> {
    match action {
        Action::StagePacket(bytes) => engine.bus_mut().push_packet(bytes),
        Action::LoadResponse(bytes) => engine.bus_mut().peripheral_mut().load_response(bytes),
        Action::SelectBuffer(selector) => engine.bus_mut().peripheral_mut().select(*selector),
        Action::BusyPolls { after, count } => engine.bus_mut().hold_busy_after(*after, *count),
        Action::FailNext(error) => engine.bus_mut().fail_next(*error),
        Action::Stuck(stuck) => engine.bus_mut().set_stuck(*stuck),
        Action::AdvanceMs(ms) => clock.advance(*ms),
        Action::SetAddress(address) => return engine.set_slave_address(*address),
        Action::EnqueueRead { address, size } => return engine.enqueue_read(*address, *size),
        Action::EnqueueWrite { address, data } => return engine.enqueue_write(*address, data),
        Action::Ack {
            address,
            timeout_ms,
        } => return engine.ack(*address, *timeout_ms),
        Action::Process { timeout_ms } => return engine.process(*timeout_ms),
    }
    Ok(())
}
