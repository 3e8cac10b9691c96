mod common;

use common::{engine, Recorder, ADDR};
use touchbridge::sim::{BusEvent, SimClock};
use touchbridge::{
    ArenaLayout, BusHealth, Callsite, CommState, DataReadySignal, EngineConfig, I2cStatus,
};

fn slow_lock() -> EngineConfig {
    EngineConfig {
        locked_detect_ms: 10_000,
        ..EngineConfig::default()
    }
}

fn fast_lock() -> EngineConfig {
    EngineConfig {
        locked_detect_ms: 5,
        recovery_interval_ms: 3,
        max_recovery_attempts: 2,
        ..EngineConfig::default()
    }
}

#[test]
fn timeout_fires_at_every_rx_step() {
    let steps = [
        Callsite::RxReadLength,
        Callsite::RxProcessLength,
        Callsite::RxReadExtraData,
        Callsite::RxProcessExtraData,
        Callsite::RxClearIrq,
        Callsite::RxCheckComplete,
    ];
    for (ready, expected) in steps.into_iter().enumerate() {
        let clock = SimClock::new(0);
        let signal = DataReadySignal::new();
        let mut arena = [0u8; 1024];
        let rec = Recorder::default();
        let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

        let mut engine = engine(&clock, &signal, slow_lock());
        engine.activate(&mut arena, ArenaLayout::TOUCH);
        engine.register_error_callback(&mut on_err);

        engine.bus_mut().push_packet(&[0x01, 0x02, 0xB1, 0xB2]);
        engine.bus_mut().hold_busy_after(ready, 1000);

        assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT), "step {ready}");
        assert_eq!(engine.state(), CommState::Waiting);
        assert_eq!(rec.errors(), vec![(I2cStatus::TIMED_OUT, expected)]);
        assert_eq!(engine.bus_health(), BusHealth::Healthy);
    }
}

#[test]
fn timeout_fires_at_every_host_step() {
    let steps = [Callsite::XferDequeueAndAct, Callsite::XferTxCheckComplete];
    for (ready, expected) in steps.into_iter().enumerate() {
        let clock = SimClock::new(0);
        let signal = DataReadySignal::new();
        let mut arena = [0u8; 1024];
        let rec = Recorder::default();
        let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

        let mut engine = engine(&clock, &signal, slow_lock());
        engine.activate(&mut arena, ArenaLayout::TOUCH);
        engine.register_error_callback(&mut on_err);

        engine.enqueue_write(ADDR, &[0x10, 0x20]).unwrap();
        engine.bus_mut().hold_busy_after(ready, 1000);

        assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT));
        assert_eq!(engine.state(), CommState::Waiting);
        assert_eq!(rec.errors(), vec![(I2cStatus::TIMED_OUT, expected)]);
    }
}

#[test]
fn timeout_while_switching_to_response_buffer() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

    let mut engine = engine(&clock, &signal, slow_lock());
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_error_callback(&mut on_err);

    // A host write leaves the command buffer selected
    engine.write(ADDR, &[0x10], 0).unwrap();
    engine.bus_mut().push_packet(&[0x01, 0x01, 0x42]);
    engine.bus_mut().hold_busy_after(0, 1000);

    assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT));
    assert_eq!(engine.state(), CommState::Waiting);
    assert_eq!(
        rec.errors(),
        vec![(I2cStatus::TIMED_OUT, Callsite::RxSwitchToResponseBuffer)]
    );
}

#[test]
fn timeout_while_finishing_host_read() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

    let mut engine = engine(&clock, &signal, slow_lock());
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_error_callback(&mut on_err);

    engine.bus_mut().peripheral_mut().load_response(&[9, 8, 7]);
    engine.enqueue_read(ADDR, 3).unwrap();
    engine.bus_mut().hold_busy_after(1, 1000);

    assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT));
    assert_eq!(engine.state(), CommState::Waiting);
    assert_eq!(
        rec.errors(),
        vec![(I2cStatus::TIMED_OUT, Callsite::XferRxCheckComplete)]
    );
}

fn slow_bus() -> EngineConfig {
    // One millisecond per byte on the wire, plus one for the address
    EngineConfig {
        bus_clock_hz: 9_000,
        ..slow_lock()
    }
}

#[test]
fn long_payload_read_extends_the_deadline() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());

    let mut engine = engine(&clock, &signal, slow_bus());
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_rx_callback(&mut on_rx);

    let mut packet = vec![0x01, 40];
    packet.extend(0u8..40);
    engine.bus_mut().push_packet(&packet);
    // Busy while the payload is on the wire, well past the 10 ms budget
    engine.bus_mut().hold_busy_after(2, 30);

    assert_eq!(engine.process(10), Ok(()));
    assert_eq!(rec.packets(), vec![packet]);
}

#[test]
fn long_host_write_extends_the_deadline() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];

    let mut engine = engine(&clock, &signal, slow_bus());
    engine.activate(&mut arena, ArenaLayout::TOUCH);

    let data = [0x5Au8; 40];
    engine.enqueue_write(ADDR, &data).unwrap();
    engine.bus_mut().hold_busy_after(1, 30);

    assert_eq!(engine.process(10), Ok(()));
    assert_eq!(engine.bus().peripheral().commands(), &[data.to_vec()]);
}

#[test]
fn interrupted_packet_read_restarts_from_packet_start() {
    // Busy right after the header read, then while the payload is on the wire
    for ready in 1..=2 {
        let clock = SimClock::new(0);
        let signal = DataReadySignal::new();
        let mut arena = [0u8; 1024];
        let rec = Recorder::default();
        let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());
        let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

        let mut engine = engine(&clock, &signal, slow_lock());
        engine.activate(&mut arena, ArenaLayout::TOUCH);
        engine.register_rx_callback(&mut on_rx);
        engine.register_error_callback(&mut on_err);

        engine.bus_mut().push_packet(&[0x05, 0x02, 0x01, 0x00]);
        engine.bus_mut().hold_busy_after(ready, 1000);
        assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT), "ready {ready}");

        engine.bus_mut().hold_busy_after(0, 0);
        engine.bus_mut().clear_log();
        assert_eq!(engine.process(0), Ok(()), "ready {ready}");
        assert_eq!(rec.packets(), vec![vec![0x05, 0x02, 0x01, 0x00]]);
        assert_eq!(rec.errors().len(), 1);
        assert_eq!(engine.bus().peripheral().pending_packets(), 0);
        assert_eq!(
            engine.bus().log()[0],
            BusEvent::Write {
                address: ADDR,
                data: vec![0x01, 0x00]
            }
        );
    }
}

#[test]
fn fully_read_packet_is_never_delivered_twice() {
    let steps = [
        (Callsite::RxProcessExtraData, 0),
        (Callsite::RxClearIrq, 1),
        (Callsite::RxCheckComplete, 1),
    ];
    for (ready, (callsite, delivered)) in (3..).zip(steps) {
        let clock = SimClock::new(0);
        let signal = DataReadySignal::new();
        let mut arena = [0u8; 1024];
        let rec = Recorder::default();
        let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());
        let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

        let mut engine = engine(&clock, &signal, slow_lock());
        engine.activate(&mut arena, ArenaLayout::TOUCH);
        engine.register_rx_callback(&mut on_rx);
        engine.register_error_callback(&mut on_err);

        engine.bus_mut().push_packet(&[0x05, 0x02, 0x01, 0x00]);
        engine.bus_mut().hold_busy_after(ready, 1000);
        assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT), "ready {ready}");

        engine.bus_mut().hold_busy_after(0, 0);
        assert_eq!(engine.process(0), Ok(()), "ready {ready}");
        assert_eq!(engine.process(0), Ok(()), "ready {ready}");
        assert_eq!(rec.packets().len(), delivered, "ready {ready}");
        assert!(rec
            .packets()
            .iter()
            .all(|p| p == &[0x05, 0x02, 0x01, 0x00]));
        assert_eq!(rec.errors(), vec![(I2cStatus::TIMED_OUT, callsite)]);
        assert_eq!(engine.bus().peripheral().pending_packets(), 0);
    }
}

#[test]
fn next_packet_is_read_after_interrupted_acknowledge() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());

    let mut engine = engine(&clock, &signal, slow_lock());
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_rx_callback(&mut on_rx);

    engine.bus_mut().push_packet(&[0x05, 0x01, 0xAA]);
    engine.bus_mut().push_packet(&[0x06, 0x01, 0xBB]);
    // Busy once the first packet is delivered and before its acknowledge
    engine.bus_mut().hold_busy_after(4, 1000);
    assert_eq!(engine.process(10), Err(I2cStatus::TIMED_OUT));

    engine.bus_mut().hold_busy_after(0, 0);
    assert_eq!(engine.process(0), Ok(()));
    assert_eq!(engine.process(0), Ok(()));
    assert_eq!(
        rec.packets(),
        vec![vec![0x05, 0x01, 0xAA], vec![0x06, 0x01, 0xBB]]
    );
    assert_eq!(engine.bus().peripheral().pending_packets(), 0);
}

#[test]
fn request_waiting_on_busy_bus_stays_queued() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];

    let mut engine = engine(&clock, &signal, slow_lock());
    engine.activate(&mut arena, ArenaLayout::TOUCH);

    engine.enqueue_write(ADDR, &[0x10]).unwrap();
    engine.bus_mut().hold_busy_after(0, 1000);
    assert_eq!(engine.process(5), Err(I2cStatus::TIMED_OUT));
    assert_eq!(engine.queued(), 1);

    engine.bus_mut().hold_busy_after(0, 0);
    assert_eq!(engine.process(0), Ok(()));
    assert_eq!(engine.queued(), 0);
    assert_eq!(engine.bus().peripheral().commands(), &[vec![0x10]]);
}

#[test]
fn timed_out_packet_is_read_on_next_call() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());

    let mut engine = engine(&clock, &signal, slow_lock());
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_rx_callback(&mut on_rx);

    engine.bus_mut().push_packet(&[0x04, 0x01, 0x99]);
    engine.bus_mut().hold_busy_after(0, 1000);
    assert_eq!(engine.process(5), Err(I2cStatus::TIMED_OUT));
    assert!(rec.packets().is_empty());

    engine.bus_mut().hold_busy_after(0, 0);
    assert_eq!(engine.process(0), Ok(()));
    assert_eq!(rec.packets(), vec![vec![0x04, 0x01, 0x99]]);
}

#[test]
fn short_busy_spell_is_waited_out() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());

    let mut engine = engine(&clock, &signal, EngineConfig::default());
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_rx_callback(&mut on_rx);

    engine.bus_mut().push_packet(&[0x01, 0x01, 0x42]);
    engine.bus_mut().hold_busy_after(1, 3);
    assert_eq!(engine.process(0), Ok(()));
    assert_eq!(rec.packets(), vec![vec![0x01, 0x01, 0x42]]);
    assert_eq!(engine.bus_health(), BusHealth::Healthy);
}

#[test]
fn locked_bus_recovers() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];
    let rec = Recorder::default();
    let mut on_rx = |p: &[u8]| rec.packets.borrow_mut().push(p.to_vec());
    let mut on_err = |s: I2cStatus, c: Callsite| rec.errors.borrow_mut().push((s, c));

    let config = EngineConfig {
        max_recovery_attempts: 10,
        ..fast_lock()
    };
    let mut engine = engine(&clock, &signal, config);
    engine.activate(&mut arena, ArenaLayout::TOUCH);
    engine.register_rx_callback(&mut on_rx);
    engine.register_error_callback(&mut on_err);

    engine.bus_mut().push_packet(&[0x01, 0x01, 0x77]);
    engine.bus_mut().set_stuck(true);

    assert_eq!(engine.process(100), Err(I2cStatus::LOCKED_BUS));
    assert_eq!(engine.bus_health(), BusHealth::Locked { attempts: 0 });
    assert_eq!(engine.state(), CommState::Waiting);

    // Interval not passed yet
    engine.bus_mut().clear_log();
    assert_eq!(engine.process(100), Err(I2cStatus::LOCKED_BUS));
    assert!(engine.bus().log().is_empty());
    assert_eq!(engine.ack(ADDR, 0), Err(I2cStatus::LOCKED_BUS));

    // Attempt fails while the bus is still held
    clock.advance(3);
    assert_eq!(engine.process(100), Err(I2cStatus::LOCKED_BUS));
    assert_eq!(engine.bus_health(), BusHealth::Locked { attempts: 1 });
    assert_eq!(
        &engine.bus().log()[..2],
        &[BusEvent::Reinitialize, BusEvent::ClearStatus]
    );

    engine.bus_mut().set_stuck(false);
    clock.advance(3);
    assert_eq!(engine.process(100), Ok(()));
    assert_eq!(engine.bus_health(), BusHealth::Healthy);
    assert_eq!(rec.packets(), vec![vec![0x01, 0x01, 0x77]]);

    assert_eq!(
        rec.errors(),
        vec![
            (I2cStatus::LOCKED_BUS, Callsite::RxReadLength),
            (I2cStatus::LOCKED_BUS, Callsite::LockedBus),
            (I2cStatus::LOCKED_BUS, Callsite::Ack),
            (I2cStatus::LOCKED_BUS, Callsite::BusRecovery),
        ]
    );
}

#[test]
fn recovery_gives_up_after_max_attempts() {
    let clock = SimClock::new(0);
    let signal = DataReadySignal::new();
    let mut arena = [0u8; 1024];

    let mut engine = engine(&clock, &signal, fast_lock());
    engine.activate(&mut arena, ArenaLayout::TOUCH);

    engine.enqueue_write(ADDR, &[0x10]).unwrap();
    engine.bus_mut().set_stuck(true);
    assert_eq!(engine.process(100), Err(I2cStatus::LOCKED_BUS));

    for attempt in 1..=2 {
        clock.advance(3);
        assert_eq!(engine.process(100), Err(I2cStatus::LOCKED_BUS));
        assert_eq!(engine.error_counters().get(I2cStatus::LOCKED_BUS), 1 + attempt);
    }
    assert_eq!(engine.bus_health(), BusHealth::Exhausted);

    engine.bus_mut().clear_log();
    clock.advance(100);
    assert_eq!(engine.process(100), Err(I2cStatus::LOCKED_BUS));
    assert!(engine.bus().log().is_empty());
    assert_eq!(engine.bus_health(), BusHealth::Exhausted);

    // A fresh address starts over
    engine.set_slave_address(ADDR).unwrap();
    assert_eq!(engine.bus_health(), BusHealth::Healthy);
}
