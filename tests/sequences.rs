use crossbeam_channel::{unbounded, Receiver};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use stepper_sequencer::{
    func_line, ActuatorConfig, ActuatorPins, CancellationToken, ConfigError, EngineError,
    EngineState, EventKind, HardwareLine, Level, Limits, MachineConfig, Origin,
    Phase, Pin, ReturnMode, ReturnReport, SequenceConfig, SequenceOrchestrator,
    SimulatedClock, SimulatedLine, SimulatedLineError, StatusEvent, Timings,
};

fn single_motor() -> MachineConfig {
    MachineConfig::new(200)
        .with_actuator(ActuatorPins::new(27, 17))
        .unwrap()
}

fn engine<L: HardwareLine + 'static>(
    machine: MachineConfig,
    line: L,
) -> (SequenceOrchestrator<L>, Arc<SimulatedClock>, Receiver<StatusEvent>) {
    let (tx, rx) = unbounded();
    let clock = Arc::new(SimulatedClock::new());
    let engine = SequenceOrchestrator::new(machine, line, tx).with_clock(Arc::clone(&clock));

    (engine, clock, rx)
}

fn messages(rx: &Receiver<StatusEvent>) -> Vec<String> {
    rx.try_iter().map(|e| e.to_string()).collect()
}

/// A line which holds a step pulse on pin 27 until the run has been
/// cancelled.
struct Gate {
    pulses: Arc<AtomicU32>,
    token: Arc<Mutex<Option<CancellationToken>>>,
    reached: Receiver<()>,
}

impl Gate {
    fn new(hold_at: u32) -> (Gate, impl HardwareLine + 'static) {
        let pulses = Arc::new(AtomicU32::new(0));
        let token: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let (reached_tx, reached) = unbounded();

        let counter = Arc::clone(&pulses);
        let slot = Arc::clone(&token);
        let line = func_line(move |pin, level| {
            if pin != Pin(27) || level != Level::Low {
                return;
            }

            if counter.fetch_add(1, Ordering::SeqCst) + 1 == hold_at {
                reached_tx.send(()).unwrap();

                loop {
                    let cancelled = slot
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|t| t.is_cancelled())
                        .unwrap_or(false);
                    if cancelled {
                        break;
                    }
                    thread::yield_now();
                }
            }
        });

        (
            Gate {
                pulses,
                token,
                reached,
            },
            line,
        )
    }

    fn watch(&self, token: &CancellationToken) {
        *self.token.lock().unwrap() = Some(token.clone());
    }

    fn wait_until_reached(&self) {
        self.reached
            .recv_timeout(Duration::from_secs(10))
            .expect("the held pulse was never sent");
    }
}

#[test]
fn move_a_single_motor_45_degrees() {
    let (engine, _clock, rx) = engine(single_motor(), SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]);

    let summary = engine.start(cfg).unwrap().wait();

    assert!(!summary.stopped);
    // 25 steps out, 25 back
    assert_eq!(engine.line().pulses(Pin(27)), 50);
    assert_eq!(summary.actuators[0].steps_moved, 0);
    let messages = messages(&rx);
    assert!(messages.contains(&String::from(
        "Motor 1: Moving to target position... (25/25)"
    )));
    assert!(messages.contains(&String::from(
        "Motor 1: Returning 25 steps to A position..."
    )));
    assert_eq!(
        messages.last().unwrap(),
        "Sequence complete: all 1 repetition(s) finished"
    );
}

#[test]
fn three_repetitions_together() {
    let (engine, _clock, rx) = engine(MachineConfig::reference(), SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![
        ActuatorConfig::new(60.0, 45.0),
        ActuatorConfig::new(100.0, 90.0).with_start_delay(Duration::from_millis(500)),
        ActuatorConfig::new(200.0, 30.0).with_origin(Origin::B),
    ])
    .with_repetitions(3);

    let summary = engine.start(cfg).unwrap().wait();

    assert_eq!(summary.completed_repetitions, 3);
    let events: Vec<_> = rx.try_iter().collect();
    let cycles = events
        .iter()
        .filter(|e| match e.kind {
            EventKind::CycleComplete { .. } => true,
            _ => false,
        })
        .count();
    let waits = events
        .iter()
        .filter(|e| match e.kind {
            EventKind::WaitingForNextRepetition { pause } => {
                pause == Duration::from_secs(2)
            },
            _ => false,
        })
        .count();
    let completions = events.iter().filter(|e| e.kind.is_terminal()).count();
    assert_eq!(cycles, 3);
    assert_eq!(waits, 2);
    assert_eq!(completions, 1);
    // 45 degrees is 50 steps on the reference machine, reported every 25
    let progress: Vec<_> = events
        .iter()
        .map(|e| e.to_string())
        .filter(|m| m.starts_with("Motor 1: Returning..."))
        .collect();
    assert_eq!(progress.len(), 6);
    assert!(progress.contains(&String::from("Motor 1: Returning... (25/50)")));
    assert!(progress.contains(&String::from("Motor 1: Returning... (50/50)")));
    assert_eq!(
        events.last().unwrap().kind,
        EventKind::SequenceComplete { repetitions: 3 }
    );
    assert_eq!(engine.status().state, EngineState::Finished);
}

#[test]
fn stopping_part_way_through_a_move() {
    let (gate, line) = Gate::new(10);
    let (engine, _clock, rx) = engine(single_motor(), line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]);

    let mut handle = engine.start(cfg).unwrap();
    gate.watch(handle.cancellation_token());
    gate.wait_until_reached();

    assert!(handle.stop());
    assert!(!handle.stop());
    let summary = handle.wait();

    assert!(summary.stopped);
    assert_eq!(summary.completed_repetitions, 0);
    assert_eq!(summary.actuators[0].steps_moved, 10);
    assert_eq!(summary.actuators[0].phase, Phase::Stopped);
    assert_eq!(summary.homing, None);
    assert_eq!(gate.pulses.load(Ordering::SeqCst), 10);
    assert_eq!(engine.status().state, EngineState::Idle);
    assert!(!engine.is_running());

    let messages = messages(&rx);
    assert!(messages.contains(&String::from(
        "Motor 1: stopped after 10/25 steps (move to target)"
    )));
    let stop_requests = messages
        .iter()
        .filter(|m| m.starts_with("Stop requested"))
        .count();
    assert_eq!(stop_requests, 1);
    assert_eq!(
        messages.last().unwrap(),
        "Sequence stopped after 0 completed repetition(s)"
    );
}

#[test]
fn stop_and_return_sends_the_motor_home() {
    let (gate, line) = Gate::new(10);
    let (engine, _clock, rx) = engine(single_motor(), line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]);

    let mut handle = engine.start(cfg).unwrap();
    gate.watch(handle.cancellation_token());
    gate.wait_until_reached();

    assert!(handle.stop_and_return());
    let summary = handle.wait();

    assert!(summary.stopped);
    assert_eq!(
        summary.homing,
        Some(ReturnReport {
            returned: vec![0],
            ..ReturnReport::default()
        })
    );
    assert_eq!(summary.actuators[0].steps_moved, 0);
    assert_eq!(summary.actuators[0].phase, Phase::Complete);
    // 10 out, 10 back
    assert_eq!(gate.pulses.load(Ordering::SeqCst), 20);
    assert!(messages(&rx).contains(&String::from(
        "Motor 1: Returning 10 steps to A position..."
    )));
}

#[test]
fn only_one_run_at_a_time() {
    let (gate, line) = Gate::new(10);
    let (engine, _clock, rx) = engine(single_motor(), line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]);

    let mut handle = engine.start(cfg.clone()).unwrap();
    gate.watch(handle.cancellation_token());
    gate.wait_until_reached();

    assert!(engine.is_running());
    match engine.start(cfg) {
        Err(EngineError::AlreadyRunning) => {},
        other => panic!("Expected AlreadyRunning, found {:?}", other.err()),
    }
    assert!(messages(&rx).contains(&String::from(
        "Cannot start: a sequence is already running"
    )));

    handle.stop();
}

#[test]
fn a_failed_claim_releases_everything_claimed_so_far() {
    let line = SimulatedLine::new().with_unavailable_pin(Pin(23));
    let (engine, _clock, _rx) = engine(MachineConfig::reference(), line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::default(); 3]);

    let got = engine.start(cfg);

    match got {
        Err(EngineError::HardwareClaim { actuator, pin, .. }) => {
            assert_eq!(actuator, 1);
            assert_eq!(pin, Pin(23));
        },
        other => panic!("Expected a claim failure, found {:?}", other.err()),
    }
    assert_eq!(engine.line().claim_history(), vec![Pin(27), Pin(17)]);
    assert_eq!(engine.line().released(), vec![Pin(17), Pin(27)]);
    assert!(!engine.line().is_claimed(Pin(27)));
    assert_eq!(engine.line().pulses(Pin(27)), 0);
    assert_eq!(engine.status().state, EngineState::Idle);
}

#[test]
fn every_motor_is_home_after_a_cycle() {
    for &mode in &[ReturnMode::Together, ReturnMode::Sequential] {
        let (engine, _clock, _rx) = engine(MachineConfig::reference(), SimulatedLine::new());
        let cfg = SequenceConfig::new(vec![
            ActuatorConfig::new(60.0, 45.0),
            ActuatorConfig::new(150.0, 180.0).with_origin(Origin::B),
            ActuatorConfig::new(300.0, 15.0).with_start_delay(Duration::from_secs(2)),
        ])
        .with_return_mode(mode)
        .with_repetitions(2);

        let summary = engine.start(cfg).unwrap().wait();

        assert_eq!(summary.completed_repetitions, 2, "{:?}", mode);
        for actuator in &summary.actuators {
            assert_eq!(actuator.steps_moved, 0, "{:?}", mode);
            assert_eq!(actuator.phase, Phase::Complete, "{:?}", mode);
        }
        assert_eq!(engine.status().actuators, summary.actuators);
    }
}

#[test]
fn returns_only_start_once_all_movement_has_finished() {
    let (engine, _clock, rx) = engine(MachineConfig::reference(), SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![
        ActuatorConfig::new(300.0, 15.0),
        ActuatorConfig::new(10.0, 45.0).with_start_delay(Duration::from_secs(1)),
        ActuatorConfig::new(60.0, 180.0).with_start_delay(Duration::from_millis(300)),
    ])
    .with_repetitions(2);

    engine.start(cfg).unwrap().wait();

    let mut moving = false;
    let mut returning = false;
    for event in rx.try_iter() {
        match event.kind {
            EventKind::RepetitionStarted { .. } => {
                moving = true;
                returning = false;
            },
            EventKind::AllMovementFinished => {
                assert!(moving);
                moving = false;
                returning = true;
            },
            EventKind::ActuatorStarted { .. }
            | EventKind::MoveProgress { .. }
            | EventKind::TargetReached { .. } => {
                assert!(moving, "{} happened after the returns started", event)
            },
            EventKind::Returning { .. }
            | EventKind::ReturnProgress { .. }
            | EventKind::Returned { .. }
            | EventKind::AlreadyAtOrigin { .. } => {
                assert!(returning, "{} happened before movement finished", event)
            },
            _ => {},
        }
    }
}

#[test]
fn a_faulty_motor_doesnt_stop_the_others() {
    let line = SimulatedLine::new().with_failing_pin(Pin(22));
    let (engine, _clock, rx) = engine(MachineConfig::reference(), line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::default(); 3]);

    let summary = engine.start(cfg).unwrap().wait();

    assert!(!summary.stopped);
    assert_eq!(summary.completed_repetitions, 1);
    assert_eq!(engine.line().pulses(Pin(27)), 100);
    assert_eq!(engine.line().pulses(Pin(23)), 0);
    assert_eq!(engine.line().pulses(Pin(24)), 100);
    let messages = messages(&rx);
    assert!(messages
        .iter()
        .any(|m| m.starts_with("Motor 2: hardware fault during move to target")));
    assert!(messages.contains(&String::from("Motor 2: Already at origin (A position).")));
}

#[test]
fn repetition_overrides_extend_the_run_for_one_motor() {
    let (engine, _clock, rx) = engine(MachineConfig::reference(), SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![
        ActuatorConfig::default(),
        ActuatorConfig::default(),
        ActuatorConfig::default().with_repetitions(3),
    ]);

    let summary = engine.start(cfg).unwrap().wait();

    assert_eq!(summary.total_repetitions, 3);
    assert_eq!(summary.completed_repetitions, 3);
    // 45 degrees is 50 steps on the reference machine
    assert_eq!(engine.line().pulses(Pin(27)), 100);
    assert_eq!(engine.line().pulses(Pin(23)), 100);
    assert_eq!(engine.line().pulses(Pin(24)), 300);
    assert_eq!(
        rx.try_iter().last().map(|e| e.kind),
        Some(EventKind::SequenceComplete { repetitions: 3 })
    );
}

#[test]
fn sequential_returns_pause_even_for_motors_already_home() {
    let machine = MachineConfig::new(200)
        .with_actuator(ActuatorPins::new(2, 3))
        .unwrap()
        .with_actuator(ActuatorPins::new(4, 5))
        .unwrap()
        .with_actuator(ActuatorPins::new(6, 7))
        .unwrap()
        .with_limits(Limits {
            speed_rpm: 0.0..=300.0,
            ..Limits::default()
        });
    let (engine, clock, rx) = engine(machine, SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![
        ActuatorConfig::new(60.0, 45.0),
        ActuatorConfig::new(0.0, 45.0),
        ActuatorConfig::new(60.0, 45.0),
    ])
    .with_return_mode(ReturnMode::Sequential);

    let summary = engine.start(cfg).unwrap().wait();

    assert!(!summary.stopped);
    let messages = messages(&rx);
    assert!(messages.contains(&String::from(
        "Motor 2: not moving, a speed of 0 RPM has no step rate"
    )));
    let returns: Vec<_> = messages
        .iter()
        .filter(|m| m.contains("Returned") || m.contains("Already at origin"))
        .cloned()
        .collect();
    assert_eq!(
        returns,
        vec![
            "Motor 1: Returned to A position.",
            "Motor 2: Already at origin (A position).",
            "Motor 3: Returned to A position.",
        ]
    );
    // moves: 2 x (25 steps at 5ms + 3s dwell)
    // returns: 2 x 25 steps at 10ms
    // pauses: after motor 1 and motor 2
    assert_eq!(
        clock.slept(),
        Duration::from_millis(2 * (125 + 3000) + 2 * 250 + 2 * 1000)
    );
}

#[test]
fn sequential_runs_wait_five_seconds_between_repetitions() {
    let (engine, clock, rx) = engine(single_motor(), SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)])
        .with_return_mode(ReturnMode::Sequential)
        .with_repetitions(2);

    let summary = engine.start(cfg).unwrap().wait();

    assert_eq!(summary.completed_repetitions, 2);
    let waits: Vec<_> = rx
        .try_iter()
        .filter_map(|e| match e.kind {
            EventKind::WaitingForNextRepetition { pause } => Some(pause),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![Duration::from_secs(5)]);
    // 2 x (25 steps at 5ms + 3s dwell + 25 steps back at 10ms), one 5s pause
    assert_eq!(
        clock.slept(),
        Duration::from_millis(2 * (125 + 3000 + 250) + 5000)
    );
}

/// Behaves like a [`SimulatedLine`] except pins can never be given back.
struct StuckLine(SimulatedLine);

impl HardwareLine for StuckLine {
    type Error = SimulatedLineError;

    fn claim(&self, pin: Pin) -> Result<(), Self::Error> { self.0.claim(pin) }

    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        self.0.set_output(pin, level)
    }

    fn release(&self, pin: Pin) -> Result<(), Self::Error> {
        Err(SimulatedLineError::Unavailable(pin))
    }
}

#[test]
fn a_failed_release_doesnt_stop_the_run_finishing() {
    let (engine, _clock, rx) = engine(single_motor(), StuckLine(SimulatedLine::new()));
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]);

    let summary = engine.start(cfg).unwrap().wait();

    assert!(!summary.stopped);
    assert_eq!(summary.completed_repetitions, 1);
    assert_eq!(engine.status().state, EngineState::Finished);
    assert!(!engine.is_running());
    assert!(engine.line().0.is_claimed(Pin(27)));
    assert_eq!(
        messages(&rx).last().unwrap(),
        "Sequence complete: all 1 repetition(s) finished"
    );
}

#[test]
fn a_slow_stop_stays_stopping_until_the_motors_halt() {
    let (first_write, started) = unbounded();
    let line = func_line(move |_pin, _level| {
        let _ = first_write.try_send(());
        thread::sleep(Duration::from_millis(300));
    });
    let machine = single_motor().with_timings(Timings {
        stop_timeout: Duration::from_millis(50),
        ..Timings::default()
    });
    let (engine, _clock, _rx) = engine(machine, line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]);

    let mut handle = engine.start(cfg).unwrap();
    started.recv_timeout(Duration::from_secs(10)).unwrap();

    assert!(handle.stop());
    assert_eq!(engine.status().state, EngineState::Stopping);
    assert!(engine.is_running());
    assert!(!handle.stop());

    let summary = handle.wait();

    assert!(summary.stopped);
    assert_eq!(engine.status().state, EngineState::Idle);
    assert!(!engine.is_running());
}

#[test]
fn a_return_cut_short_is_reported_for_the_whole_sequence() {
    let machine = MachineConfig::new(200)
        .with_actuator(ActuatorPins::new(27, 17))
        .unwrap()
        .with_actuator(ActuatorPins::new(23, 22))
        .unwrap();
    // 25 steps out, then hold the 10th step back
    let (gate, line) = Gate::new(35);
    let (engine, _clock, rx) = engine(machine, line);
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0); 2])
        .with_return_mode(ReturnMode::Sequential)
        .with_repetitions(2);

    let mut handle = engine.start(cfg).unwrap();
    gate.watch(handle.cancellation_token());
    gate.wait_until_reached();

    assert!(handle.stop());
    let summary = handle.wait();

    assert!(summary.stopped);
    assert_eq!(summary.completed_repetitions, 0);
    assert_eq!(
        summary.last_return,
        Some(ReturnReport {
            interrupted: vec![0],
            skipped: vec![1],
            ..ReturnReport::default()
        })
    );
    assert_eq!(summary.actuators[0].steps_moved, 15);
    assert_eq!(summary.actuators[1].steps_moved, 25);

    let events: Vec<_> = rx.try_iter().collect();
    let early: Vec<_> = events
        .iter()
        .filter(|e| match e.kind {
            EventKind::ReturnEndedEarly { .. } => true,
            _ => false,
        })
        .collect();
    assert_eq!(early.len(), 1);
    assert_eq!(
        early[0].to_string(),
        "Return sequence ended early (interrupted: Motor 1, skipped: Motor 2)"
    );
    assert!(events
        .iter()
        .all(|e| e.kind != EventKind::CycleComplete { repetition: 0, total: 2 }));
}

#[test]
fn a_completed_run_keeps_its_last_return() {
    let (engine, _clock, _rx) = engine(single_motor(), SimulatedLine::new());
    let cfg = SequenceConfig::new(vec![ActuatorConfig::new(60.0, 45.0)]).with_repetitions(2);

    let summary = engine.start(cfg).unwrap().wait();

    assert_eq!(
        summary.last_return,
        Some(ReturnReport {
            returned: vec![0],
            ..ReturnReport::default()
        })
    );
}

#[test]
fn a_machine_without_motors_cant_start() {
    let (engine, _clock, _rx) = engine(MachineConfig::new(200), SimulatedLine::new());
    let cfg = SequenceConfig::new(Vec::new()).with_repetitions(3);

    match engine.start(cfg) {
        Err(EngineError::Config(ConfigError::NoActuators)) => {},
        other => panic!("Expected NoActuators, found {:?}", other.err()),
    }
    assert!(!engine.is_running());
}
