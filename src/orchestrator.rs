//! Running a whole sequence, repetition after repetition.
//!
//! A run happens on its own coordinator thread. Each repetition the
//! coordinator spawns one scoped thread per participating actuator for the
//! forward motion, joins them all, then hands the actuators to the
//! [`ReturnCoordinator`]. Control comes back to the caller through a
//! [`RunHandle`].

use crate::{
    events::{EventKind, Reporter},
    returns::{ReturnCoordinator, ReturnReport},
    runner::{ActuatorRunner, Motion, MovementOutcome},
    Actuator, ActuatorName, ActuatorSnapshot, ActuatorState, CancellationToken,
    Clock, EngineError, HardwareLine, MachineConfig, OperatingSystemClock,
    Origin, Phase, Pin, ReturnMode, SequenceConfig, StatusSink,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// The orchestrator's lifecycle.
///
/// ```text
/// Idle -> Running -> Finished
///            |
///            v
///         Stopping -> Idle
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running { repetition: u32 },
    Stopping,
    Finished,
}

impl EngineState {
    /// Is a coordinator thread alive?
    pub fn is_active(self) -> bool {
        match self {
            EngineState::Running { .. } | EngineState::Stopping => true,
            EngineState::Idle | EngineState::Finished => false,
        }
    }
}

impl Display for EngineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => f.write_str("idle"),
            EngineState::Running { repetition } => {
                write!(f, "running repetition {}", repetition + 1)
            },
            EngineState::Stopping => f.write_str("stopping"),
            EngineState::Finished => f.write_str("finished"),
        }
    }
}

/// A diagnostic view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub completed_repetitions: u32,
    pub total_repetitions: u32,
    /// The state of each actuator as of the last phase boundary.
    pub actuators: Vec<ActuatorSnapshot>,
}

/// What a run achieved.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub completed_repetitions: u32,
    pub total_repetitions: u32,
    /// Did the run end early because somebody asked it to stop?
    pub stopped: bool,
    pub actuators: Vec<ActuatorSnapshot>,
    /// The result of sending everything home after a
    /// [`RunHandle::stop_and_return()`].
    pub homing: Option<ReturnReport>,
    /// How the most recent cycle's return went.
    pub last_return: Option<ReturnReport>,
}

/// The status shared between the orchestrator, its coordinator thread and
/// any [`RunHandle`]s.
#[derive(Debug)]
struct Shared {
    status: EngineStatus,
    /// Incremented for every run so a stale handle can't touch a newer run.
    run: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives a fixed set of actuators through [`SequenceConfig`]s.
pub struct SequenceOrchestrator<L> {
    machine: MachineConfig,
    line: Arc<L>,
    reporter: Reporter,
    sink: Arc<dyn StatusSink>,
    clock: Arc<dyn Clock>,
    shared: Arc<Mutex<Shared>>,
}

impl<L: HardwareLine + 'static> SequenceOrchestrator<L> {
    pub fn new<S>(machine: MachineConfig, line: L, sink: S) -> SequenceOrchestrator<L>
    where
        S: StatusSink + 'static,
    {
        let sink: Arc<dyn StatusSink> = Arc::new(sink);
        let clock: Arc<dyn Clock> = Arc::new(OperatingSystemClock::new());
        let status = EngineStatus {
            state: EngineState::Idle,
            completed_repetitions: 0,
            total_repetitions: 0,
            actuators: idle_snapshots(machine.actuator_count()),
        };

        SequenceOrchestrator {
            machine,
            line: Arc::new(line),
            reporter: Reporter::new(Arc::clone(&sink), Arc::clone(&clock)),
            sink,
            clock,
            shared: Arc::new(Mutex::new(Shared { status, run: 0 })),
        }
    }

    /// Use a different time source, typically a
    /// [`SimulatedClock`](crate::SimulatedClock) in tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.reporter = Reporter::new(Arc::clone(&self.sink), Arc::clone(&self.clock));
        self
    }

    pub fn machine(&self) -> &MachineConfig { &self.machine }

    pub fn line(&self) -> &L { &self.line }

    pub fn status(&self) -> EngineStatus { lock(&self.shared).status.clone() }

    pub fn is_running(&self) -> bool { lock(&self.shared).status.state.is_active() }

    /// Start a new run in the background.
    ///
    /// # Errors
    ///
    /// Nothing moves and no thread is spawned when this fails. Any pins
    /// claimed before a claim failure are released again.
    pub fn start(&self, config: SequenceConfig) -> Result<RunHandle, EngineError> {
        let mut shared = lock(&self.shared);

        if shared.status.state.is_active() {
            drop(shared);
            let msg = "Cannot start: a sequence is already running";
            log::warn!("[Sequence] {}", msg);
            self.reporter.sequence(EventKind::Warning(String::from(msg)));
            return Err(EngineError::AlreadyRunning);
        }

        config.validate(&self.machine)?;
        let claims = ClaimGuard::claim_all(&self.line, &self.machine)?;

        let total = config.total_repetitions();
        let token = CancellationToken::new();
        let homing = CancellationToken::new();
        let return_on_stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        shared.run += 1;
        let run_id = shared.run;
        let previous = shared.status.clone();
        shared.status = EngineStatus {
            state: EngineState::Running { repetition: 0 },
            completed_repetitions: 0,
            total_repetitions: total,
            actuators: idle_snapshots(self.machine.actuator_count()),
        };

        let run = Run {
            machine: self.machine.clone(),
            config,
            line: Arc::clone(&self.line),
            reporter: self.reporter.clone(),
            clock: Arc::clone(&self.clock),
            token: token.clone(),
            homing: homing.clone(),
            return_on_stop: Arc::clone(&return_on_stop),
            shared: Arc::clone(&self.shared),
            claims,
            done: done_tx,
        };

        let spawned = thread::Builder::new()
            .name(String::from("sequence-coordinator"))
            .spawn(move || run.execute());

        let thread = match spawned {
            Ok(t) => t,
            Err(e) => {
                log::error!("[Sequence] Unable to spawn the coordinator: {}", e);
                // the closure (and with it the claims) has already been dropped
                shared.status = previous;
                return Err(EngineError::Spawn(e));
            },
        };

        Ok(RunHandle {
            run_id,
            token,
            homing,
            return_on_stop,
            reporter: self.reporter.clone(),
            shared: Arc::clone(&self.shared),
            stop_timeout: self.machine.timings.stop_timeout,
            done: done_rx,
            thread: Some(thread),
            summary: None,
            stop_requested: false,
        })
    }

    /// Stop a run. Equivalent to [`RunHandle::stop()`].
    pub fn stop(&self, handle: &mut RunHandle) -> bool { handle.stop() }
}

fn idle_snapshots(count: usize) -> Vec<ActuatorSnapshot> {
    (0..count)
        .map(|_| ActuatorState::new(Origin::A).snapshot())
        .collect()
}

/// Control over a run started by [`SequenceOrchestrator::start()`].
///
/// Dropping the handle leaves the run going in the background.
pub struct RunHandle {
    run_id: u64,
    token: CancellationToken,
    homing: CancellationToken,
    return_on_stop: Arc<AtomicBool>,
    reporter: Reporter,
    shared: Arc<Mutex<Shared>>,
    stop_timeout: Duration,
    done: Receiver<RunSummary>,
    thread: Option<JoinHandle<()>>,
    summary: Option<RunSummary>,
    stop_requested: bool,
}

impl RunHandle {
    /// Cancel the run and wait (up to [`Timings::stop_timeout`]) for every
    /// motor to halt.
    ///
    /// Motors are left where they stopped. Also cancels the homing started
    /// by [`RunHandle::stop_and_return()`].
    ///
    /// Returns `true` if this call is what stopped the run. Calling `stop()`
    /// again, or after the run finished, has no further effect.
    ///
    /// [`Timings::stop_timeout`]: crate::Timings::stop_timeout
    pub fn stop(&mut self) -> bool {
        let stopped_it = self.request_stop();
        self.homing.cancel();
        self.await_summary(self.stop_timeout);
        stopped_it
    }

    /// Cancel the run, then bring every motor which moved back to its
    /// origin once everything has halted.
    ///
    /// This doesn't wait, use [`RunHandle::wait()`] to find out how the
    /// homing went. A later [`RunHandle::stop()`] cancels the homing too.
    pub fn stop_and_return(&mut self) -> bool {
        self.return_on_stop.store(true, Ordering::SeqCst);
        self.request_stop()
    }

    /// Block until the run is over.
    pub fn wait(mut self) -> RunSummary {
        if let Some(summary) = self.summary.take() {
            return summary;
        }

        match self.done.recv() {
            Ok(summary) => {
                self.join_coordinator();
                summary
            },
            Err(_) => self.coordinator_lost(),
        }
    }

    /// The summary, if the run has already finished.
    pub fn try_summary(&mut self) -> Option<&RunSummary> {
        self.await_summary(Duration::new(0, 0));
        self.summary.as_ref()
    }

    /// The token shared by every task in this run.
    pub fn cancellation_token(&self) -> &CancellationToken { &self.token }

    fn request_stop(&mut self) -> bool {
        if self.stop_requested {
            return false;
        }

        let mut shared = lock(&self.shared);
        if shared.run != self.run_id {
            return false;
        }

        match shared.status.state {
            EngineState::Running { .. } => {
                self.stop_requested = true;
                shared.status.state = EngineState::Stopping;
                drop(shared);

                self.reporter.sequence(EventKind::StopRequested);
                self.token.cancel();
                true
            },
            _ => false,
        }
    }

    fn await_summary(&mut self, timeout: Duration) {
        if self.summary.is_some() {
            return;
        }

        let received = if timeout == Duration::new(0, 0) {
            self.done.try_recv().map_err(|e| match e {
                TryRecvError::Empty => RecvTimeoutError::Timeout,
                TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
            })
        } else {
            self.done.recv_timeout(timeout)
        };

        match received {
            Ok(summary) => {
                self.join_coordinator();
                self.summary = Some(summary);
            },
            Err(RecvTimeoutError::Timeout) => {
                if timeout > Duration::new(0, 0) {
                    log::warn!(
                        "[Sequence] Motors are still halting after {:?}",
                        timeout
                    );
                }
            },
            Err(RecvTimeoutError::Disconnected) => {
                let summary = self.coordinator_lost();
                self.summary = Some(summary);
            },
        }
    }

    fn join_coordinator(&mut self) {
        if let Some(thread) = self.thread.take() {
            // the summary is the coordinator's last act
            let _ = thread.join();
        }
    }

    /// The coordinator went away without a summary, so it must have
    /// panicked.
    fn coordinator_lost(&mut self) -> RunSummary {
        log::error!("[Sequence] The coordinator thread exited unexpectedly");
        self.token.cancel();
        self.join_coordinator();

        let mut shared = lock(&self.shared);
        if shared.run == self.run_id {
            shared.status.state = EngineState::Idle;
        }

        RunSummary {
            completed_repetitions: shared.status.completed_repetitions,
            total_repetitions: shared.status.total_repetitions,
            stopped: true,
            actuators: shared.status.actuators.clone(),
            homing: None,
            last_return: None,
        }
    }
}

/// Holds the run's pins, releasing them when dropped.
struct ClaimGuard<L: HardwareLine> {
    line: Arc<L>,
    pins: Vec<Pin>,
}

impl<L: HardwareLine> ClaimGuard<L> {
    fn claim_all(line: &Arc<L>, machine: &MachineConfig) -> Result<Self, EngineError> {
        let mut guard = ClaimGuard {
            line: Arc::clone(line),
            pins: Vec::new(),
        };

        for (actuator, pins) in machine.actuator_pins().iter().enumerate() {
            for &pin in &[pins.step, pins.direction] {
                if let Err(e) = line.claim(pin) {
                    log::error!(
                        "[{}] Unable to claim {}: {}",
                        ActuatorName(actuator),
                        pin,
                        e
                    );
                    return Err(EngineError::HardwareClaim {
                        actuator,
                        pin,
                        reason: e.to_string(),
                    });
                }

                guard.pins.push(pin);
            }
        }

        Ok(guard)
    }
}

impl<L: HardwareLine> Drop for ClaimGuard<L> {
    fn drop(&mut self) {
        for pin in self.pins.drain(..).rev() {
            if let Err(e) = self.line.release(pin) {
                log::warn!("[Sequence] Unable to release {}: {}", pin, e);
            }
        }
    }
}

/// Everything the coordinator thread owns.
struct Run<L: HardwareLine> {
    machine: MachineConfig,
    config: SequenceConfig,
    line: Arc<L>,
    reporter: Reporter,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    homing: CancellationToken,
    return_on_stop: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
    claims: ClaimGuard<L>,
    done: Sender<RunSummary>,
}

impl<L: HardwareLine> Run<L> {
    fn execute(self) {
        let total = self.config.total_repetitions();
        let mut actuators: Vec<Actuator> = self
            .machine
            .actuator_pins()
            .iter()
            .zip(self.config.actuators.iter())
            .enumerate()
            .map(|(index, (pins, cfg))| Actuator::new(index, *pins, cfg.clone()))
            .collect();

        self.reporter.sequence(EventKind::RunStarted {
            repetitions: total,
            return_mode: self.config.return_mode,
        });

        let (completed, last_return) = self.repeat(&mut actuators, total);
        let stopped = completed < total;

        let homing = if stopped && self.return_on_stop.load(Ordering::SeqCst) {
            Some(self.go_home(&mut actuators))
        } else {
            None
        };

        let summary = RunSummary {
            completed_repetitions: completed,
            total_repetitions: total,
            stopped,
            actuators: actuators.iter().map(|a| a.state.snapshot()).collect(),
            homing,
            last_return,
        };

        let Run {
            reporter,
            shared,
            claims,
            done,
            ..
        } = self;
        drop(claims);

        {
            let mut shared = lock(&shared);
            shared.status.completed_repetitions = completed;
            shared.status.actuators = summary.actuators.clone();
            shared.status.state = if stopped {
                EngineState::Idle
            } else {
                EngineState::Finished
            };
        }

        if stopped {
            reporter.sequence(EventKind::SequenceStopped {
                completed_repetitions: completed,
            });
        } else {
            reporter.sequence(EventKind::SequenceComplete { repetitions: total });
        }

        // the handle may have been dropped
        let _ = done.send(summary);
    }

    fn motion<'a>(&'a self, token: &'a CancellationToken) -> Motion<'a, L> {
        Motion {
            line: &*self.line,
            clock: &*self.clock,
            token,
            reporter: &self.reporter,
            timings: &self.machine.timings,
            steps_per_revolution: self.machine.steps_per_revolution,
        }
    }

    /// Run every repetition, returning how many were completed and the
    /// report from the last return that was attempted.
    fn repeat(
        &self,
        actuators: &mut [Actuator],
        total: u32,
    ) -> (u32, Option<ReturnReport>) {
        let motion = self.motion(&self.token);
        let mode = self.config.return_mode;
        let sequence_repetitions = self.config.repetition_count;
        let mut completed = 0;
        let mut last_return = None;

        for repetition in 0..total {
            if self.token.is_cancelled() || !self.enter_repetition(repetition) {
                break;
            }

            self.reporter
                .sequence(EventKind::RepetitionStarted { repetition, total });

            let mut participants: Vec<&mut Actuator> = actuators
                .iter_mut()
                .filter(|a| repetition < a.config.repetitions(sequence_repetitions))
                .collect();

            for actuator in participants.iter_mut() {
                let origin = actuator.config.origin;
                actuator.state.reset(origin);
            }

            move_all(&motion, &mut participants);
            self.publish(&participants);

            if self.token.is_cancelled() {
                break;
            }

            self.reporter.sequence(EventKind::AllMovementFinished);
            let report = ReturnCoordinator::new(&motion).run(mode, &mut participants);
            self.publish(&participants);

            if !report.interrupted.is_empty() || !report.skipped.is_empty() {
                self.reporter.sequence(EventKind::ReturnEndedEarly {
                    interrupted: report.interrupted.clone(),
                    skipped: report.skipped.clone(),
                });
            }
            last_return = Some(report);

            if self.token.is_cancelled() {
                break;
            }

            completed += 1;
            lock(&self.shared).status.completed_repetitions = completed;
            self.reporter
                .sequence(EventKind::CycleComplete { repetition, total });

            if repetition + 1 < total {
                let pause = self.machine.timings.pause_between_repetitions(mode);
                self.reporter
                    .sequence(EventKind::WaitingForNextRepetition { pause });

                if !motion.pause(pause) {
                    break;
                }
            }
        }

        (completed, last_return)
    }

    /// Bring everything with outstanding steps back to its origin after a
    /// stop.
    fn go_home(&self, actuators: &mut [Actuator]) -> ReturnReport {
        log::info!("[Sequence] Returning all motors to their origin");

        let motion = self.motion(&self.homing);
        let mut away: Vec<&mut Actuator> = actuators
            .iter_mut()
            .filter(|a| a.state.steps_moved() > 0)
            .collect();

        let report = ReturnCoordinator::new(&motion).run(ReturnMode::Together, &mut away);
        self.publish(&away);

        report
    }

    /// Move into the next repetition, unless a stop got there first.
    fn enter_repetition(&self, repetition: u32) -> bool {
        let mut shared = lock(&self.shared);

        match shared.status.state {
            EngineState::Running { .. } => {
                shared.status.state = EngineState::Running { repetition };
                true
            },
            _ => false,
        }
    }

    fn publish(&self, actuators: &[&mut Actuator]) {
        let mut shared = lock(&self.shared);

        for actuator in actuators {
            if let Some(slot) = shared.status.actuators.get_mut(actuator.index) {
                *slot = actuator.state.snapshot();
            }
        }
    }
}

/// Run the forward motion of every actuator concurrently, returning once
/// all of them have finished.
fn move_all<L: HardwareLine>(motion: &Motion<'_, L>, actuators: &mut [&mut Actuator]) {
    let runner = ActuatorRunner::new(motion);
    let runner = &runner;
    let mut panicked = Vec::new();

    thread::scope(|s| {
        let handles: Vec<_> = actuators
            .iter_mut()
            .map(|actuator| {
                let index = actuator.index;
                let actuator: &mut Actuator = actuator;
                (index, s.spawn(move || runner.run(actuator)))
            })
            .collect();

        for (index, handle) in handles {
            match handle.join() {
                Ok(MovementOutcome::Completed { steps }) => {
                    log::debug!("[{}] Movement finished after {} steps", ActuatorName(index), steps)
                },
                Ok(outcome) => {
                    log::debug!("[{}] Movement ended early: {:?}", ActuatorName(index), outcome)
                },
                Err(_) => {
                    log::error!("[{}] The movement task panicked", ActuatorName(index));
                    panicked.push(index);
                },
            }
        }
    });

    for actuator in actuators.iter_mut().filter(|a| panicked.contains(&a.index)) {
        actuator.state.set_phase(Phase::Stopped);
    }

    debug_assert!(actuators.iter().all(|a| a.state.phase().movement_finished()));
}
