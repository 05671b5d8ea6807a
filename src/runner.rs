use crate::{
    clock::sleep_unless_cancelled,
    events::{EventKind, Reporter},
    timing, Actuator, ActuatorPins, CancellationToken, Clock, Direction,
    HardwareLine, Level, Phase, Timings,
};
use std::time::Duration;

/// Everything a motion task borrows from the run which spawned it.
pub(crate) struct Motion<'a, L> {
    pub(crate) line: &'a L,
    pub(crate) clock: &'a dyn Clock,
    pub(crate) token: &'a CancellationToken,
    pub(crate) reporter: &'a Reporter,
    pub(crate) timings: &'a Timings,
    pub(crate) steps_per_revolution: u32,
}

pub(crate) enum PulseOutcome<E> {
    Finished,
    Cancelled { steps: u32 },
    Failed { steps: u32, error: E },
}

impl<'a, L: HardwareLine> Motion<'a, L> {
    /// Sleep for `duration`, waking up regularly to check for cancellation.
    pub(crate) fn pause(&self, duration: Duration) -> bool {
        sleep_unless_cancelled(
            self.clock,
            duration,
            self.timings.cancel_poll_interval,
            self.token,
        )
    }

    /// Set the direction pin, then send `total` step pulses.
    ///
    /// Cancellation is checked before every pulse, so a stop takes effect
    /// within one step. `on_step` is told how many steps have been taken
    /// after each pulse completes.
    pub(crate) fn pulse<F>(
        &self,
        pins: ActuatorPins,
        direction: Direction,
        total: u32,
        half_step: Duration,
        mut on_step: F,
    ) -> PulseOutcome<L::Error>
    where
        F: FnMut(u32),
    {
        if let Err(error) = self.line.set_output(pins.direction, direction.level()) {
            return PulseOutcome::Failed { steps: 0, error };
        }

        for done in 0..total {
            if self.token.is_cancelled() {
                return PulseOutcome::Cancelled { steps: done };
            }

            if let Err(error) = self.step(pins, half_step) {
                return PulseOutcome::Failed { steps: done, error };
            }

            on_step(done + 1);
        }

        PulseOutcome::Finished
    }

    fn step(&self, pins: ActuatorPins, half_step: Duration) -> Result<(), L::Error> {
        self.line.set_output(pins.step, Level::High)?;
        self.clock.sleep(half_step);
        self.line.set_output(pins.step, Level::Low)?;
        self.clock.sleep(half_step);

        Ok(())
    }

    pub(crate) fn reports_progress(&self, steps: u32) -> bool {
        let quantum = self.timings.progress_quantum;
        quantum > 0 && steps % quantum == 0
    }
}

/// How an actuator's forward motion ended.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MovementOutcome {
    /// Reached the target and finished dwelling.
    Completed { steps: u32 },
    /// The configured speed has no step rate, nothing moved.
    NotMoving,
    Stopped { phase: Phase, steps: u32, total: u32 },
    Faulted { phase: Phase, steps: u32 },
}

/// Runs one actuator through the forward half of a cycle: start delay, move
/// to target, then dwell.
///
/// Returning to the origin is the [`crate::returns`] module's job.
pub(crate) struct ActuatorRunner<'m, 'a, L> {
    motion: &'m Motion<'a, L>,
}

impl<'m, 'a, L: HardwareLine> ActuatorRunner<'m, 'a, L> {
    pub(crate) fn new(motion: &'m Motion<'a, L>) -> Self { ActuatorRunner { motion } }

    pub(crate) fn run(&self, actuator: &mut Actuator) -> MovementOutcome {
        let Actuator {
            index,
            pins,
            config,
            state,
        } = actuator;
        let index = *index;
        let pins = *pins;
        let motion = self.motion;
        let reporter = motion.reporter;
        let total = timing::steps_for_angle(
            motion.steps_per_revolution,
            config.target_angle_degrees,
        );

        state.set_phase(Phase::Delaying);
        if !motion.pause(config.start_delay) {
            return stopped(reporter, index, state, Phase::Delaying, 0, total);
        }

        let half_step =
            match timing::half_step_delay(motion.steps_per_revolution, config.speed_rpm) {
                Ok(h) => h,
                Err(e) => {
                    log::debug!("[{}] {}", crate::ActuatorName(index), e);
                    reporter.actuator(
                        index,
                        EventKind::NotMoving {
                            speed_rpm: config.speed_rpm,
                        },
                    );
                    state.set_phase(Phase::Complete);
                    return MovementOutcome::NotMoving;
                },
            };

        reporter.actuator(
            index,
            EventKind::ActuatorStarted {
                speed_rpm: config.speed_rpm,
                start_delay: config.start_delay,
                origin: config.origin,
                target_angle_degrees: config.target_angle_degrees,
            },
        );

        let direction = config.origin.outbound();
        state.set_phase(Phase::Moving);
        state.set_direction(direction);

        let outcome = motion.pulse(pins, direction, total, half_step, |steps| {
            state.record_step();

            if motion.reports_progress(steps) {
                reporter.actuator(index, EventKind::MoveProgress { steps, total });
            }
        });

        match outcome {
            PulseOutcome::Finished => {},
            PulseOutcome::Cancelled { steps } => {
                return stopped(reporter, index, state, Phase::Moving, steps, total);
            },
            PulseOutcome::Failed { steps, error } => {
                state.set_phase(Phase::Stopped);
                reporter.actuator(
                    index,
                    EventKind::Fault {
                        phase: Phase::Moving,
                        reason: error.to_string(),
                    },
                );
                return MovementOutcome::Faulted {
                    phase: Phase::Moving,
                    steps,
                };
            },
        }

        let dwell = motion.timings.dwell;
        reporter.actuator(index, EventKind::TargetReached { dwell });
        state.set_phase(Phase::Dwelling);

        if !motion.pause(dwell) {
            return stopped(reporter, index, state, Phase::Dwelling, total, total);
        }

        MovementOutcome::Completed { steps: total }
    }
}

fn stopped(
    reporter: &Reporter,
    index: usize,
    state: &mut crate::ActuatorState,
    phase: Phase,
    steps: u32,
    total: u32,
) -> MovementOutcome {
    state.set_phase(Phase::Stopped);
    reporter.actuator(
        index,
        EventKind::Stopped {
            phase,
            steps,
            total,
        },
    );

    MovementOutcome::Stopped {
        phase,
        steps,
        total,
    }
}
