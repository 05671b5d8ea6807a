use crate::{
    events::EventKind, runner::Motion, runner::PulseOutcome, timing, Actuator,
    ActuatorName, HardwareLine, Phase, ReturnMode,
};
use std::thread;

/// What happened to each actuator while bringing them home.
///
/// Every list holds actuator indices.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReturnReport {
    /// Back at the origin after moving.
    pub returned: Vec<usize>,
    /// Nothing to do, the actuator never left.
    pub already_home: Vec<usize>,
    /// Cancelled part-way through their return.
    pub interrupted: Vec<usize>,
    /// Never got a turn because the sequence was cancelled first.
    pub skipped: Vec<usize>,
    /// The hardware failed while returning.
    pub faulted: Vec<usize>,
}

impl ReturnReport {
    /// Did every actuator make it back to its origin?
    pub fn is_complete(&self) -> bool {
        self.interrupted.is_empty() && self.skipped.is_empty() && self.faulted.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum ReturnOutcome {
    Returned,
    AlreadyHome,
    Interrupted,
    Faulted,
}

/// Brings actuators back to their origin, either all at once or one after
/// the other.
pub(crate) struct ReturnCoordinator<'m, 'a, L> {
    motion: &'m Motion<'a, L>,
}

impl<'m, 'a, L: HardwareLine> ReturnCoordinator<'m, 'a, L> {
    pub(crate) fn new(motion: &'m Motion<'a, L>) -> Self { ReturnCoordinator { motion } }

    pub(crate) fn run(&self, mode: ReturnMode, actuators: &mut [&mut Actuator]) -> ReturnReport {
        let report = match mode {
            ReturnMode::Together => self.together(actuators),
            ReturnMode::Sequential => self.sequential(actuators),
        };

        if report.is_complete() {
            log::debug!("[Return] All motors are home");
        } else {
            log::warn!(
                "[Return] Return finished early (interrupted: {:?}, skipped: {:?}, faulted: {:?})",
                report.interrupted,
                report.skipped,
                report.faulted
            );
        }

        report
    }

    /// Launch every return at once and wait for all of them.
    fn together(&self, actuators: &mut [&mut Actuator]) -> ReturnReport {
        let mut report = ReturnReport::default();
        let mut panicked = Vec::new();

        thread::scope(|s| {
            let mut handles = Vec::new();

            for actuator in actuators.iter_mut() {
                let index = actuator.index;

                if actuator.state.steps_moved() == 0 {
                    let outcome = self.return_one(actuator);
                    record(&mut report, index, outcome);
                    continue;
                }

                let actuator: &mut Actuator = actuator;
                handles.push((index, s.spawn(move || self.return_one(actuator))));
            }

            for (index, handle) in handles {
                match handle.join() {
                    Ok(outcome) => record(&mut report, index, outcome),
                    Err(_) => {
                        log::error!("[{}] The return task panicked", ActuatorName(index));
                        panicked.push(index);
                    },
                }
            }
        });

        for actuator in actuators.iter_mut().filter(|a| panicked.contains(&a.index)) {
            actuator.state.set_phase(Phase::Stopped);
            report.faulted.push(actuator.index);
        }

        report.returned.sort();
        report.interrupted.sort();
        report.faulted.sort();

        report
    }

    /// Return each actuator in declaration order, pausing between them.
    fn sequential(&self, actuators: &mut [&mut Actuator]) -> ReturnReport {
        let mut report = ReturnReport::default();
        let count = actuators.len();

        for position in 0..count {
            if self.motion.token.is_cancelled() {
                for skipped in actuators[position..].iter() {
                    self.motion
                        .reporter
                        .actuator(skipped.index, EventKind::ReturnSkipped);
                    report.skipped.push(skipped.index);
                }
                break;
            }

            let actuator: &mut Actuator = &mut *actuators[position];
            let index = actuator.index;

            let outcome = thread::scope(|s| s.spawn(move || self.return_one(actuator)).join());

            match outcome {
                Ok(outcome) => record(&mut report, index, outcome),
                Err(_) => {
                    log::error!("[{}] The return task panicked", ActuatorName(index));
                    actuators[position].state.set_phase(Phase::Stopped);
                    report.faulted.push(index);
                },
            }

            if position + 1 < count {
                log::debug!(
                    "[Return] Waiting {:?} before the next motor",
                    self.motion.timings.inter_actuator_pause
                );
                // a cancelled pause is picked up at the top of the loop
                self.motion.pause(self.motion.timings.inter_actuator_pause);
            }
        }

        report
    }

    /// Drive one actuator back to its origin, spending its `steps_moved`
    /// budget.
    fn return_one(&self, actuator: &mut Actuator) -> ReturnOutcome {
        let Actuator {
            index,
            pins,
            config,
            state,
        } = actuator;
        let index = *index;
        let motion = self.motion;
        let reporter = motion.reporter;
        let budget = state.steps_moved();

        if budget == 0 {
            reporter.actuator(index, EventKind::AlreadyAtOrigin { origin: config.origin });
            state.set_phase(Phase::Complete);
            return ReturnOutcome::AlreadyHome;
        }

        let speed = config.speed_rpm * motion.timings.return_speed_factor;
        let half_step = match timing::half_step_delay(motion.steps_per_revolution, speed) {
            Ok(h) => h,
            Err(e) => {
                state.set_phase(Phase::Stopped);
                reporter.actuator(
                    index,
                    EventKind::Fault {
                        phase: Phase::Returning,
                        reason: e.to_string(),
                    },
                );
                return ReturnOutcome::Faulted;
            },
        };

        let direction = config.origin.outbound().reversed();
        state.set_phase(Phase::Returning);
        state.set_direction(direction);
        reporter.actuator(
            index,
            EventKind::Returning {
                steps: budget,
                origin: config.origin,
            },
        );

        let outcome = motion.pulse(*pins, direction, budget, half_step, |steps| {
            state.record_return_step();

            if motion.reports_progress(steps) {
                reporter.actuator(index, EventKind::ReturnProgress { steps, total: budget });
            }
        });

        match outcome {
            PulseOutcome::Finished => {
                state.set_phase(Phase::Complete);
                reporter.actuator(index, EventKind::Returned { origin: config.origin });
                ReturnOutcome::Returned
            },
            PulseOutcome::Cancelled { steps } => {
                state.set_phase(Phase::Stopped);
                reporter.actuator(
                    index,
                    EventKind::Stopped {
                        phase: Phase::Returning,
                        steps,
                        total: budget,
                    },
                );
                ReturnOutcome::Interrupted
            },
            PulseOutcome::Failed { error, .. } => {
                state.set_phase(Phase::Stopped);
                reporter.actuator(
                    index,
                    EventKind::Fault {
                        phase: Phase::Returning,
                        reason: error.to_string(),
                    },
                );
                ReturnOutcome::Faulted
            },
        }
    }
}

fn record(report: &mut ReturnReport, index: usize, outcome: ReturnOutcome) {
    let list = match outcome {
        ReturnOutcome::Returned => &mut report.returned,
        ReturnOutcome::AlreadyHome => &mut report.already_home,
        ReturnOutcome::Interrupted => &mut report.interrupted,
        ReturnOutcome::Faulted => &mut report.faulted,
    };

    list.push(index);
}
