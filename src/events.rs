//! Progress reporting.
//!
//! The engine produces [`StatusEvent`]s and hands them to a [`StatusSink`].
//! Sinks must never block the motion tasks, so the channel implementation
//! uses `try_send()` and drops events it can't queue.

use crate::{ActuatorName, Clock, Origin, Phase, ReturnMode};
use crossbeam_channel::{Sender, TrySendError};
use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

/// Something noteworthy which happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// When the event happened, according to the engine's clock.
    pub at: Duration,
    /// The actuator this event is about, if any.
    pub actuator: Option<usize>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    RunStarted {
        repetitions: u32,
        return_mode: ReturnMode,
    },
    RepetitionStarted {
        repetition: u32,
        total: u32,
    },
    ActuatorStarted {
        speed_rpm: f64,
        start_delay: Duration,
        origin: Origin,
        target_angle_degrees: f64,
    },
    /// The actuator has a speed which can't be turned into a step rate, so
    /// it stays where it is.
    NotMoving {
        speed_rpm: f64,
    },
    MoveProgress {
        steps: u32,
        total: u32,
    },
    TargetReached {
        dwell: Duration,
    },
    /// Cancellation was observed before the phase finished.
    Stopped {
        phase: Phase,
        steps: u32,
        total: u32,
    },
    /// The hardware failed, the actuator sits out the rest of the cycle.
    Fault {
        phase: Phase,
        reason: String,
    },
    AllMovementFinished,
    Returning {
        steps: u32,
        origin: Origin,
    },
    ReturnProgress {
        steps: u32,
        total: u32,
    },
    Returned {
        origin: Origin,
    },
    AlreadyAtOrigin {
        origin: Origin,
    },
    /// A one-at-a-time return was cancelled before this actuator's turn.
    ReturnSkipped,
    /// A cycle's return was cut short, leaving these actuators away from
    /// their origin.
    ReturnEndedEarly {
        interrupted: Vec<usize>,
        skipped: Vec<usize>,
    },
    CycleComplete {
        repetition: u32,
        total: u32,
    },
    WaitingForNextRepetition {
        pause: Duration,
    },
    SequenceComplete {
        repetitions: u32,
    },
    StopRequested,
    SequenceStopped {
        completed_repetitions: u32,
    },
    Warning(String),
}

impl EventKind {
    /// Does this event mark the end of a run?
    pub fn is_terminal(&self) -> bool {
        match self {
            EventKind::SequenceComplete { .. } | EventKind::SequenceStopped { .. } => true,
            _ => false,
        }
    }
}

impl Display for StatusEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(ix) = self.actuator {
            write!(f, "{}: ", ActuatorName(ix))?;
        }

        match &self.kind {
            EventKind::RunStarted {
                repetitions,
                return_mode,
            } => write!(
                f,
                "Starting sequence with {} repetition(s), returning {}",
                repetitions, return_mode
            ),
            EventKind::RepetitionStarted { repetition, total } => {
                write!(f, "Running sequence {}/{}", repetition + 1, total)
            },
            EventKind::ActuatorStarted {
                speed_rpm,
                start_delay,
                origin,
                target_angle_degrees,
            } => write!(
                f,
                "started at speed {} RPM after {:.1}s delay [Start: {}, Angle: {}°]",
                speed_rpm,
                start_delay.as_secs_f64(),
                origin,
                target_angle_degrees
            ),
            EventKind::NotMoving { speed_rpm } => {
                write!(f, "not moving, a speed of {} RPM has no step rate", speed_rpm)
            },
            EventKind::MoveProgress { steps, total } => {
                write!(f, "Moving to target position... ({}/{})", steps, total)
            },
            EventKind::TargetReached { dwell } => write!(
                f,
                "Reached target position! Waiting {} seconds...",
                dwell.as_secs_f64()
            ),
            EventKind::Stopped {
                phase,
                steps,
                total,
            } => write!(
                f,
                "stopped after {}/{} steps ({})",
                steps, total, phase
            ),
            EventKind::Fault { phase, reason } => {
                write!(f, "hardware fault during {}: {}", phase, reason)
            },
            EventKind::AllMovementFinished => {
                f.write_str("All motors reached target. Starting return sequence...")
            },
            EventKind::Returning { steps, origin } => write!(
                f,
                "Returning {} steps to {} position...",
                steps, origin
            ),
            EventKind::ReturnProgress { steps, total } => {
                write!(f, "Returning... ({}/{})", steps, total)
            },
            EventKind::Returned { origin } => {
                write!(f, "Returned to {} position.", origin)
            },
            EventKind::AlreadyAtOrigin { origin } => {
                write!(f, "Already at origin ({} position).", origin)
            },
            EventKind::ReturnSkipped => {
                f.write_str("return skipped, the sequence was stopped")
            },
            EventKind::ReturnEndedEarly {
                interrupted,
                skipped,
            } => write!(
                f,
                "Return sequence ended early (interrupted: {}, skipped: {})",
                MotorList(interrupted),
                MotorList(skipped)
            ),
            EventKind::CycleComplete { repetition, total } => write!(
                f,
                "Cycle complete: return sequence {}/{} finished",
                repetition + 1,
                total
            ),
            EventKind::WaitingForNextRepetition { pause } => write!(
                f,
                "Waiting {} seconds before next sequence...",
                pause.as_secs_f64()
            ),
            EventKind::SequenceComplete { repetitions } => write!(
                f,
                "Sequence complete: all {} repetition(s) finished",
                repetitions
            ),
            EventKind::StopRequested => {
                f.write_str("Stop requested. Halting all motors...")
            },
            EventKind::SequenceStopped {
                completed_repetitions,
            } => write!(
                f,
                "Sequence stopped after {} completed repetition(s)",
                completed_repetitions
            ),
            EventKind::Warning(msg) => f.write_str(msg),
        }
    }
}

struct MotorList<'a>(&'a [usize]);

impl<'a> Display for MotorList<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }

        for (i, &ix) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ActuatorName(ix))?;
        }

        Ok(())
    }
}

/// The consumer of a run's [`StatusEvent`]s (e.g. a UI log).
pub trait StatusSink: Send + Sync {
    /// Accept an event. This must not block waiting for the consumer.
    fn emit(&self, event: StatusEvent);
}

impl StatusSink for Sender<StatusEvent> {
    fn emit(&self, event: StatusEvent) {
        match self.try_send(event) {
            Ok(()) => {},
            Err(TrySendError::Full(event)) => {
                log::warn!("[Status] Event queue is full, dropping \"{}\"", event);
            },
            // nobody is listening any more
            Err(TrySendError::Disconnected(_)) => {},
        }
    }
}

/// A sink which throws every event away.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn emit(&self, _event: StatusEvent) {}
}

/// A [`StatusSink`] which passes every event to a function.
///
/// The function runs on whichever thread produced the event, so it should
/// return quickly.
pub fn func_sink<F>(on_event: F) -> impl StatusSink
where
    F: Fn(StatusEvent) + Send + Sync,
{
    FuncSink { on_event }
}

struct FuncSink<F> {
    on_event: F,
}

impl<F> StatusSink for FuncSink<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    fn emit(&self, event: StatusEvent) { (self.on_event)(event) }
}

/// Stamps events with the time, writes them to the log, then forwards them
/// to the caller's sink.
#[derive(Clone)]
pub(crate) struct Reporter {
    sink: Arc<dyn StatusSink>,
    clock: Arc<dyn Clock>,
}

impl Reporter {
    pub(crate) fn new(sink: Arc<dyn StatusSink>, clock: Arc<dyn Clock>) -> Reporter {
        Reporter { sink, clock }
    }

    pub(crate) fn sequence(&self, kind: EventKind) { self.emit(None, kind); }

    pub(crate) fn actuator(&self, index: usize, kind: EventKind) {
        self.emit(Some(index), kind);
    }

    fn emit(&self, actuator: Option<usize>, kind: EventKind) {
        let event = StatusEvent {
            at: self.clock.elapsed(),
            actuator,
            kind,
        };

        let component = match actuator {
            Some(ix) => ActuatorName(ix).to_string(),
            None => String::from("Sequence"),
        };

        match event.kind {
            EventKind::MoveProgress { .. } | EventKind::ReturnProgress { .. } => {
                log::debug!("[{}] {}", component, event)
            },
            EventKind::Fault { .. } => log::error!("[{}] {}", component, event),
            EventKind::Warning(_)
            | EventKind::ReturnSkipped
            | EventKind::ReturnEndedEarly { .. }
            | EventKind::Stopped { .. } => log::warn!("[{}] {}", component, event),
            _ => log::info!("[{}] {}", component, event),
        }

        self.sink.emit(event);
    }
}
