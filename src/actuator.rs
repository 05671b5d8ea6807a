use crate::{Level, Pin};
use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

/// The step and direction outputs wired to one stepper driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ActuatorPins {
    pub step: Pin,
    pub direction: Pin,
}

impl ActuatorPins {
    pub const fn new(step: u32, direction: u32) -> ActuatorPins {
        ActuatorPins {
            step: Pin(step),
            direction: Pin(direction),
        }
    }
}

/// The rest position an actuator starts from and returns to.
///
/// Actuators resting at `A` move forwards to reach their target, actuators
/// resting at `B` move in reverse.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    A,
    B,
}

impl Origin {
    /// The direction to move in when leaving this origin.
    pub fn outbound(self) -> Direction {
        match self {
            Origin::A => Direction::Forward,
            Origin::B => Direction::Reverse,
        }
    }
}

impl Default for Origin {
    fn default() -> Origin { Origin::A }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Origin::A => f.write_str("A"),
            Origin::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn reversed(self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }

    /// The level the direction pin is driven to.
    pub fn level(self) -> Level {
        match self {
            Direction::Forward => Level::High,
            Direction::Reverse => Level::Low,
        }
    }
}

/// Where an actuator is in its cycle.
///
/// ```text
/// Pending -> Delaying -> Moving -> Dwelling -> Returning -> Complete
/// ```
///
/// `Stopped` is reachable from any phase before `Complete` once the run is
/// cancelled or the actuator's hardware fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Delaying,
    Moving,
    Dwelling,
    Returning,
    Complete,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Delaying => "start delay",
            Phase::Moving => "move to target",
            Phase::Dwelling => "dwell",
            Phase::Returning => "return",
            Phase::Complete => "complete",
            Phase::Stopped => "stopped",
        }
    }

    /// Has the forward part of the cycle finished, one way or another?
    ///
    /// Returns may only start once every actuator reports this.
    pub fn movement_finished(&self) -> bool {
        match self {
            Phase::Dwelling | Phase::Complete | Phase::Stopped => true,
            _ => false,
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single actuator should move during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorConfig {
    pub speed_rpm: f64,
    pub target_angle_degrees: f64,
    pub start_delay: Duration,
    pub origin: Origin,
    /// Take part in only this many repetitions instead of the sequence's
    /// repetition count.
    pub repetitions_override: Option<u32>,
}

impl ActuatorConfig {
    pub fn new(speed_rpm: f64, target_angle_degrees: f64) -> ActuatorConfig {
        ActuatorConfig {
            speed_rpm,
            target_angle_degrees,
            ..ActuatorConfig::default()
        }
    }

    pub fn with_start_delay(mut self, start_delay: Duration) -> Self {
        self.start_delay = start_delay;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions_override = Some(repetitions);
        self
    }

    /// How many repetitions this actuator takes part in.
    pub fn repetitions(&self, sequence_repetitions: u32) -> u32 {
        self.repetitions_override.unwrap_or(sequence_repetitions)
    }
}

impl Default for ActuatorConfig {
    fn default() -> ActuatorConfig {
        ActuatorConfig {
            speed_rpm: 60.0,
            target_angle_degrees: 45.0,
            start_delay: Duration::new(0, 0),
            origin: Origin::A,
            repetitions_override: None,
        }
    }
}

/// The mutable part of an actuator.
///
/// Only the task running the actuator's current phase holds a `&mut` to
/// this, so it needs no locking.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorState {
    steps_moved: u32,
    phase: Phase,
    direction: Direction,
}

impl ActuatorState {
    pub fn new(origin: Origin) -> ActuatorState {
        ActuatorState {
            steps_moved: 0,
            phase: Phase::Pending,
            direction: origin.outbound(),
        }
    }

    /// Steps taken away from the origin which haven't been returned yet.
    pub fn steps_moved(&self) -> u32 { self.steps_moved }

    pub fn phase(&self) -> Phase { self.phase }

    /// The direction most recently written to the direction pin.
    pub fn direction(&self) -> Direction { self.direction }

    /// Get ready for a new repetition.
    pub fn reset(&mut self, origin: Origin) {
        self.steps_moved = 0;
        self.phase = Phase::Pending;
        self.direction = origin.outbound();
    }

    pub fn snapshot(&self) -> ActuatorSnapshot {
        ActuatorSnapshot {
            steps_moved: self.steps_moved,
            phase: self.phase,
            direction: self.direction,
        }
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) { self.phase = phase; }

    pub(crate) fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub(crate) fn record_step(&mut self) { self.steps_moved += 1; }

    pub(crate) fn record_return_step(&mut self) {
        self.steps_moved = self.steps_moved.saturating_sub(1);
    }

    #[cfg(test)]
    pub(crate) fn with_steps(mut self, steps_moved: u32, phase: Phase) -> Self {
        self.steps_moved = steps_moved;
        self.phase = phase;
        self
    }
}

/// A read-only copy of an [`ActuatorState`], taken between phases.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ActuatorSnapshot {
    pub steps_moved: u32,
    pub phase: Phase,
    pub direction: Direction,
}

/// An actuator's settings together with its runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct Actuator {
    pub index: usize,
    pub pins: ActuatorPins,
    pub config: ActuatorConfig,
    pub state: ActuatorState,
}

impl Actuator {
    pub fn new(index: usize, pins: ActuatorPins, config: ActuatorConfig) -> Actuator {
        let state = ActuatorState::new(config.origin);

        Actuator {
            index,
            pins,
            config,
            state,
        }
    }

    /// The human-readable name used in status messages.
    pub fn name(&self) -> ActuatorName { ActuatorName(self.index) }
}

/// Displays an actuator index the way an operator counts them ("Motor 1").
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActuatorName(pub usize);

impl Display for ActuatorName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Motor {}", self.0 + 1)
    }
}
