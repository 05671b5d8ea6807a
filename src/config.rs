use crate::{ActuatorConfig, ActuatorPins, ConfigError};
use arrayvec::ArrayVec;
use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
    ops::RangeInclusive,
    time::Duration,
};

/// The maximum number of actuators a single machine can drive.
pub const MAX_ACTUATORS: usize = 10;

/// How actuators get back to their origin at the end of each cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReturnMode {
    /// Every actuator returns at the same time.
    Together,
    /// Actuators return one at a time, in the order they were declared.
    Sequential,
}

impl Default for ReturnMode {
    fn default() -> ReturnMode { ReturnMode::Together }
}

impl Display for ReturnMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReturnMode::Together => f.write_str("together"),
            ReturnMode::Sequential => f.write_str("one at a time"),
        }
    }
}

/// Durations and ratios which shape a run.
///
/// None of these are physical constants, the defaults are just values which
/// work well on the reference machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Timings {
    /// How long an actuator waits at its target before it may return.
    pub dwell: Duration,
    /// The pause between two actuators returning one at a time.
    pub inter_actuator_pause: Duration,
    /// The pause between repetitions when actuators return together.
    pub pause_after_together: Duration,
    /// The pause between repetitions when actuators return one at a time.
    pub pause_after_sequential: Duration,
    /// Return speed as a fraction of the forward speed.
    pub return_speed_factor: f64,
    /// Emit a progress event every this many steps.
    pub progress_quantum: u32,
    /// The longest a sleeping task goes without checking for cancellation.
    pub cancel_poll_interval: Duration,
    /// How long `stop()` waits for the run's threads to wind down.
    pub stop_timeout: Duration,
}

impl Timings {
    /// The pause inserted between two repetitions.
    pub fn pause_between_repetitions(&self, mode: ReturnMode) -> Duration {
        match mode {
            ReturnMode::Together => self.pause_after_together,
            ReturnMode::Sequential => self.pause_after_sequential,
        }
    }
}

impl Default for Timings {
    fn default() -> Timings {
        Timings {
            dwell: Duration::from_secs(3),
            inter_actuator_pause: Duration::from_secs(1),
            pause_after_together: Duration::from_secs(2),
            pause_after_sequential: Duration::from_secs(5),
            return_speed_factor: 0.5,
            progress_quantum: 25,
            cancel_poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// The range of values an operator is allowed to pick.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub repetitions: RangeInclusive<u32>,
    pub speed_rpm: RangeInclusive<f64>,
    pub target_angle_degrees: RangeInclusive<f64>,
    pub start_delay: RangeInclusive<Duration>,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            repetitions: 1..=50,
            speed_rpm: 1.0..=300.0,
            target_angle_degrees: 15.0..=180.0,
            start_delay: Duration::new(0, 0)..=Duration::from_secs(2),
        }
    }
}

/// The fixed description of the machine, chosen when the engine is built.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub steps_per_revolution: u32,
    actuator_pins: ArrayVec<[ActuatorPins; MAX_ACTUATORS]>,
    pub timings: Timings,
    pub limits: Limits,
}

impl MachineConfig {
    pub fn new(steps_per_revolution: u32) -> MachineConfig {
        MachineConfig {
            steps_per_revolution,
            actuator_pins: ArrayVec::new(),
            timings: Timings::default(),
            limits: Limits::default(),
        }
    }

    /// Three actuators on a 400 step/rev driver, wired to the pins used by
    /// the reference controller board.
    pub fn reference() -> MachineConfig {
        let pins = [
            ActuatorPins::new(27, 17),
            ActuatorPins::new(23, 22),
            ActuatorPins::new(24, 25),
        ];

        let mut machine = MachineConfig::new(400);
        for p in pins.iter() {
            machine.actuator_pins.push(*p);
        }

        machine
    }

    /// Add another actuator to the machine.
    ///
    /// # Errors
    ///
    /// Every pin may only be used once, and a machine can't have more than
    /// [`MAX_ACTUATORS`] actuators.
    pub fn with_actuator(
        mut self,
        pins: ActuatorPins,
    ) -> Result<MachineConfig, ConfigError> {
        if pins.step == pins.direction {
            return Err(ConfigError::DuplicatePin(pins.step));
        }

        let used: HashSet<_> = self
            .actuator_pins
            .iter()
            .flat_map(|p| vec![p.step, p.direction])
            .collect();

        for pin in [pins.step, pins.direction].iter() {
            if used.contains(pin) {
                return Err(ConfigError::DuplicatePin(*pin));
            }
        }

        self.actuator_pins
            .try_push(pins)
            .map_err(|_| ConfigError::TooManyActuators { max: MAX_ACTUATORS })?;

        Ok(self)
    }

    pub fn with_timings(mut self, timings: Timings) -> MachineConfig {
        self.timings = timings;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> MachineConfig {
        self.limits = limits;
        self
    }

    pub fn actuator_pins(&self) -> &[ActuatorPins] { &self.actuator_pins }

    pub fn actuator_count(&self) -> usize { self.actuator_pins.len() }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.actuator_pins.is_empty() {
            return Err(ConfigError::NoActuators);
        }

        if self.steps_per_revolution == 0 {
            return Err(ConfigError::NoStepsPerRevolution);
        }

        let factor = self.timings.return_speed_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ConfigError::ReturnSpeedFactor(factor));
        }

        Ok(())
    }
}

/// Everything an operator chooses for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceConfig {
    pub repetition_count: u32,
    pub return_mode: ReturnMode,
    pub actuators: Vec<ActuatorConfig>,
}

impl SequenceConfig {
    pub fn new(actuators: Vec<ActuatorConfig>) -> SequenceConfig {
        SequenceConfig {
            repetition_count: 1,
            return_mode: ReturnMode::Together,
            actuators,
        }
    }

    pub fn with_repetitions(mut self, repetition_count: u32) -> Self {
        self.repetition_count = repetition_count;
        self
    }

    pub fn with_return_mode(mut self, return_mode: ReturnMode) -> Self {
        self.return_mode = return_mode;
        self
    }

    /// The number of repetitions the run lasts for, taking per-actuator
    /// overrides into account.
    pub fn total_repetitions(&self) -> u32 {
        self.actuators
            .iter()
            .map(|a| a.repetitions(self.repetition_count))
            .max()
            .unwrap_or(0)
    }

    /// Check the configuration against the machine's limits.
    pub fn validate(&self, machine: &MachineConfig) -> Result<(), ConfigError> {
        machine.validate()?;

        let limits = &machine.limits;

        if self.actuators.len() != machine.actuator_count() {
            return Err(ConfigError::ActuatorCount {
                expected: machine.actuator_count(),
                found: self.actuators.len(),
            });
        }

        if !limits.repetitions.contains(&self.repetition_count) {
            return Err(ConfigError::Repetitions {
                value: self.repetition_count,
                min: *limits.repetitions.start(),
                max: *limits.repetitions.end(),
            });
        }

        for (actuator, cfg) in self.actuators.iter().enumerate() {
            validate_actuator(actuator, cfg, limits)?;
        }

        Ok(())
    }
}

fn validate_actuator(
    actuator: usize,
    cfg: &ActuatorConfig,
    limits: &Limits,
) -> Result<(), ConfigError> {
    if let Some(value) = cfg.repetitions_override {
        if !limits.repetitions.contains(&value) {
            return Err(ConfigError::RepetitionsOverride {
                actuator,
                value,
                min: *limits.repetitions.start(),
                max: *limits.repetitions.end(),
            });
        }
    }

    // NaN fails every `contains()` check
    if !limits.speed_rpm.contains(&cfg.speed_rpm) {
        return Err(ConfigError::Speed {
            actuator,
            value: cfg.speed_rpm,
            min: *limits.speed_rpm.start(),
            max: *limits.speed_rpm.end(),
        });
    }

    if !limits.target_angle_degrees.contains(&cfg.target_angle_degrees) {
        return Err(ConfigError::Angle {
            actuator,
            value: cfg.target_angle_degrees,
            min: *limits.target_angle_degrees.start(),
            max: *limits.target_angle_degrees.end(),
        });
    }

    if !limits.start_delay.contains(&cfg.start_delay) {
        return Err(ConfigError::StartDelay {
            actuator,
            value: cfg.start_delay,
            min: *limits.start_delay.start(),
            max: *limits.start_delay.end(),
        });
    }

    Ok(())
}
