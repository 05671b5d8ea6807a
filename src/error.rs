//! Error types for configuring and starting a motion sequence.
//!
//! Cancellation isn't an error. A stopped actuator is reported through the
//! status channel and [`crate::Phase::Stopped`].

use crate::Pin;
use std::io;
use thiserror::Error;

/// Errors from converting a speed into a pulse cadence.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TimingError {
    #[error("a speed of {0} RPM can't be turned into a step rate")]
    NonPositiveSpeed(f64),
    #[error("the motor has no steps per revolution")]
    NoStepsPerRevolution,
}

/// A sequence or machine configuration which was rejected before anything
/// started moving.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("the repetition count must be between {min} and {max}, found {value}")]
    Repetitions { value: u32, min: u32, max: u32 },
    #[error("Motor {}: the repetition override must be between {min} and {max}, found {value}", .actuator + 1)]
    RepetitionsOverride {
        actuator: usize,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Motor {}: the speed must be between {min} and {max} RPM, found {value}", .actuator + 1)]
    Speed {
        actuator: usize,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Motor {}: the target angle must be between {min} and {max} degrees, found {value}", .actuator + 1)]
    Angle {
        actuator: usize,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Motor {}: the start delay must be between {min:?} and {max:?}, found {value:?}", .actuator + 1)]
    StartDelay {
        actuator: usize,
        value: std::time::Duration,
        min: std::time::Duration,
        max: std::time::Duration,
    },
    #[error("expected settings for {expected} motors, found {found}")]
    ActuatorCount { expected: usize, found: usize },
    #[error("a machine can drive at most {max} motors")]
    TooManyActuators { max: usize },
    #[error("{0} is assigned to more than one output")]
    DuplicatePin(Pin),
    #[error("the machine has no motors")]
    NoActuators,
    #[error("the motor must have at least one step per revolution")]
    NoStepsPerRevolution,
    #[error("the return speed factor must be a positive number, found {0}")]
    ReturnSpeedFactor(f64),
}

/// Errors returned synchronously by
/// [`SequenceOrchestrator::start()`](crate::SequenceOrchestrator::start).
///
/// When `start()` fails nothing has moved and no task has been spawned.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("unable to claim {pin} for Motor {}: {reason}", .actuator + 1)]
    HardwareClaim {
        actuator: usize,
        pin: Pin,
        reason: String,
    },
    #[error("a sequence is already running")]
    AlreadyRunning,
    #[error("unable to spawn the sequence thread: {0}")]
    Spawn(#[from] io::Error),
}
