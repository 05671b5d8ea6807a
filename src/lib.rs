//! Run several stepper motors through synchronised motion sequences.
//!
//! Each actuator in a run goes through the same cycle: wait for its start
//! delay, move to a target angle, dwell there, then return to its origin.
//! The [`SequenceOrchestrator`] repeats that cycle as many times as the
//! [`SequenceConfig`] asks for, running the actuators concurrently and
//! bringing them home either together or one at a time.
//!
//! Progress is reported as [`StatusEvent`]s through a [`StatusSink`], and
//! every event is also written to the [`log`] facade.
//!
//! # Cargo Features
//!
//! The `hal` feature adds [`OutputPinBank`], a [`HardwareLine`] backed by
//! `embedded-hal` output pins.
//!
//! # Examples
//!
//! ```rust
//! use stepper_sequencer::{
//!     ActuatorConfig, MachineConfig, NullSink, SequenceConfig,
//!     SequenceOrchestrator, SimulatedClock, SimulatedLine,
//! };
//! use std::sync::Arc;
//!
//! let clock = Arc::new(SimulatedClock::new());
//! let engine = SequenceOrchestrator::new(
//!     MachineConfig::reference(),
//!     SimulatedLine::new(),
//!     NullSink,
//! )
//! .with_clock(clock);
//!
//! let config = SequenceConfig::new(vec![ActuatorConfig::default(); 3]);
//! let summary = engine.start(config)?.wait();
//!
//! assert_eq!(summary.completed_repetitions, 1);
//! # Ok::<(), stepper_sequencer::EngineError>(())
//! ```

mod actuator;
mod cancel;
mod clock;
mod config;
mod error;
mod events;
#[cfg(feature = "hal")]
mod hal_lines;
mod line;
mod orchestrator;
mod returns;
mod runner;
pub mod timing;

pub use crate::{
    actuator::{
        Actuator, ActuatorConfig, ActuatorName, ActuatorPins, ActuatorSnapshot,
        ActuatorState, Direction, Origin, Phase,
    },
    cancel::CancellationToken,
    clock::{Clock, OperatingSystemClock, SimulatedClock},
    config::{
        Limits, MachineConfig, ReturnMode, SequenceConfig, Timings, MAX_ACTUATORS,
    },
    error::{ConfigError, EngineError, TimingError},
    events::{func_sink, EventKind, NullSink, StatusEvent, StatusSink},
    line::{
        fallible_func_line, func_line, HardwareLine, Level, Pin, SimulatedLine,
        SimulatedLineError,
    },
    orchestrator::{
        EngineState, EngineStatus, RunHandle, RunSummary, SequenceOrchestrator,
    },
    returns::ReturnReport,
    runner::MovementOutcome,
};

#[cfg(feature = "hal")]
pub use crate::hal_lines::{OutputPinBank, PinBankError};
