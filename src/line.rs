use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use void::Void;

/// A GPIO line number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pin(pub u32);

impl Display for Pin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// The logic level of a digital output.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Level {
    High,
    Low,
}

/// An interface to the digital outputs driving the stepper drivers.
///
/// The same line is shared by every actuator task in a run, so all methods
/// take `&self`. The engine guarantees two tasks never drive the *same* pin
/// at the same time, but different pins may be written concurrently.
pub trait HardwareLine: Send + Sync {
    /// The type of error that may be encountered when talking to the
    /// hardware.
    ///
    /// Use `void::Void` if the line can never fail.
    type Error: fmt::Display + fmt::Debug + Send + 'static;

    /// Take exclusive ownership of a pin and configure it as an output.
    fn claim(&self, pin: Pin) -> Result<(), Self::Error>;

    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error>;

    /// Give a previously claimed pin back to the system.
    fn release(&self, pin: Pin) -> Result<(), Self::Error>;
}

impl<'a, L: HardwareLine + ?Sized> HardwareLine for &'a L {
    type Error = L::Error;

    fn claim(&self, pin: Pin) -> Result<(), Self::Error> { (*self).claim(pin) }

    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        (*self).set_output(pin, level)
    }

    fn release(&self, pin: Pin) -> Result<(), Self::Error> {
        (*self).release(pin)
    }
}

impl<L: HardwareLine + ?Sized> HardwareLine for Arc<L> {
    type Error = L::Error;

    fn claim(&self, pin: Pin) -> Result<(), Self::Error> { (**self).claim(pin) }

    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        (**self).set_output(pin, level)
    }

    fn release(&self, pin: Pin) -> Result<(), Self::Error> {
        (**self).release(pin)
    }
}

/// A [`HardwareLine`] which calls a function every time an output is set.
///
/// Claiming and releasing always succeed. See [`fallible_func_line()`] for a
/// version which accepts a fallible callback.
pub fn func_line<F>(on_output: F) -> impl HardwareLine<Error = Void>
where
    F: Fn(Pin, Level) + Send + Sync,
{
    Infallible { on_output }
}

struct Infallible<F> {
    on_output: F,
}

impl<F> HardwareLine for Infallible<F>
where
    F: Fn(Pin, Level) + Send + Sync,
{
    type Error = Void;

    fn claim(&self, _pin: Pin) -> Result<(), Self::Error> { Ok(()) }

    #[inline]
    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        (self.on_output)(pin, level);
        Ok(())
    }

    fn release(&self, _pin: Pin) -> Result<(), Self::Error> { Ok(()) }
}

/// A line which uses a callback which may fail.
///
/// See [`func_line()`] for a version which uses an infallible callback.
pub fn fallible_func_line<F, E>(on_output: F) -> impl HardwareLine<Error = E>
where
    F: Fn(Pin, Level) -> Result<(), E> + Send + Sync,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    Fallible { on_output }
}

struct Fallible<F> {
    on_output: F,
}

impl<F, E> HardwareLine for Fallible<F>
where
    F: Fn(Pin, Level) -> Result<(), E> + Send + Sync,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    type Error = E;

    fn claim(&self, _pin: Pin) -> Result<(), Self::Error> { Ok(()) }

    #[inline]
    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        (self.on_output)(pin, level)
    }

    fn release(&self, _pin: Pin) -> Result<(), Self::Error> { Ok(()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulatedLineError {
    #[error("{0} is already in use")]
    AlreadyClaimed(Pin),
    #[error("{0} is not available on this backend")]
    Unavailable(Pin),
    #[error("{0} was never claimed")]
    NotClaimed(Pin),
    #[error("write to {0} failed")]
    WriteFailed(Pin),
}

/// An in-memory line for running without hardware.
///
/// It records the current level of every pin and counts rising edges, so
/// a test can check exactly how many steps each actuator took.
#[derive(Debug, Default)]
pub struct SimulatedLine {
    inner: Mutex<Simulated>,
}

#[derive(Debug, Default)]
struct Simulated {
    claimed: HashSet<Pin>,
    unavailable: HashSet<Pin>,
    failing: HashSet<Pin>,
    levels: HashMap<Pin, Level>,
    rising_edges: HashMap<Pin, u64>,
    ever_claimed: Vec<Pin>,
    released: Vec<Pin>,
}

impl SimulatedLine {
    pub fn new() -> SimulatedLine { SimulatedLine::default() }

    /// Make any attempt to claim `pin` fail, as if another process held it.
    pub fn with_unavailable_pin(self, pin: Pin) -> SimulatedLine {
        self.lock().unavailable.insert(pin);
        self
    }

    /// Make every write to `pin` fail.
    pub fn with_failing_pin(self, pin: Pin) -> SimulatedLine {
        self.lock().failing.insert(pin);
        self
    }

    /// How many times `pin` went from low to high.
    pub fn pulses(&self, pin: Pin) -> u64 {
        self.lock().rising_edges.get(&pin).copied().unwrap_or(0)
    }

    /// The most recent level written to `pin`, if any.
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn is_claimed(&self, pin: Pin) -> bool {
        self.lock().claimed.contains(&pin)
    }

    /// Every pin which has been claimed at some point, in claim order.
    pub fn claim_history(&self) -> Vec<Pin> { self.lock().ever_claimed.clone() }

    /// Every pin which has been released, in release order.
    pub fn released(&self) -> Vec<Pin> { self.lock().released.clone() }

    fn lock(&self) -> MutexGuard<'_, Simulated> {
        // a panicking test thread shouldn't hide the recorded state
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HardwareLine for SimulatedLine {
    type Error = SimulatedLineError;

    fn claim(&self, pin: Pin) -> Result<(), Self::Error> {
        let mut inner = self.lock();

        if inner.unavailable.contains(&pin) {
            return Err(SimulatedLineError::Unavailable(pin));
        }
        if !inner.claimed.insert(pin) {
            return Err(SimulatedLineError::AlreadyClaimed(pin));
        }

        inner.ever_claimed.push(pin);
        inner.levels.insert(pin, Level::Low);
        Ok(())
    }

    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        let mut inner = self.lock();

        if inner.failing.contains(&pin) {
            return Err(SimulatedLineError::WriteFailed(pin));
        }

        let previous = inner.levels.insert(pin, level);
        if level == Level::High && previous != Some(Level::High) {
            *inner.rising_edges.entry(pin).or_insert(0) += 1;
        }

        Ok(())
    }

    fn release(&self, pin: Pin) -> Result<(), Self::Error> {
        let mut inner = self.lock();

        if !inner.claimed.remove(&pin) {
            return Err(SimulatedLineError::NotClaimed(pin));
        }

        inner.released.push(pin);
        Ok(())
    }
}
