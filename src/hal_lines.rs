use crate::{HardwareLine, Level, Pin};
use embedded_hal::digital::v2::OutputPin;
use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;

/// A [`HardwareLine`] built from a fixed set of `embedded-hal` output pins.
///
/// Each pin is wrapped in its own lock, so actuators driving different pins
/// never wait on each other.
#[derive(Debug)]
pub struct OutputPinBank<P> {
    pins: Vec<(Pin, Mutex<P>)>,
    claimed: Mutex<HashSet<Pin>>,
}

#[derive(Debug, Error)]
pub enum PinBankError<E: Debug> {
    #[error("{0} isn't part of this pin bank")]
    UnknownPin(Pin),
    #[error("{0} is already in use")]
    AlreadyClaimed(Pin),
    #[error("{0} was never claimed")]
    NotClaimed(Pin),
    #[error("unable to drive {pin}: {error:?}")]
    Output { pin: Pin, error: E },
}

impl<P> OutputPinBank<P> {
    pub fn new() -> Self {
        OutputPinBank {
            pins: Vec::new(),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Register the output which drives `pin`.
    pub fn with_pin(mut self, pin: Pin, output: P) -> Self {
        self.pins.retain(|(existing, _)| *existing != pin);
        self.pins.push((pin, Mutex::new(output)));
        self
    }

    pub fn into_inner(self) -> Vec<(Pin, P)> {
        self.pins
            .into_iter()
            .map(|(pin, output)| {
                (pin, output.into_inner().unwrap_or_else(|e| e.into_inner()))
            })
            .collect()
    }

    fn output(&self, pin: Pin) -> Option<MutexGuard<'_, P>> {
        self.pins
            .iter()
            .find(|(p, _)| *p == pin)
            .map(|(_, output)| output.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn claimed(&self) -> MutexGuard<'_, HashSet<Pin>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P> Default for OutputPinBank<P> {
    fn default() -> Self { OutputPinBank::new() }
}

fn set_output<P: OutputPin>(pin: &mut P, level: Level) -> Result<(), P::Error> {
    match level {
        Level::High => pin.set_high(),
        Level::Low => pin.set_low(),
    }
}

impl<P, E> HardwareLine for OutputPinBank<P>
where
    P: OutputPin<Error = E> + Send,
    E: Debug + Send + 'static,
{
    type Error = PinBankError<E>;

    fn claim(&self, pin: Pin) -> Result<(), Self::Error> {
        let mut output = self.output(pin).ok_or(PinBankError::UnknownPin(pin))?;

        if !self.claimed().insert(pin) {
            return Err(PinBankError::AlreadyClaimed(pin));
        }

        // outputs always start low so the driver doesn't see a phantom step
        set_output(&mut *output, Level::Low)
            .map_err(|error| PinBankError::Output { pin, error })
    }

    #[inline]
    fn set_output(&self, pin: Pin, level: Level) -> Result<(), Self::Error> {
        if !self.claimed().contains(&pin) {
            return Err(PinBankError::NotClaimed(pin));
        }

        let mut output = self.output(pin).ok_or(PinBankError::UnknownPin(pin))?;
        set_output(&mut *output, level)
            .map_err(|error| PinBankError::Output { pin, error })
    }

    fn release(&self, pin: Pin) -> Result<(), Self::Error> {
        let mut output = self.output(pin).ok_or(PinBankError::UnknownPin(pin))?;

        if !self.claimed().remove(&pin) {
            return Err(PinBankError::NotClaimed(pin));
        }

        set_output(&mut *output, Level::Low)
            .map_err(|error| PinBankError::Output { pin, error })
    }
}
