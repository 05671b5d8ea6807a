//! Conversions between rotational units and step pulses.

use crate::TimingError;
use std::time::Duration;

/// How long the step line stays high (and then low) for a single pulse when
/// turning at `speed_rpm`.
///
/// A full step is `line high, wait, line low, wait`, so one step takes twice
/// this long.
///
/// # Errors
///
/// A non-positive (or non-finite) speed, or a motor with no steps per
/// revolution, has no meaningful cadence. Callers should treat this as
/// "don't move" rather than as a fault.
pub fn half_step_delay(
    steps_per_revolution: u32,
    speed_rpm: f64,
) -> Result<Duration, TimingError> {
    if steps_per_revolution == 0 {
        return Err(TimingError::NoStepsPerRevolution);
    }
    if !speed_rpm.is_finite() || speed_rpm <= 0.0 {
        return Err(TimingError::NonPositiveSpeed(speed_rpm));
    }

    let seconds_per_step = 60.0 / (f64::from(steps_per_revolution) * speed_rpm);
    let half = seconds_per_step / 2.0;

    // extremely high speeds would otherwise round down to a zero-length pulse
    let nanos = (half * 1e9).round().max(1.0);
    Ok(Duration::from_nanos(nanos as u64))
}

/// The number of whole steps needed to turn `angle_degrees`.
///
/// Always at least one step, so every move makes forward progress.
pub fn steps_for_angle(steps_per_revolution: u32, angle_degrees: f64) -> u32 {
    let steps = f64::from(steps_per_revolution) * angle_degrees / 360.0;

    if steps.is_finite() && steps >= 1.0 {
        steps.round() as u32
    } else {
        1
    }
}
