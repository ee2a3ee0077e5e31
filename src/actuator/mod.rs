//! PWM fan and pump channels.
//!
//! A channel owns one PWM output and one tachometer. The controller only moves
//! the target duty cycle; a housekeeping activity walks the applied duty
//! toward it a little at a time, so speed changes are gradual and quiet.

pub mod tachometer;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Duration;
use embedded_hal::pwm::{Error as _, SetDutyCycle};
use portable_atomic::{AtomicBool, AtomicF32, AtomicU32, Ordering};

use crate::error::ActuatorError;
use crate::{DEFAULT_DUTY_PERCENT, SMOOTHING_EPSILON, SMOOTHING_MIN_STEP, SMOOTHING_RATE};
use tachometer::{rpm_from_pulses, TachometerStrategy};

/// Object-safe view of a channel, shared between the controller, the
/// housekeeping activity and any manual-override surface.
pub trait Actuator: Sync {
    fn label(&self) -> &'static str;

    /// Floor the duty cycle is never driven below (percent).
    fn min_duty_cycle(&self) -> f32;

    /// Duty cycle currently applied to the output (percent).
    fn duty_cycle(&self) -> f32;

    /// Duty cycle smoothing is converging toward (percent).
    fn target_duty_cycle(&self) -> f32;

    /// Speed measured over the last aggregation window.
    fn rpm(&self) -> u32;

    fn is_overridden(&self) -> bool;

    /// Clamp and store a new target. Returns the stored value.
    fn set_target(&self, percent: f32) -> f32;

    /// Clamp, store as both current and target, and write the output now.
    fn set_immediate(&self, percent: f32) -> Result<f32, ActuatorError>;

    /// Mark the channel as manually controlled.
    fn lock_duty_cycle(&self);

    /// Hand the channel back to automatic control.
    fn reset(&self);

    /// One smoothing tick. Returns whether the applied duty moved.
    fn smooth(&self) -> Result<bool, ActuatorError>;

    /// Drain the tachometer and recompute RPM over `window`.
    fn refresh_rpm(&self, window: Duration) -> u32;
}

/// Clamp a requested duty to `[floor, 100]`. NaN requests land on the floor.
pub fn clamp_duty(percent: f32, floor: f32) -> f32 {
    if percent.is_nan() {
        floor
    } else {
        percent.clamp(floor, 100.0)
    }
}

/// Next applied duty on the way from `current` to `target`, or `None` once converged.
///
/// Covers a fixed fraction of the remaining distance, never less than the
/// minimum step, and stops exactly on the target.
pub fn smoothing_step(current: f32, target: f32) -> Option<f32> {
    let diff = target - current;
    let distance = libm::fabsf(diff);
    if distance <= SMOOTHING_EPSILON {
        return None;
    }
    let step = (distance * SMOOTHING_RATE).max(SMOOTHING_MIN_STEP);
    if step >= distance {
        Some(target)
    } else if diff > 0.0 {
        Some(current + step)
    } else {
        Some(current - step)
    }
}

/// Raw compare value for `percent` on an output whose full scale is `max`.
pub fn duty_to_raw(percent: f32, max: u16) -> u16 {
    let raw = percent.clamp(0.0, 100.0) / 100.0 * max as f32 + 0.5;
    (raw as u16).min(max)
}

/// A single fan or pump
pub struct ActuatorChannel<P, T> {
    label: &'static str,
    min_duty: f32,
    current: AtomicF32,
    target: AtomicF32,
    rpm: AtomicU32,
    overridden: AtomicBool,
    tach: T,
    output: Mutex<CriticalSectionRawMutex, RefCell<P>>,
}

impl<P, T> ActuatorChannel<P, T>
where
    P: SetDutyCycle + Send,
    T: TachometerStrategy,
{
    /// Bring up a channel at the power-on duty (clamped to `min_duty`).
    ///
    /// `min_duty` itself is clamped to 0..=100 and fixed for the life of the channel.
    pub fn new(label: &'static str, output: P, tach: T, min_duty: f32) -> Self {
        let min_duty = if min_duty.is_nan() {
            0.0
        } else {
            min_duty.clamp(0.0, 100.0)
        };
        let initial = clamp_duty(DEFAULT_DUTY_PERCENT, min_duty);
        let channel = Self {
            label,
            min_duty,
            current: AtomicF32::new(initial),
            target: AtomicF32::new(initial),
            rpm: AtomicU32::new(0),
            overridden: AtomicBool::new(false),
            tach,
            output: Mutex::new(RefCell::new(output)),
        };
        match channel.apply(initial) {
            Ok(()) => info!(
                "{}: min {}%, initial {}%, tach {}",
                label,
                min_duty,
                initial,
                channel.tach.name()
            ),
            Err(err) => error!("{}: initial duty not applied [{}]", label, err.kind()),
        }
        channel
    }

    pub fn tachometer(&self) -> &T {
        &self.tach
    }

    /// Run `f` against the PWM output, e.g. to reconfigure the peripheral.
    pub fn with_output<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        self.output.lock(|output| f(&mut output.borrow_mut()))
    }

    fn apply(&self, percent: f32) -> Result<(), ActuatorError> {
        self.output
            .lock(|output| write_duty(&mut *output.borrow_mut(), percent))
    }
}

fn write_duty<P: SetDutyCycle>(output: &mut P, percent: f32) -> Result<(), ActuatorError> {
    let raw = duty_to_raw(percent, output.max_duty_cycle());
    output
        .set_duty_cycle(raw)
        .map_err(|err| ActuatorError::Pwm(err.kind()))
}

impl<P, T> Actuator for ActuatorChannel<P, T>
where
    P: SetDutyCycle + Send,
    T: TachometerStrategy,
{
    fn label(&self) -> &'static str {
        self.label
    }

    fn min_duty_cycle(&self) -> f32 {
        self.min_duty
    }

    fn duty_cycle(&self) -> f32 {
        self.current.load(Ordering::Acquire)
    }

    fn target_duty_cycle(&self) -> f32 {
        self.target.load(Ordering::Acquire)
    }

    fn rpm(&self) -> u32 {
        self.rpm.load(Ordering::Relaxed)
    }

    fn is_overridden(&self) -> bool {
        self.overridden.load(Ordering::Acquire)
    }

    fn set_target(&self, percent: f32) -> f32 {
        let clamped = clamp_duty(percent, self.min_duty);
        self.target.store(clamped, Ordering::Release);
        clamped
    }

    fn set_immediate(&self, percent: f32) -> Result<f32, ActuatorError> {
        let clamped = clamp_duty(percent, self.min_duty);
        let written = self.output.lock(|output| {
            self.target.store(clamped, Ordering::Release);
            self.current.store(clamped, Ordering::Release);
            write_duty(&mut *output.borrow_mut(), clamped)
        });
        match written {
            Ok(()) => Ok(clamped),
            Err(err) => {
                error!("{}: failed to apply {}% [{}]", self.label, clamped, err.kind());
                Err(err)
            }
        }
    }

    fn lock_duty_cycle(&self) {
        self.overridden.store(true, Ordering::Release);
        info!("{}: manual override at {}%", self.label, self.duty_cycle());
    }

    fn reset(&self) {
        self.overridden.store(false, Ordering::Release);
        info!("{}: back under automatic control", self.label);
    }

    fn smooth(&self) -> Result<bool, ActuatorError> {
        // `current` only changes together with the output write, under the output lock
        let stepped = self.output.lock(|output| {
            let current = self.current.load(Ordering::Acquire);
            let target = self.target.load(Ordering::Acquire);
            match smoothing_step(current, target) {
                Some(next) => {
                    self.current.store(next, Ordering::Release);
                    write_duty(&mut *output.borrow_mut(), next).map(|()| true)
                }
                None => Ok(false),
            }
        });
        match stepped {
            Ok(moved) => Ok(moved),
            Err(err) => {
                error!("{}: smoothing write failed [{}]", self.label, err.kind());
                Err(err)
            }
        }
    }

    fn refresh_rpm(&self, window: Duration) -> u32 {
        let pulses = self.tach.take_pulses();
        let rpm = rpm_from_pulses(pulses, window);
        self.rpm.store(rpm, Ordering::Relaxed);
        trace!("{}: {} pulses, {} rpm", self.label, pulses, rpm);
        rpm
    }
}
