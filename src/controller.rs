//! The thermal control loop.
//!
//! Once per tick the controller reads the three smoothed temperatures, blends
//! coolant-to-ambient delta-T and absolute coolant temperature into a single
//! intensity, and spreads that intensity over every channel's range above its
//! floor. Losing the ambient sensor, or both coolant sensors, drops the loop
//! into failsafe: all fans at full speed until readings come back.

use core::fmt::Write;

use heapless::String;
use portable_atomic::{AtomicBool, AtomicF32, AtomicU32, Ordering};

use crate::config::ControlConfig;
use crate::context::CoolingContext;
use crate::error::{ConfigError, SensorError};

/// Capacity of the per-tick status line.
pub const STATUS_LINE_CAPACITY: usize = 256;

fn clamp01(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Control law: cooling intensity in percent for a delta-T and the hottest
/// coolant reading.
pub fn calculate_fan_speed(config: &ControlConfig, delta_t: f32, highest_coolant: f32) -> f32 {
    let delta_t_factor = clamp01(
        (delta_t.max(config.min_delta_t) - config.min_delta_t)
            / (config.max_delta_t - config.min_delta_t),
    );
    let water_temp_factor = clamp01(
        (highest_coolant - config.base_water_temp)
            / (config.max_water_temp - config.base_water_temp),
    );
    clamp01(config.delta_t_weight * delta_t_factor + config.water_temp_weight * water_temp_factor)
        * 100.0
}

/// Duty for a channel with floor `min_duty` at `intensity` percent.
pub fn scale_to_floor(min_duty: f32, intensity: f32) -> f32 {
    min_duty + (intensity / 100.0) * (100.0 - min_duty)
}

/// Values published by the control loop. Everyone else only reads them.
///
/// `delta_t()` and `intensity()` each read one value. Use `reading()` when the
/// two must come from the same tick.
pub struct ControlStatus {
    /// Odd while a publish is in progress
    sequence: AtomicU32,
    delta_t: AtomicF32,
    intensity: AtomicF32,
    failsafe: AtomicBool,
    ticks: AtomicU32,
}

impl ControlStatus {
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            delta_t: AtomicF32::new(0.0),
            intensity: AtomicF32::new(0.0),
            failsafe: AtomicBool::new(false),
            ticks: AtomicU32::new(0),
        }
    }

    /// Delta-T from the last normal tick (Celsius).
    pub fn delta_t(&self) -> f32 {
        self.delta_t.load(Ordering::Acquire)
    }

    /// Intensity from the last normal tick (percent).
    pub fn intensity(&self) -> f32 {
        self.intensity.load(Ordering::Acquire)
    }

    /// Delta-T and intensity from the same normal tick.
    ///
    /// Spins while the control loop is mid-publish, so it must not be called
    /// from a context that preempts the control loop.
    pub fn reading(&self) -> (f32, f32) {
        loop {
            let before = self.sequence.load(Ordering::SeqCst);
            if before % 2 == 0 {
                let delta_t = self.delta_t.load(Ordering::SeqCst);
                let intensity = self.intensity.load(Ordering::SeqCst);
                if self.sequence.load(Ordering::SeqCst) == before {
                    return (delta_t, intensity);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Whether the last tick ended in failsafe.
    pub fn is_failsafe(&self) -> bool {
        self.failsafe.load(Ordering::Acquire)
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    // Only the control loop publishes, so there is a single writer
    fn publish(&self, delta_t: f32, intensity: f32) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        self.delta_t.store(delta_t, Ordering::SeqCst);
        self.intensity.store(intensity, Ordering::SeqCst);
        self.sequence.fetch_add(1, Ordering::SeqCst);
        self.failsafe.store(false, Ordering::Release);
    }

    fn enter_failsafe(&self) {
        self.failsafe.store(true, Ordering::Release);
    }

    fn count_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ControlStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a tick fell back to full fan speed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailsafeCause {
    /// The ambient reading is unavailable
    Ambient(SensorError),
    /// Neither coolant reading is available
    BothCoolant { inlet: SensorError, outlet: SensorError },
}

/// What one control tick did.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TickOutcome {
    /// Targets were updated from the control law
    Normal {
        ambient: f32,
        highest_coolant: f32,
        delta_t: f32,
        intensity: f32,
    },
    /// Fans forced to 100%, published values left as they were
    Failsafe(FailsafeCause),
}

/// Periodic controller turning the three temperatures into channel targets.
pub struct ThermalController<'a> {
    context: CoolingContext<'a>,
    config: ControlConfig,
    status_line: String<STATUS_LINE_CAPACITY>,
}

impl<'a> ThermalController<'a> {
    pub fn new(context: CoolingContext<'a>, config: ControlConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "controller up: {} fans, {} pumps, dT {}..{}C, water {}..{}C",
            context.fans.len(),
            context.pumps.len(),
            config.min_delta_t,
            config.max_delta_t,
            config.base_water_temp,
            config.max_water_temp
        );
        Ok(Self {
            context,
            config,
            status_line: String::new(),
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn context(&self) -> &CoolingContext<'a> {
        &self.context
    }

    /// Status line emitted by the last normal tick.
    pub fn status_line(&self) -> &str {
        self.status_line.as_str()
    }

    /// Run one control cycle.
    pub fn tick(&mut self) -> TickOutcome {
        let sensors = self.context.sensors;
        let ambient = sensors.ambient.smoothed();
        let inlet = sensors.coolant_in.smoothed();
        let outlet = sensors.coolant_out.smoothed();
        self.context.status.count_tick();

        let ambient_c = match ambient {
            Ok(value) => value,
            Err(err) => {
                error!(
                    "ambient sensor {} failed: {} [{}]",
                    sensors.ambient.id(),
                    err,
                    err.kind()
                );
                return self.failsafe(FailsafeCause::Ambient(err));
            }
        };

        let highest_coolant = match (inlet, outlet) {
            (Ok(inlet), Ok(outlet)) => inlet.max(outlet),
            (Ok(inlet), Err(err)) => {
                warn!(
                    "coolant sensor {} failed: {} [{}]",
                    sensors.coolant_out.id(),
                    err,
                    err.kind()
                );
                inlet
            }
            (Err(err), Ok(outlet)) => {
                warn!(
                    "coolant sensor {} failed: {} [{}]",
                    sensors.coolant_in.id(),
                    err,
                    err.kind()
                );
                outlet
            }
            (Err(inlet), Err(outlet)) => {
                error!(
                    "both coolant sensors failed [{}, {}]",
                    inlet.kind(),
                    outlet.kind()
                );
                return self.failsafe(FailsafeCause::BothCoolant { inlet, outlet });
            }
        };

        let delta_t = (highest_coolant - ambient_c).max(0.0);
        let intensity = calculate_fan_speed(&self.config, delta_t, highest_coolant);
        self.context.status.publish(delta_t, intensity);

        let honor_overrides = self.config.honor_overrides;
        for channel in self.context.channels() {
            if honor_overrides && channel.is_overridden() {
                debug!("{}: overridden, target left alone", channel.label());
                continue;
            }
            channel.set_target(scale_to_floor(channel.min_duty_cycle(), intensity));
        }

        self.build_status_line(&ambient, &inlet, &outlet, delta_t, intensity);
        info!("{}", self.status_line.as_str());

        TickOutcome::Normal {
            ambient: ambient_c,
            highest_coolant,
            delta_t,
            intensity,
        }
    }

    fn failsafe(&mut self, cause: FailsafeCause) -> TickOutcome {
        for fan in self.context.fans {
            // Errors are logged by the channel; keep going so every fan is tried
            let _ = fan.set_immediate(100.0);
        }
        if !self.context.status.is_failsafe() {
            error!("failsafe: all fans at 100%");
        }
        self.context.status.enter_failsafe();
        TickOutcome::Failsafe(cause)
    }

    fn build_status_line(
        &mut self,
        ambient: &Result<f32, SensorError>,
        inlet: &Result<f32, SensorError>,
        outlet: &Result<f32, SensorError>,
        delta_t: f32,
        intensity: f32,
    ) {
        let line = &mut self.status_line;
        line.clear();
        // Overflow only truncates the line
        let _ = push_reading(line, "Amb", ambient);
        let _ = push_reading(line, " In", inlet);
        let _ = push_reading(line, " Out", outlet);
        let _ = write!(line, " dT {:.1}C Int {:.1}%", delta_t, intensity);
        for (i, fan) in self.context.fans.iter().enumerate() {
            let _ = write!(line, " F{} {:.1}%", i + 1, fan.duty_cycle());
        }
        for (i, pump) in self.context.pumps.iter().enumerate() {
            let _ = write!(line, " P{} {:.1}%", i + 1, pump.duty_cycle());
        }
    }
}

fn push_reading(
    line: &mut String<STATUS_LINE_CAPACITY>,
    label: &str,
    reading: &Result<f32, SensorError>,
) -> core::fmt::Result {
    match reading {
        Ok(value) => write!(line, "{} {:.1}C", label, value),
        Err(_) => write!(line, "{} ERR", label),
    }
}
