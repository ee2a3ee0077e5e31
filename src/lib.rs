#![cfg_attr(not(test), no_std)]

// This must go first so the logging macros are visible to every other module.
#[macro_use]
mod fmt;

pub mod actuator;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod sensor;
pub mod snapshot;
pub mod tasks;

pub use actuator::tachometer::{EdgeCounter, MajorityVote, TachometerStrategy};
pub use actuator::{Actuator, ActuatorChannel};
pub use config::ControlConfig;
pub use context::{ChannelRef, CoolingContext, SensorSet};
pub use controller::{calculate_fan_speed, ControlStatus, ThermalController, TickOutcome};
pub use error::{ActuatorError, ConfigError, SensorError};
pub use sensor::{AnalogInput, Calibration, TemperatureSensor, TemperatureSource, ThermistorParams};

pub const MIN_VALID_TEMP: f32 = 10.0; // Lowest plausible reading (Celsius), below means a faulty or open sensor
pub const MAX_VALID_TEMP: f32 = 50.0; // Highest plausible reading (Celsius)
pub const SPIKE_REJECT_DELTA: f32 = 5.0; // Samples further than this from the rolling average are noise
pub const SPIKE_REJECT_MIN_SAMPLES: u32 = 10; // Spike rejection only kicks in once the history has settled
pub const SMOOTHED_SAMPLES: usize = 3; // Samples averaged by a smoothed read
pub const SAMPLE_HISTORY_LEN: usize = 10; // Ring buffer capacity per sensor

pub const PWM_LEVELS: u16 = 256; // Output resolution the smoothing step is expressed in
pub const PWM_FREQUENCY_HZ: u32 = 25_000; // 4-pin PC fan PWM frequency
pub const DEFAULT_DUTY_PERCENT: f32 = 50.0; // Duty applied at power-up, before the controller runs
pub const SMOOTHING_RATE: f32 = 0.05; // Fraction of the remaining difference covered per smoothing tick
pub const SMOOTHING_MIN_STEP: f32 = 2.0 * 100.0 / PWM_LEVELS as f32; // Two PWM levels, in percent
pub const SMOOTHING_EPSILON: f32 = 0.001; // Differences at or below this are considered converged

pub const PULSES_PER_REVOLUTION: u32 = 2; // Standard PC fan tachometer
pub const TACH_DEBOUNCE_MS: u64 = 5; // Edges closer than this to the last accepted edge are bounce
pub const TACH_VOTE_SLOTS: u32 = 5; // Majority-vote window length
pub const TACH_VOTE_MAJORITY: u32 = 3; // High samples needed in the window for a logical high

pub const CONTROL_INTERVAL_MS: u64 = 1000; // Control loop period
pub const SENSOR_SAMPLE_INTERVAL_MS: u64 = 500; // Thermistor sampling period
pub const SMOOTHING_INTERVAL_MS: u64 = 200; // Duty smoothing period
pub const RPM_WINDOW_MS: u64 = 1000; // Tachometer aggregation window
pub const TACH_SAMPLE_INTERVAL_MS: u64 = 1; // Majority-vote sampling period
pub const SNAPSHOT_INTERVAL_MS: u64 = 1000; // Performance snapshot period
