//! Error types shared by sensors, actuators and configuration.

use core::fmt;

/// Why a temperature could not be produced.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// Neither thermistor parameter set gave a plausible reading at startup.
    Calibration,
    /// Reading outside the plausible band (disconnected or shorted sensor).
    OutOfRange(f32),
    /// No valid sample has been recorded yet.
    Internal,
    /// The analog front end failed to convert.
    Acquisition,
}

impl SensorError {
    /// Short tag for log lines.
    pub const fn kind(&self) -> &'static str {
        match self {
            SensorError::Calibration => "calibration",
            SensorError::OutOfRange(_) => "out_of_range",
            SensorError::Internal => "internal",
            SensorError::Acquisition => "acquisition",
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::Calibration => write!(f, "thermistor not calibrated"),
            SensorError::OutOfRange(temp) => write!(f, "temperature out of range: {:.1}C", temp),
            SensorError::Internal => write!(f, "no temperature samples yet"),
            SensorError::Acquisition => write!(f, "analog conversion failed"),
        }
    }
}

/// Failure to drive an actuator output.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActuatorError {
    /// The PWM peripheral rejected the duty cycle.
    Pwm(embedded_hal::pwm::ErrorKind),
    /// No channel at the requested position.
    NoSuchChannel,
}

impl ActuatorError {
    pub const fn kind(&self) -> &'static str {
        match self {
            ActuatorError::Pwm(_) => "pwm",
            ActuatorError::NoSuchChannel => "no_such_channel",
        }
    }
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorError::Pwm(kind) => write!(f, "PWM write failed: {:?}", kind),
            ActuatorError::NoSuchChannel => write!(f, "no such channel"),
        }
    }
}

/// Rejected control configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// A min/max pair is empty, inverted or not finite.
    InvalidRange { option: &'static str },
    /// A weight is negative or not finite.
    InvalidWeight { option: &'static str },
}

impl ConfigError {
    pub const fn kind(&self) -> &'static str {
        match self {
            ConfigError::InvalidRange { .. } => "invalid_range",
            ConfigError::InvalidWeight { .. } => "invalid_weight",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidRange { option } => write!(f, "{} must be below its maximum", option),
            ConfigError::InvalidWeight { option } => {
                write!(f, "{} must be a finite, non-negative weight", option)
            }
        }
    }
}
