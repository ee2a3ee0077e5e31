//! Tunable parameters of the control law.

use crate::error::ConfigError;

/// Control law configuration.
///
/// Intensity is a weighted blend of two normalized factors:
/// - delta-T between the hottest coolant reading and ambient, scaled over
///   `min_delta_t..max_delta_t`
/// - absolute coolant temperature, scaled over `base_water_temp..max_water_temp`
///
/// The weights are expected to sum to 1.0; anything else only draws a warning
/// from [`ControlConfig::validate`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlConfig {
    /// Delta-T (Celsius) at or below which the delta-T factor is zero
    pub min_delta_t: f32,
    /// Delta-T (Celsius) at which the delta-T factor saturates
    pub max_delta_t: f32,
    /// Coolant temperature (Celsius) at or below which the water factor is zero
    pub base_water_temp: f32,
    /// Coolant temperature (Celsius) at which the water factor saturates
    pub max_water_temp: f32,
    /// Weight of the delta-T factor
    pub delta_t_weight: f32,
    /// Weight of the absolute water temperature factor
    pub water_temp_weight: f32,
    /// Leave channels under manual override alone in normal operation
    pub honor_overrides: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            min_delta_t: 5.0,
            max_delta_t: 8.0,
            base_water_temp: 25.0,
            max_water_temp: 30.0,
            delta_t_weight: 0.4,
            water_temp_weight: 0.6,
            honor_overrides: true,
        }
    }
}

impl ControlConfig {
    /// Reject ranges the control law cannot normalize over, and unusable weights.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("min_delta_t", self.min_delta_t, self.max_delta_t)?;
        check_range("base_water_temp", self.base_water_temp, self.max_water_temp)?;
        check_weight("delta_t_weight", self.delta_t_weight)?;
        check_weight("water_temp_weight", self.water_temp_weight)?;

        let sum = self.delta_t_weight + self.water_temp_weight;
        if libm::fabsf(sum - 1.0) > 0.001 {
            warn!("control weights sum to {} instead of 1.0", sum);
        }
        Ok(())
    }
}

fn check_range(option: &'static str, min: f32, max: f32) -> Result<(), ConfigError> {
    if min.is_finite() && max.is_finite() && min < max {
        Ok(())
    } else {
        Err(ConfigError::InvalidRange { option })
    }
}

fn check_weight(option: &'static str, weight: f32) -> Result<(), ConfigError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeight { option })
    }
}
