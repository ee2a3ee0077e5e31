//! Compact per-second performance records.
//!
//! The recorder that stores these is outside this crate; it gets a
//! [`PerfSnapshot`] once per second and decides what to keep.

use heapless::Vec;

use crate::{MAX_VALID_TEMP, MIN_VALID_TEMP};

/// Most channels a snapshot can describe.
pub const MAX_SNAPSHOT_CHANNELS: usize = 8;

/// Duty percent to one byte: 0..=100 maps onto 0..=255.
pub fn encode_duty(percent: f32) -> u8 {
    if percent.is_nan() || percent <= 0.0 {
        0
    } else if percent >= 100.0 {
        255
    } else {
        (percent * 255.0 / 100.0) as u8
    }
}

/// Temperature to one byte: the plausible band maps onto 0..=255, saturating.
/// Unreadable sensors are passed as `None` and encode as 0.
pub fn encode_temperature(celsius: Option<f32>) -> u8 {
    match celsius {
        Some(t) if t.is_nan() => 0,
        Some(t) if t <= MIN_VALID_TEMP => 0,
        Some(t) if t >= MAX_VALID_TEMP => 255,
        Some(t) => ((t - MIN_VALID_TEMP) * 255.0 / (MAX_VALID_TEMP - MIN_VALID_TEMP)) as u8,
        None => 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSample {
    pub target: u8,
    pub current: u8,
    pub rpm: u16,
}

/// One second of controller state, fans first then pumps.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PerfSnapshot {
    /// Seconds since boot, wrapping
    pub uptime_s: u16,
    pub channels: Vec<ChannelSample, MAX_SNAPSHOT_CHANNELS>,
    /// Ambient, coolant in, coolant out
    pub temperatures: [u8; 3],
}
