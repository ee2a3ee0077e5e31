//! Everything the control loop and its collaborators share, built once at
//! startup and passed around by value.

use embassy_time::Duration;

use crate::actuator::Actuator;
use crate::controller::ControlStatus;
use crate::error::ActuatorError;
use crate::sensor::TemperatureSource;
use crate::snapshot::{encode_duty, encode_temperature, ChannelSample, PerfSnapshot};

/// The three temperature roles the control law needs.
#[derive(Clone, Copy)]
pub struct SensorSet<'a> {
    pub ambient: &'a dyn TemperatureSource,
    pub coolant_in: &'a dyn TemperatureSource,
    pub coolant_out: &'a dyn TemperatureSource,
}

impl<'a> SensorSet<'a> {
    /// Ambient, coolant in, coolant out.
    pub fn all(&self) -> [&'a dyn TemperatureSource; 3] {
        [self.ambient, self.coolant_in, self.coolant_out]
    }
}

/// Position of a channel within its group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelRef {
    /// Index into `CoolingContext::fans`
    Fan(usize),
    /// Index into `CoolingContext::pumps`
    Pump(usize),
}

/// Shared handles to every sensor and channel, plus the published control status.
#[derive(Clone, Copy)]
pub struct CoolingContext<'a> {
    /// Radiator fans, driven to 100% in failsafe
    pub fans: &'a [&'a dyn Actuator],
    /// Pumps, never touched by failsafe
    pub pumps: &'a [&'a dyn Actuator],
    pub sensors: SensorSet<'a>,
    pub status: &'a ControlStatus,
}

impl<'a> CoolingContext<'a> {
    /// Channel at a position, if there is one.
    pub fn channel(&self, channel: ChannelRef) -> Option<&'a dyn Actuator> {
        match channel {
            ChannelRef::Fan(index) => self.fans.get(index).copied(),
            ChannelRef::Pump(index) => self.pumps.get(index).copied(),
        }
    }

    /// Fans first, then pumps.
    pub fn channels(&self) -> impl Iterator<Item = &'a dyn Actuator> + 'a {
        let (fans, pumps) = (self.fans, self.pumps);
        fans.iter().chain(pumps.iter()).copied()
    }

    pub fn find(&self, label: &str) -> Option<&'a dyn Actuator> {
        self.channels().find(|channel| channel.label() == label)
    }

    /// Drive a channel to `percent` right away and keep the controller off it.
    pub fn override_channel(&self, channel: ChannelRef, percent: f32) -> Result<f32, ActuatorError> {
        let actuator = self.channel(channel).ok_or(ActuatorError::NoSuchChannel)?;
        let applied = actuator.set_immediate(percent)?;
        actuator.lock_duty_cycle();
        Ok(applied)
    }

    /// Hand a channel back to the controller.
    pub fn release_channel(&self, channel: ChannelRef) -> Result<(), ActuatorError> {
        let actuator = self.channel(channel).ok_or(ActuatorError::NoSuchChannel)?;
        actuator.reset();
        Ok(())
    }

    pub fn snapshot(&self, uptime: Duration) -> PerfSnapshot {
        let mut snapshot = PerfSnapshot {
            uptime_s: uptime.as_secs() as u16,
            channels: heapless::Vec::new(),
            temperatures: [0; 3],
        };
        for channel in self.channels() {
            let sample = ChannelSample {
                target: encode_duty(channel.target_duty_cycle()),
                current: encode_duty(channel.duty_cycle()),
                rpm: channel.rpm().min(u16::MAX as u32) as u16,
            };
            if snapshot.channels.push(sample).is_err() {
                warn!("snapshot full, {} left out", channel.label());
                break;
            }
        }
        for (slot, sensor) in snapshot.temperatures.iter_mut().zip(self.sensors.all()) {
            *slot = encode_temperature(sensor.instantaneous().ok());
        }
        snapshot
    }
}
