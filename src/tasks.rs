//! Periodic activities.
//!
//! Each function here is an endless loop meant to be wrapped in its own
//! executor task. They share state only through the sensors, channels and
//! [`ControlStatus`](crate::controller::ControlStatus) they are handed.

use embassy_time::{Duration, Instant, Ticker, Timer};
use embedded_hal::digital::{Error as _, InputPin};
use embedded_hal_async::digital::Wait;

use crate::actuator::tachometer::{EdgeCounter, MajorityVote};
use crate::context::CoolingContext;
use crate::controller::ThermalController;
use crate::sensor::{AnalogInput, SampleOutcome, TemperatureSensor};
use crate::snapshot::PerfSnapshot;
use crate::{
    CONTROL_INTERVAL_MS, RPM_WINDOW_MS, SENSOR_SAMPLE_INTERVAL_MS, SMOOTHING_INTERVAL_MS,
    SNAPSHOT_INTERVAL_MS, TACH_SAMPLE_INTERVAL_MS,
};

/// Feed a sensor's history every sampling interval.
pub async fn sample_sensor<A: AnalogInput>(sensor: &TemperatureSensor<A>) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(SENSOR_SAMPLE_INTERVAL_MS));
    loop {
        match sensor.sample() {
            SampleOutcome::Accepted(value) => trace!("{}: {}C", sensor.id(), value),
            SampleOutcome::OutOfRange(value) => {
                warn!("{}: {}C out of range, dropped", sensor.id(), value)
            }
            SampleOutcome::Spike { value, average } => warn!(
                "{}: {}C too far from average {}C, dropped",
                sensor.id(),
                value,
                average
            ),
            SampleOutcome::NotCalibrated => trace!("{}: not calibrated", sensor.id()),
            SampleOutcome::ReadFailed => warn!("{}: analog read failed", sensor.id()),
        }
        ticker.next().await;
    }
}

/// Count tach edges on a pin with interrupt support.
pub async fn count_tach_edges<P: Wait>(pin: &mut P, tach: &EdgeCounter) -> ! {
    loop {
        match pin.wait_for_rising_edge().await {
            Ok(()) => {
                tach.on_rising_edge(Instant::now());
            }
            Err(err) => {
                warn!("tach edge wait failed: {:?}", err.kind());
                Timer::after_millis(RPM_WINDOW_MS).await;
            }
        }
    }
}

/// Sample a tach line at a fixed rate for majority-vote debouncing.
/// A pin read error counts as a low sample.
pub async fn poll_tach<P: InputPin>(pin: &mut P, tach: &MajorityVote) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(TACH_SAMPLE_INTERVAL_MS));
    loop {
        tach.sample(pin.is_high().unwrap_or(false));
        ticker.next().await;
    }
}

/// Smooth every channel's output, and recompute RPM once per window.
pub async fn actuator_housekeeping(context: CoolingContext<'_>) -> ! {
    let window = Duration::from_millis(RPM_WINDOW_MS);
    let ticks_per_window = (RPM_WINDOW_MS / SMOOTHING_INTERVAL_MS).max(1);
    let mut ticker = Ticker::every(Duration::from_millis(SMOOTHING_INTERVAL_MS));
    let mut tick: u64 = 0;
    loop {
        ticker.next().await;
        tick = tick.wrapping_add(1);
        for channel in context.channels() {
            // Write failures are logged by the channel
            let _ = channel.smooth();
        }
        if tick % ticks_per_window == 0 {
            for channel in context.channels() {
                channel.refresh_rpm(window);
            }
        }
    }
}

pub async fn run_controller(controller: &mut ThermalController<'_>) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(CONTROL_INTERVAL_MS));
    loop {
        ticker.next().await;
        controller.tick();
    }
}

/// Hand a [`PerfSnapshot`] to `sink` once per interval.
pub async fn publish_snapshots<F: FnMut(PerfSnapshot)>(context: CoolingContext<'_>, mut sink: F) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(SNAPSHOT_INTERVAL_MS));
    loop {
        ticker.next().await;
        let uptime = Duration::from_ticks(Instant::now().as_ticks());
        sink(context.snapshot(uptime));
    }
}
