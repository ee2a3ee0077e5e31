//! NTC thermistor sensor with auto-calibration and noise rejection.
//!
//! Each sensor is a thermistor on the low side of a voltage divider:
//! `Vref -- series resistor -- ADC pin -- thermistor -- GND`.
//! At construction the sensor takes one reading and keeps whichever stock
//! thermistor model makes that reading plausible. A periodic activity then
//! feeds [`TemperatureSensor::sample`], and the control loop reads the
//! rolling average through [`TemperatureSensor::smoothed`].

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::error::SensorError;
use crate::{
    MAX_VALID_TEMP, MIN_VALID_TEMP, SAMPLE_HISTORY_LEN, SMOOTHED_SAMPLES, SPIKE_REJECT_DELTA,
    SPIKE_REJECT_MIN_SAMPLES,
};

const KELVIN_OFFSET: f32 = 273.15;
const RAIL_MARGIN_MV: f32 = 10.0; // Readings this close to a rail mean a short or an open circuit

/// One analog input channel the thermistor divider is wired to.
pub trait AnalogInput {
    type Error: fmt::Debug;

    /// Take a single conversion, in millivolts at the pin.
    fn read_millivolts(&mut self) -> Result<u16, Self::Error>;
}

/// Beta-model parameters of an NTC thermistor
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThermistorParams {
    /// Resistance at the nominal temperature (Ohm)
    pub nominal_ohms: f32,
    /// Temperature the nominal resistance is specified at (Celsius)
    pub nominal_celsius: f32,
    /// Beta coefficient (Kelvin)
    pub beta: f32,
}

impl ThermistorParams {
    /// 10k Ohm @ 25C, B = 3435K
    pub const NTC_10K_3435: Self = Self {
        nominal_ohms: 10_000.0,
        nominal_celsius: 25.0,
        beta: 3435.0,
    };

    /// 50k Ohm @ 25C, B = 3970K
    pub const NTC_50K_3970: Self = Self {
        nominal_ohms: 50_000.0,
        nominal_celsius: 25.0,
        beta: 3970.0,
    };

    /// Convert a thermistor resistance to Celsius.
    ///
    /// `1/T = 1/T0 + (1/B) * ln(R/R0)`. Zero and infinite resistance both land
    /// at absolute zero, which the plausibility check then rejects.
    pub fn celsius(&self, ohms: f32) -> f32 {
        let inverse_kelvin = 1.0 / (self.nominal_celsius + KELVIN_OFFSET)
            + libm::logf(ohms / self.nominal_ohms) / self.beta;
        1.0 / inverse_kelvin - KELVIN_OFFSET
    }
}

/// The divider the thermistor sits in
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DividerCircuit {
    /// Divider supply (millivolts)
    pub reference_mv: f32,
    /// Fixed resistor between the supply and the ADC pin (Ohm)
    pub series_ohms: f32,
}

impl DividerCircuit {
    /// 3.3V supply through a 10k resistor
    pub const STOCK: Self = Self {
        reference_mv: 3300.0,
        series_ohms: 10_000.0,
    };

    /// Thermistor resistance for a pin voltage.
    pub fn resistance(&self, millivolts: u16) -> f32 {
        let v_out = millivolts as f32;
        if v_out <= RAIL_MARGIN_MV {
            0.0
        } else if v_out >= self.reference_mv - RAIL_MARGIN_MV {
            f32::INFINITY
        } else {
            self.series_ohms * (v_out / (self.reference_mv - v_out))
        }
    }
}

impl Default for DividerCircuit {
    fn default() -> Self {
        Self::STOCK
    }
}

/// Which thermistor model a sensor settled on at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Calibration {
    /// Detection has not run yet
    #[default]
    Uncalibrated,
    /// 10k / 3435K thermistor
    Ntc10k,
    /// 50k / 3970K thermistor
    Ntc50k,
    /// No model gave a plausible reading; permanent
    Failed,
}

impl Calibration {
    /// Pick the first stock model that turns `millivolts` into a plausible temperature.
    pub fn detect(circuit: &DividerCircuit, millivolts: u16) -> Self {
        let ohms = circuit.resistance(millivolts);
        [Calibration::Ntc10k, Calibration::Ntc50k]
            .into_iter()
            .find(|candidate| {
                candidate
                    .params()
                    .map_or(false, |params| is_plausible(params.celsius(ohms)))
            })
            .unwrap_or(Calibration::Failed)
    }

    pub fn params(&self) -> Option<ThermistorParams> {
        match self {
            Calibration::Ntc10k => Some(ThermistorParams::NTC_10K_3435),
            Calibration::Ntc50k => Some(ThermistorParams::NTC_50K_3970),
            Calibration::Uncalibrated | Calibration::Failed => None,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self, Calibration::Ntc10k | Calibration::Ntc50k)
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calibration::Ntc10k => write!(f, "10K @ 25C"),
            Calibration::Ntc50k => write!(f, "50K @ 25C"),
            Calibration::Uncalibrated => write!(f, "uncalibrated"),
            Calibration::Failed => write!(f, "calibration failed"),
        }
    }
}

/// Whether a temperature is inside the band a healthy sensor can report.
pub fn is_plausible(celsius: f32) -> bool {
    (MIN_VALID_TEMP..=MAX_VALID_TEMP).contains(&celsius)
}

/// Fixed-capacity ring of accepted samples, newest overwriting oldest.
#[derive(Clone, Debug)]
pub struct SampleHistory<const N: usize> {
    samples: [f32; N],
    next: usize,
    seen: u32,
}

impl<const N: usize> SampleHistory<N> {
    pub const fn new() -> Self {
        Self {
            samples: [0.0; N],
            next: 0,
            seen: 0,
        }
    }

    pub fn push(&mut self, value: f32) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % N;
        self.seen = self.seen.saturating_add(1);
    }

    /// Samples currently retained.
    pub fn len(&self) -> usize {
        (self.seen as usize).min(N)
    }

    pub fn is_empty(&self) -> bool {
        self.seen == 0
    }

    /// Samples accepted since creation, including overwritten ones.
    pub fn seen(&self) -> u32 {
        self.seen
    }

    /// Retained samples, newest first.
    pub fn newest_first(&self) -> impl Iterator<Item = f32> + '_ {
        (0..self.len()).map(move |age| self.samples[(self.next + N - 1 - age) % N])
    }

    /// Mean of every retained sample.
    pub fn average(&self) -> Option<f32> {
        self.recent_average(N)
    }

    /// Mean of the `count` newest samples, or of all of them if fewer are retained.
    pub fn recent_average(&self, count: usize) -> Option<f32> {
        let count = count.min(self.len());
        if count == 0 {
            return None;
        }
        let sum: f32 = self.newest_first().take(count).sum();
        Some(sum / count as f32)
    }
}

impl<const N: usize> Default for SampleHistory<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a sampling tick did with the fresh reading.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SampleOutcome {
    /// Stored in the history
    Accepted(f32),
    /// Outside the plausible band, dropped
    OutOfRange(f32),
    /// Too far from the rolling average, dropped as noise
    Spike { value: f32, average: f32 },
    /// Sensor never calibrated, nothing read
    NotCalibrated,
    /// The analog input failed
    ReadFailed,
}

/// Read-only view of a temperature sensor, as used by the controller and
/// status collaborators.
pub trait TemperatureSource: Sync {
    fn id(&self) -> &'static str;

    fn calibration(&self) -> Calibration;

    /// A fresh single reading, without touching the history.
    fn instantaneous(&self) -> Result<f32, SensorError>;

    /// Average of the most recent accepted samples.
    fn smoothed(&self) -> Result<f32, SensorError>;
}

struct SensorState<A> {
    input: A,
    history: SampleHistory<SAMPLE_HISTORY_LEN>,
}

/// Auto-calibrating thermistor reader for one analog channel
pub struct TemperatureSensor<A> {
    id: &'static str,
    circuit: DividerCircuit,
    calibration: Calibration,
    state: Mutex<CriticalSectionRawMutex, RefCell<SensorState<A>>>,
}

impl<A: AnalogInput> TemperatureSensor<A> {
    /// Create a sensor on the stock divider and calibrate it from one reading.
    pub fn new(id: &'static str, input: A) -> Self {
        Self::with_circuit(id, input, DividerCircuit::STOCK)
    }

    pub fn with_circuit(id: &'static str, mut input: A, circuit: DividerCircuit) -> Self {
        let calibration = match input.read_millivolts() {
            Ok(millivolts) => {
                let calibration = Calibration::detect(&circuit, millivolts);
                let ohms = circuit.resistance(millivolts);
                match calibration.params() {
                    Some(params) => info!(
                        "thermistor {} calibrated as {}, temp: {}C",
                        id,
                        calibration,
                        params.celsius(ohms)
                    ),
                    None => error!(
                        "thermistor {} calibration failed. 10K temp: {}C, 50K temp: {}C",
                        id,
                        ThermistorParams::NTC_10K_3435.celsius(ohms),
                        ThermistorParams::NTC_50K_3970.celsius(ohms)
                    ),
                }
                calibration
            }
            Err(_) => {
                error!("thermistor {} calibration failed: analog read error", id);
                Calibration::Failed
            }
        };

        Self {
            id,
            circuit,
            calibration,
            state: Mutex::new(RefCell::new(SensorState {
                input,
                history: SampleHistory::new(),
            })),
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Samples accepted into the history so far.
    pub fn samples_seen(&self) -> u32 {
        self.state.lock(|state| state.borrow().history.seen())
    }

    /// Run `f` against the analog input, e.g. for diagnostics.
    pub fn with_input<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut().input))
    }

    fn convert(&self, input: &mut A) -> Result<f32, SensorError> {
        let params = self.calibration.params().ok_or(SensorError::Calibration)?;
        let millivolts = input
            .read_millivolts()
            .map_err(|_| SensorError::Acquisition)?;
        Ok(params.celsius(self.circuit.resistance(millivolts)))
    }

    /// One periodic sampling tick.
    ///
    /// Implausible readings are dropped. Once the history has settled,
    /// readings far from the rolling average are dropped too; a sustained
    /// trend still gets through because the average follows accepted samples.
    pub fn sample(&self) -> SampleOutcome {
        if !self.calibration.is_calibrated() {
            return SampleOutcome::NotCalibrated;
        }

        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let value = match self.convert(&mut state.input) {
                Ok(value) => value,
                Err(_) => return SampleOutcome::ReadFailed,
            };

            if !is_plausible(value) {
                return SampleOutcome::OutOfRange(value);
            }

            if state.history.seen() >= SPIKE_REJECT_MIN_SAMPLES {
                if let Some(average) = state.history.average() {
                    if libm::fabsf(value - average) > SPIKE_REJECT_DELTA {
                        return SampleOutcome::Spike { value, average };
                    }
                }
            }

            state.history.push(value);
            SampleOutcome::Accepted(value)
        })
    }

    /// Fresh reading, validated against the plausible band. Leaves the history alone.
    pub fn instantaneous(&self) -> Result<f32, SensorError> {
        let value = self
            .state
            .lock(|state| self.convert(&mut state.borrow_mut().input))?;
        if is_plausible(value) {
            Ok(value)
        } else {
            Err(SensorError::OutOfRange(value))
        }
    }

    /// Average of the newest samples (up to three).
    pub fn smoothed(&self) -> Result<f32, SensorError> {
        if !self.calibration.is_calibrated() {
            return Err(SensorError::Calibration);
        }
        self.state
            .lock(|state| state.borrow().history.recent_average(SMOOTHED_SAMPLES))
            .ok_or(SensorError::Internal)
    }
}

impl<A: AnalogInput + Send> TemperatureSource for TemperatureSensor<A> {
    fn id(&self) -> &'static str {
        self.id
    }

    fn calibration(&self) -> Calibration {
        self.calibration
    }

    fn instantaneous(&self) -> Result<f32, SensorError> {
        TemperatureSensor::instantaneous(self)
    }

    fn smoothed(&self) -> Result<f32, SensorError> {
        TemperatureSensor::smoothed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Divider voltage a thermistor at `celsius` produces on the stock circuit
    fn millivolts_for(params: ThermistorParams, celsius: f32) -> u16 {
        let kelvin = celsius + KELVIN_OFFSET;
        let nominal = params.nominal_celsius + KELVIN_OFFSET;
        let ohms = params.nominal_ohms * (params.beta * (1.0 / kelvin - 1.0 / nominal)).exp();
        let circuit = DividerCircuit::STOCK;
        (circuit.reference_mv * ohms / (circuit.series_ohms + ohms)).round() as u16
    }

    struct FixedInput {
        millivolts: u16,
        fail: bool,
    }

    impl FixedInput {
        fn new(millivolts: u16) -> Self {
            Self {
                millivolts,
                fail: false,
            }
        }
    }

    impl AnalogInput for FixedInput {
        type Error = ();

        fn read_millivolts(&mut self) -> Result<u16, ()> {
            if self.fail {
                Err(())
            } else {
                Ok(self.millivolts)
            }
        }
    }

    fn set_temperature(sensor: &TemperatureSensor<FixedInput>, celsius: f32) {
        let params = sensor.calibration().params().unwrap();
        sensor.with_input(|input| input.millivolts = millivolts_for(params, celsius));
    }

    #[test]
    fn test_beta_equation_at_nominal() {
        assert_relative_eq!(
            ThermistorParams::NTC_10K_3435.celsius(10_000.0),
            25.0,
            epsilon = 0.001
        );
        assert_relative_eq!(
            ThermistorParams::NTC_50K_3970.celsius(50_000.0),
            25.0,
            epsilon = 0.001
        );
    }

    #[test]
    fn test_divider_rails() {
        let circuit = DividerCircuit::STOCK;
        assert_eq!(circuit.resistance(0), 0.0);
        assert_eq!(circuit.resistance(5), 0.0);
        assert!(circuit.resistance(3295).is_infinite());
        assert_relative_eq!(circuit.resistance(1650), 10_000.0, epsilon = 0.5);
        // Both rails are far outside the plausible band
        assert!(!is_plausible(ThermistorParams::NTC_10K_3435.celsius(0.0)));
        assert!(!is_plausible(
            ThermistorParams::NTC_10K_3435.celsius(f32::INFINITY)
        ));
    }

    #[test]
    fn test_detects_10k() {
        let sensor = TemperatureSensor::new("ambient", FixedInput::new(1650));
        assert_eq!(sensor.calibration(), Calibration::Ntc10k);
        assert_relative_eq!(sensor.instantaneous().unwrap(), 25.0, epsilon = 0.05);
    }

    #[test]
    fn test_detects_50k() {
        let millivolts = millivolts_for(ThermistorParams::NTC_50K_3970, 30.0);
        let sensor = TemperatureSensor::new("coolant_in", FixedInput::new(millivolts));
        assert_eq!(sensor.calibration(), Calibration::Ntc50k);
        assert_relative_eq!(sensor.instantaneous().unwrap(), 30.0, epsilon = 0.1);
    }

    #[test]
    fn test_uncalibrated_has_no_model() {
        assert_eq!(Calibration::default(), Calibration::Uncalibrated);
        assert_eq!(Calibration::Uncalibrated.params(), None);
        assert!(!Calibration::Uncalibrated.is_calibrated());
    }

    #[test]
    fn test_calibration_failure_is_permanent() {
        let sensor = TemperatureSensor::new("coolant_out", FixedInput::new(0));
        assert_eq!(sensor.calibration(), Calibration::Failed);

        // Even a perfectly valid reading later on does not recover the sensor
        sensor.with_input(|input| input.millivolts = 1650);
        assert_eq!(sensor.sample(), SampleOutcome::NotCalibrated);
        assert_eq!(sensor.instantaneous(), Err(SensorError::Calibration));
        assert_eq!(sensor.smoothed(), Err(SensorError::Calibration));
        assert_eq!(sensor.calibration(), Calibration::Failed);
    }

    #[test]
    fn test_read_error_during_calibration_fails() {
        let mut input = FixedInput::new(1650);
        input.fail = true;
        let sensor = TemperatureSensor::new("ambient", input);
        assert_eq!(sensor.calibration(), Calibration::Failed);
    }

    #[test]
    fn test_smoothed_without_samples() {
        let sensor = TemperatureSensor::new("ambient", FixedInput::new(1650));
        assert_eq!(sensor.smoothed(), Err(SensorError::Internal));
    }

    #[test]
    fn test_smoothed_single_sample_is_unchanged() {
        let sensor = TemperatureSensor::new("ambient", FixedInput::new(1650));
        set_temperature(&sensor, 27.0);
        let accepted = match sensor.sample() {
            SampleOutcome::Accepted(value) => value,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(sensor.smoothed().unwrap(), accepted);
    }

    #[test]
    fn test_smoothed_uses_three_newest() {
        let sensor = TemperatureSensor::new("ambient", FixedInput::new(1650));
        for celsius in [20.0, 21.0, 22.0, 23.0, 24.0] {
            set_temperature(&sensor, celsius);
            assert!(matches!(sensor.sample(), SampleOutcome::Accepted(_)));
        }
        assert_relative_eq!(sensor.smoothed().unwrap(), 23.0, epsilon = 0.05);
        assert_eq!(sensor.samples_seen(), 5);
    }

    #[test]
    fn test_out_of_range_sample_dropped() {
        let sensor = TemperatureSensor::new("ambient", FixedInput::new(1650));
        sensor.with_input(|input| input.millivolts = 3300);
        assert!(matches!(sensor.sample(), SampleOutcome::OutOfRange(_)));
        assert!(matches!(
            sensor.instantaneous(),
            Err(SensorError::OutOfRange(_))
        ));
        assert_eq!(sensor.samples_seen(), 0);
    }

    #[test]
    fn test_read_failure_reported() {
        let sensor = TemperatureSensor::new("ambient", FixedInput::new(1650));
        sensor.with_input(|input| input.fail = true);
        assert_eq!(sensor.sample(), SampleOutcome::ReadFailed);
        assert_eq!(sensor.instantaneous(), Err(SensorError::Acquisition));
    }

    #[test]
    fn test_spike_rejected_after_history_settles() {
        let sensor = TemperatureSensor::new("coolant_in", FixedInput::new(1650));
        set_temperature(&sensor, 25.0);
        for _ in 0..SPIKE_REJECT_MIN_SAMPLES {
            assert!(matches!(sensor.sample(), SampleOutcome::Accepted(_)));
        }

        set_temperature(&sensor, 40.0);
        assert!(matches!(sensor.sample(), SampleOutcome::Spike { .. }));
        assert_relative_eq!(sensor.smoothed().unwrap(), 25.0, epsilon = 0.05);
    }

    #[test]
    fn test_spike_allowed_before_history_settles() {
        let sensor = TemperatureSensor::new("coolant_in", FixedInput::new(1650));
        set_temperature(&sensor, 25.0);
        for _ in 0..SPIKE_REJECT_MIN_SAMPLES - 1 {
            sensor.sample();
        }
        set_temperature(&sensor, 40.0);
        assert!(matches!(sensor.sample(), SampleOutcome::Accepted(_)));
    }

    #[test]
    fn test_sustained_trend_followed() {
        let sensor = TemperatureSensor::new("coolant_out", FixedInput::new(1650));
        set_temperature(&sensor, 25.0);
        for _ in 0..SAMPLE_HISTORY_LEN {
            sensor.sample();
        }

        // Warm up 0.5C per sample; the average trails by under 3C
        let mut celsius = 25.0;
        for _ in 0..15 {
            celsius += 0.5;
            set_temperature(&sensor, celsius);
            assert!(matches!(sensor.sample(), SampleOutcome::Accepted(_)));
        }
        assert_relative_eq!(sensor.smoothed().unwrap(), 32.0, epsilon = 0.1);
    }

    #[test]
    fn test_history_ring_wraps() {
        let mut history = SampleHistory::<3>::new();
        assert!(history.is_empty());
        assert_eq!(history.average(), None);
        for value in [1.0, 2.0, 3.0, 4.0] {
            history.push(value);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.seen(), 4);
        let newest: Vec<f32> = history.newest_first().collect();
        assert_eq!(newest, vec![4.0, 3.0, 2.0]);
        assert_eq!(history.recent_average(2), Some(3.5));
        assert_eq!(history.average(), Some(3.0));
    }
}
