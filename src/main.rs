#![no_std]
#![no_main]

use core::cell::RefCell;

use defmt::*;

use embassy_executor::Spawner;
use embassy_rp::adc::{self, Adc, Blocking};
use embassy_rp::gpio::{Input, Pull};
use embassy_rp::pwm::{self, Pwm, PwmOutput};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use static_cell::StaticCell;

use {defmt_rtt as _, panic_probe as _};

use coolant_ctl::{
    tasks, Actuator, ActuatorChannel, AnalogInput, ControlConfig, ControlStatus, CoolingContext,
    EdgeCounter, MajorityVote, SensorSet, TemperatureSensor, ThermalController, PWM_FREQUENCY_HZ,
};

const SYS_CLOCK_HZ: u32 = 125_000_000; // Default RP2040 system clock
const ADC_REFERENCE_MV: u32 = 3300;
const ADC_FULL_SCALE: u32 = 4095; // 12-bit converter

const FAN_MIN_DUTY: [f32; 3] = [40.0, 20.0, 25.0]; // Radiator fans stall below these
const PUMP_MIN_DUTY: f32 = 50.0; // The pump must never stop

type AdcBus = Mutex<CriticalSectionRawMutex, RefCell<Adc<'static, Blocking>>>;
type Sensor = TemperatureSensor<AdcInput>;
type Fan = ActuatorChannel<PwmOutput<'static>, MajorityVote>;
type Pump = ActuatorChannel<PwmOutput<'static>, EdgeCounter>;

/// One ADC pin on the shared converter
struct AdcInput {
    bus: &'static AdcBus,
    channel: adc::Channel<'static>,
}

impl AnalogInput for AdcInput {
    type Error = adc::Error;

    fn read_millivolts(&mut self) -> Result<u16, adc::Error> {
        let channel = &mut self.channel;
        let raw = self.bus.lock(|adc| adc.borrow_mut().blocking_read(channel))?;
        Ok((raw as u32 * ADC_REFERENCE_MV / ADC_FULL_SCALE) as u16)
    }
}

static ADC: StaticCell<AdcBus> = StaticCell::new();
static SENSORS: StaticCell<[Sensor; 3]> = StaticCell::new();
static FANS: StaticCell<[Fan; 3]> = StaticCell::new();
static PUMP: StaticCell<Pump> = StaticCell::new();
static FAN_REFS: StaticCell<[&'static dyn Actuator; 3]> = StaticCell::new();
static PUMP_REFS: StaticCell<[&'static dyn Actuator; 1]> = StaticCell::new();
static STATUS: ControlStatus = ControlStatus::new();

fn pwm_config() -> pwm::Config {
    let mut config = pwm::Config::default();
    config.top = (SYS_CLOCK_HZ / PWM_FREQUENCY_HZ - 1) as u16;
    config.compare_a = 0;
    config
}

#[embassy_executor::task(pool_size = 3)]
async fn sensor_task(sensor: &'static Sensor) {
    tasks::sample_sensor(sensor).await
}

#[embassy_executor::task(pool_size = 3)]
async fn fan_tach_task(mut pin: Input<'static>, tach: &'static MajorityVote) {
    tasks::poll_tach(&mut pin, tach).await
}

#[embassy_executor::task]
async fn pump_tach_task(mut pin: Input<'static>, tach: &'static EdgeCounter) {
    tasks::count_tach_edges(&mut pin, tach).await
}

#[embassy_executor::task]
async fn housekeeping_task(context: CoolingContext<'static>) {
    tasks::actuator_housekeeping(context).await
}

#[embassy_executor::task]
async fn control_task(mut controller: ThermalController<'static>) {
    tasks::run_controller(&mut controller).await
}

#[embassy_executor::task]
async fn snapshot_task(context: CoolingContext<'static>) {
    tasks::publish_snapshots(context, |snapshot| debug!("snapshot {}", snapshot)).await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Program start");
    let p = embassy_rp::init(Default::default());

    // Thermistors
    let adc = ADC.init(Mutex::new(RefCell::new(Adc::new_blocking(
        p.ADC,
        adc::Config::default(),
    ))));
    let sensors: &'static [Sensor; 3] = SENSORS.init([
        TemperatureSensor::new(
            "ambient",
            AdcInput { bus: adc, channel: adc::Channel::new_pin(p.PIN_26, Pull::None) }, // ADC0
        ),
        TemperatureSensor::new(
            "coolant_in",
            AdcInput { bus: adc, channel: adc::Channel::new_pin(p.PIN_27, Pull::None) }, // ADC1
        ),
        TemperatureSensor::new(
            "coolant_out",
            AdcInput { bus: adc, channel: adc::Channel::new_pin(p.PIN_28, Pull::None) }, // ADC2
        ),
    ]);

    // Fans and pump, 25kHz PWM on channel A of slices 0-3
    let fan1 = unwrap!(Pwm::new_output_a(p.PWM_SLICE0, p.PIN_0, pwm_config()).split().0);
    let fan2 = unwrap!(Pwm::new_output_a(p.PWM_SLICE1, p.PIN_2, pwm_config()).split().0);
    let fan3 = unwrap!(Pwm::new_output_a(p.PWM_SLICE2, p.PIN_4, pwm_config()).split().0);
    let pump = unwrap!(Pwm::new_output_a(p.PWM_SLICE3, p.PIN_6, pwm_config()).split().0);

    let fans: &'static [Fan; 3] = FANS.init([
        ActuatorChannel::new("fan1", fan1, MajorityVote::new(), FAN_MIN_DUTY[0]),
        ActuatorChannel::new("fan2", fan2, MajorityVote::new(), FAN_MIN_DUTY[1]),
        ActuatorChannel::new("fan3", fan3, MajorityVote::new(), FAN_MIN_DUTY[2]),
    ]);
    let pump: &'static Pump = PUMP.init(ActuatorChannel::new("pump", pump, EdgeCounter::new(), PUMP_MIN_DUTY));

    // Tachometers, open collector
    let fan_tachs = [
        Input::new(p.PIN_10, Pull::Up),
        Input::new(p.PIN_11, Pull::Up),
        Input::new(p.PIN_12, Pull::Up),
    ];
    let pump_tach = Input::new(p.PIN_13, Pull::Up);

    let context = CoolingContext {
        fans: FAN_REFS.init([&fans[0], &fans[1], &fans[2]]),
        pumps: PUMP_REFS.init([pump]),
        sensors: SensorSet {
            ambient: &sensors[0],
            coolant_in: &sensors[1],
            coolant_out: &sensors[2],
        },
        status: &STATUS,
    };
    let controller = unwrap!(ThermalController::new(context, ControlConfig::default()));

    for sensor in sensors {
        unwrap!(spawner.spawn(sensor_task(sensor)));
    }
    for (pin, fan) in fan_tachs.into_iter().zip(fans) {
        unwrap!(spawner.spawn(fan_tach_task(pin, fan.tachometer())));
    }
    unwrap!(spawner.spawn(pump_tach_task(pump_tach, pump.tachometer())));
    unwrap!(spawner.spawn(housekeeping_task(context)));
    unwrap!(spawner.spawn(snapshot_task(context)));
    unwrap!(spawner.spawn(control_task(controller)));

    info!("All tasks running");
}
