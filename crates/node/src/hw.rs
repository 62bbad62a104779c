//! Raspberry Pi peripherals via `rppal`.
//!
//! - Valve relays and the buzzer on GPIO (relays optionally active-low)
//! - Leak probe on an ADS1115 over I2C, free-running in continuous mode so
//!   a read is a single register fetch with no conversion wait
//! - DHT11 through the kernel IIO driver (sysfs)
//! - RS-485 through the primary UART, with a GPIO driving the transceiver's
//!   driver-enable line while there is output pending

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, OutputPin};
use rppal::i2c::I2c;
use rppal::uart::{Parity, Uart};
use tracing::{info, warn};

use crate::bus::Transport;
use crate::config::NodeSettings;
use crate::error::{SensorError, TransportError};
use crate::leak::BuzzerOutput;
use crate::node::Peripherals;
use crate::sensors::{ClimateReading, ClimateSensor, LeakSensor};
use crate::store::BaudRate;
use crate::valve::ValveOutput;

/// Open every device named in `settings`.  Relays and buzzer are driven off
/// as they are claimed.
pub fn open(settings: &NodeSettings, baud: BaudRate) -> Result<(Peripherals, Rs485Uart)> {
    let gpio = Gpio::new().context("gpio unavailable")?;

    let valves = GpioValves::new(&gpio, &settings.valve_pins(), settings.relay_active_low)?;
    let buzzer = GpioBuzzer::new(&gpio, settings.buzzer_pin)?;
    let leak = Ads1115Leak::new(settings.leak_adc_address, settings.leak_adc_channel)?;
    let climate = IioClimate::new(settings.climate_iio_dir.clone());
    let uart = Rs485Uart::new(&gpio, settings, baud)?;

    let peripherals = Peripherals {
        climate: Box::new(climate),
        leak: Box::new(leak),
        valves: Box::new(valves),
        buzzer: Box::new(buzzer),
    };
    Ok((peripherals, uart))
}

// ---------------------------------------------------------------------------
// GPIO outputs
// ---------------------------------------------------------------------------

pub struct GpioValves {
    pins: HashMap<u8, OutputPin>,
    active_low: bool,
}

impl GpioValves {
    pub fn new(gpio: &Gpio, pins: &[u8], active_low: bool) -> Result<Self> {
        let mut out = HashMap::new();
        for &pin_num in pins {
            let pin = gpio
                .get(pin_num)
                .with_context(|| format!("valve gpio {pin_num}"))?;
            // Claim the pin already at its "off" level.
            let pin = if active_low {
                pin.into_output_high()
            } else {
                pin.into_output_low()
            };
            out.insert(pin_num, pin);
        }
        info!(pins = ?pins, active_low, "valve relays ready");
        Ok(Self {
            pins: out,
            active_low,
        })
    }
}

impl ValveOutput for GpioValves {
    fn set(&mut self, pin: u8, open: bool) {
        let Some(out) = self.pins.get_mut(&pin) else {
            warn!(pin, "no relay on gpio");
            return;
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if open != self.active_low {
            out.set_high();
        } else {
            out.set_low();
        }
    }
}

pub struct GpioBuzzer {
    pin: OutputPin,
}

impl GpioBuzzer {
    pub fn new(gpio: &Gpio, pin: u8) -> Result<Self> {
        let pin = gpio
            .get(pin)
            .with_context(|| format!("buzzer gpio {pin}"))?
            .into_output_low();
        Ok(Self { pin })
    }
}

impl BuzzerOutput for GpioBuzzer {
    fn set(&mut self, on: bool) {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

// ---------------------------------------------------------------------------
// ADS1115 leak probe
// ---------------------------------------------------------------------------

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// Layout (MSB first):
//   [15]    OS       ignored in continuous mode
//   [14:12] MUX      input multiplexer (channel selection)
//   [11:9]  PGA      programmable gain amplifier
//   [8]     MODE     0 = continuous, 1 = single-shot
//   [7:5]   DR       data rate
//   [4:2]   comparator mode/polarity/latch
//   [1:0]   COMP_QUE 11 = comparator off

/// PGA=001 (±4.096 V), MODE=0 (continuous), DR=100 (128 SPS),
/// COMP_QUE=11.
const CONFIG_BASE: u16 = 0b0_000_001_0_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
/// AINx vs GND.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel & 0b11)] << MUX_SHIFT)
}

/// Single-ended conversions are non-negative; small negative values are
/// offset noise around 0 V.
fn counts_from_raw(raw: i16) -> u16 {
    raw.max(0).unsigned_abs()
}

pub struct Ads1115Leak {
    i2c: I2c,
}

impl Ads1115Leak {
    /// Open I2C bus 1, address the converter and start it free-running on
    /// `channel`.
    pub fn new(addr: u16, channel: u8) -> Result<Self> {
        anyhow::ensure!(channel <= 3, "ADS1115 channel {channel} out of range (0-3)");

        let mut i2c = I2c::new().context("i2c unavailable")?;
        i2c.set_slave_address(addr)?;
        i2c.block_write(REG_CONFIG, &config_for_channel(channel).to_be_bytes())
            .context("ads1115 did not accept configuration")?;

        info!(
            addr = format_args!("0x{addr:02x}"),
            channel, "ads1115 running continuous"
        );
        Ok(Self { i2c })
    }
}

impl LeakSensor for Ads1115Leak {
    fn read(&mut self) -> Result<u16, SensorError> {
        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_CONVERSION, &mut buf)
            .map_err(|e| SensorError::Io(e.to_string()))?;
        Ok(counts_from_raw(i16::from_be_bytes(buf)))
    }
}

// ---------------------------------------------------------------------------
// DHT11 via IIO
// ---------------------------------------------------------------------------

pub struct IioClimate {
    dir: PathBuf,
}

impl IioClimate {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn read_milli(&self, name: &str) -> Result<i32, SensorError> {
        let text = std::fs::read_to_string(self.dir.join(name)).map_err(io_to_sensor)?;
        parse_milli(&text)
    }
}

impl ClimateSensor for IioClimate {
    fn read(&mut self) -> Result<ClimateReading, SensorError> {
        let temp = self.read_milli("in_temp_input")?;
        let humidity = self.read_milli("in_humidityrelative_input")?;
        climate_from_milli(temp, humidity)
    }
}

/// The dht11 driver reports a bad checksum as EIO and a missing response
/// as ETIMEDOUT.
fn io_to_sensor(e: io::Error) -> SensorError {
    match (e.kind(), e.raw_os_error()) {
        (io::ErrorKind::TimedOut, _) => SensorError::Timeout,
        (_, Some(5)) => SensorError::Corrupt,
        _ => SensorError::Io(e.to_string()),
    }
}

fn parse_milli(text: &str) -> Result<i32, SensorError> {
    text.trim().parse().map_err(|_| SensorError::Corrupt)
}

/// DHT11 range: 0..50 °C, 20..90 %RH; anything far outside is garbage.
fn climate_from_milli(temp_milli: i32, humidity_milli: i32) -> Result<ClimateReading, SensorError> {
    let temperature_c = temp_milli.div_euclid(1000);
    let humidity_pct = humidity_milli.div_euclid(1000);
    if !(-40..=80).contains(&temperature_c) {
        return Err(SensorError::OutOfRange(temperature_c));
    }
    if !(0..=100).contains(&humidity_pct) {
        return Err(SensorError::OutOfRange(humidity_pct));
    }
    Ok(ClimateReading {
        temperature_c: temperature_c as i16,
        humidity_pct: humidity_pct as u8,
    })
}

// ---------------------------------------------------------------------------
// RS-485 UART
// ---------------------------------------------------------------------------

/// Bytes held for transmission before `queue` reports the line congested.
const TX_CAPACITY: usize = 1024;

pub struct Rs485Uart {
    uart: Uart,
    /// Driver enable: high while transmitting.
    de: OutputPin,
    rx: VecDeque<u8>,
    tx: VecDeque<u8>,
}

impl Rs485Uart {
    pub fn new(gpio: &Gpio, settings: &NodeSettings, baud: BaudRate) -> Result<Self> {
        let mut uart = Uart::with_path(&settings.serial_device, baud.bps(), Parity::None, 8, 1)
            .with_context(|| format!("uart {}", settings.serial_device.display()))?;
        // Non-blocking both ways.
        uart.set_read_mode(0, Duration::ZERO)?;
        uart.set_write_mode(false)?;

        let de = gpio
            .get(settings.rs485_control_pin)
            .with_context(|| format!("rs485 control gpio {}", settings.rs485_control_pin))?
            .into_output_low();

        info!(
            device = %settings.serial_device.display(),
            baud = %baud,
            "rs485 line open"
        );
        Ok(Self {
            uart,
            de,
            rx: VecDeque::new(),
            tx: VecDeque::new(),
        })
    }

    fn push_tx(&mut self) -> Result<(), TransportError> {
        if self.tx.is_empty() {
            return Ok(());
        }
        self.de.set_high();
        let (front, _) = self.tx.as_slices();
        let written = self.uart.write(front).map_err(uart_err)?;
        self.tx.drain(..written);
        Ok(())
    }
}

fn uart_err(e: rppal::uart::Error) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::Other, e))
}

impl Transport for Rs485Uart {
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        if self.rx.is_empty() {
            let mut buf = [0u8; 64];
            let n = self.uart.read(&mut buf).map_err(uart_err)?;
            self.rx.extend(&buf[..n]);
        }
        Ok(self.rx.pop_front())
    }

    fn queue(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.tx.len() + frame.len() > TX_CAPACITY {
            return Err(TransportError::QueueFull);
        }
        self.tx.extend(frame);
        self.push_tx()
    }

    fn service(&mut self) -> Result<(), TransportError> {
        self.push_tx()?;
        // Release the line only once the UART has shifted out the last bit.
        if self.tx.is_empty() && self.de.is_set_high() && self.uart.output_len().map_err(uart_err)? == 0 {
            self.de.set_low();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_channels() {
        assert_eq!(config_for_channel(0), 0x4283);
        assert_eq!(config_for_channel(1), 0x5283);
        assert_eq!(config_for_channel(2), 0x6283);
        assert_eq!(config_for_channel(3), 0x7283);
    }

    #[test]
    fn config_base_is_continuous_at_128sps() {
        assert_eq!((CONFIG_BASE >> 8) & 1, 0, "MODE should be continuous");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA should be ±4.096 V");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "DR should be 128 SPS");
    }

    #[test]
    fn negative_conversion_clamps_to_zero() {
        assert_eq!(counts_from_raw(-3), 0);
        assert_eq!(counts_from_raw(1234), 1234);
        assert_eq!(counts_from_raw(i16::MAX), 32767);
    }

    #[test]
    fn parses_iio_milli_values() {
        assert_eq!(parse_milli("23000\n"), Ok(23000));
        assert_eq!(parse_milli("garbage"), Err(SensorError::Corrupt));
        assert_eq!(
            climate_from_milli(23_000, 41_000),
            Ok(ClimateReading {
                temperature_c: 23,
                humidity_pct: 41
            })
        );
        assert_eq!(climate_from_milli(-2_500, 41_000).unwrap().temperature_c, -3);
    }

    #[test]
    fn implausible_climate_rejected() {
        assert_eq!(
            climate_from_milli(255_000, 40_000),
            Err(SensorError::OutOfRange(255))
        );
        assert_eq!(
            climate_from_milli(20_000, 140_000),
            Err(SensorError::OutOfRange(140))
        );
    }

    #[test]
    fn io_errors_mapped() {
        assert_eq!(
            io_to_sensor(io::Error::from_raw_os_error(5)),
            SensorError::Corrupt
        );
        assert_eq!(
            io_to_sensor(io::Error::new(io::ErrorKind::TimedOut, "dht11")),
            SensorError::Timeout
        );
        assert!(matches!(
            io_to_sensor(io::Error::new(io::ErrorKind::NotFound, "gone")),
            SensorError::Io(_)
        ));
    }
}
