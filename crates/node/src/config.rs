//! Node settings: pin assignments, poll intervals and bus identity.
//!
//! These are fixed for the life of the process.  They come from a TOML file
//! when one is present and from the compiled-in defaults otherwise, and are
//! validated once at startup with every violation reported together.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::clock::MAX_INTERVAL_MS;

/// Upper bound on valve channels a node can drive.
pub const MAX_VALVES: usize = 8;

/// Longest node address accepted on the bus.
pub const MAX_ADDRESS_LEN: usize = 16;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// ADS1115 single-ended inputs AIN0..AIN3.
const MAX_ADC_CHANNEL: u8 = 3;

// ---------------------------------------------------------------------------
// Settings file structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSettings {
    /// Bus identity; frames addressed to anything else are ignored.
    pub address: String,
    /// File holding the persisted operating parameters.
    pub storage_path: PathBuf,

    pub serial_device: PathBuf,
    /// Driver-enable pin of the RS-485 transceiver.
    pub rs485_control_pin: u8,

    pub climate_poll_ms: u32,
    pub leak_poll_ms: u32,

    /// Longest valve run accepted from the host.
    pub max_open_ms: u32,
    /// Silence applied when the host asks for a zero-length silence.
    pub default_silence_ms: u32,

    pub valves: Vec<ValveEntry>,
    pub buzzer_pin: u8,
    /// Many common relay boards are active-low.
    pub relay_active_low: bool,

    pub leak_adc_address: u16,
    pub leak_adc_channel: u8,
    /// IIO device directory exposed by the kernel dht11 driver.
    pub climate_iio_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValveEntry {
    pub pin: u8,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            address: "Sprinkler1".into(),
            storage_path: PathBuf::from("node-config.bin"),
            serial_device: PathBuf::from("/dev/serial0"),
            rs485_control_pin: 4,
            climate_poll_ms: 60_000,
            leak_poll_ms: 1_000,
            max_open_ms: 2 * 60 * 60 * 1000,
            default_silence_ms: 10 * 60 * 1000,
            valves: [17, 27, 22, 23]
                .into_iter()
                .map(|pin| ValveEntry { pin })
                .collect(),
            buzzer_pin: 24,
            relay_active_low: true,
            leak_adc_address: 0x48,
            leak_adc_channel: 0,
            climate_iio_dir: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl NodeSettings {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_pins(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.address.is_empty() {
            errors.push("address is empty".into());
        } else if !self.address.bytes().all(|b| b.is_ascii_graphic()) {
            errors.push(format!(
                "address {:?} must be printable ASCII without spaces",
                self.address
            ));
        } else if self.address.len() > MAX_ADDRESS_LEN {
            errors.push(format!(
                "address {:?} longer than {MAX_ADDRESS_LEN} characters",
                self.address
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let intervals = [
            ("climate_poll_ms", self.climate_poll_ms),
            ("leak_poll_ms", self.leak_poll_ms),
            ("max_open_ms", self.max_open_ms),
            ("default_silence_ms", self.default_silence_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            } else if value > MAX_INTERVAL_MS {
                errors.push(format!(
                    "{name} {value} exceeds the timer limit of {MAX_INTERVAL_MS} ms"
                ));
            }
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<u8> = HashSet::new();

        if self.valves.is_empty() {
            errors.push("at least one valve is required".into());
        } else if self.valves.len() > MAX_VALVES {
            errors.push(format!(
                "{} valves configured, at most {MAX_VALVES} supported",
                self.valves.len()
            ));
        }

        let mut check = |ctx: String, pin: u8| {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{ctx}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("{ctx}: pin {pin} is already in use"));
            }
        };

        check("rs485_control_pin".into(), self.rs485_control_pin);
        for (i, v) in self.valves.iter().enumerate() {
            check(format!("valve {}", i + 1), v.pin);
        }
        check("buzzer_pin".into(), self.buzzer_pin);

        if self.leak_adc_channel > MAX_ADC_CHANNEL {
            errors.push(format!(
                "leak_adc_channel {} out of range (0-{MAX_ADC_CHANNEL})",
                self.leak_adc_channel
            ));
        }
    }

    /// Valve pins in channel order.
    pub fn valve_pins(&self) -> Vec<u8> {
        self.valves.iter().map(|v| v.pin).collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &Path) -> Result<NodeSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings: {}", path.display()))?;
    let settings: NodeSettings = toml::from_str(&contents)
        .with_context(|| format!("failed to parse settings: {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {}", path.display()))?;
    Ok(settings)
}

/// Like [`load`], but a missing file yields the compiled-in defaults.
pub fn load_or_default(path: &Path) -> Result<NodeSettings> {
    if path.exists() {
        return load(path);
    }
    tracing::info!(path = %path.display(), "no settings file, using built-in defaults");
    let settings = NodeSettings::default();
    settings.validate().context("built-in settings are invalid")?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
