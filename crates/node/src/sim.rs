//! Simulated peripherals for running a node without hardware.
//!
//! Models enough sensor behaviour to exercise the control loop:
//! - Climate drifts as a mean-reverting random walk with ADC-style noise
//! - The leak probe idles near a dry baseline or ramps up as water spreads
//! - The flaky scenario drops reads and throws spikes
//!
//! The console transport stands in for the RS-485 line: each stdin line
//! becomes one request frame and every response is printed to stdout.

use std::collections::VecDeque;
use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::debug;

use crate::bus::{encode_frame, Direction, Transport};
use crate::error::{SensorError, TransportError};
use crate::sensors::{ClimateReading, ClimateSensor, LeakSensor};

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profile selected with the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Steady climate, probe stays well under any sane threshold.
    Dry,
    /// Like dry, but reads time out ~15% of the time and the probe
    /// occasionally spikes.  Exercises last-good-value retention.
    Flaky,
    /// The probe starts dry and climbs steadily until it saturates, so the
    /// leak alarm latches a few minutes into the run.
    Leaking,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "flaky" => Self::Flaky,
            "leaking" | "leak" => Self::Leaking,
            _ => Self::Dry,
        }
    }

    fn failure_prob(self) -> f32 {
        match self {
            Self::Flaky => 0.15,
            Self::Dry | Self::Leaking => 0.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dry => write!(f, "dry"),
            Self::Flaky => write!(f, "flaky"),
            Self::Leaking => write!(f, "leaking"),
        }
    }
}

// ---------------------------------------------------------------------------
// Climate
// ---------------------------------------------------------------------------

/// DHT11-like source: whole degrees and whole percent.
pub struct SimClimate {
    temperature: f64,
    humidity: f64,
    failure_prob: f32,
}

impl SimClimate {
    const TEMP_CENTER: f64 = 22.0;
    const HUMIDITY_CENTER: f64 = 45.0;
    const REVERSION: f64 = 0.1;

    pub fn new(scenario: Scenario) -> Self {
        Self {
            temperature: gaussian(Self::TEMP_CENTER, 2.0),
            humidity: gaussian(Self::HUMIDITY_CENTER, 5.0),
            failure_prob: scenario.failure_prob(),
        }
    }
}

impl ClimateSensor for SimClimate {
    fn read(&mut self) -> Result<ClimateReading, SensorError> {
        self.temperature += Self::REVERSION * (Self::TEMP_CENTER - self.temperature)
            + gaussian(0.0, 0.3);
        self.humidity += Self::REVERSION * (Self::HUMIDITY_CENTER - self.humidity)
            + gaussian(0.0, 1.0);
        self.temperature = self.temperature.clamp(0.0, 50.0);
        self.humidity = self.humidity.clamp(20.0, 90.0);

        if fastrand::f32() < self.failure_prob {
            return Err(if fastrand::bool() {
                SensorError::Timeout
            } else {
                SensorError::Corrupt
            });
        }

        Ok(ClimateReading {
            temperature_c: self.temperature.round() as i16,
            humidity_pct: self.humidity.round() as u8,
        })
    }
}

// ---------------------------------------------------------------------------
// Leak probe
// ---------------------------------------------------------------------------

/// ADS1115-like probe in counts (0..=32767, higher is wetter).
pub struct SimLeak {
    scenario: Scenario,
    /// Current "true" wetness in ADC counts.
    level: f64,
    noise_sigma: f64,
    /// Added to `level` on every read in the leaking scenario.
    rise_per_read: f64,
    spike_prob: f32,
}

impl SimLeak {
    const DRY_LEVEL: f64 = 60.0;
    const SATURATED: f64 = 24_000.0;

    pub fn new(scenario: Scenario) -> Self {
        let (noise_sigma, rise_per_read, spike_prob) = match scenario {
            Scenario::Dry => (8.0, 0.0, 0.0),
            Scenario::Flaky => (25.0, 0.0, 0.05_f32),
            Scenario::Leaking => (15.0, 4.0, 0.0),
        };
        Self {
            scenario,
            level: Self::DRY_LEVEL,
            noise_sigma,
            rise_per_read,
            spike_prob,
        }
    }
}

impl LeakSensor for SimLeak {
    fn read(&mut self) -> Result<u16, SensorError> {
        self.level = (self.level + self.rise_per_read).min(Self::SATURATED);

        if fastrand::f32() < self.scenario.failure_prob() {
            return Err(SensorError::Timeout);
        }

        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, 200.0).abs()
        } else {
            0.0
        };
        let reading = self.level + gaussian(0.0, self.noise_sigma) + spike;
        Ok(reading.round().clamp(0.0, 32767.0) as u16)
    }
}

// ---------------------------------------------------------------------------
// Console transport
// ---------------------------------------------------------------------------

/// Turn one line typed at the console into a request frame.  A line that
/// already starts with `>` is passed through untouched so raw frames
/// (including deliberately broken ones) can be injected.
pub fn frame_console_line(line: &str) -> Option<Vec<u8>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.starts_with('>') {
        let mut raw = line.as_bytes().to_vec();
        raw.push(b'\n');
        return Some(raw);
    }
    Some(encode_frame(Direction::Request, line))
}

/// stdin/stdout stand-in for the RS-485 line.  Both directions run in
/// background tasks so the control loop never waits on the terminal.
pub struct ConsoleTransport {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl ConsoleTransport {
    const QUEUE_DEPTH: usize = 16;

    /// Start the reader and writer tasks.  Must be called from within a
    /// Tokio runtime.
    pub fn spawn() -> Self {
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(Self::QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(Self::QUEUE_DEPTH);

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(frame) = frame_console_line(&line) else {
                    continue;
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("console input closed");
        });

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(frame) = out_rx.recv().await {
                if stdout.write_all(&frame).await.is_err() || stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        Self {
            inbound: in_rx,
            outbound: out_tx,
            pending: VecDeque::new(),
        }
    }
}

impl Transport for ConsoleTransport {
    fn read_byte(&mut self) -> Result<Option<u8>, TransportError> {
        if self.pending.is_empty() {
            match self.inbound.try_recv() {
                Ok(frame) => self.pending.extend(frame),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed),
            }
        }
        Ok(self.pending.pop_front())
    }

    fn queue(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.outbound.try_send(frame.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::unwrap_frame;

    #[test]
    fn climate_readings_plausible() {
        let mut sim = SimClimate::new(Scenario::Dry);
        for _ in 0..500 {
            let r = sim.read().unwrap();
            assert!((0..=50).contains(&r.temperature_c), "temperature {r:?}");
            assert!((20..=90).contains(&r.humidity_pct), "humidity {r:?}");
        }
    }

    #[test]
    fn climate_temporal_coherence() {
        let mut sim = SimClimate::new(Scenario::Dry);
        let temps: Vec<i16> = (0..200).map(|_| sim.read().unwrap().temperature_c).collect();
        let max_jump = temps.windows(2).map(|w| (w[1] - w[0]).abs()).max().unwrap();
        assert!(max_jump <= 4, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn dry_probe_stays_under_default_threshold() {
        let mut sim = SimLeak::new(Scenario::Dry);
        for _ in 0..1_000 {
            assert!(sim.read().unwrap() < 400);
        }
    }

    #[test]
    fn leaking_probe_crosses_threshold() {
        let mut sim = SimLeak::new(Scenario::Leaking);
        let crossed = (0..1_000).any(|_| sim.read().unwrap() >= 400);
        assert!(crossed, "leaking scenario should reach 400 counts");
    }

    #[test]
    fn leaking_probe_saturates_in_adc_range() {
        let mut sim = SimLeak::new(Scenario::Leaking);
        for _ in 0..10_000 {
            sim.read().unwrap();
        }
        let v = sim.read().unwrap();
        assert!(v > 20_000 && v <= 32_767, "saturated reading {v}");
    }

    #[test]
    fn flaky_scenario_fails_sometimes() {
        let mut climate = SimClimate::new(Scenario::Flaky);
        let mut leak = SimLeak::new(Scenario::Flaky);
        let climate_failures = (0..500).filter(|_| climate.read().is_err()).count();
        let leak_failures = (0..500).filter(|_| leak.read().is_err()).count();
        // Expected ~75 each; far from both 0 and 500.
        assert!((10..250).contains(&climate_failures), "{climate_failures}");
        assert!((10..250).contains(&leak_failures), "{leak_failures}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("dry"), Scenario::Dry);
        assert_eq!(Scenario::from_str_lossy("FLAKY"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("Leaking"), Scenario::Leaking);
        assert_eq!(Scenario::from_str_lossy("leak"), Scenario::Leaking);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Dry);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Dry);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Dry.to_string(), "dry");
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
        assert_eq!(Scenario::Leaking.to_string(), "leaking");
    }

    #[test]
    fn console_line_is_framed() {
        let frame = frame_console_line("  Sprinkler1 status \n").unwrap();
        let (dir, payload) = unwrap_frame(frame.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(dir, Direction::Request);
        assert_eq!(payload, "Sprinkler1 status");
    }

    #[test]
    fn console_raw_frame_passes_through() {
        let frame = frame_console_line(">Sprinkler1 status*0000").unwrap();
        assert_eq!(frame, b">Sprinkler1 status*0000\n");
    }

    #[test]
    fn console_blank_line_ignored() {
        assert_eq!(frame_console_line("   "), None);
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
