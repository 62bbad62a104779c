//! Sensor polling.
//!
//! Each sensor is wrapped in a [`Poller`] that decides when a read is due,
//! keeps the last good value across failed attempts, and counts failure
//! streaks.  A failed read is retried at the next scheduled poll, never
//! immediately, so one dead sensor cannot eat the rest of the cycle.
//!
//! ```text
//! Idle ──[interval elapsed]──▶ Attempting ──▶ Success ─┐
//!  ▲                                      └──▶ Failure ─┤
//!  └────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Millis;
use crate::error::SensorError;

// ---------------------------------------------------------------------------
// Sensor ports
// ---------------------------------------------------------------------------

/// Combined temperature/humidity reading (DHT11 resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClimateReading {
    pub temperature_c: i16,
    pub humidity_pct: u8,
}

/// A temperature/humidity source.  `read` must return promptly; a sensor
/// that needs time to convert reports `Timeout` and is retried later.
pub trait ClimateSensor {
    fn read(&mut self) -> Result<ClimateReading, SensorError>;
}

/// A raw leak-probe source (ADC counts; higher means wetter).
pub trait LeakSensor {
    fn read(&mut self) -> Result<u16, SensorError>;
}

// ---------------------------------------------------------------------------
// Polling state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Interval has not elapsed; nothing was attempted.
    NotDue,
    Updated,
    Failed,
}

/// Poll bookkeeping for one sensor.
#[derive(Debug, Clone)]
pub struct Poller<T> {
    name: &'static str,
    interval_ms: u32,
    /// `None` until the first attempt, which is therefore always due.
    last_attempt: Option<Millis>,
    last_success: Option<Millis>,
    value: Option<T>,
    consecutive_failures: u32,
}

impl<T: Copy> Poller<T> {
    pub fn new(name: &'static str, interval_ms: u32) -> Self {
        Self {
            name,
            interval_ms,
            last_attempt: None,
            last_success: None,
            value: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_due(&self, now: Millis) -> bool {
        match self.last_attempt {
            None => true,
            Some(t) => now.has_elapsed(t, self.interval_ms),
        }
    }

    /// Attempt a read through `read` if one is due.
    pub fn poll_with<F>(&mut self, now: Millis, read: F) -> PollOutcome
    where
        F: FnOnce() -> Result<T, SensorError>,
    {
        if !self.is_due(now) {
            return PollOutcome::NotDue;
        }
        self.last_attempt = Some(now);

        match read() {
            Ok(value) => {
                if self.consecutive_failures > 0 {
                    info!(
                        sensor = self.name,
                        failures = self.consecutive_failures,
                        "sensor recovered"
                    );
                }
                self.value = Some(value);
                self.last_success = Some(now);
                self.consecutive_failures = 0;
                PollOutcome::Updated
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures == 1 {
                    warn!(sensor = self.name, "read failed, keeping last value: {e}");
                } else {
                    debug!(
                        sensor = self.name,
                        failures = self.consecutive_failures,
                        "read failed again: {e}"
                    );
                }
                PollOutcome::Failed
            }
        }
    }

    /// Last good value; `None` only if no read has ever succeeded.
    pub fn value(&self) -> Option<T> {
        self.value
    }

    pub fn last_attempt(&self) -> Option<Millis> {
        self.last_attempt
    }

    pub fn last_success(&self) -> Option<Millis> {
        self.last_success
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

// ---------------------------------------------------------------------------
// Climate driver
// ---------------------------------------------------------------------------

pub struct ClimateDriver {
    sensor: Box<dyn ClimateSensor>,
    poller: Poller<ClimateReading>,
}

impl ClimateDriver {
    pub fn new(sensor: Box<dyn ClimateSensor>, interval_ms: u32) -> Self {
        Self {
            sensor,
            poller: Poller::new("climate", interval_ms),
        }
    }

    pub fn tick(&mut self, now: Millis) -> PollOutcome {
        let sensor = &mut self.sensor;
        let outcome = self.poller.poll_with(now, || sensor.read());
        if outcome == PollOutcome::Updated {
            if let Some(r) = self.poller.value() {
                debug!(
                    temperature_c = r.temperature_c,
                    humidity_pct = r.humidity_pct,
                    "climate reading"
                );
            }
        }
        outcome
    }

    pub fn poller(&self) -> &Poller<ClimateReading> {
        &self.poller
    }
}

// ===========================================================================
// Tests
// ===========================================================================
