//! Leak detection and the audible alarm.
//!
//! The alarm latches the first time a successful probe reading reaches the
//! configured threshold and stays set until the host clears it, so a
//! borderline reading cannot make it flicker.  Silencing only mutes the
//! buzzer for a while; the alarm itself stays latched and the buzzer comes
//! back when the silence runs out.
//!
//! The buzzer has no state of its own: every tick it is driven to
//! `alarm && !silenced`.

use tracing::{debug, info, warn};

use crate::clock::Millis;
use crate::sensors::{LeakSensor, PollOutcome, Poller};

// ---------------------------------------------------------------------------
// Buzzer port
// ---------------------------------------------------------------------------

pub trait BuzzerOutput {
    fn set(&mut self, on: bool);
}

/// Development buzzer (no hardware, logs edges).
#[derive(Default)]
pub struct MockBuzzer {
    pub on: bool,
}

impl BuzzerOutput for MockBuzzer {
    fn set(&mut self, on: bool) {
        if on != self.on {
            debug!("[mock-gpio] buzzer {}", if on { "ON" } else { "OFF" });
        }
        self.on = on;
    }
}

// ---------------------------------------------------------------------------
// Alarm latch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakAlarm {
    alarm: bool,
    silence_alarm: bool,
    /// When the current silence started.
    last_buzzer_enabled: Millis,
    silence_ms: u32,
}

impl LeakAlarm {
    /// Feed a fresh probe reading.  Returns true when this reading latched
    /// the alarm.
    pub fn observe(&mut self, value: u16, threshold: u16) -> bool {
        if self.alarm || value < threshold {
            return false;
        }
        self.alarm = true;
        true
    }

    /// Clear the latch and any pending silence.
    pub fn clear(&mut self) {
        self.alarm = false;
        self.silence_alarm = false;
    }

    /// Mute the buzzer for `duration_ms` starting at `now`.  Allowed even
    /// with no alarm active; it simply runs out.
    pub fn silence(&mut self, now: Millis, duration_ms: u32) {
        self.silence_alarm = true;
        self.last_buzzer_enabled = now;
        self.silence_ms = duration_ms;
    }

    /// Expire the silence once its time is up.  Returns true when the
    /// silence ended on this tick.
    pub fn tick(&mut self, now: Millis) -> bool {
        if self.silence_alarm && now.has_elapsed(self.last_buzzer_enabled, self.silence_ms) {
            self.silence_alarm = false;
            return true;
        }
        false
    }

    pub fn alarm(&self) -> bool {
        self.alarm
    }

    pub fn silenced(&self) -> bool {
        self.silence_alarm
    }

    pub fn buzzer_on(&self) -> bool {
        self.alarm && !self.silence_alarm
    }
}

// ---------------------------------------------------------------------------
// Monitor: probe + latch + buzzer
// ---------------------------------------------------------------------------

pub struct LeakMonitor {
    sensor: Box<dyn LeakSensor>,
    buzzer: Box<dyn BuzzerOutput>,
    poller: Poller<u16>,
    alarm: LeakAlarm,
}

impl LeakMonitor {
    pub fn new(
        sensor: Box<dyn LeakSensor>,
        mut buzzer: Box<dyn BuzzerOutput>,
        interval_ms: u32,
    ) -> Self {
        buzzer.set(false);
        Self {
            sensor,
            buzzer,
            poller: Poller::new("leak", interval_ms),
            alarm: LeakAlarm::default(),
        }
    }

    /// Poll the probe if due, evaluate the latch, expire any silence and
    /// drive the buzzer.
    pub fn tick(&mut self, now: Millis, threshold: u16) -> PollOutcome {
        let sensor = &mut self.sensor;
        let outcome = self.poller.poll_with(now, || sensor.read());

        if outcome == PollOutcome::Updated {
            if let Some(value) = self.poller.value() {
                if self.alarm.observe(value, threshold) {
                    warn!(value, threshold, "LEAK DETECTED, alarm latched");
                }
            }
        }

        if self.alarm.tick(now) && self.alarm.alarm() {
            info!("alarm silence expired, buzzer resumes");
        }

        self.buzzer.set(self.alarm.buzzer_on());
        outcome
    }

    pub fn clear_alarm(&mut self) {
        if self.alarm.alarm() {
            info!("leak alarm cleared");
        }
        self.alarm.clear();
        self.buzzer.set(self.alarm.buzzer_on());
    }

    pub fn silence(&mut self, now: Millis, duration_ms: u32) {
        info!(duration_ms, alarm = self.alarm.alarm(), "alarm silenced");
        self.alarm.silence(now, duration_ms);
        self.buzzer.set(self.alarm.buzzer_on());
    }

    /// Drive the buzzer off without touching the latch (shutdown).
    pub fn mute_output(&mut self) {
        self.buzzer.set(false);
    }

    pub fn alarm(&self) -> &LeakAlarm {
        &self.alarm
    }

    pub fn poller(&self) -> &Poller<u16> {
        &self.poller
    }
}

// ===========================================================================
// Tests
// ===========================================================================
