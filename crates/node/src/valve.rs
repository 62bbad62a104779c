//! Sprinkler valve channels.
//!
//! [`ValveBank`] owns the logical state of every channel (open/closed,
//! when it opened, how long it should stay open) and drives a
//! [`ValveOutput`] on each transition.  Several valves may be open at once;
//! if the plumbing cannot supply them all, that policy lives on the host.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::bus::ValveId;
use crate::clock::{Millis, MAX_INTERVAL_MS};
use crate::config::MAX_VALVES;
use crate::error::ValveError;

// ---------------------------------------------------------------------------
// Output port
// ---------------------------------------------------------------------------

/// Relay/solenoid driver, addressed by GPIO pin.
pub trait ValveOutput {
    fn set(&mut self, pin: u8, open: bool);
}

/// Development valve output (no hardware, logs state changes).
#[derive(Default)]
pub struct MockValveOutput {
    pub pins: HashMap<u8, bool>,
}

impl ValveOutput for MockValveOutput {
    fn set(&mut self, pin: u8, open: bool) {
        self.pins.insert(pin, open);
        debug!(pin, "[mock-gpio] valve set {}", if open { "OPEN" } else { "CLOSED" });
    }
}

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveStatus {
    Closed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveChannel {
    pin: u8,
    status: ValveStatus,
    time_opened: Millis,
    /// Requested open time; 0 holds the valve open until an explicit close.
    open_millis_desired: u32,
}

impl ValveChannel {
    fn new(pin: u8) -> Self {
        Self {
            pin,
            status: ValveStatus::Closed,
            time_opened: Millis(0),
            open_millis_desired: 0,
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn status(&self) -> ValveStatus {
        self.status
    }

    pub fn time_opened(&self) -> Millis {
        self.time_opened
    }

    pub fn open_millis_desired(&self) -> u32 {
        self.open_millis_desired
    }

    /// Time left on a timed run; `None` when closed or held open.
    pub fn remaining_ms(&self, now: Millis) -> Option<u32> {
        if self.status != ValveStatus::Open || self.open_millis_desired == 0 {
            return None;
        }
        Some(
            self.open_millis_desired
                .saturating_sub(now.since(self.time_opened)),
        )
    }

    fn is_expired(&self, now: Millis) -> bool {
        self.status == ValveStatus::Open
            && self.open_millis_desired > 0
            && now.has_elapsed(self.time_opened, self.open_millis_desired)
    }
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

pub struct ValveBank {
    channels: heapless::Vec<ValveChannel, MAX_VALVES>,
    output: Box<dyn ValveOutput>,
    max_open_ms: u32,
}

impl ValveBank {
    /// Build one channel per pin and drive every output closed.  Pins past
    /// [`MAX_VALVES`] are ignored; settings validation rejects such
    /// configurations before we get here.
    pub fn new(pins: &[u8], output: Box<dyn ValveOutput>, max_open_ms: u32) -> Self {
        let channels = pins
            .iter()
            .take(MAX_VALVES)
            .map(|&pin| ValveChannel::new(pin))
            .collect();
        let mut bank = Self {
            channels,
            output,
            max_open_ms: max_open_ms.min(MAX_INTERVAL_MS),
        };
        bank.all_off();
        bank
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&self, id: ValveId) -> Result<&ValveChannel, ValveError> {
        id.index()
            .and_then(|i| self.channels.get(i))
            .ok_or(ValveError::UnknownValve(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValveId, &ValveChannel)> {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (ValveId::from_index(i), ch))
    }

    /// Open `id` for `duration_ms` (0 = until closed).  Re-opening an open
    /// valve restarts its timer with the new duration.
    pub fn open(&mut self, id: ValveId, duration_ms: i64, now: Millis) -> Result<(), ValveError> {
        let duration = u32::try_from(duration_ms)
            .ok()
            .filter(|d| *d <= self.max_open_ms)
            .ok_or(ValveError::InvalidDuration(duration_ms))?;
        let ch = self.channel_mut(id)?;

        ch.status = ValveStatus::Open;
        ch.time_opened = now;
        ch.open_millis_desired = duration;
        let pin = ch.pin;
        self.output.set(pin, true);

        info!(valve = %id, pin, duration_ms = duration, "valve opened");
        Ok(())
    }

    /// Close `id`.  Closing a closed valve changes nothing.
    pub fn close(&mut self, id: ValveId) -> Result<(), ValveError> {
        let ch = self.channel_mut(id)?;
        if ch.status == ValveStatus::Closed {
            return Ok(());
        }
        ch.status = ValveStatus::Closed;
        let pin = ch.pin;
        self.output.set(pin, false);

        info!(valve = %id, pin, "valve closed");
        Ok(())
    }

    /// Close every timed valve whose run has elapsed.  Returns how many
    /// were closed this tick.
    pub fn tick(&mut self, now: Millis) -> usize {
        let mut closed = 0;
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if ch.is_expired(now) {
                ch.status = ValveStatus::Closed;
                self.output.set(ch.pin, false);
                info!(
                    valve = %ValveId::from_index(i),
                    pin = ch.pin,
                    ran_ms = now.since(ch.time_opened),
                    "valve run complete, auto-closed"
                );
                closed += 1;
            }
        }
        closed
    }

    /// Drive every output closed (boot and shutdown).
    pub fn all_off(&mut self) {
        for ch in self.channels.iter_mut() {
            ch.status = ValveStatus::Closed;
            self.output.set(ch.pin, false);
        }
    }

    fn channel_mut(&mut self, id: ValveId) -> Result<&mut ValveChannel, ValveError> {
        id.index()
            .and_then(|i| self.channels.get_mut(i))
            .ok_or(ValveError::UnknownValve(id))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
