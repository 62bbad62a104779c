//! JSON status snapshot returned by the `status` bus command.

use serde::Serialize;

use crate::bus::{BusStats, ValveId};
use crate::sensors::ClimateReading;
use crate::store::Configuration;
use crate::valve::ValveStatus;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub address: String,
    /// Wraps after ~49 days, like every other timestamp on the node.
    pub uptime_ms: u32,
    pub config: Configuration,
    pub climate: SensorStatus<ClimateReading>,
    pub leak: SensorStatus<u16>,
    pub alarm: AlarmStatus,
    pub valves: Vec<ValveSnapshot>,
    pub bus: BusStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus<T> {
    /// Last good value; `null` if none yet.
    pub value: Option<T>,
    /// Milliseconds since the last good value.
    pub age_ms: Option<u32>,
    pub failures: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AlarmStatus {
    pub latched: bool,
    pub silenced: bool,
    pub buzzer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValveSnapshot {
    pub id: ValveId,
    pub pin: u8,
    pub status: ValveStatus,
    /// `null` when closed or held open indefinitely.
    pub remaining_ms: Option<u32>,
}
