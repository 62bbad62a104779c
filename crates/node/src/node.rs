//! The control loop.
//!
//! [`Node`] owns every piece of node state and advances it one cycle at a
//! time.  Each cycle runs in a fixed order against a single timestamp:
//!
//! 1. climate poll (if due)
//! 2. leak poll, alarm latch, silence expiry, buzzer drive
//! 3. timed valve expiry
//! 4. bus: read a bounded amount, dispatch at most one command, queue the
//!    response
//!
//! Nothing in a cycle blocks; a slow sensor reports a failure and is retried
//! on its next interval.

use tracing::{debug, info, warn};

use crate::bus::{BusAdapter, Command, NakReason, Response, SensorId, Transport};
use crate::clock::{Clock, Millis, MAX_INTERVAL_MS};
use crate::config::NodeSettings;
use crate::error::SetParamError;
use crate::leak::{BuzzerOutput, LeakMonitor};
use crate::sensors::{ClimateDriver, ClimateSensor, LeakSensor, PollOutcome, Poller};
use crate::status::{AlarmStatus, SensorStatus, StatusSnapshot, ValveSnapshot};
use crate::store::{ConfigStorage, ConfigStore, Configuration, ParamId};
use crate::valve::{ValveBank, ValveOutput};

/// Hardware (or simulated) devices the node drives.
pub struct Peripherals {
    pub climate: Box<dyn ClimateSensor>,
    pub leak: Box<dyn LeakSensor>,
    pub valves: Box<dyn ValveOutput>,
    pub buzzer: Box<dyn BuzzerOutput>,
}

/// What happened during one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub climate: PollOutcome,
    pub leak: PollOutcome,
    pub valves_closed: usize,
    pub command: Option<Command>,
}

pub struct Node<C: Clock, T: Transport, S: ConfigStorage> {
    clock: C,
    booted_at: Millis,
    default_silence_ms: u32,
    store: ConfigStore<S>,
    climate: ClimateDriver,
    leak: LeakMonitor,
    valves: ValveBank,
    bus: BusAdapter<T>,
}

impl<C: Clock, T: Transport, S: ConfigStorage> Node<C, T, S> {
    /// Assemble the node.  Every valve and the buzzer are driven off before
    /// this returns.
    pub fn new(
        settings: &NodeSettings,
        clock: C,
        store: ConfigStore<S>,
        peripherals: Peripherals,
        transport: T,
    ) -> Self {
        let booted_at = clock.now();
        let valves = ValveBank::new(
            &settings.valve_pins(),
            peripherals.valves,
            settings.max_open_ms,
        );
        let leak = LeakMonitor::new(peripherals.leak, peripherals.buzzer, settings.leak_poll_ms);
        let climate = ClimateDriver::new(peripherals.climate, settings.climate_poll_ms);

        info!(
            address = %settings.address,
            valves = valves.len(),
            baud = %store.config().baud_rate,
            leak_threshold = store.config().leak_threshold,
            "node ready"
        );

        Self {
            clock,
            booted_at,
            default_silence_ms: settings.default_silence_ms,
            store,
            climate,
            leak,
            valves,
            bus: BusAdapter::new(settings.address.clone(), transport),
        }
    }

    /// Run one pass of the control loop.
    pub fn run_cycle(&mut self) -> CycleReport {
        let now = self.clock.now();

        let climate = self.climate.tick(now);
        let leak = self.leak.tick(now, self.store.config().leak_threshold);
        let valves_closed = self.valves.tick(now);

        let command = self.bus.poll();
        if let Some(cmd) = &command {
            let response = self.dispatch(cmd, now);
            debug!(verb = cmd.verb(), reply = %response.body(), "command handled");
            self.bus.respond(&response);
        }

        CycleReport {
            climate,
            leak,
            valves_closed,
            command,
        }
    }

    fn dispatch(&mut self, cmd: &Command, now: Millis) -> Response {
        let verb = cmd.verb();
        match *cmd {
            Command::ReadSensor(sensor) => Response::Reading {
                sensor,
                value: self.sensor_value(sensor),
            },

            Command::ReadValve(valve) => match self.valves.channel(valve) {
                Ok(ch) => Response::Valve {
                    valve,
                    status: ch.status(),
                    remaining_ms: ch.remaining_ms(now),
                },
                Err(e) => Response::Nak {
                    verb,
                    reason: NakReason::from(&e),
                },
            },

            Command::Status => Response::Status(Box::new(self.status_at(now))),

            Command::OpenValve { valve, duration_ms } => {
                match self.valves.open(valve, duration_ms, now) {
                    Ok(()) => Response::Ack {
                        verb,
                        target: Some(valve.to_string()),
                    },
                    Err(e) => {
                        debug!("open rejected: {e}");
                        Response::Nak {
                            verb,
                            reason: NakReason::from(&e),
                        }
                    }
                }
            }

            Command::CloseValve(valve) => match self.valves.close(valve) {
                Ok(()) => Response::Ack {
                    verb,
                    target: Some(valve.to_string()),
                },
                Err(e) => Response::Nak {
                    verb,
                    reason: NakReason::from(&e),
                },
            },

            Command::SetParam { param, value } => self.set_param(param, value),

            Command::ClearAlarm => {
                self.leak.clear_alarm();
                Response::Ack { verb, target: None }
            }

            Command::SilenceAlarm { duration_ms } => {
                match u32::try_from(duration_ms) {
                    Ok(ms) if ms <= MAX_INTERVAL_MS => {
                        let ms = if ms == 0 { self.default_silence_ms } else { ms };
                        self.leak.silence(now, ms);
                        Response::Ack { verb, target: None }
                    }
                    _ => Response::Nak {
                        verb,
                        reason: NakReason::InvalidDuration,
                    },
                }
            }
        }
    }

    fn set_param(&mut self, param: ParamId, value: i64) -> Response {
        let verb = "set";
        match self.store.set(param, value) {
            Ok(()) => {
                if param == ParamId::BaudRate {
                    info!("new baud rate takes effect at next start");
                }
                Response::Ack {
                    verb,
                    target: Some(param.as_str().to_string()),
                }
            }
            Err(SetParamError::Invalid(e)) => {
                debug!("set rejected: {e}");
                Response::Nak {
                    verb,
                    reason: NakReason::InvalidValue,
                }
            }
            Err(SetParamError::Storage(e)) => {
                warn!(param = param.as_str(), "parameter not persisted: {e}");
                Response::Nak {
                    verb,
                    reason: NakReason::Storage,
                }
            }
        }
    }

    fn sensor_value(&self, sensor: SensorId) -> Option<i32> {
        match sensor {
            SensorId::Temperature => self
                .climate
                .poller()
                .value()
                .map(|r| i32::from(r.temperature_c)),
            SensorId::Humidity => self
                .climate
                .poller()
                .value()
                .map(|r| i32::from(r.humidity_pct)),
            SensorId::Leak => self.leak.poller().value().map(i32::from),
        }
    }

    /// Close every valve and silence the buzzer.  Called on the way out.
    pub fn shutdown(&mut self) {
        self.valves.all_off();
        self.leak.mute_output();
        info!("outputs off, node stopped");
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status_at(self.clock.now())
    }

    fn status_at(&self, now: Millis) -> StatusSnapshot {
        let alarm = self.leak.alarm();
        StatusSnapshot {
            address: self.bus.address().to_string(),
            uptime_ms: now.since(self.booted_at),
            config: *self.store.config(),
            climate: sensor_status(self.climate.poller(), now),
            leak: sensor_status(self.leak.poller(), now),
            alarm: AlarmStatus {
                latched: alarm.alarm(),
                silenced: alarm.silenced(),
                buzzer: alarm.buzzer_on(),
            },
            valves: self
                .valves
                .iter()
                .map(|(id, ch)| ValveSnapshot {
                    id,
                    pin: ch.pin(),
                    status: ch.status(),
                    remaining_ms: ch.remaining_ms(now),
                })
                .collect(),
            bus: self.bus.stats(),
        }
    }

    pub fn config(&self) -> &Configuration {
        self.store.config()
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn valves(&self) -> &ValveBank {
        &self.valves
    }

    pub fn leak(&self) -> &LeakMonitor {
        &self.leak
    }

    pub fn climate(&self) -> &ClimateDriver {
        &self.climate
    }

    pub fn bus(&self) -> &BusAdapter<T> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusAdapter<T> {
        &mut self.bus
    }
}

fn sensor_status<T: Copy>(poller: &Poller<T>, now: Millis) -> SensorStatus<T> {
    SensorStatus {
        value: poller.value(),
        age_ms: poller.last_success().map(|t| now.since(t)),
        failures: poller.consecutive_failures(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
