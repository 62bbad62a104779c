//! Irrigation node firmware: valve relays, a leak alarm and a climate
//! sensor, commanded by a host over an addressed RS-485 line.

pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod leak;
pub mod node;
pub mod sensors;
pub mod status;
pub mod store;
pub mod valve;

#[cfg(feature = "hw")]
pub mod hw;
#[cfg(feature = "sim")]
pub mod sim;
