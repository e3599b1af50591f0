//! Keep Bluetooth Low Energy links to a van's power system alive and read its telemetry
//!
//! Tested with a Renogy DCC50S DC-DC/MPPT charger behind a BT-2 bridge and two SOK 206ah
//! 12v batteries with the built-in Bluetooth BMS.
//!
//! All devices share one radio, so only one connect or command/response exchange is in
//! flight at a time. A periodic health check reconnects devices that dropped out or went
//! quiet, and backs off from devices that cannot be found.
//!
//! Currently the following data can be accessed:
//!
//! - Charger: aux battery SOC and voltage, alternator and solar voltage and current,
//!   amp-hours today, controller and battery temperature, charging state, settings
//! - Batteries: state of charge (%), voltage (v), current (a), remaining capacity (Ah),
//!   cycles (count), temperatures, MOSFET, heater and protection flags
//!
//! # Example
//!
//! ```rust,no_run
//! use van_power_ble::{ConnectionManager, DeviceConfig, Radio, Timing};
//!
//! fn run<R: Radio>(radio: R, millis: impl Fn() -> u64) -> anyhow::Result<()> {
//!     let mut manager = ConnectionManager::new(radio, Timing::default());
//!     for device in DeviceConfig::defaults() {
//!         manager.register(&device)?;
//!     }
//!     manager.turn_on(millis());
//!     loop {
//!         manager.poll(millis());
//!         if let Some(battery) = manager.device(1).and_then(|device| device.as_sok()) {
//!             println!("{}% {:.2}v", battery.soc(), battery.volts());
//!         }
//!     }
//! }
//! ```

mod accumulator;
pub mod checksum;
mod config;
pub mod device;
mod manager;
pub mod radio;
pub mod register_table;
mod semaphore;

#[cfg(feature = "bluest")]
mod bluest_radio;
#[cfg(test)]
mod test_radio;

pub use accumulator::{Accumulator, Overflow};
#[cfg(feature = "bluest")]
pub use bluest_radio::BluestRadio;
pub use config::{DeviceConfig, DeviceFamily, Timing};
pub use device::{Device, RenogyController, SokBattery};
pub use manager::{ConnectionManager, LinkSummary, RetryState, MAX_DEVICES};
pub use radio::{Radio, RadioEvent};
pub use register_table::EngineeringValue;
pub use semaphore::{Semaphore, SemaphoreState};
