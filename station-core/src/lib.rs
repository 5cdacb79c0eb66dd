//! Station Core - Hardware-independent logic for the solar weather station
//!
//! Everything the station does between waking up and going back to deep sleep
//! lives here: the persistent config store, the firmware updater, clock sync,
//! sensor polling, the telemetry queue and the wake cycle that drives them.
//! Hardware is reached only through the traits in each module, so the whole
//! crate runs and tests on the host (see [`sim`]).

pub mod clock;
pub mod config;
pub mod network;
pub mod operator;
pub mod ota;
pub mod power;
pub mod scheduler;
pub mod sensors;
pub mod settings;
pub mod sim;
pub mod telemetry;

#[cfg(test)]
mod tests;

pub use config::{BlobStore, ConfigError, ConfigStore, ConfigValue};
pub use ota::{FwUpdater, OtaError, UpdateState};
pub use scheduler::{CycleReport, NextAction, RetentionState, Station};
pub use settings::Settings;
